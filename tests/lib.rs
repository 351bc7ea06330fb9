//! Integration tests for Keel Core
//!
//! Pure compiler tests live under `query_builder`; repository, queue, worker and
//! configuration tests each have their own top-level file and share fixtures in `common`.

mod query_builder;
