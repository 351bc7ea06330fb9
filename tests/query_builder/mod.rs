//! Query builder tests: filter compilation, statement shapes and pagination.

pub mod builder;
pub mod conditions;
pub mod pagination;
