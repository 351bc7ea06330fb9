use serde::Serialize;

/// MySQL has no "OFFSET without LIMIT"; the documented idiom is the largest unsigned limit
pub const UNBOUNDED_LIMIT: u64 = u64::MAX;

/// Represents pagination parameters for SQL queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub limit: u64,
    pub offset: u64,
}

impl Pagination {
    /// Create pagination with a 1-indexed page number and per-page count
    pub fn new(page: u64, per_page: u64) -> Self {
        Self {
            limit: per_page,
            offset: page.saturating_sub(1).saturating_mul(per_page),
        }
    }

    /// Create pagination with only limit
    pub fn limit_only(limit: u64) -> Self {
        Self { limit, offset: 0 }
    }

    /// Create pagination with both limit and offset
    pub fn limit_offset(limit: u64, offset: u64) -> Self {
        Self { limit, offset }
    }

    /// Render as ` LIMIT count` or ` LIMIT offset, count`
    pub fn to_sql(&self) -> String {
        if self.offset > 0 {
            format!(" LIMIT {}, {}", self.offset, self.limit)
        } else {
            format!(" LIMIT {}", self.limit)
        }
    }

    /// Calculate total pages given a total count; never less than 1
    pub fn total_pages(&self, total_count: u64) -> u64 {
        last_page(total_count, self.limit)
    }

    /// Get current page number (1-indexed)
    pub fn current_page(&self) -> u64 {
        if self.limit == 0 {
            1
        } else {
            self.offset / self.limit + 1
        }
    }

    pub fn has_next_page(&self, total_count: u64) -> bool {
        self.offset.saturating_add(self.limit) < total_count
    }

    pub fn has_previous_page(&self) -> bool {
        self.offset > 0
    }
}

/// `ceil(total / per_page)`, at least 1
pub fn last_page(total_count: u64, per_page: u64) -> u64 {
    if per_page == 0 {
        return 1;
    }
    total_count.div_ceil(per_page).max(1)
}

/// Clamp a requested page into `[1, last_page]`
pub fn clamp_page(page: u64, total_count: u64, per_page: u64) -> u64 {
    page.clamp(1, last_page(total_count, per_page))
}

/// One page of results with the totals used to compute it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Paginated<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub per_page: u64,
    pub current_page: u64,
    pub last_page: u64,
}

impl<T> Paginated<T> {
    pub fn has_more_pages(&self) -> bool {
        self.current_page < self.last_page
    }
}
