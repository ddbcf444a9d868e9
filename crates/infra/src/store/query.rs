//! Queue query interface for inspection and admin surfaces.
//!
//! Queries are read-only and paginated by default.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use forgequeue_core::WorkStatus;

use super::r#trait::WorkSelector;

/// Pagination parameters for queue queries.
///
/// Deserialization goes through [`Pagination::new`], so `limit` never exceeds
/// [`Pagination::MAX_LIMIT`] whatever the payload says.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "PaginationParams")]
pub struct Pagination {
    /// Maximum number of items to return.
    pub limit: u32,
    /// Number of items to skip (0-based).
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

impl Pagination {
    pub const MAX_LIMIT: u32 = 1000;

    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(50).min(Self::MAX_LIMIT),
            offset: offset.unwrap_or(0),
        }
    }

    /// Same page with `limit` capped, for values built as struct literals.
    pub fn clamped(self) -> Self {
        Self {
            limit: self.limit.min(Self::MAX_LIMIT),
            offset: self.offset,
        }
    }
}

#[derive(Deserialize)]
struct PaginationParams {
    #[serde(default)]
    limit: Option<u32>,
    #[serde(default)]
    offset: Option<u32>,
}

impl From<PaginationParams> for Pagination {
    fn from(params: PaginationParams) -> Self {
        Pagination::new(params.limit, params.offset)
    }
}

/// Filter criteria for `work_queue` / `count_work`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkQuery {
    /// Derived statuses to include (empty = all).
    #[serde(default)]
    pub status: Vec<WorkStatus>,
    /// Work types to include (empty = all).
    #[serde(default)]
    pub types: Vec<String>,
    #[serde(default)]
    pub schedule_id: Option<String>,
    #[serde(default)]
    pub created_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pagination: Pagination,
}

impl WorkQuery {
    pub fn with_status(mut self, status: impl IntoIterator<Item = WorkStatus>) -> Self {
        self.status = status.into_iter().collect();
        self
    }

    pub fn with_types(mut self, types: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn page(mut self, limit: Option<u32>, offset: Option<u32>) -> Self {
        self.pagination = Pagination::new(limit, offset);
        self
    }

    pub fn selector(&self) -> WorkSelector {
        WorkSelector {
            statuses: self.status.clone(),
            types: (!self.types.is_empty()).then(|| self.types.clone()),
            schedule_id: self.schedule_id.clone(),
            created_after: self.created_after,
            created_before: self.created_before,
            ..WorkSelector::default()
        }
    }
}

/// Per-status counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkStats {
    pub new: u64,
    pub allocated: u64,
    pub success: u64,
    pub failed: u64,
    pub deleted: u64,
}

impl WorkStats {
    pub fn set(&mut self, status: WorkStatus, count: u64) {
        match status {
            WorkStatus::New => self.new = count,
            WorkStatus::Allocated => self.allocated = count,
            WorkStatus::Success => self.success = count,
            WorkStatus::Failed => self.failed = count,
            WorkStatus::Deleted => self.deleted = count,
        }
    }

    pub fn total(&self) -> u64 {
        self.new + self.allocated + self.success + self.failed + self.deleted
    }
}
