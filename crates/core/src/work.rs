//! Work item model and derived status.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::id::WorkId;

/// Lifecycle status of a work item.
///
/// Never stored. Always derived from the `started`, `finished`, `success` and
/// `deleted` fields via [`WorkStatus::derive`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkStatus {
    /// Waiting to be allocated.
    New,
    /// Owned by a worker, not finished yet.
    Allocated,
    /// Finished successfully.
    Success,
    /// Finished with a failure.
    Failed,
    /// Soft-deleted.
    Deleted,
}

impl WorkStatus {
    pub const ALL: [WorkStatus; 5] = [
        WorkStatus::New,
        WorkStatus::Allocated,
        WorkStatus::Success,
        WorkStatus::Failed,
        WorkStatus::Deleted,
    ];

    /// Derive the status from field presence.
    ///
    /// Returns `None` only for `finished` without `started` on a non-deleted item,
    /// a combination no write path produces. An unset `success` on a finished item
    /// counts as a failure.
    pub fn derive(
        started: bool,
        finished: bool,
        success: Option<bool>,
        deleted: bool,
    ) -> Option<WorkStatus> {
        if deleted {
            return Some(WorkStatus::Deleted);
        }
        match (started, finished) {
            (false, false) => Some(WorkStatus::New),
            (true, false) => Some(WorkStatus::Allocated),
            (true, true) if success == Some(true) => Some(WorkStatus::Success),
            (true, true) => Some(WorkStatus::Failed),
            (false, true) => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkStatus::New => "NEW",
            WorkStatus::Allocated => "ALLOCATED",
            WorkStatus::Success => "SUCCESS",
            WorkStatus::Failed => "FAILED",
            WorkStatus::Deleted => "DELETED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkStatus::Success | WorkStatus::Failed | WorkStatus::Deleted
        )
    }
}

impl core::fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted unit of asynchronous work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    pub id: WorkId,
    /// Names the adapter that executes this item.
    #[serde(rename = "type")]
    pub work_type: String,
    pub input: JsonValue,
    /// Higher is preferred.
    pub priority: i32,
    /// Not eligible for allocation before this instant.
    pub scheduled: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    pub success: Option<bool>,
    pub result: Option<JsonValue>,
    pub error: Option<JsonValue>,
    /// Remaining retry budget.
    pub retries: u32,
    /// First item of the retry chain; `None` on a first attempt.
    pub original_work_id: Option<WorkId>,
    /// Worker that owns (or owned) the item. Set before allocation, it pins the item.
    pub worker: Option<String>,
    /// Advisory only, never enforced by the director.
    pub timeout: Option<Duration>,
    /// Set on autoscheduled items.
    pub schedule_id: Option<String>,
    pub created: DateTime<Utc>,
    pub deleted: Option<DateTime<Utc>>,
}

impl WorkItem {
    /// Build a fresh NEW item from a submission.
    pub fn from_new(new: NewWork, now: DateTime<Utc>) -> Self {
        Self {
            id: WorkId::new(),
            work_type: new.work_type,
            input: new.input,
            priority: new.priority,
            scheduled: new.scheduled.unwrap_or(now),
            started: None,
            finished: None,
            success: None,
            result: None,
            error: None,
            retries: new.retries,
            original_work_id: new.original_work_id,
            worker: new.worker,
            timeout: new.timeout,
            schedule_id: new.schedule_id,
            created: now,
            deleted: None,
        }
    }

    /// Derived status, `None` for the invalid finished-without-started shape.
    pub fn status(&self) -> Option<WorkStatus> {
        WorkStatus::derive(
            self.started.is_some(),
            self.finished.is_some(),
            self.success,
            self.deleted.is_some(),
        )
    }

    pub fn has_status(&self, status: WorkStatus) -> bool {
        self.status() == Some(status)
    }

    /// Started and not finished, regardless of a soft delete that happened meanwhile.
    pub fn is_in_flight(&self) -> bool {
        self.started.is_some() && self.finished.is_none()
    }

    /// NEW or ALLOCATED.
    pub fn is_pending(&self) -> bool {
        matches!(
            self.status(),
            Some(WorkStatus::New) | Some(WorkStatus::Allocated)
        )
    }

    /// Id of the first attempt in this item's retry chain.
    pub fn chain_root(&self) -> WorkId {
        self.original_work_id.unwrap_or(self.id)
    }

    /// How long the item waited between creation and its scheduled instant.
    pub fn scheduled_delay(&self) -> chrono::Duration {
        self.scheduled - self.created
    }
}

/// Submission for a new work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewWork {
    #[serde(rename = "type")]
    pub work_type: String,
    #[serde(default)]
    pub input: JsonValue,
    #[serde(default)]
    pub priority: i32,
    /// Defaults to "now" at insertion time.
    #[serde(default)]
    pub scheduled: Option<DateTime<Utc>>,
    #[serde(default)]
    pub original_work_id: Option<WorkId>,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub worker: Option<String>,
    #[serde(default)]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub schedule_id: Option<String>,
}

impl NewWork {
    pub fn new(work_type: impl Into<String>, input: JsonValue) -> Self {
        Self {
            work_type: work_type.into(),
            input,
            priority: 0,
            scheduled: None,
            original_work_id: None,
            retries: 0,
            worker: None,
            timeout: None,
            schedule_id: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Schedule the work for a specific instant.
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled = Some(at);
        self
    }

    /// Schedule the work with a delay from now.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.scheduled = Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
        self
    }

    /// Mark this submission as a retry in the chain started by `original`.
    pub fn retry_of(mut self, original: WorkId) -> Self {
        self.original_work_id = Some(original);
        self
    }

    /// Pin the work to one worker.
    pub fn for_worker(mut self, worker: impl Into<String>) -> Self {
        self.worker = Some(worker.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_schedule_id(mut self, schedule_id: impl Into<String>) -> Self {
        self.schedule_id = Some(schedule_id.into());
        self
    }
}
