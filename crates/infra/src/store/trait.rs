use std::cmp::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;

use forgequeue_core::{WorkId, WorkItem, WorkStatus};

/// Work store operation error.
///
/// These are **infrastructure errors** as opposed to work-level errors (unknown
/// types, handler failures). Missing records are not errors: lookups return `None`.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("work already exists: {0}")]
    AlreadyExists(WorkId),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Which `worker` values a selector accepts.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum WorkerFilter {
    #[default]
    Any,
    /// `worker` is unset.
    Unassigned,
    /// `worker` equals the given id.
    Exactly(String),
    /// `worker` is unset or equals the given id (allocation eligibility).
    UnassignedOr(String),
}

impl WorkerFilter {
    pub fn matches(&self, worker: Option<&str>) -> bool {
        match self {
            WorkerFilter::Any => true,
            WorkerFilter::Unassigned => worker.is_none(),
            WorkerFilter::Exactly(id) => worker == Some(id.as_str()),
            WorkerFilter::UnassignedOr(id) => worker.is_none() || worker == Some(id.as_str()),
        }
    }
}

/// Predicate over work items, evaluated by the store.
///
/// Every criterion is optional; an empty selector matches everything. `types: Some(vec![])`
/// matches nothing, which is what a worker owning no types should see.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkSelector {
    pub ids: Vec<WorkId>,
    /// Derived statuses to accept (empty = any).
    pub statuses: Vec<WorkStatus>,
    /// Only items that are started and not finished, soft deletes included.
    pub in_flight: bool,
    pub types: Option<Vec<String>>,
    pub worker: WorkerFilter,
    /// `scheduled <= scheduled_until`.
    pub scheduled_until: Option<DateTime<Utc>>,
    /// `started < started_before`.
    pub started_before: Option<DateTime<Utc>>,
    /// `created >= created_after`.
    pub created_after: Option<DateTime<Utc>>,
    /// `created < created_before`.
    pub created_before: Option<DateTime<Utc>>,
    pub schedule_id: Option<String>,
}

impl WorkSelector {
    pub fn by_id(id: WorkId) -> Self {
        Self {
            ids: vec![id],
            ..Self::default()
        }
    }

    pub fn with_statuses(mut self, statuses: impl IntoIterator<Item = WorkStatus>) -> Self {
        self.statuses = statuses.into_iter().collect();
        self
    }

    pub fn with_types(mut self, types: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    pub fn in_flight(mut self) -> Self {
        self.in_flight = true;
        self
    }

    pub fn pending() -> Self {
        Self::default().with_statuses([WorkStatus::New, WorkStatus::Allocated])
    }

    pub fn matches(&self, item: &WorkItem) -> bool {
        if !self.ids.is_empty() && !self.ids.contains(&item.id) {
            return false;
        }
        if !self.statuses.is_empty() {
            match item.status() {
                Some(status) if self.statuses.contains(&status) => {}
                _ => return false,
            }
        }
        if self.in_flight && !item.is_in_flight() {
            return false;
        }
        if let Some(types) = &self.types {
            if !types.iter().any(|t| t == &item.work_type) {
                return false;
            }
        }
        if !self.worker.matches(item.worker.as_deref()) {
            return false;
        }
        if let Some(until) = self.scheduled_until {
            if item.scheduled > until {
                return false;
            }
        }
        if let Some(before) = self.started_before {
            match item.started {
                Some(started) if started < before => {}
                _ => return false,
            }
        }
        if let Some(after) = self.created_after {
            if item.created < after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if item.created >= before {
                return false;
            }
        }
        if let Some(schedule_id) = &self.schedule_id {
            if item.schedule_id.as_deref() != Some(schedule_id.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Result ordering for `list`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkSort {
    /// `started desc (unset first), priority desc, original_work_id asc (unset first), created asc`.
    #[default]
    Queue,
    /// `priority desc, created asc`: the order in which items get allocated.
    Allocation,
    /// `scheduled asc, created asc`: soonest due first.
    Scheduled,
}

impl WorkSort {
    pub fn compare(&self, a: &WorkItem, b: &WorkItem) -> Ordering {
        match self {
            WorkSort::Queue => compare_started_desc(a.started, b.started)
                .then_with(|| b.priority.cmp(&a.priority))
                .then_with(|| a.original_work_id.cmp(&b.original_work_id))
                .then_with(|| a.created.cmp(&b.created))
                .then_with(|| a.id.cmp(&b.id)),
            WorkSort::Allocation => b
                .priority
                .cmp(&a.priority)
                .then_with(|| a.created.cmp(&b.created))
                .then_with(|| a.id.cmp(&b.id)),
            WorkSort::Scheduled => a
                .scheduled
                .cmp(&b.scheduled)
                .then_with(|| a.created.cmp(&b.created))
                .then_with(|| a.id.cmp(&b.id)),
        }
    }
}

fn compare_started_desc(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => b.cmp(&a),
    }
}

/// Partial update. `None` fields are left untouched; fields are never unset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkPatch {
    pub scheduled: Option<DateTime<Utc>>,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    pub success: Option<bool>,
    pub result: Option<JsonValue>,
    pub error: Option<JsonValue>,
    pub worker: Option<String>,
    pub deleted: Option<DateTime<Utc>>,
}

impl WorkPatch {
    pub fn apply(self, item: &mut WorkItem) {
        if let Some(v) = self.scheduled {
            item.scheduled = v;
        }
        if let Some(v) = self.started {
            item.started = Some(v);
        }
        if let Some(v) = self.finished {
            item.finished = Some(v);
        }
        if let Some(v) = self.success {
            item.success = Some(v);
        }
        if let Some(v) = self.result {
            item.result = Some(v);
        }
        if let Some(v) = self.error {
            item.error = Some(v);
        }
        if let Some(v) = self.worker {
            item.worker = Some(v);
        }
        if let Some(v) = self.deleted {
            item.deleted = Some(v);
        }
    }
}

/// Fields written by the allocation primitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub started: DateTime<Utc>,
    pub worker: String,
}

/// Persistence boundary for work items.
///
/// ## Correctness contract
///
/// `allocate_atomic` is the only linearizable operation: under arbitrary concurrent
/// callers, each eligible record is handed to at most one of them. Everything else may
/// be plain reads/writes, except that `update` evaluates its `guard` in the same step
/// as the write so state preconditions (e.g. "still in flight") cannot be raced, and
/// `insert_deduplicated` checks and inserts as one step per `schedule_id`.
#[async_trait::async_trait]
pub trait WorkStore: Send + Sync {
    /// Persist a new item. Fails with `Conflict` when a NEW or ALLOCATED item with the
    /// same `schedule_id` exists.
    async fn insert(&self, item: WorkItem) -> Result<WorkItem, StoreError>;

    /// Persist a new item unless a NEW or ALLOCATED item with the same `schedule_id`
    /// exists. Returns `None` when deduplicated. Items without `schedule_id` are
    /// always inserted.
    async fn insert_deduplicated(&self, item: WorkItem) -> Result<Option<WorkItem>, StoreError>;

    async fn get(&self, id: WorkId) -> Result<Option<WorkItem>, StoreError>;

    async fn list(
        &self,
        selector: &WorkSelector,
        sort: WorkSort,
        skip: usize,
        limit: Option<usize>,
    ) -> Result<Vec<WorkItem>, StoreError>;

    async fn count(&self, selector: &WorkSelector) -> Result<u64, StoreError>;

    /// Distinct work types among matching items, sorted.
    async fn distinct_types(&self, selector: &WorkSelector) -> Result<Vec<String>, StoreError>;

    /// Apply `patch` to the item if it exists and matches `guard`.
    /// Returns the updated record, or `None` when not found or the guard failed.
    async fn update(
        &self,
        id: WorkId,
        guard: &WorkSelector,
        patch: WorkPatch,
    ) -> Result<Option<WorkItem>, StoreError>;

    /// Atomically pick the first NEW item matching `selector` in allocation order and
    /// stamp it with `allocation`.
    async fn allocate_atomic(
        &self,
        selector: &WorkSelector,
        allocation: Allocation,
    ) -> Result<Option<WorkItem>, StoreError>;

    /// Permanently remove every item created before `cutoff`, whatever its status.
    async fn purge_created_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[async_trait::async_trait]
impl<S> WorkStore for Arc<S>
where
    S: WorkStore + ?Sized,
{
    async fn insert(&self, item: WorkItem) -> Result<WorkItem, StoreError> {
        (**self).insert(item).await
    }

    async fn insert_deduplicated(&self, item: WorkItem) -> Result<Option<WorkItem>, StoreError> {
        (**self).insert_deduplicated(item).await
    }

    async fn get(&self, id: WorkId) -> Result<Option<WorkItem>, StoreError> {
        (**self).get(id).await
    }

    async fn list(
        &self,
        selector: &WorkSelector,
        sort: WorkSort,
        skip: usize,
        limit: Option<usize>,
    ) -> Result<Vec<WorkItem>, StoreError> {
        (**self).list(selector, sort, skip, limit).await
    }

    async fn count(&self, selector: &WorkSelector) -> Result<u64, StoreError> {
        (**self).count(selector).await
    }

    async fn distinct_types(&self, selector: &WorkSelector) -> Result<Vec<String>, StoreError> {
        (**self).distinct_types(selector).await
    }

    async fn update(
        &self,
        id: WorkId,
        guard: &WorkSelector,
        patch: WorkPatch,
    ) -> Result<Option<WorkItem>, StoreError> {
        (**self).update(id, guard, patch).await
    }

    async fn allocate_atomic(
        &self,
        selector: &WorkSelector,
        allocation: Allocation,
    ) -> Result<Option<WorkItem>, StoreError> {
        (**self).allocate_atomic(selector, allocation).await
    }

    async fn purge_created_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        (**self).purge_created_before(cutoff).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use forgequeue_core::NewWork;

    fn item(work_type: &str) -> WorkItem {
        WorkItem::from_new(NewWork::new(work_type, serde_json::json!({})), Utc::now())
    }

    #[test]
    fn empty_selector_matches_everything() {
        assert!(WorkSelector::default().matches(&item("a")));
    }

    #[test]
    fn empty_type_list_matches_nothing() {
        let selector = WorkSelector::default().with_types(Vec::<String>::new());
        assert!(!selector.matches(&item("a")));
    }

    #[test]
    fn worker_filter_accepts_unassigned_or_own() {
        let filter = WorkerFilter::UnassignedOr("w1".into());
        assert!(filter.matches(None));
        assert!(filter.matches(Some("w1")));
        assert!(!filter.matches(Some("w2")));
        assert!(!WorkerFilter::Unassigned.matches(Some("w1")));
    }

    #[test]
    fn in_flight_ignores_soft_delete() {
        let mut work = item("a");
        work.started = Some(Utc::now());
        work.deleted = Some(Utc::now());
        assert!(WorkSelector::default().in_flight().matches(&work));
        assert!(!WorkSelector::pending().matches(&work));
    }

    #[test]
    fn started_before_requires_started() {
        let selector = WorkSelector {
            started_before: Some(Utc::now() + Duration::seconds(1)),
            ..WorkSelector::default()
        };
        let mut work = item("a");
        assert!(!selector.matches(&work));
        work.started = Some(Utc::now());
        assert!(selector.matches(&work));
    }

    #[test]
    fn queue_sort_puts_unstarted_first_then_priority() {
        let mut done = item("a");
        done.started = Some(Utc::now());
        done.priority = 100;
        let mut low = item("a");
        low.priority = 1;
        let mut high = item("a");
        high.priority = 9;

        let mut items = vec![done.clone(), low.clone(), high.clone()];
        items.sort_by(|a, b| WorkSort::Queue.compare(a, b));
        assert_eq!(
            items.iter().map(|i| i.id).collect::<Vec<_>>(),
            vec![high.id, low.id, done.id]
        );
    }

    #[test]
    fn allocation_sort_is_priority_then_fifo() {
        let now = Utc::now();
        let mut first = item("a");
        first.created = now - Duration::seconds(10);
        let mut second = item("a");
        second.created = now;
        let mut urgent = item("a");
        urgent.created = now + Duration::seconds(10);
        urgent.priority = 1;

        let mut items = vec![second.clone(), urgent.clone(), first.clone()];
        items.sort_by(|a, b| WorkSort::Allocation.compare(a, b));
        assert_eq!(
            items.iter().map(|i| i.id).collect::<Vec<_>>(),
            vec![urgent.id, first.id, second.id]
        );
    }

    #[test]
    fn patch_only_touches_set_fields() {
        let mut work = item("a");
        let before = work.clone();
        WorkPatch {
            success: Some(true),
            ..WorkPatch::default()
        }
        .apply(&mut work);
        assert_eq!(work.success, Some(true));
        assert_eq!(work.scheduled, before.scheduled);
        assert_eq!(work.started, None);
    }
}
