//! Director: the orchestration core of the work queue.
//!
//! ## Flow
//!
//! ```text
//! add_work ─► store.insert ─► "added"
//! allocate_work ─► store.allocate_atomic ─► "allocated"
//! do_work ─► adapter.execute (isolated task) ─► "done"
//! finish_work ─► guarded store.update ─► "finished"
//! ```
//!
//! Changes are persisted first and published second. Publication failures are logged
//! and never undo or fail the persisted change.
//!
//! ## Idempotency
//!
//! `finish_work` and `remove_work` carry their state precondition into the store's
//! guarded update. When the item is not in the required state they return `Ok(None)`.

use std::any::Any;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use forgequeue_core::{NewWork, WorkError, WorkId, WorkItem, WorkOutput, WorkStatus};
use forgequeue_events::{EventBus, Subscription, WorkEvent};

use crate::registry::AdapterRegistry;
use crate::store::{
    Allocation, StoreError, WorkPatch, WorkQuery, WorkSelector, WorkSort, WorkStats, WorkStore,
    WorkerFilter,
};

/// Director operation error.
#[derive(Debug, Error)]
pub enum DirectorError {
    #[error(transparent)]
    Work(#[from] WorkError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Identity of a worker and the types it owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerScope {
    pub worker: String,
    pub types: Vec<String>,
}

impl WorkerScope {
    pub fn new(worker: impl Into<String>, types: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            worker: worker.into(),
            types: types.into_iter().map(Into::into).collect(),
        }
    }
}

/// Completion report for an allocated item.
#[derive(Debug, Clone, PartialEq)]
pub struct FinishWork {
    pub work_id: WorkId,
    pub output: WorkOutput,
    pub worker: String,
    /// When the work actually began. Replaces the allocation instant when set.
    pub started: Option<DateTime<Utc>>,
    /// Defaults to now.
    pub finished: Option<DateTime<Utc>>,
}

impl FinishWork {
    pub fn new(work_id: WorkId, output: WorkOutput, worker: impl Into<String>) -> Self {
        Self {
            work_id,
            output,
            worker: worker.into(),
            started: None,
            finished: None,
        }
    }

    pub fn started_at(mut self, started: DateTime<Utc>) -> Self {
        self.started = Some(started);
        self
    }

    pub fn finished_at(mut self, finished: DateTime<Utc>) -> Self {
        self.finished = Some(finished);
        self
    }
}

/// Orchestrates the work lifecycle over a store, a bus and the adapter registry.
#[derive(Debug, Clone)]
pub struct Director<S, B> {
    store: S,
    bus: B,
    registry: Arc<AdapterRegistry>,
}

impl<S, B> Director<S, B>
where
    S: WorkStore,
    B: EventBus<WorkEvent>,
{
    pub fn new(store: S, bus: B, registry: Arc<AdapterRegistry>) -> Self {
        Self {
            store,
            bus,
            registry,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn registry(&self) -> &Arc<AdapterRegistry> {
        &self.registry
    }

    pub fn subscribe(&self) -> Subscription<WorkEvent> {
        self.bus.subscribe()
    }

    fn publish(&self, event: WorkEvent) {
        let topic = event.kind().topic();
        let work_id = event.work_id();
        if let Err(e) = self.bus.publish(event) {
            warn!(topic, work_id = %work_id, error = ?e, "failed to publish work event");
        }
    }

    /// Submit new work. Fails with `UnknownType` when no adapter is registered for it.
    pub async fn add_work(&self, new: NewWork) -> Result<WorkItem, DirectorError> {
        if !self.registry.contains(&new.work_type) {
            return Err(WorkError::UnknownType(new.work_type).into());
        }
        let item = self.store.insert(WorkItem::from_new(new, Utc::now())).await?;
        debug!(work_id = %item.id, work_type = %item.work_type, "work added");
        self.publish(WorkEvent::Added { work: item.clone() });
        Ok(item)
    }

    /// Submit new work unless a pending item with the same `schedule_id` exists.
    ///
    /// Skips the registry check so external types that have no local adapter can still
    /// be scheduled.
    pub async fn add_work_deduplicated(
        &self,
        new: NewWork,
    ) -> Result<Option<WorkItem>, DirectorError> {
        let inserted = self
            .store
            .insert_deduplicated(WorkItem::from_new(new, Utc::now()))
            .await?;
        if let Some(item) = &inserted {
            debug!(
                work_id = %item.id,
                work_type = %item.work_type,
                schedule_id = ?item.schedule_id,
                "scheduled work added"
            );
            self.publish(WorkEvent::Added { work: item.clone() });
        }
        Ok(inserted)
    }

    /// Allocate the next eligible item to `scope.worker`.
    ///
    /// Eligible: NEW, `scheduled <= now`, type owned by the scope, unpinned or pinned to
    /// this worker. Highest priority first, then oldest.
    pub async fn allocate_work(&self, scope: &WorkerScope) -> Result<Option<WorkItem>, DirectorError> {
        let now = Utc::now();
        let selector = WorkSelector {
            types: Some(scope.types.clone()),
            worker: WorkerFilter::UnassignedOr(scope.worker.clone()),
            scheduled_until: Some(now),
            ..WorkSelector::default()
        };
        let allocation = Allocation {
            started: now,
            worker: scope.worker.clone(),
        };

        let allocated = self.store.allocate_atomic(&selector, allocation).await?;
        if let Some(item) = &allocated {
            debug!(
                work_id = %item.id,
                work_type = %item.work_type,
                worker = %scope.worker,
                "work allocated"
            );
            self.publish(WorkEvent::Allocated { work: item.clone() });
        }
        Ok(allocated)
    }

    /// Execute an item through its adapter. Never fails: a missing adapter, a handler
    /// error or a panic all become a failed [`WorkOutput`].
    pub async fn do_work(&self, item: &WorkItem) -> WorkOutput {
        let output = match self.registry.get(&item.work_type) {
            Some(_) if self.registry.is_external(&item.work_type) => {
                warn!(work_id = %item.id, work_type = %item.work_type, "external work allocated locally");
                WorkOutput::from_error(&WorkError::ExternalType(item.work_type.clone()))
            }
            None => {
                warn!(work_id = %item.id, work_type = %item.work_type, "no adapter for work");
                WorkOutput::from_error(&WorkError::NoAdapter(item.work_type.clone()))
            }
            Some(adapter) => {
                let input = item.input.clone();
                let task = tokio::spawn(async move { adapter.execute(input).await });
                match task.await {
                    Ok(Ok(output)) => output,
                    Ok(Err(e)) => {
                        warn!(work_id = %item.id, work_type = %item.work_type, error = %e, "handler failed");
                        WorkOutput::from_error(&WorkError::handler(format!("{e:#}")))
                    }
                    Err(join) => {
                        let reason = if join.is_panic() {
                            format!("handler panicked: {}", panic_message(join.into_panic()))
                        } else {
                            "handler task was cancelled".to_string()
                        };
                        warn!(work_id = %item.id, work_type = %item.work_type, %reason, "handler aborted");
                        WorkOutput::from_error(&WorkError::handler(reason))
                    }
                }
            }
        };

        self.publish(WorkEvent::Done {
            work_id: item.id,
            output: output.clone(),
            occurred_at: Utc::now(),
        });
        output
    }

    /// Record the outcome of an in-flight item.
    ///
    /// Returns `None` when the item is unknown or not in flight (already finished or
    /// never started). An item soft-deleted while in flight can still be finished.
    pub async fn finish_work(&self, finish: FinishWork) -> Result<Option<WorkItem>, DirectorError> {
        let FinishWork {
            work_id,
            output,
            worker,
            started,
            finished,
        } = finish;

        let patch = WorkPatch {
            started,
            finished: Some(finished.unwrap_or_else(Utc::now)),
            success: Some(output.success),
            result: output.result,
            error: output.error,
            worker: Some(worker),
            ..WorkPatch::default()
        };
        let guard = WorkSelector::by_id(work_id).in_flight();

        let updated = self.store.update(work_id, &guard, patch).await?;
        match &updated {
            Some(item) => {
                debug!(
                    work_id = %item.id,
                    work_type = %item.work_type,
                    success = output.success,
                    "work finished"
                );
                self.publish(WorkEvent::Finished { work: item.clone() });
            }
            None => debug!(work_id = %work_id, "finish ignored, work not in flight"),
        }
        Ok(updated)
    }

    /// Soft-delete a NEW or ALLOCATED item. `None` for any other status.
    pub async fn remove_work(&self, work_id: WorkId) -> Result<Option<WorkItem>, DirectorError> {
        let patch = WorkPatch {
            deleted: Some(Utc::now()),
            ..WorkPatch::default()
        };
        let guard = WorkSelector {
            ids: vec![work_id],
            ..WorkSelector::pending()
        };

        let removed = self.store.update(work_id, &guard, patch).await?;
        if let Some(item) = &removed {
            debug!(work_id = %item.id, work_type = %item.work_type, "work removed");
            self.publish(WorkEvent::Deleted { work: item.clone() });
        }
        Ok(removed)
    }

    /// Allocate, execute and finish one item. `None` when nothing was eligible.
    pub async fn find_one_and_process_work(
        &self,
        scope: &WorkerScope,
    ) -> Result<Option<WorkItem>, DirectorError> {
        let Some(item) = self.allocate_work(scope).await? else {
            return Ok(None);
        };
        let output = self.do_work(&item).await;
        self.finish_work(FinishWork::new(item.id, output, scope.worker.clone()))
            .await
    }

    /// Fail every item still in flight on `scope.worker` that started before `reference`.
    ///
    /// Run on worker start: anything the same worker id still holds was orphaned by a
    /// previous process. Returns the items that were failed.
    pub async fn mark_old_work_failed(
        &self,
        scope: &WorkerScope,
        reference: DateTime<Utc>,
    ) -> Result<Vec<WorkItem>, DirectorError> {
        let selector = WorkSelector {
            in_flight: true,
            types: Some(scope.types.clone()),
            worker: WorkerFilter::Exactly(scope.worker.clone()),
            started_before: Some(reference),
            ..WorkSelector::default()
        };
        let orphans = self
            .store
            .list(&selector, WorkSort::Allocation, 0, None)
            .await?;

        let mut failed = Vec::with_capacity(orphans.len());
        for orphan in orphans {
            let error = WorkError::OrphanedAllocation {
                work_id: orphan.id,
                worker: scope.worker.clone(),
                reference,
            };
            warn!(work_id = %orphan.id, worker = %scope.worker, "failing orphaned allocation");
            let finish = FinishWork::new(orphan.id, WorkOutput::from_error(&error), scope.worker.clone());
            if let Some(item) = self.finish_work(finish).await? {
                failed.push(item);
            }
        }

        if !failed.is_empty() {
            info!(worker = %scope.worker, count = failed.len(), "orphaned allocations failed");
        }
        Ok(failed)
    }

    /// Move a NEW item's `scheduled` instant. `None` for any other status.
    pub async fn reschedule_work(
        &self,
        work_id: WorkId,
        scheduled: DateTime<Utc>,
    ) -> Result<Option<WorkItem>, DirectorError> {
        let patch = WorkPatch {
            scheduled: Some(scheduled),
            ..WorkPatch::default()
        };
        let guard = WorkSelector::by_id(work_id).with_statuses([WorkStatus::New]);
        let updated = self.store.update(work_id, &guard, patch).await?;
        if updated.is_some() {
            debug!(work_id = %work_id, %scheduled, "work rescheduled");
        }
        Ok(updated)
    }

    /// One page of the queue in queue order.
    pub async fn work_queue(&self, query: &WorkQuery) -> Result<Vec<WorkItem>, DirectorError> {
        let page = query.pagination.clamped();
        Ok(self
            .store
            .list(
                &query.selector(),
                WorkSort::Queue,
                page.offset as usize,
                Some(page.limit as usize),
            )
            .await?)
    }

    pub async fn work(&self, work_id: WorkId) -> Result<Option<WorkItem>, DirectorError> {
        Ok(self.store.get(work_id).await?)
    }

    /// Number of items matching the query filters; pagination is ignored.
    pub async fn count_work(&self, query: &WorkQuery) -> Result<u64, DirectorError> {
        Ok(self.store.count(&query.selector()).await?)
    }

    /// Per-status counts, restricted to `types` when not empty.
    pub async fn statistics(&self, types: &[String]) -> Result<WorkStats, DirectorError> {
        let mut stats = WorkStats::default();
        for status in WorkStatus::ALL {
            let mut selector = WorkSelector::default().with_statuses([status]);
            if !types.is_empty() {
                selector.types = Some(types.to_vec());
            }
            stats.set(status, self.store.count(&selector).await?);
        }
        Ok(stats)
    }

    /// Distinct types with NEW or ALLOCATED items.
    pub async fn active_work_types(&self) -> Result<Vec<String>, DirectorError> {
        Ok(self.store.distinct_types(&WorkSelector::pending()).await?)
    }

    /// Earliest `scheduled` among NEW items in `scope`, due or not.
    pub async fn next_scheduled(
        &self,
        scope: &WorkerScope,
    ) -> Result<Option<DateTime<Utc>>, DirectorError> {
        let selector = WorkSelector::default()
            .with_statuses([WorkStatus::New])
            .with_types(scope.types.iter().cloned());
        let next = self
            .store
            .list(&selector, WorkSort::Scheduled, 0, Some(1))
            .await?;
        Ok(next.first().map(|item| item.scheduled))
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
