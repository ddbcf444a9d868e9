//! Recurring work definitions with a one-pending-item-per-schedule guarantee.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

use forgequeue_core::{NewWork, WorkItem};
use forgequeue_events::{EventBus, WorkEvent};

use crate::cron::{CronExpr, CronParseError};
use crate::director::{Director, DirectorError};
use crate::store::WorkStore;

#[derive(Debug, Error)]
pub enum AutoscheduleError {
    #[error("no adapter registered for work type '{0}'")]
    UnknownType(String),

    #[error("unknown schedule '{0}'")]
    UnknownSchedule(String),

    #[error("invalid cron expression: {0}")]
    InvalidCron(#[from] CronParseError),

    #[error(transparent)]
    Director(#[from] DirectorError),
}

/// Produces the input of each scheduled item.
pub type InputFactory = Arc<dyn Fn() -> JsonValue + Send + Sync>;

/// A recurring work definition.
#[derive(Clone)]
pub struct AutoScheduleEntry {
    /// Dedup key; defaults to the work type.
    pub schedule_id: String,
    pub work_type: String,
    /// `None` once disabled.
    pub schedule: Option<CronExpr>,
    pub retries: u32,
    pub priority: i32,
    pub input: InputFactory,
    /// Pin every scheduled item to this worker.
    pub worker: Option<String>,
}

impl core::fmt::Debug for AutoScheduleEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AutoScheduleEntry")
            .field("schedule_id", &self.schedule_id)
            .field("work_type", &self.work_type)
            .field("schedule", &self.schedule.as_ref().map(CronExpr::as_str))
            .field("retries", &self.retries)
            .field("priority", &self.priority)
            .field("worker", &self.worker)
            .finish_non_exhaustive()
    }
}

impl AutoScheduleEntry {
    pub fn new(work_type: impl Into<String>, schedule: &str) -> Result<Self, CronParseError> {
        let work_type = work_type.into();
        Ok(Self {
            schedule_id: work_type.clone(),
            work_type,
            schedule: Some(CronExpr::parse(schedule)?),
            retries: 0,
            priority: 0,
            input: Arc::new(|| JsonValue::Object(Default::default())),
            worker: None,
        })
    }

    pub fn with_schedule_id(mut self, schedule_id: impl Into<String>) -> Self {
        self.schedule_id = schedule_id.into();
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_input<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> JsonValue + Send + Sync + 'static,
    {
        self.input = Arc::new(factory);
        self
    }

    pub fn for_worker(mut self, worker: impl Into<String>) -> Self {
        self.worker = Some(worker.into());
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.schedule.is_some()
    }
}

/// Process-wide registry of recurring work.
pub struct Autoscheduler<S, B> {
    director: Director<S, B>,
    entries: RwLock<BTreeMap<String, AutoScheduleEntry>>,
}

impl<S, B> core::fmt::Debug for Autoscheduler<S, B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("Autoscheduler")
            .field("entries", &entries.values().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl<S, B> Autoscheduler<S, B>
where
    S: WorkStore,
    B: EventBus<WorkEvent>,
{
    pub fn new(director: Director<S, B>) -> Self {
        Self {
            director,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register or overwrite the entry keyed by its `schedule_id`.
    pub fn configure_autoscheduling(&self, entry: AutoScheduleEntry) -> Result<(), AutoscheduleError> {
        if !self.director.registry().contains(&entry.work_type) {
            return Err(AutoscheduleError::UnknownType(entry.work_type));
        }
        debug!(schedule_id = %entry.schedule_id, work_type = %entry.work_type, "autoschedule configured");
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entry.schedule_id.clone(), entry);
        Ok(())
    }

    /// Clear the entry's schedule. Existing items are left alone.
    pub fn disable_autoscheduling(&self, schedule_id: &str) -> Result<(), AutoscheduleError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let entry = entries
            .get_mut(schedule_id)
            .ok_or_else(|| AutoscheduleError::UnknownSchedule(schedule_id.to_string()))?;
        entry.schedule = None;
        debug!(schedule_id, "autoschedule disabled");
        Ok(())
    }

    pub fn entry(&self, schedule_id: &str) -> Option<AutoScheduleEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(schedule_id)
            .cloned()
    }

    pub fn schedule_ids(&self) -> Vec<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Make sure the schedule has a NEW or ALLOCATED item.
    ///
    /// The item is scheduled at the first fire instant at or after `reference` (floored
    /// to the minute). Returns the created item, or `None` when one was already pending,
    /// the entry is disabled, or the expression never fires again.
    pub async fn ensure_one_work(
        &self,
        schedule_id: &str,
        reference: DateTime<Utc>,
    ) -> Result<Option<WorkItem>, AutoscheduleError> {
        let entry = self
            .entry(schedule_id)
            .ok_or_else(|| AutoscheduleError::UnknownSchedule(schedule_id.to_string()))?;
        let Some(schedule) = &entry.schedule else {
            return Ok(None);
        };
        let Some(scheduled) = schedule.next_from(reference) else {
            return Ok(None);
        };

        let mut new = NewWork::new(entry.work_type.clone(), (entry.input)())
            .with_priority(entry.priority)
            .with_retries(entry.retries)
            .with_schedule_id(entry.schedule_id.clone())
            .scheduled_at(scheduled);
        new.worker = entry.worker.clone();

        Ok(self.director.add_work_deduplicated(new).await?)
    }

    /// `ensure_one_work` for every enabled entry. Failures are logged per entry.
    pub async fn ensure_all(&self, reference: DateTime<Utc>) -> Vec<WorkItem> {
        let mut created = Vec::new();
        for schedule_id in self.schedule_ids() {
            match self.ensure_one_work(&schedule_id, reference).await {
                Ok(Some(item)) => created.push(item),
                Ok(None) => {}
                Err(e) => warn!(schedule_id = %schedule_id, error = %e, "failed to ensure scheduled work"),
            }
        }
        created
    }
}
