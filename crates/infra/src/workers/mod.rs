//! Worker loop strategies.
//!
//! Every strategy wraps the same [`DrainLoop`]: on trigger, make sure every due
//! autoschedule has a pending item, then process work until none is eligible (or the
//! per-trigger budget is spent). Before the first trigger each strategy fails whatever
//! its worker id still holds from a previous run.
//!
//! - [`IntervalWorker`]: fixed cadence
//! - [`CronWorker`]: cron expression cadence
//! - [`EventListenerWorker`]: local `added`/`finished` events (in-process bus only)

pub mod cron_worker;
pub mod event_listener;
pub mod interval;

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use forgequeue_events::{EventBus, WorkEvent};

use crate::autoscheduler::Autoscheduler;
use crate::director::{Director, DirectorError, WorkerScope};
use crate::store::WorkStore;

pub use cron_worker::CronWorker;
pub use event_listener::EventListenerWorker;
pub use interval::IntervalWorker;

/// Handle to control and join a background task.
///
/// Dropping the handle without calling [`WorkerHandle::shutdown`] also stops the task at
/// its next shutdown check, without waiting for it.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Spawn `run` on the tokio runtime, handing it the shutdown signal.
    pub fn spawn<F, Fut>(name: impl Into<String>, run: F) -> Self
    where
        F: FnOnce(ShutdownSignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown, rx) = watch::channel(false);
        let join = tokio::spawn(run(ShutdownSignal(rx)));
        Self {
            name: name.into(),
            shutdown,
            join: Some(join),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, |j| j.is_finished())
    }

    /// Request graceful shutdown and wait for the task to stop.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                warn!(worker = %self.name, error = %e, "worker task ended abnormally");
            }
        }
    }
}

/// Shutdown notification handed to a spawned task.
#[derive(Debug, Clone)]
pub struct ShutdownSignal(watch::Receiver<bool>);

impl ShutdownSignal {
    /// Resolves once shutdown was requested or the handle was dropped.
    pub async fn wait(&mut self) {
        while !*self.0.borrow_and_update() {
            if self.0.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_requested(&self) -> bool {
        *self.0.borrow()
    }
}

/// The per-trigger work of every strategy.
#[derive(Debug)]
pub struct DrainLoop<S, B> {
    director: Director<S, B>,
    scope: WorkerScope,
    autoscheduler: Option<Arc<Autoscheduler<S, B>>>,
    max_work_items: usize,
}

impl<S, B> Clone for DrainLoop<S, B>
where
    S: Clone,
    B: Clone,
{
    fn clone(&self) -> Self {
        Self {
            director: self.director.clone(),
            scope: self.scope.clone(),
            autoscheduler: self.autoscheduler.clone(),
            max_work_items: self.max_work_items,
        }
    }
}

impl<S, B> DrainLoop<S, B>
where
    S: WorkStore + Clone + 'static,
    B: EventBus<WorkEvent> + Clone + 'static,
{
    pub fn new(director: Director<S, B>, scope: WorkerScope) -> Self {
        Self {
            director,
            scope,
            autoscheduler: None,
            max_work_items: 0,
        }
    }

    /// Ensure pending autoscheduled items before each drain.
    pub fn with_autoscheduler(mut self, autoscheduler: Arc<Autoscheduler<S, B>>) -> Self {
        self.autoscheduler = Some(autoscheduler);
        self
    }

    /// Items processed per trigger at most; 0 means until the queue is empty.
    pub fn with_max_work_items(mut self, max_work_items: usize) -> Self {
        self.max_work_items = max_work_items;
        self
    }

    pub fn scope(&self) -> &WorkerScope {
        &self.scope
    }

    pub fn director(&self) -> &Director<S, B> {
        &self.director
    }

    /// Fail allocations this worker id still holds from a previous run.
    pub async fn recover(&self) -> Result<usize, DirectorError> {
        let failed = self
            .director
            .mark_old_work_failed(&self.scope, Utc::now())
            .await?;
        Ok(failed.len())
    }

    /// Run one trigger. Returns the number of processed items.
    pub async fn drain(&self) -> Result<usize, DirectorError> {
        if let Some(autoscheduler) = &self.autoscheduler {
            autoscheduler.ensure_all(Utc::now()).await;
        }

        let mut processed = 0;
        while self.max_work_items == 0 || processed < self.max_work_items {
            match self.director.find_one_and_process_work(&self.scope).await? {
                Some(_) => processed += 1,
                None => break,
            }
        }
        Ok(processed)
    }

    pub(crate) async fn recover_logged(&self, strategy: &'static str) {
        match self.recover().await {
            Ok(0) => {}
            Ok(count) => info!(strategy, worker = %self.scope.worker, count, "recovered orphaned work"),
            Err(e) => error!(strategy, worker = %self.scope.worker, error = %e, "orphan recovery failed"),
        }
    }

    pub(crate) async fn drain_logged(&self, strategy: &'static str) {
        match self.drain().await {
            Ok(0) => {}
            Ok(processed) => {
                tracing::debug!(strategy, worker = %self.scope.worker, processed, "drain finished")
            }
            Err(e) => error!(strategy, worker = %self.scope.worker, error = %e, "drain failed"),
        }
    }

    pub(crate) async fn next_scheduled_logged(&self, strategy: &'static str) -> Option<DateTime<Utc>> {
        match self.director.next_scheduled(&self.scope).await {
            Ok(next) => next,
            Err(e) => {
                error!(strategy, worker = %self.scope.worker, error = %e, "next scheduled lookup failed");
                None
            }
        }
    }
}
