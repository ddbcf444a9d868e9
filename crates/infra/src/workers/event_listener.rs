//! Event-reactive strategy.
//!
//! Only sees events published in this process. In a multi-process deployment, work
//! added elsewhere never triggers a drain here, so pair it with a polling strategy.
//! Items scheduled in the future are picked up by a timer armed at the earliest
//! pending `scheduled` instant, re-armed after every drain.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, info};

use forgequeue_events::{EventBus, WorkEvent, WorkEventKind};

use super::{DrainLoop, ShutdownSignal, WorkerHandle};
use crate::store::WorkStore;

const STRATEGY: &str = "event";

/// Lower bound on the scheduled-wake timer, so a due item that cannot be drained does
/// not spin the loop.
const MIN_WAKE: Duration = Duration::from_millis(10);

/// Drains whenever a local `added` or `finished` event arrives, and when the next
/// scheduled item falls due.
#[derive(Debug)]
pub struct EventListenerWorker;

impl EventListenerWorker {
    /// Subscribes before returning, then recovers and runs an initial drain.
    pub fn spawn<S, B>(drain: DrainLoop<S, B>) -> WorkerHandle
    where
        S: WorkStore + Clone + 'static,
        B: EventBus<WorkEvent> + Clone + 'static,
    {
        let mut events = drain.director().subscribe();
        let name = format!("{STRATEGY}:{}", drain.scope().worker);
        WorkerHandle::spawn(name, move |mut shutdown: ShutdownSignal| async move {
            info!(strategy = STRATEGY, worker = %drain.scope().worker, "worker started");
            drain.recover_logged(STRATEGY).await;
            drain.drain_logged(STRATEGY).await;

            loop {
                let wake = drain.next_scheduled_logged(STRATEGY).await;
                let event = tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = sleep_until(wake) => {
                        debug!(strategy = STRATEGY, worker = %drain.scope().worker, "scheduled work due");
                        drain.drain_logged(STRATEGY).await;
                        continue;
                    }
                    event = events.recv() => event,
                };
                let Some(event) = event else { break };
                if !is_trigger(&event) {
                    continue;
                }

                // One drain covers every event that queued up meanwhile.
                loop {
                    match events.try_recv() {
                        Ok(_) => continue,
                        Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                    }
                }
                drain.drain_logged(STRATEGY).await;
            }
            info!(strategy = STRATEGY, worker = %drain.scope().worker, "worker stopped");
        })
    }
}

/// Resolves at `at`, or never when nothing is scheduled.
async fn sleep_until(at: Option<DateTime<Utc>>) {
    match at {
        Some(at) => {
            let wait = (at - Utc::now()).to_std().unwrap_or_default().max(MIN_WAKE);
            tokio::time::sleep(wait).await;
        }
        None => std::future::pending().await,
    }
}

fn is_trigger(event: &WorkEvent) -> bool {
    matches!(event.kind(), WorkEventKind::Added | WorkEventKind::Finished)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::director::{Director, WorkerScope};
    use crate::registry::{AdapterOptions, AdapterRegistry};
    use crate::store::InMemoryWorkStore;
    use forgequeue_core::{NewWork, WorkOutput, WorkStatus};
    use forgequeue_events::InMemoryEventBus;

    async fn echo(input: serde_json::Value) -> anyhow::Result<WorkOutput> {
        Ok(WorkOutput::success(input))
    }

    #[tokio::test]
    async fn added_event_triggers_processing() {
        let registry = Arc::new(AdapterRegistry::new());
        registry.register_fn("echo", echo, AdapterOptions::default()).unwrap();
        let director = Director::new(InMemoryWorkStore::arc(), Arc::new(InMemoryEventBus::new()), registry);
        let mut events = director.subscribe();

        let handle = EventListenerWorker::spawn(DrainLoop::new(
            director.clone(),
            WorkerScope::new("w1", ["echo"]),
        ));
        let item = director.add_work(NewWork::new("echo", serde_json::json!({}))).await.unwrap();

        loop {
            let event = events
                .recv_timeout(Duration::from_secs(2))
                .await
                .unwrap()
                .expect("work finished in time");
            if event.kind() == WorkEventKind::Finished {
                break;
            }
        }
        handle.shutdown().await;

        let done = director.work(item.id).await.unwrap().unwrap();
        assert_eq!(done.status(), Some(WorkStatus::Success));
    }

    #[tokio::test]
    async fn future_scheduled_work_runs_when_due() {
        let registry = Arc::new(AdapterRegistry::new());
        registry.register_fn("echo", echo, AdapterOptions::default()).unwrap();
        let director = Director::new(InMemoryWorkStore::arc(), Arc::new(InMemoryEventBus::new()), registry);

        let handle = EventListenerWorker::spawn(DrainLoop::new(
            director.clone(),
            WorkerScope::new("w1", ["echo"]),
        ));
        let due = chrono::Utc::now() + chrono::Duration::milliseconds(200);
        let item = director
            .add_work(NewWork::new("echo", serde_json::json!({})).scheduled_at(due))
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        let done = loop {
            let current = director.work(item.id).await.unwrap().unwrap();
            if current.status() == Some(WorkStatus::Success) || tokio::time::Instant::now() >= deadline {
                break current;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        };
        handle.shutdown().await;

        assert_eq!(done.status(), Some(WorkStatus::Success));
        assert!(done.started.unwrap() >= due);
    }

    #[test]
    fn only_added_and_finished_trigger() {
        let work = forgequeue_core::WorkItem::from_new(
            NewWork::new("echo", serde_json::json!({})),
            chrono::Utc::now(),
        );
        assert!(is_trigger(&WorkEvent::Added { work: work.clone() }));
        assert!(is_trigger(&WorkEvent::Finished { work: work.clone() }));
        assert!(!is_trigger(&WorkEvent::Allocated { work }));
    }
}
