use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::info;

use forgequeue_events::{EventBus, WorkEvent};

use super::{DrainLoop, ShutdownSignal, WorkerHandle};
use crate::store::WorkStore;

const STRATEGY: &str = "interval";

/// Drains on a fixed cadence. The first drain runs immediately after recovery.
#[derive(Debug)]
pub struct IntervalWorker;

impl IntervalWorker {
    pub fn spawn<S, B>(drain: DrainLoop<S, B>, period: Duration) -> WorkerHandle
    where
        S: WorkStore + Clone + 'static,
        B: EventBus<WorkEvent> + Clone + 'static,
    {
        let name = format!("{STRATEGY}:{}", drain.scope().worker);
        WorkerHandle::spawn(name, move |mut shutdown: ShutdownSignal| async move {
            info!(strategy = STRATEGY, worker = %drain.scope().worker, period_ms = period.as_millis() as u64, "worker started");
            drain.recover_logged(STRATEGY).await;

            let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = ticker.tick() => drain.drain_logged(STRATEGY).await,
                }
            }
            info!(strategy = STRATEGY, worker = %drain.scope().worker, "worker stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::director::{Director, WorkerScope};
    use crate::registry::{AdapterOptions, AdapterRegistry};
    use crate::store::InMemoryWorkStore;
    use forgequeue_core::{NewWork, WorkOutput, WorkStatus};
    use forgequeue_events::{InMemoryEventBus, WorkEventKind};

    async fn echo(input: serde_json::Value) -> anyhow::Result<WorkOutput> {
        Ok(WorkOutput::success(input))
    }

    #[tokio::test]
    async fn processes_work_on_tick() {
        let registry = Arc::new(AdapterRegistry::new());
        registry.register_fn("echo", echo, AdapterOptions::default()).unwrap();
        let director = Director::new(InMemoryWorkStore::arc(), Arc::new(InMemoryEventBus::new()), registry);
        let mut events = director.subscribe();

        let item = director.add_work(NewWork::new("echo", serde_json::json!({"v": 1}))).await.unwrap();
        let handle = IntervalWorker::spawn(
            DrainLoop::new(director.clone(), WorkerScope::new("w1", ["echo"])),
            Duration::from_millis(20),
        );

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
}
