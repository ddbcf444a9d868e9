use chrono::{Duration as ChronoDuration, Utc};
use tracing::{info, warn};

use forgequeue_events::{EventBus, WorkEvent};

use super::{DrainLoop, ShutdownSignal, WorkerHandle};
use crate::cron::CronExpr;
use crate::store::WorkStore;

const STRATEGY: &str = "cron";

/// Drains at every fire instant of a cron expression.
#[derive(Debug)]
pub struct CronWorker;

impl CronWorker {
    pub fn spawn<S, B>(drain: DrainLoop<S, B>, schedule: CronExpr) -> WorkerHandle
    where
        S: WorkStore + Clone + 'static,
        B: EventBus<WorkEvent> + Clone + 'static,
    {
        let name = format!("{STRATEGY}:{}", drain.scope().worker);
        WorkerHandle::spawn(name, move |mut shutdown: ShutdownSignal| async move {
            info!(strategy = STRATEGY, worker = %drain.scope().worker, schedule = %schedule, "worker started");
            drain.recover_logged(STRATEGY).await;

            loop {
                // Strictly after the current minute, so a fire instant drains once.
                let now = Utc::now();
                let Some(next) = schedule.next_from(now + ChronoDuration::minutes(1)) else {
                    warn!(strategy = STRATEGY, schedule = %schedule, "schedule has no future fire instant");
                    break;
                };
                let wait = (next - now).to_std().unwrap_or_default();

                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = tokio::time::sleep(wait) => drain.drain_logged(STRATEGY).await,
                }
            }
            info!(strategy = STRATEGY, worker = %drain.scope().worker, "worker stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::director::{Director, WorkerScope};
    use crate::registry::AdapterRegistry;
    use crate::store::InMemoryWorkStore;
    use forgequeue_events::InMemoryEventBus;

    #[tokio::test]
    async fn stops_on_shutdown_while_waiting() {
        let director = Director::new(
            InMemoryWorkStore::arc(),
            Arc::new(InMemoryEventBus::<WorkEvent>::new()),
            Arc::new(AdapterRegistry::new()),
        );
        let handle = CronWorker::spawn(
            DrainLoop::new(director, WorkerScope::new("w1", Vec::<String>::new())),
            CronExpr::parse("0 0 1 1 *").unwrap(),
        );

        tokio::time::timeout(Duration::from_secs(1), handle.shutdown())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn impossible_schedule_ends_the_task() {
        let director = Director::new(
            InMemoryWorkStore::arc(),
            Arc::new(InMemoryEventBus::<WorkEvent>::new()),
            Arc::new(AdapterRegistry::new()),
        );
        let handle = CronWorker::spawn(
            DrainLoop::new(director, WorkerScope::new("w1", Vec::<String>::new())),
            CronExpr::parse("0 0 31 2 *").unwrap(),
        );

        tokio::time::timeout(Duration::from_secs(2), async {
            while !handle.is_finished() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }
}
