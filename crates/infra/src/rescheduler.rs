//! Failure rescheduler: re-enqueues failed work with backoff.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use forgequeue_core::{NewWork, WorkItem, WorkStatus};
use forgequeue_events::{EventBus, WorkEvent};

use crate::director::{Director, DirectorError};
use crate::store::WorkStore;
use crate::workers::{ShutdownSignal, WorkerHandle};

/// Delay policy for retry chains.
///
/// The previous attempt's delay (`scheduled - created`) is multiplied by `factor` when it
/// exceeds `threshold`; otherwise the retry waits `minimum`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub threshold: Duration,
    pub minimum: Duration,
    pub factor: u32,
    /// Optional cap on the computed delay.
    pub max_delay: Option<Duration>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            threshold: Duration::from_secs(1),
            minimum: Duration::from_secs(5),
            factor: 2,
            max_delay: None,
        }
    }
}

impl BackoffPolicy {
    pub fn next_delay(&self, previous: chrono::Duration) -> Duration {
        let previous = previous.to_std().unwrap_or(Duration::ZERO);
        let delay = if previous > self.threshold {
            previous.saturating_mul(self.factor)
        } else {
            self.minimum
        };
        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }
}

/// Listens to `finished` events and enqueues the next attempt of failed items.
#[derive(Debug, Clone)]
pub struct FailureRescheduler<S, B> {
    director: Director<S, B>,
    policy: BackoffPolicy,
}

impl<S, B> FailureRescheduler<S, B>
where
    S: WorkStore + Clone + 'static,
    B: EventBus<WorkEvent> + Clone + 'static,
{
    pub fn new(director: Director<S, B>) -> Self {
        Self::with_policy(director, BackoffPolicy::default())
    }

    pub fn with_policy(director: Director<S, B>, policy: BackoffPolicy) -> Self {
        Self { director, policy }
    }

    /// Enqueue the next attempt for `item` if it FAILED with retries left.
    ///
    /// Soft-deleted items are never retried, even when their execution failed.
    pub async fn reschedule(&self, item: &WorkItem) -> Result<Option<WorkItem>, DirectorError> {
        if item.status() != Some(WorkStatus::Failed) || item.retries == 0 {
            return Ok(None);
        }

        let delay = self.policy.next_delay(item.scheduled_delay());
        let scheduled = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let next = NewWork::new(item.work_type.clone(), item.input.clone())
            .with_priority(item.priority)
            .with_retries(item.retries - 1)
            .retry_of(item.chain_root())
            .scheduled_at(scheduled);

        let retry = self.director.add_work(next).await?;
        info!(
            work_id = %retry.id,
            original_work_id = %item.chain_root(),
            failed_work_id = %item.id,
            retries = retry.retries,
            delay_ms = delay.as_millis() as u64,
            "failed work rescheduled"
        );
        Ok(Some(retry))
    }

    /// Subscribe now and process `finished` events in a background task.
    pub fn spawn(self) -> WorkerHandle {
        let mut events = self.director.subscribe();
        WorkerHandle::spawn("failure-rescheduler", move |mut shutdown: ShutdownSignal| async move {
            info!("failure rescheduler started");
            loop {
                let event = tokio::select! {
                    _ = shutdown.wait() => break,
                    event = events.recv() => event,
                };
                match event {
                    Some(WorkEvent::Finished { work }) => {
                        if let Err(e) = self.reschedule(&work).await {
                            warn!(work_id = %work.id, error = %e, "failed to reschedule work");
                        }
                    }
                    Some(other) => debug!(topic = other.kind().topic(), "ignored"),
                    None => break,
                }
            }
            info!("failure rescheduler stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_delays_get_the_flat_minimum() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.next_delay(chrono::Duration::zero()), Duration::from_secs(5));
        assert_eq!(
            policy.next_delay(chrono::Duration::milliseconds(1000)),
            Duration::from_secs(5)
        );
        assert_eq!(policy.next_delay(chrono::Duration::seconds(-3)), Duration::from_secs(5));
    }

    #[test]
    fn longer_delays_double() {
        let policy = BackoffPolicy::default();
        assert_eq!(
            policy.next_delay(chrono::Duration::milliseconds(1001)),
            Duration::from_millis(2002)
        );
        assert_eq!(policy.next_delay(chrono::Duration::seconds(5)), Duration::from_secs(10));
    }

    #[test]
    fn cap_applies() {
        let policy = BackoffPolicy {
            max_delay: Some(Duration::from_secs(60)),
            ..BackoffPolicy::default()
        };
        assert_eq!(policy.next_delay(chrono::Duration::seconds(50)), Duration::from_secs(60));
    }
}
