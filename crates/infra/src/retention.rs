//! Retention eviction: permanent removal of old work items.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info};

use crate::store::{StoreError, WorkStore};
use crate::workers::{ShutdownSignal, WorkerHandle};

/// Deletes items created more than `retention` ago, whatever their status.
///
/// This is a hard delete, unrelated to the soft `deleted` marker.
#[derive(Debug, Clone)]
pub struct RetentionSweeper<S> {
    store: S,
    retention: chrono::Duration,
}

impl<S> RetentionSweeper<S>
where
    S: WorkStore + Clone + 'static,
{
    pub const DEFAULT_RETENTION_DAYS: i64 = 30;

    pub fn new(store: S, retention: chrono::Duration) -> Self {
        Self { store, retention }
    }

    pub fn with_default_retention(store: S) -> Self {
        Self::new(store, chrono::Duration::days(Self::DEFAULT_RETENTION_DAYS))
    }

    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let cutoff = self.cutoff(now);
        let purged = self.store.purge_created_before(cutoff).await?;
        if purged > 0 {
            info!(purged, %cutoff, "expired work purged");
        }
        Ok(purged)
    }

    /// Sweep every `every`, starting immediately.
    pub fn spawn(self, every: Duration) -> WorkerHandle {
        WorkerHandle::spawn("retention-sweeper", move |mut shutdown: ShutdownSignal| async move {
            let mut ticker = tokio::time::interval(every.max(Duration::from_millis(1)));
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep_once(Utc::now()).await {
                            error!(error = %e, "retention sweep failed");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::store::InMemoryWorkStore;
    use forgequeue_core::{NewWork, WorkItem};

    #[tokio::test]
    async fn purges_only_expired_items() {
        let store = InMemoryWorkStore::arc();
        let now = Utc::now();
        let old = WorkItem::from_new(NewWork::new("a", serde_json::json!({})), now - chrono::Duration::days(31));
        let recent = WorkItem::from_new(NewWork::new("a", serde_json::json!({})), now - chrono::Duration::days(29));
        store.insert(old).await.unwrap();
        let recent = store.insert(recent).await.unwrap();

        let sweeper = RetentionSweeper::with_default_retention(Arc::clone(&store));
        assert_eq!(sweeper.sweep_once(now).await.unwrap(), 1);
        assert_eq!(sweeper.sweep_once(now).await.unwrap(), 0);
        assert!(store.get(recent.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn spawned_sweeper_runs_immediately() {
        let store = InMemoryWorkStore::arc();
        let old = WorkItem::from_new(
            NewWork::new("a", serde_json::json!({})),
            Utc::now() - chrono::Duration::days(60),
        );
        store.insert(old).await.unwrap();

        let handle = RetentionSweeper::with_default_retention(Arc::clone(&store))
            .spawn(Duration::from_secs(3600));
        tokio::time::timeout(Duration::from_secs(2), async {
            while !store.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        handle.shutdown().await;
    }
}
