//! In-memory work store for tests/dev and single-process deployments.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use forgequeue_core::{WorkId, WorkItem, WorkStatus};

use super::r#trait::{Allocation, StoreError, WorkPatch, WorkSelector, WorkSort, WorkStore};

/// `RwLock<HashMap>` store. Every mutation runs inside one write-lock critical section,
/// which is what makes `allocate_atomic` linearizable here.
#[derive(Debug, Default)]
pub struct InMemoryWorkStore {
    items: RwLock<HashMap<WorkId, WorkItem>>,
}

impl InMemoryWorkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<WorkId, WorkItem>> {
        self.items.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<WorkId, WorkItem>> {
        self.items.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn insert_into(
    items: &mut HashMap<WorkId, WorkItem>,
    item: WorkItem,
) -> Result<WorkItem, StoreError> {
    if items.contains_key(&item.id) {
        return Err(StoreError::AlreadyExists(item.id));
    }
    items.insert(item.id, item.clone());
    Ok(item)
}

fn has_pending_schedule(items: &HashMap<WorkId, WorkItem>, item: &WorkItem) -> bool {
    item.schedule_id.as_deref().is_some_and(|schedule_id| {
        items
            .values()
            .any(|i| i.schedule_id.as_deref() == Some(schedule_id) && i.is_pending())
    })
}

#[async_trait::async_trait]
impl WorkStore for InMemoryWorkStore {
    async fn insert(&self, item: WorkItem) -> Result<WorkItem, StoreError> {
        let mut items = self.write();
        if has_pending_schedule(&items, &item) {
            return Err(StoreError::Conflict(format!(
                "schedule '{}' already has pending work",
                item.schedule_id.as_deref().unwrap_or_default()
            )));
        }
        insert_into(&mut items, item)
    }

    async fn insert_deduplicated(&self, item: WorkItem) -> Result<Option<WorkItem>, StoreError> {
        let mut items = self.write();
        if has_pending_schedule(&items, &item) {
            return Ok(None);
        }
        insert_into(&mut items, item).map(Some)
    }

    async fn get(&self, id: WorkId) -> Result<Option<WorkItem>, StoreError> {
        Ok(self.read().get(&id).cloned())
    }

    async fn list(
        &self,
        selector: &WorkSelector,
        sort: WorkSort,
        skip: usize,
        limit: Option<usize>,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let items = self.read();
        let mut result: Vec<WorkItem> = items
            .values()
            .filter(|i| selector.matches(i))
            .cloned()
            .collect();
        drop(items);

        result.sort_by(|a, b| sort.compare(a, b));
        Ok(result
            .into_iter()
            .skip(skip)
            .take(limit.unwrap_or(usize::MAX))
            .collect())
    }

    async fn count(&self, selector: &WorkSelector) -> Result<u64, StoreError> {
        Ok(self.read().values().filter(|i| selector.matches(i)).count() as u64)
    }

    async fn distinct_types(&self, selector: &WorkSelector) -> Result<Vec<String>, StoreError> {
        let types: BTreeSet<String> = self
            .read()
            .values()
            .filter(|i| selector.matches(i))
            .map(|i| i.work_type.clone())
            .collect();
        Ok(types.into_iter().collect())
    }

    async fn update(
        &self,
        id: WorkId,
        guard: &WorkSelector,
        patch: WorkPatch,
    ) -> Result<Option<WorkItem>, StoreError> {
        let mut items = self.write();
        match items.get_mut(&id) {
            Some(item) if guard.matches(item) => {
                patch.apply(item);
                Ok(Some(item.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn allocate_atomic(
        &self,
        selector: &WorkSelector,
        allocation: Allocation,
    ) -> Result<Option<WorkItem>, StoreError> {
        let mut items = self.write();

        let candidate = items
            .values()
            .filter(|i| i.has_status(WorkStatus::New) && selector.matches(i))
            .min_by(|a, b| WorkSort::Allocation.compare(a, b))
            .map(|i| i.id);

        let Some(id) = candidate else {
            return Ok(None);
        };
        match items.get_mut(&id) {
            Some(item) => {
                item.started = Some(allocation.started);
                item.worker = Some(allocation.worker);
                Ok(Some(item.clone()))
            }
            None => Ok(None),
        }
    }

    async fn purge_created_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut items = self.write();
        let before = items.len();
        items.retain(|_, i| i.created >= cutoff);
        Ok((before - items.len()) as u64)
    }
}
