//! Postgres-backed work store implementation.
//!
//! ## Allocation
//!
//! `allocate_atomic` is a single statement:
//!
//! ```sql
//! UPDATE work_queue SET started = $1, worker = $2
//! WHERE id = (SELECT id FROM work_queue WHERE <new> AND <selector>
//!             ORDER BY priority DESC, created ASC LIMIT 1
//!             FOR UPDATE SKIP LOCKED)
//!   AND started IS NULL
//! RETURNING *
//! ```
//!
//! Concurrent allocators skip rows locked by each other instead of queueing behind them,
//! and the outer `started IS NULL` re-check makes a lost race return no row.
//!
//! ## Deduplication
//!
//! A partial unique index on `schedule_id` over pending rows (`finished IS NULL AND
//! deleted IS NULL`) backs `insert_deduplicated` via `ON CONFLICT ... DO NOTHING`, so at
//! most one pending item per schedule exists even across processes.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (check violation) | `23514` | `Conflict` |
//! | Database (other) | Any other | `Storage` |
//! | Decode / ColumnDecode | N/A | `Serialization` |
//! | Other | N/A | `Storage` |

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder, Row};
use tracing::instrument;

use forgequeue_core::{WorkId, WorkItem, WorkStatus};

use super::r#trait::{
    Allocation, StoreError, WorkPatch, WorkSelector, WorkSort, WorkStore, WorkerFilter,
};

/// Schema for the `work_queue` table. Idempotent.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS work_queue (
    id                UUID PRIMARY KEY,
    work_type         TEXT NOT NULL,
    input             JSONB NOT NULL DEFAULT 'null'::jsonb,
    priority          INTEGER NOT NULL DEFAULT 0,
    scheduled         TIMESTAMPTZ NOT NULL,
    started           TIMESTAMPTZ,
    finished          TIMESTAMPTZ,
    success           BOOLEAN,
    result            JSONB,
    error             JSONB,
    retries           INTEGER NOT NULL DEFAULT 0 CHECK (retries >= 0),
    original_work_id  UUID,
    worker            TEXT,
    timeout_ms        BIGINT,
    schedule_id       TEXT,
    created           TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    deleted           TIMESTAMPTZ,
    CONSTRAINT work_queue_finished_requires_started CHECK (finished IS NULL OR started IS NOT NULL)
);

CREATE INDEX IF NOT EXISTS work_queue_allocation_idx
    ON work_queue (priority DESC, created ASC)
    WHERE started IS NULL AND finished IS NULL AND deleted IS NULL;

CREATE INDEX IF NOT EXISTS work_queue_created_idx ON work_queue (created);

CREATE INDEX IF NOT EXISTS work_queue_worker_idx
    ON work_queue (worker, started)
    WHERE finished IS NULL;

CREATE UNIQUE INDEX IF NOT EXISTS work_queue_pending_schedule_idx
    ON work_queue (schedule_id)
    WHERE schedule_id IS NOT NULL AND finished IS NULL AND deleted IS NULL;
"#;

const NEW_CONDITION: &str = "deleted IS NULL AND started IS NULL AND finished IS NULL";

/// Postgres-backed work store.
///
/// `PostgresWorkStore` is `Send + Sync` and cheap to clone; all operations go through the
/// SQLx connection pool.
#[derive(Debug, Clone)]
pub struct PostgresWorkStore {
    pool: Arc<PgPool>,
}

impl PostgresWorkStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the table and indexes if they are missing.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    async fn fetch_items(
        &self,
        operation: &str,
        mut qb: QueryBuilder<'_, Postgres>,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let rows = qb
            .build_query_as::<WorkRow>()
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        rows.into_iter().map(WorkItem::try_from).collect()
    }

    async fn fetch_optional_item(
        &self,
        operation: &str,
        mut qb: QueryBuilder<'_, Postgres>,
    ) -> Result<Option<WorkItem>, StoreError> {
        let row = qb
            .build_query_as::<WorkRow>()
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        row.map(WorkItem::try_from).transpose()
    }
}

#[async_trait::async_trait]
impl WorkStore for PostgresWorkStore {
    #[instrument(skip(self, item), fields(work_id = %item.id, work_type = %item.work_type), err)]
    async fn insert(&self, item: WorkItem) -> Result<WorkItem, StoreError> {
        let mut qb = insert_statement(&item)?;
        qb.push(" RETURNING *");
        self.fetch_optional_item("insert", qb)
            .await?
            .ok_or(StoreError::AlreadyExists(item.id))
    }

    #[instrument(skip(self, item), fields(work_id = %item.id, schedule_id = ?item.schedule_id), err)]
    async fn insert_deduplicated(&self, item: WorkItem) -> Result<Option<WorkItem>, StoreError> {
        if item.schedule_id.is_none() {
            return self.insert(item).await.map(Some);
        }
        let mut qb = insert_statement(&item)?;
        // Must match the predicate of work_queue_pending_schedule_idx.
        qb.push(
            " ON CONFLICT (schedule_id) \
             WHERE schedule_id IS NOT NULL AND finished IS NULL AND deleted IS NULL \
             DO NOTHING",
        );
        qb.push(" RETURNING *");
        self.fetch_optional_item("insert_deduplicated", qb).await
    }

    #[instrument(skip(self), err)]
    async fn get(&self, id: WorkId) -> Result<Option<WorkItem>, StoreError> {
        let row = sqlx::query_as::<_, WorkRow>("SELECT * FROM work_queue WHERE id = $1")
            .bind(*id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.map(WorkItem::try_from).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list(
        &self,
        selector: &WorkSelector,
        sort: WorkSort,
        skip: usize,
        limit: Option<usize>,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let mut qb = QueryBuilder::new("SELECT * FROM work_queue WHERE TRUE");
        push_selector(&mut qb, selector);
        qb.push(match sort {
            WorkSort::Queue => {
                " ORDER BY started DESC NULLS FIRST, priority DESC, \
                 original_work_id ASC NULLS FIRST, created ASC, id ASC"
            }
            WorkSort::Allocation => " ORDER BY priority DESC, created ASC, id ASC",
            WorkSort::Scheduled => " ORDER BY scheduled ASC, created ASC, id ASC",
        });
        if let Some(limit) = limit {
            qb.push(" LIMIT ").push_bind(to_i64(limit));
        }
        qb.push(" OFFSET ").push_bind(to_i64(skip));
        self.fetch_items("list", qb).await
    }

    #[instrument(skip(self), err)]
    async fn count(&self, selector: &WorkSelector) -> Result<u64, StoreError> {
        let mut qb = QueryBuilder::new("SELECT COUNT(*) AS total FROM work_queue WHERE TRUE");
        push_selector(&mut qb, selector);
        let row = qb
            .build()
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count", e))?;
        let total: i64 = row
            .try_get("total")
            .map_err(|e| StoreError::Serialization(format!("failed to read count: {e}")))?;
        Ok(total.max(0) as u64)
    }

    #[instrument(skip(self), err)]
    async fn distinct_types(&self, selector: &WorkSelector) -> Result<Vec<String>, StoreError> {
        let mut qb = QueryBuilder::new("SELECT DISTINCT work_type FROM work_queue WHERE TRUE");
        push_selector(&mut qb, selector);
        qb.push(" ORDER BY work_type");
        let rows = qb
            .build()
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("distinct_types", e))?;
        rows.iter()
            .map(|row| {
                row.try_get::<String, _>("work_type")
                    .map_err(|e| StoreError::Serialization(format!("failed to read work_type: {e}")))
            })
            .collect()
    }

    #[instrument(skip(self, patch), err)]
    async fn update(
        &self,
        id: WorkId,
        guard: &WorkSelector,
        patch: WorkPatch,
    ) -> Result<Option<WorkItem>, StoreError> {
        let mut qb = QueryBuilder::new("UPDATE work_queue SET scheduled = COALESCE(");
        qb.push_bind(patch.scheduled)
            .push(", scheduled), started = COALESCE(")
            .push_bind(patch.started)
            .push(", started), finished = COALESCE(")
            .push_bind(patch.finished)
            .push(", finished), success = COALESCE(")
            .push_bind(patch.success)
            .push(", success), result = COALESCE(")
            .push_bind(patch.result)
            .push(", result), error = COALESCE(")
            .push_bind(patch.error)
            .push(", error), worker = COALESCE(")
            .push_bind(patch.worker)
            .push(", worker), deleted = COALESCE(")
            .push_bind(patch.deleted)
            .push(", deleted) WHERE id = ")
            .push_bind(*id.as_uuid());
        push_selector(&mut qb, guard);
        qb.push(" RETURNING *");
        self.fetch_optional_item("update", qb).await
    }

    #[instrument(skip(self), fields(worker = %allocation.worker), err)]
    async fn allocate_atomic(
        &self,
        selector: &WorkSelector,
        allocation: Allocation,
    ) -> Result<Option<WorkItem>, StoreError> {
        let mut qb = QueryBuilder::new("UPDATE work_queue SET started = ");
        qb.push_bind(allocation.started)
            .push(", worker = ")
            .push_bind(allocation.worker)
            .push(" WHERE id = (SELECT id FROM work_queue WHERE ")
            .push(NEW_CONDITION);
        push_selector(&mut qb, selector);
        qb.push(
            " ORDER BY priority DESC, created ASC, id ASC LIMIT 1 FOR UPDATE SKIP LOCKED) \
             AND started IS NULL RETURNING *",
        );
        self.fetch_optional_item("allocate_atomic", qb).await
    }

    #[instrument(skip(self), err)]
    async fn purge_created_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let done = sqlx::query("DELETE FROM work_queue WHERE created < $1")
            .bind(cutoff)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("purge_created_before", e))?;
        Ok(done.rows_affected())
    }
}

fn insert_statement(item: &WorkItem) -> Result<QueryBuilder<'static, Postgres>, StoreError> {
    let retries = i32::try_from(item.retries)
        .map_err(|_| StoreError::Serialization(format!("retries out of range: {}", item.retries)))?;
    let timeout_ms = item
        .timeout
        .map(|t| i64::try_from(t.as_millis()))
        .transpose()
        .map_err(|_| StoreError::Serialization("timeout out of range".to_string()))?;

    let mut qb = QueryBuilder::new(
        "INSERT INTO work_queue (id, work_type, input, priority, scheduled, started, finished, \
         success, result, error, retries, original_work_id, worker, timeout_ms, schedule_id, \
         created, deleted) ",
    );
    qb.push_values([item], |mut row, item| {
        row.push_bind(*item.id.as_uuid())
            .push_bind(item.work_type.clone())
            .push_bind(item.input.clone())
            .push_bind(item.priority)
            .push_bind(item.scheduled)
            .push_bind(item.started)
            .push_bind(item.finished)
            .push_bind(item.success)
            .push_bind(item.result.clone())
            .push_bind(item.error.clone())
            .push_bind(retries)
            .push_bind(item.original_work_id.map(|id| *id.as_uuid()))
            .push_bind(item.worker.clone())
            .push_bind(timeout_ms)
            .push_bind(item.schedule_id.clone())
            .push_bind(item.created)
            .push_bind(item.deleted);
    });
    Ok(qb)
}

fn status_condition(status: WorkStatus) -> &'static str {
    match status {
        WorkStatus::New => "(deleted IS NULL AND started IS NULL AND finished IS NULL)",
        WorkStatus::Allocated => "(deleted IS NULL AND started IS NOT NULL AND finished IS NULL)",
        WorkStatus::Success => {
            "(deleted IS NULL AND started IS NOT NULL AND finished IS NOT NULL AND success IS TRUE)"
        }
        WorkStatus::Failed => {
            "(deleted IS NULL AND started IS NOT NULL AND finished IS NOT NULL AND success IS NOT TRUE)"
        }
        WorkStatus::Deleted => "(deleted IS NOT NULL)",
    }
}

/// Append `AND ...` clauses for every criterion set on `selector`.
fn push_selector(qb: &mut QueryBuilder<'_, Postgres>, selector: &WorkSelector) {
    if !selector.ids.is_empty() {
        let ids: Vec<uuid::Uuid> = selector.ids.iter().map(|id| *id.as_uuid()).collect();
        qb.push(" AND id = ANY(").push_bind(ids).push(")");
    }
    if !selector.statuses.is_empty() {
        let conditions: Vec<&str> = selector.statuses.iter().map(|s| status_condition(*s)).collect();
        qb.push(" AND (").push(conditions.join(" OR ")).push(")");
    }
    if selector.in_flight {
        qb.push(" AND started IS NOT NULL AND finished IS NULL");
    }
    if let Some(types) = &selector.types {
        if types.is_empty() {
            qb.push(" AND FALSE");
        } else {
            qb.push(" AND work_type = ANY(").push_bind(types.clone()).push(")");
        }
    }
    match &selector.worker {
        WorkerFilter::Any => {}
        WorkerFilter::Unassigned => {
            qb.push(" AND worker IS NULL");
        }
        WorkerFilter::Exactly(worker) => {
            qb.push(" AND worker = ").push_bind(worker.clone());
        }
        WorkerFilter::UnassignedOr(worker) => {
            qb.push(" AND (worker IS NULL OR worker = ")
                .push_bind(worker.clone())
                .push(")");
        }
    }
    if let Some(until) = selector.scheduled_until {
        qb.push(" AND scheduled <= ").push_bind(until);
    }
    if let Some(before) = selector.started_before {
        qb.push(" AND started < ").push_bind(before);
    }
    if let Some(after) = selector.created_after {
        qb.push(" AND created >= ").push_bind(after);
    }
    if let Some(before) = selector.created_before {
        qb.push(" AND created < ").push_bind(before);
    }
    if let Some(schedule_id) = &selector.schedule_id {
        qb.push(" AND schedule_id = ").push_bind(schedule_id.clone());
    }
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Map SQLx errors to StoreError with context.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") | Some("23514") => StoreError::Conflict(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::Decode(e) => {
            StoreError::Serialization(format!("decode error in {}: {}", operation, e))
        }
        sqlx::Error::ColumnDecode { index, source } => StoreError::Serialization(format!(
            "column {} decode error in {}: {}",
            index, operation, source
        )),
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

// SQLx row types

#[derive(Debug)]
struct WorkRow {
    id: uuid::Uuid,
    work_type: String,
    input: serde_json::Value,
    priority: i32,
    scheduled: DateTime<Utc>,
    started: Option<DateTime<Utc>>,
    finished: Option<DateTime<Utc>>,
    success: Option<bool>,
    result: Option<serde_json::Value>,
    error: Option<serde_json::Value>,
    retries: i32,
    original_work_id: Option<uuid::Uuid>,
    worker: Option<String>,
    timeout_ms: Option<i64>,
    schedule_id: Option<String>,
    created: DateTime<Utc>,
    deleted: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for WorkRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(WorkRow {
            id: row.try_get("id")?,
            work_type: row.try_get("work_type")?,
            input: row.try_get("input")?,
            priority: row.try_get("priority")?,
            scheduled: row.try_get("scheduled")?,
            started: row.try_get("started")?,
            finished: row.try_get("finished")?,
            success: row.try_get("success")?,
            result: row.try_get("result")?,
            error: row.try_get("error")?,
            retries: row.try_get("retries")?,
            original_work_id: row.try_get("original_work_id")?,
            worker: row.try_get("worker")?,
            timeout_ms: row.try_get("timeout_ms")?,
            schedule_id: row.try_get("schedule_id")?,
            created: row.try_get("created")?,
            deleted: row.try_get("deleted")?,
        })
    }
}

impl TryFrom<WorkRow> for WorkItem {
    type Error = StoreError;

    fn try_from(row: WorkRow) -> Result<Self, Self::Error> {
        let retries = u32::try_from(row.retries).map_err(|_| {
            StoreError::Serialization(format!("negative retries on {}: {}", row.id, row.retries))
        })?;
        let timeout = row
            .timeout_ms
            .map(|ms| u64::try_from(ms).map(Duration::from_millis))
            .transpose()
            .map_err(|_| StoreError::Serialization(format!("negative timeout on {}", row.id)))?;

        Ok(WorkItem {
            id: WorkId::from_uuid(row.id),
            work_type: row.work_type,
            input: row.input,
            priority: row.priority,
            scheduled: row.scheduled,
            started: row.started,
            finished: row.finished,
            success: row.success,
            result: row.result,
            error: row.error,
            retries,
            original_work_id: row.original_work_id.map(WorkId::from_uuid),
            worker: row.worker,
            timeout,
            schedule_id: row.schedule_id,
            created: row.created,
            deleted: row.deleted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_renders_clauses() {
        let selector = WorkSelector {
            statuses: vec![WorkStatus::New, WorkStatus::Deleted],
            types: Some(vec!["sms".into()]),
            worker: WorkerFilter::UnassignedOr("w1".into()),
            scheduled_until: Some(Utc::now()),
            ..WorkSelector::default()
        };
        let mut qb = QueryBuilder::<Postgres>::new("SELECT * FROM work_queue WHERE TRUE");
        push_selector(&mut qb, &selector);
        let sql = qb.sql();

        assert!(sql.contains("(deleted IS NOT NULL)"));
        assert!(sql.contains(" OR "));
        assert!(sql.contains("work_type = ANY($1)"));
        assert!(sql.contains("(worker IS NULL OR worker = $2)"));
        assert!(sql.contains("scheduled <= $3"));
    }

    #[test]
    fn empty_type_list_renders_false() {
        let selector = WorkSelector::default().with_types(Vec::<String>::new());
        let mut qb = QueryBuilder::<Postgres>::new("SELECT * FROM work_queue WHERE TRUE");
        push_selector(&mut qb, &selector);
        assert!(qb.sql().ends_with(" AND FALSE"));
    }

    #[test]
    fn schema_carries_dedup_index() {
        assert!(SCHEMA.contains("work_queue_pending_schedule_idx"));
        assert!(SCHEMA.contains("WHERE schedule_id IS NOT NULL AND finished IS NULL AND deleted IS NULL"));
    }

    #[test]
    fn rejects_negative_retries() {
        let now = Utc::now();
        let row = WorkRow {
            id: uuid::Uuid::now_v7(),
            work_type: "a".into(),
            input: serde_json::Value::Null,
            priority: 0,
            scheduled: now,
            started: None,
            finished: None,
            success: None,
            result: None,
            error: None,
            retries: -1,
            original_work_id: None,
            worker: None,
            timeout_ms: Some(1500),
            schedule_id: None,
            created: now,
            deleted: None,
        };
        assert!(matches!(WorkItem::try_from(row), Err(StoreError::Serialization(_))));
    }
}
