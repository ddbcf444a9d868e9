use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use serde_json::{json, Value as JsonValue};
use sqlx::PgPool;

use forgequeue_core::WorkOutput;
use forgequeue_events::{InMemoryEventBus, WorkEvent};
use forgequeue_infra::{
    AdapterOptions, AdapterRegistry, AutoScheduleEntry, Autoscheduler, CronWorker, Director,
    DrainLoop, EventListenerWorker, FailureRescheduler, InMemoryWorkStore, IntervalWorker,
    PostgresWorkStore, RetentionSweeper, SchedulerConfig, Strategy, TypeFilter, WorkStore,
    WorkerScope,
};
use forgequeue_observability::LogFormat;

async fn heartbeat(_: JsonValue) -> anyhow::Result<WorkOutput> {
    Ok(WorkOutput::success(json!({ "at": Utc::now() })))
}

async fn echo(input: JsonValue) -> anyhow::Result<WorkOutput> {
    Ok(WorkOutput::success(input))
}

fn registry() -> anyhow::Result<Arc<AdapterRegistry>> {
    let registry = Arc::new(AdapterRegistry::new());
    registry.register_fn("heartbeat", heartbeat, AdapterOptions::default())?;
    registry.register_fn("echo", echo, AdapterOptions::default())?;
    Ok(registry)
}

async fn run<S>(store: S, config: SchedulerConfig) -> anyhow::Result<()>
where
    S: WorkStore + Clone + 'static,
{
    let registry = registry()?;
    let bus = Arc::new(InMemoryEventBus::<WorkEvent>::new());
    let director = Director::new(store.clone(), bus, Arc::clone(&registry));

    let autoscheduler = Arc::new(Autoscheduler::new(director.clone()));
    autoscheduler.configure_autoscheduling(AutoScheduleEntry::new("heartbeat", "* * * * *")?)?;

    let scope = WorkerScope::new(config.worker_id.clone(), registry.list_types(TypeFilter::LocalOnly));
    tracing::info!(worker = %scope.worker, types = ?scope.types, strategy = ?config.strategy, "starting worker");

    let drain = DrainLoop::new(director.clone(), scope)
        .with_autoscheduler(autoscheduler)
        .with_max_work_items(config.max_work_items);

    let handles = vec![
        FailureRescheduler::new(director).spawn(),
        RetentionSweeper::new(store, config.retention).spawn(config.retention_sweep_interval),
        match config.strategy {
            Strategy::Interval => IntervalWorker::spawn(drain, config.poll_interval),
            Strategy::Cron => CronWorker::spawn(drain, config.cron.clone()),
            Strategy::Event => EventListenerWorker::spawn(drain),
        },
    ];

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");

    for handle in handles {
        let name = handle.name().to_string();
        handle.shutdown().await;
        tracing::debug!(worker = %name, "stopped");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = SchedulerConfig::from_env()?;
    forgequeue_observability::init_with(LogFormat::parse(&config.log_format).unwrap_or_default());

    match config.database_url.clone() {
        Some(url) => {
            let pool = PgPool::connect(&url)
                .await
                .context("failed to connect to postgres")?;
            let store = PostgresWorkStore::new(pool);
            store.ensure_schema().await?;
            tracing::info!("using postgres work store");
            run(store, config).await
        }
        None => {
            tracing::warn!("DATABASE_URL not set; using in-memory work store");
            run(InMemoryWorkStore::arc(), config).await
        }
    }
}
