//! Infrastructure layer: work store, director, scheduling and worker loops.

pub mod autoscheduler;
pub mod config;
pub mod cron;
pub mod director;
pub mod registry;
pub mod rescheduler;
pub mod retention;
pub mod store;
pub mod workers;


pub use autoscheduler::{AutoScheduleEntry, AutoscheduleError, Autoscheduler};
pub use config::{ConfigError, SchedulerConfig, Strategy};
pub use cron::{CronExpr, CronParseError};
pub use director::{Director, DirectorError, FinishWork, WorkerScope};
pub use registry::{AdapterOptions, AdapterRegistry, TypeFilter, WorkAdapter};
pub use rescheduler::{BackoffPolicy, FailureRescheduler};
pub use retention::RetentionSweeper;
pub use store::{
    InMemoryWorkStore, Pagination, PostgresWorkStore, StoreError, WorkQuery, WorkStats, WorkStore,
};
pub use workers::{CronWorker, DrainLoop, EventListenerWorker, IntervalWorker, WorkerHandle};
