//! `forgequeue-core`: work-queue domain building blocks.
//!
//! This crate contains the **pure** work model (no storage, no runtime): identifiers,
//! the `WorkItem` record, its derived `WorkStatus`, handler outputs and the error taxonomy.

pub mod error;
pub mod id;
pub mod output;
pub mod work;

pub use error::{WorkError, WorkResult};
pub use id::WorkId;
pub use output::WorkOutput;
pub use work::{NewWork, WorkItem, WorkStatus};
