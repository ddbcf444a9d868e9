//! Work-queue error model.

use chrono::{DateTime, Utc};
use serde_json::{Value as JsonValue, json};
use thiserror::Error;

use crate::id::WorkId;

/// Result type used across the work domain.
pub type WorkResult<T> = Result<T, WorkError>;

/// Work-level error.
///
/// Only `DuplicateType`, `UnknownType` and `Validation` are ever returned to callers.
/// The remaining variants describe failed executions and end up as the `error`
/// payload of a FAILED work item (see [`WorkError::to_payload`]).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorkError {
    /// An adapter is already registered for this work type.
    #[error("an adapter for work type '{0}' is already registered")]
    DuplicateType(String),

    /// Work was submitted for a type nobody handles.
    #[error("no adapter registered for work type '{0}'")]
    UnknownType(String),

    /// An allocated item's type has no adapter (anymore).
    #[error("no adapter available to execute work type '{0}'")]
    NoAdapter(String),

    /// The type's completion is reported from outside the scheduler, so it is never
    /// executed locally.
    #[error("work type '{0}' is external and cannot be executed locally")]
    ExternalType(String),

    /// The handler failed or panicked.
    #[error("handler failed: {0}")]
    Handler(String),

    /// The owning worker restarted while the item was still allocated.
    #[error("work {work_id} was still allocated to '{worker}' at {reference}")]
    OrphanedAllocation {
        work_id: WorkId,
        worker: String,
        reference: DateTime<Utc>,
    },

    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),
}

impl WorkError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn handler(msg: impl Into<String>) -> Self {
        Self::Handler(msg.into())
    }

    /// Stable error name recorded in persisted payloads.
    pub fn name(&self) -> &'static str {
        match self {
            WorkError::DuplicateType(_) => "DuplicateTypeError",
            WorkError::UnknownType(_) => "UnknownTypeError",
            WorkError::NoAdapter(_) => "NoAdapterError",
            WorkError::ExternalType(_) => "ExternalTypeError",
            WorkError::Handler(_) => "HandlerError",
            WorkError::OrphanedAllocation { .. } => "OrphanedAllocationError",
            WorkError::Validation(_) => "ValidationError",
        }
    }

    /// Convert into the opaque `error` payload stored on a work item.
    pub fn to_payload(&self) -> JsonValue {
        json!({
            "name": self.name(),
            "message": self.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_carries_name_and_message() {
        let payload = WorkError::NoAdapter("sms".into()).to_payload();
        assert_eq!(payload["name"], "NoAdapterError");
        assert_eq!(
            payload["message"],
            "no adapter available to execute work type 'sms'"
        );
    }

    #[test]
    fn orphaned_allocation_mentions_worker() {
        let err = WorkError::OrphanedAllocation {
            work_id: WorkId::new(),
            worker: "worker-a".into(),
            reference: Utc::now(),
        };
        assert_eq!(err.name(), "OrphanedAllocationError");
        assert!(err.to_string().contains("worker-a"));
    }

    #[test]
    fn external_type_payload() {
        let payload = WorkError::ExternalType("webhook".into()).to_payload();
        assert_eq!(payload["name"], "ExternalTypeError");
        assert!(payload["message"].as_str().unwrap().contains("webhook"));
    }
}
