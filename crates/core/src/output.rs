//! Raw handler outcome.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::WorkError;

/// What an adapter reports after executing a work item.
///
/// `result` and `error` are mutually exclusive in practice but both are kept
/// optional so external reporters can attach diagnostic data to successes too.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkOutput {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonValue>,
}

impl WorkOutput {
    pub fn success(result: JsonValue) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(error: JsonValue) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error),
        }
    }

    /// A failed outcome carrying a taxonomy error as payload.
    pub fn from_error(error: &WorkError) -> Self {
        Self::failure(error.to_payload())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_from_error_has_no_result() {
        let out = WorkOutput::from_error(&WorkError::handler("boom"));
        assert!(!out.success);
        assert!(out.result.is_none());
        assert_eq!(out.error.unwrap()["name"], "HandlerError");
    }

    #[test]
    fn absent_fields_are_skipped_on_the_wire() {
        let out = WorkOutput::success(serde_json::json!({"v": 1}));
        let wire = serde_json::to_value(&out).unwrap();
        assert_eq!(wire, serde_json::json!({"success": true, "result": {"v": 1}}));
    }
}
