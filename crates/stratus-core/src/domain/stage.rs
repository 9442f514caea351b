//! Task lifecycle stages and workflow sub-stages.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt::Debug;

/// Overall lifecycle stage of a task document.
///
/// Transitions only move forward by ordinal; `Finished`, `Failed` and
/// `Cancelled` are terminal. Within `Started` the workflow-specific
/// sub-stage advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStage {
    Created,
    Started,
    Finished,
    Failed,
    Cancelled,
}

impl TaskStage {
    pub fn ordinal(self) -> u32 {
        match self {
            TaskStage::Created => 0,
            TaskStage::Started => 1,
            TaskStage::Finished => 2,
            TaskStage::Failed => 3,
            TaskStage::Cancelled => 4,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStage::Finished | TaskStage::Failed | TaskStage::Cancelled
        )
    }
}

/// Structured failure cause recorded on a failed task.
///
/// Only message strings and an optional machine-checkable error code cross
/// the document schema; internal error types never leak.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<FailureInfo>>,
}

impl FailureInfo {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_code: None,
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: FailureInfo) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn with_error_code(mut self, code: i32) -> Self {
        self.error_code = Some(code);
        self
    }
}

/// Lifecycle stage plus optional failure cause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub stage: TaskStage,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureInfo>,
}

impl TaskInfo {
    pub fn at(stage: TaskStage) -> Self {
        Self {
            stage,
            failure: None,
        }
    }

    pub fn failed(failure: FailureInfo) -> Self {
        Self {
            stage: TaskStage::Failed,
            failure: Some(failure),
        }
    }
}

/// Workflow-specific sub-stage enum.
///
/// Every workflow declares an ordered enum with a designated initial value
/// and two terminal values (completed, error). Progress is monotonic by
/// ordinal; the error value is reachable from any sub-stage and absorbing.
///
/// Transient sub-stages represent in-flight parallel work: they are never
/// surfaced as the externally visible "current" sub-stage, and a late patch
/// into one (after the fan-in already advanced the task) is a no-op instead
/// of an error.
pub trait SubStage:
    Copy + Eq + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    fn ordinal(self) -> u32;

    /// Total number of variants, used for progress reporting.
    fn variant_count() -> u32;

    fn initial() -> Self;
    fn completed() -> Self;
    fn error() -> Self;

    fn is_transient(self) -> bool {
        false
    }

    /// Sub-stages where extensibility hooks get a chance to amend the
    /// continuation patch before the task proceeds.
    fn is_subscription_point(self) -> bool {
        false
    }

    /// Serialized name, as it appears in callback targets and status views.
    fn name(self) -> String {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::String(s)) => s,
            _ => format!("{self:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
    enum Stageling {
        Created,
        Working,
        Completed,
        Error,
    }

    impl SubStage for Stageling {
        fn ordinal(self) -> u32 {
            self as u32
        }

        fn variant_count() -> u32 {
            4
        }

        fn initial() -> Self {
            Stageling::Created
        }

        fn completed() -> Self {
            Stageling::Completed
        }

        fn error() -> Self {
            Stageling::Error
        }
    }

    #[test]
    fn stage_ordinals_are_ordered() {
        assert!(TaskStage::Created.ordinal() < TaskStage::Started.ordinal());
        assert!(TaskStage::Started.ordinal() < TaskStage::Finished.ordinal());
        assert!(!TaskStage::Started.is_terminal());
        assert!(TaskStage::Failed.is_terminal());
    }

    #[test]
    fn stage_serializes_screaming() {
        let s = serde_json::to_string(&TaskStage::Started).unwrap();
        assert_eq!(s, "\"STARTED\"");
    }

    #[test]
    fn sub_stage_name_matches_serde() {
        assert_eq!(Stageling::Working.name(), "WORKING");
        assert_eq!(Stageling::error().name(), "ERROR");
    }

    #[test]
    fn failure_info_nests_causes() {
        let f = FailureInfo::new("outer").with_cause(FailureInfo::new("inner"));
        assert_eq!(f.cause.unwrap().message, "inner");
    }
}
