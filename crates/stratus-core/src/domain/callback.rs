//! Service task callbacks: how a child task notifies its parent.
//!
//! A callback is a value created by the parent when it spawns a child,
//! embedded in the child's creation request and never mutated afterwards.
//! It carries the target link plus the `(stage, sub_stage)` pair to patch
//! the target with on success and on failure. Children never throw across
//! a process boundary; failure always becomes a terminal document state
//! plus (optionally) this notification patch.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;

use super::link::DocumentLink;
use super::stage::{FailureInfo, TaskStage};

/// A `(stage, sub_stage-name)` pair the callback patches the target with.
///
/// The sub-stage is carried by name because the callback crosses workflow
/// boundaries: the child does not know the parent's sub-stage enum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackTarget {
    pub stage: TaskStage,
    pub sub_stage: String,
}

impl CallbackTarget {
    pub fn new(stage: TaskStage, sub_stage: impl Into<String>) -> Self {
        Self {
            stage,
            sub_stage: sub_stage.into(),
        }
    }
}

/// Where and how to report a task's outcome to its creator.
///
/// An empty callback (no target link) marks a top-level task: its outcome
/// is only observable by polling the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceTaskCallback {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_link: Option<DocumentLink>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_finished: Option<CallbackTarget>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failed: Option<CallbackTarget>,

    /// Extra properties the parent wants echoed back in every response.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_properties: BTreeMap<String, String>,
}

impl ServiceTaskCallback {
    pub fn empty() -> Self {
        Self {
            target_link: None,
            on_finished: None,
            on_failed: None,
            custom_properties: BTreeMap::new(),
        }
    }

    /// Callback notifying `target` mid-flow: success and failure each land
    /// on a declared `(stage, sub_stage)` of the parent's state machine.
    pub fn new(
        target: DocumentLink,
        on_finished: CallbackTarget,
        on_failed: CallbackTarget,
    ) -> Self {
        Self {
            target_link: Some(target),
            on_finished: Some(on_finished),
            on_failed: Some(on_failed),
            custom_properties: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.target_link.is_none()
    }

    /// Build the success-path patch body. `extra` carries workflow response
    /// payload fields and is merged at the top level of the patch.
    pub fn finished_response(&self, extra: Value) -> Value {
        let target = self
            .on_finished
            .clone()
            .unwrap_or_else(|| CallbackTarget::new(TaskStage::Finished, "COMPLETED"));
        Self::response(target, None, &self.custom_properties, extra)
    }

    /// Build the failure-path patch body carrying the failure cause.
    pub fn failed_response(&self, failure: FailureInfo, extra: Value) -> Value {
        let target = self
            .on_failed
            .clone()
            .unwrap_or_else(|| CallbackTarget::new(TaskStage::Failed, "ERROR"));
        Self::response(target, Some(failure), &self.custom_properties, extra)
    }

    fn response(
        target: CallbackTarget,
        failure: Option<FailureInfo>,
        custom_properties: &BTreeMap<String, String>,
        extra: Value,
    ) -> Value {
        let mut body = json!({
            "task_info": {
                "stage": target.stage,
                "failure": failure,
            },
            "sub_stage": target.sub_stage,
            "custom_properties": custom_properties,
        });
        if let (Some(obj), Value::Object(extra)) = (body.as_object_mut(), extra) {
            for (k, v) in extra {
                obj.insert(k, v);
            }
        }
        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_callback_has_no_target() {
        assert!(ServiceTaskCallback::empty().is_empty());
    }

    #[test]
    fn finished_response_carries_declared_pair_and_extras() {
        let cb = ServiceTaskCallback::new(
            DocumentLink::from_path("/tasks/parent/1"),
            CallbackTarget::new(TaskStage::Started, "START_ALLOCATION"),
            CallbackTarget::new(TaskStage::Started, "ERROR"),
        );
        let body = cb.finished_response(json!({"selected_links": ["/r/a"]}));
        assert_eq!(body["task_info"]["stage"], "STARTED");
        assert_eq!(body["sub_stage"], "START_ALLOCATION");
        assert_eq!(body["selected_links"][0], "/r/a");
        assert!(body["task_info"]["failure"].is_null());
    }

    #[test]
    fn failed_response_carries_failure() {
        let cb = ServiceTaskCallback::new(
            DocumentLink::from_path("/tasks/parent/1"),
            CallbackTarget::new(TaskStage::Started, "NEXT"),
            CallbackTarget::new(TaskStage::Started, "ERROR"),
        );
        let body = cb.failed_response(FailureInfo::new("boom"), json!({}));
        assert_eq!(body["sub_stage"], "ERROR");
        assert_eq!(body["task_info"]["failure"]["message"], "boom");
    }
}
