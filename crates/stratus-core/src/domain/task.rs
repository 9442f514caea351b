//! Generic task document state, creation request, patch body, status view.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::callback::ServiceTaskCallback;
use super::link::DocumentLink;
use super::merge::{Mergeable, merge_custom_properties};
use super::stage::{FailureInfo, SubStage, TaskInfo, TaskStage};

/// The persisted state of one running workflow.
///
/// `S` is the workflow's sub-stage enum; `P` its payload, flattened into the
/// document body so callback responses and patches can address payload
/// fields at the top level.
///
/// `stable_sub_stage` tracks the last non-transient sub-stage; it is what
/// external observers see while a fan-out is in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState<S, P> {
    pub task_info: TaskInfo,
    pub sub_stage: S,
    pub stable_sub_stage: S,

    pub callback: ServiceTaskCallback,

    #[serde(default)]
    pub custom_properties: BTreeMap<String, String>,

    #[serde(default)]
    pub tenant_links: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_tracker_link: Option<DocumentLink>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<DateTime<Utc>>,

    #[serde(flatten)]
    pub payload: P,
}

impl<S: SubStage, P> TaskState<S, P> {
    /// Fresh state at `CREATED` / the workflow's initial sub-stage.
    pub fn created(payload: P) -> Self {
        Self {
            task_info: TaskInfo::at(TaskStage::Created),
            sub_stage: S::initial(),
            stable_sub_stage: S::initial(),
            callback: ServiceTaskCallback::empty(),
            custom_properties: BTreeMap::new(),
            tenant_links: Vec::new(),
            request_tracker_link: None,
            expiration: None,
            payload,
        }
    }
}

/// Body of a task creation request (`POST <factory>`).
///
/// Everything except the workflow payload is optional; the engine fills in
/// defaults (empty callback, default expiration).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCreate<P> {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<ServiceTaskCallback>,

    #[serde(default)]
    pub custom_properties: BTreeMap<String, String>,

    #[serde(default)]
    pub tenant_links: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_tracker_link: Option<DocumentLink>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<DateTime<Utc>>,

    #[serde(flatten)]
    pub payload: P,
}

impl<P> TaskCreate<P> {
    pub fn new(payload: P) -> Self {
        Self {
            callback: None,
            custom_properties: BTreeMap::new(),
            tenant_links: Vec::new(),
            request_tracker_link: None,
            expiration: None,
            payload,
        }
    }

    pub fn with_callback(mut self, callback: ServiceTaskCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn with_custom_property(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.custom_properties.insert(key.into(), value.into());
        self
    }
}

/// Body of a task patch. Exactly one of these advances the state machine;
/// callback responses from children and counters deserialize into this
/// shape as well.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPatch<S, P> {
    pub task_info: TaskInfo,
    pub sub_stage: S,

    #[serde(default)]
    pub custom_properties: BTreeMap<String, String>,

    #[serde(flatten)]
    pub payload: P,
}

impl<S: SubStage, P: Default> TaskPatch<S, P> {
    pub fn to_sub_stage(stage: TaskStage, sub_stage: S) -> Self {
        Self {
            task_info: TaskInfo::at(stage),
            sub_stage,
            custom_properties: BTreeMap::new(),
            payload: P::default(),
        }
    }

    pub fn failed(failure: FailureInfo) -> Self {
        Self {
            task_info: TaskInfo::failed(failure),
            sub_stage: S::error(),
            custom_properties: BTreeMap::new(),
            payload: P::default(),
        }
    }
}

impl<S: SubStage, P: Mergeable> TaskState<S, P> {
    /// Merge a validated patch into this state: stage, sub-stage, failure,
    /// custom properties (key-wise), payload (per field policy). The caller
    /// has already decided the transition is legal.
    pub fn absorb(&mut self, patch: TaskPatch<S, P>) {
        if let Some(failure) = patch.task_info.failure {
            self.task_info.failure = Some(failure);
        }
        self.task_info.stage = patch.task_info.stage;
        self.sub_stage = patch.sub_stage;
        if !patch.sub_stage.is_transient() {
            self.stable_sub_stage = patch.sub_stage;
        }
        merge_custom_properties(&mut self.custom_properties, patch.custom_properties);
        self.payload.merge_patch(patch.payload);
    }
}

/// Externally visible snapshot of a task, suitable for polling.
///
/// `sub_stage` is always the last stable (non-transient) value; progress is
/// the stable ordinal over the number of normal sub-stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatus {
    /// Display name of the task service.
    pub phase: String,
    pub stage: TaskStage,
    pub sub_stage: String,
    pub progress: u8,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureInfo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_links: Option<Vec<DocumentLink>>,
}

impl TaskStatus {
    /// Progress percentage: stable ordinal over the count of normal
    /// sub-stages (excluding the two terminal ones), capped at 100.
    pub fn progress_for<S: SubStage>(stable: S) -> u8 {
        let normal = S::variant_count().saturating_sub(2).max(1);
        (100 * stable.ordinal() / normal).min(100) as u8
    }
}
