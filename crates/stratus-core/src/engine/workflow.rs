//! The TaskWorkflow trait: what a concrete task contributes to the engine.

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::domain::{DocumentLink, Mergeable, SubStage, TaskStage, TaskState};
use crate::engine::host::ServiceHost;
use crate::error::EngineError;

/// What a step handler tells the engine to do next.
#[derive(Debug, Clone)]
pub enum StepAction<S, P> {
    /// Patch the task forward and run the next step.
    Proceed {
        stage: TaskStage,
        sub_stage: S,
        payload: P,
        custom_properties: BTreeMap<String, String>,
    },

    /// Fan-out is outstanding; a callback patch will advance the task.
    AwaitCallbacks,
}

impl<S: SubStage, P> StepAction<S, P> {
    /// Stay `STARTED`, move to `sub_stage`, merging `payload`.
    pub fn proceed(sub_stage: S, payload: P) -> Self {
        StepAction::Proceed {
            stage: TaskStage::Started,
            sub_stage,
            payload,
            custom_properties: BTreeMap::new(),
        }
    }

    /// Terminal success: `FINISHED` at the completed sub-stage.
    pub fn complete(payload: P) -> Self {
        StepAction::Proceed {
            stage: TaskStage::Finished,
            sub_stage: S::completed(),
            payload,
            custom_properties: BTreeMap::new(),
        }
    }

    pub fn with_custom_property(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        if let StepAction::Proceed {
            custom_properties, ..
        } = &mut self
        {
            custom_properties.insert(key.into(), value.into());
        }
        self
    }
}

/// One concrete task: a sub-stage enum, a payload, and a handler per step.
///
/// Handlers must be idempotent: the engine re-runs the current step on
/// duplicate delivery, so "do X" means "ensure X is done". A handler
/// failure (error or panic) fails the task document; it never unwinds
/// further.
#[async_trait]
pub trait TaskWorkflow: Send + Sync + 'static {
    type SubStage: SubStage;
    type Payload: Mergeable
        + Serialize
        + DeserializeOwned
        + Clone
        + Default
        + Send
        + Sync
        + 'static;

    /// Factory path; document links for this task live under it.
    const FACTORY: &'static str;

    /// Human-readable name, shown in status views and logs.
    const DISPLAY_NAME: &'static str;

    /// Delete the document once the task reaches a terminal stage.
    const SELF_DELETE: bool = false;

    /// Synchronous validation of the creation payload. An error here
    /// rejects the request; nothing is persisted.
    fn validate_initial(&self, payload: &Self::Payload) -> Result<(), EngineError>;

    /// Run the step for the task's current sub-stage.
    async fn handle_sub_stage(
        &self,
        host: &Arc<ServiceHost>,
        link: &DocumentLink,
        state: &TaskState<Self::SubStage, Self::Payload>,
    ) -> Result<StepAction<Self::SubStage, Self::Payload>, EngineError>;

    /// Extra fields for the parent notification once this task finishes.
    fn finished_response(&self, _state: &TaskState<Self::SubStage, Self::Payload>) -> Value {
        json!({})
    }

    /// Resource links for the status view, when the payload tracks any.
    fn status_resource_links(
        &self,
        _state: &TaskState<Self::SubStage, Self::Payload>,
    ) -> Option<Vec<DocumentLink>> {
        None
    }
}
