//! TaskService: drives one workflow's documents through the state machine.

use async_trait::async_trait;
use chrono::Duration;
use futures::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::domain::{
    DocumentLink, FailureInfo, Mergeable, SubStage, TaskCreate, TaskInfo, TaskPatch, TaskStage,
    TaskState, TaskStatus,
};
use crate::engine::host::ServiceHost;
use crate::engine::workflow::{StepAction, TaskWorkflow};
use crate::error::EngineError;
use crate::ports::Document;

/// Tasks without an explicit expiration get this long to finish.
const DEFAULT_EXPIRATION_MINUTES: i64 = 60;

/// Object-safe face of a task service, so the host can route patches by
/// link prefix without knowing the workflow's generic types.
#[async_trait]
pub trait DynTaskService: Send + Sync {
    fn factory(&self) -> &'static str;

    /// Validate and persist a new task, then start it asynchronously.
    async fn handle_create(
        &self,
        host: &Arc<ServiceHost>,
        body: Value,
    ) -> Result<DocumentLink, EngineError>;

    /// Validate, merge and persist a patch, then dispatch the next step.
    async fn handle_patch(
        &self,
        host: &Arc<ServiceHost>,
        link: &DocumentLink,
        body: Value,
    ) -> Result<(), EngineError>;

    async fn status(
        &self,
        host: &Arc<ServiceHost>,
        link: &DocumentLink,
    ) -> Result<TaskStatus, EngineError>;
}

pub struct TaskService<W: TaskWorkflow> {
    workflow: W,
}

impl<W: TaskWorkflow> TaskService<W> {
    pub fn new(workflow: W) -> Self {
        Self { workflow }
    }

    /// Validate the transition, merge the patch, persist under optimistic
    /// concurrency. `Ok(None)` means the patch was a benign no-op
    /// (duplicate failure, late arrival after the task moved on).
    async fn apply_patch(
        &self,
        host: &Arc<ServiceHost>,
        link: &DocumentLink,
        patch: TaskPatch<W::SubStage, W::Payload>,
    ) -> Result<Option<TaskState<W::SubStage, W::Payload>>, EngineError> {
        loop {
            let doc = host.store().get(link).await?;
            let mut state: TaskState<W::SubStage, W::Payload> =
                serde_json::from_value(doc.body)?;

            if let Some(exp) = state.expiration
                && exp <= host.clock().now()
            {
                self.abandon(host, link, &state).await?;
                return Ok(None);
            }

            let current = state.task_info.stage;
            let incoming = patch.task_info.stage;

            // A failure patch against an already failed task is the
            // at-least-once path reporting the same failure twice.
            if incoming == TaskStage::Failed && current == TaskStage::Failed {
                debug!(task = %link, "duplicate failure patch, ignoring");
                return Ok(None);
            }
            if incoming.ordinal() < current.ordinal() {
                if current.is_terminal() {
                    debug!(task = %link, ?current, ?incoming, "late patch after terminal stage, ignoring");
                    return Ok(None);
                }
                return Err(EngineError::InvalidTransition {
                    from: format!("{current:?}"),
                    to: format!("{incoming:?}"),
                });
            }
            if incoming == current && patch.sub_stage.ordinal() < state.sub_stage.ordinal() {
                // A transient sub-stage losing the race against its own
                // fan-in is expected; anything else moved backwards.
                if patch.sub_stage.is_transient() {
                    debug!(task = %link, "late transient patch, ignoring");
                    return Ok(None);
                }
                return Err(EngineError::InvalidTransition {
                    from: state.sub_stage.name(),
                    to: patch.sub_stage.name(),
                });
            }

            let previous_sub = state.sub_stage;
            state.absorb(patch.clone());

            if state.sub_stage != previous_sub && state.sub_stage.is_subscription_point() {
                let snapshot = serde_json::to_value(&state)?;
                let amendments = host
                    .subscriptions()
                    .amendments(W::FACTORY, &state.sub_stage.name(), &snapshot)
                    .await?;
                for amendment in amendments {
                    let overlay: W::Payload = serde_json::from_value(amendment)?;
                    state.payload.apply_override(overlay);
                }
            }

            let body = serde_json::to_value(&state)?;
            match host.store().update(link, doc.version, body).await {
                Ok(_) => {
                    info!(
                        task = %link,
                        workflow = W::DISPLAY_NAME,
                        stage = ?state.task_info.stage,
                        sub_stage = %state.sub_stage.name(),
                        "transition applied"
                    );
                    return Ok(Some(state));
                }
                Err(EngineError::VersionConflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Dispatch loop: run step handlers until the task awaits a callback
    /// or reaches a terminal stage.
    async fn after_transition(
        &self,
        host: &Arc<ServiceHost>,
        link: &DocumentLink,
        mut state: TaskState<W::SubStage, W::Payload>,
    ) -> Result<(), EngineError> {
        loop {
            match state.task_info.stage {
                TaskStage::Created => return Ok(()),
                TaskStage::Started => {
                    // A callback may land on the error sub-stage while the
                    // stage is still STARTED; that is a failure, not a step.
                    if state.sub_stage == W::SubStage::error() {
                        let failure = state
                            .task_info
                            .failure
                            .clone()
                            .unwrap_or_else(|| FailureInfo::new("entered error sub-stage"));
                        return self.fail(host, link, failure).await;
                    }
                    let step = AssertUnwindSafe(self.workflow.handle_sub_stage(host, link, &state))
                        .catch_unwind()
                        .await;
                    let action = match step {
                        Err(_) => {
                            return self
                                .fail(
                                    host,
                                    link,
                                    FailureInfo::new(format!(
                                        "step handler panicked at {}",
                                        state.sub_stage.name()
                                    )),
                                )
                                .await;
                        }
                        Ok(Err(e)) => {
                            warn!(task = %link, error = %e, "step handler failed");
                            return self.fail(host, link, FailureInfo::new(e.to_string())).await;
                        }
                        Ok(Ok(action)) => action,
                    };
                    match action {
                        StepAction::AwaitCallbacks => return Ok(()),
                        StepAction::Proceed {
                            stage,
                            sub_stage,
                            payload,
                            custom_properties,
                        } => {
                            let patch = TaskPatch {
                                task_info: TaskInfo::at(stage),
                                sub_stage,
                                custom_properties,
                                payload,
                            };
                            match self.apply_patch(host, link, patch).await? {
                                Some(next) => state = next,
                                None => return Ok(()),
                            }
                        }
                    }
                }
                TaskStage::Finished | TaskStage::Failed | TaskStage::Cancelled => {
                    return self.notify_and_reap(host, link, &state).await;
                }
            }
        }
    }

    /// Move the task to `FAILED` at the error sub-stage, then notify.
    async fn fail(
        &self,
        host: &Arc<ServiceHost>,
        link: &DocumentLink,
        failure: FailureInfo,
    ) -> Result<(), EngineError> {
        let patch = TaskPatch::<W::SubStage, W::Payload>::failed(failure);
        if let Some(state) = self.apply_patch(host, link, patch).await? {
            self.notify_and_reap(host, link, &state).await?;
        }
        Ok(())
    }

    /// Terminal handling: callback to the parent, optional self-delete.
    async fn notify_and_reap(
        &self,
        host: &Arc<ServiceHost>,
        link: &DocumentLink,
        state: &TaskState<W::SubStage, W::Payload>,
    ) -> Result<(), EngineError> {
        info!(
            task = %link,
            workflow = W::DISPLAY_NAME,
            stage = ?state.task_info.stage,
            "task reached terminal stage"
        );
        if let Some(target) = state.callback.target_link.clone() {
            let extra = self.workflow.finished_response(state);
            let body = match state.task_info.stage {
                TaskStage::Finished => state.callback.finished_response(extra),
                _ => {
                    let failure = state
                        .task_info
                        .failure
                        .clone()
                        .unwrap_or_else(|| FailureInfo::new("task did not finish"));
                    state.callback.failed_response(failure, extra)
                }
            };
            host.spawn_patch(target, body);
        }
        if W::SELF_DELETE {
            host.store().delete(link).await?;
        }
        Ok(())
    }

    /// An expired task is torn down and its parent told it never finished.
    async fn abandon(
        &self,
        host: &Arc<ServiceHost>,
        link: &DocumentLink,
        state: &TaskState<W::SubStage, W::Payload>,
    ) -> Result<(), EngineError> {
        warn!(task = %link, workflow = W::DISPLAY_NAME, "task expired, abandoning");
        if let Some(target) = state.callback.target_link.clone() {
            let body = state
                .callback
                .failed_response(FailureInfo::new("task expired"), Value::Null);
            host.spawn_patch(target, body);
        }
        host.store().delete(link).await
    }
}

#[async_trait]
impl<W: TaskWorkflow> DynTaskService for TaskService<W> {
    fn factory(&self) -> &'static str {
        W::FACTORY
    }

    async fn handle_create(
        &self,
        host: &Arc<ServiceHost>,
        body: Value,
    ) -> Result<DocumentLink, EngineError> {
        let create: TaskCreate<W::Payload> = serde_json::from_value(body)?;
        self.workflow.validate_initial(&create.payload)?;

        let mut state = TaskState::<W::SubStage, W::Payload>::created(create.payload);
        if let Some(callback) = create.callback {
            state.callback = callback;
        }
        state.custom_properties = create.custom_properties;
        state.tenant_links = create.tenant_links;
        state.request_tracker_link = create.request_tracker_link;
        state.expiration = Some(create.expiration.unwrap_or_else(|| {
            host.clock().now() + Duration::minutes(DEFAULT_EXPIRATION_MINUTES)
        }));

        let link = DocumentLink::mint(W::FACTORY);
        host.store()
            .create(Document {
                link: link.clone(),
                kind: W::FACTORY.to_string(),
                version: 0,
                tenant_links: state.tenant_links.clone(),
                expiration: state.expiration,
                body: serde_json::to_value(&state)?,
                updated_at: host.clock().now(),
            })
            .await?;
        info!(task = %link, workflow = W::DISPLAY_NAME, "task created");

        // Self-patch to STARTED; creation returns before the first step.
        let start = TaskPatch::<W::SubStage, W::Payload>::to_sub_stage(
            TaskStage::Started,
            W::SubStage::initial(),
        );
        host.spawn_patch(link.clone(), serde_json::to_value(start)?);
        Ok(link)
    }

    async fn handle_patch(
        &self,
        host: &Arc<ServiceHost>,
        link: &DocumentLink,
        body: Value,
    ) -> Result<(), EngineError> {
        let patch: TaskPatch<W::SubStage, W::Payload> = serde_json::from_value(body)?;
        match self.apply_patch(host, link, patch).await? {
            Some(state) => self.after_transition(host, link, state).await,
            None => Ok(()),
        }
    }

    async fn status(
        &self,
        host: &Arc<ServiceHost>,
        link: &DocumentLink,
    ) -> Result<TaskStatus, EngineError> {
        let doc = host.store().get(link).await?;
        let state: TaskState<W::SubStage, W::Payload> = serde_json::from_value(doc.body)?;
        Ok(TaskStatus {
            phase: W::DISPLAY_NAME.to_string(),
            stage: state.task_info.stage,
            sub_stage: state.stable_sub_stage.name(),
            progress: TaskStatus::progress_for(state.stable_sub_stage),
            failure: state.task_info.failure.clone(),
            resource_links: self.workflow.status_resource_links(&state),
        })
    }
}
