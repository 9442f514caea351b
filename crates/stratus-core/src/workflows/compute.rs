//! Compute workflows: allocation, provisioning, removal.
//!
//! Allocation reserves placements and creates the resource documents;
//! provisioning drives the resource adapter and verifies health; removal
//! tears instances down under a configurable failure threshold, then
//! deletes the documents.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::counter::CompletionSink;
use crate::domain::{
    CallbackTarget, DocumentLink, FailureInfo, Mergeable, ServiceTaskCallback, SubStage,
    TaskCreate, TaskStage, TaskState, merge_if_some, merge_once,
};
use crate::engine::{RetryPolicy, ServiceHost, StepAction, TaskWorkflow};
use crate::error::EngineError;
use crate::ports::{AdapterRequest, AdapterRequestKind};
use crate::query::{QuerySpec, collect_links};
use crate::workflows::placement::{PlacementSelectionPayload, PlacementSelectionTask};
use crate::workflows::resources::{
    self, ComputeState, PlacementState, PowerState, kinds,
};

/// Callback landing on this task: success advances to `next`, failure
/// lands on the error sub-stage.
fn self_callback(link: &DocumentLink, next: &str) -> ServiceTaskCallback {
    ServiceTaskCallback::new(
        link.clone(),
        CallbackTarget::new(TaskStage::Started, next),
        CallbackTarget::new(TaskStage::Started, "ERROR"),
    )
}

// ---------------------------------------------------------------------------
// allocation

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComputeAllocationSubStage {
    Created,
    ContextPrepared,
    SelectPlacement,
    StartAllocation,
    AllocationCompleted,
    Completed,
    Error,
}

impl SubStage for ComputeAllocationSubStage {
    fn ordinal(self) -> u32 {
        self as u32
    }

    fn variant_count() -> u32 {
        7
    }

    fn initial() -> Self {
        Self::Created
    }

    fn completed() -> Self {
        Self::Completed
    }

    fn error() -> Self {
        Self::Error
    }

    fn is_subscription_point(self) -> bool {
        matches!(self, Self::StartAllocation)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComputeAllocationPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_count: Option<u32>,

    /// Created resources are named `{prefix}-{ordinal}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_prefix: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_link: Option<DocumentLink>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placement_link: Option<DocumentLink>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_host_links: Option<Vec<DocumentLink>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_links: Option<Vec<DocumentLink>>,
}

impl Mergeable for ComputeAllocationPayload {
    fn merge_patch(&mut self, patch: Self) {
        merge_once(&mut self.resource_count, patch.resource_count);
        merge_once(&mut self.name_prefix, patch.name_prefix);
        merge_once(&mut self.pool_link, patch.pool_link);
        merge_once(&mut self.placement_link, patch.placement_link);
        merge_if_some(&mut self.selected_host_links, patch.selected_host_links);
        merge_if_some(&mut self.resource_links, patch.resource_links);
    }

    fn apply_override(&mut self, patch: Self) {
        merge_if_some(&mut self.resource_count, patch.resource_count);
        merge_if_some(&mut self.name_prefix, patch.name_prefix);
        merge_if_some(&mut self.pool_link, patch.pool_link);
        merge_if_some(&mut self.placement_link, patch.placement_link);
        merge_if_some(&mut self.selected_host_links, patch.selected_host_links);
        merge_if_some(&mut self.resource_links, patch.resource_links);
    }
}

pub struct ComputeAllocationTask;

impl ComputeAllocationTask {
    /// Ensure the i-th resource document exists; duplicate step delivery
    /// must not create it twice.
    async fn ensure_resource(
        host: &Arc<ServiceHost>,
        task_link: &DocumentLink,
        state: &TaskState<ComputeAllocationSubStage, ComputeAllocationPayload>,
        name: &str,
        host_link: &DocumentLink,
    ) -> Result<DocumentLink, EngineError> {
        let spec = QuerySpec::for_kind(kinds::COMPUTE)
            .field("name", name)
            .field("allocation_task_link", task_link.as_str());
        if let Some(existing) = collect_links(host.store().as_ref(), &spec).await?.pop() {
            return Ok(existing);
        }
        resources::create_document(
            host,
            kinds::COMPUTE,
            state.tenant_links.clone(),
            &ComputeState {
                name: name.to_string(),
                power_state: PowerState::Off,
                pool_link: state.payload.pool_link.clone(),
                host_link: Some(host_link.clone()),
                allocation_task_link: Some(task_link.clone()),
                ..Default::default()
            },
        )
        .await
    }
}

#[async_trait]
impl TaskWorkflow for ComputeAllocationTask {
    type SubStage = ComputeAllocationSubStage;
    type Payload = ComputeAllocationPayload;

    const FACTORY: &'static str = "/tasks/compute-allocation";
    const DISPLAY_NAME: &'static str = "compute allocation";

    fn validate_initial(&self, payload: &Self::Payload) -> Result<(), EngineError> {
        match payload.resource_count {
            None | Some(0) => {
                return Err(EngineError::Validation(
                    "resource_count must be >= 1".into(),
                ));
            }
            Some(_) => {}
        }
        if payload.name_prefix.as_deref().is_none_or(str::is_empty) {
            return Err(EngineError::Validation("name_prefix is required".into()));
        }
        match (&payload.pool_link, &payload.placement_link) {
            (Some(_), None) | (None, Some(_)) => Ok(()),
            _ => Err(EngineError::Validation(
                "exactly one of pool_link or placement_link is required".into(),
            )),
        }
    }

    async fn handle_sub_stage(
        &self,
        host: &Arc<ServiceHost>,
        link: &DocumentLink,
        state: &TaskState<Self::SubStage, Self::Payload>,
    ) -> Result<StepAction<Self::SubStage, Self::Payload>, EngineError> {
        match state.sub_stage {
            ComputeAllocationSubStage::Created => Ok(StepAction::proceed(
                ComputeAllocationSubStage::ContextPrepared,
                Default::default(),
            )),

            ComputeAllocationSubStage::ContextPrepared => {
                if let Some(placement) = &state.payload.placement_link {
                    // a named placement pins the host, no selection needed
                    let placement: PlacementState =
                        resources::get_document(host, placement).await?;
                    let host_link = placement.host_link.ok_or_else(|| {
                        EngineError::Other("placement has no host_link".into())
                    })?;
                    return Ok(StepAction::proceed(
                        ComputeAllocationSubStage::StartAllocation,
                        ComputeAllocationPayload {
                            selected_host_links: Some(vec![host_link]),
                            ..Default::default()
                        },
                    ));
                }
                let child = TaskCreate::new(PlacementSelectionPayload {
                    pool_link: state.payload.pool_link.clone(),
                    resource_count: state.payload.resource_count,
                    selected_host_links: None,
                })
                .with_callback(self_callback(link, "START_ALLOCATION"));
                let child_link = host
                    .start_task(
                        PlacementSelectionTask::FACTORY,
                        serde_json::to_value(child)?,
                    )
                    .await?;
                Ok(StepAction::proceed(
                    ComputeAllocationSubStage::SelectPlacement,
                    Default::default(),
                )
                .with_custom_property("placement_task_link", child_link.as_str()))
            }

            ComputeAllocationSubStage::SelectPlacement => Ok(StepAction::AwaitCallbacks),

            ComputeAllocationSubStage::StartAllocation => {
                let count = state.payload.resource_count.unwrap_or(1);
                let prefix = state
                    .payload
                    .name_prefix
                    .clone()
                    .unwrap_or_else(|| "resource".into());
                let hosts = state
                    .payload
                    .selected_host_links
                    .clone()
                    .filter(|h| !h.is_empty())
                    .ok_or_else(|| EngineError::Other("no hosts selected".into()))?;

                let sink = CompletionSink::allocate(
                    host,
                    count,
                    0.0,
                    self_callback(link, "ALLOCATION_COMPLETED"),
                )
                .await?;
                for i in 0..count {
                    let name = format!("{prefix}-{i}");
                    let host_link = &hosts[i as usize % hosts.len()];
                    match Self::ensure_resource(host, link, state, &name, host_link).await {
                        Ok(resource) => sink.report_success(host, resource),
                        Err(e) => {
                            let resource = DocumentLink::from_path(&format!("{}/{name}", kinds::COMPUTE));
                            sink.report_failure(host, resource, FailureInfo::new(e.to_string()));
                        }
                    }
                }
                Ok(StepAction::AwaitCallbacks)
            }

            ComputeAllocationSubStage::AllocationCompleted => {
                let spec = QuerySpec::for_kind(kinds::COMPUTE)
                    .field("allocation_task_link", link.as_str());
                let links = collect_links(host.store().as_ref(), &spec).await?;
                Ok(StepAction::complete(ComputeAllocationPayload {
                    resource_links: Some(links),
                    ..Default::default()
                }))
            }

            _ => Ok(StepAction::AwaitCallbacks),
        }
    }

    fn finished_response(&self, state: &TaskState<Self::SubStage, Self::Payload>) -> Value {
        json!({ "resource_links": state.payload.resource_links })
    }

    fn status_resource_links(
        &self,
        state: &TaskState<Self::SubStage, Self::Payload>,
    ) -> Option<Vec<DocumentLink>> {
        state.payload.resource_links.clone()
    }
}

// ---------------------------------------------------------------------------
// provisioning

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComputeProvisionSubStage {
    Created,
    Provisioning,
    ProvisionCompleted,
    Completed,
    Error,
}

impl SubStage for ComputeProvisionSubStage {
    fn ordinal(self) -> u32 {
        self as u32
    }

    fn variant_count() -> u32 {
        5
    }

    fn initial() -> Self {
        Self::Created
    }

    fn completed() -> Self {
        Self::Completed
    }

    fn error() -> Self {
        Self::Error
    }

    fn is_transient(self) -> bool {
        matches!(self, Self::Provisioning)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComputeProvisionPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_links: Option<Vec<DocumentLink>>,
}

impl Mergeable for ComputeProvisionPayload {
    fn merge_patch(&mut self, patch: Self) {
        merge_once(&mut self.resource_links, patch.resource_links);
    }

    fn apply_override(&mut self, patch: Self) {
        merge_if_some(&mut self.resource_links, patch.resource_links);
    }
}

pub struct ComputeProvisionTask;

async fn provision_one(
    host: &Arc<ServiceHost>,
    resource: &DocumentLink,
) -> Result<(), EngineError> {
    let adapter = Arc::clone(host.adapter()?);
    let out = adapter
        .execute(AdapterRequest::new(resource.clone(), AdapterRequestKind::Create))
        .await?;
    let instance_id = out["instance_id"].as_str().map(str::to_string);
    let address = out["address"].as_str().map(str::to_string);
    resources::modify_document(host, resource, |c: &mut ComputeState| {
        c.power_state = PowerState::On;
        c.instance_id = instance_id.clone();
        c.address = address.clone();
    })
    .await?;

    let probe = RetryPolicy::fixed(5, Duration::from_millis(20));
    let healthy = probe
        .run_until(|| {
            let adapter = Arc::clone(&adapter);
            let resource = resource.clone();
            async move { adapter.health(&resource).await }
        })
        .await?;
    if !healthy {
        return Err(EngineError::Adapter(format!(
            "{resource} never reported healthy"
        )));
    }
    Ok(())
}

#[async_trait]
impl TaskWorkflow for ComputeProvisionTask {
    type SubStage = ComputeProvisionSubStage;
    type Payload = ComputeProvisionPayload;

    const FACTORY: &'static str = "/tasks/compute-provision";
    const DISPLAY_NAME: &'static str = "compute provisioning";

    fn validate_initial(&self, payload: &Self::Payload) -> Result<(), EngineError> {
        match &payload.resource_links {
            Some(links) if !links.is_empty() => Ok(()),
            _ => Err(EngineError::Validation("resource_links is required".into())),
        }
    }

    async fn handle_sub_stage(
        &self,
        host: &Arc<ServiceHost>,
        link: &DocumentLink,
        state: &TaskState<Self::SubStage, Self::Payload>,
    ) -> Result<StepAction<Self::SubStage, Self::Payload>, EngineError> {
        match state.sub_stage {
            ComputeProvisionSubStage::Created => Ok(StepAction::proceed(
                ComputeProvisionSubStage::Provisioning,
                Default::default(),
            )),

            ComputeProvisionSubStage::Provisioning => {
                let links = state.payload.resource_links.clone().unwrap_or_default();
                let sink = CompletionSink::allocate(
                    host,
                    links.len() as u32,
                    0.0,
                    self_callback(link, "PROVISION_COMPLETED"),
                )
                .await?;
                for resource in links {
                    let host = Arc::clone(host);
                    let sink = sink.clone();
                    tokio::spawn(async move {
                        match provision_one(&host, &resource).await {
                            Ok(()) => sink.report_success(&host, resource),
                            Err(e) => sink.report_failure(
                                &host,
                                resource,
                                FailureInfo::new(e.to_string()),
                            ),
                        }
                    });
                }
                Ok(StepAction::AwaitCallbacks)
            }

            ComputeProvisionSubStage::ProvisionCompleted => {
                Ok(StepAction::complete(Default::default()))
            }

            _ => Ok(StepAction::AwaitCallbacks),
        }
    }

    fn finished_response(&self, state: &TaskState<Self::SubStage, Self::Payload>) -> Value {
        json!({ "resource_links": state.payload.resource_links })
    }

    fn status_resource_links(
        &self,
        state: &TaskState<Self::SubStage, Self::Payload>,
    ) -> Option<Vec<DocumentLink>> {
        state.payload.resource_links.clone()
    }
}

// ---------------------------------------------------------------------------
// removal

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComputeRemovalSubStage {
    Created,
    InstancesRemoving,
    RemoveDocuments,
    Completed,
    Error,
}

impl SubStage for ComputeRemovalSubStage {
    fn ordinal(self) -> u32 {
        self as u32
    }

    fn variant_count() -> u32 {
        5
    }

    fn initial() -> Self {
        Self::Created
    }

    fn completed() -> Self {
        Self::Completed
    }

    fn error() -> Self {
        Self::Error
    }

    fn is_transient(self) -> bool {
        matches!(self, Self::InstancesRemoving)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComputeRemovalPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_links: Option<Vec<DocumentLink>>,

    /// Tolerated instance-teardown failure rate; documents are removed
    /// either way once within tolerance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_threshold: Option<f64>,
}

impl Mergeable for ComputeRemovalPayload {
    fn merge_patch(&mut self, patch: Self) {
        merge_once(&mut self.resource_links, patch.resource_links);
        merge_once(&mut self.error_threshold, patch.error_threshold);
    }

    fn apply_override(&mut self, patch: Self) {
        merge_if_some(&mut self.resource_links, patch.resource_links);
        merge_if_some(&mut self.error_threshold, patch.error_threshold);
    }
}

pub struct ComputeRemovalTask;

#[async_trait]
impl TaskWorkflow for ComputeRemovalTask {
    type SubStage = ComputeRemovalSubStage;
    type Payload = ComputeRemovalPayload;

    const FACTORY: &'static str = "/tasks/compute-removal";
    const DISPLAY_NAME: &'static str = "compute removal";

    fn validate_initial(&self, payload: &Self::Payload) -> Result<(), EngineError> {
        match &payload.resource_links {
            Some(links) if !links.is_empty() => {}
            _ => return Err(EngineError::Validation("resource_links is required".into())),
        }
        if let Some(t) = payload.error_threshold
            && !(0.0..=1.0).contains(&t)
        {
            return Err(EngineError::Validation(format!(
                "error_threshold must be within [0, 1], got {t}"
            )));
        }
        Ok(())
    }

    async fn handle_sub_stage(
        &self,
        host: &Arc<ServiceHost>,
        link: &DocumentLink,
        state: &TaskState<Self::SubStage, Self::Payload>,
    ) -> Result<StepAction<Self::SubStage, Self::Payload>, EngineError> {
        match state.sub_stage {
            ComputeRemovalSubStage::Created => Ok(StepAction::proceed(
                ComputeRemovalSubStage::InstancesRemoving,
                Default::default(),
            )),

            ComputeRemovalSubStage::InstancesRemoving => {
                let links = state.payload.resource_links.clone().unwrap_or_default();
                let threshold = state.payload.error_threshold.unwrap_or(0.0);
                let sink = CompletionSink::allocate(
                    host,
                    links.len() as u32,
                    threshold,
                    self_callback(link, "REMOVE_DOCUMENTS"),
                )
                .await?;
                for resource in links {
                    let host = Arc::clone(host);
                    let sink = sink.clone();
                    tokio::spawn(async move {
                        let result: Result<(), EngineError> = async {
                            let adapter = Arc::clone(host.adapter()?);
                            adapter
                                .execute(AdapterRequest::new(
                                    resource.clone(),
                                    AdapterRequestKind::Remove,
                                ))
                                .await?;
                            Ok(())
                        }
                        .await;
                        match result {
                            Ok(()) => sink.report_success(&host, resource),
                            Err(e) => sink.report_failure(
                                &host,
                                resource,
                                FailureInfo::new(e.to_string()),
                            ),
                        }
                    });
                }
                Ok(StepAction::AwaitCallbacks)
            }

            ComputeRemovalSubStage::RemoveDocuments => {
                let links = state.payload.resource_links.clone().unwrap_or_default();
                for resource in &links {
                    // auxiliary group documents go best-effort; a failure
                    // here never fails the removal
                    match resources::get_document::<ComputeState>(host, resource).await {
                        Ok(compute) => {
                            for group in &compute.group_links {
                                if let Err(e) = host.store().delete(group).await {
                                    warn!(group = %group, error = %e, "group cleanup failed");
                                }
                            }
                        }
                        Err(e) if e.is_benign() => {}
                        Err(e) => {
                            warn!(resource = %resource, error = %e, "resource read failed before delete");
                        }
                    }
                    host.store().delete(resource).await?;
                }
                Ok(StepAction::complete(Default::default()))
            }

            _ => Ok(StepAction::AwaitCallbacks),
        }
    }
}
