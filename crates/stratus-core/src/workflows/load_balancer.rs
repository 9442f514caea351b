//! Load balancer workflows: allocation, provisioning, removal.
//!
//! A load balancer fronts one network; allocation requires the backing
//! network link up front.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;

use crate::counter::CompletionSink;
use crate::domain::{
    CallbackTarget, DocumentLink, FailureInfo, Mergeable, ServiceTaskCallback, SubStage,
    TaskStage, TaskState, merge_if_some, merge_once,
};
use crate::engine::{ServiceHost, StepAction, TaskWorkflow};
use crate::error::EngineError;
use crate::ports::{AdapterRequest, AdapterRequestKind};
use crate::workflows::resources::{self, LoadBalancerState, kinds};

fn self_callback(link: &DocumentLink, next: &str) -> ServiceTaskCallback {
    ServiceTaskCallback::new(
        link.clone(),
        CallbackTarget::new(TaskStage::Started, next),
        CallbackTarget::new(TaskStage::Started, "ERROR"),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadBalancerAllocationSubStage {
    Created,
    Allocated,
    Completed,
    Error,
}

impl SubStage for LoadBalancerAllocationSubStage {
    fn ordinal(self) -> u32 {
        self as u32
    }

    fn variant_count() -> u32 {
        4
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
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadBalancerAllocationPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_link: Option<DocumentLink>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancer_link: Option<DocumentLink>,
}

impl Mergeable for LoadBalancerAllocationPayload {
    fn merge_patch(&mut self, patch: Self) {
        merge_once(&mut self.name, patch.name);
        merge_once(&mut self.network_link, patch.network_link);
        merge_if_some(&mut self.load_balancer_link, patch.load_balancer_link);
    }

    fn apply_override(&mut self, patch: Self) {
        merge_if_some(&mut self.name, patch.name);
        merge_if_some(&mut self.network_link, patch.network_link);
        merge_if_some(&mut self.load_balancer_link, patch.load_balancer_link);
    }
}

pub struct LoadBalancerAllocationTask;

#[async_trait]
impl TaskWorkflow for LoadBalancerAllocationTask {
    type SubStage = LoadBalancerAllocationSubStage;
    type Payload = LoadBalancerAllocationPayload;

    const FACTORY: &'static str = "/tasks/load-balancer-allocation";
    const DISPLAY_NAME: &'static str = "load balancer allocation";

    fn validate_initial(&self, payload: &Self::Payload) -> Result<(), EngineError> {
        if payload.name.as_deref().is_none_or(str::is_empty) {
            return Err(EngineError::Validation("name is required".into()));
        }
        if payload.network_link.is_none() {
            return Err(EngineError::Validation("network_link is required".into()));
        }
        Ok(())
    }

    async fn handle_sub_stage(
        &self,
        host: &Arc<ServiceHost>,
        _link: &DocumentLink,
        state: &TaskState<Self::SubStage, Self::Payload>,
    ) -> Result<StepAction<Self::SubStage, Self::Payload>, EngineError> {
        match state.sub_stage {
            LoadBalancerAllocationSubStage::Created => {
                // the backing network must exist before we point at it
                host.store()
                    .get(state.payload.network_link.as_ref().ok_or_else(|| {
                        EngineError::Other("network_link missing".into())
                    })?)
                    .await?;
                let link = resources::create_document(
                    host,
                    kinds::LOAD_BALANCER,
                    state.tenant_links.clone(),
                    &LoadBalancerState {
                        name: state.payload.name.clone().unwrap_or_default(),
                        network_link: state.payload.network_link.clone(),
                        address: None,
                        instance_id: None,
                    },
                )
                .await?;
                Ok(StepAction::proceed(
                    LoadBalancerAllocationSubStage::Allocated,
                    LoadBalancerAllocationPayload {
                        load_balancer_link: Some(link),
                        ..Default::default()
                    },
                ))
            }
            LoadBalancerAllocationSubStage::Allocated => {
                Ok(StepAction::complete(Default::default()))
            }
            _ => Ok(StepAction::AwaitCallbacks),
        }
    }

    fn finished_response(&self, state: &TaskState<Self::SubStage, Self::Payload>) -> Value {
        json!({ "load_balancer_link": state.payload.load_balancer_link })
    }

    fn status_resource_links(
        &self,
        state: &TaskState<Self::SubStage, Self::Payload>,
    ) -> Option<Vec<DocumentLink>> {
        state.payload.load_balancer_link.clone().map(|l| vec![l])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadBalancerProvisionSubStage {
    Created,
    Provisioning,
    ProvisionCompleted,
    Completed,
    Error,
}

impl SubStage for LoadBalancerProvisionSubStage {
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
pub struct LoadBalancerProvisionPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancer_link: Option<DocumentLink>,
}

impl Mergeable for LoadBalancerProvisionPayload {
    fn merge_patch(&mut self, patch: Self) {
        merge_once(&mut self.load_balancer_link, patch.load_balancer_link);
    }

    fn apply_override(&mut self, patch: Self) {
        merge_if_some(&mut self.load_balancer_link, patch.load_balancer_link);
    }
}

pub struct LoadBalancerProvisionTask;

#[async_trait]
impl TaskWorkflow for LoadBalancerProvisionTask {
    type SubStage = LoadBalancerProvisionSubStage;
    type Payload = LoadBalancerProvisionPayload;

    const FACTORY: &'static str = "/tasks/load-balancer-provision";
    const DISPLAY_NAME: &'static str = "load balancer provisioning";

    fn validate_initial(&self, payload: &Self::Payload) -> Result<(), EngineError> {
        if payload.load_balancer_link.is_none() {
            return Err(EngineError::Validation(
                "load_balancer_link is required".into(),
            ));
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
            LoadBalancerProvisionSubStage::Created => Ok(StepAction::proceed(
                LoadBalancerProvisionSubStage::Provisioning,
                Default::default(),
            )),

            LoadBalancerProvisionSubStage::Provisioning => {
                let lb = state
                    .payload
                    .load_balancer_link
                    .clone()
                    .ok_or_else(|| EngineError::Other("load_balancer_link missing".into()))?;
                let sink = CompletionSink::allocate(
                    host,
                    1,
                    0.0,
                    self_callback(link, "PROVISION_COMPLETED"),
                )
                .await?;
                let host = Arc::clone(host);
                tokio::spawn(async move {
                    let result: Result<(), EngineError> = async {
                        let adapter = Arc::clone(host.adapter()?);
                        let out = adapter
                            .execute(AdapterRequest::new(lb.clone(), AdapterRequestKind::Create))
                            .await?;
                        let instance_id = out["instance_id"].as_str().map(str::to_string);
                        let address = out["address"].as_str().map(str::to_string);
                        resources::modify_document(&host, &lb, |s: &mut LoadBalancerState| {
                            s.instance_id = instance_id.clone();
                            s.address = address.clone();
                        })
                        .await?;
                        Ok(())
                    }
                    .await;
                    match result {
                        Ok(()) => sink.report_success(&host, lb),
                        Err(e) => sink.report_failure(&host, lb, FailureInfo::new(e.to_string())),
                    }
                });
                Ok(StepAction::AwaitCallbacks)
            }

            LoadBalancerProvisionSubStage::ProvisionCompleted => {
                Ok(StepAction::complete(Default::default()))
            }

            _ => Ok(StepAction::AwaitCallbacks),
        }
    }

    fn finished_response(&self, state: &TaskState<Self::SubStage, Self::Payload>) -> Value {
        json!({ "load_balancer_link": state.payload.load_balancer_link })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadBalancerRemovalSubStage {
    Created,
    InstancesRemoving,
    RemoveDocuments,
    Completed,
    Error,
}

impl SubStage for LoadBalancerRemovalSubStage {
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
pub struct LoadBalancerRemovalPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancer_link: Option<DocumentLink>,
}

impl Mergeable for LoadBalancerRemovalPayload {
    fn merge_patch(&mut self, patch: Self) {
        merge_once(&mut self.load_balancer_link, patch.load_balancer_link);
    }

    fn apply_override(&mut self, patch: Self) {
        merge_if_some(&mut self.load_balancer_link, patch.load_balancer_link);
    }
}

pub struct LoadBalancerRemovalTask;

#[async_trait]
impl TaskWorkflow for LoadBalancerRemovalTask {
    type SubStage = LoadBalancerRemovalSubStage;
    type Payload = LoadBalancerRemovalPayload;

    const FACTORY: &'static str = "/tasks/load-balancer-removal";
    const DISPLAY_NAME: &'static str = "load balancer removal";

    fn validate_initial(&self, payload: &Self::Payload) -> Result<(), EngineError> {
        if payload.load_balancer_link.is_none() {
            return Err(EngineError::Validation(
                "load_balancer_link is required".into(),
            ));
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
            LoadBalancerRemovalSubStage::Created => Ok(StepAction::proceed(
                LoadBalancerRemovalSubStage::InstancesRemoving,
                Default::default(),
            )),

            LoadBalancerRemovalSubStage::InstancesRemoving => {
                let lb = state
                    .payload
                    .load_balancer_link
                    .clone()
                    .ok_or_else(|| EngineError::Other("load_balancer_link missing".into()))?;
                let sink = CompletionSink::allocate(
                    host,
                    1,
                    0.0,
                    self_callback(link, "REMOVE_DOCUMENTS"),
                )
                .await?;
                let host = Arc::clone(host);
                tokio::spawn(async move {
                    let result: Result<(), EngineError> = async {
                        let adapter = Arc::clone(host.adapter()?);
                        adapter
                            .execute(AdapterRequest::new(lb.clone(), AdapterRequestKind::Remove))
                            .await?;
                        Ok(())
                    }
                    .await;
                    match result {
                        Ok(()) => sink.report_success(&host, lb),
                        Err(e) => sink.report_failure(&host, lb, FailureInfo::new(e.to_string())),
                    }
                });
                Ok(StepAction::AwaitCallbacks)
            }

            LoadBalancerRemovalSubStage::RemoveDocuments => {
                if let Some(lb) = &state.payload.load_balancer_link {
                    host.store().delete(lb).await?;
                }
                Ok(StepAction::complete(Default::default()))
            }

            _ => Ok(StepAction::AwaitCallbacks),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskCreate;
    use crate::impls::{InMemoryStore, MockAdapter};
    use crate::workflows::network::{NetworkAllocationPayload, NetworkAllocationTask};
    use crate::workflows::testkit::await_stage;

    fn fixture() -> (Arc<ServiceHost>, Arc<MockAdapter>) {
        let adapter = Arc::new(MockAdapter::new());
        let host = ServiceHost::builder(Arc::new(InMemoryStore::new()))
            .adapter(adapter.clone())
            .register(NetworkAllocationTask)
            .register(LoadBalancerAllocationTask)
            .register(LoadBalancerProvisionTask)
            .register(LoadBalancerRemovalTask)
            .build();
        (host, adapter)
    }

    async fn allocate_lb(host: &Arc<ServiceHost>) -> DocumentLink {
        let create = TaskCreate::new(NetworkAllocationPayload {
            name: Some("net-lb".into()),
            subnet_cidr: None,
            network_link: None,
        });
        let task = host
            .start_task(
                NetworkAllocationTask::FACTORY,
                serde_json::to_value(create).unwrap(),
            )
            .await
            .unwrap();
        let network = await_stage(host, &task, TaskStage::Finished)
            .await
            .resource_links
            .unwrap()
            .remove(0);

        let create = TaskCreate::new(LoadBalancerAllocationPayload {
            name: Some("lb-a".into()),
            network_link: Some(network),
            load_balancer_link: None,
        });
        let task = host
            .start_task(
                LoadBalancerAllocationTask::FACTORY,
                serde_json::to_value(create).unwrap(),
            )
            .await
            .unwrap();
        await_stage(host, &task, TaskStage::Finished)
            .await
            .resource_links
            .unwrap()
            .remove(0)
    }

    #[tokio::test]
    async fn allocation_requires_a_network_link() {
        let (host, _) = fixture();
        let create = TaskCreate::new(LoadBalancerAllocationPayload {
            name: Some("lb-a".into()),
            ..Default::default()
        });
        let err = host
            .start_task(
                LoadBalancerAllocationTask::FACTORY,
                serde_json::to_value(create).unwrap(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn allocation_fails_when_the_network_does_not_exist() {
        let (host, _) = fixture();
        let create = TaskCreate::new(LoadBalancerAllocationPayload {
            name: Some("lb-a".into()),
            network_link: Some(DocumentLink::from_path("/resources/networks/missing")),
            load_balancer_link: None,
        });
        let task = host
            .start_task(
                LoadBalancerAllocationTask::FACTORY,
                serde_json::to_value(create).unwrap(),
            )
            .await
            .unwrap();
        let status = await_stage(&host, &task, TaskStage::Failed).await;
        assert!(status.failure.is_some());
    }

    #[tokio::test]
    async fn provision_assigns_an_address() {
        let (host, _) = fixture();
        let lb_link = allocate_lb(&host).await;

        let create = TaskCreate::new(LoadBalancerProvisionPayload {
            load_balancer_link: Some(lb_link.clone()),
        });
        let task = host
            .start_task(
                LoadBalancerProvisionTask::FACTORY,
                serde_json::to_value(create).unwrap(),
            )
            .await
            .unwrap();
        await_stage(&host, &task, TaskStage::Finished).await;

        let lb: LoadBalancerState = resources::get_document(&host, &lb_link).await.unwrap();
        assert!(lb.address.is_some());
        assert!(lb.instance_id.is_some());
    }

    #[tokio::test]
    async fn removal_tears_down_and_deletes() {
        let (host, _) = fixture();
        let lb_link = allocate_lb(&host).await;

        let create = TaskCreate::new(LoadBalancerRemovalPayload {
            load_balancer_link: Some(lb_link.clone()),
        });
        let task = host
            .start_task(
                LoadBalancerRemovalTask::FACTORY,
                serde_json::to_value(create).unwrap(),
            )
            .await
            .unwrap();
        await_stage(&host, &task, TaskStage::Finished).await;
        assert!(host.store().get(&lb_link).await.unwrap_err().is_benign());
    }

    #[tokio::test]
    async fn removal_failure_keeps_the_document() {
        let (host, adapter) = fixture();
        let lb_link = allocate_lb(&host).await;
        adapter.fail_for(&lb_link);

        let create = TaskCreate::new(LoadBalancerRemovalPayload {
            load_balancer_link: Some(lb_link.clone()),
        });
        let task = host
            .start_task(
                LoadBalancerRemovalTask::FACTORY,
                serde_json::to_value(create).unwrap(),
            )
            .await
            .unwrap();
        await_stage(&host, &task, TaskStage::Failed).await;
        assert!(host.store().get(&lb_link).await.is_ok());
    }
}
