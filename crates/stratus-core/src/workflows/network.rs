//! Network workflows: allocation, provisioning, removal.
//!
//! Single-resource tasks: their fan-out width is one, so completion
//! reports bypass the counter and patch the parent task directly.

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
use crate::query::{QuerySpec, collect_links};
use crate::workflows::resources::{self, NetworkState, kinds};

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
pub enum NetworkAllocationSubStage {
    Created,
    Allocated,
    Completed,
    Error,
}

impl SubStage for NetworkAllocationSubStage {
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
pub struct NetworkAllocationPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet_cidr: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_link: Option<DocumentLink>,
}

impl Mergeable for NetworkAllocationPayload {
    fn merge_patch(&mut self, patch: Self) {
        merge_once(&mut self.name, patch.name);
        merge_once(&mut self.subnet_cidr, patch.subnet_cidr);
        merge_if_some(&mut self.network_link, patch.network_link);
    }

    fn apply_override(&mut self, patch: Self) {
        merge_if_some(&mut self.name, patch.name);
        merge_if_some(&mut self.subnet_cidr, patch.subnet_cidr);
        merge_if_some(&mut self.network_link, patch.network_link);
    }
}

pub struct NetworkAllocationTask;

#[async_trait]
impl TaskWorkflow for NetworkAllocationTask {
    type SubStage = NetworkAllocationSubStage;
    type Payload = NetworkAllocationPayload;

    const FACTORY: &'static str = "/tasks/network-allocation";
    const DISPLAY_NAME: &'static str = "network allocation";

    fn validate_initial(&self, payload: &Self::Payload) -> Result<(), EngineError> {
        if payload.name.as_deref().is_none_or(str::is_empty) {
            return Err(EngineError::Validation("name is required".into()));
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
            NetworkAllocationSubStage::Created => {
                let name = state.payload.name.clone().unwrap_or_default();
                // re-entry reuses an existing document of the same name,
                // within the task's own tenant scope
                let spec = QuerySpec::for_kind(kinds::NETWORK)
                    .field("name", name.as_str())
                    .tenanted(&state.tenant_links);
                let link = match collect_links(host.store().as_ref(), &spec).await?.pop() {
                    Some(existing) => existing,
                    None => {
                        resources::create_document(
                            host,
                            kinds::NETWORK,
                            state.tenant_links.clone(),
                            &NetworkState {
                                name,
                                subnet_cidr: state.payload.subnet_cidr.clone(),
                                instance_id: None,
                            },
                        )
                        .await?
                    }
                };
                Ok(StepAction::proceed(
                    NetworkAllocationSubStage::Allocated,
                    NetworkAllocationPayload {
                        network_link: Some(link),
                        ..Default::default()
                    },
                ))
            }
            NetworkAllocationSubStage::Allocated => Ok(StepAction::complete(Default::default())),
            _ => Ok(StepAction::AwaitCallbacks),
        }
    }

    fn finished_response(&self, state: &TaskState<Self::SubStage, Self::Payload>) -> Value {
        json!({ "network_link": state.payload.network_link })
    }

    fn status_resource_links(
        &self,
        state: &TaskState<Self::SubStage, Self::Payload>,
    ) -> Option<Vec<DocumentLink>> {
        state.payload.network_link.clone().map(|l| vec![l])
    }
}

// ---------------------------------------------------------------------------
// provisioning

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NetworkProvisionSubStage {
    Created,
    Provisioning,
    ProvisionCompleted,
    Completed,
    Error,
}

impl SubStage for NetworkProvisionSubStage {
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
pub struct NetworkProvisionPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_link: Option<DocumentLink>,
}

impl Mergeable for NetworkProvisionPayload {
    fn merge_patch(&mut self, patch: Self) {
        merge_once(&mut self.network_link, patch.network_link);
    }

    fn apply_override(&mut self, patch: Self) {
        merge_if_some(&mut self.network_link, patch.network_link);
    }
}

pub struct NetworkProvisionTask;

#[async_trait]
impl TaskWorkflow for NetworkProvisionTask {
    type SubStage = NetworkProvisionSubStage;
    type Payload = NetworkProvisionPayload;

    const FACTORY: &'static str = "/tasks/network-provision";
    const DISPLAY_NAME: &'static str = "network provisioning";

    fn validate_initial(&self, payload: &Self::Payload) -> Result<(), EngineError> {
        if payload.network_link.is_none() {
            return Err(EngineError::Validation("network_link is required".into()));
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
            NetworkProvisionSubStage::Created => Ok(StepAction::proceed(
                NetworkProvisionSubStage::Provisioning,
                Default::default(),
            )),

            NetworkProvisionSubStage::Provisioning => {
                let network = state
                    .payload
                    .network_link
                    .clone()
                    .ok_or_else(|| EngineError::Other("network_link missing".into()))?;
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
                            .execute(AdapterRequest::new(
                                network.clone(),
                                AdapterRequestKind::Create,
                            ))
                            .await?;
                        let instance_id = out["instance_id"].as_str().map(str::to_string);
                        resources::modify_document(&host, &network, |n: &mut NetworkState| {
                            n.instance_id = instance_id.clone();
                        })
                        .await?;
                        Ok(())
                    }
                    .await;
                    match result {
                        Ok(()) => sink.report_success(&host, network),
                        Err(e) => {
                            sink.report_failure(&host, network, FailureInfo::new(e.to_string()))
                        }
                    }
                });
                Ok(StepAction::AwaitCallbacks)
            }

            NetworkProvisionSubStage::ProvisionCompleted => {
                Ok(StepAction::complete(Default::default()))
            }

            _ => Ok(StepAction::AwaitCallbacks),
        }
    }

    fn finished_response(&self, state: &TaskState<Self::SubStage, Self::Payload>) -> Value {
        json!({ "network_link": state.payload.network_link })
    }
}

// ---------------------------------------------------------------------------
// removal

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NetworkRemovalSubStage {
    Created,
    InstancesRemoving,
    RemoveDocuments,
    Completed,
    Error,
}

impl SubStage for NetworkRemovalSubStage {
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
pub struct NetworkRemovalPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_link: Option<DocumentLink>,
}

impl Mergeable for NetworkRemovalPayload {
    fn merge_patch(&mut self, patch: Self) {
        merge_once(&mut self.network_link, patch.network_link);
    }

    fn apply_override(&mut self, patch: Self) {
        merge_if_some(&mut self.network_link, patch.network_link);
    }
}

pub struct NetworkRemovalTask;

#[async_trait]
impl TaskWorkflow for NetworkRemovalTask {
    type SubStage = NetworkRemovalSubStage;
    type Payload = NetworkRemovalPayload;

    const FACTORY: &'static str = "/tasks/network-removal";
    const DISPLAY_NAME: &'static str = "network removal";

    fn validate_initial(&self, payload: &Self::Payload) -> Result<(), EngineError> {
        if payload.network_link.is_none() {
            return Err(EngineError::Validation("network_link is required".into()));
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
            NetworkRemovalSubStage::Created => Ok(StepAction::proceed(
                NetworkRemovalSubStage::InstancesRemoving,
                Default::default(),
            )),

            NetworkRemovalSubStage::InstancesRemoving => {
                let network = state
                    .payload
                    .network_link
                    .clone()
                    .ok_or_else(|| EngineError::Other("network_link missing".into()))?;
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
                            .execute(AdapterRequest::new(
                                network.clone(),
                                AdapterRequestKind::Remove,
                            ))
                            .await?;
                        Ok(())
                    }
                    .await;
                    match result {
                        Ok(()) => sink.report_success(&host, network),
                        Err(e) => {
                            sink.report_failure(&host, network, FailureInfo::new(e.to_string()))
                        }
                    }
                });
                Ok(StepAction::AwaitCallbacks)
            }

            NetworkRemovalSubStage::RemoveDocuments => {
                if let Some(network) = &state.payload.network_link {
                    host.store().delete(network).await?;
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
    use crate::workflows::testkit::await_stage;

    fn fixture() -> (Arc<ServiceHost>, Arc<MockAdapter>) {
        let adapter = Arc::new(MockAdapter::new());
        let host = ServiceHost::builder(Arc::new(InMemoryStore::new()))
            .adapter(adapter.clone())
            .register(NetworkAllocationTask)
            .register(NetworkProvisionTask)
            .register(NetworkRemovalTask)
            .build();
        (host, adapter)
    }

    async fn allocate_network(host: &Arc<ServiceHost>) -> DocumentLink {
        let create = TaskCreate::new(NetworkAllocationPayload {
            name: Some("net-a".into()),
            subnet_cidr: Some("10.1.0.0/24".into()),
            network_link: None,
        });
        let task = host
            .start_task(
                NetworkAllocationTask::FACTORY,
                serde_json::to_value(create).unwrap(),
            )
            .await
            .unwrap();
        let status = await_stage(host, &task, TaskStage::Finished).await;
        status.resource_links.unwrap().remove(0)
    }

    #[tokio::test]
    async fn allocation_creates_the_network_document() {
        let (host, _) = fixture();
        let link = allocate_network(&host).await;
        let n: NetworkState = resources::get_document(&host, &link).await.unwrap();
        assert_eq!(n.name, "net-a");
        assert_eq!(n.subnet_cidr.as_deref(), Some("10.1.0.0/24"));
    }

    #[tokio::test]
    async fn same_name_in_another_tenant_gets_its_own_document() {
        let (host, _) = fixture();
        let mut links = Vec::new();
        for tenant in ["/tenants/t1", "/tenants/t2"] {
            let mut create = TaskCreate::new(NetworkAllocationPayload {
                name: Some("net-a".into()),
                subnet_cidr: None,
                network_link: None,
            });
            create.tenant_links = vec![tenant.to_string()];
            let task = host
                .start_task(
                    NetworkAllocationTask::FACTORY,
                    serde_json::to_value(create).unwrap(),
                )
                .await
                .unwrap();
            let status = await_stage(&host, &task, TaskStage::Finished).await;
            links.push(status.resource_links.unwrap().remove(0));
        }
        assert_ne!(links[0], links[1], "tenants must not share a network document");
    }

    #[tokio::test]
    async fn allocation_without_name_is_rejected() {
        let (host, _) = fixture();
        let create = TaskCreate::new(NetworkAllocationPayload::default());
        let err = host
            .start_task(
                NetworkAllocationTask::FACTORY,
                serde_json::to_value(create).unwrap(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn provision_and_removal_round_trip() {
        let (host, _) = fixture();
        let link = allocate_network(&host).await;

        let create = TaskCreate::new(NetworkProvisionPayload {
            network_link: Some(link.clone()),
        });
        let task = host
            .start_task(
                NetworkProvisionTask::FACTORY,
                serde_json::to_value(create).unwrap(),
            )
            .await
            .unwrap();
        await_stage(&host, &task, TaskStage::Finished).await;
        let n: NetworkState = resources::get_document(&host, &link).await.unwrap();
        assert!(n.instance_id.is_some());

        let create = TaskCreate::new(NetworkRemovalPayload {
            network_link: Some(link.clone()),
        });
        let task = host
            .start_task(
                NetworkRemovalTask::FACTORY,
                serde_json::to_value(create).unwrap(),
            )
            .await
            .unwrap();
        await_stage(&host, &task, TaskStage::Finished).await;
        assert!(host.store().get(&link).await.unwrap_err().is_benign());
    }

    #[tokio::test]
    async fn adapter_failure_fails_the_provision_task() {
        let (host, adapter) = fixture();
        let link = allocate_network(&host).await;
        adapter.fail_for(&link);

        let create = TaskCreate::new(NetworkProvisionPayload {
            network_link: Some(link.clone()),
        });
        let task = host
            .start_task(
                NetworkProvisionTask::FACTORY,
                serde_json::to_value(create).unwrap(),
            )
            .await
            .unwrap();
        let status = await_stage(&host, &task, TaskStage::Failed).await;
        assert!(status.failure.is_some());
        // the document survives a failed provision
        assert!(host.store().get(&link).await.is_ok());
    }
}
