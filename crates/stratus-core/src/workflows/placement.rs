//! Placement selection: pick hosts from a pool for N resources.
//!
//! Runs as a child of allocation tasks. Queries the pool's powered-on
//! hosts and spreads the requested count across them round-robin; the
//! selected host links travel back to the parent in the callback.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;

use crate::domain::{
    DocumentLink, Mergeable, SubStage, TaskState, merge_if_some, merge_once,
};
use crate::engine::{ServiceHost, StepAction, TaskWorkflow};
use crate::error::EngineError;
use crate::query::{QuerySpec, collect_links};
use crate::workflows::resources::kinds;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlacementSelectionSubStage {
    Created,
    Selected,
    Completed,
    Error,
}

impl SubStage for PlacementSelectionSubStage {
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
pub struct PlacementSelectionPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_link: Option<DocumentLink>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_count: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_host_links: Option<Vec<DocumentLink>>,
}

impl Mergeable for PlacementSelectionPayload {
    fn merge_patch(&mut self, patch: Self) {
        merge_once(&mut self.pool_link, patch.pool_link);
        merge_once(&mut self.resource_count, patch.resource_count);
        merge_if_some(&mut self.selected_host_links, patch.selected_host_links);
    }

    fn apply_override(&mut self, patch: Self) {
        merge_if_some(&mut self.pool_link, patch.pool_link);
        merge_if_some(&mut self.resource_count, patch.resource_count);
        merge_if_some(&mut self.selected_host_links, patch.selected_host_links);
    }
}

pub struct PlacementSelectionTask;

#[async_trait]
impl TaskWorkflow for PlacementSelectionTask {
    type SubStage = PlacementSelectionSubStage;
    type Payload = PlacementSelectionPayload;

    const FACTORY: &'static str = "/tasks/placement-selection";
    const DISPLAY_NAME: &'static str = "placement selection";

    fn validate_initial(&self, payload: &Self::Payload) -> Result<(), EngineError> {
        if payload.pool_link.is_none() {
            return Err(EngineError::Validation("pool_link is required".into()));
        }
        match payload.resource_count {
            None | Some(0) => Err(EngineError::Validation(
                "resource_count must be >= 1".into(),
            )),
            Some(_) => Ok(()),
        }
    }

    async fn handle_sub_stage(
        &self,
        host: &Arc<ServiceHost>,
        _link: &DocumentLink,
        state: &TaskState<Self::SubStage, Self::Payload>,
    ) -> Result<StepAction<Self::SubStage, Self::Payload>, EngineError> {
        match state.sub_stage {
            PlacementSelectionSubStage::Created => {
                // validate_initial guarantees both fields
                let pool = state
                    .payload
                    .pool_link
                    .clone()
                    .ok_or_else(|| EngineError::Other("pool_link missing".into()))?;
                let count = state.payload.resource_count.unwrap_or(1) as usize;

                let spec = QuerySpec::for_kind(kinds::HOST)
                    .field("power_state", "ON")
                    .field("pool_link", pool.as_str())
                    .tenanted(&state.tenant_links);
                let hosts = collect_links(host.store().as_ref(), &spec).await?;
                if hosts.is_empty() {
                    return Err(EngineError::Other(format!(
                        "no powered-on hosts in pool {pool}"
                    )));
                }

                // spread: walk the host list round-robin
                let selected: Vec<DocumentLink> =
                    (0..count).map(|i| hosts[i % hosts.len()].clone()).collect();
                Ok(StepAction::proceed(
                    PlacementSelectionSubStage::Selected,
                    PlacementSelectionPayload {
                        selected_host_links: Some(selected),
                        ..Default::default()
                    },
                ))
            }
            PlacementSelectionSubStage::Selected => {
                Ok(StepAction::complete(Default::default()))
            }
            _ => Ok(StepAction::AwaitCallbacks),
        }
    }

    fn finished_response(&self, state: &TaskState<Self::SubStage, Self::Payload>) -> Value {
        json!({ "selected_host_links": state.payload.selected_host_links })
    }

    fn status_resource_links(
        &self,
        state: &TaskState<Self::SubStage, Self::Payload>,
    ) -> Option<Vec<DocumentLink>> {
        state.payload.selected_host_links.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskCreate, TaskStage};
    use crate::impls::InMemoryStore;
    use crate::workflows::testkit::{await_stage, seed_pool};

    fn host_with_task() -> Arc<ServiceHost> {
        ServiceHost::builder(Arc::new(InMemoryStore::new()))
            .register(PlacementSelectionTask)
            .build()
    }

    async fn run_selection(
        host: &Arc<ServiceHost>,
        pool: DocumentLink,
        count: u32,
    ) -> Vec<DocumentLink> {
        let create = TaskCreate::new(PlacementSelectionPayload {
            pool_link: Some(pool),
            resource_count: Some(count),
            selected_host_links: None,
        });
        let link = host
            .start_task(
                PlacementSelectionTask::FACTORY,
                serde_json::to_value(create).unwrap(),
            )
            .await
            .unwrap();
        let status = await_stage(host, &link, TaskStage::Finished).await;
        assert_eq!(status.progress, 100);
        status.resource_links.expect("selection reports links")
    }

    #[tokio::test]
    async fn spreads_selection_across_pool_hosts() {
        let host = host_with_task();
        let pool = seed_pool(&host, 2).await;
        let selected = run_selection(&host, pool, 5).await;
        assert_eq!(selected.len(), 5);
        let distinct: std::collections::HashSet<_> =
            selected.iter().map(|l| l.as_str()).collect();
        assert_eq!(distinct.len(), 2, "both hosts should be used");
    }

    #[tokio::test]
    async fn powered_off_hosts_are_skipped() {
        let host = host_with_task();
        let pool = seed_pool(&host, 1).await;
        crate::workflows::resources::create_document(
            &host,
            kinds::HOST,
            Vec::new(),
            &crate::workflows::resources::ComputeState {
                name: "host-off".into(),
                power_state: crate::workflows::resources::PowerState::Off,
                pool_link: Some(pool.clone()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let selected = run_selection(&host, pool, 4).await;
        let distinct: std::collections::HashSet<_> =
            selected.iter().map(|l| l.as_str()).collect();
        assert_eq!(distinct.len(), 1, "only the powered-on host qualifies");
    }

    #[tokio::test]
    async fn empty_pool_fails_the_task() {
        let host = host_with_task();
        let pool = seed_pool(&host, 0).await;
        let create = TaskCreate::new(PlacementSelectionPayload {
            pool_link: Some(pool),
            resource_count: Some(2),
            selected_host_links: None,
        });
        let link = host
            .start_task(
                PlacementSelectionTask::FACTORY,
                serde_json::to_value(create).unwrap(),
            )
            .await
            .unwrap();
        let status = await_stage(&host, &link, TaskStage::Failed).await;
        assert!(
            status.failure.unwrap().message.contains("no powered-on hosts")
        );
    }

    #[tokio::test]
    async fn zero_count_is_rejected_before_persisting() {
        let store = Arc::new(InMemoryStore::new());
        let host = ServiceHost::builder(store.clone())
            .register(PlacementSelectionTask)
            .build();
        let create = TaskCreate::new(PlacementSelectionPayload {
            pool_link: Some(DocumentLink::from_path("/resources/pools/p")),
            resource_count: Some(0),
            selected_host_links: None,
        });
        let err = host
            .start_task(
                PlacementSelectionTask::FACTORY,
                serde_json::to_value(create).unwrap(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert!(store.is_empty().await, "nothing may persist on rejection");
    }
}
