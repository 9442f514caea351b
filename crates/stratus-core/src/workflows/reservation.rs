//! Reservation: pick a group placement with enough free capacity and
//! claim it.
//!
//! Selection is a capacity query over the placement documents (enough
//! `available_instances`, or unmetered); the claim is a versioned
//! decrement on the chosen placement, so two reservations racing for
//! the last slots cannot both win.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::info;

use crate::domain::{
    DocumentLink, Mergeable, SubStage, TaskState, merge_if_some, merge_once,
};
use crate::engine::{ServiceHost, StepAction, TaskWorkflow};
use crate::error::EngineError;
use crate::query::{Clause, Occurrence, QuerySpec, collect_links};
use crate::workflows::resources::{self, PlacementState, kinds};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationSubStage {
    Created,
    Selected,
    Reserved,
    Completed,
    Error,
}

impl SubStage for ReservationSubStage {
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
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReservationPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_count: Option<u32>,

    /// Optional scope: only placements of this pool qualify.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_link: Option<DocumentLink>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placement_link: Option<DocumentLink>,
}

impl Mergeable for ReservationPayload {
    fn merge_patch(&mut self, patch: Self) {
        merge_once(&mut self.resource_count, patch.resource_count);
        merge_once(&mut self.pool_link, patch.pool_link);
        merge_if_some(&mut self.placement_link, patch.placement_link);
    }

    fn apply_override(&mut self, patch: Self) {
        merge_if_some(&mut self.resource_count, patch.resource_count);
        merge_if_some(&mut self.pool_link, patch.pool_link);
        merge_if_some(&mut self.placement_link, patch.placement_link);
    }
}

pub struct ReservationTask;

impl ReservationTask {
    /// Decrement the placement's capacity, or refuse if the remaining
    /// slots no longer cover the request.
    async fn claim(
        host: &Arc<ServiceHost>,
        placement: &DocumentLink,
        count: u64,
    ) -> Result<(), EngineError> {
        loop {
            let doc = host.store().get(placement).await?;
            let mut p: PlacementState = serde_json::from_value(doc.body)?;
            if p.max_instances != 0 {
                if p.available_instances < count {
                    return Err(EngineError::Other(format!(
                        "placement {placement} is out of capacity"
                    )));
                }
                p.available_instances -= count;
            }
            let body = serde_json::to_value(&p)?;
            match host.store().update(placement, doc.version, body).await {
                Ok(_) => {
                    info!(
                        placement = %placement,
                        count,
                        remaining = p.available_instances,
                        "capacity reserved"
                    );
                    return Ok(());
                }
                Err(EngineError::VersionConflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl TaskWorkflow for ReservationTask {
    type SubStage = ReservationSubStage;
    type Payload = ReservationPayload;

    const FACTORY: &'static str = "/tasks/reservations";
    const DISPLAY_NAME: &'static str = "reservation";

    fn validate_initial(&self, payload: &Self::Payload) -> Result<(), EngineError> {
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
            ReservationSubStage::Created => {
                let count = state.payload.resource_count.unwrap_or(1);

                // enough free slots, or an unmetered placement
                let mut spec = QuerySpec::for_kind(kinds::PLACEMENT)
                    .any_of(vec![
                        Clause::Range {
                            path: "available_instances".into(),
                            min: Some(f64::from(count)),
                            max: None,
                            occurrence: Occurrence::Should,
                        },
                        Clause::Field {
                            path: "max_instances".into(),
                            value: 0.into(),
                            occurrence: Occurrence::Should,
                        },
                    ])
                    .tenanted(&state.tenant_links);
                if let Some(pool) = &state.payload.pool_link {
                    spec = spec.field("pool_link", pool.as_str());
                }

                let candidates = collect_links(host.store().as_ref(), &spec).await?;
                if candidates.is_empty() {
                    return Err(EngineError::Other(
                        "no placement with enough capacity".into(),
                    ));
                }

                // prefer unmetered placements, then the most headroom
                let mut best: Option<(DocumentLink, u64)> = None;
                for candidate in candidates {
                    let p: PlacementState =
                        resources::get_document(host, &candidate).await?;
                    let headroom = if p.max_instances == 0 {
                        u64::MAX
                    } else {
                        p.available_instances
                    };
                    if best.as_ref().is_none_or(|(_, h)| headroom > *h) {
                        best = Some((candidate, headroom));
                    }
                }
                let (placement, _) =
                    best.ok_or_else(|| EngineError::Other("no placement selected".into()))?;

                Ok(StepAction::proceed(
                    ReservationSubStage::Selected,
                    ReservationPayload {
                        placement_link: Some(placement),
                        ..Default::default()
                    },
                ))
            }

            ReservationSubStage::Selected => {
                let placement = state
                    .payload
                    .placement_link
                    .clone()
                    .ok_or_else(|| EngineError::Other("no placement selected".into()))?;
                let count = u64::from(state.payload.resource_count.unwrap_or(1));
                Self::claim(host, &placement, count).await?;
                Ok(StepAction::proceed(
                    ReservationSubStage::Reserved,
                    Default::default(),
                ))
            }

            ReservationSubStage::Reserved => Ok(StepAction::complete(Default::default())),

            _ => Ok(StepAction::AwaitCallbacks),
        }
    }

    fn finished_response(&self, state: &TaskState<Self::SubStage, Self::Payload>) -> Value {
        json!({ "placement_link": state.payload.placement_link })
    }

    fn status_resource_links(
        &self,
        state: &TaskState<Self::SubStage, Self::Payload>,
    ) -> Option<Vec<DocumentLink>> {
        state.payload.placement_link.clone().map(|l| vec![l])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskCreate, TaskStage};
    use crate::impls::InMemoryStore;
    use crate::workflows::testkit::await_stage;
    use std::time::Duration;

    fn host_with_task() -> Arc<ServiceHost> {
        ServiceHost::builder(Arc::new(InMemoryStore::new()))
            .register(ReservationTask)
            .build()
    }

    async fn seed_placement(
        host: &Arc<ServiceHost>,
        name: &str,
        max: u64,
        available: u64,
    ) -> DocumentLink {
        resources::create_document(
            host,
            kinds::PLACEMENT,
            Vec::new(),
            &PlacementState {
                name: name.into(),
                max_instances: max,
                available_instances: available,
                ..Default::default()
            },
        )
        .await
        .unwrap()
    }

    async fn start_reservation(host: &Arc<ServiceHost>, count: u32) -> DocumentLink {
        let create = TaskCreate::new(ReservationPayload {
            resource_count: Some(count),
            ..Default::default()
        });
        host.start_task(
            ReservationTask::FACTORY,
            serde_json::to_value(create).unwrap(),
        )
        .await
        .unwrap()
    }

    /// Poll until the task settles on either terminal stage.
    async fn terminal_stage(host: &Arc<ServiceHost>, link: &DocumentLink) -> TaskStage {
        for _ in 0..400 {
            let status = host.status(link).await.expect("task disappeared");
            if status.stage.is_terminal() {
                return status.stage;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task never reached a terminal stage");
    }

    #[tokio::test]
    async fn reserves_from_the_placement_with_most_headroom() {
        let host = host_with_task();
        let tight = seed_placement(&host, "tight", 10, 1).await;
        let roomy = seed_placement(&host, "roomy", 10, 8).await;

        let task = start_reservation(&host, 5).await;
        let status = await_stage(&host, &task, TaskStage::Finished).await;
        assert_eq!(status.resource_links, Some(vec![roomy.clone()]));

        let p: PlacementState = resources::get_document(&host, &roomy).await.unwrap();
        assert_eq!(p.available_instances, 3);
        let p: PlacementState = resources::get_document(&host, &tight).await.unwrap();
        assert_eq!(p.available_instances, 1, "the losing placement is untouched");
    }

    #[tokio::test]
    async fn unmetered_placement_accepts_any_count() {
        let host = host_with_task();
        let unmetered = seed_placement(&host, "open", 0, 0).await;

        let task = start_reservation(&host, 100).await;
        let status = await_stage(&host, &task, TaskStage::Finished).await;
        assert_eq!(status.resource_links, Some(vec![unmetered.clone()]));

        let p: PlacementState = resources::get_document(&host, &unmetered).await.unwrap();
        assert_eq!(p.available_instances, 0, "unmetered capacity is not tracked");
    }

    #[tokio::test]
    async fn insufficient_capacity_fails_the_task() {
        let host = host_with_task();
        seed_placement(&host, "small", 10, 2).await;

        let task = start_reservation(&host, 5).await;
        let status = await_stage(&host, &task, TaskStage::Failed).await;
        assert!(
            status
                .failure
                .unwrap()
                .message
                .contains("no placement with enough capacity")
        );
    }

    #[tokio::test]
    async fn racing_reservations_cannot_oversubscribe() {
        let host = host_with_task();
        let placement = seed_placement(&host, "last-slot", 1, 1).await;

        let a = start_reservation(&host, 1).await;
        let b = start_reservation(&host, 1).await;
        let outcomes = [
            terminal_stage(&host, &a).await,
            terminal_stage(&host, &b).await,
        ];

        let wins = outcomes
            .iter()
            .filter(|s| **s == TaskStage::Finished)
            .count();
        assert_eq!(wins, 1, "exactly one reservation may claim the last slot");
        let p: PlacementState = resources::get_document(&host, &placement).await.unwrap();
        assert_eq!(p.available_instances, 0);
    }

    #[tokio::test]
    async fn zero_count_is_rejected() {
        let host = host_with_task();
        let create = TaskCreate::new(ReservationPayload {
            resource_count: Some(0),
            ..Default::default()
        });
        let err = host
            .start_task(
                ReservationTask::FACTORY,
                serde_json::to_value(create).unwrap(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn pool_scope_excludes_other_pools() {
        let host = host_with_task();
        let pool = DocumentLink::from_path("/resources/pools/scoped");
        let other = seed_placement(&host, "elsewhere", 10, 10).await;
        let scoped = resources::create_document(
            &host,
            kinds::PLACEMENT,
            Vec::new(),
            &PlacementState {
                name: "in-pool".into(),
                pool_link: Some(pool.clone()),
                max_instances: 10,
                available_instances: 4,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let create = TaskCreate::new(ReservationPayload {
            resource_count: Some(2),
            pool_link: Some(pool),
            ..Default::default()
        });
        let task = host
            .start_task(
                ReservationTask::FACTORY,
                serde_json::to_value(create).unwrap(),
            )
            .await
            .unwrap();
        let status = await_stage(&host, &task, TaskStage::Finished).await;
        assert_eq!(status.resource_links, Some(vec![scoped.clone()]));

        let p: PlacementState = resources::get_document(&host, &other).await.unwrap();
        assert_eq!(p.available_instances, 10);
        let p: PlacementState = resources::get_document(&host, &scoped).await.unwrap();
        assert_eq!(p.available_instances, 2);
    }
}
