//! Narrow resource document shapes and store helpers.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::domain::DocumentLink;
use crate::engine::ServiceHost;
use crate::error::EngineError;
use crate::ports::Document;

pub mod kinds {
    pub const COMPUTE: &str = "/resources/compute";
    pub const HOST: &str = "/resources/hosts";
    pub const NETWORK: &str = "/resources/networks";
    pub const LOAD_BALANCER: &str = "/resources/load-balancers";
    pub const POOL: &str = "/resources/pools";
    pub const PLACEMENT: &str = "/resources/placements";
    pub const GROUP: &str = "/resources/groups";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PowerState {
    On,
    Off,
    #[default]
    Unknown,
}

/// A compute instance document. Hosts use the same shape under the
/// host kind, with `pool_link` naming the pool they serve.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComputeState {
    pub name: String,

    #[serde(default)]
    pub power_state: PowerState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_link: Option<DocumentLink>,

    /// The host this instance is placed on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_link: Option<DocumentLink>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// The allocation task that created this document; allocation queries
    /// its own resources back through this field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation_task_link: Option<DocumentLink>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub group_links: Vec<DocumentLink>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkState {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet_cidr: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadBalancerState {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_link: Option<DocumentLink>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourcePoolState {
    pub name: String,
}

/// A pre-reserved placement: points at one host within a pool. Allocation
/// requests may name a placement directly instead of a pool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlacementState {
    pub name: String,
    pub pool_link: Option<DocumentLink>,
    pub host_link: Option<DocumentLink>,

    /// Reservation capacity; `0` means the placement is unmetered.
    #[serde(default)]
    pub max_instances: u64,

    /// Remaining capacity. Reservations claim from this count with a
    /// versioned update, so concurrent claims cannot oversubscribe.
    #[serde(default)]
    pub available_instances: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceGroupState {
    pub name: String,
}

/// Persist a new resource document under `kind`, minting its link.
pub async fn create_document<T: Serialize>(
    host: &Arc<ServiceHost>,
    kind: &str,
    tenant_links: Vec<String>,
    state: &T,
) -> Result<DocumentLink, EngineError> {
    let link = DocumentLink::mint(kind);
    host.store()
        .create(Document {
            link: link.clone(),
            kind: kind.to_string(),
            version: 0,
            tenant_links,
            expiration: None,
            body: serde_json::to_value(state)?,
            updated_at: host.clock().now(),
        })
        .await?;
    Ok(link)
}

pub async fn get_document<T: DeserializeOwned>(
    host: &Arc<ServiceHost>,
    link: &DocumentLink,
) -> Result<T, EngineError> {
    let doc = host.store().get(link).await?;
    Ok(serde_json::from_value(doc.body)?)
}

/// Read-modify-write under optimistic concurrency.
pub async fn modify_document<T, F>(
    host: &Arc<ServiceHost>,
    link: &DocumentLink,
    mutate: F,
) -> Result<T, EngineError>
where
    T: Serialize + DeserializeOwned,
    F: Fn(&mut T),
{
    loop {
        let doc = host.store().get(link).await?;
        let mut state: T = serde_json::from_value(doc.body)?;
        mutate(&mut state);
        let body = serde_json::to_value(&state)?;
        match host.store().update(link, doc.version, body).await {
            Ok(_) => return Ok(state),
            Err(EngineError::VersionConflict { .. }) => continue,
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ServiceHost;
    use crate::impls::InMemoryStore;

    #[tokio::test]
    async fn modify_retries_into_a_new_version() {
        let host = ServiceHost::builder(Arc::new(InMemoryStore::new())).build();
        let link = create_document(
            &host,
            kinds::COMPUTE,
            Vec::new(),
            &ComputeState {
                name: "vm-1".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let updated: ComputeState = modify_document(&host, &link, |c: &mut ComputeState| {
            c.power_state = PowerState::On;
        })
        .await
        .unwrap();
        assert_eq!(updated.power_state, PowerState::On);

        let read: ComputeState = get_document(&host, &link).await.unwrap();
        assert_eq!(read.power_state, PowerState::On);
    }
}
