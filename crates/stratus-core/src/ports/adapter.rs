//! ResourceAdapter port: provider-side instance operations.
//!
//! Workflows never talk to a cloud endpoint directly; they hand the
//! adapter one request per resource document and fold the outcome back
//! into their own state machine. A failed adapter call is an error value,
//! never a panic, so a partial fan-out can still be counted correctly.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::domain::DocumentLink;
use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdapterRequestKind {
    Create,
    Remove,
    PowerOn,
    PowerOff,
}

/// One instance operation against one resource document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterRequest {
    pub resource_link: DocumentLink,
    pub kind: AdapterRequestKind,

    #[serde(default)]
    pub custom_properties: BTreeMap<String, String>,
}

impl AdapterRequest {
    pub fn new(resource_link: DocumentLink, kind: AdapterRequestKind) -> Self {
        Self {
            resource_link,
            kind,
            custom_properties: BTreeMap::new(),
        }
    }
}

#[async_trait]
pub trait ResourceAdapter: Send + Sync {
    /// Run the operation to completion. On success the returned object
    /// carries provider-assigned fields (addresses, ids) for the caller to
    /// merge into the resource document.
    async fn execute(&self, request: AdapterRequest) -> Result<Value, EngineError>;

    /// Whether the provider currently reports the instance healthy.
    /// Used by post-provision checks under a bounded retry.
    async fn health(&self, resource_link: &DocumentLink) -> Result<bool, EngineError>;
}
