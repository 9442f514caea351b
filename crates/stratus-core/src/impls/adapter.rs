//! MockAdapter: a scriptable provider stand-in.
//!
//! Succeeds by default and hands back provider-assigned fields for create
//! requests. Tests script failures per resource link and health-check
//! flakiness to drive the error paths.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use ulid::Ulid;

use crate::domain::DocumentLink;
use crate::error::EngineError;
use crate::ports::{AdapterRequest, AdapterRequestKind, ResourceAdapter};

#[derive(Default)]
pub struct MockAdapter {
    failing_links: Mutex<HashSet<String>>,
    /// Per-link count of health probes that report unhealthy before the
    /// probe starts succeeding.
    unhealthy_probes: Mutex<HashMap<String, u32>>,
    requests: Mutex<Vec<AdapterRequest>>,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every request against `link` fail.
    pub fn fail_for(&self, link: &DocumentLink) {
        self.failing_links
            .lock()
            .unwrap()
            .insert(link.as_str().to_string());
    }

    /// Make the first `count` health probes of `link` report unhealthy.
    pub fn unhealthy_for(&self, link: &DocumentLink, count: u32) {
        self.unhealthy_probes
            .lock()
            .unwrap()
            .insert(link.as_str().to_string(), count);
    }

    pub fn requests(&self) -> Vec<AdapterRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResourceAdapter for MockAdapter {
    async fn execute(&self, request: AdapterRequest) -> Result<Value, EngineError> {
        self.requests.lock().unwrap().push(request.clone());
        if self
            .failing_links
            .lock()
            .unwrap()
            .contains(request.resource_link.as_str())
        {
            return Err(EngineError::Adapter(format!(
                "provider rejected {} for {}",
                serde_json::to_string(&request.kind)?,
                request.resource_link
            )));
        }
        Ok(match request.kind {
            AdapterRequestKind::Create => json!({
                "instance_id": Ulid::new().to_string(),
                "address": format!("10.0.0.{}", rand::random::<u8>()),
            }),
            _ => json!({}),
        })
    }

    async fn health(&self, resource_link: &DocumentLink) -> Result<bool, EngineError> {
        let mut probes = self.unhealthy_probes.lock().unwrap();
        match probes.get_mut(resource_link.as_str()) {
            Some(0) | None => Ok(true),
            Some(remaining) => {
                *remaining -= 1;
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_reports_assigned_fields() {
        let adapter = MockAdapter::new();
        let link = DocumentLink::from_path("/resources/compute/1");
        let out = adapter
            .execute(AdapterRequest::new(link, AdapterRequestKind::Create))
            .await
            .unwrap();
        assert!(out["instance_id"].is_string());
        assert!(out["address"].is_string());
    }

    #[tokio::test]
    async fn scripted_failure_surfaces_as_adapter_error() {
        let adapter = MockAdapter::new();
        let link = DocumentLink::from_path("/resources/compute/1");
        adapter.fail_for(&link);
        let err = adapter
            .execute(AdapterRequest::new(link, AdapterRequestKind::Remove))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Adapter(_)));
    }

    #[tokio::test]
    async fn health_recovers_after_scripted_probes() {
        let adapter = MockAdapter::new();
        let link = DocumentLink::from_path("/resources/compute/1");
        adapter.unhealthy_for(&link, 2);
        assert!(!adapter.health(&link).await.unwrap());
        assert!(!adapter.health(&link).await.unwrap());
        assert!(adapter.health(&link).await.unwrap());
    }
}
