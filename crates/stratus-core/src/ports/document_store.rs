//! DocumentStore port: the versioned document index.
//!
//! Every task, resource and counter lives here as a JSON document under a
//! unique link. Updates are optimistic: callers read a version, compute a
//! new body, and write back conditioned on that version. The engine's
//! patch loop retries on conflict.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::domain::DocumentLink;
use crate::error::EngineError;
use crate::query::QuerySpec;

/// A stored document plus its index metadata.
#[derive(Debug, Clone)]
pub struct Document {
    pub link: DocumentLink,

    /// Document kind, matching the owning service's factory path.
    pub kind: String,

    /// Monotonic per-document version, bumped on every update.
    pub version: u64,

    pub tenant_links: Vec<String>,

    /// Past this instant the document is gone: reads fail and late patches
    /// become no-ops.
    pub expiration: Option<DateTime<Utc>>,

    pub body: Value,

    pub updated_at: DateTime<Utc>,
}

/// One page of query results.
#[derive(Debug, Clone, Default)]
pub struct QueryPage {
    pub links: Vec<DocumentLink>,

    /// Expanded bodies, parallel to `links`, when the spec asked for them.
    pub documents: Vec<Value>,

    /// Opaque continuation; `None` on the last page.
    pub next_page: Option<String>,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Persist a new document at `link`. Fails with `AlreadyExists` if the
    /// link is taken.
    async fn create(&self, doc: Document) -> Result<(), EngineError>;

    /// Read the current document. `Gone` if it expired, `NotFound` if it
    /// never existed or was deleted.
    async fn get(&self, link: &DocumentLink) -> Result<Document, EngineError>;

    /// Replace the body conditioned on `expected_version`; bumps the
    /// version. `VersionConflict` tells the caller to re-read and retry.
    async fn update(
        &self,
        link: &DocumentLink,
        expected_version: u64,
        body: Value,
    ) -> Result<Document, EngineError>;

    /// Remove the document. Deleting an absent document is a no-op.
    async fn delete(&self, link: &DocumentLink) -> Result<(), EngineError>;

    /// Run one page of a query. `page_token` of `None` starts from the
    /// beginning; the returned page carries the next token.
    async fn query(
        &self,
        spec: &QuerySpec,
        page_token: Option<&str>,
    ) -> Result<QueryPage, EngineError>;
}
