//! Paged query driver.
//!
//! Walks query pages until the store stops returning a continuation. Any
//! page-level failure aborts the walk and surfaces as the query's result;
//! callers never observe a partially delivered result set.

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::domain::DocumentLink;
use crate::error::EngineError;
use crate::ports::{DocumentStore, QueryPage};
use crate::query::QuerySpec;

/// Upper bound on pages walked before the driver assumes a continuation
/// loop and aborts.
const MAX_PAGES: usize = 10_000;

/// Drive the query page by page, handing each page to `handle`.
pub async fn for_each_page<F>(
    store: &dyn DocumentStore,
    spec: &QuerySpec,
    mut handle: F,
) -> Result<(), EngineError>
where
    F: FnMut(&QueryPage) -> Result<(), EngineError> + Send,
{
    let mut token: Option<String> = None;
    for _ in 0..MAX_PAGES {
        let page = store.query(spec, token.as_deref()).await?;
        handle(&page)?;
        match page.next_page {
            Some(next) => token = Some(next),
            None => return Ok(()),
        }
    }
    Err(EngineError::Query(format!(
        "query exceeded {MAX_PAGES} pages"
    )))
}

/// Collect every matching link across all pages.
pub async fn collect_links(
    store: &dyn DocumentStore,
    spec: &QuerySpec,
) -> Result<Vec<DocumentLink>, EngineError> {
    let mut links = Vec::new();
    for_each_page(store, spec, |page| {
        links.extend(page.links.iter().cloned());
        Ok(())
    })
    .await?;
    Ok(links)
}

/// Collect every matching body, deserialized as `T`. The spec must ask
/// for expansion; without it the store returns links only.
pub async fn collect_documents<T: DeserializeOwned>(
    store: &dyn DocumentStore,
    spec: &QuerySpec,
) -> Result<Vec<T>, EngineError> {
    let mut bodies: Vec<Value> = Vec::new();
    for_each_page(store, spec, |page| {
        bodies.extend(page.documents.iter().cloned());
        Ok(())
    })
    .await?;
    bodies
        .into_iter()
        .map(|body| serde_json::from_value(body).map_err(EngineError::from))
        .collect()
}
