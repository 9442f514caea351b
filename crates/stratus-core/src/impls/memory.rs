//! InMemoryStore: a single-process document index.
//!
//! Good enough to run every workflow end to end: versioned updates,
//! lazy expiration, and a query evaluator covering the clause shapes the
//! workflows actually use. Not durable and not meant to be.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::domain::DocumentLink;
use crate::error::EngineError;
use crate::ports::{Clock, Document, DocumentStore, QueryPage, SystemClock};
use crate::query::{Clause, Occurrence, QuerySpec};

pub struct InMemoryStore {
    docs: Mutex<BTreeMap<String, Document>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            docs: Mutex::new(BTreeMap::new()),
            clock,
        }
    }

    /// Number of live (unexpired) documents, for tests.
    pub async fn len(&self) -> usize {
        let now = self.clock.now();
        let docs = self.docs.lock().await;
        docs.values().filter(|d| !expired(d, now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn expired(doc: &Document, now: DateTime<Utc>) -> bool {
    doc.expiration.is_some_and(|exp| exp <= now)
}

/// Resolve a dotted path (`"task_info.stage"`) inside a JSON body.
fn field_at<'a>(body: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = body;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// Glob match where `*` matches any run of characters.
fn wildcard_match(pattern: &str, input: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == input,
        Some((prefix, rest)) => {
            let Some(stripped) = input.strip_prefix(prefix) else {
                return false;
            };
            if rest.is_empty() {
                return true;
            }
            (0..=stripped.len())
                .filter(|i| stripped.is_char_boundary(*i))
                .any(|i| wildcard_match(rest, &stripped[i..]))
        }
    }
}

fn clause_matches(doc: &Document, clause: &Clause) -> bool {
    match clause {
        Clause::Field { path, value, .. } => field_at(&doc.body, path) == Some(value),
        Clause::Wildcard { path, pattern, .. } => field_at(&doc.body, path)
            .and_then(Value::as_str)
            .is_some_and(|s| wildcard_match(pattern, s)),
        Clause::Range { path, min, max, .. } => field_at(&doc.body, path)
            .and_then(Value::as_f64)
            .is_some_and(|n| min.is_none_or(|m| n >= m) && max.is_none_or(|m| n <= m)),
        Clause::Composite { clauses, .. } => clauses_match(doc, clauses),
    }
}

/// Boolean combination: every MUST holds, no MUST_NOT holds, and if any
/// SHOULD clauses are present at least one of them holds.
fn clauses_match(doc: &Document, clauses: &[Clause]) -> bool {
    let mut any_should = false;
    let mut should_hit = false;
    for clause in clauses {
        let occurrence = match clause {
            Clause::Field { occurrence, .. }
            | Clause::Wildcard { occurrence, .. }
            | Clause::Range { occurrence, .. }
            | Clause::Composite { occurrence, .. } => *occurrence,
        };
        match occurrence {
            Occurrence::Must => {
                if !clause_matches(doc, clause) {
                    return false;
                }
            }
            Occurrence::MustNot => {
                if clause_matches(doc, clause) {
                    return false;
                }
            }
            Occurrence::Should => {
                any_should = true;
                should_hit |= clause_matches(doc, clause);
            }
        }
    }
    !any_should || should_hit
}

fn spec_matches(doc: &Document, spec: &QuerySpec) -> bool {
    if let Some(kind) = &spec.kind
        && doc.kind != *kind
    {
        return false;
    }
    if !spec.tenant_links.is_empty()
        && !doc.tenant_links.is_empty()
        && !doc
            .tenant_links
            .iter()
            .any(|t| spec.tenant_links.contains(t))
    {
        return false;
    }
    clauses_match(doc, &spec.clauses)
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn create(&self, doc: Document) -> Result<(), EngineError> {
        let now = self.clock.now();
        let mut docs = self.docs.lock().await;
        if let Some(existing) = docs.get(doc.link.as_str())
            && !expired(existing, now)
        {
            return Err(EngineError::AlreadyExists(doc.link));
        }
        docs.insert(doc.link.as_str().to_string(), doc);
        Ok(())
    }

    async fn get(&self, link: &DocumentLink) -> Result<Document, EngineError> {
        let now = self.clock.now();
        let docs = self.docs.lock().await;
        match docs.get(link.as_str()) {
            Some(doc) if expired(doc, now) => Err(EngineError::Gone(link.clone())),
            Some(doc) => Ok(doc.clone()),
            None => Err(EngineError::NotFound(link.clone())),
        }
    }

    async fn update(
        &self,
        link: &DocumentLink,
        expected_version: u64,
        body: Value,
    ) -> Result<Document, EngineError> {
        let now = self.clock.now();
        let mut docs = self.docs.lock().await;
        let doc = docs
            .get_mut(link.as_str())
            .ok_or_else(|| EngineError::NotFound(link.clone()))?;
        if expired(doc, now) {
            return Err(EngineError::Gone(link.clone()));
        }
        if doc.version != expected_version {
            return Err(EngineError::VersionConflict {
                link: link.clone(),
                expected: expected_version,
                actual: doc.version,
            });
        }
        doc.version += 1;
        doc.body = body;
        doc.updated_at = now;
        Ok(doc.clone())
    }

    async fn delete(&self, link: &DocumentLink) -> Result<(), EngineError> {
        let mut docs = self.docs.lock().await;
        docs.remove(link.as_str());
        Ok(())
    }

    async fn query(
        &self,
        spec: &QuerySpec,
        page_token: Option<&str>,
    ) -> Result<QueryPage, EngineError> {
        let offset: usize = match page_token {
            Some(t) => t
                .parse()
                .map_err(|_| EngineError::Query(format!("bad page token: {t}")))?,
            None => 0,
        };
        let now = self.clock.now();
        let limit = spec.effective_limit();
        let docs = self.docs.lock().await;

        // BTreeMap iteration is link-ordered, which keeps offset paging
        // stable as long as the matched set does not change mid-walk.
        let matched: Vec<&Document> = docs
            .values()
            .filter(|d| !expired(d, now) && spec_matches(d, spec))
            .collect();

        let page: Vec<&Document> = matched.iter().skip(offset).take(limit).copied().collect();
        let next_page = if offset + page.len() < matched.len() {
            Some((offset + page.len()).to_string())
        } else {
            None
        };
        Ok(QueryPage {
            links: page.iter().map(|d| d.link.clone()).collect(),
            documents: if spec.expand {
                page.iter().map(|d| d.body.clone()).collect()
            } else {
                Vec::new()
            },
            next_page,
        })
    }
}
