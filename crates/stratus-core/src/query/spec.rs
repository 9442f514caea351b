//! Query specification builder.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Page size applied when a spec does not set its own limit.
pub const DEFAULT_RESULT_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Occurrence {
    Must,
    Should,
    MustNot,
}

/// One boolean clause over a document field.
///
/// Field paths address the JSON body with dots (`"task_info.stage"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Clause {
    Field {
        path: String,
        value: Value,
        occurrence: Occurrence,
    },
    /// Glob match on a string field; `*` matches any run of characters.
    Wildcard {
        path: String,
        pattern: String,
        occurrence: Occurrence,
    },
    /// Inclusive numeric range; open ends are unbounded.
    Range {
        path: String,
        min: Option<f64>,
        max: Option<f64>,
        occurrence: Occurrence,
    },
    /// Nested boolean group, for should-of-musts shapes.
    Composite {
        clauses: Vec<Clause>,
        occurrence: Occurrence,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    /// Restrict to documents of one kind (a service factory path).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(default)]
    pub clauses: Vec<Clause>,

    /// Non-empty means: only documents sharing at least one tenant link.
    #[serde(default)]
    pub tenant_links: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,

    /// Return full bodies alongside links.
    #[serde(default)]
    pub expand: bool,
}

impl QuerySpec {
    pub fn for_kind(kind: impl Into<String>) -> Self {
        Self {
            kind: Some(kind.into()),
            clauses: Vec::new(),
            tenant_links: Vec::new(),
            limit: None,
            expand: false,
        }
    }

    pub fn field(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push(Clause::Field {
            path: path.into(),
            value: value.into(),
            occurrence: Occurrence::Must,
        });
        self
    }

    pub fn field_excluded(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push(Clause::Field {
            path: path.into(),
            value: value.into(),
            occurrence: Occurrence::MustNot,
        });
        self
    }

    pub fn wildcard(mut self, path: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.clauses.push(Clause::Wildcard {
            path: path.into(),
            pattern: pattern.into(),
            occurrence: Occurrence::Must,
        });
        self
    }

    pub fn range(mut self, path: impl Into<String>, min: Option<f64>, max: Option<f64>) -> Self {
        self.clauses.push(Clause::Range {
            path: path.into(),
            min,
            max,
            occurrence: Occurrence::Must,
        });
        self
    }

    /// Add a should-group: the document matches if any inner clause does.
    pub fn any_of(mut self, clauses: Vec<Clause>) -> Self {
        self.clauses.push(Clause::Composite {
            clauses,
            occurrence: Occurrence::Must,
        });
        self
    }

    pub fn tenanted(mut self, tenant_links: &[String]) -> Self {
        self.tenant_links = tenant_links.to_vec();
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn expand(mut self) -> Self {
        self.expand = true;
        self
    }

    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_RESULT_LIMIT).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builder_accumulates_clauses() {
        let spec = QuerySpec::for_kind("/resources/compute")
            .field("power_state", "ON")
            .field_excluded("lifecycle", json!("RETIRED"))
            .limit(10);
        assert_eq!(spec.kind.as_deref(), Some("/resources/compute"));
        assert_eq!(spec.clauses.len(), 2);
        assert_eq!(spec.effective_limit(), 10);
    }

    #[test]
    fn default_limit_applies_when_unset() {
        let spec = QuerySpec::for_kind("/tasks/x");
        assert_eq!(spec.effective_limit(), DEFAULT_RESULT_LIMIT);
    }
}
