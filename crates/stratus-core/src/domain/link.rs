//! Document links: the identity of every persisted document.
//!
//! A link is a path of the form `{factory}/{id}` where the factory prefix
//! identifies the document kind or the task service that owns it, and the id
//! is a ULID minted at creation time. ULIDs sort by creation time and can be
//! generated on any node without coordination.

use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;

/// Identity of a persisted document.
///
/// The link is the unit of mutual exclusion: the substrate serializes
/// updates per link, and nothing else is shared mutable state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentLink(String);

impl DocumentLink {
    /// Mint a fresh link under the given factory prefix.
    pub fn mint(factory: &str) -> Self {
        Self(format!("{}/{}", factory.trim_end_matches('/'), Ulid::new()))
    }

    pub fn from_path(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The factory prefix, i.e. everything up to the last `/`.
    pub fn factory(&self) -> &str {
        match self.0.rsplit_once('/') {
            Some((prefix, _)) => prefix,
            None => &self.0,
        }
    }

    /// The id segment after the factory prefix.
    pub fn id(&self) -> &str {
        match self.0.rsplit_once('/') {
            Some((_, id)) => id,
            None => &self.0,
        }
    }
}

impl fmt::Display for DocumentLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for DocumentLink {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_links_carry_factory_prefix() {
        let link = DocumentLink::mint("/resources/computes");
        assert_eq!(link.factory(), "/resources/computes");
        assert!(link.as_str().starts_with("/resources/computes/"));
        assert!(!link.id().is_empty());
    }

    #[test]
    fn minted_links_are_unique() {
        let a = DocumentLink::mint("/tasks/t");
        let b = DocumentLink::mint("/tasks/t");
        assert_ne!(a, b);
    }

    #[test]
    fn serializes_as_plain_string() {
        let link = DocumentLink::from_path("/tasks/t/abc");
        let s = serde_json::to_string(&link).unwrap();
        assert_eq!(s, "\"/tasks/t/abc\"");
        let back: DocumentLink = serde_json::from_str(&s).unwrap();
        assert_eq!(back, link);
    }
}
