//! Access rule list shared with the search engine's enforcement layer
//!
//! The list is one JSON document, `{"acl": [...]}`. Every rule carries a
//! provenance tag in `aclSource`: operator-authored rules are `static` (or
//! untagged), rules written by an [`AclSynchronizer`] are `dynamic:<id>`.
//! A request is allowed when at least one rule matches it.

mod store;
mod sync;

pub use self::store::{JsonFileRuleStore, MemoryRuleStore, RuleStore, VersionedAcl};
#[cfg(test)]
pub use self::store::MockRuleStore;
pub use self::sync::{AclSynchronizer, SyncConfig, SyncOutcome, SyncStatus};

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::identity::AuthenticatedIdentity;

/// Prefix of synchronizer-owned provenance tags
pub const DYNAMIC_PREFIX: &str = "dynamic:";

/// Who owns a rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provenance {
    /// Operator-authored
    Static,
    /// Written by the synchronizer with this id
    Dynamic(String),
    /// Any other tag; left alone by every synchronizer
    Other(String),
}

impl Provenance {
    /// Parse an `aclSource` tag
    pub fn parse(tag: &str) -> Self {
        match tag {
            "" | "static" => Provenance::Static,
            _ => match tag.strip_prefix(DYNAMIC_PREFIX) {
                Some(id) => Provenance::Dynamic(id.to_string()),
                None => Provenance::Other(tag.to_string()),
            },
        }
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provenance::Static => f.write_str("static"),
            Provenance::Dynamic(id) => write!(f, "{}{}", DYNAMIC_PREFIX, id),
            Provenance::Other(tag) => f.write_str(tag),
        }
    }
}

/// One entry of the rule list
///
/// Keys this type does not model are kept in `extra` and written back
/// unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccessRule {
    /// Provenance tag
    #[serde(rename = "aclSource", default)]
    pub acl_source: String,
    /// Free-form comment; synchronizer rules store their `<project>:<role>` key here
    #[serde(rename = "__Comment__", default)]
    pub comment: String,
    /// Source hosts; empty means any
    #[serde(default)]
    pub hosts: Vec<String>,
    /// Principal names, `*` for everyone
    #[serde(default)]
    pub users: Vec<String>,
    /// Role names
    #[serde(default)]
    pub roles: Vec<String>,
    /// Index name patterns
    #[serde(default)]
    pub indices: Vec<String>,
    /// Index alias patterns
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Filters skipped for matching requests
    #[serde(default)]
    pub filters_bypass: Vec<String>,
    /// Filters executed for matching requests
    #[serde(default)]
    pub filters_execute: Vec<String>,
    /// Unmodeled keys
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AccessRule {
    /// Provenance parsed from `aclSource`
    pub fn provenance(&self) -> Provenance {
        Provenance::parse(&self.acl_source)
    }

    /// Whether this rule grants `identity` access to `index` from `host`
    pub fn matches(&self, identity: &AuthenticatedIdentity, host: Option<&str>, index: &str) -> bool {
        self.matches_principal(identity) && self.matches_host(host) && self.matches_index(index)
    }

    fn matches_principal(&self, identity: &AuthenticatedIdentity) -> bool {
        self.users
            .iter()
            .any(|u| u == "*" || *u == identity.username)
            || identity.roles.iter().any(|r| self.roles.contains(r))
    }

    fn matches_host(&self, host: Option<&str>) -> bool {
        if self.hosts.is_empty() {
            return true;
        }
        host.is_some_and(|h| self.hosts.iter().any(|p| wildcard_match(p, h)))
    }

    fn matches_index(&self, index: &str) -> bool {
        self.indices
            .iter()
            .chain(&self.aliases)
            .any(|p| wildcard_match(p, index))
    }
}

/// The full rule list document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AclDocument {
    /// Rules in evaluation order
    #[serde(default)]
    pub acl: Vec<AccessRule>,
    /// Unmodeled top-level keys
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AclDocument {
    /// Document holding `rules`
    pub fn new(rules: Vec<AccessRule>) -> Self {
        Self {
            acl: rules,
            extra: Map::new(),
        }
    }

    /// Parse the JSON wire form
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Internal(format!("invalid rule document: {}", e)))
    }

    /// Serialize to pretty-printed JSON
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::Internal(format!("failed to serialize rule document: {}", e)))
    }

    /// Borrowing iterator over the rules
    pub fn iter(&self) -> std::slice::Iter<'_, AccessRule> {
        self.acl.iter()
    }

    /// Rules with the given provenance, cloned so the document can be mutated while iterating
    pub fn with_provenance(&self, provenance: &Provenance) -> Vec<AccessRule> {
        self.acl
            .iter()
            .filter(|r| r.provenance() == *provenance)
            .cloned()
            .collect()
    }

    /// Remove the first rule equal to `rule`; returns whether one was found
    pub fn remove(&mut self, rule: &AccessRule) -> bool {
        match self.acl.iter().position(|r| r == rule) {
            Some(i) => {
                self.acl.remove(i);
                true
            }
            None => false,
        }
    }

    /// Whether any rule grants `identity` access to `index`
    pub fn permits(&self, identity: &AuthenticatedIdentity, host: Option<&str>, index: &str) -> bool {
        self.acl.iter().any(|r| r.matches(identity, host, index))
    }

    /// Number of rules
    pub fn len(&self) -> usize {
        self.acl.len()
    }

    /// Whether the document has no rules
    pub fn is_empty(&self) -> bool {
        self.acl.is_empty()
    }
}

impl IntoIterator for AclDocument {
    type Item = AccessRule;
    type IntoIter = std::vec::IntoIter<AccessRule>;

    fn into_iter(self) -> Self::IntoIter {
        self.acl.into_iter()
    }
}

impl<'a> IntoIterator for &'a AclDocument {
    type Item = &'a AccessRule;
    type IntoIter = std::slice::Iter<'a, AccessRule>;

    fn into_iter(self) -> Self::IntoIter {
        self.acl.iter()
    }
}

/// Glob match where `*` matches any run of characters and `?` exactly one
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            backtrack = Some((pi, ti));
            pi += 1;
        } else if let Some((star, matched)) = backtrack {
            pi = star + 1;
            ti = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|&c| c == '*')
}
