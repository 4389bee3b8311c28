//! fleetq core types: indexed objects, query descriptors, query options and ingest events.

#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub mod event;

pub use event::ObjectEvent;

/// Label pairs as observed on the resource.
pub type Labels = SmallVec<[(String, String); 8]>;

/// Field used for ordering when the caller does not name one.
pub const DEFAULT_SORT_FIELD: &str = "name";

/// Marker prefix that flips a sort field to descending.
pub const DESCENDING_MARKER: char = '-';

/// A resource object collected from one cluster.
///
/// The full record (including `payload`) lives in the object store; the index only
/// keeps the scalar fields and labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Object {
    pub id: String,
    pub cluster: String,
    pub namespace: String,
    pub kind: String,
    pub name: String,
    pub api_group: String,
    pub api_version: String,
    pub status: String,
    pub message: String,
    pub category: String,
    pub tenant: String,
    /// Seconds since epoch, from `metadata.creationTimestamp` when known.
    pub created_at: i64,
    pub labels: Labels,
    pub payload: serde_json::Value,
}

#[derive(Debug, thiserror::Error)]
pub enum ObjectError {
    #[error("object has no metadata.name")]
    MissingName,
    #[error("object has no kind")]
    MissingKind,
}

impl Object {
    /// Stable identifier across clusters: `cluster/namespace/kind/name`.
    pub fn make_id(cluster: &str, namespace: &str, kind: &str, name: &str) -> String {
        format!("{}/{}/{}/{}", cluster, namespace, kind, name)
    }

    pub fn new(cluster: &str, namespace: &str, kind: &str, name: &str) -> Self {
        Self {
            id: Self::make_id(cluster, namespace, kind, name),
            cluster: cluster.to_string(),
            namespace: namespace.to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Shape a raw Kubernetes object (as JSON) observed on `cluster`.
    pub fn from_k8s(cluster: &str, raw: serde_json::Value) -> Result<Self, ObjectError> {
        let meta = raw.get("metadata");
        let name = meta.and_then(|m| m.get("name")).and_then(|v| v.as_str()).ok_or(ObjectError::MissingName)?.to_string();
        let namespace = meta.and_then(|m| m.get("namespace")).and_then(|v| v.as_str()).unwrap_or("").to_string();
        let kind = raw.get("kind").and_then(|v| v.as_str()).ok_or(ObjectError::MissingKind)?.to_string();
        let (api_group, api_version) = match raw.get("apiVersion").and_then(|v| v.as_str()) {
            Some(gv) => match gv.split_once('/') {
                Some((g, v)) => (g.to_string(), v.to_string()),
                None => (String::new(), gv.to_string()),
            },
            None => (String::new(), String::new()),
        };
        let created_at = meta
            .and_then(|m| m.get("creationTimestamp"))
            .and_then(|v| v.as_str())
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.timestamp())
            .unwrap_or(0);
        let mut labels = Labels::new();
        if let Some(map) = meta.and_then(|m| m.get("labels")).and_then(|v| v.as_object()) {
            for (k, v) in map.iter() {
                if let Some(v) = v.as_str() { labels.push((k.clone(), v.to_string())); }
            }
        }
        let status = raw
            .pointer("/status/phase")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        Ok(Self {
            id: Self::make_id(cluster, &namespace, &kind, &name),
            cluster: cluster.to_string(),
            namespace,
            kind,
            name,
            api_group,
            api_version,
            status,
            created_at,
            labels,
            payload: raw,
            ..Default::default()
        })
    }

    /// Scalar field by (case-insensitive) name. `None` for unknown fields.
    pub fn field(&self, name: &str) -> Option<&str> {
        let v = match name.to_ascii_lowercase().as_str() {
            "id" => &self.id,
            "cluster" => &self.cluster,
            "namespace" => &self.namespace,
            "kind" => &self.kind,
            "name" => &self.name,
            "api_group" => &self.api_group,
            "api_version" => &self.api_version,
            "status" => &self.status,
            "message" => &self.message,
            "category" => &self.category,
            "tenant" => &self.tenant,
            _ => return None,
        };
        Some(v.as_str())
    }

    /// Labels rendered as `key=value`, the form used by label filters.
    pub fn label_pairs(&self) -> impl Iterator<Item = String> + '_ {
        self.labels.iter().map(|(k, v)| format!("{}={}", k, v))
    }
}

/// Search request: free text plus structured filter expressions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Query {
    /// Free text; empty matches everything.
    pub terms: String,
    /// Filter expressions, AND-ed together. e.g. `namespace:default`, `labels:"app=web"`.
    pub filters: Vec<String>,
}

impl Query {
    pub fn all() -> Self { Self::default() }

    pub fn terms(terms: impl Into<String>) -> Self {
        Self { terms: terms.into(), filters: Vec::new() }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filters.push(filter.into());
        self
    }
}

/// Result shaping for a search.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryOptions {
    /// Sort field; `None` (or empty) sorts by name.
    pub order_by: Option<String>,
    /// Descending unless set.
    pub ascending: bool,
    /// Leading hits to skip.
    pub offset: usize,
}

impl QueryOptions {
    pub fn ascending() -> Self { Self { ascending: true, ..Default::default() } }

    pub fn order_by(mut self, field: impl Into<String>) -> Self {
        self.order_by = Some(field.into());
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Resolve the sort directive these options describe.
    pub fn sort_by(&self) -> SortBy {
        let field = match self.order_by.as_deref().map(str::trim) {
            Some(f) if !f.is_empty() => f,
            _ => DEFAULT_SORT_FIELD,
        };
        SortBy { field: field.to_ascii_lowercase(), descending: !self.ascending }
    }
}

/// Sort directive: a field name, descending when written with a `-` prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SortBy {
    pub field: String,
    pub descending: bool,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("empty sort field in {0:?}")]
pub struct SortByError(pub String);

impl FromStr for SortBy {
    type Err = SortByError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (descending, field) = match s.strip_prefix(DESCENDING_MARKER) {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        if field.is_empty() { return Err(SortByError(s.to_string())); }
        Ok(Self { field: field.to_ascii_lowercase(), descending })
    }
}

impl fmt::Display for SortBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.descending { write!(f, "{}{}", DESCENDING_MARKER, self.field) } else { f.write_str(&self.field) }
    }
}

/// Case-folded form of a value used for ordering: `alpha` sorts before `Zeta`.
pub fn sort_key(value: &str) -> String { value.to_lowercase() }

impl SortBy {
    /// Order two `(sort key, id)` pairs, where the key is already folded by [`sort_key`].
    /// Ties on the key fall back to the raw id so that descending order is always the exact
    /// reverse of ascending.
    pub fn compare_keys(&self, a: (&str, &str), b: (&str, &str)) -> Ordering {
        let ord = a.0.cmp(b.0).then_with(|| a.1.cmp(b.1));
        if self.descending { ord.reverse() } else { ord }
    }
}

/// Order full objects the way the index orders their projections.
pub fn compare_objects(sort: &SortBy, a: &Object, b: &Object) -> Ordering {
    let av = sort_key(a.field(&sort.field).unwrap_or(""));
    let bv = sort_key(b.field(&sort.field).unwrap_or(""));
    sort.compare_keys((&av, &a.id), (&bv, &b.id))
}

/// Distinct values per faceted field, keyed by display label (`Kind`, `Namespace`, ...).
pub type Facets = std::collections::BTreeMap<String, Vec<String>>;

pub mod prelude {
    pub use super::{compare_objects, sort_key, Facets, Labels, Object, ObjectEvent, Query, QueryOptions, SortBy};
}
