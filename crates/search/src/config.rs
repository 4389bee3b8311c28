//! Indexer tuning. Every knob has a default and an optional `FLEETQ_*` env override.

use serde::Deserialize;

/// Label shown to clients and the indexed field it aggregates.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FacetField {
    pub label: String,
    pub field: String,
}

impl FacetField {
    pub fn new(label: &str, field: &str) -> Self {
        Self { label: label.to_string(), field: field.to_string() }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Maximum hits one search returns (after offset).
    pub result_cap: usize,
    /// Maximum distinct values reported per facet.
    pub facet_size: usize,
    pub facet_fields: Vec<FacetField>,
    /// Deletes committed per chunk in `remove_by_query`.
    pub remove_batch_size: usize,
    pub writer_heap_bytes: usize,
    /// Rows hydrated per store call by `SearchIter::rows`.
    pub lookahead: usize,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            result_cap: 1000,
            facet_size: 100,
            facet_fields: vec![
                FacetField::new("Kind", "kind"),
                FacetField::new("Namespace", "namespace"),
                FacetField::new("Cluster", "cluster"),
            ],
            remove_batch_size: 512,
            writer_heap_bytes: 50_000_000,
            lookahead: 32,
        }
    }
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|s| s.parse::<usize>().ok())
}

impl IndexerConfig {
    /// Defaults overridden by `FLEETQ_RESULT_CAP`, `FLEETQ_FACET_SIZE`, `FLEETQ_REMOVE_BATCH`,
    /// `FLEETQ_WRITER_HEAP_BYTES` and `FLEETQ_LOOKAHEAD`.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = env_usize("FLEETQ_RESULT_CAP") { cfg.result_cap = v; }
        if let Some(v) = env_usize("FLEETQ_FACET_SIZE") { cfg.facet_size = v; }
        if let Some(v) = env_usize("FLEETQ_REMOVE_BATCH") { cfg.remove_batch_size = v.max(1); }
        if let Some(v) = env_usize("FLEETQ_WRITER_HEAP_BYTES") { cfg.writer_heap_bytes = v; }
        if let Some(v) = env_usize("FLEETQ_LOOKAHEAD") { cfg.lookahead = v.max(1); }
        cfg
    }
}
