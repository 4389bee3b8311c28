//! Facet aggregation over the live index.

use std::time::Instant;

use fleetq_core::Facets;
use tantivy::collector::FacetCollector;
use tantivy::query::AllQuery;
use tantivy::schema::Facet;

use crate::config::FacetField;
use crate::engine::{IndexEngine, FACETS_FIELD};
use crate::error::{engine, Result};

/// Distinct values per configured field across every live document, most frequent first,
/// at most `size` per field. Deleted and overwritten documents do not contribute.
pub fn aggregate(idx: &IndexEngine, fields: &[FacetField], size: usize) -> Result<Facets> {
    let started = Instant::now();
    let searcher = idx.searcher();
    let mut collector = FacetCollector::for_field(FACETS_FIELD);
    let roots: Vec<Facet> = fields.iter().map(|f| Facet::from_path([f.field.to_ascii_lowercase()])).collect();
    for root in roots.iter() {
        collector.add_facet(root.clone());
    }
    let counts = searcher.search(&AllQuery, &collector).map_err(engine("facet aggregation"))?;

    let mut facets = Facets::new();
    for (f, root) in fields.iter().zip(roots) {
        let values: Vec<String> = counts
            .top_k(root, size)
            .into_iter()
            .filter(|(_, n)| *n > 0)
            .filter_map(|(facet, _)| facet.to_path().last().map(|v| v.to_string()))
            .collect();
        facets.insert(f.label.clone(), values);
    }
    metrics::histogram!("facets_eval_ms", started.elapsed().as_secs_f64() * 1_000.0);
    Ok(facets)
}
