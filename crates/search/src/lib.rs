//! fleetq search: a faceted, searchable projection of fleet objects kept beside the
//! authoritative object store.
//!
//! [`Indexer`] composes an [`IndexEngine`] (what can be found) with an
//! [`ObjectStore`](fleetq_store::ObjectStore) (what the objects are). Searches return a
//! [`SearchIter`] that holds only ids and hydrates objects from the store on demand. The two
//! sides are never locked together: a hit may hydrate to a newer version of its object, or
//! to `NotFound` if it was deleted in between.

#![forbid(unsafe_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use fleetq_core::{Facets, Object, Query, QueryOptions, SortBy};
use fleetq_store::ObjectStore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub mod config;
pub mod engine;
pub mod error;
pub mod facets;
pub mod ingest;
pub mod iter;
pub mod planner;

pub use config::{FacetField, IndexerConfig};
pub use engine::IndexEngine;
pub use error::{IndexError, Result};
pub use iter::{Rows, SearchIter};

use error::check;

/// Mutations pushed by collectors.
pub trait IndexWriter: Send + Sync {
    /// Upsert by id. All-or-nothing per call.
    fn add(&self, cancel: &CancellationToken, objects: &[Object]) -> Result<()>;
    /// Delete by id. On error, an unknown subset may already be gone.
    fn remove(&self, cancel: &CancellationToken, objects: &[Object]) -> Result<()>;
    /// Delete every object matching a filter expression; returns how many were removed.
    fn remove_by_query(&self, cancel: &CancellationToken, query: &str) -> Result<usize>;
}

/// Reads issued by the service layer.
pub trait IndexReader: Send + Sync {
    fn search(&self, cancel: &CancellationToken, query: &Query, opts: &QueryOptions) -> Result<SearchIter>;
    fn list_facets(&self, cancel: &CancellationToken) -> Result<Facets>;
}

pub struct Indexer {
    engine: IndexEngine,
    store: Arc<dyn ObjectStore>,
    cfg: IndexerConfig,
}

impl Indexer {
    pub fn new(engine: IndexEngine, store: Arc<dyn ObjectStore>, cfg: IndexerConfig) -> Self {
        Self { engine, store, cfg }
    }

    /// Open the on-disk index under `data_dir` and bind it to `store`.
    pub fn open(data_dir: &Path, store: Arc<dyn ObjectStore>, cfg: IndexerConfig) -> Result<Self> {
        let engine = IndexEngine::open(data_dir, cfg.writer_heap_bytes)?;
        Ok(Self::new(engine, store, cfg))
    }

    pub fn engine(&self) -> &IndexEngine { &self.engine }

    pub fn store(&self) -> &Arc<dyn ObjectStore> { &self.store }

    pub fn config(&self) -> &IndexerConfig { &self.cfg }
}

impl IndexWriter for Indexer {
    fn add(&self, cancel: &CancellationToken, objects: &[Object]) -> Result<()> {
        check(cancel)?;
        if objects.is_empty() { return Ok(()); }
        self.engine.upsert(objects)?;
        metrics::counter!("index_add_total", objects.len() as u64);
        metrics::gauge!("index_docs", self.engine.num_docs() as f64);
        Ok(())
    }

    fn remove(&self, cancel: &CancellationToken, objects: &[Object]) -> Result<()> {
        check(cancel)?;
        if objects.is_empty() { return Ok(()); }
        let ids: Vec<String> = objects.iter().map(|o| o.id.clone()).collect();
        self.engine.delete(&ids)?;
        metrics::counter!("index_remove_total", ids.len() as u64);
        metrics::gauge!("index_docs", self.engine.num_docs() as f64);
        Ok(())
    }

    fn remove_by_query(&self, cancel: &CancellationToken, query: &str) -> Result<usize> {
        check(cancel)?;
        if query.trim().is_empty() {
            debug!("remove_by_query with empty query; nothing matches");
            return Ok(0);
        }
        let q = planner::filter_clause(&self.engine, &[query.to_string()])?;
        let searcher = self.engine.searcher();
        let by_id = SortBy { field: "id".to_string(), descending: false };
        let ids = self.engine.collect_sorted(&searcher, q.as_ref(), &by_id)?;
        drop(searcher);
        for chunk in ids.chunks(self.cfg.remove_batch_size.max(1)) {
            check(cancel)?;
            self.engine.delete(chunk)?;
        }
        metrics::counter!("index_remove_total", ids.len() as u64);
        metrics::gauge!("index_docs", self.engine.num_docs() as f64);
        info!(query = %query, removed = ids.len(), "removed objects by query");
        Ok(ids.len())
    }
}

impl IndexReader for Indexer {
    fn search(&self, cancel: &CancellationToken, query: &Query, opts: &QueryOptions) -> Result<SearchIter> {
        check(cancel)?;
        let started = Instant::now();
        let plan = planner::plan(&self.engine, query, opts)?;
        let searcher = self.engine.searcher();
        let mut hits = self.engine.collect_sorted(&searcher, plan.query.as_ref(), &plan.sort)?;
        check(cancel)?;
        let total = hits.len();
        hits.drain(..plan.offset.min(total));
        hits.truncate(self.cfg.result_cap);
        metrics::histogram!("search_eval_ms", started.elapsed().as_secs_f64() * 1_000.0);
        metrics::histogram!("search_hits", hits.len() as f64);
        debug!(total, returned = hits.len(), sort = %plan.sort, "search executed");
        Ok(SearchIter::new(hits, Arc::clone(&self.store), opts.clone(), cancel.clone(), self.cfg.lookahead))
    }

    fn list_facets(&self, cancel: &CancellationToken) -> Result<Facets> {
        check(cancel)?;
        facets::aggregate(&self.engine, &self.cfg.facet_fields, self.cfg.facet_size)
    }
}
