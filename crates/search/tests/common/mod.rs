#![allow(dead_code)]

use std::sync::Arc;

use fleetq_core::Object;
use fleetq_search::{IndexEngine, Indexer, IndexerConfig, IndexWriter, SearchIter};
use fleetq_store::{ObjectStore, SqliteStore};
use tokio_util::sync::CancellationToken;

pub fn indexer_with(cfg: IndexerConfig) -> Indexer {
    let store: Arc<dyn ObjectStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let engine = IndexEngine::in_memory(20_000_000).unwrap();
    Indexer::new(engine, store, cfg)
}

pub fn indexer() -> Indexer { indexer_with(IndexerConfig::default()) }

pub fn obj(cluster: &str, ns: &str, kind: &str, name: &str) -> Object {
    Object::new(cluster, ns, kind, name)
}

/// Write to the store, then the index, the way collectors do.
pub fn put(ix: &Indexer, objs: &[Object]) {
    let cancel = CancellationToken::new();
    ix.store().store_objects(&cancel, objs).unwrap();
    ix.add(&cancel, objs).unwrap();
}

/// Hydrate row by row, returning names in hit order.
pub fn names(it: &SearchIter) -> Vec<String> {
    let mut out = Vec::new();
    while it.advance() {
        out.push(it.row().unwrap().name);
    }
    out
}
