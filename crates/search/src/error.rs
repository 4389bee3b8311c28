use fleetq_store::StoreError;
use tantivy::query::QueryParserError;

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("{op}: {source}")]
    Engine { op: &'static str, #[source] source: tantivy::TantivyError },
    #[error("{op} (ids: {ids:?}): {source}")]
    Write { op: &'static str, ids: Vec<String>, #[source] source: tantivy::TantivyError },
    #[error("invalid query {query:?}: {source}")]
    Query { query: String, #[source] source: QueryParserError },
    #[error("cannot index object {id:?}: {reason}")]
    InvalidObject { id: String, reason: &'static str },
    #[error("store: {0}")]
    Store(#[source] StoreError),
    #[error("hydrating {id}: {source}")]
    Hydration { id: String, #[source] source: StoreError },
    #[error("hydrating {} ids {:?}: {source}", ids.len(), ids)]
    BatchHydration { ids: Vec<String>, #[source] source: StoreError },
    #[error("opening index directory {path}: {source}")]
    Io { path: String, #[source] source: std::io::Error },
    #[error("no current row (advance the iterator first)")]
    NoCurrentRow,
    #[error("iterator closed")]
    Closed,
    #[error("index writer lock poisoned")]
    Poisoned,
    #[error("cancelled")]
    Cancelled,
}

impl IndexError {
    /// True when hydration failed because the store no longer has the object.
    pub fn is_not_found(&self) -> bool {
        matches!(self, IndexError::Hydration { source, .. } if source.is_not_found())
    }
}

pub type Result<T> = std::result::Result<T, IndexError>;

pub(crate) fn engine(op: &'static str) -> impl FnOnce(tantivy::TantivyError) -> IndexError {
    move |source| IndexError::Engine { op, source }
}

/// Store failures outside hydration; cancellation keeps its own variant.
pub(crate) fn store_error(source: StoreError) -> IndexError {
    match source {
        StoreError::Cancelled => IndexError::Cancelled,
        other => IndexError::Store(other),
    }
}

pub(crate) fn check(cancel: &tokio_util::sync::CancellationToken) -> Result<()> {
    if cancel.is_cancelled() { Err(IndexError::Cancelled) } else { Ok(()) }
}
