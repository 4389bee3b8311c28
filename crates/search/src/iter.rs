//! Hydrating result iterator.
//!
//! A search fixes the list of hit ids; objects are read from the store only when the caller
//! asks for them, so hydration sees the store as it is at that moment.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use fleetq_core::{Object, QueryOptions};
use fleetq_store::{ObjectStore, StoreError};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{check, IndexError, Result};

struct Cursor {
    hits: Vec<String>,
    /// Index of the current hit; `None` before the first advance.
    pos: Option<usize>,
    closed: bool,
}

impl Cursor {
    fn current(&self) -> Result<&str> {
        if self.closed { return Err(IndexError::Closed); }
        match self.pos {
            Some(i) if i < self.hits.len() => Ok(self.hits[i].as_str()),
            _ => Err(IndexError::NoCurrentRow),
        }
    }
}

/// Forward-only, single-pass sequence of search hits.
///
/// Cursor state sits behind a mutex: sharing one iterator across threads is safe, though
/// the interleaving of rows between them is unspecified.
pub struct SearchIter {
    cursor: Mutex<Cursor>,
    store: Arc<dyn ObjectStore>,
    opts: QueryOptions,
    cancel: CancellationToken,
    lookahead: usize,
}

impl SearchIter {
    pub(crate) fn new(hits: Vec<String>, store: Arc<dyn ObjectStore>, opts: QueryOptions, cancel: CancellationToken, lookahead: usize) -> Self {
        Self {
            cursor: Mutex::new(Cursor { hits, pos: None, closed: false }),
            store,
            opts,
            cancel,
            lookahead: lookahead.max(1),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Cursor>> {
        self.cursor.lock().map_err(|_| IndexError::Poisoned)
    }

    /// Number of hits this search produced (after offset and cap).
    pub fn len(&self) -> usize {
        self.lock().map(|c| c.hits.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Hit ids in result order.
    pub fn ids(&self) -> Vec<String> {
        self.lock().map(|c| c.hits.clone()).unwrap_or_default()
    }

    /// Move to the next hit. Returns false once the hits are exhausted or the iterator is closed.
    pub fn advance(&self) -> bool {
        let Ok(mut c) = self.lock() else { return false };
        if c.closed { return false; }
        let next = c.pos.map_or(0, |i| i.saturating_add(1)).min(c.hits.len());
        c.pos = Some(next);
        next < c.hits.len()
    }

    /// Hydrate the current hit with one store lookup.
    pub fn row(&self) -> Result<Object> {
        let c = self.lock()?;
        let id = c.current()?;
        check(&self.cancel)?;
        let obj = self.store.get_object_by_id(&self.cancel, id).map_err(|source| hydration(id, source))?;
        metrics::counter!("hydrate_rows_total", 1u64);
        Ok(obj)
    }

    /// Hydrate every hit in one batched store call, ordered by the search's sort options.
    /// Fails if any hit no longer resolves. Does not move the cursor.
    pub fn all(&self) -> Result<Vec<Object>> {
        let c = self.lock()?;
        if c.closed { return Err(IndexError::Closed); }
        check(&self.cancel)?;
        // the hit list is already offset; only the ordering applies here
        let opts = QueryOptions { offset: 0, ..self.opts.clone() };
        let objects = self.store.get_objects(&self.cancel, &c.hits, &opts).map_err(|source| batch_hydration(&c.hits, source))?;
        if objects.len() != c.hits.len() {
            let found: FxHashSet<&str> = objects.iter().map(|o| o.id.as_str()).collect();
            if let Some(missing) = c.hits.iter().find(|id| !found.contains(id.as_str())) {
                return Err(hydration(missing, StoreError::NotFound(missing.clone())));
            }
        }
        metrics::counter!("hydrate_rows_total", objects.len() as u64);
        Ok(objects)
    }

    /// Release the hit list. Idempotent; objects already returned stay valid.
    pub fn close(&self) {
        if let Ok(mut c) = self.lock() {
            if !c.closed {
                debug!(hits = c.hits.len(), "search iterator closed");
            }
            c.closed = true;
            c.hits = Vec::new();
        }
    }

    /// Remaining hits as a std iterator, hydrated `lookahead` ids per store call.
    /// Shares the cursor with [`advance`](Self::advance): each yielded item consumes one hit.
    pub fn rows(&self) -> Rows<'_> {
        Rows { iter: self, buf: VecDeque::new() }
    }

    /// Claim up to `n` hits after the cursor, moving the cursor onto the last one claimed.
    fn claim(&self, n: usize) -> Result<Vec<String>> {
        let mut c = self.lock()?;
        if c.closed { return Ok(Vec::new()); }
        let start = c.pos.map_or(0, |i| i.saturating_add(1)).min(c.hits.len());
        let end = start.saturating_add(n).min(c.hits.len());
        if end > start { c.pos = Some(end - 1); }
        Ok(c.hits[start..end].to_vec())
    }

    fn hydrate_window(&self, ids: Vec<String>) -> Result<VecDeque<Result<Object>>> {
        check(&self.cancel)?;
        let found = self
            .store
            .get_objects(&self.cancel, &ids, &QueryOptions::default())
            .map_err(|source| batch_hydration(&ids, source))?;
        let mut by_id: FxHashMap<String, Object> = found.into_iter().map(|o| (o.id.clone(), o)).collect();
        metrics::counter!("hydrate_rows_total", by_id.len() as u64);
        Ok(ids
            .into_iter()
            .map(|id| match by_id.remove(&id) {
                Some(o) => Ok(o),
                None => Err(hydration(&id, StoreError::NotFound(id.clone()))),
            })
            .collect())
    }
}

impl Drop for SearchIter {
    fn drop(&mut self) { self.close(); }
}

fn hydration(id: &str, source: StoreError) -> IndexError {
    match source {
        StoreError::Cancelled => IndexError::Cancelled,
        source => IndexError::Hydration { id: id.to_string(), source },
    }
}

fn batch_hydration(ids: &[String], source: StoreError) -> IndexError {
    match source {
        StoreError::Cancelled => IndexError::Cancelled,
        source => IndexError::BatchHydration { ids: ids.to_vec(), source },
    }
}

/// See [`SearchIter::rows`]. Stops after the first window-level failure.
pub struct Rows<'a> {
    iter: &'a SearchIter,
    buf: VecDeque<Result<Object>>,
}

impl Iterator for Rows<'_> {
    type Item = Result<Object>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() {
            let ids = match self.iter.claim(self.iter.lookahead) {
                Ok(ids) => ids,
                Err(e) => return Some(Err(e)),
            };
            if ids.is_empty() { return None; }
            match self.iter.hydrate_window(ids) {
                Ok(window) => self.buf = window,
                Err(e) => {
                    self.iter.close();
                    return Some(Err(e));
                }
            }
        }
        self.buf.pop_front()
    }
}
