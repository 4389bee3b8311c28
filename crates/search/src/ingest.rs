//! Applying collector events to the store and the index.

use std::collections::VecDeque;

use fleetq_core::{Object, ObjectEvent};
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{store_error, Result};
use crate::{Indexer, IndexWriter};

/// Coalescing queue keyed by object id with FIFO order and fixed capacity.
/// A newer event for a queued id replaces the older one in place.
pub struct Coalescer {
    map: FxHashMap<String, ObjectEvent>,
    order: VecDeque<String>,
    cap: usize,
    dropped: u64,
    skipped: u64,
}

impl Coalescer {
    pub fn with_capacity(cap: usize) -> Self {
        Self { map: FxHashMap::default(), order: VecDeque::new(), cap: cap.max(1), dropped: 0, skipped: 0 }
    }

    pub fn len(&self) -> usize { self.map.len() }
    pub fn is_empty(&self) -> bool { self.map.is_empty() }
    /// Events evicted because the queue was full.
    pub fn dropped(&self) -> u64 { self.dropped }
    /// Events of a kind this build does not handle.
    pub fn skipped(&self) -> u64 { self.skipped }

    pub fn push(&mut self, ev: ObjectEvent) {
        let Some(key) = ev.key() else {
            self.skipped += 1;
            warn!("skipping unrecognized event");
            return;
        };
        if let ObjectEvent::ClusterRemoved { cluster } = &ev {
            // supersedes everything queued for the cluster; later events queue behind it
            let map = &mut self.map;
            self.order.retain(|k| {
                let stale = match map.get(k) {
                    Some(ObjectEvent::Upsert(o) | ObjectEvent::Delete(o)) => &o.cluster == cluster,
                    Some(ObjectEvent::ClusterRemoved { .. }) => k == &key,
                    _ => false,
                };
                if stale { map.remove(k); }
                !stale
            });
        }
        if !self.map.contains_key(&key) {
            if self.order.len() >= self.cap {
                if let Some(old) = self.order.pop_front() {
                    self.map.remove(&old);
                    self.dropped += 1;
                    warn!(id = %old, "coalescer full; dropped oldest event");
                }
            }
            self.order.push_back(key.clone());
        }
        self.map.insert(key, ev);
    }

    /// Drain all coalesced events in arrival order of their keys.
    pub fn drain_ready(&mut self) -> Vec<ObjectEvent> {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(key) = self.order.pop_front() {
            if let Some(ev) = self.map.remove(&key) {
                out.push(ev);
            }
        }
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyStats {
    pub upserted: usize,
    pub deleted: usize,
    pub clusters_removed: usize,
    pub skipped: u64,
    pub dropped: u64,
}

enum Pending {
    Upserts(Vec<Object>),
    Deletes(Vec<Object>),
}

/// Coalesce `events` and apply them in order, batching runs of the same kind.
///
/// Upserts reach the store before the index and deletes leave the index before the store, so
/// an id visible in the index always has a record behind it unless something else removed it.
pub fn apply_events<I>(indexer: &Indexer, cancel: &CancellationToken, events: I, cap: usize) -> Result<ApplyStats>
where
    I: IntoIterator<Item = ObjectEvent>,
{
    let mut q = Coalescer::with_capacity(cap);
    for ev in events { q.push(ev); }
    let mut stats = ApplyStats { skipped: q.skipped(), dropped: q.dropped(), ..Default::default() };

    let mut pending: Option<Pending> = None;
    for ev in q.drain_ready() {
        match ev {
            ObjectEvent::Upsert(o) => match pending {
                Some(Pending::Upserts(ref mut v)) => v.push(o),
                _ => {
                    flush(indexer, cancel, pending.take(), &mut stats)?;
                    pending = Some(Pending::Upserts(vec![o]));
                }
            },
            ObjectEvent::Delete(o) => match pending {
                Some(Pending::Deletes(ref mut v)) => v.push(o),
                _ => {
                    flush(indexer, cancel, pending.take(), &mut stats)?;
                    pending = Some(Pending::Deletes(vec![o]));
                }
            },
            ObjectEvent::ClusterRemoved { cluster } => {
                flush(indexer, cancel, pending.take(), &mut stats)?;
                let removed = indexer.remove_by_query(cancel, &format!("cluster:\"{}\"", cluster))?;
                indexer.store().delete_cluster(cancel, &cluster).map_err(store_error)?;
                info!(cluster = %cluster, removed, "cluster invalidated");
                stats.clusters_removed += 1;
                stats.deleted += removed;
            }
            ObjectEvent::Unknown => {}
        }
    }
    flush(indexer, cancel, pending, &mut stats)?;
    debug!(?stats, "events applied");
    Ok(stats)
}

fn flush(indexer: &Indexer, cancel: &CancellationToken, pending: Option<Pending>, stats: &mut ApplyStats) -> Result<()> {
    match pending {
        Some(Pending::Upserts(objs)) => {
            indexer.store().store_objects(cancel, &objs).map_err(store_error)?;
            indexer.add(cancel, &objs)?;
            stats.upserted += objs.len();
        }
        Some(Pending::Deletes(objs)) => {
            indexer.remove(cancel, &objs)?;
            indexer.store().delete_objects(cancel, &objs).map_err(store_error)?;
            stats.deleted += objs.len();
        }
        None => {}
    }
    Ok(())
}
