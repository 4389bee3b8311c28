//! fleetq store: the authoritative record of every object the index points at.
//! SQLite-backed, synchronous. One row per object id.

#![forbid(unsafe_code)]

use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use fleetq_core::{compare_objects, Labels, Object, QueryOptions};
use metrics::{counter, histogram};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Ids per `IN (...)` lookup; well below SQLite's host parameter limit.
const LOOKUP_CHUNK: usize = 500;

const COLUMNS: &str = "id, cluster, namespace, kind, name, api_group, api_version, status, message, category, tenant, created_at, labels, payload";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("{op}: {source}")]
    Sqlite { op: &'static str, #[source] source: rusqlite::Error },
    #[error("encoding object {id}: {source}")]
    Encode { id: String, #[source] source: serde_json::Error },
    #[error("store lock poisoned")]
    Poisoned,
    #[error("cancelled")]
    Cancelled,
}

impl StoreError {
    pub fn is_not_found(&self) -> bool { matches!(self, StoreError::NotFound(_)) }
}

pub type Result<T> = std::result::Result<T, StoreError>;

fn sql(op: &'static str) -> impl FnOnce(rusqlite::Error) -> StoreError {
    move |source| StoreError::Sqlite { op, source }
}

fn check(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() { Err(StoreError::Cancelled) } else { Ok(()) }
}

/// Authoritative object storage consumed by the indexer.
pub trait ObjectStore: Send + Sync {
    /// Upsert full records.
    fn store_objects(&self, cancel: &CancellationToken, objects: &[Object]) -> Result<()>;
    /// Delete records by id; absent ids are ignored.
    fn delete_objects(&self, cancel: &CancellationToken, objects: &[Object]) -> Result<()>;
    /// Delete every record observed on `cluster`; returns how many went.
    fn delete_cluster(&self, cancel: &CancellationToken, cluster: &str) -> Result<usize>;
    /// Point lookup; `NotFound` when absent.
    fn get_object_by_id(&self, cancel: &CancellationToken, id: &str) -> Result<Object>;
    /// Batch lookup. Found objects come back ordered and offset per `opts`; absent ids are skipped.
    fn get_objects(&self, cancel: &CancellationToken, ids: &[String], opts: &QueryOptions) -> Result<Vec<Object>>;
}

/// SQLite-backed store.
pub struct SqliteStore {
    db: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self> {
        let started = Instant::now();
        let db = Connection::open(path).map_err(sql("opening sqlite db"))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        let me = Self::init(db)?;
        histogram!("store_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        info!(path = %path, "object store opened");
        Ok(me)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().map_err(sql("opening in-memory sqlite db"))?)
    }

    fn init(db: Connection) -> Result<Self> {
        db.execute(
            "CREATE TABLE IF NOT EXISTS objects (
                id          TEXT PRIMARY KEY NOT NULL,
                cluster     TEXT NOT NULL,
                namespace   TEXT NOT NULL,
                kind        TEXT NOT NULL,
                name        TEXT NOT NULL,
                api_group   TEXT NOT NULL,
                api_version TEXT NOT NULL,
                status      TEXT NOT NULL,
                message     TEXT NOT NULL,
                category    TEXT NOT NULL,
                tenant      TEXT NOT NULL,
                created_at  INTEGER NOT NULL,
                labels      TEXT NOT NULL,
                payload     TEXT NOT NULL
            )",
            [],
        ).map_err(sql("creating objects table"))?;
        db.execute("CREATE INDEX IF NOT EXISTS idx_objects_cluster ON objects(cluster)", []).ok();
        Ok(Self { db: Mutex::new(db) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Number of stored objects.
    pub fn count(&self) -> Result<usize> {
        let db = self.conn()?;
        let n: i64 = db.query_row("SELECT COUNT(*) FROM objects", [], |r| r.get(0)).map_err(sql("counting objects"))?;
        Ok(n.max(0) as usize)
    }
}

fn decode_json<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

fn object_from_row(row: &Row<'_>) -> rusqlite::Result<Object> {
    let labels: Labels = decode_json(row, 12)?;
    let payload: serde_json::Value = decode_json(row, 13)?;
    Ok(Object {
        id: row.get(0)?,
        cluster: row.get(1)?,
        namespace: row.get(2)?,
        kind: row.get(3)?,
        name: row.get(4)?,
        api_group: row.get(5)?,
        api_version: row.get(6)?,
        status: row.get(7)?,
        message: row.get(8)?,
        category: row.get(9)?,
        tenant: row.get(10)?,
        created_at: row.get(11)?,
        labels,
        payload,
    })
}

impl ObjectStore for SqliteStore {
    fn store_objects(&self, cancel: &CancellationToken, objects: &[Object]) -> Result<()> {
        check(cancel)?;
        let started = Instant::now();
        let mut encoded = Vec::with_capacity(objects.len());
        for o in objects.iter() {
            let labels = serde_json::to_string(&o.labels).map_err(|source| StoreError::Encode { id: o.id.clone(), source })?;
            let payload = serde_json::to_string(&o.payload).map_err(|source| StoreError::Encode { id: o.id.clone(), source })?;
            encoded.push((o, labels, payload));
        }
        let mut db = self.conn()?;
        let tx = db.transaction().map_err(sql("begin store transaction"))?;
        {
            let mut stmt = tx.prepare_cached(&format!(
                "INSERT OR REPLACE INTO objects({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                COLUMNS
            )).map_err(sql("preparing upsert"))?;
            for (o, labels, payload) in encoded.iter() {
                stmt.execute(params![
                    o.id, o.cluster, o.namespace, o.kind, o.name, o.api_group, o.api_version,
                    o.status, o.message, o.category, o.tenant, o.created_at, labels, payload,
                ]).map_err(sql("upserting object"))?;
            }
        }
        tx.commit().map_err(sql("committing upserts"))?;
        histogram!("store_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("store_put_total", objects.len() as u64);
        debug!(count = objects.len(), "stored objects");
        Ok(())
    }

    fn delete_objects(&self, cancel: &CancellationToken, objects: &[Object]) -> Result<()> {
        check(cancel)?;
        let mut db = self.conn()?;
        let tx = db.transaction().map_err(sql("begin store transaction"))?;
        {
            let mut stmt = tx.prepare_cached("DELETE FROM objects WHERE id = ?1").map_err(sql("preparing delete"))?;
            for o in objects.iter() {
                stmt.execute([&o.id]).map_err(sql("deleting object"))?;
            }
        }
        tx.commit().map_err(sql("committing deletes"))?;
        debug!(count = objects.len(), "deleted objects");
        Ok(())
    }

    fn delete_cluster(&self, cancel: &CancellationToken, cluster: &str) -> Result<usize> {
        check(cancel)?;
        let db = self.conn()?;
        let n = db.execute("DELETE FROM objects WHERE cluster = ?1", [cluster]).map_err(sql("deleting cluster"))?;
        info!(cluster = %cluster, removed = n, "deleted cluster objects");
        Ok(n)
    }

    fn get_object_by_id(&self, cancel: &CancellationToken, id: &str) -> Result<Object> {
        check(cancel)?;
        let started = Instant::now();
        let db = self.conn()?;
        let found = db
            .query_row(&format!("SELECT {} FROM objects WHERE id = ?1", COLUMNS), [id], object_from_row)
            .optional()
            .map_err(sql("get object by id"))?;
        histogram!("store_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        found.ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn get_objects(&self, cancel: &CancellationToken, ids: &[String], opts: &QueryOptions) -> Result<Vec<Object>> {
        let started = Instant::now();
        let mut out = Vec::with_capacity(ids.len());
        let db = self.conn()?;
        for chunk in ids.chunks(LOOKUP_CHUNK) {
            check(cancel)?;
            let marks = vec!["?"; chunk.len()].join(", ");
            let mut stmt = db
                .prepare(&format!("SELECT {} FROM objects WHERE id IN ({})", COLUMNS, marks))
                .map_err(sql("preparing batch lookup"))?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), object_from_row).map_err(sql("batch lookup"))?;
            for row in rows {
                out.push(row.map_err(sql("decoding object row"))?);
            }
        }
        let sort = opts.sort_by();
        out.sort_by(|a, b| compare_objects(&sort, a, b));
        if opts.offset > 0 { out.drain(..opts.offset.min(out.len())); }
        histogram!("store_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }
}
