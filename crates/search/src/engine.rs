//! Index engine: the tantivy projection of every object, plus the schema that decides which
//! fields are tokenized and which are matched whole.
//!
//! Exact-match fields (`namespace`, `cluster`, `tenant`, `labels`) go through the `keyword`
//! analyzer: one lowercased token per value, so `flux-system` is never split into `flux` and
//! `system`. Free-text fields use tantivy's default analyzer. Every scalar (and `id`) keeps a
//! raw fast column that sorting reads; facetable fields also land in a hierarchical `facets`
//! field as `/<field>/<value>`. Writes address documents through `_key`, an untokenized copy
//! of the id that filters never see.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use fleetq_core::{sort_key, Object, SortBy};
use tantivy::collector::DocSetCollector;
use tantivy::columnar::StrColumn;
use tantivy::directory::MmapDirectory;
use tantivy::query::Query as EngineQuery;
use tantivy::schema::{Facet, FacetOptions, Field, IndexRecordOption, Schema, TextFieldIndexing, TextOptions, STRING};
use tantivy::tokenizer::{LowerCaser, RawTokenizer, TextAnalyzer};
use tantivy::{DocId, Index, IndexReader, ReloadPolicy, Searcher, TantivyDocument, Term};
use tracing::{debug, info, warn};

use crate::error::{engine, IndexError, Result};

/// Name of the index inside the data directory.
pub const INDEX_FILE: &str = "index.db";
/// Whole-value, lowercased analyzer for exact-match fields.
pub const KEYWORD_TOKENIZER: &str = "keyword";
pub(crate) const FACETS_FIELD: &str = "facets";
const ID_FIELD: &str = "id";
const KEY_FIELD: &str = "_key";
const LABELS_FIELD: &str = "labels";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Tokenized with the default analyzer; searched by free text.
    FreeText,
    /// Indexed as one token; used by filters, facets and sort.
    Exact,
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub facet: bool,
}

const fn spec(name: &'static str, kind: FieldKind, facet: bool) -> FieldSpec {
    FieldSpec { name, kind, facet }
}

/// Scalar fields of the projection. The payload is never indexed.
pub const PROJECTION: &[FieldSpec] = &[
    spec("kind", FieldKind::FreeText, true),
    spec("name", FieldKind::FreeText, false),
    spec("namespace", FieldKind::Exact, true),
    spec("cluster", FieldKind::Exact, true),
    spec("tenant", FieldKind::Exact, true),
    spec("api_group", FieldKind::FreeText, true),
    spec("api_version", FieldKind::FreeText, true),
    spec("status", FieldKind::FreeText, true),
    spec("category", FieldKind::FreeText, true),
    spec("message", FieldKind::FreeText, false),
];

#[derive(Debug, Clone)]
pub(crate) struct Fields {
    pub key: Field,
    pub id: Field,
    pub labels: Field,
    pub facets: Field,
    pub scalars: Vec<(FieldSpec, Field)>,
}

impl Fields {
    pub fn scalar(&self, name: &str) -> Option<Field> {
        self.scalars.iter().find(|(s, _)| s.name == name).map(|(_, f)| *f)
    }

    /// Fast column a sort directive orders by; `None` for fields that are not sortable.
    pub fn sortable(&self, name: &str) -> Option<&'static str> {
        if name == ID_FIELD { return Some(ID_FIELD); }
        self.scalars.iter().find(|(s, _)| s.name == name).map(|(s, _)| s.name)
    }

    /// Default fields for unqualified filter terms.
    pub fn free_text(&self) -> Vec<Field> {
        self.scalars.iter().filter(|(s, _)| s.kind == FieldKind::FreeText).map(|(_, f)| *f).collect()
    }

    /// Fields a free-text match runs over, each with its own analyzer.
    pub fn text_search(&self) -> Vec<Field> {
        self.scalars.iter().map(|(_, f)| *f).collect()
    }
}

fn exact_options() -> TextOptions {
    TextOptions::default()
        .set_indexing_options(
            TextFieldIndexing::default()
                .set_tokenizer(KEYWORD_TOKENIZER)
                .set_index_option(IndexRecordOption::Basic),
        )
        .set_fast(None)
}

fn free_text_options() -> TextOptions {
    TextOptions::default()
        .set_indexing_options(
            TextFieldIndexing::default()
                .set_tokenizer("default")
                .set_index_option(IndexRecordOption::WithFreqsAndPositions),
        )
        .set_fast(None)
}

fn build_schema() -> (Schema, Fields) {
    let mut builder = Schema::builder();
    // Raw and case-sensitive: upserts and deletes address documents by this exact term.
    let key = builder.add_text_field(KEY_FIELD, STRING);
    let id = builder.add_text_field(ID_FIELD, exact_options());
    let mut scalars = Vec::with_capacity(PROJECTION.len());
    for s in PROJECTION.iter() {
        let opts = match s.kind { FieldKind::Exact => exact_options(), FieldKind::FreeText => free_text_options() };
        scalars.push((*s, builder.add_text_field(s.name, opts)));
    }
    let labels = builder.add_text_field(
        LABELS_FIELD,
        TextOptions::default().set_indexing_options(
            TextFieldIndexing::default().set_tokenizer(KEYWORD_TOKENIZER).set_index_option(IndexRecordOption::Basic),
        ),
    );
    let facets = builder.add_facet_field(FACETS_FIELD, FacetOptions::default());
    (builder.build(), Fields { key, id, labels, facets, scalars })
}

fn keyword_analyzer() -> TextAnalyzer {
    TextAnalyzer::builder(RawTokenizer::default()).filter(LowerCaser).build()
}

/// First value of `doc` in a fast str column; empty when the column or the value is absent.
fn fast_str(col: Option<&StrColumn>, doc: DocId) -> Result<String> {
    let mut out = String::new();
    if let Some(col) = col {
        if let Some(ord) = col.term_ords(doc).next() {
            col.ord_to_str(ord, &mut out).map_err(|e| IndexError::Engine { op: "read fast column", source: e.into() })?;
        }
    }
    Ok(out)
}

/// Owned handle to one on-disk (or in-RAM) index. Open once per process and share.
pub struct IndexEngine {
    index: Index,
    fields: Fields,
    reader: IndexReader,
    writer: Mutex<tantivy::IndexWriter>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for IndexEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexEngine").field("path", &self.path).finish_non_exhaustive()
    }
}

impl IndexEngine {
    /// Open (or create) the index stored as `<dir>/index.db`. Fails if another process holds
    /// the writer lock on it.
    pub fn open(dir: &Path, writer_heap_bytes: usize) -> Result<Self> {
        let path = dir.join(INDEX_FILE);
        std::fs::create_dir_all(&path).map_err(|source| IndexError::Io { path: path.display().to_string(), source })?;
        let directory = MmapDirectory::open(&path).map_err(|e| IndexError::Engine { op: "open index directory", source: e.into() })?;
        let (schema, fields) = build_schema();
        let index = Index::open_or_create(directory, schema).map_err(engine("open index"))?;
        let me = Self::from_index(index, fields, Some(path), writer_heap_bytes)?;
        info!(path = ?me.path, docs = me.num_docs(), "index opened");
        Ok(me)
    }

    pub fn in_memory(writer_heap_bytes: usize) -> Result<Self> {
        let (schema, fields) = build_schema();
        Self::from_index(Index::create_in_ram(schema), fields, None, writer_heap_bytes)
    }

    fn from_index(index: Index, fields: Fields, path: Option<PathBuf>, writer_heap_bytes: usize) -> Result<Self> {
        index.tokenizers().register(KEYWORD_TOKENIZER, keyword_analyzer());
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()
            .map_err(engine("open index reader"))?;
        let writer = index.writer(writer_heap_bytes).map_err(engine("open index writer"))?;
        Ok(Self { index, fields, reader, writer: Mutex::new(writer), path })
    }

    pub fn path(&self) -> Option<&Path> { self.path.as_deref() }

    pub(crate) fn index(&self) -> &Index { &self.index }

    pub(crate) fn fields(&self) -> &Fields { &self.fields }

    /// Snapshot of the last committed state.
    pub fn searcher(&self) -> Searcher { self.reader.searcher() }

    pub fn num_docs(&self) -> u64 { self.reader.searcher().num_docs() }

    fn writer(&self) -> Result<MutexGuard<'_, tantivy::IndexWriter>> {
        self.writer.lock().map_err(|_| IndexError::Poisoned)
    }

    fn encode(&self, o: &Object) -> Result<TantivyDocument> {
        if o.id.is_empty() {
            return Err(IndexError::InvalidObject { id: o.id.clone(), reason: "empty id" });
        }
        let mut doc = TantivyDocument::default();
        doc.add_text(self.fields.key, &o.id);
        doc.add_text(self.fields.id, &o.id);
        for (s, field) in self.fields.scalars.iter() {
            let v = o.field(s.name).unwrap_or("");
            if v.is_empty() { continue; }
            doc.add_text(*field, v);
            if s.facet { doc.add_facet(self.fields.facets, Facet::from_path([s.name, v])); }
        }
        for pair in o.label_pairs() { doc.add_text(self.fields.labels, &pair); }
        Ok(doc)
    }

    fn commit(&self, mut writer: MutexGuard<'_, tantivy::IndexWriter>, op: &'static str, ids: impl FnOnce() -> Vec<String>) -> Result<()> {
        if let Err(source) = writer.commit() {
            if let Err(e) = writer.rollback() { warn!(error = %e, "rollback after failed commit"); }
            return Err(IndexError::Write { op, ids: ids(), source });
        }
        drop(writer);
        self.reader.reload().map_err(engine("reload index reader"))
    }

    /// Upsert every object in one commit. Encoding happens before anything is staged, so a bad
    /// object leaves the index untouched.
    pub fn upsert(&self, objects: &[Object]) -> Result<()> {
        let started = Instant::now();
        let docs = objects.iter().map(|o| self.encode(o)).collect::<Result<Vec<_>>>()?;
        let mut writer = self.writer()?;
        for (o, doc) in objects.iter().zip(docs) {
            writer.delete_term(Term::from_field_text(self.fields.key, &o.id));
            if let Err(source) = writer.add_document(doc) {
                // still under the lock: nobody can commit the partial batch
                if let Err(e) = writer.rollback() { warn!(error = %e, "rollback after failed staging"); }
                return Err(IndexError::Write { op: "stage document", ids: vec![o.id.clone()], source });
            }
        }
        self.commit(writer, "commit upserts", || objects.iter().map(|o| o.id.clone()).collect())?;
        debug!(count = objects.len(), elapsed_ms = started.elapsed().as_millis() as u64, "upserted documents");
        Ok(())
    }

    /// Delete documents by id and commit.
    pub fn delete(&self, ids: &[String]) -> Result<()> {
        let writer = self.writer()?;
        for id in ids.iter() {
            writer.delete_term(Term::from_field_text(self.fields.key, id));
        }
        self.commit(writer, "commit deletes", || ids.to_vec())?;
        debug!(count = ids.len(), "deleted documents");
        Ok(())
    }

    /// Ids of every document matching `query`, in `sort` order. Not capped.
    pub(crate) fn collect_sorted(&self, searcher: &Searcher, query: &dyn EngineQuery, sort: &SortBy) -> Result<Vec<String>> {
        let addrs = searcher.search(query, &DocSetCollector).map_err(engine("search index"))?;
        let mut by_segment: Vec<Vec<DocId>> = vec![Vec::new(); searcher.segment_readers().len()];
        for addr in addrs {
            if let Some(docs) = by_segment.get_mut(addr.segment_ord as usize) { docs.push(addr.doc_id); }
        }
        let sort_column = self.fields.sortable(&sort.field);
        let mut keyed: Vec<(String, String)> = Vec::new();
        for (ord, docs) in by_segment.into_iter().enumerate() {
            if docs.is_empty() { continue; }
            let columns = searcher.segment_reader(ord as u32).fast_fields();
            let ids = columns.str(ID_FIELD).map_err(engine("open id column"))?;
            let keys = match sort_column {
                Some(name) => columns.str(name).map_err(engine("open sort column"))?,
                None => None,
            };
            for doc in docs {
                let id = fast_str(ids.as_ref(), doc)?;
                let key = sort_key(&fast_str(keys.as_ref(), doc)?);
                keyed.push((key, id));
            }
        }
        keyed.sort_by(|a, b| sort.compare_keys((&a.0, &a.1), (&b.0, &b.1)));
        Ok(keyed.into_iter().map(|(_, id)| id).collect())
    }
}
