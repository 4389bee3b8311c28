use std::sync::Arc;
use std::time::Instant;

use fleetq_core::{Object, Query, QueryOptions};
use fleetq_search::{IndexEngine, IndexReader, IndexWriter, Indexer, IndexerConfig};
use fleetq_store::{ObjectStore, SqliteStore};
use tokio_util::sync::CancellationToken;

fn gen_obj(i: usize) -> Object {
    let app = match i % 3 {
        0 => "web",
        1 => "api",
        _ => "batch",
    };
    let mut o = Object::new(&format!("cluster-{}", i % 4), &format!("ns{}", i % 10), "Deployment", &format!("obj-{i:06}"));
    o.status = if i % 7 == 0 { "Degraded".into() } else { "Available".into() };
    o.created_at = 1_577_836_800; // 2020-01-01
    o.labels.push(("app".to_string(), app.to_string()));
    o.labels.push((format!("team{}", i % 20), "1".to_string()));
    o
}

fn percentile_us(xs: &mut [u128], p: f64) -> u128 {
    if xs.is_empty() { return 0; }
    xs.sort_unstable();
    let idx = ((xs.len() as f64 - 1.0) * p).round() as usize;
    xs[idx]
}

fn main() -> anyhow::Result<()> {
    let n: usize = std::env::var("FLEETQ_BENCH_DOCS").ok().and_then(|s| s.parse().ok()).unwrap_or(20_000);
    let batch: usize = std::env::var("FLEETQ_BENCH_BATCH").ok().and_then(|s| s.parse().ok()).unwrap_or(1_000);
    let cfg = IndexerConfig::from_env();
    let store: Arc<dyn ObjectStore> = Arc::new(SqliteStore::open_in_memory()?);
    let indexer = Indexer::new(IndexEngine::in_memory(cfg.writer_heap_bytes)?, store, cfg);
    let cancel = CancellationToken::new();

    eprintln!("indexing {} objects in batches of {}", n, batch);
    let objs: Vec<Object> = (0..n).map(gen_obj).collect();
    let t0 = Instant::now();
    for chunk in objs.chunks(batch.max(1)) {
        indexer.store().store_objects(&cancel, chunk)?;
        indexer.add(&cancel, chunk)?;
    }
    let build_ms = t0.elapsed().as_secs_f64() * 1_000.0;

    let mut filtered: Vec<Query> = Vec::new();
    for ns in 0..10 {
        filtered.push(Query::all().with_filter(format!("namespace:ns{}", ns)).with_filter(r#"labels:"app=web""#));
    }
    let mut text: Vec<Query> = Vec::new();
    for step in (0..n).step_by(n.saturating_div(200).max(1)) {
        text.push(Query::terms(format!("obj-{:06}", step)));
    }

    let mut run = |label: &str, qs: &[Query]| -> anyhow::Result<()> {
        let mut times: Vec<u128> = Vec::with_capacity(qs.len());
        for q in qs {
            let t = Instant::now();
            let it = indexer.search(&cancel, q, &QueryOptions::default())?;
            let _ = it.all()?;
            times.push(t.elapsed().as_micros());
        }
        let p50 = percentile_us(&mut times.clone(), 0.50) as f64 / 1000.0;
        let p99 = percentile_us(&mut times, 0.99) as f64 / 1000.0;
        println!("{}: p50={:.3}ms p99={:.3}ms ({} queries)", label, p50, p99, qs.len());
        Ok(())
    };

    println!("index_build: {:.1}ms docs={}", build_ms, n);
    run("filtered", &filtered)?;
    run("text", &text)?;
    let t = Instant::now();
    let facets = indexer.list_facets(&cancel)?;
    println!("facets: {:.3}ms fields={}", t.elapsed().as_secs_f64() * 1_000.0, facets.len());
    Ok(())
}
