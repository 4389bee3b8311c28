use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use fleetq_core::{Facets, Object, ObjectEvent, Query, QueryOptions};
use fleetq_search::ingest::{apply_events, ApplyStats};
use fleetq_search::{IndexReader, IndexWriter, Indexer, IndexerConfig};
use fleetq_store::{ObjectStore, SqliteStore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Object store file inside the data directory.
const STORE_FILE: &str = "objects.db";

#[derive(Parser, Debug)]
#[command(name = "fleetqctl", version, about = "Search and facet objects collected from a fleet of clusters")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Directory holding index.db and objects.db
    #[arg(long = "data-dir", env = "FLEETQ_DATA_DIR", global = true, default_value = ".fleetq")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply a JSON-lines file of change events (or raw objects with --cluster)
    Ingest {
        /// Path to the file; "-" reads stdin
        file: PathBuf,
        /// Treat each line as a raw Kubernetes object observed on this cluster
        #[arg(long = "cluster")]
        cluster: Option<String>,
        /// Coalescing queue capacity
        #[arg(long = "queue-cap", env = "FLEETQ_QUEUE_CAP", default_value_t = 8192)]
        queue_cap: usize,
    },
    /// Search the index and hydrate hits from the store
    Search {
        /// Free text, matched against every indexed field
        #[arg(num_args = 0..)]
        terms: Vec<String>,
        /// Filter expression, e.g. namespace:default or labels:"app=web" (repeatable, AND-ed)
        #[arg(short = 'f', long = "filter")]
        filters: Vec<String>,
        /// Sort field (default: name)
        #[arg(long = "order-by")]
        order_by: Option<String>,
        /// Sort ascending instead of descending
        #[arg(long = "asc", action = ArgAction::SetTrue)]
        asc: bool,
        /// Leading hits to skip
        #[arg(long = "offset", default_value_t = 0)]
        offset: usize,
        /// Rows to print
        #[arg(long = "limit", default_value_t = 50)]
        limit: usize,
        /// Hydrate every hit in one batch; fails if any hit is stale
        #[arg(long = "all", action = ArgAction::SetTrue)]
        all: bool,
    },
    /// Distinct values per facet field
    Facets,
    /// Remove objects from the index and the store by id
    Rm {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Remove every indexed object matching a filter expression
    RmQuery {
        query: String,
    },
}

fn init_tracing() {
    let env = std::env::var("FLEETQ_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("FLEETQ_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid FLEETQ_METRICS_ADDR; expected host:port");
        }
    }
}

fn open_indexer(data_dir: &Path) -> Result<Indexer> {
    std::fs::create_dir_all(data_dir).with_context(|| format!("creating data dir {}", data_dir.display()))?;
    let store_path = data_dir.join(STORE_FILE);
    let store = SqliteStore::open(&store_path.to_string_lossy()).with_context(|| format!("opening store {}", store_path.display()))?;
    let store: Arc<dyn ObjectStore> = Arc::new(store);
    let indexer = Indexer::open(data_dir, store, IndexerConfig::from_env()).context("opening index")?;
    Ok(indexer)
}

fn read_events(file: &Path, cluster: Option<&str>) -> Result<Vec<ObjectEvent>> {
    let reader: Box<dyn BufRead> = if file.as_os_str() == "-" {
        Box::new(std::io::stdin().lock())
    } else {
        let f = std::fs::File::open(file).with_context(|| format!("opening {}", file.display()))?;
        Box::new(std::io::BufReader::new(f))
    };
    let mut events = Vec::new();
    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() { continue; }
        let ev = match cluster {
            Some(c) => {
                let raw: serde_json::Value = serde_json::from_str(&line).with_context(|| format!("line {}", n + 1))?;
                ObjectEvent::Upsert(Object::from_k8s(c, raw).with_context(|| format!("line {}", n + 1))?)
            }
            None => serde_json::from_str(&line).with_context(|| format!("line {}", n + 1))?,
        };
        events.push(ev);
    }
    Ok(events)
}

/// Search result as printed: the hits that hydrated plus the ids that went stale.
#[derive(Debug, Default, serde::Serialize)]
struct SearchOutput {
    hits: usize,
    rows: Vec<Object>,
    stale: Vec<String>,
}

fn run_search(ix: &Indexer, cancel: &CancellationToken, query: &Query, opts: &QueryOptions, limit: usize, all: bool) -> Result<SearchOutput> {
    let it = ix.search(cancel, query, opts)?;
    let mut out = SearchOutput { hits: it.len(), ..Default::default() };
    if all {
        out.rows = it.all()?;
        out.rows.truncate(limit);
        return Ok(out);
    }
    let ids = it.ids();
    for (i, row) in it.rows().take(limit).enumerate() {
        match row {
            Ok(o) => out.rows.push(o),
            Err(e) if e.is_not_found() => {
                warn!(id = %ids[i], "hit no longer in store; skipping");
                out.stale.push(ids[i].clone());
            }
            Err(e) => return Err(e.into()),
        }
    }
    it.close();
    Ok(out)
}

fn render_age(created_at: i64) -> String {
    if created_at <= 0 { return "-".to_string(); }
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_secs() as i64;
    let mut secs = (now - created_at).max(0) as u64;
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}

fn or_dash(s: &str) -> &str { if s.is_empty() { "-" } else { s } }

fn print_search(out: &SearchOutput, format: Output) -> Result<()> {
    match format {
        Output::Human => {
            println!("{:<14} {:<20} {:<18} {:<32} {:<12} AGE", "CLUSTER", "NAMESPACE", "KIND", "NAME", "STATUS");
            for o in out.rows.iter() {
                println!(
                    "{:<14} {:<20} {:<18} {:<32} {:<12} {}",
                    or_dash(&o.cluster), or_dash(&o.namespace), or_dash(&o.kind), o.name, or_dash(&o.status), render_age(o.created_at)
                );
            }
            if !out.stale.is_empty() { eprintln!("{} stale hit(s) skipped", out.stale.len()); }
            eprintln!("{} hit(s), {} shown", out.hits, out.rows.len());
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(out)?),
    }
    Ok(())
}

fn print_facets(facets: &Facets, format: Output) -> Result<()> {
    match format {
        Output::Human => {
            for (label, values) in facets.iter() {
                println!("{}: {}", label, if values.is_empty() { "-".to_string() } else { values.join(", ") });
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(facets)?),
    }
    Ok(())
}

fn print_stats(stats: &ApplyStats, format: Output) -> Result<()> {
    match format {
        Output::Human => println!(
            "upserted={} deleted={} clusters_removed={} skipped={} dropped={}",
            stats.upserted, stats.deleted, stats.clusters_removed, stats.skipped, stats.dropped
        ),
        Output::Json => println!("{}", serde_json::to_string_pretty(stats)?),
    }
    Ok(())
}

fn print_removed(removed: usize, format: Output) -> Result<()> {
    match format {
        Output::Human => println!("removed {}", removed),
        Output::Json => println!("{}", serde_json::json!({ "removed": removed })),
    }
    Ok(())
}

fn run(cli: Cli, cancel: CancellationToken) -> Result<()> {
    let ix = open_indexer(&cli.data_dir)?;
    match cli.command {
        Commands::Ingest { file, cluster, queue_cap } => {
            let events = read_events(&file, cluster.as_deref())?;
            info!(file = %file.display(), events = events.len(), "ingest invoked");
            let stats = apply_events(&ix, &cancel, events, queue_cap)?;
            print_stats(&stats, cli.output)?;
        }
        Commands::Search { terms, filters, order_by, asc, offset, limit, all } => {
            let query = Query { terms: terms.join(" "), filters };
            let opts = QueryOptions { order_by, ascending: asc, offset };
            info!(terms = %query.terms, filters = ?query.filters, limit, "search invoked");
            let out = run_search(&ix, &cancel, &query, &opts, limit, all)?;
            print_search(&out, cli.output)?;
        }
        Commands::Facets => {
            let facets = ix.list_facets(&cancel)?;
            print_facets(&facets, cli.output)?;
        }
        Commands::Rm { ids } => {
            let objects: Vec<Object> = ids.into_iter().map(|id| Object { id, ..Default::default() }).collect();
            ix.remove(&cancel, &objects)?;
            ix.store().delete_objects(&cancel, &objects)?;
            print_removed(objects.len(), cli.output)?;
        }
        Commands::RmQuery { query } => {
            let removed = ix.remove_by_query(&cancel, &query)?;
            print_removed(removed, cli.output)?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling");
            on_signal.cancel();
        }
    });

    let work = cancel.clone();
    tokio::task::spawn_blocking(move || run(cli, work)).await.context("command task panicked")?
}
