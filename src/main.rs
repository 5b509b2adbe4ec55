//! # citedex CLI (`cdx`)
//!
//! The `cdx` binary is the host surface for the index. It provides
//! commands for database initialization, indexing runs (one-shot,
//! scheduled, or watching the archive), search, and citation-graph
//! inspection.
//!
//! ## Usage
//!
//! ```bash
//! cdx --config ./cdx.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `cdx init` | Create the SQLite database and run schema migrations |
//! | `cdx index` | Run one indexing pass (`--force` rescans everything) |
//! | `cdx index --watch` | Reindex after changes to the archive trees |
//! | `cdx index --schedule "*/30 * * * *"` | Reindex on a recurring schedule |
//! | `cdx search "<query>"` | Ranked full-text search with optional citations |
//! | `cdx get <id>` | Retrieve a full document by id |
//! | `cdx related <id>` | Documents within N citation hops |
//! | `cdx report <id>` | Citation metrics for one document |
//! | `cdx graph` | Export the citation graph (JSON, GraphML, DOT) |
//! | `cdx stats` | Document/citation counts and database size |

use anyhow::bail;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use citedex::citations::{self, GraphFormat};
use citedex::config::{self, Config};
use citedex::indexer::{CronSchedule, Indexer};
use citedex::query::{SearchApi, SearchRequest};
use citedex::stats;
use citedex::store::DocumentStore;

/// citedex — a citation-aware local search index for archived research
/// documents.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file describing the archive roots and database location.
#[derive(Parser)]
#[command(
    name = "cdx",
    about = "citedex — citation-aware search over archived research documents",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./cdx.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. This
    /// command is idempotent — running it multiple times is safe.
    Init,

    /// Run an indexing pass, or keep indexing on a trigger.
    ///
    /// Scans both archive trees, normalizes new or changed documents,
    /// rebuilds the citation graph, and commits the result as one
    /// transaction. With `--watch` or `--schedule`, keeps running until
    /// interrupted.
    Index {
        /// Ignore the last-scan watermark and rescan every file.
        #[arg(long)]
        force: bool,

        /// Watch the archive roots and reindex after each quiet period.
        #[arg(long)]
        watch: bool,

        /// Recurring schedule, e.g. "*/30 * * * *" (minute and hour
        /// fields; day, month, and weekday must be '*').
        #[arg(long)]
        schedule: Option<String>,
    },

    /// Search indexed documents.
    Search {
        /// The search query string.
        query: String,

        /// Expand each term with a prefix wildcard.
        #[arg(long)]
        fuzzy: bool,

        /// Restrict matching to specific fields (title, content, query).
        #[arg(long = "field")]
        fields: Vec<String>,

        /// Maximum number of results (1-50).
        #[arg(long)]
        limit: Option<i64>,

        /// Attach citing/cited lists and a citation graph to the results.
        #[arg(long)]
        citations: bool,

        /// Citation traversal depth for the attached graph (1-3).
        #[arg(long, default_value_t = 1)]
        depth: u8,

        /// Emit the full response as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Retrieve a document by id.
    Get {
        id: String,

        /// Emit the document as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Documents within N citation hops of the given document.
    Related {
        id: String,

        /// Traversal depth.
        #[arg(long, default_value_t = 1)]
        depth: usize,

        /// Emit the result as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Citation metrics for one document.
    Report {
        id: String,

        /// Emit the report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Export the citation graph for external visualization.
    Graph {
        /// Output format: json, graphml, or dot.
        #[arg(long, default_value = "json")]
        format: String,

        /// Write to a file instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Document/citation counts and database size.
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("citedex=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let store = DocumentStore::open(&cfg.db.path).await?;
            store.close().await;
            println!("Database initialized successfully.");
        }
        Commands::Index {
            force,
            watch,
            schedule,
        } => {
            run_index(cfg, force, watch, schedule).await?;
        }
        Commands::Search {
            query,
            fuzzy,
            fields,
            limit,
            citations,
            depth,
            json,
        } => {
            let store = Arc::new(DocumentStore::open(&cfg.db.path).await?);
            let api = SearchApi::new(store.clone(), cfg.search.clone());

            let request = SearchRequest {
                query,
                fuzzy,
                fields: if fields.is_empty() { None } else { Some(fields) },
                limit,
                include_citations: citations,
                citation_depth: depth,
            };
            let response = api.search(&request).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                print_search_results(&response);
            }
            store.close().await;
        }
        Commands::Get { id, json } => {
            let store = DocumentStore::open(&cfg.db.path).await?;
            match store.get(&id).await {
                Ok(doc) => {
                    if json {
                        println!("{}", serde_json::to_string_pretty(&doc)?);
                    } else {
                        print_document(&doc);
                    }
                }
                Err(e) => {
                    store.close().await;
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            }
            store.close().await;
        }
        Commands::Related { id, depth, json } => {
            let store = Arc::new(DocumentStore::open(&cfg.db.path).await?);
            let api = SearchApi::new(store.clone(), cfg.search.clone());
            match api.find_related(&id, depth).await {
                Ok(related) => {
                    if json {
                        println!("{}", serde_json::to_string_pretty(&related)?);
                    } else if related.is_empty() {
                        println!("No related documents.");
                    } else {
                        for doc in &related {
                            println!("{}  {} ({})", doc.id, doc.title, doc.source.as_str());
                        }
                    }
                }
                Err(e) => {
                    store.close().await;
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            }
            store.close().await;
        }
        Commands::Report { id, json } => {
            let store = Arc::new(DocumentStore::open(&cfg.db.path).await?);
            let api = SearchApi::new(store.clone(), cfg.search.clone());
            match api.citation_report(&id).await {
                Ok(report) => {
                    if json {
                        println!("{}", serde_json::to_string_pretty(&report)?);
                    } else {
                        println!("--- Citation report: {} ---", report.document_id);
                        println!("outgoing:        {}", report.outgoing_count);
                        println!("incoming:        {}", report.incoming_count);
                        println!("mean confidence: {:.3}", report.mean_confidence);
                        println!(
                            "network:         {} nodes, {} edges",
                            report.network.nodes.len(),
                            report.network.edges.len()
                        );
                    }
                }
                Err(e) => {
                    store.close().await;
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            }
            store.close().await;
        }
        Commands::Graph { format, output } => {
            let format = match GraphFormat::parse(&format) {
                Some(f) => f,
                None => bail!("Unknown graph format: '{}'. Use json, graphml, or dot.", format),
            };

            let store = DocumentStore::open(&cfg.db.path).await?;
            let docs = store.list().await?;
            let edges = store.list_citations().await?;
            let serialized = citations::export_graph(&docs, &edges, format)?;

            match output {
                Some(path) => {
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(&path, &serialized)?;
                    eprintln!(
                        "Exported {} nodes, {} edges to {}",
                        docs.len(),
                        edges.len(),
                        path.display()
                    );
                }
                None => println!("{}", serialized),
            }
            store.close().await;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
    }

    Ok(())
}

/// Run one pass, then keep serving watch/schedule triggers until ctrl-c.
async fn run_index(
    cfg: Config,
    force: bool,
    watch_flag: bool,
    schedule: Option<String>,
) -> anyhow::Result<()> {
    // Malformed schedules are rejected before anything else happens.
    let schedule = match schedule {
        Some(expr) => Some(CronSchedule::parse(&expr)?),
        None => None,
    };

    let store = Arc::new(DocumentStore::open(&cfg.db.path).await?);
    let indexer = Arc::new(Indexer::new(cfg, store));

    let stats = indexer.run(force).await?;
    print_run_stats(&stats);

    if !watch_flag && schedule.is_none() {
        indexer.store().close().await;
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();

    if let Some(schedule) = schedule {
        let indexer = indexer.clone();
        let rx = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            indexer.run_scheduled(&schedule, rx).await
        }));
    }

    if watch_flag {
        let indexer = indexer.clone();
        let rx = shutdown_rx.clone();
        handles.push(tokio::spawn(async move { indexer.watch(rx).await }));
    }

    tokio::signal::ctrl_c().await?;
    eprintln!("shutting down");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        handle.await??;
    }

    indexer.store().close().await;
    Ok(())
}

fn print_run_stats(stats: &citedex::indexer::RunStats) {
    println!("index run");
    println!("  scanned:   {}", stats.scanned);
    println!("  added:     {}", stats.added);
    println!("  updated:   {}", stats.updated);
    println!("  deleted:   {}", stats.deleted);
    println!("  citations: {}", stats.citations);
    println!("  elapsed:   {} ms", stats.elapsed_ms);
    println!("ok");
}

fn print_search_results(response: &citedex::query::SearchResponse) {
    if response.results.is_empty() {
        println!("No results.");
        return;
    }

    for (i, result) in response.results.iter().enumerate() {
        let doc = &result.document;
        println!("{}. [{:.2}] {}", i + 1, doc.score, doc.title);
        println!("    source: {} / {}", doc.source.as_str(), doc.path);
        if let Some(ref date) = doc.date {
            println!("    date: {}", date);
        }
        for highlight in &result.highlights {
            for snippet in &highlight.snippets {
                println!(
                    "    {}: \"{}\"",
                    highlight.field,
                    snippet.replace('\n', " ")
                );
            }
        }
        if let Some(ref citations) = result.citations {
            println!(
                "    citations: {} cited, {} citing",
                citations.cited.len(),
                citations.citing.len()
            );
        }
        println!("    id: {}", doc.id);
        println!();
    }

    if let Some(ref graph) = response.citation_graph {
        println!(
            "citation graph: {} nodes, {} edges",
            graph.nodes.len(),
            graph.edges.len()
        );
    }
}

fn print_document(doc: &citedex::models::Document) {
    println!("--- Document ---");
    println!("id:     {}", doc.id);
    println!("title:  {}", doc.title);
    println!("path:   {}", doc.path);
    println!("source: {}", doc.source.as_str());
    println!("type:   {}", doc.doc_type.as_str());
    if let Some(ref date) = doc.date {
        println!("date:   {}", date);
    }
    if let Some(ref query) = doc.query {
        println!("query:  {}", query);
    }
    println!("metadata: {}", doc.metadata);
    println!();
    println!("--- Content ---");
    println!("{}", doc.content);
}
