use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info};

use steve_cache::{should_encrypt, CacheFactory, GvkSpec};
use steve_core::Gvk;
use steve_indexer::Indexer;
use steve_informer::Identity;
use steve_query::{ListOptions, Planner};
use steve_schema::discover_catalog;
use steve_sql::{Connection, Encoder, Encoding};

#[derive(Parser, Debug)]
#[command(name = "steve", version, about = "Local exerciser for the cache (discover/ls/watch)")]
struct Cli {
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace to scope `ls`/`watch` to (default: all namespaces)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Discover served resources (incl. CRDs) and their printer columns
    Discover,
    /// List cached objects for a given GVK key, e.g. "v1/Pod" or "apps/v1/Deployment"
    Ls {
        gvk: String,
        /// Extended query grammar, e.g. "metadata.labels[app]=web"
        #[arg(long = "query")]
        query: Option<String>,
    },
    /// Subscribe to a GVK's ring and print +/~/- events until interrupted
    Watch { gvk: String },
}

fn init_tracing() {
    let env = std::env::var("STEVE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let client = kube::Client::try_default().await?;

    match cli.command {
        Commands::Discover => {
            let catalog = discover_catalog(client).await?;
            match cli.output {
                Output::Human => {
                    for schema in catalog.values() {
                        let scope = if schema.namespaced { "namespaced" } else { "cluster" };
                        println!("{} • {} • {}", schema.gvr, schema.plural, scope);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&catalog.values().collect::<Vec<_>>())?),
            }
        }
        Commands::Ls { gvk, query } => {
            let gvk = Gvk::parse(&gvk).ok_or_else(|| anyhow!("invalid GVK key {gvk:?}, expected \"version/Kind\" or \"group/version/Kind\""))?;
            let (factory, indexer) = bootstrap(client).await?;
            let handle = factory.cache_for(&gvk, &spec_for(&gvk)).await?;
            let _handle = handle;

            let mut opts = ListOptions::default();
            if let Some(q) = query.as_deref() {
                opts.filters = steve_query::parse(q)?;
            }
            if let Some(ns) = cli.namespace.as_deref() {
                opts.partitions = vec![steve_core::Partition::Scoped { namespace: ns.to_string(), names: None }];
            }

            let planner = Planner::new(&indexer);
            let (objects, result) = planner.list(&gvk, &opts, &HashSet::new())?;

            match cli.output {
                Output::Human => {
                    println!("NAMESPACE   NAME                 AGE");
                    for obj in &objects {
                        let ns = obj.namespace().unwrap_or("-").to_string();
                        println!("{:<11} {:<20} {}", ns, obj.name().unwrap_or("-"), "-");
                    }
                    println!("({} total)", result.count);
                }
                Output::Json => {
                    let json: Vec<serde_json::Value> = objects.iter().map(|o| o.clone().into_json()).collect();
                    println!("{}", serde_json::to_string_pretty(&json)?);
                }
            }

            factory.stop(&gvk).await;
        }
        Commands::Watch { gvk } => {
            let gvk = Gvk::parse(&gvk).ok_or_else(|| anyhow!("invalid GVK key {gvk:?}, expected \"version/Kind\" or \"group/version/Kind\""))?;
            let (factory, indexer) = bootstrap(client).await?;
            let handle = factory.cache_for(&gvk, &spec_for(&gvk)).await?;
            let _handle = handle;

            let token = tokio_util::sync::CancellationToken::new();
            tokio::spawn({
                let token = token.clone();
                async move {
                    let _ = tokio::signal::ctrl_c().await;
                    token.cancel();
                }
            });

            let mut reader = indexer.ring_reader(&gvk, None).ok_or_else(|| anyhow!("no ring for {gvk}"))?;
            loop {
                match read_next(&mut reader, &token).await {
                    Ok(record) => {
                        let marker = match record.kind {
                            steve_indexer::EventKind::Add => "+",
                            steve_indexer::EventKind::Change => "~",
                            steve_indexer::EventKind::Remove => "-",
                        };
                        println!("{marker} {}", record.key);
                    }
                    Err(steve_ring::RingError::Cancelled) => break,
                    Err(e) => {
                        error!(error = ?e, "ring reader stopped");
                        break;
                    }
                }
            }
            token.cancel();
            factory.stop(&gvk).await;
        }
    }

    Ok(())
}

/// A single in-process, in-memory cache stack: a fresh SQLite connection, an
/// indexer, and a factory around them. Every invocation of this CLI starts
/// from an empty cache, unlike a long-running proxy process.
async fn bootstrap(client: kube::Client) -> Result<(Arc<CacheFactory>, Arc<Indexer>)> {
    let conn = Arc::new(Connection::open_in_memory()?);
    let encoder = Arc::new(Encoder::new(Encoding::from_env()));
    let indexer = Arc::new(Indexer::new(conn, encoder, None));
    let factory = Arc::new(CacheFactory::new(client, Arc::clone(&indexer), Duration::from_secs(10)));
    info!("bootstrapped in-memory cache");
    Ok((factory, indexer))
}

fn spec_for(gvk: &Gvk) -> GvkSpec {
    GvkSpec {
        indexed_fields: Vec::new(),
        encrypt: should_encrypt(gvk, std::env::var("STEVE_ENCRYPT_ALL").is_ok()),
        transform: Arc::new(Identity),
        field_selector: None,
        ring_capacity: 1024,
    }
}

async fn read_next(
    reader: &mut steve_ring::RingReader<steve_indexer::EventRecord>,
    token: &tokio_util::sync::CancellationToken,
) -> Result<steve_indexer::EventRecord, steve_ring::RingError> {
    let token = token.clone();
    tokio::task::block_in_place(|| reader.read(&token))
}
