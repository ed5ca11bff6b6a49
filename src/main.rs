//! # docsync CLI
//!
//! The `docsync` binary keeps vector indexes in sync with documentation and
//! code sources and answers queries against them.
//!
//! ## Usage
//!
//! ```bash
//! docsync --config ./config/docsync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docsync init` | Create the index schema for every configured source |
//! | `docsync sync [source]` | Sync all sources, or one by name |
//! | `docsync search "<query>"` | Search documentation |
//! | `docsync search-code "<query>"` | Search code, optionally per repo |
//! | `docsync get <url>` | Print every chunk of one document in order |
//! | `docsync purge <url>` | Delete every record stored for a url |
//! | `docsync serve` | Start the HTTP tool server |
//!
//! ## Exit codes
//!
//! `0` on success, `2` for configuration errors (raised before any index is
//! opened), `1` for anything else.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use docsync::config::{load_config, Config};
use docsync::error::Error;
use docsync::ingest::run_sync;
use docsync::query::{GetChunksRequest, QueryService, SearchRequest, Target};
use docsync::server::run_server;
use docsync::store::IndexStore;

/// docsync: incremental vector index sync and retrieval.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file.
#[derive(Parser)]
#[command(
    name = "docsync",
    about = "Incremental vector index sync and retrieval for docs and code",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docsync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Index selection shared by query commands.
#[derive(Args)]
struct TargetArgs {
    /// Product name (combined with --product-version into the index name).
    #[arg(long)]
    product: Option<String>,

    /// Product version.
    #[arg(long = "product-version")]
    version: Option<String>,

    /// Explicit index (collection) name.
    #[arg(long)]
    collection: Option<String>,
}

impl From<TargetArgs> for Target {
    fn from(args: TargetArgs) -> Self {
        Target {
            product_name: args.product,
            version: args.version,
            collection: args.collection,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the index schema for every configured source.
    ///
    /// Idempotent; running it multiple times is safe.
    Init,

    /// Sync sources into their indexes.
    Sync {
        /// Only sync the source with this name.
        source: Option<String>,

        /// Ignore recorded commits and rescan everything.
        #[arg(long)]
        full: bool,
    },

    /// Search documentation.
    Search {
        query: String,

        #[command(flatten)]
        target: TargetArgs,

        /// Keep only results whose url starts with this prefix.
        #[arg(long)]
        url_prefix: Option<String>,

        /// Maximum number of results.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Search code.
    SearchCode {
        query: String,

        #[command(flatten)]
        target: TargetArgs,

        /// Restrict results to one repository.
        #[arg(long)]
        repo: Option<String>,

        #[arg(long)]
        url_prefix: Option<String>,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Print every chunk of one document in reading order.
    Get {
        url: String,

        #[command(flatten)]
        target: TargetArgs,
    },

    /// Delete every record stored for a url.
    Purge {
        url: String,

        #[command(flatten)]
        target: TargetArgs,
    },

    /// Start the HTTP tool server.
    Serve,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            if is_configuration_error(&e) {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn is_configuration_error(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| matches!(cause.downcast_ref::<Error>(), Some(Error::Configuration(_))))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Init => init(&config).await?,
        Commands::Sync { source, full } => run_sync(&config, source.as_deref(), full).await?,
        Commands::Search {
            query,
            target,
            url_prefix,
            limit,
        } => {
            let req = SearchRequest {
                query,
                target: target.into(),
                url_prefix,
                repo: None,
                limit,
            };
            let response = QueryService::new(&config)?.search_docs(&req).await;
            println!("{}", response.render());
        }
        Commands::SearchCode {
            query,
            target,
            repo,
            url_prefix,
            limit,
        } => {
            let req = SearchRequest {
                query,
                target: target.into(),
                url_prefix,
                repo,
                limit,
            };
            let response = QueryService::new(&config)?.search_code(&req).await;
            println!("{}", response.render());
        }
        Commands::Get { url, target } => {
            let req = GetChunksRequest {
                url,
                target: target.into(),
            };
            let response = QueryService::new(&config)?.get_chunks(&req).await;
            println!("{}", response.render());
        }
        Commands::Purge { url, target } => {
            let target: Target = target.into();
            let Some(collection) = target.collection() else {
                return Err(Error::Validation(
                    "Missing index identifier: provide --product and --product-version, or --collection."
                        .to_string(),
                )
                .into());
            };
            let store =
                IndexStore::open_existing(&config.store, &collection, config.embedding.dims)
                    .await?;
            let deleted = store.delete_by_url(&url).await;
            store.close().await;
            println!("purged {} records for {}", deleted, url);
        }
        Commands::Serve => run_server(&config).await?,
    }

    Ok(())
}

async fn init(config: &Config) -> anyhow::Result<()> {
    let mut collections: Vec<String> = config
        .sources
        .iter()
        .filter_map(|s| s.collection())
        .collect();
    collections.sort();
    collections.dedup();

    if collections.is_empty() {
        println!("No sources configured; nothing to initialize.");
        return Ok(());
    }

    for collection in collections {
        let store = IndexStore::open(&config.store, &collection, config.embedding.dims).await?;
        let result = store.init_schema().await;
        store.close().await;
        result?;
        println!("Initialized {} ({})", collection, store.kind());
    }
    Ok(())
}
