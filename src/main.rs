//! catalog-search CLI
//!
//! Command-line interface for indexing a product catalog and querying it.

use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use catalog_search::{
    ApiConfig, ApiServer, AppState, Error, IndexBackend, Result, SearchApp, SearchConfig,
    SearchRequest,
};

#[derive(Parser)]
#[command(name = "catalog-search")]
#[command(author, version, about = "Semantic product-catalog search", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.toml")]
        output: String,
    },

    /// Create the index if it does not exist
    Setup,

    /// Create the index and ingest the catalog
    Ingest {
        /// Catalog CSV to read instead of the configured one
        #[arg(long)]
        catalog: Option<PathBuf>,

        /// Rows to read (0 = all)
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Run one query and print the results
    Search {
        /// Query text
        query: String,

        /// Number of results
        #[arg(short, long)]
        k: Option<usize>,

        /// Candidate pool examined by the engine
        #[arg(long)]
        candidates: Option<usize>,
    },

    /// Serve queries over HTTP
    Serve {
        /// HTTP listen address
        #[arg(long)]
        api_addr: Option<String>,

        /// Ingest the catalog before serving (needed with the memory backend)
        #[arg(long, default_value = "false")]
        ingest: bool,
    },
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

fn load_config(path: &str) -> Result<SearchConfig> {
    let mut config = if Path::new(path).exists() {
        info!("Loading configuration from: {}", path);
        SearchConfig::load(path)?
    } else {
        info!("Using default configuration");
        SearchConfig::default()
    };
    config.apply_env()?;
    Ok(config)
}

async fn run_ingest(app: &SearchApp) -> Result<()> {
    app.setup().await?;
    let report = app.ingest_catalog().await?;
    info!(
        "Indexed {} of {} rows into '{}'",
        report.indexed,
        report.processed,
        app.config().index.name
    );
    for rejected in &report.rejected {
        warn!("Row {} (id {:?}) rejected: {}", rejected.row, rejected.id, rejected.reason);
    }
    for failed in &report.inference_failures {
        warn!("Row {} (id {:?}) skipped: {}", failed.row, failed.id, failed.reason);
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    if let Err(e) = run(cli).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Init { output } => {
            info!("Writing default configuration to: {}", output);
            SearchConfig::default().save(&output)?;
            info!("Configuration saved successfully");
        }

        Commands::Setup => {
            let config = load_config(&cli.config)?;
            let app = SearchApp::from_config(config).await?;
            app.setup().await?;
        }

        Commands::Ingest { catalog, limit } => {
            let mut config = load_config(&cli.config)?;
            if let Some(path) = catalog {
                config.ingest.catalog_path = path;
            }
            if let Some(limit) = limit {
                config.ingest.row_limit = limit;
            }
            if config.index.backend == IndexBackend::Memory {
                warn!("Memory backend selected; ingested documents are discarded on exit");
            }
            let app = SearchApp::from_config(config).await?;
            run_ingest(&app).await?;
        }

        Commands::Search {
            query,
            k,
            candidates,
        } => {
            let config = load_config(&cli.config)?;
            let k = k.unwrap_or(config.query.k);
            let request = SearchRequest::new(query)
                .with_k(k)
                .with_candidate_pool(candidates.unwrap_or(config.query.candidate_pool.max(k)));
            let app = SearchApp::from_config(config).await?;
            let engine = app.query_engine()?;

            let results = engine.search(&request).await?;
            println!("Search Results");
            for result in results {
                match &result.name {
                    Some(name) => println!("\n{}", name),
                    None => warn!("{}", Error::MissingField("name".into())),
                }
                match &result.description {
                    Some(description) => println!("Description: {}", description),
                    None => warn!("{}", Error::MissingField("description".into())),
                }
                println!("Score: {:.4}", result.score);
                println!("{}", "-".repeat(40));
            }
        }

        Commands::Serve { api_addr, ingest } => {
            let config = load_config(&cli.config)?;
            let metrics = if config.api.metrics_enabled {
                match PrometheusBuilder::new().install_recorder() {
                    Ok(handle) => Some(handle),
                    Err(e) => {
                        warn!("Failed to install metrics recorder: {}", e);
                        None
                    }
                }
            } else {
                None
            };

            let api_config = ApiConfig {
                listen_address: api_addr.unwrap_or_else(|| config.api.listen_address.clone()),
                cors_enabled: config.api.cors_enabled,
            };
            let default_k = config.query.k;
            let default_candidate_pool = config.query.candidate_pool;

            let app = SearchApp::from_config(config).await?;
            if ingest {
                run_ingest(&app).await?;
            }
            let state = AppState {
                engine: Arc::new(app.query_engine()?),
                default_k,
                default_candidate_pool,
                metrics,
                start_time: Instant::now(),
            };

            info!("Press Ctrl+C to stop");
            tokio::select! {
                result = ApiServer::new(api_config, state).run() => result?,
                _ = tokio::signal::ctrl_c() => info!("Received shutdown signal"),
            }
        }
    }

    Ok(())
}
