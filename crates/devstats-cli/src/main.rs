use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use devstats_storage::EntityStore;
use devstats_sync::{CompareRequest, SyncConfig};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "devstats")]
#[command(about = "Development indicator ingestion and comparison")]
struct Cli {
    /// Log at debug level (RUST_LOG still takes precedence).
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch countries, indicator metadata and values into the database.
    Ingest {
        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Print row counts and samples of the stored data.
    Check,
    /// Write CSV and Parquet snapshots plus a checksum manifest.
    Export {
        #[arg(long, default_value = "exports")]
        out: PathBuf,
    },
    /// Pair two indicators for the given countries.
    Compare {
        indicator_a: String,
        indicator_b: String,
        countries: Vec<String>,
    },
    Migrate,
    Serve,
}

fn init_tracing(debug: bool) {
    let default_level = if debug { LevelFilter::DEBUG } else { LevelFilter::INFO };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .init();
}

async fn open_store() -> Result<EntityStore> {
    let config = SyncConfig::from_env();
    EntityStore::open(&config.database_url)
        .await
        .with_context(|| format!("opening {}", config.database_url))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    match cli.command.unwrap_or(Commands::Ingest { json: false }) {
        Commands::Ingest { json } => {
            let summary = devstats_sync::run_ingest_once_from_env().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("{}", summary.render_text());
            }
        }
        Commands::Check => {
            let store = open_store().await?;
            println!("{}", devstats_sync::database_report(&store).await?);
        }
        Commands::Export { out } => {
            let store = open_store().await?;
            let manifest = devstats_sync::export_snapshot(&store, &out).await?;
            println!("exported {} rows to {}", manifest.row_count, out.display());
            for file in &manifest.files {
                println!("- {} ({} bytes, sha256 {})", file.name, file.bytes, file.sha256);
            }
        }
        Commands::Compare {
            indicator_a,
            indicator_b,
            countries,
        } => {
            let store = open_store().await?;
            let request = CompareRequest {
                indicator_a,
                indicator_b,
                countries,
            };
            let comparison = devstats_sync::compare(&store, &request).await?;
            println!("{}", comparison.title());
            for point in &comparison.points {
                println!("{}\t{}\t{}", point.label, point.value_a, point.value_b);
            }
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let store = EntityStore::connect(&config.database_url).await?;
            store.migrate().await?;
            println!("migrations applied to {}", config.database_url);
        }
        Commands::Serve => {
            devstats_web::serve_from_env().await?;
        }
    }

    Ok(())
}
