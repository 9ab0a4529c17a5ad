//! Region extraction run.
//!
//! Reads the region dictionary from PostGIS, extracts one fragment per unit,
//! combines fragments per level and writes the manifest.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use regionslice::notify::RunNotifier;
use regionslice::store::{PgRegionStore, RegionStore};
use regionslice::{Config, FailureReport, Pipeline};

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[derive(Parser, Debug)]
#[command(name = "extract")]
#[command(about = "Extract region geometry into GeoJSON and TopoJSON files")]
struct Args {
    /// TOML configuration file; defaults apply when it does not exist
    #[arg(short, long, default_value = "regionslice.toml")]
    config: PathBuf,

    /// Country codes to process, all when omitted
    #[arg(long, num_args = 1..)]
    country_codes: Vec<String>,

    /// Number of concurrent extraction workers
    #[arg(long)]
    workers: Option<usize>,

    /// Produce one file per time slice instead of one per group
    #[arg(long)]
    temporal_slicing: bool,

    /// Re-run only what a previous failure report lists
    #[arg(long, conflicts_with = "country_codes")]
    retry: Option<PathBuf>,

    /// Discord webhook URL for notifications (optional)
    #[arg(long)]
    discord_webhook: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let args = Args::parse();

    let mut config = Config::load_or_default(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    if let Some(workers) = args.workers {
        config.extraction.workers = workers;
    }
    if args.temporal_slicing {
        config.extraction.temporal_slicing = true;
    }
    if args.discord_webhook.is_some() {
        config.notify.discord_webhook = args.discord_webhook.clone();
    }
    config.validate()?;

    info!("Region extraction");
    info!(
        "Output: {} ({} workers, temporal slicing {})",
        config.output.root.display(),
        config.extraction.workers,
        if config.extraction.temporal_slicing { "on" } else { "off" }
    );

    let database_url = config
        .database_url()
        .context("No database URL: set database.url or REGIONSLICE_DATABASE_URL")?;
    let store = PgRegionStore::connect(
        &database_url,
        config.database.max_connections,
        config.extraction.simplify_degrees,
        config.extraction.coordinate_precision,
    )
    .await
    .context("Failed to connect to the region database")?;
    let store: Arc<dyn RegionStore> = Arc::new(store);

    let pipeline = Pipeline::from_config(&config, store)?;
    let notifier = RunNotifier::new(config.notify.discord_webhook.clone());

    let outcome = match &args.retry {
        Some(path) => {
            let report = FailureReport::load(path)
                .with_context(|| format!("Failed to read failure report {}", path.display()))?;
            notifier
                .run_started(&report.countries(), config.extraction.temporal_slicing)
                .await;
            pipeline.retry(&report).await?
        }
        None => {
            notifier
                .run_started(&args.country_codes, config.extraction.temporal_slicing)
                .await;
            pipeline.run(&args.country_codes).await?
        }
    };

    outcome.write_summary(&mut std::io::stderr().lock())?;
    notifier.run_finished(&outcome).await;

    std::process::exit(outcome.exit_code());
}
