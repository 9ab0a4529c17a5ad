//! Publishes the output tree to object storage and invalidates the CDN.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use regionslice::upload::{Environment, Publisher, Secrets};
use regionslice::Config;

#[derive(Parser, Debug)]
#[command(name = "publish")]
#[command(about = "Upload extracted regions and invalidate the CDN cache")]
struct Args {
    /// Deployment target
    #[arg(value_enum)]
    environment: Environment,

    /// TOML configuration file, read for the output root
    #[arg(short, long, default_value = "regionslice.toml")]
    config: PathBuf,

    /// TOML file holding per-environment bucket and distribution ids
    #[arg(long, default_value = "secrets.toml")]
    secrets: PathBuf,

    /// Print the commands without running them
    #[arg(long)]
    dry_run: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let args = Args::parse();

    let config = Config::load_or_default(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    let secrets = Secrets::load(&args.secrets)
        .with_context(|| format!("Failed to load secrets from {}", args.secrets.display()))?;
    let publisher = Publisher::new(&config.output.root, &secrets, args.environment)?;

    info!("Publishing {} to {}", config.output.root.display(), args.environment);
    if args.dry_run {
        for command in publisher.commands() {
            println!("{}", command);
        }
        return Ok(());
    }

    publisher.publish()?;
    info!("Published to {}", args.environment);
    Ok(())
}
