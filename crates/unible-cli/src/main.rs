//! unible CLI entry point

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use unible_central::{platform_event_channel, BleCentral, PlatformAdapter, PlatformEventReceiver};
use unible_cli::{
    cli::{Cli, Commands},
    commands::CommandDispatcher,
    config::{AppConfig, Backend},
    demo,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let cli = Cli::parse();

    // Load configuration and apply command line overrides
    let config = load_configuration(&cli)?;

    // Initialize logging
    setup_logging(cli.verbose, &config.cli.log_level);

    config.validate().context("Invalid configuration")?;

    if let Commands::Config = cli.command {
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let (tx, rx) = platform_event_channel();
    match config.cli.backend {
        Backend::Demo => {
            info!("Using the demo backend");
            let platform = Arc::new(demo::demo_platform(tx));
            let feed = demo::spawn_sensor_feed(platform.clone(), Duration::from_secs(1));
            let result = run(cli.command, platform, rx, &config).await;
            feed.abort();
            result
        }
        Backend::Native => {
            #[cfg(feature = "native")]
            {
                let platform = unible_central::BtleplugPlatform::new(tx)
                    .await
                    .context("Failed to open the Bluetooth adapter")?;
                run(cli.command, Arc::new(platform), rx, &config).await
            }
            #[cfg(not(feature = "native"))]
            {
                drop((tx, rx));
                anyhow::bail!("The native backend requires building with `--features native`")
            }
        }
    }?;

    debug!("unible exited successfully");
    Ok(())
}

async fn run<P: PlatformAdapter>(
    command: Commands,
    platform: Arc<P>,
    platform_events: PlatformEventReceiver,
    config: &AppConfig,
) -> anyhow::Result<()> {
    let (central, events) = BleCentral::new(platform, platform_events, config.central_config());
    CommandDispatcher::execute(command, central, events, config)
        .await
        .context("Command execution failed")
}

/// Setup logging; `RUST_LOG` wins over the configured level
fn setup_logging(verbose: bool, log_level: &str) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

/// Load configuration from file or defaults, then apply flag overrides
fn load_configuration(cli: &Cli) -> anyhow::Result<AppConfig> {
    let mut config =
        AppConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    if let Some(backend) = cli.backend {
        config.cli.backend = backend;
    }
    if let Some(cache_dir) = &cli.cache_dir {
        config.central.cache_dir = Some(cache_dir.clone());
    }
    Ok(config)
}
