//! `plato` binary: runs the CPU limiter against live load and exposes the
//! configuration helpers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result as AnyhowResult};
use clap::Parser;
use tracing::info;

use plato_engine::{
    detect_load_source, handle_generate_config, handle_sample, handle_validate, handle_version,
    init_logging, load_config_or_default, Cli, Commands, CpuSampler, PidLimiter, PlatoConfig,
    ENGINE_FULL_NAME, ENGINE_VERSION,
};

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    // Handle subcommands that don't need full initialization
    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Some(Commands::Validate { verbose }) => {
            handle_validate(&cli.config, *verbose)?;
            return Ok(());
        }
        _ => {}
    }

    let config = load_config_or_default(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    init_logging(&logging_config)?;

    match cli.command {
        Some(Commands::Sample { count, json }) => {
            tokio::task::spawn_blocking(move || handle_sample(&config, count, json))
                .await
                .context("sampler thread failed")??;
        }
        Some(Commands::Run {
            threshold,
            status_interval,
        }) => run_limiter(config, threshold, status_interval).await?,
        None => run_limiter(config, None, Duration::from_secs(1)).await?,
        Some(Commands::Version | Commands::GenerateConfig { .. } | Commands::Validate { .. }) => {}
    }

    Ok(())
}

async fn run_limiter(
    mut config: PlatoConfig,
    threshold: Option<f64>,
    status_interval: Duration,
) -> AnyhowResult<()> {
    if let Some(threshold) = threshold {
        config.limiter.cpu_threshold = threshold;
        config.validate().context("invalid --threshold")?;
    }

    info!("{} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);

    let source = detect_load_source(config.sampler.source).context("no usable load source")?;
    let sampler = Arc::new(CpuSampler::from_config(source, &config.sampler));
    let limiter = Arc::new(PidLimiter::from_config(&config, Arc::clone(&sampler))?);
    limiter.start()?;

    let mut ticker = tokio::time::interval(status_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let status = limiter.status();
                info!(
                    target: "plato::status",
                    usage = status.usage,
                    threshold = status.threshold,
                    reject_ratio = status.reject_ratio,
                    overloaded = status.overloaded,
                    "limiter status"
                );
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    limiter.stop();
    Ok(())
}
