mod cli;
mod collect_logs;
mod config;
mod logging;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;
use url::Url;

use cli::parse_args;
use config::SensorConfig;
use flowsensor_core::capture::factory::build_capturer;
use flowsensor_core::{
    parse_interfaces, Analyzer, EnvelopeBuffer, Orchestrator, PublisherClient, ReqwestTransport,
    RunOutcome, Watcher, ZeekAnalyzer,
};

const EXIT_COMPLETED: i32 = 0;

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args();

    if let Some(dest) = args.collect_logs.clone() {
        // Config isn't required for the collect-logs subcommand when it's
        // invoked against an explicit set of directories, but reusing the
        // configured paths makes the common case ("just grab everything")
        // a single flag.
        let config = SensorConfig::load(&args.config).await.ok();
        let dirs = config
            .map(|c| vec![c.capture.output_dir, c.buffering.dir])
            .unwrap_or_default();
        collect_logs::collect_logs(&dirs, &dest)
            .with_context(|| format!("failed to write log bundle to {}", dest.display()))?;
        println!("wrote log bundle to {}", dest.display());
        return Ok(());
    }

    let config = SensorConfig::load(&args.config)
        .await
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;

    logging::init(&config.logging, args.verbose).await?;
    info!(sensor_id = %config.sensor_id, "flowsensor starting");

    let ctx = CancellationToken::new();
    let shutdown_ctx = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received shutdown signal, stopping");
            shutdown_ctx.cancel();
        }
    });

    let interfaces = parse_interfaces(&config.capture.interface)?;

    let analyzer: Arc<dyn Analyzer> = Arc::new(ZeekAnalyzer::new(
        flowsensor_core::capture::command::default_command_factory(),
        vec![],
    ));

    // enigma_api.upload = false puts the sensor in capture-only mode: no
    // publisher is constructed at all, so a blank server/api_key is fine.
    let publisher = if config.enigma_api.upload {
        let transport = Arc::new(ReqwestTransport::new(
            Url::parse(&config.enigma_api.server).context("invalid enigma_api.server URL")?,
            config.enigma_api.api_key.clone(),
            config.enigma_api.terminal_status_code,
        ));
        let buffer = EnvelopeBuffer::new(
            config.buffering.dir.clone(),
            Duration::from_secs(config.buffering.max_age_hours * 3600),
        );
        Some(Arc::new(PublisherClient::new(
            transport,
            buffer,
            config.enigma_api.retry_count,
            Duration::from_secs(config.enigma_api.retry_delay_seconds),
        )))
    } else {
        info!("enigma_api.upload is disabled, running in capture-only mode");
        None
    };
    let max_payload_size = (config.enigma_api.max_payload_size_mb * 1024 * 1024) as usize;

    let outcome = if args.watch {
        let watch_dir = config
            .watch
            .dir
            .clone()
            .context("--watch requires watch.dir to be set in the config file")?;
        let watcher = Watcher {
            watch_dir,
            poll_interval: Duration::from_secs(config.watch.poll_interval_seconds),
            stable_seconds: Duration::from_secs(config.watch.stable_seconds),
            analyzer,
            publisher,
            sensor_id: config.sensor_id.clone(),
            sampling_percentage: config.zeek.sampling_percentage,
            max_payload_size,
        };
        watcher.run(ctx).await?
    } else {
        let orchestrator = Orchestrator::new(
            config.capture.output_dir.clone(),
            Duration::from_secs(config.capture.window_seconds),
            config.capture.run_loop,
            Some(Duration::from_secs(config.logging.log_retention_days * 24 * 3600)),
            build_capturer(),
            analyzer,
            publisher,
            config.sensor_id.clone(),
            interfaces,
            config.zeek.sampling_percentage,
            max_payload_size,
        );
        orchestrator.run(ctx).await?
    };

    match outcome {
        RunOutcome::Completed => {
            info!("flowsensor finished");
            std::process::exit(EXIT_COMPLETED);
        }
        RunOutcome::TerminalRevoked => {
            tracing::error!("publisher reported this sensor is permanently revoked, stopping");
            std::process::exit(EXIT_COMPLETED);
        }
    }
}
