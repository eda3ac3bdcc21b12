//! Replay captures through a broker into the ingestion pipeline and print
//! every fan-out event as a JSON line.
//!
//! The broker is in-process by default; `--broker mqtt` uses the MQTT broker
//! named by the configuration instead.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use v2v_telemetry::archive::{PcapReader, PcapWriter, preview};
#[cfg(feature = "mqtt")]
use v2v_telemetry::transport::MqttTransport;
use v2v_telemetry::transport::MemoryBroker;
use v2v_telemetry::{
    ConnectionManager, Decoder, FrameLayout, IngestOptions, IngestPipeline, Ingestion,
    PipelineConfig, ReplayEngine, ReplayOptions, ReplaySummary, RetentionPolicy, Transport,
};

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Broker {
    /// In-process broker; replay feeds ingestion directly
    Memory,
    /// MQTT broker at the configured address and port
    #[cfg(feature = "mqtt")]
    Mqtt,
}

impl Broker {
    fn transport(self) -> Arc<dyn Transport> {
        match self {
            Broker::Memory => Arc::new(MemoryBroker::new()),
            #[cfg(feature = "mqtt")]
            Broker::Mqtt => Arc::new(MqttTransport::new()),
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "v2v-loopback", version, about = "Decode and track V2V captures")]
struct Cli {
    /// YAML file with address, port and topic
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Binary layout revision of the frames
    #[arg(long, global = true, default_value_t = FrameLayout::GeoNet)]
    layout: FrameLayout,

    /// Where frames are published and consumed
    #[arg(long, global = true, value_enum, default_value_t = Broker::Memory)]
    broker: Broker,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay captures and print decoded events
    Replay {
        /// Capture files, replayed in order
        #[arg(required = true)]
        captures: Vec<PathBuf>,

        /// Milliseconds between frames
        #[arg(long, default_value_t = 0)]
        delay_ms: u64,

        /// Topic override
        #[arg(long)]
        topic: Option<String>,

        /// Keep at most this many positions per vehicle
        #[arg(long)]
        retain: Option<usize>,

        /// Archive every received frame to this pcap file
        #[arg(long)]
        record: Option<PathBuf>,
    },
    /// Consume the configured topic and print decoded events until Ctrl-C
    Listen {
        /// Keep at most this many positions per vehicle
        #[arg(long)]
        retain: Option<usize>,

        /// Archive every received frame to this pcap file
        #[arg(long)]
        record: Option<PathBuf>,
    },
    /// Decode the first frames of each capture
    Preview {
        #[arg(required = true)]
        captures: Vec<PathBuf>,

        #[arg(short = 'n', long, default_value_t = 3)]
        count: usize,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| filter.into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = match &cli.config {
        Some(path) => PipelineConfig::from_yaml_file(path)?,
        None => PipelineConfig::default(),
    }
    .with_env_overrides()?;

    let options = |retain: Option<usize>| IngestOptions {
        layout: cli.layout,
        retention: retain.map_or(RetentionPolicy::Unbounded, RetentionPolicy::Capped),
        ..IngestOptions::default()
    };

    match cli.command {
        Command::Replay { captures, delay_ms, topic, retain, record } => {
            let mut config = config;
            if let Some(topic) = topic {
                config.topic = topic;
                config.validate()?;
            }
            let running =
                start_ingestion(cli.broker.transport(), &config, options(retain), record).await?;
            loopback(running, config, captures, Duration::from_millis(delay_ms)).await
        }
        Command::Listen { retain, record } => {
            let running =
                start_ingestion(cli.broker.transport(), &config, options(retain), record).await?;
            listen(running).await
        }
        Command::Preview { captures, count } => {
            for archive in preview(&PcapReader, &captures, count, Decoder::new(cli.layout)) {
                println!("{}", serde_json::to_string(&archive)?);
            }
            Ok(())
        }
    }
}

/// Connected ingestion plus the task printing its events.
struct Running {
    transport: Arc<dyn Transport>,
    ingestion: Ingestion,
    printer: tokio::task::JoinHandle<()>,
}

async fn start_ingestion(
    transport: Arc<dyn Transport>,
    config: &PipelineConfig,
    options: IngestOptions,
    record: Option<PathBuf>,
) -> Result<Running> {
    let mut pipeline = IngestPipeline::new(options);
    if let Some(path) = &record {
        let writer = PcapWriter::create(path)
            .with_context(|| format!("cannot record to {}", path.display()))?;
        pipeline.record_raw(writer);
    }

    let (manager, frames) = ConnectionManager::with_channel(
        Arc::clone(&transport),
        config.clone(),
        options.frame_queue,
    );
    let ingestion = Ingestion::spawn(manager, frames, pipeline);
    ingestion.manager().start().await.context("ingestion could not connect")?;

    let mut events = Box::pin(ingestion.subscribe());
    let printer = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!("Unprintable event: {}", e),
            }
        }
    });
    Ok(Running { transport, ingestion, printer })
}

/// Stop ingestion, flush the recording and print the final statistics.
async fn finish(running: Running, replay: Option<ReplaySummary>) -> Result<()> {
    let Running { ingestion, printer, .. } = running;
    let mut pipeline = ingestion.shutdown().await?;
    pipeline.finish_recording()?;
    let stats = pipeline.stats().snapshot();
    drop(pipeline);
    printer.await.context("event printer failed")?;

    eprintln!(
        "{}",
        serde_json::to_string(&serde_json::json!({ "replay": replay, "ingestion": stats }))?
    );
    Ok(())
}

async fn listen(running: Running) -> Result<()> {
    info!("Listening; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await.context("cannot wait for Ctrl-C")?;
    finish(running, None).await
}

async fn loopback(
    running: Running,
    config: PipelineConfig,
    captures: Vec<PathBuf>,
    delay: Duration,
) -> Result<()> {
    let replay = ReplayEngine::new(Arc::clone(&running.transport), config)
        .options(ReplayOptions { delay, topic: None })
        .start(captures)
        .await
        .context("replay could not connect")?;
    let summary = replay.wait().await?;

    // Let the worker drain what the replay published
    let expected = summary.progress.sent as u64;
    let drained = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let stats = running.ingestion.stats();
            if stats.received + stats.stale >= expected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    if drained.is_err() {
        warn!("Timed out waiting for ingestion to drain");
    }

    info!("Replay finished: {:?}", summary.outcome);
    finish(running, Some(summary)).await
}
