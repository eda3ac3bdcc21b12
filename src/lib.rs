//! Decode-and-track pipeline for V2V telemetry.
//!
//! Vehicles broadcast small binary status frames (identity, device timestamp,
//! position, speed, heading) over a publish/subscribe channel. This crate
//! decodes those frames, keeps a trajectory per vehicle, and fans the results
//! out to any number of observers. Recorded captures can be replayed onto the
//! same channel with controllable pacing.
//!
//! # Features
//!
//! - **Total decoding**: malformed frames yield a structured failure, never a panic
//! - **Per-vehicle tracks**: positions in arrival order with elapsed time since first sighting
//! - **Safe reconfiguration**: at most one live broker connection, stale frames dropped
//! - **Replay**: pcap and pcapng captures with pause, resume and stop
//!
//! ## Example (loopback)
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use futures::StreamExt;
//! use v2v_telemetry::{IngestOptions, PipelineConfig, V2v};
//! use v2v_telemetry::transport::MemoryBroker;
//!
//! #[tokio::main]
//! async fn main() -> v2v_telemetry::Result<()> {
//!     let broker = Arc::new(MemoryBroker::new());
//!     let config = PipelineConfig::default();
//!
//!     let options = IngestOptions::default();
//!     let ingestion = V2v::ingest(broker.clone(), config.clone(), options).await?;
//!     let mut events = Box::pin(ingestion.subscribe());
//!
//!     let replay = V2v::replay(broker, config).start(vec!["capture.pcap".into()]).await?;
//!
//!     while let Some(event) = events.next().await {
//!         println!(
//!             "{} +{}ms at ({}, {})",
//!             event.vehicle_id, event.elapsed_ms, event.latitude, event.longitude
//!         );
//!     }
//!     replay.wait().await?;
//!     Ok(())
//! }
//! ```

// Core types and error handling
mod error;
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;
pub mod types;

// Decode and track
pub mod decoder;
pub mod pipeline;
pub mod registry;

// Channel plumbing
pub mod connection;
pub mod transport;

// Recorded data
pub mod archive;
pub mod replay;

pub use error::*;
pub use types::*;

pub use connection::{ConnectionManager, ConnectionState, Ingestion};
pub use decoder::{DecodeFailure, DecodeFailureReason, Decoder, FrameLayout, decode};
pub use pipeline::{IngestOptions, IngestPipeline, StatsSnapshot};
pub use registry::{RetentionPolicy, TrackRegistry, TrackUpdate, VehicleTrack};
pub use replay::{ReplayEngine, ReplayHandle, ReplayOptions, ReplayProgress, ReplaySummary};
pub use transport::{Link, Transport};

use std::sync::Arc;

/// Entry point for ingestion and replay.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use v2v_telemetry::{IngestOptions, PipelineConfig, V2v};
/// use v2v_telemetry::transport::MemoryBroker;
///
/// # #[tokio::main]
/// # async fn main() -> v2v_telemetry::Result<()> {
/// let broker = Arc::new(MemoryBroker::new());
/// let ingestion = V2v::ingest(broker, PipelineConfig::default(), IngestOptions::default()).await?;
/// println!("{}", ingestion.manager().state());
/// # Ok(())
/// # }
/// ```
pub struct V2v;

impl V2v {
    /// Connect to the broker and start decoding frames from the configured topic.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the broker cannot
    /// be reached. Decode failures are never errors; see
    /// [`Ingestion::stats`].
    pub async fn ingest(
        transport: Arc<dyn Transport>,
        config: PipelineConfig,
        options: IngestOptions,
    ) -> Result<Ingestion> {
        Ingestion::start(transport, config, options).await
    }

    /// Prepare a replay onto the configured topic.
    pub fn replay(transport: Arc<dyn Transport>, config: PipelineConfig) -> ReplayEngine {
        ReplayEngine::new(transport, config)
    }
}
