//! Ingestion worker: drains the frame queue through the pipeline

use futures::Stream;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::ConnectionManager;
use crate::pipeline::{IngestOptions, IngestPipeline, PipelineStats, StatsSnapshot, event_stream};
use crate::transport::Transport;
use crate::types::{FanoutEvent, PipelineConfig, RawFrame};
use crate::{Result, V2vError};

/// Handle to a running ingestion worker.
///
/// The worker owns the [`IngestPipeline`]; frames are processed one at a
/// time, each under the connection manager's lock so a reconfiguration
/// never interleaves with a frame. Dropping the handle stops the worker.
pub struct Ingestion {
    manager: Arc<ConnectionManager>,
    events: broadcast::Sender<FanoutEvent>,
    stats: Arc<PipelineStats>,
    cancel: CancellationToken,
    task: Option<JoinHandle<IngestPipeline>>,
}

impl Ingestion {
    /// Build the manager and pipeline, spawn the worker, and connect.
    pub async fn start(
        transport: Arc<dyn Transport>,
        config: PipelineConfig,
        options: IngestOptions,
    ) -> Result<Self> {
        config.validate()?;
        let (manager, frames) =
            ConnectionManager::with_channel(transport, config, options.frame_queue);
        let ingestion = Self::spawn(manager, frames, IngestPipeline::new(options));
        ingestion.manager.start().await?;
        Ok(ingestion)
    }

    /// Spawn the worker over an existing manager and its frame queue.
    pub fn spawn(
        manager: Arc<ConnectionManager>,
        frames: mpsc::Receiver<RawFrame>,
        pipeline: IngestPipeline,
    ) -> Self {
        let events = pipeline.event_sender();
        let stats = pipeline.stats();
        let cancel = CancellationToken::new();

        let task = tokio::spawn(Self::worker(
            Arc::clone(&manager),
            frames,
            pipeline,
            cancel.clone(),
        ));

        Self { manager, events, stats, cancel, task: Some(task) }
    }

    async fn worker(
        manager: Arc<ConnectionManager>,
        mut frames: mpsc::Receiver<RawFrame>,
        mut pipeline: IngestPipeline,
        cancel: CancellationToken,
    ) -> IngestPipeline {
        info!("Ingestion worker started");
        let mut processed = 0u64;

        loop {
            let frame = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Ingestion worker cancelled");
                    break;
                }
                frame = frames.recv() => match frame {
                    Some(frame) => frame,
                    None => {
                        debug!("Frame queue closed");
                        break;
                    }
                },
            };

            match manager.admit(&frame).await {
                Some(_session) => {
                    pipeline.process(&frame);
                    processed += 1;
                }
                None => pipeline.note_stale(&frame),
            }
        }

        info!("Ingestion worker ended (processed {} frames)", processed);
        pipeline
    }

    /// Live fan-out events for a new observer.
    pub fn subscribe(&self) -> impl Stream<Item = FanoutEvent> + 'static {
        event_stream(self.events.subscribe())
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Stop the worker and disconnect; returns the pipeline with its registry.
    pub async fn shutdown(mut self) -> Result<IngestPipeline> {
        self.cancel.cancel();
        let task = self.task.take().ok_or_else(|| V2vError::ChannelClosed {
            context: "ingestion worker already shut down".to_string(),
        })?;
        let pipeline = task.await.map_err(|e| V2vError::ChannelClosed {
            context: format!("ingestion worker failed: {e}"),
        })?;
        self.manager.stop().await;
        Ok(pipeline)
    }
}

impl Drop for Ingestion {
    fn drop(&mut self) {
        debug!("Dropping ingestion handle");
        self.cancel.cancel();
    }
}
