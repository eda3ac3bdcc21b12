//! Archive replay
//!
//! Publishes recorded frames onto the channel with a fixed delay between
//! consecutive frames. Replay can be paused, resumed and stopped while it
//! runs, and reports progress as it goes.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use v2v_telemetry::replay::{ReplayEngine, ReplayOptions};
//! use v2v_telemetry::transport::MemoryBroker;
//! use v2v_telemetry::PipelineConfig;
//!
//! #[tokio::main]
//! async fn main() -> v2v_telemetry::Result<()> {
//!     let broker = Arc::new(MemoryBroker::new());
//!     let handle = ReplayEngine::new(broker, PipelineConfig::default())
//!         .options(ReplayOptions { delay: Duration::from_millis(100), ..Default::default() })
//!         .start(vec!["capture.pcap".into()])
//!         .await?;
//!
//!     let summary = handle.wait().await?;
//!     println!("sent {} of {}", summary.progress.sent, summary.progress.total);
//!     Ok(())
//! }
//! ```

use futures::Stream;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::archive::{ArchiveReader, PcapReader, load_all};
use crate::transport::{Link, Transport};
use crate::types::PipelineConfig;
use crate::{Result, V2vError};

/// Default spacing between frames.
pub const DEFAULT_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayOptions {
    /// Wait between consecutive frames (not after the last one)
    pub delay: Duration,
    /// Publish here instead of the configured topic
    pub topic: Option<String>,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self { delay: DEFAULT_DELAY, topic: None }
    }
}

/// Counters published while a replay runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplayProgress {
    /// Frames attempted, including failed publishes
    pub sent: usize,
    pub total: usize,
    pub publish_failures: usize,
    /// Archives skipped because they could not be read
    pub archive_failures: usize,
    pub elapsed: Duration,
}

impl ReplayProgress {
    pub fn is_complete(&self) -> bool {
        self.sent >= self.total
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReplayOutcome {
    Completed,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReplaySummary {
    pub progress: ReplayProgress,
    pub outcome: ReplayOutcome,
}

/// Everything one replay run needs, owned by the send loop.
struct ReplaySession {
    link: Box<dyn Link>,
    topic: String,
    frames: Vec<Vec<u8>>,
    delay: Duration,
    progress: ReplayProgress,
    started: Instant,
}

/// Builder for replay runs.
pub struct ReplayEngine {
    transport: Arc<dyn Transport>,
    config: PipelineConfig,
    reader: Arc<dyn ArchiveReader>,
    options: ReplayOptions,
}

impl ReplayEngine {
    pub fn new(transport: Arc<dyn Transport>, config: PipelineConfig) -> Self {
        Self { transport, config, reader: Arc::new(PcapReader), options: ReplayOptions::default() }
    }

    pub fn reader(mut self, reader: Arc<dyn ArchiveReader>) -> Self {
        self.reader = reader;
        self
    }

    pub fn options(mut self, options: ReplayOptions) -> Self {
        self.options = options;
        self
    }

    /// Connect, load the archives in order, and start publishing.
    ///
    /// Fails only if the configuration is invalid or the broker is
    /// unreachable. Unreadable archives are logged, counted in
    /// [`ReplayProgress::archive_failures`] and skipped.
    pub async fn start(&self, archives: Vec<PathBuf>) -> Result<ReplayHandle> {
        self.config.validate()?;
        let topic = self.options.topic.clone().unwrap_or_else(|| self.config.topic.clone());
        if topic.trim().is_empty() || topic.contains(['+', '#']) {
            return Err(V2vError::config(format!("cannot publish to topic '{topic}'")));
        }

        let link = self.transport.connect(&self.config.address, self.config.port).await?;
        info!("Replay connected to {}:{}", self.config.address, self.config.port);

        let loaded = load_all(self.reader.as_ref(), &archives);
        let progress = ReplayProgress {
            total: loaded.frames.len(),
            archive_failures: loaded.failures.len(),
            ..ReplayProgress::default()
        };
        info!(
            "Replaying {} frames from {} archives onto '{}'",
            progress.total,
            archives.len() - progress.archive_failures,
            topic
        );

        let (paused_tx, paused_rx) = watch::channel(false);
        let (progress_tx, progress_rx) = watch::channel(progress);
        let cancel = CancellationToken::new();

        let session = ReplaySession {
            link,
            topic,
            frames: loaded.frames,
            delay: self.options.delay,
            progress,
            started: Instant::now(),
        };
        let task = tokio::spawn(session.run(paused_rx, progress_tx, cancel.clone()));

        Ok(ReplayHandle { paused: paused_tx, progress: progress_rx, cancel, task: Some(task) })
    }
}

impl ReplaySession {
    async fn run(
        mut self,
        mut paused: watch::Receiver<bool>,
        progress_tx: watch::Sender<ReplayProgress>,
        cancel: CancellationToken,
    ) -> ReplaySummary {
        let mut outcome = ReplayOutcome::Completed;
        let frames = std::mem::take(&mut self.frames);

        for (index, frame) in frames.iter().enumerate() {
            if index > 0 && !self.delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        outcome = ReplayOutcome::Stopped;
                        break;
                    }
                    _ = tokio::time::sleep(self.delay) => {}
                }
            }

            if !wait_until_resumed(&mut paused, &cancel).await {
                outcome = ReplayOutcome::Stopped;
                break;
            }

            if let Err(e) = self.link.publish(&self.topic, frame).await {
                self.progress.publish_failures += 1;
                warn!("Publish of frame {} failed: {}", index, e);
            }
            self.progress.sent += 1;
            self.progress.elapsed = self.started.elapsed();
            trace!("Replayed frame {}/{}", self.progress.sent, self.progress.total);
            progress_tx.send_replace(self.progress);
        }

        self.progress.elapsed = self.started.elapsed();
        progress_tx.send_replace(self.progress);

        if let Err(e) = self.link.disconnect().await {
            warn!("Replay disconnect failed: {}", e);
        }
        info!(
            "Replay {:?}: {}/{} frames in {:?} ({} publish failures)",
            outcome,
            self.progress.sent,
            self.progress.total,
            self.progress.elapsed,
            self.progress.publish_failures
        );

        ReplaySummary { progress: self.progress, outcome }
    }
}

/// Block while paused. Returns `false` if the replay was stopped meanwhile.
async fn wait_until_resumed(
    paused: &mut watch::Receiver<bool>,
    cancel: &CancellationToken,
) -> bool {
    if cancel.is_cancelled() {
        return false;
    }
    if !*paused.borrow() {
        return true;
    }
    debug!("Replay paused");
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        resumed = async { paused.wait_for(|paused| !*paused).await.is_ok() } => {
            debug!("Replay resumed");
            resumed
        }
    }
}

/// Control handle for a running replay. Dropping it stops the replay.
pub struct ReplayHandle {
    paused: watch::Sender<bool>,
    progress: watch::Receiver<ReplayProgress>,
    cancel: CancellationToken,
    task: Option<JoinHandle<ReplaySummary>>,
}

impl ReplayHandle {
    /// Hold the next frame until [`resume`](Self::resume).
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Stop after the frame currently being published, if any.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn progress(&self) -> ReplayProgress {
        *self.progress.borrow()
    }

    /// Progress changes, starting with the current value.
    pub fn progress_updates(&self) -> impl Stream<Item = ReplayProgress> + 'static {
        WatchStream::new(self.progress.clone())
    }

    /// Wait for the replay to finish or stop.
    pub async fn wait(mut self) -> Result<ReplaySummary> {
        let task = self.task.take().ok_or_else(|| V2vError::ChannelClosed {
            context: "replay already awaited".to_string(),
        })?;
        task.await
            .map_err(|e| V2vError::ChannelClosed { context: format!("replay task failed: {e}") })
    }
}

impl Drop for ReplayHandle {
    fn drop(&mut self) {
        debug!("Dropping replay handle");
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{track_frames, write_capture};
    use crate::transport::{FrameSink, MemoryBroker};
    use futures::StreamExt;
    use std::path::Path;
    use tokio::sync::mpsc;

    /// Serves fixed frames for any path except those containing "missing".
    struct FixedArchives(Vec<Vec<u8>>);

    impl ArchiveReader for FixedArchives {
        fn read_all(&self, path: &Path) -> Result<Vec<Vec<u8>>> {
            if path.to_string_lossy().contains("missing") {
                return Err(V2vError::archive_error(path, std::io::Error::other("not found")));
            }
            Ok(self.0.clone())
        }
    }

    fn frames(count: u8) -> Vec<Vec<u8>> {
        (0..count).map(|i| vec![i; 70]).collect()
    }

    async fn listener(
        broker: &MemoryBroker,
        topic: &str,
    ) -> (Box<dyn Link>, mpsc::Receiver<crate::types::RawFrame>) {
        let (tx, rx) = mpsc::channel(256);
        let mut link = broker.connect("127.0.0.1", 1883).await.expect("connect");
        link.subscribe(topic, FrameSink::new(tx)).await.expect("subscribe");
        (link, rx)
    }

    fn engine(broker: &MemoryBroker, frames: Vec<Vec<u8>>, delay: Duration) -> ReplayEngine {
        ReplayEngine::new(Arc::new(broker.clone()), PipelineConfig::default())
            .reader(Arc::new(FixedArchives(frames)))
            .options(ReplayOptions { delay, topic: None })
    }

    #[tokio::test(start_paused = true)]
    async fn frames_are_paced_and_published_in_order() {
        let broker = MemoryBroker::new();
        let (_link, mut rx) = listener(&broker, "etsi-its-cam-unsecured").await;

        let started = Instant::now();
        let handle = engine(&broker, frames(5), Duration::from_millis(100))
            .start(vec!["a.pcap".into()])
            .await
            .expect("replay starts");
        let summary = handle.wait().await.expect("replay finishes");

        assert!(started.elapsed() >= Duration::from_millis(400));
        assert_eq!(summary.outcome, ReplayOutcome::Completed);
        assert_eq!(summary.progress.sent, 5);
        assert_eq!(summary.progress.total, 5);
        assert!(summary.progress.is_complete());

        for expected in 0..5u8 {
            let frame = rx.recv().await.expect("frame");
            assert_eq!(frame.payload[0], expected);
        }
        assert_eq!(broker.active_links(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_holds_the_next_frame_until_resume() {
        let broker = MemoryBroker::new();
        let (_link, mut rx) = listener(&broker, "etsi-its-cam-unsecured").await;

        let handle = engine(&broker, frames(4), Duration::from_millis(100))
            .start(vec!["a.pcap".into()])
            .await
            .expect("replay starts");

        assert_eq!(rx.recv().await.expect("frame").payload[0], 0);
        assert_eq!(rx.recv().await.expect("frame").payload[0], 1);
        handle.pause();
        assert!(handle.is_paused());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(handle.progress().sent, 2);
        assert!(rx.try_recv().is_err());

        handle.resume();
        assert_eq!(rx.recv().await.expect("frame").payload[0], 2);
        let summary = handle.wait().await.expect("finishes");
        assert_eq!(summary.progress.sent, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_ends_the_replay_early() {
        let broker = MemoryBroker::new();
        let (_link, mut rx) = listener(&broker, "etsi-its-cam-unsecured").await;

        let handle = engine(&broker, frames(100), Duration::from_secs(1))
            .start(vec!["a.pcap".into()])
            .await
            .expect("replay starts");
        rx.recv().await.expect("first frame");
        handle.stop();

        let summary = handle.wait().await.expect("stops");
        assert_eq!(summary.outcome, ReplayOutcome::Stopped);
        assert!(summary.progress.sent < 100);
        // The replay link is closed once the loop ends
        assert_eq!(broker.active_links(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_while_paused() {
        let broker = MemoryBroker::new();
        let handle = engine(&broker, frames(3), Duration::ZERO)
            .start(vec!["a.pcap".into()])
            .await
            .expect("replay starts");
        handle.pause();
        handle.stop();
        let summary = handle.wait().await.expect("stops");
        assert_eq!(summary.outcome, ReplayOutcome::Stopped);
    }

    #[tokio::test]
    async fn publish_failures_are_counted_and_replay_continues() {
        let broker = MemoryBroker::new();
        broker.fail_publishes(true);

        let handle = engine(&broker, frames(3), Duration::ZERO)
            .start(vec!["a.pcap".into()])
            .await
            .expect("replay starts");
        let summary = handle.wait().await.expect("finishes");

        assert_eq!(summary.progress.sent, 3);
        assert_eq!(summary.progress.publish_failures, 3);
        assert_eq!(summary.outcome, ReplayOutcome::Completed);
    }

    #[tokio::test]
    async fn unreadable_archives_are_skipped() {
        let broker = MemoryBroker::new();
        let handle = engine(&broker, frames(2), Duration::ZERO)
            .start(vec!["a.pcap".into(), "missing.pcap".into(), "b.pcap".into()])
            .await
            .expect("replay starts");
        let summary = handle.wait().await.expect("finishes");

        assert_eq!(summary.progress.total, 4);
        assert_eq!(summary.progress.sent, 4);
        assert_eq!(summary.progress.archive_failures, 1);
    }

    #[tokio::test]
    async fn unreachable_broker_fails_before_loading() {
        let broker = MemoryBroker::new();
        broker.refuse_connections(true);
        let result = engine(&broker, frames(2), Duration::ZERO).start(vec!["a.pcap".into()]).await;
        assert!(matches!(result, Err(V2vError::Connection { .. })));
    }

    #[tokio::test]
    async fn empty_replay_completes_immediately() {
        let broker = MemoryBroker::new();
        let handle = engine(&broker, Vec::new(), Duration::from_secs(60))
            .start(Vec::new())
            .await
            .expect("replay starts");
        let summary = handle.wait().await.expect("finishes");
        let expected = ReplayProgress { elapsed: summary.progress.elapsed, ..Default::default() };
        assert_eq!(summary.progress, expected);
        assert!(summary.progress.elapsed < Duration::from_secs(60));
    }

    #[tokio::test]
    async fn progress_updates_are_observable() {
        let broker = MemoryBroker::new();
        let handle = engine(&broker, frames(3), Duration::ZERO)
            .start(vec!["a.pcap".into()])
            .await
            .expect("replay starts");
        let updates = handle.progress_updates();
        handle.wait().await.expect("finishes");

        let last = updates.collect::<Vec<_>>().await.pop().expect("at least one update");
        assert_eq!(last.sent, 3);
    }

    #[tokio::test]
    async fn replays_real_capture_files() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("track.pcap");
        write_capture(&path, &track_frames([7; 8], 6)).expect("write");

        let broker = MemoryBroker::new();
        let (_link, mut rx) = listener(&broker, "v2v").await;
        let config = PipelineConfig::new("127.0.0.1", 1883, "v2v").expect("valid");
        let handle = ReplayEngine::new(Arc::new(broker.clone()), config)
            .options(ReplayOptions { delay: Duration::ZERO, topic: None })
            .start(vec![path])
            .await
            .expect("replay starts");
        assert_eq!(handle.wait().await.expect("finishes").progress.sent, 6);

        let first = rx.recv().await.expect("frame");
        assert_eq!(&*first.topic, "v2v");
        assert_eq!(first.payload.len(), 68);
    }
}
