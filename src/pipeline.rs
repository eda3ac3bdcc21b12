//! Per-frame ingestion: filter, decode, record, fan out
//!
//! [`IngestPipeline::process`] is synchronous and handles one frame at a
//! time, so events for the same vehicle leave in the order their frames
//! arrived. A bad frame is counted and dropped; it never stops the pipeline.

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufWriter;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{debug, trace, warn};

use crate::archive::PcapWriter;
use crate::decoder::{DecodeFailureReason, Decoder, FrameLayout};
use crate::registry::{RetentionPolicy, TrackRegistry};
use crate::types::{FanoutEvent, RawFrame};
use crate::Result;

/// Largest untagged Ethernet frame (1500 byte MTU plus 14 byte header).
pub const DEFAULT_MAX_FRAME_LEN: usize = 1514;

/// Tuning for the ingestion side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestOptions {
    pub layout: FrameLayout,
    pub retention: RetentionPolicy,
    /// Frames longer than this are discarded before decode
    pub max_frame_len: usize,
    /// Events buffered per observer before a slow observer starts skipping
    pub event_capacity: usize,
    /// Frames buffered between the transport and the ingestion worker
    pub frame_queue: usize,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            layout: FrameLayout::default(),
            retention: RetentionPolicy::default(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            event_capacity: 1024,
            frame_queue: 1024,
        }
    }
}

/// Live counters, shared with whoever displays them.
#[derive(Debug, Default)]
pub struct PipelineStats {
    received: AtomicU64,
    emitted: AtomicU64,
    filtered: AtomicU64,
    stale: AtomicU64,
    too_short: AtomicU64,
    unrecognized_format: AtomicU64,
    field_out_of_range: AtomicU64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        let too_short = self.too_short.load(Ordering::Relaxed);
        let unrecognized_format = self.unrecognized_format.load(Ordering::Relaxed);
        let field_out_of_range = self.field_out_of_range.load(Ordering::Relaxed);
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            emitted: self.emitted.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            decode_failures: too_short + unrecognized_format + field_out_of_range,
            too_short,
            unrecognized_format,
            field_out_of_range,
        }
    }

    fn decode_failed(&self, reason: DecodeFailureReason) {
        let counter = match reason {
            DecodeFailureReason::TooShort => &self.too_short,
            DecodeFailureReason::UnrecognizedFormat => &self.unrecognized_format,
            DecodeFailureReason::FieldOutOfRange => &self.field_out_of_range,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Frames handed to the pipeline, stale ones excluded
    pub received: u64,
    pub emitted: u64,
    /// Empty or oversized frames discarded before decode
    pub filtered: u64,
    /// Frames from a connection that was already replaced
    pub stale: u64,
    pub decode_failures: u64,
    pub too_short: u64,
    pub unrecognized_format: u64,
    pub field_out_of_range: u64,
}

/// Decode-and-track pipeline for one channel subscription.
pub struct IngestPipeline {
    decoder: Decoder,
    registry: TrackRegistry,
    events: broadcast::Sender<FanoutEvent>,
    stats: Arc<PipelineStats>,
    max_frame_len: usize,
    recorder: Option<PcapWriter<BufWriter<File>>>,
}

impl IngestPipeline {
    pub fn new(options: IngestOptions) -> Self {
        let (events, _) = broadcast::channel(options.event_capacity.max(1));
        Self {
            decoder: Decoder::new(options.layout),
            registry: TrackRegistry::with_retention(options.retention),
            events,
            stats: Arc::new(PipelineStats::default()),
            max_frame_len: options.max_frame_len,
            recorder: None,
        }
    }

    /// Archive every received frame to a pcap file, before filtering.
    pub fn record_raw(&mut self, writer: PcapWriter<BufWriter<File>>) {
        self.recorder = Some(writer);
    }

    /// Flush and close the raw archive, if any.
    pub fn finish_recording(&mut self) -> Result<()> {
        match self.recorder.take() {
            Some(writer) => writer.finish(),
            None => Ok(()),
        }
    }

    /// Process one frame. Returns the event that was broadcast, if any.
    pub fn process(&mut self, frame: &RawFrame) -> Option<FanoutEvent> {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        self.archive(frame);

        // Only sizes no frame can have are filtered here. Every other length,
        // including ones matching no layout, reaches the decoder so the drop
        // is counted under its failure reason.
        if frame.is_empty() || frame.len() > self.max_frame_len {
            self.stats.filtered.fetch_add(1, Ordering::Relaxed);
            trace!(
                length = frame.len(),
                topic = %frame.topic,
                "Discarding frame outside size limits"
            );
            return None;
        }

        let report = match self.decoder.decode(&frame.payload) {
            Ok(report) => report,
            Err(failure) => {
                self.stats.decode_failed(failure.reason);
                debug!(topic = %frame.topic, "Dropping undecodable frame: {}", failure);
                return None;
            }
        };

        let received_at_ms = frame.received_at_ms();
        let timestamp_ms = report.device_timestamp_ms.unwrap_or(received_at_ms);
        let update = self.registry.record(&report, timestamp_ms);

        trace!(
            vehicle = %update.vehicle_id,
            elapsed_ms = update.elapsed_ms,
            track_len = update.track_len,
            "Recorded report"
        );

        let event = FanoutEvent::from_report(
            report,
            update.elapsed_ms,
            update.track_len,
            &frame.topic,
            received_at_ms,
        );
        // No observers is not an error
        let _ = self.events.send(event.clone());
        self.stats.emitted.fetch_add(1, Ordering::Relaxed);
        Some(event)
    }

    /// Count a frame rejected because its connection was replaced.
    pub fn note_stale(&self, frame: &RawFrame) {
        self.stats.stale.fetch_add(1, Ordering::Relaxed);
        trace!(generation = frame.generation, "Dropping frame from a replaced connection");
    }

    fn archive(&mut self, frame: &RawFrame) {
        let Some(writer) = self.recorder.as_mut() else {
            return;
        };
        if let Err(e) = writer.write_frame_at(&frame.payload, frame.received_at) {
            warn!("Raw frame archiving stopped: {}", e);
            self.recorder = None;
        }
    }

    /// Live fan-out stream for a new observer.
    pub fn subscribe(&self) -> impl Stream<Item = FanoutEvent> + 'static {
        event_stream(self.events.subscribe())
    }

    pub fn event_sender(&self) -> broadcast::Sender<FanoutEvent> {
        self.events.clone()
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    pub fn registry(&self) -> &TrackRegistry {
        &self.registry
    }

    pub fn decoder(&self) -> Decoder {
        self.decoder
    }
}

/// Adapt a broadcast receiver into an event stream. Observers that fall
/// behind skip the events they missed.
pub(crate) fn event_stream(
    receiver: broadcast::Receiver<FanoutEvent>,
) -> impl Stream<Item = FanoutEvent> + 'static {
    BroadcastStream::new(receiver).filter_map(|result| async move {
        match result {
            Ok(event) => Some(event),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!("Observer lagged, skipped {} events", skipped);
                None
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FrameBuilder, text_frame, track_frames};
    use crate::types::VehicleId;

    fn frame(payload: Vec<u8>) -> RawFrame {
        RawFrame::new(payload, "v2v", 1)
    }

    #[test]
    fn decoded_frames_are_recorded_and_emitted() {
        let mut pipeline = IngestPipeline::new(IngestOptions::default());
        let mut events = pipeline.events.subscribe();

        let frames = track_frames([0xAA, 0xBB, 0xCC, 0xDD, 0, 0, 0, 1], 3);
        let emitted: Vec<_> =
            frames.into_iter().filter_map(|f| pipeline.process(&frame(f))).collect();

        assert_eq!(emitted.len(), 3);
        assert_eq!(emitted.iter().map(|e| e.elapsed_ms).collect::<Vec<_>>(), vec![0, 100, 200]);
        assert_eq!(emitted[2].track_len, 3);
        assert_eq!(emitted[2].topic, "v2v");

        for expected in &emitted {
            assert_eq!(events.try_recv().ok().as_ref(), Some(expected));
        }

        let track = pipeline
            .registry()
            .track(&VehicleId::from("aabbccdd00000001"))
            .expect("vehicle tracked");
        assert_eq!(track.positions.len(), 3);
        assert_eq!(pipeline.stats().snapshot().emitted, 3);
    }

    #[test]
    fn malformed_frames_are_counted_and_do_not_stop_processing() {
        let mut pipeline = IngestPipeline::new(IngestOptions::default());

        assert!(pipeline.process(&frame(vec![0xFF; 40])).is_none());
        let status = b"Status: nominal, no position available from this station, check back later";
        assert!(pipeline.process(&frame(status.to_vec())).is_none());
        assert!(pipeline.process(&frame(FrameBuilder::new().build())).is_some());

        let stats = pipeline.stats().snapshot();
        assert_eq!(stats.received, 3);
        assert_eq!(stats.too_short, 1);
        assert_eq!(stats.unrecognized_format, 1);
        assert_eq!(stats.decode_failures, 2);
        assert_eq!(stats.emitted, 1);
    }

    #[test]
    fn size_filter_runs_before_decode() {
        let options = IngestOptions { max_frame_len: 100, ..IngestOptions::default() };
        let mut pipeline = IngestPipeline::new(options);

        assert!(pipeline.process(&frame(Vec::new())).is_none());
        let mut oversized = FrameBuilder::new().build();
        oversized.resize(101, 0);
        assert!(pipeline.process(&frame(oversized)).is_none());

        let stats = pipeline.stats().snapshot();
        assert_eq!(stats.filtered, 2);
        assert_eq!(stats.decode_failures, 0);
    }

    #[test]
    fn lengths_matching_no_layout_reach_the_decoder() {
        let mut pipeline = IngestPipeline::new(IngestOptions::default());

        let mut padded = FrameBuilder::new().timestamp(5).build();
        padded.resize(95, 0);
        assert!(pipeline.process(&frame(padded)).is_some());
        assert!(pipeline.process(&frame(vec![0xFF; 67])).is_none());

        let stats = pipeline.stats().snapshot();
        assert_eq!(stats.filtered, 0);
        assert_eq!(stats.too_short, 1);
        assert_eq!(stats.emitted, 1);
    }

    #[test]
    fn text_frames_without_timestamp_use_receipt_time() {
        let mut pipeline = IngestPipeline::new(IngestOptions::default());
        let raw = frame(text_frame("AABBCCDD", None, 48.8566, 2.3522));
        let received_at_ms = raw.received_at_ms();

        let event = pipeline.process(&raw).expect("text frame decodes");
        assert_eq!(event.device_timestamp_ms, None);
        assert_eq!(event.elapsed_ms, 0);

        let track = pipeline.registry().track(&VehicleId::from("AABBCCDD")).expect("tracked");
        assert_eq!(track.first_seen_device_timestamp_ms, received_at_ms);
    }

    #[test]
    fn raw_frames_are_archived_when_recording() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("raw.pcap");
        let mut pipeline = IngestPipeline::new(IngestOptions::default());
        pipeline.record_raw(PcapWriter::create(&path).expect("create"));

        pipeline.process(&frame(FrameBuilder::new().timestamp(5).build()));
        pipeline.process(&frame(vec![1, 2, 3]));
        pipeline.finish_recording().expect("flush");

        use crate::archive::{ArchiveReader, PcapReader};
        let frames = PcapReader.read_all(&path).expect("readable");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1], vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn observers_receive_events_as_a_stream() {
        let mut pipeline = IngestPipeline::new(IngestOptions::default());
        let stream = pipeline.subscribe();

        pipeline.process(&frame(FrameBuilder::new().vehicle_hex([1; 8]).build()));
        pipeline.process(&frame(FrameBuilder::new().vehicle_hex([2; 8]).build()));
        drop(pipeline);

        let received: Vec<_> = stream.collect().await;
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].vehicle_id.as_str(), "0101010101010101");
        assert_eq!(received[1].vehicle_id.as_str(), "0202020202020202");
    }
}
