//! Raw frames as received from the channel

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Raw link-layer frame received from the pub/sub channel.
///
/// Frames are immutable once received. The payload is shared (zero-copy via
/// `Arc`) so the pipeline and an optional raw-archive recorder can both hold
/// it without copying.
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Frame bytes exactly as published
    pub payload: Arc<[u8]>,

    /// Topic the frame arrived on
    pub topic: Arc<str>,

    /// Wall-clock receipt time
    pub received_at: SystemTime,

    /// Connection generation that delivered the frame
    pub generation: u64,
}

impl RawFrame {
    /// Create a frame stamped with the current wall-clock time.
    pub fn new(payload: impl Into<Arc<[u8]>>, topic: impl Into<Arc<str>>, generation: u64) -> Self {
        Self {
            payload: payload.into(),
            topic: topic.into(),
            received_at: SystemTime::now(),
            generation,
        }
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Receipt time in milliseconds since the Unix epoch.
    pub fn received_at_ms(&self) -> u64 {
        unix_millis(self.received_at)
    }
}

/// Milliseconds since the Unix epoch, saturating at zero for pre-epoch clocks.
pub fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
