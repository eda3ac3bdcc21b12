//! Fan-out events broadcast to live observers

use serde::{Deserialize, Serialize};

use super::{DecodedReport, VehicleId};

/// Event emitted for every successfully decoded and recorded frame.
///
/// This is the sole input of the dashboard and map collaborators, so it is
/// self-contained and serializable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanoutEvent {
    pub vehicle_id: VehicleId,
    pub latitude: f64,
    pub longitude: f64,
    /// Metres per second
    pub speed: f64,
    /// Degrees
    pub heading: f64,
    /// Device timestamp as reported, `None` for text frames without one
    pub device_timestamp_ms: Option<u64>,
    /// Milliseconds since this vehicle's first report, may be negative
    pub elapsed_ms: i64,
    /// Number of positions currently held for the vehicle
    pub track_len: usize,
    pub topic: String,
    /// Wall-clock receipt time, milliseconds since the Unix epoch
    pub received_at_ms: u64,
}

impl FanoutEvent {
    pub fn from_report(
        report: DecodedReport,
        elapsed_ms: i64,
        track_len: usize,
        topic: &str,
        received_at_ms: u64,
    ) -> Self {
        Self {
            vehicle_id: report.vehicle_id,
            latitude: report.latitude,
            longitude: report.longitude,
            speed: report.speed_mps,
            heading: report.heading_deg,
            device_timestamp_ms: report.device_timestamp_ms,
            elapsed_ms,
            track_len,
            topic: topic.to_string(),
            received_at_ms,
        }
    }
}
