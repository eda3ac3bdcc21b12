//! Per-vehicle trajectory tracking
//!
//! The registry keeps one [`VehicleTrack`] per vehicle id: the positions in
//! arrival order plus the device timestamp of the first report, which is the
//! baseline for every later `elapsed_ms`. Nothing is ever removed. Position
//! history is unbounded unless a [`RetentionPolicy`] caps it.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

use crate::types::{DecodedReport, Position, VehicleId};

/// How many positions to keep per vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RetentionPolicy {
    #[default]
    Unbounded,
    /// Keep the most recent `n` positions (at least one is always kept)
    Capped(usize),
}

/// Trajectory and timing baseline of one vehicle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VehicleTrack {
    pub vehicle_id: VehicleId,
    /// Positions in arrival order, oldest first
    pub positions: VecDeque<Position>,
    pub first_seen_device_timestamp_ms: u64,
    /// Reports recorded, including positions since trimmed
    pub report_count: u64,
}

impl VehicleTrack {
    fn new(vehicle_id: VehicleId, baseline_ms: u64) -> Self {
        Self {
            vehicle_id,
            positions: VecDeque::new(),
            first_seen_device_timestamp_ms: baseline_ms,
            report_count: 0,
        }
    }

    pub fn latest(&self) -> Option<Position> {
        self.positions.back().copied()
    }
}

/// Snapshot returned by [`TrackRegistry::record`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackUpdate {
    pub vehicle_id: VehicleId,
    pub latest: Position,
    /// `timestamp - baseline`; negative when a clock wraps or reports arrive out of order
    pub elapsed_ms: i64,
    pub baseline_ms: u64,
    /// Positions currently held for the vehicle
    pub track_len: usize,
    pub first_report: bool,
}

/// Registry of all vehicles seen so far.
#[derive(Debug, Default)]
pub struct TrackRegistry {
    tracks: HashMap<VehicleId, VehicleTrack>,
    retention: RetentionPolicy,
}

impl TrackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: RetentionPolicy) -> Self {
        Self { tracks: HashMap::new(), retention }
    }

    pub fn retention(&self) -> RetentionPolicy {
        self.retention
    }

    /// Record a report.
    ///
    /// `timestamp_ms` is the report's device timestamp, or a wall-clock
    /// substitute chosen by the caller when the report carries none. The
    /// registry never invents one.
    pub fn record(&mut self, report: &DecodedReport, timestamp_ms: u64) -> TrackUpdate {
        let retention = self.retention;
        let mut first_report = false;
        let track = self.tracks.entry(report.vehicle_id.clone()).or_insert_with(|| {
            first_report = true;
            VehicleTrack::new(report.vehicle_id.clone(), timestamp_ms)
        });

        let position = report.position();
        track.positions.push_back(position);
        track.report_count += 1;
        if let RetentionPolicy::Capped(limit) = retention {
            while track.positions.len() > limit.max(1) {
                track.positions.pop_front();
            }
        }

        let baseline_ms = track.first_seen_device_timestamp_ms;
        TrackUpdate {
            vehicle_id: track.vehicle_id.clone(),
            latest: position,
            elapsed_ms: elapsed_between(baseline_ms, timestamp_ms),
            baseline_ms,
            track_len: track.positions.len(),
            first_report,
        }
    }

    pub fn track(&self, vehicle_id: &VehicleId) -> Option<&VehicleTrack> {
        self.tracks.get(vehicle_id)
    }

    /// Vehicle ids in no particular order.
    pub fn vehicles(&self) -> impl Iterator<Item = &VehicleId> {
        self.tracks.keys()
    }

    pub fn tracks(&self) -> impl Iterator<Item = &VehicleTrack> {
        self.tracks.values()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

fn elapsed_between(baseline_ms: u64, timestamp_ms: u64) -> i64 {
    let delta = i128::from(timestamp_ms) - i128::from(baseline_ms);
    i64::try_from(delta).unwrap_or(if delta < 0 { i64::MIN } else { i64::MAX })
}
