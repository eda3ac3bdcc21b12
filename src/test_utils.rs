//! Test utilities for building synthetic frames and capture files
//!
//! Shared by unit tests and the benches so every test speaks the same wire
//! layout as the decoder.

#![cfg(any(test, feature = "benchmark"))]

use std::path::Path;

use crate::archive::PcapWriter;
use crate::decoder::{ETHERTYPE_GEONET, ETHERTYPE_OFFSET, FrameLayout, IdEncoding};
use crate::{DecodedReport, Result, VehicleId};

const BROADCAST_MAC: [u8; 6] = [0xff; 6];
const SOURCE_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];
// Basic header (4) + common header (8) as a single-hop broadcast
const GEONET_HEADERS: [u8; 12] =
    [0x11, 0x00, 0x1a, 0x01, 0x20, 0x50, 0x02, 0x00, 0x00, 0x20, 0x01, 0x00];

/// Builder for binary report frames in either layout.
#[derive(Debug, Clone)]
pub struct FrameBuilder {
    layout: FrameLayout,
    vehicle: Vec<u8>,
    timestamp: u32,
    latitude: i32,
    longitude: i32,
    speed: u16,
    heading: u16,
}

impl Default for FrameBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBuilder {
    /// Canonical GeoNetworking layout with an all-zero payload.
    pub fn new() -> Self {
        Self::with_layout(FrameLayout::GeoNet)
    }

    /// Compact layout (4-byte station id).
    pub fn compact() -> Self {
        Self::with_layout(FrameLayout::Compact)
    }

    pub fn with_layout(layout: FrameLayout) -> Self {
        let vehicle = match layout.offsets().id_encoding {
            IdEncoding::Hex { width } => vec![0; width],
            IdEncoding::Numeric => vec![0; 4],
        };
        Self { layout, vehicle, timestamp: 0, latitude: 0, longitude: 0, speed: 0, heading: 0 }
    }

    pub fn vehicle_hex(mut self, id: [u8; 8]) -> Self {
        self.vehicle = id.to_vec();
        self
    }

    pub fn vehicle_numeric(mut self, id: u32) -> Self {
        self.vehicle = id.to_be_bytes().to_vec();
        self
    }

    pub fn timestamp(mut self, timestamp: u32) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn latitude(mut self, raw: i32) -> Self {
        self.latitude = raw;
        self
    }

    pub fn longitude(mut self, raw: i32) -> Self {
        self.longitude = raw;
        self
    }

    pub fn speed(mut self, raw: u16) -> Self {
        self.speed = raw;
        self
    }

    pub fn heading(mut self, raw: u16) -> Self {
        self.heading = raw;
        self
    }

    /// Build a frame of exactly the layout's minimum length.
    pub fn build(&self) -> Vec<u8> {
        let offsets = self.layout.offsets();
        let mut frame = vec![0u8; self.layout.min_len()];

        frame[0..6].copy_from_slice(&BROADCAST_MAC);
        frame[6..12].copy_from_slice(&SOURCE_MAC);
        frame[ETHERTYPE_OFFSET..ETHERTYPE_OFFSET + 2]
            .copy_from_slice(&ETHERTYPE_GEONET.to_be_bytes());
        frame[14..26].copy_from_slice(&GEONET_HEADERS);

        let id_end = offsets.vehicle_id + self.vehicle.len();
        frame[offsets.vehicle_id..id_end].copy_from_slice(&self.vehicle);
        frame[offsets.timestamp..offsets.timestamp + 4]
            .copy_from_slice(&self.timestamp.to_be_bytes());
        frame[offsets.latitude..offsets.latitude + 4].copy_from_slice(&self.latitude.to_be_bytes());
        frame[offsets.longitude..offsets.longitude + 4]
            .copy_from_slice(&self.longitude.to_be_bytes());
        frame[offsets.speed..offsets.speed + 2].copy_from_slice(&self.speed.to_be_bytes());
        frame[offsets.heading..offsets.heading + 2].copy_from_slice(&self.heading.to_be_bytes());
        frame
    }
}

/// A key/value text frame as published by summary-only producers.
pub fn text_frame(
    vehicle_id: &str,
    timestamp: Option<u64>,
    latitude: f64,
    longitude: f64,
) -> Vec<u8> {
    DecodedReport {
        vehicle_id: VehicleId::from(vehicle_id),
        device_timestamp_ms: timestamp,
        latitude,
        longitude,
        speed_mps: 13.5,
        heading_deg: 270.0,
    }
    .to_string()
    .into_bytes()
}

/// A small track for one vehicle: `count` frames 100 ms apart heading north.
pub fn track_frames(id: [u8; 8], count: u32) -> Vec<Vec<u8>> {
    (0..count)
        .map(|i| {
            FrameBuilder::new()
                .vehicle_hex(id)
                .timestamp(1000 + i * 100)
                .latitude(488_566_000 + i as i32 * 100)
                .longitude(23_522_000)
                .speed(1500)
                .heading(0)
                .build()
        })
        .collect()
}

/// Write frames to a classic pcap file.
pub fn write_capture(path: &Path, frames: &[Vec<u8>]) -> Result<()> {
    let mut writer = PcapWriter::create(path)?;
    for frame in frames {
        writer.write_frame(frame)?;
    }
    writer.finish()
}
