//! Fixed-offset binary layouts
//!
//! A report frame is an Ethernet header followed by the GeoNetworking basic
//! and common headers, the source position vector and the CAM fields:
//!
//! ```text
//! | Ethernet (14) | GN headers | source position (id ...) | ts | lat | lon | spd | hdg |
//! ```
//!
//! Captures in the field come in more than one revision of this layout. Each
//! revision is a [`FrameLayout`] variant and is selected explicitly; the
//! decoder never guesses between them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::DecodeFailure;
use crate::types::{DecodedReport, VehicleId};

/// How the vehicle identifier is encoded in the source position block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdEncoding {
    /// Raw address bytes, rendered as lowercase hex
    Hex { width: usize },
    /// Big-endian u32 station id
    Numeric,
}

/// Byte offsets of every field, relative to the start of the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldOffsets {
    pub vehicle_id: usize,
    pub id_encoding: IdEncoding,
    pub timestamp: usize,
    pub latitude: usize,
    pub longitude: usize,
    pub speed: usize,
    pub heading: usize,
}

const GEONET_OFFSETS: FieldOffsets = FieldOffsets {
    vehicle_id: 26,
    id_encoding: IdEncoding::Hex { width: 8 },
    timestamp: 52,
    latitude: 56,
    longitude: 60,
    speed: 64,
    heading: 66,
};

// Older revision: 4-byte station id, every CAM field six bytes earlier
const COMPACT_OFFSETS: FieldOffsets = FieldOffsets {
    vehicle_id: 26,
    id_encoding: IdEncoding::Numeric,
    timestamp: 46,
    latitude: 50,
    longitude: 54,
    speed: 58,
    heading: 60,
};

/// Ethernet type of GeoNetworking, at the same offset in every layout.
pub const ETHERTYPE_GEONET: u16 = 0x8947;
pub const ETHERTYPE_OFFSET: usize = 12;

/// Fixed-point divisors. Part of the wire contract.
pub const COORDINATE_SCALE: f64 = 1e7;
pub const SPEED_SCALE: f64 = 100.0;
pub const HEADING_SCALE: f64 = 10.0;

/// A versioned binary frame layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameLayout {
    /// 8-byte GeoNetworking address as id, timestamp at offset 52
    #[default]
    GeoNet,
    /// 4-byte integer station id, timestamp at offset 46
    Compact,
}

impl FrameLayout {
    pub const ALL: [FrameLayout; 2] = [FrameLayout::GeoNet, FrameLayout::Compact];

    pub const fn offsets(self) -> FieldOffsets {
        match self {
            FrameLayout::GeoNet => GEONET_OFFSETS,
            FrameLayout::Compact => COMPACT_OFFSETS,
        }
    }

    /// Smallest frame that still contains the heading field.
    pub const fn min_len(self) -> usize {
        self.offsets().heading + 2
    }

    /// Whether the frame carries the GeoNetworking ethertype.
    pub fn has_ethertype(raw: &[u8]) -> bool {
        raw.get(ETHERTYPE_OFFSET..ETHERTYPE_OFFSET + 2) == Some(&ETHERTYPE_GEONET.to_be_bytes()[..])
    }

    pub const fn name(self) -> &'static str {
        match self {
            FrameLayout::GeoNet => "geonet",
            FrameLayout::Compact => "compact",
        }
    }

    /// Decode a binary frame. The caller has already checked the length,
    /// but every read is still bounds-checked.
    pub(super) fn decode_binary(self, raw: &[u8]) -> Result<DecodedReport, DecodeFailure> {
        let offsets = self.offsets();

        let vehicle_id = match offsets.id_encoding {
            IdEncoding::Hex { width } => {
                VehicleId::from_hex_bytes(field(raw, offsets.vehicle_id, width)?)
            }
            IdEncoding::Numeric => VehicleId::from_numeric(read_u32_be(raw, offsets.vehicle_id)?),
        };
        let timestamp = read_u32_be(raw, offsets.timestamp)?;
        let latitude = read_i32_be(raw, offsets.latitude)?;
        let longitude = read_i32_be(raw, offsets.longitude)?;
        let speed = read_u16_be(raw, offsets.speed)?;
        let heading = read_u16_be(raw, offsets.heading)?;

        Ok(DecodedReport {
            vehicle_id,
            device_timestamp_ms: Some(u64::from(timestamp)),
            latitude: f64::from(latitude) / COORDINATE_SCALE,
            longitude: f64::from(longitude) / COORDINATE_SCALE,
            speed_mps: f64::from(speed) / SPEED_SCALE,
            heading_deg: f64::from(heading) / HEADING_SCALE,
        })
    }
}

impl fmt::Display for FrameLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FrameLayout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "geonet" => Ok(FrameLayout::GeoNet),
            "compact" => Ok(FrameLayout::Compact),
            other => Err(format!("unknown frame layout '{other}' (expected geonet or compact)")),
        }
    }
}

fn field(raw: &[u8], offset: usize, width: usize) -> Result<&[u8], DecodeFailure> {
    offset
        .checked_add(width)
        .and_then(|end| raw.get(offset..end))
        .ok_or_else(|| DecodeFailure::too_short(raw.len()))
}

fn read_u16_be(raw: &[u8], offset: usize) -> Result<u16, DecodeFailure> {
    let bytes = field(raw, offset, 2)?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn read_u32_be(raw: &[u8], offset: usize) -> Result<u32, DecodeFailure> {
    let bytes = field(raw, offset, 4)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_i32_be(raw: &[u8], offset: usize) -> Result<i32, DecodeFailure> {
    let bytes = field(raw, offset, 4)?;
    Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}
