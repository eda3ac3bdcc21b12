//! Decoded vehicle reports

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable vehicle identifier.
///
/// Opaque token: lowercase hex for the GeoNetworking layout, a decimal
/// integer for the compact layout, or whatever the text form carried.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VehicleId(String);

impl VehicleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Render raw address bytes as lowercase hex.
    pub fn from_hex_bytes(bytes: &[u8]) -> Self {
        let mut id = String::with_capacity(bytes.len() * 2);
        for byte in bytes {
            id.push(char::from_digit(u32::from(byte >> 4), 16).unwrap_or('0'));
            id.push(char::from_digit(u32::from(byte & 0x0f), 16).unwrap_or('0'));
        }
        Self(id)
    }

    pub fn from_numeric(id: u32) -> Self {
        Self(id.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VehicleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VehicleId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// A latitude/longitude pair in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
}

impl Position {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }
}

/// A fully decoded cooperative-awareness report.
///
/// Either every positional and kinematic field is populated or the frame
/// fails to decode. Only the device timestamp may be absent, and only for
/// text frames that do not carry one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedReport {
    pub vehicle_id: VehicleId,

    /// Device counter in milliseconds (not wall-clock)
    pub device_timestamp_ms: Option<u64>,

    /// Degrees, `raw / 1e7`
    pub latitude: f64,

    /// Degrees, `raw / 1e7`
    pub longitude: f64,

    /// Metres per second, `raw / 100`
    pub speed_mps: f64,

    /// Degrees, `raw / 10`
    pub heading_deg: f64,
}

impl DecodedReport {
    pub fn position(&self) -> Position {
        Position::new(self.latitude, self.longitude)
    }
}

/// Human-readable summary, one `label: value` per line.
///
/// The text decoding path accepts this form, so a summary republished on
/// the channel decodes back to the same report.
impl fmt::Display for DecodedReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Vehicle ID: {}", self.vehicle_id)?;
        if let Some(timestamp) = self.device_timestamp_ms {
            writeln!(f, "Timestamp: {} ms", timestamp)?;
        }
        writeln!(f, "Latitude: {}", self.latitude)?;
        writeln!(f, "Longitude: {}", self.longitude)?;
        writeln!(f, "Speed: {} m/s", self.speed_mps)?;
        write!(f, "Heading: {}°", self.heading_deg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_ids_are_lowercase() {
        let id = VehicleId::from_hex_bytes(&[0xAA, 0xBB, 0x0C, 0x01]);
        assert_eq!(id.as_str(), "aabb0c01");
    }

    #[test]
    fn summary_omits_missing_timestamp() {
        let report = DecodedReport {
            vehicle_id: VehicleId::from("AABBCCDD"),
            device_timestamp_ms: None,
            latitude: 48.8566,
            longitude: 2.3522,
            speed_mps: 15.0,
            heading_deg: 90.0,
        };

        let summary = report.to_string();
        assert!(summary.starts_with("Vehicle ID: AABBCCDD\n"));
        assert!(!summary.contains("Timestamp"));
        assert!(summary.contains("Latitude: 48.8566"));
        assert!(summary.ends_with("Heading: 90°"));
    }
}
