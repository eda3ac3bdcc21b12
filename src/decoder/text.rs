//! Key/value text fallback
//!
//! Some producers publish the human-readable summary instead of the raw
//! frame. Lines (or `;`/`,` separated segments) of the form `label: value` or
//! `label=value` are scanned for the same five fields the binary layout
//! carries. Units after the first token (`ms`, `m/s`, `°`) are ignored.

use super::DecodeFailure;
use crate::types::{DecodedReport, VehicleId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    VehicleId,
    Timestamp,
    Latitude,
    Longitude,
    Speed,
    Heading,
}

impl Field {
    fn from_label(label: &str) -> Option<Self> {
        let label = label.trim().to_ascii_lowercase().replace([' ', '-'], "_");
        match label.as_str() {
            "vehicle_id" | "vehicle_gn_addr" | "gn_addr" | "station_id" | "id" => {
                Some(Field::VehicleId)
            }
            "timestamp" | "timestamp_ms" | "device_timestamp_ms" => Some(Field::Timestamp),
            "latitude" | "lat" => Some(Field::Latitude),
            "longitude" | "lon" | "lng" => Some(Field::Longitude),
            "speed" | "speed_mps" => Some(Field::Speed),
            "heading" | "heading_deg" => Some(Field::Heading),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Field::VehicleId => "vehicle_id",
            Field::Timestamp => "timestamp",
            Field::Latitude => "latitude",
            Field::Longitude => "longitude",
            Field::Speed => "speed",
            Field::Heading => "heading",
        }
    }
}

#[derive(Default)]
struct Fields<'a> {
    vehicle_id: Option<&'a str>,
    timestamp: Option<&'a str>,
    latitude: Option<&'a str>,
    longitude: Option<&'a str>,
    speed: Option<&'a str>,
    heading: Option<&'a str>,
}

impl<'a> Fields<'a> {
    fn slot(&mut self, field: Field) -> &mut Option<&'a str> {
        match field {
            Field::VehicleId => &mut self.vehicle_id,
            Field::Timestamp => &mut self.timestamp,
            Field::Latitude => &mut self.latitude,
            Field::Longitude => &mut self.longitude,
            Field::Speed => &mut self.speed,
            Field::Heading => &mut self.heading,
        }
    }

    fn scan(text: &'a str) -> Self {
        let mut fields = Fields::default();
        for segment in text.split(['\n', ';', ',']) {
            let Some((label, value)) = segment.split_once([':', '=']) else {
                continue;
            };
            let Some(field) = Field::from_label(label) else {
                continue;
            };
            let Some(token) = value.split_whitespace().next() else {
                continue;
            };
            // First occurrence wins
            let slot = fields.slot(field);
            if slot.is_none() {
                *slot = Some(token.trim_end_matches('°'));
            }
        }
        fields
    }
}

pub(super) fn decode_text(raw: &[u8]) -> Result<DecodedReport, DecodeFailure> {
    let text = std::str::from_utf8(raw)
        .map_err(|e| DecodeFailure::unrecognized(raw.len(), None).at(e.valid_up_to()))?;
    let fields = Fields::scan(text);
    let length = raw.len();

    let vehicle_id = require(fields.vehicle_id, Field::VehicleId, length)?;
    let number = |value: Option<&str>, field: Field| -> Result<f64, DecodeFailure> {
        parse_number(require(value, field, length)?, field, length)
    };
    let latitude = number(fields.latitude, Field::Latitude)?;
    let longitude = number(fields.longitude, Field::Longitude)?;
    let speed_mps = number(fields.speed, Field::Speed)?;
    let heading_deg = number(fields.heading, Field::Heading)?;

    let device_timestamp_ms = fields
        .timestamp
        .map(|value| {
            value
                .parse::<u64>()
                .map_err(|_| DecodeFailure::out_of_range(length, Field::Timestamp.name()))
        })
        .transpose()?;

    Ok(DecodedReport {
        vehicle_id: VehicleId::new(vehicle_id),
        device_timestamp_ms,
        latitude,
        longitude,
        speed_mps,
        heading_deg,
    })
}

fn require(value: Option<&str>, field: Field, length: usize) -> Result<&str, DecodeFailure> {
    value.ok_or_else(|| DecodeFailure::unrecognized(length, Some(field.name())))
}

fn parse_number(value: &str, field: Field, length: usize) -> Result<f64, DecodeFailure> {
    match value.parse::<f64>() {
        Ok(parsed) if parsed.is_finite() => Ok(parsed),
        _ => Err(DecodeFailure::out_of_range(length, field.name())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::DecodeFailureReason;

    #[test]
    fn summary_form_decodes() {
        let text = "Vehicle GN_ADDR: aabbccdd\nTimestamp: 1500 ms\nLatitude: 48.8566\n\
                    Longitude: 2.3522\nSpeed: 15 m/s\nHeading: 90.5 degrees";
        let report = decode_text(text.as_bytes()).expect("decodes");

        assert_eq!(report.vehicle_id.as_str(), "aabbccdd");
        assert_eq!(report.device_timestamp_ms, Some(1500));
        assert_eq!(report.latitude, 48.8566);
        assert_eq!(report.longitude, 2.3522);
        assert_eq!(report.speed_mps, 15.0);
        assert_eq!(report.heading_deg, 90.5);
    }

    #[test]
    fn single_line_key_value_form_decodes() {
        let text = "id=AABBCCDD; lat=-33.5; lon=151.25; speed=0; heading=359.9°";
        let report = decode_text(text.as_bytes()).expect("decodes");

        assert_eq!(report.vehicle_id.as_str(), "AABBCCDD");
        assert_eq!(report.device_timestamp_ms, None);
        assert_eq!(report.latitude, -33.5);
        assert_eq!(report.heading_deg, 359.9);
    }

    #[test]
    fn missing_identity_is_unrecognized() {
        let text = "Latitude: 1.0\nLongitude: 2.0\nSpeed: 3.0\nHeading: 4.0";
        let failure = decode_text(text.as_bytes()).unwrap_err();
        assert_eq!(failure.reason, DecodeFailureReason::UnrecognizedFormat);
        assert_eq!(failure.field, Some("vehicle_id"));
    }

    #[test]
    fn empty_identity_value_counts_as_missing() {
        let text = "Vehicle ID:   \nLatitude: 1.0\nLongitude: 2.0\nSpeed: 3.0\nHeading: 4.0";
        let failure = decode_text(text.as_bytes()).unwrap_err();
        assert_eq!(failure.reason, DecodeFailureReason::UnrecognizedFormat);
    }

    #[test]
    fn bad_numbers_are_out_of_range() {
        let text = "id: a\nlat: north\nlon: 2\nspeed: 1\nheading: 1";
        let failure = decode_text(text.as_bytes()).unwrap_err();
        assert_eq!(failure.reason, DecodeFailureReason::FieldOutOfRange);
        assert_eq!(failure.field, Some("latitude"));

        let text = "id: a\nlat: 1\nlon: 2\nspeed: inf\nheading: 1";
        assert_eq!(decode_text(text.as_bytes()).unwrap_err().field, Some("speed"));

        let text = "id: a\nTimestamp: -5 ms\nlat: 1\nlon: 2\nspeed: 1\nheading: 1";
        assert_eq!(decode_text(text.as_bytes()).unwrap_err().field, Some("timestamp"));
    }
}
