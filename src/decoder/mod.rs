//! Frame decoding.
//!
//! [`decode`] turns raw frame bytes into a [`DecodedReport`] or a structured
//! [`DecodeFailure`]. It is pure and total: malformed input of any shape
//! produces a failure value, never a panic, and no read goes past the end of
//! the supplied buffer.
//!
//! ## Decoding steps
//!
//! 1. Frames shorter than the layout's minimum length (the end of the heading
//!    field) are rejected as [`DecodeFailureReason::TooShort`], whatever they
//!    contain.
//! 2. [`FrameFormat::detect`] picks exactly one path. Frames carrying the
//!    GeoNetworking ethertype, or exactly the layout's fixed size, are binary.
//!    Otherwise printable UTF-8 goes to the key/value text fallback and
//!    everything else to the binary layout.
//! 3. Binary fields are big-endian at fixed offsets and converted with exact
//!    fixed-point division (`/1e7`, `/100`, `/10`).
//!
//! ```rust
//! use v2v_telemetry::decoder::{decode, DecodeFailureReason};
//!
//! let failure = decode(&[0u8; 40]).unwrap_err();
//! assert_eq!(failure.reason, DecodeFailureReason::TooShort);
//! ```

mod layout;
mod text;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use layout::{
    COORDINATE_SCALE, ETHERTYPE_GEONET, ETHERTYPE_OFFSET, FieldOffsets, FrameLayout,
    HEADING_SCALE, IdEncoding, SPEED_SCALE,
};

use crate::types::DecodedReport;

/// Why a frame could not be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DecodeFailureReason {
    TooShort,
    UnrecognizedFormat,
    FieldOutOfRange,
}

impl fmt::Display for DecodeFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeFailureReason::TooShort => f.write_str("frame too short"),
            DecodeFailureReason::UnrecognizedFormat => f.write_str("unrecognized format"),
            DecodeFailureReason::FieldOutOfRange => f.write_str("field out of range"),
        }
    }
}

/// Structured per-frame decode failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeFailure {
    pub reason: DecodeFailureReason,
    /// Length of the offending frame
    pub length: usize,
    /// Offset where decoding stopped, when one is meaningful
    pub offset: Option<usize>,
    /// Field that was missing or unparseable
    pub field: Option<&'static str>,
}

impl DecodeFailure {
    /// The first missing byte is at `length`.
    pub fn too_short(length: usize) -> Self {
        Self { reason: DecodeFailureReason::TooShort, length, offset: Some(length), field: None }
    }

    pub fn unrecognized(length: usize, field: Option<&'static str>) -> Self {
        Self { reason: DecodeFailureReason::UnrecognizedFormat, length, offset: None, field }
    }

    pub fn out_of_range(length: usize, field: &'static str) -> Self {
        Self {
            reason: DecodeFailureReason::FieldOutOfRange,
            length,
            offset: None,
            field: Some(field),
        }
    }

    pub fn at(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }
}

impl fmt::Display for DecodeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} bytes", self.reason, self.length)?;
        if let Some(field) = self.field {
            write!(f, ", field {field}")?;
        }
        if let Some(offset) = self.offset {
            write!(f, ", offset {offset}")?;
        }
        f.write_str(")")
    }
}

impl std::error::Error for DecodeFailure {}

/// Payload encoding, detected from structure first and content second.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    Binary,
    Text,
}

impl FrameFormat {
    /// Binary if the frame carries the GeoNetworking ethertype or is exactly
    /// `layout`'s fixed size, whatever its bytes look like. Otherwise valid
    /// UTF-8 without control characters (other than whitespace) is text.
    ///
    /// A longer frame with neither marker and only printable bytes is read
    /// as text. Text payloads of exactly the fixed size are read as binary.
    pub fn detect(raw: &[u8], layout: FrameLayout) -> Self {
        if FrameLayout::has_ethertype(raw) || raw.len() == layout.min_len() {
            return FrameFormat::Binary;
        }
        match std::str::from_utf8(raw) {
            Ok(text) if text.chars().all(|c| !c.is_control() || c.is_whitespace()) => {
                FrameFormat::Text
            }
            _ => FrameFormat::Binary,
        }
    }
}

/// Decoder bound to one binary layout revision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Decoder {
    layout: FrameLayout,
}

impl Decoder {
    pub fn new(layout: FrameLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> FrameLayout {
        self.layout
    }

    /// Minimum accepted frame length for this decoder.
    pub fn min_len(&self) -> usize {
        self.layout.min_len()
    }

    pub fn decode(&self, raw: &[u8]) -> Result<DecodedReport, DecodeFailure> {
        if raw.len() < self.layout.min_len() {
            return Err(DecodeFailure::too_short(raw.len()));
        }

        match FrameFormat::detect(raw, self.layout) {
            FrameFormat::Binary => self.layout.decode_binary(raw),
            FrameFormat::Text => text::decode_text(raw),
        }
    }
}

/// Decode with the canonical GeoNetworking layout.
pub fn decode(raw: &[u8]) -> Result<DecodedReport, DecodeFailure> {
    Decoder::default().decode(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FrameBuilder, text_frame};

    #[test]
    fn reference_frame_decodes_exactly() {
        let frame = FrameBuilder::new()
            .vehicle_hex([0xAA, 0xBB, 0xCC, 0xDD, 0x01, 0x02, 0x03, 0x04])
            .timestamp(1000)
            .latitude(488_566_000)
            .longitude(23_522_000)
            .speed(1500)
            .heading(900)
            .build();

        let report = decode(&frame).expect("valid frame");
        assert_eq!(report.vehicle_id.as_str(), "aabbccdd01020304");
        assert_eq!(report.device_timestamp_ms, Some(1000));
        assert_eq!(report.latitude, 48.8566);
        assert_eq!(report.longitude, 2.3522);
        assert_eq!(report.speed_mps, 15.0);
        assert_eq!(report.heading_deg, 90.0);
    }

    #[test]
    fn forty_byte_frames_are_too_short_regardless_of_content() {
        for fill in [0x00u8, 0x41, 0xFF] {
            let failure = decode(&[fill; 40]).unwrap_err();
            assert_eq!(failure.reason, DecodeFailureReason::TooShort);
            assert_eq!(failure.length, 40);
        }
    }

    #[test]
    fn boundary_lengths() {
        let frame = FrameBuilder::new().build();
        assert_eq!(frame.len(), 68);
        assert!(decode(&frame).is_ok());
        assert_eq!(decode(&frame[..67]).unwrap_err().reason, DecodeFailureReason::TooShort);
        assert_eq!(decode(&[]).unwrap_err().reason, DecodeFailureReason::TooShort);
    }

    #[test]
    fn signed_integer_extremes_are_values_not_errors() {
        let frame = FrameBuilder::new().latitude(i32::MIN).longitude(i32::MIN).build();
        let report = decode(&frame).expect("extremes decode");
        assert_eq!(report.latitude, f64::from(i32::MIN) / 1e7);
        assert_eq!(report.latitude, report.longitude);

        let frame = FrameBuilder::new().latitude(i32::MAX).longitude(i32::MAX).build();
        let report = decode(&frame).expect("extremes decode");
        assert_eq!(report.latitude, 214.7483647);
    }

    #[test]
    fn compact_layout_reads_numeric_ids() {
        let frame = FrameBuilder::compact()
            .vehicle_numeric(0xAABB_CCDD)
            .timestamp(77)
            .latitude(-1)
            .speed(1)
            .heading(3599)
            .build();
        assert_eq!(frame.len(), 62);

        let report = Decoder::new(FrameLayout::Compact).decode(&frame).expect("valid");
        assert_eq!(report.vehicle_id.as_str(), "2864434397");
        assert_eq!(report.device_timestamp_ms, Some(77));
        assert_eq!(report.latitude, -0.0000001);
        assert_eq!(report.speed_mps, 0.01);
        assert_eq!(report.heading_deg, 359.9);

        // The canonical layout needs six more bytes
        assert_eq!(decode(&frame).unwrap_err().reason, DecodeFailureReason::TooShort);
    }

    #[test]
    fn text_frames_take_the_text_path() {
        let frame = text_frame("AABBCCDD", Some(1500), 48.8566, 2.3522);
        assert_eq!(FrameFormat::detect(&frame, FrameLayout::GeoNet), FrameFormat::Text);

        let report = decode(&frame).expect("text decodes");
        assert_eq!(report.vehicle_id.as_str(), "AABBCCDD");
        assert_eq!(report.device_timestamp_ms, Some(1500));
    }

    #[test]
    fn printable_fixed_size_frames_are_binary() {
        let report = decode(&[0x41u8; 68]).expect("binary frame");
        assert_eq!(report.vehicle_id.as_str(), "4141414141414141");
        assert_eq!(report.device_timestamp_ms, Some(0x4141_4141));
        assert_eq!(report.latitude, f64::from(0x4141_4141i32) / 1e7);
        assert_eq!(report.speed_mps, f64::from(0x4141u16) / 100.0);

        let report = Decoder::new(FrameLayout::Compact).decode(&[b'z'; 62]).expect("binary frame");
        assert_eq!(report.heading_deg, f64::from(u16::from_be_bytes([b'z', b'z'])) / 10.0);
    }

    #[test]
    fn ethertype_marks_binary_at_any_length() {
        // Lead byte at 9 makes the ethertype a valid, printable UTF-8 sequence
        let mut frame = vec![b'A'; 90];
        frame[9..12].copy_from_slice(&[0xF0, 0x9F, 0x98]);
        frame[12..14].copy_from_slice(&[0x89, 0x47]);
        assert!(std::str::from_utf8(&frame).is_ok());

        assert_eq!(FrameFormat::detect(&frame, FrameLayout::GeoNet), FrameFormat::Binary);
        assert!(decode(&frame).is_ok());
    }

    #[test]
    fn longer_printable_frames_without_ethertype_are_text() {
        assert_eq!(FrameFormat::detect(&[0x41u8; 69], FrameLayout::GeoNet), FrameFormat::Text);
        assert_eq!(
            decode(&[0x41u8; 69]).unwrap_err().reason,
            DecodeFailureReason::UnrecognizedFormat
        );
    }

    #[test]
    fn text_without_identity_is_unrecognized_not_a_crash() {
        let frame = b"Latitude: 48.8566\nLongitude: 2.3522\nSpeed: 15 m/s\nHeading: 90 degrees\n";
        let failure = decode(frame).unwrap_err();
        assert_eq!(failure.reason, DecodeFailureReason::UnrecognizedFormat);
    }

    #[test]
    fn report_summary_decodes_back() {
        let original = decode(&FrameBuilder::new().latitude(-123_456_789).build()).expect("valid");
        let summary = original.to_string();
        assert_eq!(decode(summary.as_bytes()), Ok(original));
    }

    #[test]
    fn failure_display_names_reason_and_context() {
        let message = DecodeFailure::out_of_range(90, "speed").to_string();
        assert!(message.contains("field out of range"));
        assert!(message.contains("speed"));
        assert!(DecodeFailure::too_short(40).to_string().contains("offset 40"));
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_binary_fields_match_fixed_point_conversion(
                id in any::<[u8; 8]>(),
                timestamp in any::<u32>(),
                latitude in any::<i32>(),
                longitude in any::<i32>(),
                speed in any::<u16>(),
                heading in any::<u16>(),
                trailer in prop::collection::vec(any::<u8>(), 0..64)
            ) {
                let mut frame = FrameBuilder::new()
                    .vehicle_hex(id)
                    .timestamp(timestamp)
                    .latitude(latitude)
                    .longitude(longitude)
                    .speed(speed)
                    .heading(heading)
                    .build();
                frame.extend_from_slice(&trailer);

                let report = decode(&frame).expect("valid binary frame");
                prop_assert_eq!(report.vehicle_id, crate::types::VehicleId::from_hex_bytes(&id));
                prop_assert_eq!(report.device_timestamp_ms, Some(u64::from(timestamp)));
                prop_assert_eq!(report.latitude, f64::from(latitude) / 1e7);
                prop_assert_eq!(report.longitude, f64::from(longitude) / 1e7);
                prop_assert_eq!(report.speed_mps, f64::from(speed) / 100.0);
                prop_assert_eq!(report.heading_deg, f64::from(heading) / 10.0);
            }

            #[test]
            fn prop_printable_fixed_size_frames_decode(
                bytes in prop::collection::vec(0x20u8..0x7f, 68)
            ) {
                let report = decode(&bytes).expect("fixed-size frame is binary");
                let latitude = i32::from_be_bytes([bytes[56], bytes[57], bytes[58], bytes[59]]);
                prop_assert_eq!(report.latitude, f64::from(latitude) / 1e7);
                let vehicle_id = crate::types::VehicleId::from_hex_bytes(&bytes[26..34]);
                prop_assert_eq!(report.vehicle_id, vehicle_id);
            }

            #[test]
            fn prop_printable_frames_with_ethertype_decode(
                bytes in prop::collection::vec(0x20u8..0x7f, 68..200)
            ) {
                let mut bytes = bytes;
                bytes[12..14].copy_from_slice(&[0x89, 0x47]);
                let report = decode(&bytes).expect("ethertype frame is binary");
                let heading = u16::from_be_bytes([bytes[66], bytes[67]]);
                prop_assert_eq!(report.heading_deg, f64::from(heading) / 10.0);
            }

            #[test]
            fn prop_short_frames_are_too_short(bytes in prop::collection::vec(any::<u8>(), 0..68)) {
                let failure = decode(&bytes).unwrap_err();
                prop_assert_eq!(failure.reason, DecodeFailureReason::TooShort);
                prop_assert_eq!(failure.length, bytes.len());
            }

            #[test]
            fn prop_arbitrary_input_never_panics(
                bytes in prop::collection::vec(any::<u8>(), 0..256)
            ) {
                for layout in FrameLayout::ALL {
                    let _ = Decoder::new(layout).decode(&bytes);
                }
            }
        }
    }
}
