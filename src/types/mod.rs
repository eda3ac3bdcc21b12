//! Core types shared by the decode-and-track pipeline.
//!
//! ## Architecture
//!
//! - [`RawFrame`] is an opaque frame as received from the channel, with its topic
//!   and receipt time
//! - [`DecodedReport`] is the structured result of a successful decode
//! - [`VehicleId`] and [`Position`] identify and locate a vehicle
//! - [`FanoutEvent`] is what observers receive after a report is recorded
//! - [`PipelineConfig`] holds the broker address, port and topic
//!
//! ## Usage Example
//!
//! ```rust
//! use v2v_telemetry::types::{DecodedReport, VehicleId};
//!
//! let report = DecodedReport {
//!     vehicle_id: VehicleId::from("aabbccddeeff0011"),
//!     device_timestamp_ms: Some(1000),
//!     latitude: 48.8566,
//!     longitude: 2.3522,
//!     speed_mps: 15.0,
//!     heading_deg: 90.0,
//! };
//!
//! assert_eq!(report.position().latitude, 48.8566);
//! println!("{}", report);
//! ```

mod config;
mod event;
mod frame;
mod report;

pub use config::{DEFAULT_ADDRESS, DEFAULT_PORT, DEFAULT_TOPIC, PipelineConfig};
pub use event::FanoutEvent;
pub use frame::{RawFrame, unix_millis};
pub use report::{DecodedReport, Position, VehicleId};

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;
    use std::time::{Duration, UNIX_EPOCH};

    proptest! {
        #[test]
        fn prop_hex_ids_are_two_chars_per_byte(bytes in prop::collection::vec(any::<u8>(), 0..16)) {
            let id = VehicleId::from_hex_bytes(&bytes);
            prop_assert_eq!(id.as_str().len(), bytes.len() * 2);
            let lower_hex = |c: char| c.is_ascii_hexdigit() && !c.is_ascii_uppercase();
            prop_assert!(id.as_str().chars().all(lower_hex));
        }

        #[test]
        fn prop_unix_millis_matches_duration(ms in 0u64..4_000_000_000_000u64) {
            let time = UNIX_EPOCH + Duration::from_millis(ms);
            prop_assert_eq!(unix_millis(time), ms);
        }
    }

    #[test]
    fn raw_frame_shares_payload() {
        let frame = RawFrame::new(vec![1u8, 2, 3], "v2v", 7);
        let copy = frame.clone();
        assert_eq!(frame.len(), 3);
        assert!(!frame.is_empty());
        assert_eq!(copy.generation, 7);
        assert_eq!(&*copy.topic, "v2v");
        assert!(std::sync::Arc::ptr_eq(&frame.payload, &copy.payload));
    }

    #[test]
    fn fanout_event_serializes_for_observers() {
        let report = DecodedReport {
            vehicle_id: VehicleId::from_numeric(42),
            device_timestamp_ms: Some(1500),
            latitude: 1.5,
            longitude: -2.25,
            speed_mps: 3.0,
            heading_deg: 180.0,
        };
        let event = FanoutEvent::from_report(report, 500, 2, "v2v", 1_700_000_000_000);
        let json = serde_json::to_value(&event).expect("serializable");

        assert_eq!(json["vehicle_id"], "42");
        assert_eq!(json["elapsed_ms"], 500);
        assert_eq!(json["device_timestamp_ms"], 1500);
        assert_eq!(json["speed"], 3.0);
        assert_eq!(json["track_len"], 2);
    }
}
