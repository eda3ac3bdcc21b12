//! Capture archives: reading frames for replay, previewing, and recording.
//!
//! ```rust,no_run
//! use v2v_telemetry::archive::{ArchiveReader, PcapReader};
//!
//! fn count_frames() -> v2v_telemetry::Result<()> {
//!     let frames = PcapReader.read_all("capture.pcap".as_ref())?;
//!     println!("{} frames", frames.len());
//!     Ok(())
//! }
//! ```

mod format;
mod writer;

use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub use format::{CaptureFormat, LINKTYPE_ETHERNET, MAX_PACKET_LEN, parse_capture};
pub use writer::PcapWriter;

use crate::Result;
use crate::decoder::Decoder;

/// Source of recorded frames.
pub trait ArchiveReader: Send + Sync {
    /// Every frame of one archive, in file order.
    fn read_all(&self, path: &Path) -> Result<Vec<Vec<u8>>>;
}

/// Reads classic pcap and pcapng files.
#[derive(Debug, Clone, Copy, Default)]
pub struct PcapReader;

impl ArchiveReader for PcapReader {
    fn read_all(&self, path: &Path) -> Result<Vec<Vec<u8>>> {
        let data = std::fs::read(path).map_err(|e| crate::V2vError::archive_error(path, e))?;
        let frames = parse_capture(&data, path)?;
        debug!("Read {} frames from {}", frames.len(), path.display());
        Ok(frames)
    }
}

/// Frames loaded from several archives, concatenated in argument order.
#[derive(Debug, Default)]
pub struct LoadedArchives {
    pub frames: Vec<Vec<u8>>,
    /// Archives that could not be read; their frames are absent
    pub failures: Vec<(PathBuf, String)>,
}

/// Read every archive, skipping (and logging) the ones that fail.
pub fn load_all<R: ArchiveReader + ?Sized>(reader: &R, paths: &[PathBuf]) -> LoadedArchives {
    let mut loaded = LoadedArchives::default();
    for path in paths {
        match reader.read_all(path) {
            Ok(frames) => loaded.frames.extend(frames),
            Err(e) => {
                warn!("Skipping archive {}: {}", path.display(), e);
                loaded.failures.push((path.clone(), e.to_string()));
            }
        }
    }
    loaded
}

/// One decoded line of a preview.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreviewEntry {
    pub index: usize,
    pub length: usize,
    pub summary: String,
}

/// First few frames of an archive, decoded for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArchivePreview {
    pub path: PathBuf,
    pub total_frames: usize,
    pub entries: Vec<PreviewEntry>,
    pub error: Option<String>,
}

/// Preview the first `count` frames of each archive.
pub fn preview<R: ArchiveReader + ?Sized>(
    reader: &R,
    paths: &[PathBuf],
    count: usize,
    decoder: Decoder,
) -> Vec<ArchivePreview> {
    paths
        .iter()
        .map(|path| match reader.read_all(path) {
            Ok(frames) => ArchivePreview {
                path: path.clone(),
                total_frames: frames.len(),
                entries: frames
                    .iter()
                    .take(count)
                    .enumerate()
                    .map(|(index, frame)| PreviewEntry {
                        index,
                        length: frame.len(),
                        summary: match decoder.decode(frame) {
                            Ok(report) => format!(
                                "vehicle {} at ({}, {})",
                                report.vehicle_id, report.latitude, report.longitude
                            ),
                            Err(failure) => failure.to_string(),
                        },
                    })
                    .collect(),
                error: None,
            },
            Err(e) => ArchivePreview {
                path: path.clone(),
                total_frames: 0,
                entries: Vec::new(),
                error: Some(e.to_string()),
            },
        })
        .collect()
}
