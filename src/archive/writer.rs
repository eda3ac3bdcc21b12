//! Classic pcap writer for raw frame archives

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use super::format::{LINKTYPE_ETHERNET, PCAP_MAGIC_MICROS};
use crate::{Result, V2vError};

const SNAPLEN: u32 = 65_535;

/// Writes frames as a little-endian, microsecond-resolution Ethernet pcap.
pub struct PcapWriter<W: Write> {
    inner: W,
    path: PathBuf,
    frames: usize,
}

impl PcapWriter<BufWriter<File>> {
    /// Create (or truncate) a capture file.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|e| V2vError::archive_error(path, e))?;
        Self::with_path(BufWriter::new(file), path.to_path_buf())
    }
}

impl<W: Write> PcapWriter<W> {
    /// Wrap any writer; the global header is written immediately.
    pub fn new(inner: W) -> Result<Self> {
        Self::with_path(inner, PathBuf::from("<stream>"))
    }

    fn with_path(inner: W, path: PathBuf) -> Result<Self> {
        let mut writer = Self { inner, path, frames: 0 };
        let mut header = Vec::with_capacity(24);
        header.extend_from_slice(&PCAP_MAGIC_MICROS.to_le_bytes());
        header.extend_from_slice(&2u16.to_le_bytes());
        header.extend_from_slice(&4u16.to_le_bytes());
        header.extend_from_slice(&0i32.to_le_bytes());
        header.extend_from_slice(&0u32.to_le_bytes());
        header.extend_from_slice(&SNAPLEN.to_le_bytes());
        header.extend_from_slice(&LINKTYPE_ETHERNET.to_le_bytes());
        writer.write_all(&header)?;
        Ok(writer)
    }

    /// Append a frame stamped with the current time.
    pub fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.write_frame_at(frame, SystemTime::now())
    }

    /// Append a frame with an explicit capture time.
    pub fn write_frame_at(&mut self, frame: &[u8], captured_at: SystemTime) -> Result<()> {
        let since_epoch = captured_at.duration_since(UNIX_EPOCH).unwrap_or_default();
        let length = u32::try_from(frame.len()).map_err(|_| {
            let details = format!("frame of {} bytes cannot be archived", frame.len());
            V2vError::archive_format(&self.path, details)
        })?;
        // pcap seconds are 32 bits wide
        let seconds = since_epoch.as_secs() as u32;

        let mut record = Vec::with_capacity(16 + frame.len());
        record.extend_from_slice(&seconds.to_le_bytes());
        record.extend_from_slice(&since_epoch.subsec_micros().to_le_bytes());
        record.extend_from_slice(&length.to_le_bytes());
        record.extend_from_slice(&length.to_le_bytes());
        record.extend_from_slice(frame);
        self.write_all(&record)?;
        self.frames += 1;
        Ok(())
    }

    pub fn frames_written(&self) -> usize {
        self.frames
    }

    /// Flush buffered records.
    pub fn finish(mut self) -> Result<()> {
        self.inner.flush().map_err(|e| V2vError::archive_error(&self.path, e))
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner.write_all(bytes).map_err(|e| V2vError::archive_error(&self.path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::super::format::parse_capture;
    use super::*;

    #[test]
    fn written_frames_parse_back_in_order() {
        let mut writer = PcapWriter::new(Vec::new()).expect("header");
        writer.write_frame(b"alpha").expect("write");
        writer.write_frame(&[]).expect("write");
        writer.write_frame(&[0xff; 68]).expect("write");
        assert_eq!(writer.frames_written(), 3);

        let bytes = writer.inner.clone();
        let frames = parse_capture(&bytes, Path::new("memory")).expect("parse");
        assert_eq!(frames, vec![b"alpha".to_vec(), Vec::new(), vec![0xff; 68]]);
    }

    #[test]
    fn header_uses_ethernet_link_type() {
        let writer = PcapWriter::new(Vec::new()).expect("header");
        assert_eq!(writer.inner.len(), 24);
        assert_eq!(&writer.inner[0..4], &[0xd4, 0xc3, 0xb2, 0xa1]);
        assert_eq!(&writer.inner[20..24], &[1, 0, 0, 0]);
    }

    #[test]
    fn create_fails_for_missing_directory() {
        let dir = tempfile::tempdir().expect("temp dir");
        let result = PcapWriter::create(dir.path().join("missing").join("out.pcap"));
        assert!(matches!(result, Err(V2vError::Archive { .. })));
    }
}
