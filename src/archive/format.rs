//! Capture file format structures and parsing
//!
//! Two container formats are understood:
//!
//! 1. **Classic pcap** - a 24 byte global header followed by records of a
//!    16 byte header plus captured bytes. Byte order and timestamp precision
//!    come from the magic number.
//! 2. **pcapng** - a sequence of typed blocks. Packets come from Enhanced,
//!    Simple and (obsolete) Packet blocks; everything else is skipped. Byte
//!    order is set per section by the Section Header Block.
//!
//! All reads are bounds checked; a truncated or inconsistent file produces
//! an [`ArchiveFormat`](crate::V2vError::ArchiveFormat) error.

use std::path::Path;
use tracing::{debug, trace};

use crate::{Result, V2vError};

pub const PCAP_MAGIC_MICROS: u32 = 0xa1b2_c3d4;
pub const PCAP_MAGIC_NANOS: u32 = 0xa1b2_3c4d;
pub const PCAP_GLOBAL_HEADER_SIZE: usize = 24;
pub const PCAP_RECORD_HEADER_SIZE: usize = 16;
pub const LINKTYPE_ETHERNET: u32 = 1;
/// Upper bound on a single captured packet; larger lengths mean corruption.
pub const MAX_PACKET_LEN: usize = 262_144;

const PCAPNG_SECTION_HEADER: u32 = 0x0a0d_0d0a;
const PCAPNG_BYTE_ORDER_MAGIC: u32 = 0x1a2b_3c4d;
const PCAPNG_INTERFACE_DESCRIPTION: u32 = 0x0000_0001;
const PCAPNG_PACKET: u32 = 0x0000_0002;
const PCAPNG_SIMPLE_PACKET: u32 = 0x0000_0003;
const PCAPNG_ENHANCED_PACKET: u32 = 0x0000_0006;
const PCAPNG_MIN_BLOCK_SIZE: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    fn u16(self, data: &[u8], offset: usize) -> Option<u16> {
        let bytes: [u8; 2] = data.get(offset..offset + 2)?.try_into().ok()?;
        Some(match self {
            ByteOrder::Little => u16::from_le_bytes(bytes),
            ByteOrder::Big => u16::from_be_bytes(bytes),
        })
    }

    fn u32(self, data: &[u8], offset: usize) -> Option<u32> {
        let bytes: [u8; 4] = data.get(offset..offset + 4)?.try_into().ok()?;
        Some(match self {
            ByteOrder::Little => u32::from_le_bytes(bytes),
            ByteOrder::Big => u32::from_be_bytes(bytes),
        })
    }
}

/// Container format, detected from the leading magic number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureFormat {
    Pcap { byte_order: ByteOrder, nanos: bool },
    PcapNg,
}

impl CaptureFormat {
    pub fn detect(data: &[u8]) -> Option<Self> {
        let magic = ByteOrder::Little.u32(data, 0)?;
        match magic {
            PCAP_MAGIC_MICROS => Some(Self::Pcap { byte_order: ByteOrder::Little, nanos: false }),
            PCAP_MAGIC_NANOS => Some(Self::Pcap { byte_order: ByteOrder::Little, nanos: true }),
            m if m.swap_bytes() == PCAP_MAGIC_MICROS => {
                Some(Self::Pcap { byte_order: ByteOrder::Big, nanos: false })
            }
            m if m.swap_bytes() == PCAP_MAGIC_NANOS => {
                Some(Self::Pcap { byte_order: ByteOrder::Big, nanos: true })
            }
            PCAPNG_SECTION_HEADER => Some(Self::PcapNg),
            _ => None,
        }
    }
}

/// Parse a whole capture into its packets, in file order.
pub fn parse_capture(data: &[u8], path: &Path) -> Result<Vec<Vec<u8>>> {
    match CaptureFormat::detect(data) {
        Some(CaptureFormat::Pcap { byte_order, nanos }) => {
            trace!(?byte_order, nanos, "Parsing classic pcap");
            parse_pcap(data, byte_order, path)
        }
        Some(CaptureFormat::PcapNg) => {
            trace!("Parsing pcapng");
            parse_pcapng(data, path)
        }
        None => Err(V2vError::archive_format(path, "unrecognized capture magic number")),
    }
}

fn parse_pcap(data: &[u8], order: ByteOrder, path: &Path) -> Result<Vec<Vec<u8>>> {
    if data.len() < PCAP_GLOBAL_HEADER_SIZE {
        return Err(V2vError::archive_format(
            path,
            format!(
                "global header needs {} bytes, file has {}",
                PCAP_GLOBAL_HEADER_SIZE,
                data.len()
            ),
        ));
    }

    let truncated = |offset: usize| {
        V2vError::archive_format(path, format!("truncated record at offset {offset}"))
    };

    let linktype = order.u32(data, 20).ok_or_else(|| truncated(20))?;
    if linktype != LINKTYPE_ETHERNET {
        debug!(
            "Capture {} has link type {}, frames are passed through as-is",
            path.display(),
            linktype
        );
    }

    let mut packets = Vec::new();
    let mut offset = PCAP_GLOBAL_HEADER_SIZE;
    while offset < data.len() {
        // incl_len sits after ts_sec and ts_frac
        let captured = order.u32(data, offset + 8).ok_or_else(|| truncated(offset))? as usize;
        if captured > MAX_PACKET_LEN {
            return Err(V2vError::archive_format(
                path,
                format!("record at offset {offset} claims {captured} bytes"),
            ));
        }
        let start = offset + PCAP_RECORD_HEADER_SIZE;
        let packet = data.get(start..start + captured).ok_or_else(|| truncated(offset))?;
        packets.push(packet.to_vec());
        offset = start + captured;
    }

    Ok(packets)
}

fn parse_pcapng(data: &[u8], path: &Path) -> Result<Vec<Vec<u8>>> {
    let malformed = |offset: usize, what: &str| {
        V2vError::archive_format(path, format!("{what} at offset {offset}"))
    };

    let mut packets = Vec::new();
    let mut order = ByteOrder::Little;
    let mut offset = 0;

    while offset < data.len() {
        // The section header type reads the same in either byte order
        let block_type =
            order.u32(data, offset).ok_or_else(|| malformed(offset, "truncated block"))?;
        if block_type == PCAPNG_SECTION_HEADER {
            order = match ByteOrder::Big.u32(data, offset + 8) {
                Some(PCAPNG_BYTE_ORDER_MAGIC) => ByteOrder::Big,
                Some(m) if m.swap_bytes() == PCAPNG_BYTE_ORDER_MAGIC => ByteOrder::Little,
                _ => return Err(malformed(offset, "bad section byte-order magic")),
            };
        }

        let total_len = order
            .u32(data, offset + 4)
            .ok_or_else(|| malformed(offset, "truncated block"))? as usize;
        if total_len < PCAPNG_MIN_BLOCK_SIZE || total_len % 4 != 0 {
            return Err(malformed(offset, "invalid block length"));
        }
        if offset + total_len > data.len() {
            return Err(malformed(offset, "truncated block"));
        }
        let body = data
            .get(offset + 8..offset + total_len - 4)
            .ok_or_else(|| malformed(offset, "truncated block"))?;

        match block_type {
            PCAPNG_ENHANCED_PACKET | PCAPNG_PACKET => {
                let captured = order
                    .u32(body, 12)
                    .ok_or_else(|| malformed(offset, "short packet block"))?
                    as usize;
                let packet = body
                    .get(20..20 + captured)
                    .ok_or_else(|| malformed(offset, "packet exceeds block"))?;
                packets.push(packet.to_vec());
            }
            PCAPNG_SIMPLE_PACKET => {
                let original = order
                    .u32(body, 0)
                    .ok_or_else(|| malformed(offset, "short packet block"))?
                    as usize;
                let available = body.len().saturating_sub(4);
                let packet = &body[4..4 + original.min(available)];
                packets.push(packet.to_vec());
            }
            PCAPNG_INTERFACE_DESCRIPTION => {
                match order.u16(body, 0) {
                    Some(linktype) if u32::from(linktype) != LINKTYPE_ETHERNET => {
                        debug!("Interface in {} has link type {}", path.display(), linktype);
                    }
                    _ => {}
                }
            }
            _ => trace!(block_type, "Skipping pcapng block"),
        }

        offset += total_len;
    }

    Ok(packets)
}
