// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Private frame codec carried between collector and emitter.
//!
//! Each relayed CA datagram travels inside a single UDP datagram on port
//! 4000, prefixed with a fixed 28-byte header:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +---------------------------------------------------------------+
//! |                       magic (0x42375AC1)                      |
//! +---------------+---------------+-------------------------------+
//! |    version    |     type      |          payload_len          |
//! +---------------+---------------+-------------------------------+
//! |                 src_ip (original broadcaster)                 |
//! +---------------------------------------------------------------+
//! |              dst_ip (collector-side broadcast)                |
//! +-------------------------------+-------------------------------+
//! |           src_port            |     dst_port (CA listen)      |
//! +-------------------------------+-------------------------------+
//! |                          pad (zero)                           |
//! +                                                               +
//! |                                                               |
//! +---------------------------------------------------------------+
//! |                  CA payload (payload_len bytes)               |
//! +---------------------------------------------------------------+
//! ```
//!
//! All multi-byte fields are big-endian on the wire. The `type` byte is
//! reserved and sent as zero. Receivers reject anything with a bad magic,
//! an unknown version, or an inconsistent payload length.

use std::fmt;
use std::net::Ipv4Addr;

/// Frame identification constant, first four bytes of every frame.
pub const FRAME_MAGIC: u32 = 0x4237_5AC1;
/// Current frame layout version.
pub const FRAME_VERSION: u8 = 0x01;
/// Fixed header size preceding the CA payload.
pub const FRAME_HEADER_LEN: usize = 28;
/// UDP port the emitter listens on for frames.
pub const FRAME_PORT: u16 = 4000;

/// Decoded frame header.
///
/// `src_ip`/`src_port` identify the original broadcaster exactly as the
/// collector observed it; `dst_ip` is the broadcast address of the
/// collector's EPICS subnet and `dst_port` the CA listen port the datagram
/// arrived on. The emitter re-uses the ports verbatim and substitutes its
/// own subnet broadcast for the destination address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub payload_len: u16,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
}

/// Frame rejection causes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Datagram shorter than the fixed header.
    Truncated,
    /// First four bytes are not [`FRAME_MAGIC`].
    BadMagic(u32),
    /// Unknown layout version.
    BadVersion(u8),
    /// `payload_len` is zero or exceeds the received datagram.
    LengthMismatch { claimed: u16, received: usize },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "frame shorter than {} bytes", FRAME_HEADER_LEN),
            Self::BadMagic(got) => write!(f, "bad frame magic {:#010x}", got),
            Self::BadVersion(got) => write!(f, "unsupported frame version {}", got),
            Self::LengthMismatch { claimed, received } => write!(
                f,
                "payload length {} inconsistent with {} received bytes",
                claimed, received
            ),
        }
    }
}

impl std::error::Error for FrameError {}

impl FrameHeader {
    /// Encode the header into the first [`FRAME_HEADER_LEN`] bytes of `dst`.
    ///
    /// # Panics
    /// Panics if `dst` is shorter than the header; callers size their frame
    /// buffers up front.
    pub fn encode(&self, dst: &mut [u8]) {
        dst[0..4].copy_from_slice(&FRAME_MAGIC.to_be_bytes());
        dst[4] = FRAME_VERSION;
        dst[5] = 0; // reserved type byte
        dst[6..8].copy_from_slice(&self.payload_len.to_be_bytes());
        dst[8..12].copy_from_slice(&self.src_ip.octets());
        dst[12..16].copy_from_slice(&self.dst_ip.octets());
        dst[16..18].copy_from_slice(&self.src_port.to_be_bytes());
        dst[18..20].copy_from_slice(&self.dst_port.to_be_bytes());
        dst[20..FRAME_HEADER_LEN].fill(0);
    }

    /// Validate and split a received datagram into header and CA payload.
    pub fn decode(datagram: &[u8]) -> Result<(Self, &[u8]), FrameError> {
        if datagram.len() < FRAME_HEADER_LEN {
            return Err(FrameError::Truncated);
        }
        let magic = u32::from_be_bytes([datagram[0], datagram[1], datagram[2], datagram[3]]);
        if magic != FRAME_MAGIC {
            return Err(FrameError::BadMagic(magic));
        }
        if datagram[4] != FRAME_VERSION {
            return Err(FrameError::BadVersion(datagram[4]));
        }
        let payload_len = u16::from_be_bytes([datagram[6], datagram[7]]);
        let end = FRAME_HEADER_LEN + payload_len as usize;
        if payload_len == 0 || end > datagram.len() {
            return Err(FrameError::LengthMismatch {
                claimed: payload_len,
                received: datagram.len(),
            });
        }
        let header = Self {
            payload_len,
            src_ip: Ipv4Addr::new(datagram[8], datagram[9], datagram[10], datagram[11]),
            dst_ip: Ipv4Addr::new(datagram[12], datagram[13], datagram[14], datagram[15]),
            src_port: u16::from_be_bytes([datagram[16], datagram[17]]),
            dst_port: u16::from_be_bytes([datagram[18], datagram[19]]),
        };
        Ok((header, &datagram[FRAME_HEADER_LEN..end]))
    }
}
