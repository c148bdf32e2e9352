// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! EPICS Channel Access wire format (UDP broadcast subset).
//!
//! A CA datagram is a plain concatenation of messages, each starting with
//! the 16-byte common header:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-------------------------------+-------------------------------+
//! |            command            |          payload_size         |
//! +-------------------------------+-------------------------------+
//! |             data              |             count             |
//! +-------------------------------+-------------------------------+
//! |                            param1                             |
//! +---------------------------------------------------------------+
//! |                            param2                             |
//! +---------------------------------------------------------------+
//! |                    payload (payload_size bytes)               |
//! +---------------------------------------------------------------+
//! ```
//!
//! All fields are big-endian; payloads are padded to an 8-byte multiple.
//! Only the three commands seen on the broadcast ports are understood:
//! VERSION (0), SEARCH (6) and the RSRV_IS_UP beacon (13). Anything else
//! terminates the walk.
//!
//! [`rewrite_datagram`] is the collector's core operation: it copies
//! relayable messages into an output buffer while dropping searches the PV
//! filter rejects, and suppresses the whole datagram when every search in
//! it was rejected (a VERSION-only remnant would re-trigger searches on the
//! remote subnet).

use std::net::Ipv4Addr;

use crate::filter::PvFilter;

/// CA_PROTO_VERSION: protocol handshake, prefixes most search datagrams.
pub const CA_PROTO_VERSION: u16 = 0;
/// CA_PROTO_SEARCH: PV name resolution request.
pub const CA_PROTO_SEARCH: u16 = 6;
/// CA_PROTO_RSRV_IS_UP: periodic server liveness beacon.
pub const CA_PROTO_RSRV_IS_UP: u16 = 13;

/// Size of the common CA message header.
pub const CA_HEADER_LEN: usize = 16;
/// Cap on a PV name, terminating NUL included. Searches with a payload at
/// or above this are dropped without being relayed.
pub const PV_NAME_MAX: usize = 128;

/// Decoded common CA message header.
///
/// Field meaning depends on the command; see the command-specific
/// accessors. The generic names mirror the wire layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaHeader {
    pub command: u16,
    pub payload_size: u16,
    pub data: u16,
    pub count: u16,
    pub param1: u32,
    pub param2: u32,
}

impl CaHeader {
    /// Decode the header at the start of `buf`, or `None` when fewer than
    /// [`CA_HEADER_LEN`] bytes remain.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < CA_HEADER_LEN {
            return None;
        }
        Some(Self {
            command: u16::from_be_bytes([buf[0], buf[1]]),
            payload_size: u16::from_be_bytes([buf[2], buf[3]]),
            data: u16::from_be_bytes([buf[4], buf[5]]),
            count: u16::from_be_bytes([buf[6], buf[7]]),
            param1: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            param2: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
        })
    }

    /// Total space the message occupies in the datagram.
    #[must_use]
    pub fn message_len(&self) -> usize {
        CA_HEADER_LEN + self.payload_size as usize
    }

    /// Beacon: IPv4 address the server announced itself under.
    #[must_use]
    pub fn beacon_address(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.param2)
    }
}

/// Result of rewriting one datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RewriteSummary {
    /// Bytes written to the output buffer. Zero means "do not relay".
    pub len: usize,
    /// Search messages accepted by the filter.
    pub searches_accepted: u32,
    /// Search messages the filter rejected or that were malformed.
    pub searches_dropped: u32,
}

/// Rewrite a CA datagram for relaying.
///
/// Walks the message stream in `src`, copying VERSION and beacon headers
/// verbatim and copying each SEARCH only when `filter` accepts its PV name.
/// Rejected searches are consumed without being written. Parsing stops at
/// the first unknown command or truncated message, keeping what was
/// produced so far.
///
/// When the datagram carried at least one search and none survived, the
/// whole output is suppressed (`len == 0`): relaying the VERSION prefix
/// alone would still solicit traffic on the remote subnet.
///
/// `dst` must be at least as large as `src`; output never exceeds input.
pub fn rewrite_datagram(src: &[u8], dst: &mut [u8], filter: &PvFilter) -> RewriteSummary {
    debug_assert!(dst.len() >= src.len());

    let mut pos = 0;
    let mut out = 0;
    let mut summary = RewriteSummary::default();
    let mut saw_search = false;

    while let Some(hdr) = CaHeader::decode(&src[pos..]) {
        match hdr.command {
            CA_PROTO_VERSION => {
                log::debug!(
                    "[epics] version priority={} version={}",
                    hdr.data,
                    hdr.count
                );
                dst[out..out + CA_HEADER_LEN].copy_from_slice(&src[pos..pos + CA_HEADER_LEN]);
                out += CA_HEADER_LEN;
                pos += CA_HEADER_LEN;
            }
            CA_PROTO_SEARCH => {
                saw_search = true;
                let msg_len = hdr.message_len();
                if pos + msg_len > src.len() {
                    log::debug!(
                        "[epics] truncated search: {} bytes claimed, {} left",
                        msg_len,
                        src.len() - pos
                    );
                    summary.searches_dropped += 1;
                    break;
                }
                let payload = &src[pos + CA_HEADER_LEN..pos + msg_len];
                match search_pv_name(hdr.payload_size, payload) {
                    Some(pv) if filter.matches(pv) => {
                        log::debug!(
                            "[epics] search accept pv={} reply={} version={} cid1={} cid2={}",
                            pv,
                            hdr.data,
                            hdr.count,
                            hdr.param1,
                            hdr.param2
                        );
                        dst[out..out + msg_len].copy_from_slice(&src[pos..pos + msg_len]);
                        out += msg_len;
                        summary.searches_accepted += 1;
                    }
                    Some(pv) => {
                        log::debug!("[epics] search reject pv={}", pv);
                        summary.searches_dropped += 1;
                    }
                    None => {
                        log::debug!(
                            "[epics] search with unusable pv name, payload_size={}",
                            hdr.payload_size
                        );
                        summary.searches_dropped += 1;
                    }
                }
                pos += msg_len;
            }
            CA_PROTO_RSRV_IS_UP => {
                log::debug!(
                    "[epics] beacon port={} id={} addr={}",
                    hdr.count,
                    hdr.param1,
                    hdr.beacon_address()
                );
                dst[out..out + CA_HEADER_LEN].copy_from_slice(&src[pos..pos + CA_HEADER_LEN]);
                out += CA_HEADER_LEN;
                pos += CA_HEADER_LEN;
            }
            other => {
                log::debug!("[epics] unknown command {}, stopping", other);
                break;
            }
        }
    }

    // A search datagram whose every PV was filtered out must not be relayed
    // at all, even if a VERSION prefix was already copied.
    if saw_search && summary.searches_accepted == 0 {
        summary.len = 0;
    } else {
        summary.len = out;
    }
    summary
}

/// Extract the PV name from a search payload.
///
/// The payload is a NUL-terminated string padded to 8 bytes. Returns `None`
/// when the name would exceed [`PV_NAME_MAX`], contains no terminator, or
/// is not valid UTF-8.
fn search_pv_name(payload_size: u16, payload: &[u8]) -> Option<&str> {
    if payload_size as usize >= PV_NAME_MAX {
        return None;
    }
    let end = payload.iter().position(|&b| b == 0)?;
    std::str::from_utf8(&payload[..end]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(cmd: u16, payload_size: u16, data: u16, count: u16, p1: u32, p2: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&cmd.to_be_bytes());
        buf.extend_from_slice(&payload_size.to_be_bytes());
        buf.extend_from_slice(&data.to_be_bytes());
        buf.extend_from_slice(&count.to_be_bytes());
        buf.extend_from_slice(&p1.to_be_bytes());
        buf.extend_from_slice(&p2.to_be_bytes());
        buf
    }

    fn search(pv: &str) -> Vec<u8> {
        // NUL-terminated, padded to 8 bytes like real clients send it.
        let padded = (pv.len() + 1).div_ceil(8) * 8;
        let mut buf = message(CA_PROTO_SEARCH, padded as u16, 10, 13, 1, 1);
        buf.extend_from_slice(pv.as_bytes());
        buf.resize(CA_HEADER_LEN + padded, 0);
        buf
    }

    fn rewrite(src: &[u8], filter: &PvFilter) -> (Vec<u8>, RewriteSummary) {
        let mut dst = vec![0u8; src.len()];
        let summary = rewrite_datagram(src, &mut dst, filter);
        dst.truncate(summary.len);
        (dst, summary)
    }

    fn accept(rules: &[&str]) -> PvFilter {
        let rules: Vec<String> = rules.iter().map(|r| r.to_string()).collect();
        PvFilter::compile(false, false, &rules).expect("rules should compile")
    }

    #[test]
    fn test_header_decode() {
        let raw = message(6, 24, 10, 13, 0xdead_beef, 0x0a00_0007);
        let hdr = CaHeader::decode(&raw).expect("header should decode");
        assert_eq!(hdr.command, 6);
        assert_eq!(hdr.payload_size, 24);
        assert_eq!(hdr.data, 10);
        assert_eq!(hdr.count, 13);
        assert_eq!(hdr.param1, 0xdead_beef);
        assert_eq!(hdr.param2, 0x0a00_0007);
        assert_eq!(hdr.message_len(), 40);
    }

    #[test]
    fn test_header_decode_short_buffer() {
        assert!(CaHeader::decode(&[0u8; 15]).is_none());
    }

    #[test]
    fn test_beacon_passes_through_verbatim() {
        let beacon = message(
            CA_PROTO_RSRV_IS_UP,
            0,
            13,
            5064,
            7,
            u32::from(Ipv4Addr::new(10, 0, 0, 7)),
        );
        let (out, summary) = rewrite(&beacon, &PvFilter::accept_all());
        assert_eq!(out, beacon);
        assert_eq!(summary.searches_accepted, 0);
    }

    #[test]
    fn test_version_passes_through_verbatim() {
        let version = message(CA_PROTO_VERSION, 0, 1, 13, 0, 0);
        let (out, _) = rewrite(&version, &PvFilter::accept_all());
        assert_eq!(out, version);
    }

    #[test]
    fn test_search_accepted_by_filter() {
        let datagram = search("OK:MOTOR1");
        let (out, summary) = rewrite(&datagram, &accept(&["^OK:"]));
        assert_eq!(out, datagram);
        assert_eq!(summary.searches_accepted, 1);
    }

    #[test]
    fn test_search_rejected_by_filter() {
        let datagram = search("BAD:MOTOR");
        let (out, summary) = rewrite(&datagram, &accept(&["^OK:"]));
        assert!(out.is_empty());
        assert_eq!(summary.searches_dropped, 1);
    }

    #[test]
    fn test_version_prefix_dropped_when_all_searches_rejected() {
        let mut datagram = message(CA_PROTO_VERSION, 0, 1, 13, 0, 0);
        datagram.extend_from_slice(&search("BAD:MOTOR"));
        let (out, summary) = rewrite(&datagram, &accept(&["^OK:"]));
        assert_eq!(summary.len, 0);
        assert!(out.is_empty());
    }

    #[test]
    fn test_mixed_searches_keep_accepted_only() {
        let mut datagram = message(CA_PROTO_VERSION, 0, 1, 13, 0, 0);
        datagram.extend_from_slice(&search("BAD:ONE"));
        datagram.extend_from_slice(&search("OK:TWO"));

        let mut expected = message(CA_PROTO_VERSION, 0, 1, 13, 0, 0);
        expected.extend_from_slice(&search("OK:TWO"));

        let (out, summary) = rewrite(&datagram, &accept(&["^OK:"]));
        assert_eq!(out, expected);
        assert_eq!(summary.searches_accepted, 1);
        assert_eq!(summary.searches_dropped, 1);
    }

    #[test]
    fn test_oversized_pv_name_is_skipped() {
        let long = "X".repeat(140);
        let mut datagram = search(&long);
        datagram.extend_from_slice(&search("OK:KEEP"));
        let (out, summary) = rewrite(&datagram, &PvFilter::accept_all());
        assert_eq!(out, search("OK:KEEP"));
        assert_eq!(summary.searches_dropped, 1);
        assert_eq!(summary.searches_accepted, 1);
    }

    #[test]
    fn test_unknown_command_stops_parsing() {
        let mut datagram = message(CA_PROTO_RSRV_IS_UP, 0, 13, 5064, 1, 0);
        datagram.extend_from_slice(&message(42, 0, 0, 0, 0, 0));
        datagram.extend_from_slice(&message(CA_PROTO_RSRV_IS_UP, 0, 13, 5064, 2, 0));
        let (out, _) = rewrite(&datagram, &PvFilter::accept_all());
        // Only the first beacon survives; the walk stops at command 42.
        assert_eq!(out, message(CA_PROTO_RSRV_IS_UP, 0, 13, 5064, 1, 0));
    }

    #[test]
    fn test_truncated_search_stops_parsing() {
        let mut datagram = search("OK:A");
        let mut truncated = search("OK:B");
        truncated.truncate(CA_HEADER_LEN + 2);
        datagram.extend_from_slice(&truncated);
        let (out, summary) = rewrite(&datagram, &PvFilter::accept_all());
        assert_eq!(out, search("OK:A"));
        assert_eq!(summary.searches_dropped, 1);
    }

    #[test]
    fn test_search_without_terminator_is_skipped() {
        let mut datagram = message(CA_PROTO_SEARCH, 8, 10, 13, 1, 1);
        datagram.extend_from_slice(b"NONULXXX");
        let (out, _) = rewrite(&datagram, &PvFilter::accept_all());
        assert!(out.is_empty());
    }

    #[test]
    fn test_trailing_partial_header_ignored() {
        let mut datagram = message(CA_PROTO_VERSION, 0, 1, 13, 0, 0);
        datagram.extend_from_slice(&[0u8; 7]);
        let (out, _) = rewrite(&datagram, &PvFilter::accept_all());
        assert_eq!(out, message(CA_PROTO_VERSION, 0, 1, 13, 0, 0));
    }
}
