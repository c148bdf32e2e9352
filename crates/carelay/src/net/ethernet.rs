// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Raw-packet construction and link-layer emission.
//!
//! The emitter must put a CA datagram on its EPICS subnet *as if the
//! original broadcaster had sent it*: source IP forged to the collector-side
//! sender, destination IP the local subnet broadcast, destination MAC the
//! Ethernet broadcast address. A normal UDP socket cannot do that, so the
//! packet is assembled here byte by byte and handed to one of two senders:
//!
//! - [`PacketSender`] - `AF_PACKET/SOCK_RAW`, full Ethernet frame, used
//!   whenever the interface has a hardware address;
//! - [`RawIpSender`] - `AF_INET/SOCK_RAW/IPPROTO_RAW`, IPv4 upwards, the
//!   kernel fills in the link layer. Fallback for MAC-less interfaces or
//!   when `AF_PACKET` is unavailable.
//!
//! Either way the bits above the link layer are identical. Both need
//! `CAP_NET_RAW`.

use std::io;
use std::mem;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use super::iface::IfData;
use crate::MAX_DATAGRAM;

/// Ethernet II header size.
pub const ETH_HEADER_LEN: usize = 14;
/// IPv4 header size (no options are ever emitted).
pub const IPV4_HEADER_LEN: usize = 20;
/// UDP header size.
pub const UDP_HEADER_LEN: usize = 8;
/// EtherType for IPv4.
pub const ETHERTYPE_IPV4: u16 = 0x0800;
/// All-ones destination for subnet broadcasts.
pub const MAC_BROADCAST: [u8; 6] = [0xFF; 6];

/// TTL on re-injected packets.
const IPV4_TTL: u8 = 64;
/// Don't-fragment, offset zero.
const IPV4_FLAGS_DF: u16 = 0x4000;
/// IP protocol number for UDP.
const IPPROTO_UDP: u8 = 17;

/// Scratch size covering the largest frame the relay can produce.
const BUILD_BUF_LEN: usize = ETH_HEADER_LEN + IPV4_HEADER_LEN + UDP_HEADER_LEN + MAX_DATAGRAM;

/// Packet construction failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildError {
    /// Output buffer cannot hold the assembled packet.
    BufferTooSmall,
}

impl std::fmt::Display for BuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BufferTooSmall => write!(f, "buffer too small for packet"),
        }
    }
}

impl std::error::Error for BuildError {}

// ===== RFC 1071 checksum =====

/// One's-complement sum of `data`, accumulated into `sum`.
///
/// Bytes are paired big-endian; an odd trailing byte is padded with zero.
pub fn checksum_add(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u32::from(u16::from_be_bytes([pair[0], pair[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    sum
}

/// Fold the accumulator to 16 bits and take the complement.
pub fn checksum_finish(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Internet checksum over one buffer.
pub fn checksum(data: &[u8]) -> u16 {
    checksum_finish(checksum_add(0, data))
}

// ===== Header encoders =====

/// Assemble IPv4 + UDP + payload into `buf`, returning the total length.
///
/// ```text
/// +----------------+----------------+---------------------+
/// |  IPv4 (20 B)   |   UDP (8 B)    |       payload       |
/// +----------------+----------------+---------------------+
/// ```
///
/// The IPv4 identification field gets a fresh pseudo-random value per
/// packet; the UDP checksum is computed over the usual pseudo-header.
pub fn build_ipv4_udp(
    buf: &mut [u8],
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Result<usize, BuildError> {
    let total_len = IPV4_HEADER_LEN + UDP_HEADER_LEN + payload.len();
    if buf.len() < total_len || total_len > u16::MAX as usize {
        return Err(BuildError::BufferTooSmall);
    }

    // IPv4 header
    buf[0] = 0x45; // version 4, 5 words
    buf[1] = 0; // TOS
    buf[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    buf[4..6].copy_from_slice(&fastrand::u16(..).to_be_bytes());
    buf[6..8].copy_from_slice(&IPV4_FLAGS_DF.to_be_bytes());
    buf[8] = IPV4_TTL;
    buf[9] = IPPROTO_UDP;
    buf[10..12].fill(0); // checksum placeholder
    buf[12..16].copy_from_slice(&src_ip.octets());
    buf[16..20].copy_from_slice(&dst_ip.octets());
    let ip_csum = checksum(&buf[..IPV4_HEADER_LEN]);
    buf[10..12].copy_from_slice(&ip_csum.to_be_bytes());

    // UDP header + payload
    let udp = &mut buf[IPV4_HEADER_LEN..total_len];
    let udp_len = (UDP_HEADER_LEN + payload.len()) as u16;
    udp[0..2].copy_from_slice(&src_port.to_be_bytes());
    udp[2..4].copy_from_slice(&dst_port.to_be_bytes());
    udp[4..6].copy_from_slice(&udp_len.to_be_bytes());
    udp[6..8].fill(0); // checksum placeholder
    udp[UDP_HEADER_LEN..].copy_from_slice(payload);

    let udp_csum = udp_checksum(src_ip, dst_ip, udp);
    udp[6..8].copy_from_slice(&udp_csum.to_be_bytes());

    Ok(total_len)
}

/// Assemble a complete Ethernet broadcast frame into `buf`.
///
/// Destination is the broadcast MAC, source the EPICS interface's own
/// hardware address; everything above the link layer comes from
/// [`build_ipv4_udp`].
pub fn build_ethernet_frame(
    buf: &mut [u8],
    src_mac: &[u8; 6],
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Result<usize, BuildError> {
    if buf.len() < ETH_HEADER_LEN {
        return Err(BuildError::BufferTooSmall);
    }
    buf[0..6].copy_from_slice(&MAC_BROADCAST);
    buf[6..12].copy_from_slice(src_mac);
    buf[12..14].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());

    let inner_len = build_ipv4_udp(
        &mut buf[ETH_HEADER_LEN..],
        src_ip,
        dst_ip,
        src_port,
        dst_port,
        payload,
    )?;
    Ok(ETH_HEADER_LEN + inner_len)
}

/// UDP checksum over the IPv4 pseudo-header and the full UDP segment.
///
/// A computed value of zero is transmitted as `0xFFFF` per RFC 768 (zero on
/// the wire means "no checksum").
fn udp_checksum(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, udp: &[u8]) -> u16 {
    let mut sum = 0u32;
    sum = checksum_add(sum, &src_ip.octets());
    sum = checksum_add(sum, &dst_ip.octets());
    sum += u32::from(IPPROTO_UDP);
    sum += udp.len() as u32;
    sum = checksum_add(sum, udp);
    match checksum_finish(sum) {
        0 => 0xFFFF,
        c => c,
    }
}

// ===== Link-layer senders =====

/// One packet injection per relayed frame.
///
/// Implementations own their socket and scratch buffer; dropping the sender
/// releases the raw socket.
pub trait LinkSender {
    /// Build the broadcast packet and put it on the wire.
    fn build_and_send(
        &mut self,
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
        payload: &[u8],
    ) -> io::Result<usize>;

    /// Short human-readable mode name for logs.
    fn mode(&self) -> &'static str;
}

/// `AF_PACKET` sender: full Ethernet frame addressed to the broadcast MAC.
pub struct PacketSender {
    fd: OwnedFd,
    addr: libc::sockaddr_ll,
    src_mac: [u8; 6],
    buf: [u8; BUILD_BUF_LEN],
}

impl PacketSender {
    /// Open a packet socket bound for sends on `iface`.
    ///
    /// Fails without `CAP_NET_RAW` or when the interface carries no
    /// hardware address.
    pub fn open(iface: &IfData) -> io::Result<Self> {
        let src_mac = iface.hwaddr.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::Unsupported,
                format!("interface {} has no hardware address", iface.name),
            )
        })?;

        // Protocol 0: the socket never receives, it only injects.
        // SAFETY: plain socket(2) call; the fd is checked before wrapping.
        let fd = unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_RAW, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: freshly created fd, exclusively owned.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        // SAFETY: sockaddr_ll is plain-old-data; zero is a valid initial state.
        let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as libc::sa_family_t;
        addr.sll_protocol = (ETHERTYPE_IPV4).to_be();
        addr.sll_ifindex = iface.index;
        addr.sll_halen = 6;
        addr.sll_addr[..6].copy_from_slice(&MAC_BROADCAST);

        Ok(Self {
            fd,
            addr,
            src_mac,
            buf: [0u8; BUILD_BUF_LEN],
        })
    }
}

impl LinkSender for PacketSender {
    fn build_and_send(
        &mut self,
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
        payload: &[u8],
    ) -> io::Result<usize> {
        let len = build_ethernet_frame(
            &mut self.buf,
            &self.src_mac,
            src_ip,
            dst_ip,
            src_port,
            dst_port,
            payload,
        )
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        // SAFETY: buf holds len valid bytes and addr is a fully initialized
        // sockaddr_ll naming the bound interface.
        let sent = unsafe {
            libc::sendto(
                self.fd.as_raw_fd(),
                self.buf.as_ptr() as *const libc::c_void,
                len,
                0,
                &self.addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if sent < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(sent as usize)
    }

    fn mode(&self) -> &'static str {
        "link-layer"
    }
}

/// `IPPROTO_RAW` sender: IPv4 upwards, the kernel supplies the link layer.
///
/// Broadcast delivery still works because the destination address is the
/// subnet broadcast; the kernel resolves it to the broadcast MAC itself.
pub struct RawIpSender {
    fd: OwnedFd,
    buf: [u8; BUILD_BUF_LEN],
}

impl RawIpSender {
    pub fn open() -> io::Result<Self> {
        // IPPROTO_RAW implies IP_HDRINCL: the caller provides the IP header.
        // SAFETY: plain socket(2) call; the fd is checked before wrapping.
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_RAW, libc::IPPROTO_RAW) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: freshly created fd, exclusively owned.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        // Sends to a broadcast destination require SO_BROADCAST even here.
        let on: libc::c_int = 1;
        // SAFETY: setsockopt on a valid fd with a correctly sized option value.
        let res = unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_BROADCAST,
                &on as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if res != 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            fd,
            buf: [0u8; BUILD_BUF_LEN],
        })
    }
}

impl LinkSender for RawIpSender {
    fn build_and_send(
        &mut self,
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
        payload: &[u8],
    ) -> io::Result<usize> {
        let len = build_ipv4_udp(&mut self.buf, src_ip, dst_ip, src_port, dst_port, payload)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        // SAFETY: sockaddr_in is plain-old-data; zero is a valid initial state.
        let mut dst: libc::sockaddr_in = unsafe { mem::zeroed() };
        dst.sin_family = libc::AF_INET as libc::sa_family_t;
        dst.sin_addr.s_addr = u32::from(dst_ip).to_be();

        // SAFETY: buf holds len valid bytes and dst is a fully initialized
        // sockaddr_in.
        let sent = unsafe {
            libc::sendto(
                self.fd.as_raw_fd(),
                self.buf.as_ptr() as *const libc::c_void,
                len,
                0,
                &dst as *const libc::sockaddr_in as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if sent < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(sent as usize)
    }

    fn mode(&self) -> &'static str {
        "raw-ip"
    }
}

/// Open the best available sender for `iface`.
///
/// Prefers the full link-layer path; falls back to raw IPv4 when the packet
/// socket cannot be opened or the interface has no MAC.
pub fn open_link_sender(iface: &IfData) -> io::Result<Box<dyn LinkSender>> {
    match PacketSender::open(iface) {
        Ok(sender) => {
            log::info!("[ethernet] link-layer sender on {}", iface.name);
            Ok(Box::new(sender))
        }
        Err(e) => {
            log::warn!(
                "[ethernet] packet socket on {} unavailable ({}), falling back to raw IPv4",
                iface.name,
                e
            );
            let sender = RawIpSender::open()?;
            log::info!("[ethernet] raw-ip sender active");
            Ok(Box::new(sender))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_known_vector() {
        // Classic example header from RFC 1071 discussions.
        let header: [u8; 20] = [
            0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00, 0xc0, 0xa8,
            0x00, 0x01, 0xc0, 0xa8, 0x00, 0xc7,
        ];
        assert_eq!(checksum(&header), 0xb861);
    }

    #[test]
    fn test_checksum_odd_length() {
        // Trailing byte is padded with zero on the right.
        assert_eq!(checksum(&[0xFF]), checksum(&[0xFF, 0x00]));
    }

    #[test]
    fn test_ipv4_header_layout() {
        let mut buf = [0u8; 128];
        let src = Ipv4Addr::new(10, 0, 0, 7);
        let dst = Ipv4Addr::new(10, 69, 2, 255);
        let len =
            build_ipv4_udp(&mut buf, src, dst, 5065, 5064, b"payload!").expect("build should fit");

        assert_eq!(len, IPV4_HEADER_LEN + UDP_HEADER_LEN + 8);
        assert_eq!(buf[0], 0x45);
        assert_eq!(&buf[2..4], &(len as u16).to_be_bytes());
        assert_eq!(&buf[6..8], &[0x40, 0x00]); // DF, offset 0
        assert_eq!(buf[8], 64);
        assert_eq!(buf[9], 17);
        assert_eq!(&buf[12..16], &src.octets());
        assert_eq!(&buf[16..20], &dst.octets());
        // Header checksum self-verifies: summing the full header yields zero.
        assert_eq!(checksum(&buf[..IPV4_HEADER_LEN]), 0);
    }

    #[test]
    fn test_udp_header_and_checksum() {
        let mut buf = [0u8; 128];
        let src = Ipv4Addr::new(10, 0, 0, 7);
        let dst = Ipv4Addr::new(10, 69, 2, 255);
        let len = build_ipv4_udp(&mut buf, src, dst, 5065, 5064, b"CA").expect("build should fit");

        let udp = &buf[IPV4_HEADER_LEN..len];
        assert_eq!(&udp[0..2], &5065u16.to_be_bytes());
        assert_eq!(&udp[2..4], &5064u16.to_be_bytes());
        assert_eq!(&udp[4..6], &((UDP_HEADER_LEN + 2) as u16).to_be_bytes());
        assert_eq!(&udp[UDP_HEADER_LEN..], b"CA");

        // Re-summing the segment with the stored checksum yields zero.
        let mut sum = 0u32;
        sum = checksum_add(sum, &src.octets());
        sum = checksum_add(sum, &dst.octets());
        sum += u32::from(IPPROTO_UDP);
        sum += udp.len() as u32;
        sum = checksum_add(sum, udp);
        assert_eq!(checksum_finish(sum), 0);
    }

    #[test]
    fn test_ethernet_frame_layout() {
        let mut buf = [0u8; 256];
        let mac = [0x02, 0x00, 0x00, 0xAA, 0xBB, 0xCC];
        let len = build_ethernet_frame(
            &mut buf,
            &mac,
            Ipv4Addr::new(10, 0, 0, 7),
            Ipv4Addr::new(10, 69, 2, 255),
            5065,
            5064,
            &[0u8; 16],
        )
        .expect("build should fit");

        assert_eq!(len, ETH_HEADER_LEN + IPV4_HEADER_LEN + UDP_HEADER_LEN + 16);
        assert_eq!(&buf[0..6], &MAC_BROADCAST);
        assert_eq!(&buf[6..12], &mac);
        assert_eq!(&buf[12..14], &[0x08, 0x00]);
        assert_eq!(buf[ETH_HEADER_LEN], 0x45);
    }

    #[test]
    fn test_build_rejects_small_buffer() {
        let mut buf = [0u8; 16];
        let err = build_ipv4_udp(
            &mut buf,
            Ipv4Addr::LOCALHOST,
            Ipv4Addr::LOCALHOST,
            1,
            2,
            &[0u8; 64],
        )
        .expect_err("must not fit");
        assert_eq!(err, BuildError::BufferTooSmall);
    }
}
