// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! IPv4 interface probing.
//!
//! Both daemons resolve their interfaces exactly once at startup through
//! the `SIOCGIF*` ioctls; the resulting [`IfData`] is immutable for the
//! process lifetime. The hardware address and interface index are only
//! needed by the emitter's link-layer sender and may legitimately be absent
//! (point-to-point links carry no MAC).

use std::io;
use std::mem::MaybeUninit;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

/// Ethernet hardware family reported by SIOCGIFHWADDR.
const ARPHRD_ETHER: libc::c_ushort = 1;

/// Resolved IPv4 facts about one network interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfData {
    pub name: String,
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub broadcast: Ipv4Addr,
    /// Ethernet MAC, `None` on interfaces without one.
    pub hwaddr: Option<[u8; 6]>,
    /// Kernel interface index, used to address `AF_PACKET` sends.
    pub index: i32,
}

impl IfData {
    /// Probe a named interface.
    ///
    /// Address and netmask must be assigned; a missing broadcast address is
    /// derived from them (the kernel reports none on loopback and
    /// point-to-point links).
    pub fn probe(name: &str) -> io::Result<Self> {
        let sock = inet_dgram_socket()?;
        let mut ifr = ifreq_for(name)?;

        let address = ioctl_ipv4(&sock, &mut ifr, libc::SIOCGIFADDR)?;
        let netmask = ioctl_ipv4(&sock, &mut ifr, libc::SIOCGIFNETMASK)?;
        let broadcast = match ioctl_ipv4(&sock, &mut ifr, libc::SIOCGIFBRDADDR) {
            Ok(addr) if !addr.is_unspecified() => addr,
            _ => derive_broadcast(address, netmask),
        };
        let hwaddr = ioctl_hwaddr(&sock, &mut ifr);
        let index = ioctl_index(&sock, &mut ifr)?;

        log::debug!(
            "[iface] {}: addr={} mask={} bcast={} hw={} index={}",
            name,
            address,
            netmask,
            broadcast,
            hwaddr.map_or_else(|| "none".to_string(), |mac| format_mac(&mac)),
            index
        );

        Ok(Self {
            name: name.to_string(),
            address,
            netmask,
            broadcast,
            hwaddr,
            index,
        })
    }

    /// True when `ip` lies in this interface's subnet.
    ///
    /// The collector uses this to ignore datagrams that did not originate
    /// on the EPICS subnet; the emitter uses it to refuse re-broadcasting a
    /// frame back onto the subnet that produced it.
    #[must_use]
    pub fn is_native(&self, ip: Ipv4Addr) -> bool {
        let mask = u32::from(self.netmask);
        u32::from(ip) & mask == u32::from(self.address) & mask
    }
}

/// Name of the first non-loopback IPv4 interface.
///
/// Fallback when the configuration omits an interface name.
pub fn default_interface_name() -> io::Result<String> {
    let interfaces = local_ip_address::list_afinet_netifas()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

    for (name, ip) in interfaces {
        if let std::net::IpAddr::V4(ipv4) = ip {
            if !ipv4.is_loopback() {
                log::debug!("[iface] default interface: {} ({})", name, ipv4);
                return Ok(name);
            }
        }
    }

    Err(io::Error::new(
        io::ErrorKind::NotFound,
        "no non-loopback IPv4 interface found",
    ))
}

/// `aa:bb:cc:dd:ee:ff` rendering for logs.
pub fn format_mac(mac: &[u8; 6]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

// ===== ioctl helpers =====

fn inet_dgram_socket() -> io::Result<OwnedFd> {
    // SAFETY: plain socket(2) call; the fd is checked before being wrapped.
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fd is a freshly created, valid descriptor owned by nobody else.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn ifreq_for(name: &str) -> io::Result<libc::ifreq> {
    if name.is_empty() || name.len() >= libc::IF_NAMESIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid interface name {:?}", name),
        ));
    }
    // SAFETY: an all-zero ifreq is a valid initial value for every request.
    let mut ifr = unsafe { MaybeUninit::<libc::ifreq>::zeroed().assume_init() };
    for (i, byte) in name.as_bytes().iter().enumerate() {
        ifr.ifr_name[i] = *byte as libc::c_char;
    }
    Ok(ifr)
}

fn ifreq_ioctl(sock: &OwnedFd, ifr: &mut libc::ifreq, cmd: libc::c_ulong) -> io::Result<()> {
    // SAFETY: sock is a valid fd and ifr a properly initialized ifreq for
    // the duration of the call.
    let res = unsafe { libc::ioctl(sock.as_raw_fd(), cmd as _, ifr as *mut libc::ifreq) };
    if res == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn ioctl_ipv4(sock: &OwnedFd, ifr: &mut libc::ifreq, cmd: libc::c_ulong) -> io::Result<Ipv4Addr> {
    ifreq_ioctl(sock, ifr, cmd)?;
    // SAFETY: after a successful SIOCGIF{ADDR,NETMASK,BRDADDR} the union
    // holds a sockaddr; AF_INET is verified before reinterpreting it as
    // sockaddr_in.
    unsafe {
        let sa = &ifr.ifr_ifru.ifru_addr;
        if sa.sa_family != libc::AF_INET as libc::sa_family_t {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "interface address is not IPv4",
            ));
        }
        let sin = &*(sa as *const libc::sockaddr as *const libc::sockaddr_in);
        Ok(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)))
    }
}

fn ioctl_hwaddr(sock: &OwnedFd, ifr: &mut libc::ifreq) -> Option<[u8; 6]> {
    if ifreq_ioctl(sock, ifr, libc::SIOCGIFHWADDR).is_err() {
        return None;
    }
    // SAFETY: after a successful SIOCGIFHWADDR the union holds a sockaddr
    // whose sa_data carries the hardware address.
    unsafe {
        let sa = &ifr.ifr_ifru.ifru_hwaddr;
        if sa.sa_family != ARPHRD_ETHER {
            return None;
        }
        let mut mac = [0u8; 6];
        for (i, b) in sa.sa_data[..6].iter().enumerate() {
            mac[i] = *b as u8;
        }
        Some(mac)
    }
}

fn ioctl_index(sock: &OwnedFd, ifr: &mut libc::ifreq) -> io::Result<i32> {
    ifreq_ioctl(sock, ifr, libc::SIOCGIFINDEX)?;
    // SAFETY: after a successful SIOCGIFINDEX the union holds the index.
    Ok(unsafe { ifr.ifr_ifru.ifru_ifindex })
}

fn derive_broadcast(address: Ipv4Addr, netmask: Ipv4Addr) -> Ipv4Addr {
    let mask = u32::from(netmask);
    Ipv4Addr::from((u32::from(address) & mask) | !mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(address: [u8; 4], netmask: [u8; 4]) -> IfData {
        let address = Ipv4Addr::from(address);
        let netmask = Ipv4Addr::from(netmask);
        IfData {
            name: "test0".to_string(),
            address,
            netmask,
            broadcast: derive_broadcast(address, netmask),
            hwaddr: None,
            index: 1,
        }
    }

    #[test]
    fn test_is_native_same_subnet() {
        let ifd = iface([10, 0, 0, 1], [255, 255, 255, 0]);
        assert!(ifd.is_native(Ipv4Addr::new(10, 0, 0, 50)));
        assert!(ifd.is_native(Ipv4Addr::new(10, 0, 0, 255)));
    }

    #[test]
    fn test_is_native_other_subnet() {
        let ifd = iface([10, 0, 0, 1], [255, 255, 255, 0]);
        assert!(!ifd.is_native(Ipv4Addr::new(10, 0, 1, 50)));
        assert!(!ifd.is_native(Ipv4Addr::new(192, 168, 1, 1)));
    }

    #[test]
    fn test_is_native_wide_mask() {
        let ifd = iface([172, 16, 4, 9], [255, 255, 0, 0]);
        assert!(ifd.is_native(Ipv4Addr::new(172, 16, 200, 1)));
        assert!(!ifd.is_native(Ipv4Addr::new(172, 17, 0, 1)));
    }

    #[test]
    fn test_derive_broadcast() {
        assert_eq!(
            derive_broadcast(Ipv4Addr::new(10, 69, 2, 38), Ipv4Addr::new(255, 255, 255, 0)),
            Ipv4Addr::new(10, 69, 2, 255)
        );
        assert_eq!(
            derive_broadcast(Ipv4Addr::new(172, 16, 4, 9), Ipv4Addr::new(255, 255, 0, 0)),
            Ipv4Addr::new(172, 16, 255, 255)
        );
    }

    #[test]
    fn test_format_mac() {
        assert_eq!(
            format_mac(&[0x00, 0x1B, 0x21, 0xAB, 0xCD, 0xEF]),
            "00:1b:21:ab:cd:ef"
        );
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_probe_loopback() {
        let lo = IfData::probe("lo").expect("loopback should probe");
        assert!(lo.address.is_loopback());
        assert!(lo.index > 0);
        assert_eq!(lo.hwaddr, None);
    }

    #[test]
    fn test_probe_rejects_bad_name() {
        assert!(IfData::probe("").is_err());
        assert!(IfData::probe("a-name-way-longer-than-ifnamsiz-allows").is_err());
    }
}
