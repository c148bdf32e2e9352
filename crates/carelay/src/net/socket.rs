// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! UDP socket construction.
//!
//! Every socket the relay owns is built here: `SO_REUSEADDR` is always set
//! (several EPICS tools share the CA ports on one host), `SO_BROADCAST`
//! only where broadcast reception/transmission is required, and everything
//! is non-blocking because both daemons are single-threaded poll loops and
//! a blocked send to one emitter must not stall fan-out to the others.

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};

use socket2::{Domain, Protocol, Socket, Type};

/// Bind a non-blocking UDP socket to `addr:port`.
pub fn bind_udp(addr: Ipv4Addr, port: u16, broadcast: bool) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    if broadcast {
        socket.set_broadcast(true)?;
    }

    let bind_addr = SocketAddrV4::new(addr, port);
    socket.bind(&bind_addr.into())?;

    let socket: UdpSocket = socket.into();
    socket.set_nonblocking(true)?;

    log::debug!(
        "[socket] bound udp {} broadcast={}",
        socket
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| bind_addr.to_string()),
        broadcast
    );
    Ok(socket)
}
