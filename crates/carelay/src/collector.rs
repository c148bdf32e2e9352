// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Collector daemon: EPICS subnet in, framed unicast out.
//!
//! ```text
//! poll(1s tick) -> recv_from(bcast :5064/:5065/:5076)
//!                      v
//!             native-subnet check -> drop foreign sources
//!                      v
//!             rewrite_datagram()  -> drop fully-filtered datagrams
//!                      v
//!             frame header + CA bytes -> send_to(every emitter :4000)
//! ```
//!
//! Single-threaded: one `mio` poll multiplexes the three broadcast
//! listeners, the scratch buffers are reused every iteration, and fan-out
//! happens inline over non-blocking sockets so one slow peer cannot stall
//! the others. Ready listeners are drained round-robin, one datagram at a
//! time, so a chatty name server cannot starve the beacon port.

use std::io;
use std::net::{SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use mio::{Events, Interest, Poll, Token};

use crate::config::CollectorParams;
use crate::epics::rewrite_datagram;
use crate::filter::PvFilter;
use crate::net::iface::IfData;
use crate::net::socket::bind_udp;
use crate::proto::{FrameHeader, FRAME_HEADER_LEN};
use crate::MAX_DATAGRAM;

/// CA broadcast ports the collector listens on: name server, beacons,
/// repeater.
pub const LISTEN_PORTS: [u16; 3] = [5064, 5065, 5076];

/// Poll timeout; doubles as the liveness tick.
const TICK: Duration = Duration::from_secs(1);

/// Largest CA payload that still fits a frame.
const MAX_PAYLOAD: usize = MAX_DATAGRAM - FRAME_HEADER_LEN;

/// Collector counters, readable after the loop exits.
#[derive(Debug, Default)]
pub struct CollectorMetrics {
    /// Datagrams received on any listen port.
    pub received: AtomicU64,
    /// Frames fanned out (counted once per datagram, not per peer).
    pub relayed: AtomicU64,
    /// Datagrams from outside the EPICS subnet.
    pub dropped_foreign: AtomicU64,
    /// Datagrams suppressed by the PV filter or unparseable.
    pub dropped_filtered: AtomicU64,
    /// Individual per-peer send failures.
    pub send_errors: AtomicU64,
}

impl CollectorMetrics {
    /// (received, relayed, dropped_foreign, dropped_filtered, send_errors)
    pub fn snapshot(&self) -> (u64, u64, u64, u64, u64) {
        (
            self.received.load(Ordering::Relaxed),
            self.relayed.load(Ordering::Relaxed),
            self.dropped_foreign.load(Ordering::Relaxed),
            self.dropped_filtered.load(Ordering::Relaxed),
            self.send_errors.load(Ordering::Relaxed),
        )
    }
}

/// The collecting daemon.
pub struct Collector {
    listeners: Vec<mio::net::UdpSocket>,
    peers: Vec<(SocketAddrV4, UdpSocket)>,
    iface_epics: IfData,
    filter: PvFilter,
    poll: Poll,
    events: Events,
    recv_buf: [u8; MAX_PAYLOAD],
    frame_buf: [u8; MAX_DATAGRAM],
    pub metrics: CollectorMetrics,
}

impl Collector {
    /// Bind every socket and register the listeners with the poller.
    ///
    /// Listeners bind the EPICS interface's broadcast address with
    /// `SO_REUSEADDR | SO_BROADCAST` so ordinary CA tools keep working on
    /// the same host; each peer gets its own outbound socket bound to the
    /// routed-side interface on an ephemeral port.
    pub fn new(params: CollectorParams) -> io::Result<Self> {
        let CollectorParams {
            iface,
            iface_epics,
            peers,
            filter,
        } = params;

        let poll = Poll::new()?;
        let mut listeners = Vec::with_capacity(LISTEN_PORTS.len());
        for (i, port) in LISTEN_PORTS.iter().enumerate() {
            let socket = bind_udp(iface_epics.broadcast, *port, true)?;
            let mut socket = mio::net::UdpSocket::from_std(socket);
            poll.registry()
                .register(&mut socket, Token(i), Interest::READABLE)?;
            listeners.push(socket);
            log::info!(
                "[collector] listening on {}:{} ({})",
                iface_epics.broadcast,
                port,
                iface_epics.name
            );
        }

        let peers = peers
            .into_iter()
            .map(|addr| {
                let socket = bind_udp(iface.address, 0, false)?;
                log::info!("[collector] emitter peer {}", addr);
                Ok((addr, socket))
            })
            .collect::<io::Result<Vec<_>>>()?;

        log::info!(
            "[collector] filter: {} rule(s), sense={}, logic={}",
            filter.len(),
            filter.sense,
            if filter.logic { "and" } else { "or" }
        );

        Ok(Self {
            listeners,
            peers,
            iface_epics,
            filter,
            poll,
            events: Events::with_capacity(8),
            recv_buf: [0u8; MAX_PAYLOAD],
            frame_buf: [0u8; MAX_DATAGRAM],
            metrics: CollectorMetrics::default(),
        })
    }

    /// Run until `running` is cleared.
    pub fn run(&mut self, running: &AtomicBool) {
        log::info!("[collector] running");
        let mut ready = vec![false; self.listeners.len()];

        while running.load(Ordering::Relaxed) {
            if let Err(e) = self.poll.poll(&mut self.events, Some(TICK)) {
                if e.kind() != io::ErrorKind::Interrupted {
                    log::error!("[collector] poll error: {}", e);
                }
                continue;
            }

            for event in self.events.iter() {
                if let Some(flag) = ready.get_mut(event.token().0) {
                    *flag = true;
                }
            }

            // The poll is edge-triggered, so every ready listener must be
            // drained before the next poll. One datagram per listener per
            // pass keeps the ports fair against each other.
            loop {
                let mut progressed = false;
                for idx in 0..self.listeners.len() {
                    if !ready[idx] {
                        continue;
                    }
                    match self.listeners[idx].recv_from(&mut self.recv_buf) {
                        Ok((len, SocketAddr::V4(src))) => {
                            self.relay_one(idx, len, src);
                            progressed = true;
                        }
                        Ok((_, SocketAddr::V6(src))) => {
                            log::debug!("[collector] ignoring IPv6 source {}", src);
                            progressed = true;
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            ready[idx] = false;
                        }
                        Err(e) => {
                            log::error!(
                                "[collector] recv on port {} failed: {}",
                                LISTEN_PORTS[idx],
                                e
                            );
                            ready[idx] = false;
                        }
                    }
                }
                if !progressed {
                    break;
                }
            }
        }

        let (received, relayed, foreign, filtered, send_errors) = self.metrics.snapshot();
        log::info!(
            "[collector] stopped: received={} relayed={} dropped_foreign={} dropped_filtered={} send_errors={}",
            received,
            relayed,
            foreign,
            filtered,
            send_errors
        );
    }

    /// Filter, frame and fan out one received datagram.
    fn relay_one(&mut self, idx: usize, len: usize, src: SocketAddrV4) {
        self.metrics.received.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "[collector] recv {} bytes from {} on port {}",
            len,
            src,
            LISTEN_PORTS[idx]
        );

        if !self.iface_epics.is_native(*src.ip()) {
            log::debug!("[collector] non-native source {}, skipping", src.ip());
            self.metrics.dropped_foreign.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let summary = rewrite_datagram(
            &self.recv_buf[..len],
            &mut self.frame_buf[FRAME_HEADER_LEN..],
            &self.filter,
        );
        if summary.len == 0 {
            log::debug!("[collector] nothing to relay from {}", src);
            self.metrics
                .dropped_filtered
                .fetch_add(1, Ordering::Relaxed);
            return;
        }

        let header = FrameHeader {
            payload_len: summary.len as u16,
            src_ip: *src.ip(),
            dst_ip: self.iface_epics.broadcast,
            src_port: src.port(),
            dst_port: LISTEN_PORTS[idx],
        };
        header.encode(&mut self.frame_buf);
        let total = FRAME_HEADER_LEN + summary.len;

        for (addr, socket) in &self.peers {
            match socket.send_to(&self.frame_buf[..total], addr) {
                Ok(sent) => {
                    log::debug!("[collector] sent {} bytes to {}", sent, addr);
                }
                Err(e) => {
                    log::error!("[collector] send to {} failed: {}", addr, e);
                    self.metrics.send_errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        self.metrics.relayed.fetch_add(1, Ordering::Relaxed);
    }
}
