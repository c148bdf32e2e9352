// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Emitter daemon: framed unicast in, EPICS broadcast out.
//!
//! ```text
//! poll(1s tick) -> recv_from(:4000)
//!                      v
//!              frame decode       -> drop bad magic / truncated
//!                      v
//!              loop prevention    -> drop src_ip native to our subnet
//!                      v
//!              build_and_send()   -> forged-source broadcast on the wire
//! ```
//!
//! The re-injected packet carries the original broadcaster's IP as its
//! source and the local EPICS subnet broadcast as its destination, so CA
//! clients and servers behind this emitter answer the true originator
//! directly over routed unicast.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use mio::{Events, Interest, Poll, Token};

use crate::config::EmitterParams;
use crate::net::ethernet::{open_link_sender, LinkSender};
use crate::net::iface::IfData;
use crate::net::socket::bind_udp;
use crate::proto::{FrameHeader, FRAME_PORT};
use crate::MAX_DATAGRAM;

/// Poll timeout; doubles as the liveness tick.
const TICK: Duration = Duration::from_secs(1);

const FRAME_SOCKET: Token = Token(0);

/// Emitter counters, readable after the loop exits.
#[derive(Debug, Default)]
pub struct EmitterMetrics {
    /// Frames received on the frame port.
    pub received: AtomicU64,
    /// Broadcasts put on the EPICS subnet.
    pub emitted: AtomicU64,
    /// Frames failing magic/version/length validation.
    pub dropped_invalid: AtomicU64,
    /// Frames whose source is already native to this subnet.
    pub dropped_native: AtomicU64,
    /// Raw-socket send failures.
    pub send_errors: AtomicU64,
}

impl EmitterMetrics {
    /// (received, emitted, dropped_invalid, dropped_native, send_errors)
    pub fn snapshot(&self) -> (u64, u64, u64, u64, u64) {
        (
            self.received.load(Ordering::Relaxed),
            self.emitted.load(Ordering::Relaxed),
            self.dropped_invalid.load(Ordering::Relaxed),
            self.dropped_native.load(Ordering::Relaxed),
            self.send_errors.load(Ordering::Relaxed),
        )
    }
}

/// The emitting daemon.
pub struct Emitter {
    socket: mio::net::UdpSocket,
    iface_epics: IfData,
    sender: Box<dyn LinkSender>,
    poll: Poll,
    events: Events,
    buf: [u8; MAX_DATAGRAM],
    pub metrics: EmitterMetrics,
}

impl Emitter {
    /// Bind the frame socket and acquire a link-layer sender.
    ///
    /// Needs `CAP_NET_RAW`; this is the step that fails without it.
    pub fn new(params: EmitterParams) -> io::Result<Self> {
        let EmitterParams { iface, iface_epics } = params;

        let socket = bind_udp(iface.address, FRAME_PORT, false)?;
        let mut socket = mio::net::UdpSocket::from_std(socket);
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut socket, FRAME_SOCKET, Interest::READABLE)?;
        log::info!(
            "[emitter] listening on {}:{} ({})",
            iface.address,
            FRAME_PORT,
            iface.name
        );

        let sender = open_link_sender(&iface_epics)?;
        log::info!(
            "[emitter] re-broadcasting to {} via {} ({} mode)",
            iface_epics.broadcast,
            iface_epics.name,
            sender.mode()
        );

        Ok(Self {
            socket,
            iface_epics,
            sender,
            poll,
            events: Events::with_capacity(8),
            buf: [0u8; MAX_DATAGRAM],
            metrics: EmitterMetrics::default(),
        })
    }

    /// Run until `running` is cleared.
    pub fn run(&mut self, running: &AtomicBool) {
        log::info!("[emitter] running");

        while running.load(Ordering::Relaxed) {
            if let Err(e) = self.poll.poll(&mut self.events, Some(TICK)) {
                if e.kind() != io::ErrorKind::Interrupted {
                    log::error!("[emitter] poll error: {}", e);
                }
                continue;
            }

            if self.events.is_empty() {
                continue;
            }

            // Edge-triggered poll: drain everything that is queued.
            loop {
                match self.socket.recv_from(&mut self.buf) {
                    Ok((len, src)) => {
                        log::debug!("[emitter] recv {} bytes from {}", len, src);
                        self.emit_one(len);
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        log::error!("[emitter] recv failed: {}", e);
                        break;
                    }
                }
            }
        }

        let (received, emitted, invalid, native, send_errors) = self.metrics.snapshot();
        log::info!(
            "[emitter] stopped: received={} emitted={} dropped_invalid={} dropped_native={} send_errors={}",
            received,
            emitted,
            invalid,
            native,
            send_errors
        );
    }

    /// Validate one frame and put its payload back on the air.
    fn emit_one(&mut self, len: usize) {
        self.metrics.received.fetch_add(1, Ordering::Relaxed);

        let (header, payload) = match FrameHeader::decode(&self.buf[..len]) {
            Ok(decoded) => decoded,
            Err(e) => {
                log::warn!("[emitter] rejecting frame: {}", e);
                self.metrics.dropped_invalid.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        // A frame whose original sender sits on our own subnet has looped
        // back; re-broadcasting it would echo forever between relays.
        if self.iface_epics.is_native(header.src_ip) {
            log::debug!("[emitter] native source {}, skipping", header.src_ip);
            self.metrics.dropped_native.fetch_add(1, Ordering::Relaxed);
            return;
        }

        match self.sender.build_and_send(
            header.src_ip,
            self.iface_epics.broadcast,
            header.src_port,
            header.dst_port,
            payload,
        ) {
            Ok(sent) => {
                log::debug!(
                    "[emitter] broadcast {} bytes as {}:{} -> {}:{}",
                    sent,
                    header.src_ip,
                    header.src_port,
                    self.iface_epics.broadcast,
                    header.dst_port
                );
                self.metrics.emitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                log::error!("[emitter] broadcast failed: {}", e);
                self.metrics.send_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{FrameHeader, FRAME_HEADER_LEN};
    use std::net::Ipv4Addr;

    use std::cell::RefCell;
    use std::rc::Rc;

    type Sent = Rc<RefCell<Vec<(Ipv4Addr, Ipv4Addr, u16, u16, Vec<u8>)>>>;

    /// Sender double recording what the emitter asked for.
    #[derive(Clone, Default)]
    struct RecordingSender {
        sent: Sent,
        fail: bool,
    }

    impl LinkSender for RecordingSender {
        fn build_and_send(
            &mut self,
            src_ip: Ipv4Addr,
            dst_ip: Ipv4Addr,
            src_port: u16,
            dst_port: u16,
            payload: &[u8],
        ) -> io::Result<usize> {
            if self.fail {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "nope"));
            }
            self.sent
                .borrow_mut()
                .push((src_ip, dst_ip, src_port, dst_port, payload.to_vec()));
            Ok(payload.len())
        }

        fn mode(&self) -> &'static str {
            "recording"
        }
    }

    fn test_emitter(sender: RecordingSender) -> Emitter {
        let iface = IfData {
            name: "lo".to_string(),
            address: Ipv4Addr::new(127, 0, 0, 1),
            netmask: Ipv4Addr::new(255, 0, 0, 0),
            broadcast: Ipv4Addr::new(127, 255, 255, 255),
            hwaddr: None,
            index: 1,
        };
        let iface_epics = IfData {
            name: "epics0".to_string(),
            address: Ipv4Addr::new(10, 69, 2, 1),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            broadcast: Ipv4Addr::new(10, 69, 2, 255),
            hwaddr: Some([0x02, 0, 0, 0xAA, 0xBB, 0xCC]),
            index: 2,
        };

        let socket = bind_udp(iface.address, 0, false).expect("bind");
        let mut socket = mio::net::UdpSocket::from_std(socket);
        let poll = Poll::new().expect("poll");
        poll.registry()
            .register(&mut socket, FRAME_SOCKET, Interest::READABLE)
            .expect("register");

        Emitter {
            socket,
            iface_epics,
            sender: Box::new(sender),
            poll,
            events: Events::with_capacity(8),
            buf: [0u8; MAX_DATAGRAM],
            metrics: EmitterMetrics::default(),
        }
    }

    fn load_frame(emitter: &mut Emitter, header: &FrameHeader, payload: &[u8]) -> usize {
        header.encode(&mut emitter.buf);
        emitter.buf[FRAME_HEADER_LEN..FRAME_HEADER_LEN + payload.len()].copy_from_slice(payload);
        FRAME_HEADER_LEN + payload.len()
    }

    #[test]
    fn test_emit_one_forges_source() {
        let sender = RecordingSender::default();
        let sent = Rc::clone(&sender.sent);
        let mut emitter = test_emitter(sender);
        let header = FrameHeader {
            payload_len: 16,
            src_ip: Ipv4Addr::new(10, 0, 0, 7),
            dst_ip: Ipv4Addr::new(10, 0, 0, 255),
            src_port: 5065,
            dst_port: 5064,
        };
        let len = load_frame(&mut emitter, &header, &[0xAB; 16]);
        emitter.emit_one(len);

        let sent = sent.borrow();
        assert_eq!(sent.len(), 1);
        let (src_ip, dst_ip, src_port, dst_port, payload) = &sent[0];
        assert_eq!(*src_ip, Ipv4Addr::new(10, 0, 0, 7));
        // Destination is OUR broadcast, not the collector side's.
        assert_eq!(*dst_ip, Ipv4Addr::new(10, 69, 2, 255));
        assert_eq!(*src_port, 5065);
        assert_eq!(*dst_port, 5064);
        assert_eq!(payload.as_slice(), &[0xAB; 16]);

        let (_, emitted, ..) = emitter.metrics.snapshot();
        assert_eq!(emitted, 1);
    }

    #[test]
    fn test_emit_one_rejects_bad_magic() {
        let sender = RecordingSender::default();
        let sent = Rc::clone(&sender.sent);
        let mut emitter = test_emitter(sender);
        let header = FrameHeader {
            payload_len: 16,
            src_ip: Ipv4Addr::new(10, 0, 0, 7),
            dst_ip: Ipv4Addr::new(10, 0, 0, 255),
            src_port: 5065,
            dst_port: 5064,
        };
        let len = load_frame(&mut emitter, &header, &[0u8; 16]);
        emitter.buf[0] = 0x00;
        emitter.emit_one(len);

        assert!(sent.borrow().is_empty());
        let (_, _, invalid, ..) = emitter.metrics.snapshot();
        assert_eq!(invalid, 1);
    }

    #[test]
    fn test_emit_one_prevents_loop() {
        let sender = RecordingSender::default();
        let sent = Rc::clone(&sender.sent);
        let mut emitter = test_emitter(sender);
        let header = FrameHeader {
            payload_len: 16,
            // 10.69.2.50 is native to the emitter's EPICS subnet.
            src_ip: Ipv4Addr::new(10, 69, 2, 50),
            dst_ip: Ipv4Addr::new(10, 0, 0, 255),
            src_port: 5065,
            dst_port: 5064,
        };
        let len = load_frame(&mut emitter, &header, &[0u8; 16]);
        emitter.emit_one(len);

        assert!(sent.borrow().is_empty());
        let (_, _, _, native, _) = emitter.metrics.snapshot();
        assert_eq!(native, 1);
    }

    #[test]
    fn test_emit_one_counts_send_failures() {
        let mut emitter = test_emitter(RecordingSender {
            fail: true,
            ..Default::default()
        });
        let header = FrameHeader {
            payload_len: 8,
            src_ip: Ipv4Addr::new(10, 0, 0, 7),
            dst_ip: Ipv4Addr::new(10, 0, 0, 255),
            src_port: 5065,
            dst_port: 5064,
        };
        let len = load_frame(&mut emitter, &header, &[0u8; 8]);
        emitter.emit_one(len);

        let (_, emitted, _, _, send_errors) = emitter.metrics.snapshot();
        assert_eq!(emitted, 0);
        assert_eq!(send_errors, 1);
    }

    #[test]
    fn test_emit_one_rejects_short_datagram() {
        let sender = RecordingSender::default();
        let sent = Rc::clone(&sender.sent);
        let mut emitter = test_emitter(sender);
        let header = FrameHeader {
            payload_len: 16,
            src_ip: Ipv4Addr::new(10, 0, 0, 7),
            dst_ip: Ipv4Addr::new(10, 0, 0, 255),
            src_port: 5065,
            dst_port: 5064,
        };
        load_frame(&mut emitter, &header, &[0u8; 16]);
        // Only the header's worth of bytes actually arrived.
        emitter.emit_one(FRAME_HEADER_LEN);
        assert!(sent.borrow().is_empty());
        let (_, _, invalid, ..) = emitter.metrics.snapshot();
        assert_eq!(invalid, 1);
    }
}
