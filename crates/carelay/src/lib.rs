// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # carelay - EPICS Channel Access broadcast relay
//!
//! EPICS control systems resolve process-variable (PV) names and announce
//! server liveness with UDP *broadcasts* (CA name search on port 5064,
//! beacons on 5065, repeater traffic on 5076). Routers do not forward
//! broadcasts, so clients on one subnet cannot see IOCs on another. carelay
//! bridges that gap with two cooperating daemons:
//!
//! ```text
//!  EPICS subnet A                   routed IP                  EPICS subnet B
//! +-----------+  bcast :5064/65/76 +-----------+ unicast :4000 +-----------+
//! | CA client | -----------------> | collector | ------------> |  emitter  | --+
//! +-----------+                    +-----------+               +-----------+   | bcast
//!                                                                  CA server <-+
//! ```
//!
//! - The **collector** listens on the CA broadcast ports of one subnet,
//!   decodes the CA message stream, drops PV searches rejected by a regex
//!   filter, and forwards the surviving traffic inside a small framed
//!   datagram to one or more emitters.
//! - The **emitter** validates incoming frames and re-injects the CA payload
//!   as a native broadcast on its own EPICS subnet, forging the original
//!   sender's source IP so downstream CA semantics are preserved.
//!
//! Search *replies* travel back over unicast CA TCP and need no relaying.
//!
//! ## Modules Overview
//!
//! - [`config`] - TOML configuration for both daemons
//! - [`epics`] - CA wire format decoding and datagram rewriting
//! - [`filter`] - regex PV filter (OR/AND combination, invertible sense)
//! - [`proto`] - the private collector->emitter frame codec
//! - [`net`] - interface probing, UDP sockets, raw-packet emission
//! - [`collector`] / [`emitter`] - the two daemon event loops

/// Daemon event loop of the collecting (EPICS-listening) side.
pub mod collector;
/// TOML configuration loading, validation and resolution.
pub mod config;
/// Daemon event loop of the emitting (re-broadcasting) side.
pub mod emitter;
/// EPICS Channel Access wire format (UDP subset: version, search, beacon).
pub mod epics;
/// Regex-based PV name filter.
pub mod filter;
/// Network plumbing: interfaces, UDP sockets, link-layer senders.
pub mod net;
/// Private frame codec carried between collector and emitter.
pub mod proto;

pub use config::{CollectorConfig, ConfigError, EmitterConfig, RelayConfig};
pub use filter::PvFilter;
pub use proto::{FrameHeader, FRAME_HEADER_LEN, FRAME_MAGIC, FRAME_PORT};

/// Largest datagram either daemon handles, frame header included.
///
/// CA search datagrams are far smaller in practice; anything beyond this is
/// truncated by the scratch buffers and effectively dropped by the parser.
pub const MAX_DATAGRAM: usize = 2048;
