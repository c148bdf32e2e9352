// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Network plumbing shared by both daemons.
//!
//! - [`iface`] - IPv4 interface probing (address, netmask, broadcast,
//!   hardware address, index) and the native-subnet predicate
//! - [`socket`] - UDP socket construction with the options the relay needs
//! - [`ethernet`] - raw-packet construction and the link-layer senders the
//!   emitter uses to forge the original broadcaster's source address

pub mod ethernet;
pub mod iface;
pub mod socket;

pub use ethernet::{open_link_sender, LinkSender};
pub use iface::IfData;
