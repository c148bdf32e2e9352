// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Relay configuration.
//!
//! One TOML file serves both daemons; each reads only its own table, so a
//! site can ship a single `/etc/carelay.toml` to every host:
//!
//! ```toml
//! [collector]
//! interface = "ens192"          # optional, defaults to first non-loopback
//! epics_interface = "ens224"
//! emitters = ["relay-b.example.org", "10.69.0.38:4000"]
//!
//! [collector.filter]
//! sense = false
//! logic = false
//! rules = ["^OK:"]
//!
//! [emitter]
//! interface = "ens192"
//! epics_interface = "ens256"
//! ```
//!
//! Parsing and validation happen before any socket is opened; every error
//! here is fatal.

use std::net::{SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::filter::PvFilter;
use crate::net::iface::{self, IfData};
use crate::proto::FRAME_PORT;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("missing [{0}] section")]
    MissingSection(&'static str),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("interface {name}: {source}")]
    Interface {
        name: String,
        source: std::io::Error,
    },

    #[error("cannot resolve emitter host {0:?}")]
    Resolve(String),

    #[error("bad filter rule: {0}")]
    Regex(#[from] regex::Error),
}

/// Whole configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    pub collector: Option<CollectorConfig>,
    pub emitter: Option<EmitterConfig>,
}

/// `[collector]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Interface facing the routed network. Defaults to the first
    /// non-loopback interface when omitted.
    pub interface: Option<String>,

    /// Interface on the EPICS subnet whose broadcasts are collected.
    pub epics_interface: String,

    /// Emitter peers, as hostnames or addresses with an optional `:port`
    /// (default frame port 4000).
    pub emitters: Vec<String>,

    /// PV search filter; absent means accept everything.
    #[serde(default)]
    pub filter: FilterConfig,
}

/// `[collector.filter]` table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Invert each rule's verdict.
    #[serde(default)]
    pub sense: bool,
    /// `false` = OR the rules, `true` = AND them.
    #[serde(default)]
    pub logic: bool,
    /// Regular expressions matched against PV names.
    #[serde(default)]
    pub rules: Vec<String>,
}

/// `[emitter]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmitterConfig {
    /// Interface facing the routed network (frame reception). Defaults to
    /// the first non-loopback interface when omitted.
    pub interface: Option<String>,

    /// Interface on the EPICS subnet receiving the re-broadcasts.
    pub epics_interface: String,
}

/// Collector runtime parameters, everything resolved and compiled.
#[derive(Debug)]
pub struct CollectorParams {
    pub iface: IfData,
    pub iface_epics: IfData,
    pub peers: Vec<SocketAddrV4>,
    pub filter: PvFilter,
}

/// Emitter runtime parameters.
#[derive(Debug)]
pub struct EmitterParams {
    pub iface: IfData,
    pub iface_epics: IfData,
}

impl RelayConfig {
    /// Load and validate a configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Structural validation (no network access).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(ref collector) = self.collector {
            if collector.epics_interface.is_empty() {
                return Err(ConfigError::Invalid(
                    "collector.epics_interface must not be empty".into(),
                ));
            }
            if collector.emitters.is_empty() {
                return Err(ConfigError::Invalid(
                    "collector.emitters must list at least one peer".into(),
                ));
            }
        }
        if let Some(ref emitter) = self.emitter {
            if emitter.epics_interface.is_empty() {
                return Err(ConfigError::Invalid(
                    "emitter.epics_interface must not be empty".into(),
                ));
            }
        }
        Ok(())
    }

    /// The `[collector]` table, or an error when absent.
    pub fn collector(&self) -> Result<&CollectorConfig, ConfigError> {
        self.collector
            .as_ref()
            .ok_or(ConfigError::MissingSection("collector"))
    }

    /// The `[emitter]` table, or an error when absent.
    pub fn emitter(&self) -> Result<&EmitterConfig, ConfigError> {
        self.emitter
            .as_ref()
            .ok_or(ConfigError::MissingSection("emitter"))
    }
}

impl CollectorConfig {
    /// Probe interfaces, resolve peers and compile the filter.
    pub fn resolve(&self) -> Result<CollectorParams, ConfigError> {
        let iface = probe_interface(self.interface.as_deref())?;
        let iface_epics = probe_interface(Some(&self.epics_interface))?;
        let peers = self
            .emitters
            .iter()
            .map(|host| resolve_peer(host))
            .collect::<Result<Vec<_>, _>>()?;
        let filter = self.filter.compile()?;
        Ok(CollectorParams {
            iface,
            iface_epics,
            peers,
            filter,
        })
    }
}

impl FilterConfig {
    /// Compile the rule list.
    pub fn compile(&self) -> Result<PvFilter, regex::Error> {
        PvFilter::compile(self.sense, self.logic, &self.rules)
    }
}

impl EmitterConfig {
    /// Probe both interfaces.
    pub fn resolve(&self) -> Result<EmitterParams, ConfigError> {
        let iface = probe_interface(self.interface.as_deref())?;
        let iface_epics = probe_interface(Some(&self.epics_interface))?;
        Ok(EmitterParams { iface, iface_epics })
    }
}

/// Probe a named interface, or the default one when `name` is `None`.
fn probe_interface(name: Option<&str>) -> Result<IfData, ConfigError> {
    let name = match name {
        Some(n) => n.to_string(),
        None => iface::default_interface_name().map_err(|source| ConfigError::Interface {
            name: "<default>".into(),
            source,
        })?,
    };
    IfData::probe(&name).map_err(|source| ConfigError::Interface { name, source })
}

/// Resolve one emitter peer to an IPv4 address.
///
/// Accepts `host`, `host:port`, `a.b.c.d` and `a.b.c.d:port`; the frame
/// port 4000 is used when none is given.
pub fn resolve_peer(host: &str) -> Result<SocketAddrV4, ConfigError> {
    let addrs = if host.contains(':') {
        host.to_socket_addrs()
    } else {
        (host, FRAME_PORT).to_socket_addrs()
    };
    addrs
        .map_err(|_| ConfigError::Resolve(host.to_string()))?
        .find_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(v4),
            SocketAddr::V6(_) => None,
        })
        .ok_or_else(|| ConfigError::Resolve(host.to_string()))
}
