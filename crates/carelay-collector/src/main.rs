// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! carelay collector daemon.
//!
//! Listens to the CA broadcast ports of the local EPICS subnet, filters PV
//! searches through the configured regex rules, and forwards the surviving
//! traffic to every configured emitter as framed unicast UDP.
//!
//! # Usage
//!
//! ```bash
//! carelay-collector --config /etc/carelay.toml
//! carelay-collector -d -c ./carelay.toml     # debug logging
//! ```
//!
//! Needs only ordinary broadcast UDP; no special privileges.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;

use carelay::collector::{Collector, LISTEN_PORTS};
use carelay::config::RelayConfig;

/// EPICS CA broadcast collector
#[derive(Parser, Debug)]
#[command(name = "carelay-collector")]
#[command(about = "Collects EPICS CA broadcasts and relays them to remote emitters")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/carelay.toml")]
    config: PathBuf,

    /// Log at debug level (overridden by RUST_LOG)
    #[arg(short, long)]
    debug: bool,
}

fn main() {
    let args = Args::parse();
    init_logging(args.debug);

    if let Err(e) = run(&args) {
        log::error!("[collector] {}", e);
        std::process::exit(-1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    log::info!("carelay collector v{}", env!("CARGO_PKG_VERSION"));
    log::info!("[collector] config file: {}", args.config.display());

    let config = RelayConfig::from_file(&args.config)?;
    let params = config.collector()?.resolve()?;

    log::info!(
        "[collector] routed side {} ({}), EPICS side {} ({}), {} emitter peer(s), ports {:?}",
        params.iface.address,
        params.iface.name,
        params.iface_epics.address,
        params.iface_epics.name,
        params.peers.len(),
        LISTEN_PORTS
    );

    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    ctrlc::set_handler(move || {
        flag.store(false, Ordering::Relaxed);
    })?;

    let mut collector = Collector::new(params)?;
    collector.run(&running);
    Ok(())
}

fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default))
        .format_timestamp_millis()
        .init();
}
