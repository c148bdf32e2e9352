// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! carelay emitter daemon.
//!
//! Receives framed CA datagrams from one or more collectors on UDP port
//! 4000 and re-injects each as a native broadcast on the local EPICS
//! subnet, preserving the original sender's source address.
//!
//! # Usage
//!
//! ```bash
//! carelay-emitter --config /etc/carelay.toml
//! carelay-emitter -d -c ./carelay.toml       # debug logging
//! ```
//!
//! Source-address forging requires raw-socket capability (`CAP_NET_RAW`
//! or root).

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;

use carelay::config::RelayConfig;
use carelay::emitter::Emitter;

/// EPICS CA broadcast emitter
#[derive(Parser, Debug)]
#[command(name = "carelay-emitter")]
#[command(about = "Re-injects relayed EPICS CA traffic as local broadcasts")]
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
        log::error!("[emitter] {}", e);
        std::process::exit(-1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    log::info!("carelay emitter v{}", env!("CARGO_PKG_VERSION"));
    log::info!("[emitter] config file: {}", args.config.display());

    let config = RelayConfig::from_file(&args.config)?;
    let params = config.emitter()?.resolve()?;

    log::info!(
        "[emitter] routed side {} ({}), EPICS side {} ({})",
        params.iface.address,
        params.iface.name,
        params.iface_epics.address,
        params.iface_epics.name
    );

    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    ctrlc::set_handler(move || {
        flag.store(false, Ordering::Relaxed);
    })?;

    let mut emitter = Emitter::new(params)?;
    emitter.run(&running);
    Ok(())
}

fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default))
        .format_timestamp_millis()
        .init();
}
