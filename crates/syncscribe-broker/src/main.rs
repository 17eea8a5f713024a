// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SyncScribe broker daemon.
//!
//! Hosts the event/client/channel tables on one TCP+UDP port, optionally
//! answering SSDP searches so clients can find it without configuration.
//!
//! # Usage
//!
//! ```bash
//! # Serve on the conventional port
//! syncscribe-broker
//!
//! # Custom bind, discoverable, announcing itself twice a second
//! syncscribe-broker --bind 192.168.1.5 --port 4444 --ssdp --beacon
//! ```

use clap::Parser;
use std::net::IpAddr;
use std::sync::mpsc::channel;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use syncscribe::Broker;

/// SyncScribe broker - LAN pub/sub for named values, events and channels
#[derive(Parser, Debug)]
#[command(name = "syncscribe-broker")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Bind address (0.0.0.0 for all interfaces)
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// TCP and UDP port to serve on
    #[arg(short, long, default_value_t = syncscribe::DEFAULT_PORT)]
    port: u16,

    /// Broker identifier reported to clients and in SSDP responses
    #[arg(short, long, default_value = "syncscribe")]
    name: String,

    /// Answer SSDP M-SEARCH queries
    #[arg(long, default_value_t = false)]
    ssdp: bool,

    /// Also announce unsolicited SSDP responses every 500 ms (implies --ssdp)
    #[arg(long, default_value_t = false)]
    beacon: bool,

    /// Offset in milliseconds stamped on SYNC deliveries
    #[arg(long, default_value_t = 300)]
    sync_offset_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone()));
    fmt().with_env_filter(filter).with_target(false).init();

    let mut builder = Broker::builder(&args.name)
        .bind(args.bind, args.port)
        .sync_offset(Duration::from_millis(args.sync_offset_ms));
    if args.ssdp || args.beacon {
        builder = builder.ssdp(args.beacon);
    }
    let mut broker = builder.start()?;

    info!("+--------------------------------------------+");
    info!("|  SyncScribe broker v{:<22} |", env!("CARGO_PKG_VERSION"));
    info!("+--------------------------------------------+");
    info!("|  Name:  {:<34} |", args.name);
    info!("|  Bind:  {:<34} |", broker.local_addr());
    info!(
        "|  SSDP:  {:<34} |",
        if args.beacon {
            "beacon"
        } else if args.ssdp {
            "responder"
        } else {
            "off"
        }
    );
    info!("|  Sync:  {:<34} |", format!("{} ms", args.sync_offset_ms));
    info!("+--------------------------------------------+");

    let (stop_tx, stop_rx) = channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })?;

    stop_rx.recv()?;
    info!("shutdown signal received, stopping broker");
    broker.shutdown();
    info!("broker stopped");
    Ok(())
}
