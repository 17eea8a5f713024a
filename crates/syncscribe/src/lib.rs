// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # SyncScribe - LAN publish/subscribe for named values and events
//!
//! A lightweight broker for small typed values, one-shot events and channel
//! rendezvous on a trusted LAN. Publishers write values against short string
//! identifiers; subscribers get callbacks (or drain a queue) on every
//! change; readers fetch the last-known value on demand. An SSDP-style
//! multicast handshake locates a broker without configuration, and channels
//! let peers exchange enough metadata to open a direct pipe outside the
//! broker.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::net::{IpAddr, Ipv4Addr};
//! use std::time::Duration;
//! use syncscribe::{Broker, Connection, VarType, Result};
//!
//! fn main() -> Result<()> {
//!     // One process hosts the broker...
//!     let broker = Broker::builder("hub")
//!         .bind(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 4444)
//!         .start()?;
//!
//!     // ...any process on the LAN talks to it.
//!     let conn = Connection::connect("127.0.0.1", 4444, "sensor-7");
//!     conn.connect_wait(Duration::from_secs(2))?;
//!     conn.subscribe("temp", VarType::Float, 0, |name, data| {
//!         println!("{name} changed: {data:?}");
//!     })?;
//!     conn.write_f32("temp", 21.5, 0)?;
//!
//!     drop(broker);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                      Application Layer                       |
//! |     Broker (local API)          Connection (typed API)       |
//! +--------------------------------------------------------------+
//! |                        Runtime Layer                         |
//! |  state engine + mio loop   |   worker thread + dispatcher    |
//! |  (tables, fan-out, lists)  |   (reconnect, resurrection,     |
//! |                            |    waiters, enumeration)        |
//! +--------------------------------------------------------------+
//! |                        Protocol Layer                        |
//! |   60-byte packed header | framer | records | CBC envelope    |
//! +--------------------------------------------------------------+
//! |                       Transport Layer                        |
//! |        TCP + UDP on one port | SSDP multicast discovery      |
//! +--------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Broker`] | The server process holding events, clients and channels |
//! | [`Connection`] | Persistent client handle with reconnect + resurrection |
//! | [`VarType`] | Declared payload type of an event |
//! | [`ChannelTicket`] | Rendezvous record for a direct peer-to-peer pipe |
//! | [`Error`] | Everything that can go wrong at the public API |
//!
//! Delivery is last-write-wins: the broker keeps only the newest value per
//! identifier, and a reconnecting subscriber is caught up with exactly one
//! redelivery. Persistence, cross-broker federation and delivery guarantees
//! beyond TCP's are out of scope.

/// Broker: tables, dispatch, readiness loop, local API.
pub mod broker;
/// Client runtime: worker, subscriptions, synchronous waiters.
pub mod client;
/// Protocol and table constants.
pub mod config;
/// SSDP-style broker discovery.
pub mod discovery;
/// Error types observable at the public API.
pub mod error;
/// Wire protocol: header, framing, records, checksum, envelope.
pub mod protocol;
/// Deadline-aligned ("sync-at") delivery helpers.
pub mod timesync;
/// Socket plumbing shared by broker and client.
pub mod transport;

pub use broker::{Broker, BrokerBuilder, LocalCallback};
pub use client::{Connection, ConnectionBuilder, EventCallback};
pub use discovery::find_broker;
pub use error::{Error, Result};
pub use protocol::{
    ChannelInfo, ChannelTicket, ClientInfo, EventInfo, StatusCode, VarType, FLAG_ECHO, FLAG_FORCE,
    FLAG_SYNC, TICKET_MODE_BROADCAST, TICKET_MODE_ICMP, TICKET_MODE_TCP, TICKET_MODE_UDP,
};

#[cfg(feature = "crypt")]
pub use protocol::CryptKey;

/// Default broker port, by convention.
pub use config::DEFAULT_PORT;

/// Protocol version implemented by this crate.
pub const PROTOCOL_VERSION: (u32, u32) = (config::VERSION_MAJOR, config::VERSION_MINOR);
