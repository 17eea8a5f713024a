// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Protocol constants and runtime tunables.
//!
//! Everything here is either normative wire protocol (magic bytes, version,
//! size limits) or a default the broker/client builders can override.

use std::net::Ipv4Addr;
use std::time::Duration;

/// First framing sentinel, transmitted before the header body.
pub const MAGIC0: u8 = b'S';

/// Second framing sentinel, transmitted after the header body.
pub const MAGIC1: u8 = b'D';

/// Protocol version, major part. A mismatch is fatal for the connection.
pub const VERSION_MAJOR: u32 = 2;

/// Protocol version, minor part. Minor differences are tolerated.
pub const VERSION_MINOR: u32 = 1;

/// Packed wire header size: magic0(1) crc(4) type(4) id(32) sync(8)
/// update_counter(8) data_size(2) magic1(1).
pub const HEADER_SIZE: usize = 60;

/// Maximum packet payload, limited by the 12-bit size field.
pub const PAYLOAD_SIZE_MAX: usize = 0x0fff;

/// Maximum stored value size for an event cell (fits a single UDP datagram
/// together with the header).
pub const VALUE_SIZE_MAX: usize = 512;

/// Identifier width in bytes.
pub const IDENT_SIZE: usize = 32;

/// Bounded broker table capacities.
pub const EVENT_TABLE_CAPACITY: usize = 256;
pub const CLIENT_TABLE_CAPACITY: usize = 64;
pub const CHANNEL_TABLE_CAPACITY: usize = 32;

/// Maximum subscribers per event.
pub const SUBSCRIBER_SET_CAPACITY: usize = 64;

/// Per-connection receive buffer handed to the framer.
pub const RECV_BUFFER_SIZE: usize = 32 * 1024;

/// Conventional broker port (TCP and UDP).
pub const DEFAULT_PORT: u16 = 4444;

/// Default sync-delivery offset stamped by the broker on SYNC writes.
pub const DEFAULT_SYNC_OFFSET_MS: u32 = 300;

/// Upper bound on the sync-delivery wait; a deadline further out than this is
/// treated as clock skew and delivered immediately.
pub const SYNC_WAIT_CAP: Duration = Duration::from_secs(1);

/// Socket receive/send buffer size requested on broker and client sockets.
pub const SOCKET_BUFFER_SIZE: usize = 1024 * 1024;

/// TCP keepalive on broker-side accepted sockets: idle time and probe count.
pub const BROKER_KEEPALIVE_IDLE: Duration = Duration::from_secs(600);

/// TCP keepalive on the client connection.
pub const CLIENT_KEEPALIVE_IDLE: Duration = Duration::from_secs(30);

/// Keepalive probe count before the peer is declared dead.
pub const KEEPALIVE_RETRIES: u32 = 3;

/// Delay before retrying a failed connect attempt.
pub const RECONNECT_DELAY: Duration = Duration::from_millis(300);

/// Delay before reconnecting after an established connection dropped.
pub const RECONNECT_IDLE: Duration = Duration::from_secs(1);

/// Default deadline for synchronous request/response calls (read, ticket,
/// enumerations) when the caller does not supply one.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

/// SSDP multicast rendezvous for broker discovery.
pub const SSDP_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
pub const SSDP_PORT: u16 = 1900;

/// Service name carried in the `ST:` header of M-SEARCH and responses.
pub const SSDP_SERVICE: &str = "syncscribe-server";

/// SSDP datagram buffer size.
pub const SSDP_PACKET_SIZE: usize = 1500;

/// Responder receive-timeout tick; doubles as the beacon period.
pub const SSDP_TICK: Duration = Duration::from_millis(500);

/// Symmetric key bundle size for the optional packet envelope.
pub const CRYPT_KEY_SIZE: usize = 32;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_size_matches_field_sum() {
        // magic0 + crc + type + id + sync + update_counter + data_size + magic1
        assert_eq!(HEADER_SIZE, 1 + 4 + 4 + IDENT_SIZE + 8 + 8 + 2 + 1);
    }

    #[test]
    fn test_payload_cap_is_twelve_bits() {
        assert_eq!(PAYLOAD_SIZE_MAX, 4095);
    }

    #[test]
    fn test_value_cell_fits_udp_datagram() {
        assert!(HEADER_SIZE + VALUE_SIZE_MAX < 1472, "must fit one MTU-sized datagram");
    }
}
