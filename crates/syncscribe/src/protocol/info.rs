// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Enumeration records and the channel ticket payload.
//!
//! Enumeration replies stream table contents as packed little-endian records
//! (IPv4 addresses as four octets in network order). Each reply packet
//! carries a 5-byte control tuple in its identifier field:
//!
//! ```text
//! id.byte[0]  packet index within the response (0-based)
//! id.byte[1]  total packet count (hint only)
//! id.byte[2]  record count in this packet
//! id.byte[3]  sequence number echoed from the request
//! id.byte[4]  end marker (0 = more, 1 = last)
//! ```

use crate::protocol::ident::Ident;
use std::net::Ipv4Addr;

/// Value prefix carried inside an event info record.
pub const SHORT_DATA_SIZE: usize = 32;

/// Control tuple of an enumeration reply packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListHeader {
    /// 0-based packet index within the response.
    pub index: u8,
    /// Total packet count hint.
    pub total_hint: u8,
    /// Records carried by this packet.
    pub records: u8,
    /// Sequence number echoed from the request.
    pub sequence: u8,
    /// Set on the final packet of the response.
    pub last: bool,
}

impl ListHeader {
    /// Pack the tuple into a packet identifier.
    pub fn to_ident(self) -> Ident {
        let mut bytes = [0u8; Ident::SIZE];
        bytes[0] = self.index;
        bytes[1] = self.total_hint;
        bytes[2] = self.records;
        bytes[3] = self.sequence;
        bytes[4] = u8::from(self.last);
        Ident::from_bytes(bytes)
    }

    /// Unpack the tuple from a packet identifier.
    pub fn from_ident(id: &Ident) -> Self {
        let bytes = id.as_bytes();
        Self {
            index: bytes[0],
            total_hint: bytes[1],
            records: bytes[2],
            sequence: bytes[3],
            last: bytes[4] != 0,
        }
    }
}

/// One event table entry as reported by EVENT_LIST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventInfo {
    pub id: Ident,
    /// Declared variable-type bits.
    pub var_type: u32,
    /// First bytes of the stored value.
    pub short_data: [u8; SHORT_DATA_SIZE],
    /// Stored value length.
    pub data_size: u16,
    /// Unix seconds of the last write.
    pub time: i64,
    /// Write count.
    pub count: u32,
    pub consumers_count: u32,
    pub producers_count: u32,
}

impl EventInfo {
    /// Encoded record size.
    pub const SIZE: usize = Ident::SIZE + 4 + SHORT_DATA_SIZE + 2 + 8 + 4 + 4 + 4;

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        self.id.write_to(out);
        out.extend_from_slice(&self.var_type.to_le_bytes());
        out.extend_from_slice(&self.short_data);
        out.extend_from_slice(&self.data_size.to_le_bytes());
        out.extend_from_slice(&self.time.to_le_bytes());
        out.extend_from_slice(&self.count.to_le_bytes());
        out.extend_from_slice(&self.consumers_count.to_le_bytes());
        out.extend_from_slice(&self.producers_count.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        let id = Ident::read_from(buf)?;
        let mut at = Ident::SIZE;
        let var_type = read_u32(buf, &mut at);
        let mut short_data = [0u8; SHORT_DATA_SIZE];
        short_data.copy_from_slice(&buf[at..at + SHORT_DATA_SIZE]);
        at += SHORT_DATA_SIZE;
        let data_size = read_u16(buf, &mut at);
        let time = i64::from_le_bytes(buf[at..at + 8].try_into().ok()?);
        at += 8;
        let count = read_u32(buf, &mut at);
        let consumers_count = read_u32(buf, &mut at);
        let producers_count = read_u32(buf, &mut at);
        Some(Self {
            id,
            var_type,
            short_data,
            data_size,
            time,
            count,
            consumers_count,
            producers_count,
        })
    }

    /// Stored value prefix as a byte slice.
    pub fn value_prefix(&self) -> &[u8] {
        let len = usize::from(self.data_size).min(SHORT_DATA_SIZE);
        &self.short_data[..len]
    }
}

/// One client table entry as reported by CLIENT_LIST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientInfo {
    pub id: Ident,
    pub subscribe_count: u32,
    pub write_count: u32,
    pub rx_packets: u32,
    pub tx_packets: u32,
    pub ip: Ipv4Addr,
}

impl ClientInfo {
    /// Encoded record size.
    pub const SIZE: usize = Ident::SIZE + 4 + 4 + 4 + 4 + 4;

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        self.id.write_to(out);
        out.extend_from_slice(&self.subscribe_count.to_le_bytes());
        out.extend_from_slice(&self.write_count.to_le_bytes());
        out.extend_from_slice(&self.rx_packets.to_le_bytes());
        out.extend_from_slice(&self.tx_packets.to_le_bytes());
        out.extend_from_slice(&self.ip.octets());
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        let id = Ident::read_from(buf)?;
        let mut at = Ident::SIZE;
        let subscribe_count = read_u32(buf, &mut at);
        let write_count = read_u32(buf, &mut at);
        let rx_packets = read_u32(buf, &mut at);
        let tx_packets = read_u32(buf, &mut at);
        let ip = Ipv4Addr::new(buf[at], buf[at + 1], buf[at + 2], buf[at + 3]);
        Some(Self {
            id,
            subscribe_count,
            write_count,
            rx_packets,
            tx_packets,
            ip,
        })
    }
}

/// One channel table entry as reported by CHANNEL_LIST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelInfo {
    pub id: Ident,
    pub anons_count: u32,
    pub request_count: u32,
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl ChannelInfo {
    /// Encoded record size.
    pub const SIZE: usize = Ident::SIZE + 4 + 4 + 4 + 2;

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        self.id.write_to(out);
        out.extend_from_slice(&self.anons_count.to_le_bytes());
        out.extend_from_slice(&self.request_count.to_le_bytes());
        out.extend_from_slice(&self.ip.octets());
        out.extend_from_slice(&self.port.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        let id = Ident::read_from(buf)?;
        let mut at = Ident::SIZE;
        let anons_count = read_u32(buf, &mut at);
        let request_count = read_u32(buf, &mut at);
        let ip = Ipv4Addr::new(buf[at], buf[at + 1], buf[at + 2], buf[at + 3]);
        at += 4;
        let port = read_u16(buf, &mut at);
        Some(Self {
            id,
            anons_count,
            request_count,
            ip,
            port,
        })
    }
}

/// Rendezvous ticket: enough to open a direct pipe to the producer.
///
/// The broker rewrites `ip` to the producer's observed source address before
/// storing an announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelTicket {
    pub ip: Ipv4Addr,
    pub port: u16,
    /// Transport mode bits (`TICKET_MODE_*`), otherwise opaque.
    pub flags: u32,
}

impl ChannelTicket {
    /// Encoded payload size.
    pub const SIZE: usize = 4 + 2 + 4;

    pub fn new(ip: Ipv4Addr, port: u16, flags: u32) -> Self {
        Self { ip, port, flags }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.extend_from_slice(&self.ip.octets());
        out.extend_from_slice(&self.port.to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
        let port = u16::from_le_bytes([buf[4], buf[5]]);
        let flags = u32::from_le_bytes([buf[6], buf[7], buf[8], buf[9]]);
        Some(Self { ip, port, flags })
    }
}

fn read_u32(buf: &[u8], at: &mut usize) -> u32 {
    let v = u32::from_le_bytes([buf[*at], buf[*at + 1], buf[*at + 2], buf[*at + 3]]);
    *at += 4;
    v
}

fn read_u16(buf: &[u8], at: &mut usize) -> u16 {
    let v = u16::from_le_bytes([buf[*at], buf[*at + 1]]);
    *at += 2;
    v
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::VarType;

    #[test]
    fn test_list_header_round_trip() {
        let hdr = ListHeader {
            index: 2,
            total_hint: 3,
            records: 45,
            sequence: 7,
            last: true,
        };
        let id = hdr.to_ident();
        assert_eq!(ListHeader::from_ident(&id), hdr);
        assert_eq!(id.as_bytes()[3], 7);
        assert_eq!(id.as_bytes()[4], 1);
    }

    #[test]
    fn test_event_info_round_trip() {
        let mut short_data = [0u8; SHORT_DATA_SIZE];
        short_data[..4].copy_from_slice(&83i32.to_le_bytes());
        let info = EventInfo {
            id: Ident::from_label("count"),
            var_type: VarType::Int32.bits(),
            short_data,
            data_size: 4,
            time: 1_700_000_000,
            count: 12,
            consumers_count: 3,
            producers_count: 1,
        };
        let mut buf = Vec::new();
        info.encode_into(&mut buf);
        assert_eq!(buf.len(), EventInfo::SIZE);

        let back = EventInfo::decode(&buf).expect("complete record");
        assert_eq!(back, info);
        assert_eq!(back.value_prefix(), &83i32.to_le_bytes());
    }

    #[test]
    fn test_client_info_round_trip() {
        let info = ClientInfo {
            id: Ident::from_label("sensor-7"),
            subscribe_count: 2,
            write_count: 40,
            rx_packets: 100,
            tx_packets: 90,
            ip: Ipv4Addr::new(192, 168, 1, 20),
        };
        let mut buf = Vec::new();
        info.encode_into(&mut buf);
        assert_eq!(buf.len(), ClientInfo::SIZE);
        assert_eq!(ClientInfo::decode(&buf).expect("complete record"), info);
    }

    #[test]
    fn test_channel_info_round_trip() {
        let info = ChannelInfo {
            id: Ident::from_label("video0"),
            anons_count: 5,
            request_count: 2,
            ip: Ipv4Addr::new(10, 0, 0, 9),
            port: 5004,
        };
        let mut buf = Vec::new();
        info.encode_into(&mut buf);
        assert_eq!(buf.len(), ChannelInfo::SIZE);
        assert_eq!(ChannelInfo::decode(&buf).expect("complete record"), info);
    }

    #[test]
    fn test_ticket_round_trip() {
        let ticket = ChannelTicket::new(Ipv4Addr::new(172, 16, 0, 4), 6000, super::super::TICKET_MODE_UDP);
        let buf = ticket.encode();
        assert_eq!(buf.len(), ChannelTicket::SIZE);
        assert_eq!(ChannelTicket::decode(&buf).expect("complete ticket"), ticket);
        assert!(ChannelTicket::decode(&buf[..9]).is_none());
    }

    #[test]
    fn test_short_buffers_rejected() {
        assert!(EventInfo::decode(&[0u8; EventInfo::SIZE - 1]).is_none());
        assert!(ClientInfo::decode(&[0u8; ClientInfo::SIZE - 1]).is_none());
        assert!(ChannelInfo::decode(&[0u8; ChannelInfo::SIZE - 1]).is_none());
    }
}
