// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Packet header serialization.
//!
//! The header is a packed, unaligned 60-byte little-endian layout. It is
//! serialized field-by-field into a byte buffer rather than by casting a
//! struct, keeping alignment and endianness explicit:
//!
//! ```text
//! +--------+-----+------+--------+-------+-------+----------------+-----------+--------+
//! | magic0 | crc | type |   id   | sync0 | sync1 | update_counter | data_size | magic1 |
//! |   1B   | 4B  |  4B  |  32B   |  4B   |  4B   |       8B       |    2B     |   1B   |
//! +--------+-----+------+--------+-------+-------+----------------+-----------+--------+
//! ```
//!
//! `data_size` packs the payload length in its low 12 bits and the crypto
//! padding count in the high 4 bits.

use crate::config::{HEADER_SIZE, MAGIC0, MAGIC1, PAYLOAD_SIZE_MAX};
use crate::error::{Error, Result};
use crate::protocol::ident::Ident;

/// Byte offset of the `crc` field inside an encoded frame.
pub const CRC_OFFSET: usize = 1;

/// Byte offset of the `type` field inside an encoded frame.
pub const TYPE_OFFSET: usize = 5;

/// Byte offset of the `data_size` field inside an encoded frame.
pub const DATA_SIZE_OFFSET: usize = 57;

/// Decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketHeader {
    /// CRC32 over `type..end_of_payload`; only populated by the envelope.
    pub crc: u32,
    /// Combined opcode / flags / variable-type / channel-phase word.
    pub type_word: u32,
    /// Identifier this message refers to.
    pub id: Ident,
    /// Deadline seconds (sync events) or major version (handshake).
    pub sync0: u32,
    /// Deadline nanoseconds (sync events) or minor version (handshake).
    pub sync1: u32,
    /// Broker write counter, subscriber last-seen counter, or status code.
    pub update_counter: u64,
    /// Raw size field: low 12 bits payload length, high 4 bits padding.
    pub data_size: u16,
}

impl PacketHeader {
    /// Header for a message with no payload.
    pub fn request(type_word: u32, id: Ident) -> Self {
        Self {
            type_word,
            id,
            ..Self::default()
        }
    }

    /// Payload length encoded in the size field.
    #[must_use]
    pub fn payload_len(&self) -> usize {
        usize::from(self.data_size & 0x0fff)
    }

    /// Crypto padding count encoded in the size field.
    #[must_use]
    pub fn padding(&self) -> usize {
        usize::from(self.data_size >> 12)
    }

    /// Pack payload length and padding into the size field.
    pub fn set_sizes(&mut self, payload_len: usize, padding: usize) {
        debug_assert!(payload_len <= PAYLOAD_SIZE_MAX);
        debug_assert!(padding <= 0xf);
        self.data_size = (payload_len as u16 & 0x0fff) | ((padding as u16) << 12);
    }

    /// Serialize into the 60-byte wire layout.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(MAGIC0);
        out.extend_from_slice(&self.crc.to_le_bytes());
        out.extend_from_slice(&self.type_word.to_le_bytes());
        self.id.write_to(out);
        out.extend_from_slice(&self.sync0.to_le_bytes());
        out.extend_from_slice(&self.sync1.to_le_bytes());
        out.extend_from_slice(&self.update_counter.to_le_bytes());
        out.extend_from_slice(&self.data_size.to_le_bytes());
        out.push(MAGIC1);
    }

    /// Parse the wire layout; the buffer must hold at least one header.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::Protocol(format!(
                "short header: {} of {} bytes",
                buf.len(),
                HEADER_SIZE
            )));
        }
        if buf[0] != MAGIC0 || buf[HEADER_SIZE - 1] != MAGIC1 {
            return Err(Error::Protocol("bad framing sentinels".into()));
        }
        let crc = u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]);
        let type_word = u32::from_le_bytes([buf[5], buf[6], buf[7], buf[8]]);
        let id = Ident::read_from(&buf[9..]).ok_or_else(|| Error::Protocol("short id".into()))?;
        let sync0 = u32::from_le_bytes([buf[41], buf[42], buf[43], buf[44]]);
        let sync1 = u32::from_le_bytes([buf[45], buf[46], buf[47], buf[48]]);
        let update_counter = u64::from_le_bytes([
            buf[49], buf[50], buf[51], buf[52], buf[53], buf[54], buf[55], buf[56],
        ]);
        let data_size = u16::from_le_bytes([buf[57], buf[58]]);
        Ok(Self {
            crc,
            type_word,
            id,
            sync0,
            sync1,
            update_counter,
            data_size,
        })
    }
}

/// Header plus owned payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Packet with no payload.
    pub fn request(type_word: u32, id: Ident) -> Self {
        Self {
            header: PacketHeader::request(type_word, id),
            payload: Vec::new(),
        }
    }

    /// Packet carrying a payload; the size field is set from its length.
    pub fn with_payload(type_word: u32, id: Ident, payload: Vec<u8>) -> Self {
        debug_assert!(payload.len() <= PAYLOAD_SIZE_MAX);
        let mut header = PacketHeader::request(type_word, id);
        header.set_sizes(payload.len(), 0);
        Self { header, payload }
    }

    /// Serialize header and payload into one frame.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        self.header.encode_into(&mut out);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse a frame produced by the framer (exact header + payload bytes).
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let header = PacketHeader::decode(frame)?;
        let len = header.payload_len();
        let payload = frame
            .get(HEADER_SIZE..HEADER_SIZE + len)
            .ok_or_else(|| Error::Protocol(format!("truncated payload: want {} bytes", len)))?
            .to_vec();
        Ok(Self { header, payload })
    }

    /// Parse a self-contained datagram, tolerating trailing bytes.
    pub fn decode_datagram(buf: &[u8]) -> Result<Self> {
        Self::decode(buf)
    }
}
