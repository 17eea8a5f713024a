// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Stream framer for the packet protocol over TCP.
//!
//! TCP delivers a byte stream; packets are delimited by the two magic
//! sentinels and the 12-bit size field. The framer accumulates reads into a
//! buffer and yields complete frames. On a sentinel mismatch it advances by
//! one byte (resync), so a corrupted stream loses at most the damaged packet.

use crate::config::{HEADER_SIZE, MAGIC0, MAGIC1, RECV_BUFFER_SIZE};

/// Incremental frame extractor with resync.
#[derive(Debug)]
pub struct Framer {
    buffer: Vec<u8>,
    /// Bytes of `buffer` currently filled.
    fill: usize,
    /// Parse position within the filled region.
    head: usize,
    /// Statistics: complete frames produced.
    frames: u64,
    /// Statistics: bytes skipped while resynchronizing.
    skipped: u64,
}

impl Framer {
    /// Framer with the standard per-connection buffer.
    pub fn new() -> Self {
        Self::with_capacity(RECV_BUFFER_SIZE)
    }

    /// Framer with an explicit buffer size (must hold at least one maximum
    /// frame).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: vec![0u8; capacity],
            fill: 0,
            head: 0,
            frames: 0,
            skipped: 0,
        }
    }

    /// Spare buffer space for the next socket read. Compacts leftovers to the
    /// buffer head first so the full tail is writable.
    pub fn writable(&mut self) -> &mut [u8] {
        self.compact();
        &mut self.buffer[self.fill..]
    }

    /// Record `n` bytes appended by the last read.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(self.fill + n <= self.buffer.len());
        self.fill += n;
    }

    /// Append bytes directly (tests and datagram reassembly).
    pub fn push(&mut self, data: &[u8]) {
        let spare = self.writable();
        let n = data.len().min(spare.len());
        spare[..n].copy_from_slice(&data[..n]);
        self.advance(n);
    }

    /// Extract the next complete frame (header + payload), if any.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        while self.fill - self.head >= HEADER_SIZE {
            let at = self.head;
            if self.buffer[at] != MAGIC0 {
                self.head += 1;
                self.skipped += 1;
                continue;
            }
            if self.buffer[at + HEADER_SIZE - 1] != MAGIC1 {
                self.head += 1;
                self.skipped += 1;
                continue;
            }
            let raw = u16::from_le_bytes([self.buffer[at + 57], self.buffer[at + 58]]);
            let payload_len = usize::from(raw & 0x0fff);
            let frame_len = HEADER_SIZE + payload_len;
            if self.fill - at < frame_len {
                // Wait for the rest of the payload.
                break;
            }
            let frame = self.buffer[at..at + frame_len].to_vec();
            self.head = at + frame_len;
            self.frames += 1;
            return Some(frame);
        }
        self.compact();
        None
    }

    /// Move leftover bytes to the buffer head.
    fn compact(&mut self) {
        if self.head == 0 {
            return;
        }
        if self.head < self.fill {
            self.buffer.copy_within(self.head..self.fill, 0);
            self.fill -= self.head;
        } else {
            self.fill = 0;
        }
        self.head = 0;
    }

    /// Bytes buffered but not yet consumed.
    pub fn pending(&self) -> usize {
        self.fill - self.head
    }

    /// Complete frames produced so far.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Bytes dropped during resynchronization.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Drop all buffered bytes (connection reset).
    pub fn reset(&mut self) {
        self.fill = 0;
        self.head = 0;
    }
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}
