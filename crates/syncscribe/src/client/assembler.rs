// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Enumeration reply reassembly.
//!
//! A list request is answered with 1..N packets tagged by a rolling 1-byte
//! sequence the client chose. The assembler enforces strict in-order
//! delivery: a packet whose sequence byte does not match the current request
//! or whose index is not the expected next index is dropped. The response is
//! complete when the end marker arrives.

use crate::protocol::ListHeader;

/// Per-request-class reassembly state.
pub(crate) struct Assembler<T> {
    sequence: u8,
    expected_index: u8,
    records: Vec<T>,
    active: bool,
}

impl<T> Assembler<T> {
    pub fn new() -> Self {
        Self {
            sequence: 0,
            expected_index: 0,
            records: Vec::new(),
            active: false,
        }
    }

    /// Start a new request; returns the sequence byte to send.
    pub fn begin(&mut self) -> u8 {
        self.sequence = self.sequence.wrapping_add(1);
        self.expected_index = 0;
        self.records.clear();
        self.active = true;
        self.sequence
    }

    /// Feed one reply packet. Returns the assembled records once the final
    /// packet of the current request has been consumed.
    pub fn accept(
        &mut self,
        header: &ListHeader,
        payload: &[u8],
        record_size: usize,
        decode: impl Fn(&[u8]) -> Option<T>,
    ) -> Option<Vec<T>> {
        if !self.active {
            return None;
        }
        if header.sequence != self.sequence {
            log::debug!(
                "[client] list packet for stale sequence {} (current {})",
                header.sequence,
                self.sequence
            );
            return None;
        }
        if header.index != self.expected_index {
            log::debug!(
                "[client] out-of-order list packet {} (expected {})",
                header.index,
                self.expected_index
            );
            return None;
        }

        for n in 0..usize::from(header.records) {
            let at = n * record_size;
            match payload.get(at..).and_then(&decode) {
                Some(record) => self.records.push(record),
                None => break,
            }
        }
        self.expected_index = self.expected_index.wrapping_add(1);

        if header.last {
            self.active = false;
            Some(std::mem::take(&mut self.records))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(index: u8, records: u8, sequence: u8, last: bool) -> ListHeader {
        ListHeader {
            index,
            total_hint: 0,
            records,
            sequence,
            last,
        }
    }

    fn decode_byte(buf: &[u8]) -> Option<u8> {
        buf.first().copied()
    }

    #[test]
    fn test_single_packet_response() {
        let mut asm = Assembler::new();
        let seq = asm.begin();
        let done = asm.accept(&header(0, 3, seq, true), &[1, 2, 3], 1, decode_byte);
        assert_eq!(done, Some(vec![1, 2, 3]));
    }

    #[test]
    fn test_multi_packet_in_order() {
        let mut asm = Assembler::new();
        let seq = asm.begin();
        assert!(asm
            .accept(&header(0, 2, seq, false), &[1, 2], 1, decode_byte)
            .is_none());
        assert!(asm
            .accept(&header(1, 2, seq, false), &[3, 4], 1, decode_byte)
            .is_none());
        let done = asm.accept(&header(2, 1, seq, true), &[5], 1, decode_byte);
        assert_eq!(done, Some(vec![1, 2, 3, 4, 5]));
    }

    #[test]
    fn test_stale_sequence_dropped() {
        let mut asm = Assembler::new();
        let seq = asm.begin();
        // A reply tagged with the previous sequence must be ignored.
        assert!(asm
            .accept(
                &header(0, 2, seq.wrapping_sub(1), true),
                &[9, 9],
                1,
                decode_byte
            )
            .is_none());
        let done = asm.accept(&header(0, 1, seq, true), &[1], 1, decode_byte);
        assert_eq!(done, Some(vec![1]));
    }

    #[test]
    fn test_out_of_order_dropped() {
        let mut asm = Assembler::new();
        let seq = asm.begin();
        assert!(asm
            .accept(&header(1, 1, seq, false), &[9], 1, decode_byte)
            .is_none());
        // Index 0 is still what we expect.
        assert!(asm
            .accept(&header(0, 1, seq, false), &[1], 1, decode_byte)
            .is_none());
        let done = asm.accept(&header(1, 1, seq, true), &[2], 1, decode_byte);
        assert_eq!(done, Some(vec![1, 2]));
    }

    #[test]
    fn test_empty_response() {
        let mut asm: Assembler<u8> = Assembler::new();
        let seq = asm.begin();
        let done = asm.accept(&header(0, 0, seq, true), &[], 1, decode_byte);
        assert_eq!(done, Some(Vec::new()));
    }

    #[test]
    fn test_inactive_assembler_ignores_packets() {
        let mut asm: Assembler<u8> = Assembler::new();
        assert!(asm.accept(&header(0, 1, 0, true), &[1], 1, decode_byte).is_none());
    }

    #[test]
    fn test_sequence_wraps() {
        let mut asm: Assembler<u8> = Assembler::new();
        let mut last_seq = 0;
        for _ in 0..=256 {
            last_seq = asm.begin();
        }
        assert_eq!(last_seq, 1, "sequence is a rolling byte");
    }

    #[test]
    fn test_truncated_payload_stops_early() {
        let mut asm = Assembler::new();
        let seq = asm.begin();
        // Claims 4 records but carries 2.
        let done = asm.accept(&header(0, 4, seq, true), &[1, 2], 1, decode_byte);
        assert_eq!(done, Some(vec![1, 2]));
    }
}
