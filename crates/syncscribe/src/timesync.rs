// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Deadline-aligned delivery ("sync-at" timestamps).
//!
//! A SYNC write is stamped by the broker with a wall-clock deadline; every
//! subscriber waits until its own real-time clock reaches that deadline
//! before invoking the user callback, so all hosts fire in unison. Wall
//! clock is used only for these cross-host deadlines; every timeout in the
//! crate runs on the monotonic clock.

use crate::config::SYNC_WAIT_CAP;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Stamp a delivery deadline `offset` past the current wall clock.
///
/// Returns `(seconds, nanoseconds)` since the Unix epoch; the addition
/// normalizes the nanosecond part below one second.
pub fn deadline_after(offset: Duration) -> (u32, u32) {
    let deadline = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        + offset;
    (deadline.as_secs() as u32, deadline.subsec_nanos())
}

/// Time left until a stamped deadline, if it is still ahead of us.
fn remaining(sync0: u32, sync1: u32) -> Option<Duration> {
    let deadline = Duration::new(u64::from(sync0), sync1);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    deadline.checked_sub(now).filter(|d| !d.is_zero())
}

/// Block until the local real-time clock reaches the deadline.
///
/// Two guards apply: a deadline already in the past delivers immediately,
/// and a wait longer than one second is treated as clock skew between the
/// stamping broker and this host, also delivering immediately.
pub fn wait_until(sync0: u32, sync1: u32) {
    loop {
        let Some(left) = remaining(sync0, sync1) else {
            return;
        };
        if left > SYNC_WAIT_CAP {
            log::debug!(
                "[sync] deadline {}.{:09} is {:?} ahead, skew guard fires",
                sync0,
                sync1,
                left
            );
            return;
        }
        std::thread::sleep(left);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_deadline_is_ahead_by_offset() {
        let before = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock after epoch");
        let (secs, nanos) = deadline_after(Duration::from_millis(300));
        let deadline = Duration::new(u64::from(secs), nanos);

        let ahead = deadline.checked_sub(before).expect("deadline in the future");
        assert!(ahead >= Duration::from_millis(299), "ahead by {:?}", ahead);
        assert!(ahead < Duration::from_millis(400));
        assert!(nanos < 1_000_000_000);
    }

    #[test]
    fn test_past_deadline_returns_immediately() {
        let start = Instant::now();
        wait_until(1, 0);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_skew_guard_fires_for_far_deadlines() {
        // Five seconds ahead: the guard must deliver immediately.
        let (secs, nanos) = deadline_after(Duration::from_secs(5));
        let start = Instant::now();
        wait_until(secs, nanos);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_near_deadline_is_awaited() {
        let (secs, nanos) = deadline_after(Duration::from_millis(80));
        let start = Instant::now();
        wait_until(secs, nanos);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(60), "waited only {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(500));
    }
}
