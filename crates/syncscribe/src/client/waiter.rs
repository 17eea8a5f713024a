// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Synchronous-call waiters.
//!
//! Each request class (read, ticket, each enumeration kind) owns one waiter:
//! the caller arms it, transmits the request, and blocks with a monotonic
//! deadline; the dispatcher completes it when the matching reply arrives.
//! One outstanding request per class per connection; timed waits run on
//! `Instant`, never the wall clock.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::protocol::Ident;

struct WaitCell<T> {
    waiting: bool,
    id: Ident,
    value: Option<T>,
}

/// One request class's completion slot.
pub(crate) struct Waiter<T> {
    cell: Mutex<WaitCell<T>>,
    cond: Condvar,
}

impl<T> Waiter<T> {
    pub fn new() -> Self {
        Self {
            cell: Mutex::new(WaitCell {
                waiting: false,
                id: Ident::default(),
                value: None,
            }),
            cond: Condvar::new(),
        }
    }

    /// Mark a request in flight for `id`. Discards any stale completion.
    pub fn arm(&self, id: Ident) {
        let mut cell = self.cell.lock();
        cell.waiting = true;
        cell.id = id;
        cell.value = None;
    }

    /// Complete if a request for exactly `id` is in flight.
    pub fn complete_if(&self, id: &Ident, value: T) -> bool {
        let mut cell = self.cell.lock();
        if !cell.waiting || cell.id != *id {
            return false;
        }
        cell.value = Some(value);
        cell.waiting = false;
        self.cond.notify_one();
        true
    }

    /// Complete the in-flight request regardless of identifier (enumeration
    /// replies are matched by their sequence byte instead).
    pub fn complete(&self, value: T) -> bool {
        let mut cell = self.cell.lock();
        if !cell.waiting {
            return false;
        }
        cell.value = Some(value);
        cell.waiting = false;
        self.cond.notify_one();
        true
    }

    /// Block until completion or the deadline.
    pub fn wait(&self, timeout: Duration) -> Result<T> {
        let deadline = Instant::now() + timeout;
        let mut cell = self.cell.lock();
        while cell.waiting {
            if self.cond.wait_until(&mut cell, deadline).timed_out() {
                cell.waiting = false;
                return Err(Error::Timeout);
            }
        }
        cell.value.take().ok_or(Error::Timeout)
    }
}
