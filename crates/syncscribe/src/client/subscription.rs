// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Client-side subscription registry.
//!
//! A fixed-capacity array of slots, mutated by application threads and read
//! by the dispatcher. Slots are handed out as `Arc`s so the dispatcher can
//! drop the registry lock before invoking a callback; the optional mirror
//! buffer feeding `wait_event` has its own per-slot mutex because the
//! dispatcher writes it while the application reads.

use parking_lot::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use crate::config::EVENT_TABLE_CAPACITY;
use crate::error::{Error, Result};
use crate::protocol::Ident;

/// Callback invoked by the dispatcher on every delivered event.
pub type EventCallback = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// One standing subscription.
pub(crate) struct SubscriptionSlot {
    pub id: Ident,
    /// Variable-type and attribute bits re-sent on resurrection.
    pub type_flags: u32,
    pub callback: Option<EventCallback>,
    /// Latest-value mirror for the queued (`wait_event`) path.
    pub mirror: Option<Mutex<Vec<u8>>>,
    /// Last update counter seen, reported on re-subscribe so the broker can
    /// detect missed writes.
    pub update_counter: AtomicU64,
}

impl SubscriptionSlot {
    pub fn with_callback(id: Ident, type_flags: u32, callback: EventCallback) -> Self {
        Self {
            id,
            type_flags,
            callback: Some(callback),
            mirror: None,
            update_counter: AtomicU64::new(0),
        }
    }

    pub fn with_mirror(id: Ident, type_flags: u32) -> Self {
        Self {
            id,
            type_flags,
            callback: None,
            mirror: Some(Mutex::new(Vec::new())),
            update_counter: AtomicU64::new(0),
        }
    }
}

/// Bounded slot table.
pub(crate) struct Registry {
    slots: Mutex<Vec<Option<Arc<SubscriptionSlot>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new((0..EVENT_TABLE_CAPACITY).map(|_| None).collect()),
        }
    }

    /// Insert a subscription; an existing slot for the same identifier is
    /// replaced.
    pub fn add(&self, slot: SubscriptionSlot) -> Result<Arc<SubscriptionSlot>> {
        let slot = Arc::new(slot);
        let mut slots = self.slots.lock();
        let position = slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|s| s.id == slot.id))
            .or_else(|| slots.iter().position(Option::is_none))
            .ok_or(Error::NoCapacity)?;
        slots[position] = Some(Arc::clone(&slot));
        Ok(slot)
    }

    pub fn remove(&self, id: &Ident) -> Option<Arc<SubscriptionSlot>> {
        let mut slots = self.slots.lock();
        let position = slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|s| s.id == *id))?;
        slots[position].take()
    }

    pub fn find(&self, id: &Ident) -> Option<Arc<SubscriptionSlot>> {
        self.slots
            .lock()
            .iter()
            .flatten()
            .find(|s| s.id == *id)
            .cloned()
    }

    /// Every live subscription, for the resurrection pass.
    pub fn snapshot(&self) -> Vec<Arc<SubscriptionSlot>> {
        self.slots.lock().iter().flatten().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::VarType;
    use std::sync::atomic::Ordering;

    fn callback() -> EventCallback {
        Arc::new(|_, _| {})
    }

    #[test]
    fn test_add_find_remove() {
        let registry = Registry::new();
        let id = Ident::from_label("temp");
        registry
            .add(SubscriptionSlot::with_callback(
                id,
                VarType::Float.bits(),
                callback(),
            ))
            .expect("capacity");

        let found = registry.find(&id).expect("present");
        assert_eq!(found.type_flags, VarType::Float.bits());

        assert!(registry.remove(&id).is_some());
        assert!(registry.find(&id).is_none());
        assert!(registry.remove(&id).is_none());
    }

    #[test]
    fn test_same_id_replaces() {
        let registry = Registry::new();
        let id = Ident::from_label("x");
        registry
            .add(SubscriptionSlot::with_callback(id, VarType::Int32.bits(), callback()))
            .expect("capacity");
        registry
            .add(SubscriptionSlot::with_mirror(id, VarType::Int32.bits()))
            .expect("replaces in place");

        assert_eq!(registry.snapshot().len(), 1);
        assert!(registry.find(&id).expect("present").mirror.is_some());
    }

    #[test]
    fn test_capacity_bound() {
        let registry = Registry::new();
        for n in 0..EVENT_TABLE_CAPACITY {
            registry
                .add(SubscriptionSlot::with_mirror(
                    Ident::from_label(&format!("s{}", n)),
                    VarType::Any.bits(),
                ))
                .expect("capacity left");
        }
        assert!(matches!(
            registry.add(SubscriptionSlot::with_mirror(
                Ident::from_label("overflow"),
                VarType::Any.bits(),
            )),
            Err(Error::NoCapacity)
        ));
    }

    #[test]
    fn test_counter_updates_are_shared() {
        let registry = Registry::new();
        let id = Ident::from_label("n");
        let slot = registry
            .add(SubscriptionSlot::with_mirror(id, VarType::Int32.bits()))
            .expect("capacity");
        slot.update_counter.store(41, Ordering::SeqCst);
        assert_eq!(
            registry
                .find(&id)
                .expect("present")
                .update_counter
                .load(Ordering::SeqCst),
            41
        );
    }
}
