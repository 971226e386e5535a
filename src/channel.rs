// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
//
//! The channel table (spec.md §3): local channel numbers are allocated
//! monotonically and never reused; entries own a channel operator (flow
//! control bookkeeping) and an event handler, and are disposed on channel
//! death or detach.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;

/// A local channel number. Unique for the connection's lifetime
/// (spec.md §3 Invariants).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u32);

/// RFC 4254 §5.1 `SSH_MSG_CHANNEL_OPEN_FAILURE` reason codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOpenFailure {
    AdministrativelyProhibited,
    ConnectFailed,
    UnknownChannelType,
    ResourceShortage,
}

impl ChannelOpenFailure {
    pub fn from_u32(code: u32) -> Option<Self> {
        match code {
            1 => Some(ChannelOpenFailure::AdministrativelyProhibited),
            2 => Some(ChannelOpenFailure::ConnectFailed),
            3 => Some(ChannelOpenFailure::UnknownChannelType),
            4 => Some(ChannelOpenFailure::ResourceShortage),
            _ => None,
        }
    }

    pub fn code(self) -> u32 {
        match self {
            ChannelOpenFailure::AdministrativelyProhibited => 1,
            ChannelOpenFailure::ConnectFailed => 2,
            ChannelOpenFailure::UnknownChannelType => 3,
            ChannelOpenFailure::ResourceShortage => 4,
        }
    }
}

/// Per-per-channel application logic is out of scope (spec.md §1); this is
/// the narrow seam the core calls into for channel-level events.
pub trait ChannelHandler: Send {
    #[allow(unused_variables)]
    fn open_confirmed(&mut self) {}
    #[allow(unused_variables)]
    fn open_failed(&mut self, reason: ChannelOpenFailure, description: &str) {}
    #[allow(unused_variables)]
    fn data(&mut self, data: &[u8]) {}
    #[allow(unused_variables)]
    fn extended_data(&mut self, code: u32, data: &[u8]) {}
    fn eof(&mut self) {}
    fn close(&mut self) {}
    #[allow(unused_variables)]
    fn window_adjusted(&mut self, new_window: u32) {}
    /// `SSH_MSG_CHANNEL_SUCCESS` for the most recent `CHANNEL_REQUEST`
    /// (RFC 4254 §6.5).
    fn request_success(&mut self) {}
    /// `SSH_MSG_CHANNEL_FAILURE` for the most recent `CHANNEL_REQUEST`.
    fn request_failure(&mut self) {}
}

/// The flow-control and identity bookkeeping for one channel
/// (spec.md §3: "channel operator").
pub struct ChannelOperator {
    pub local_id: ChannelId,
    pub remote_id: u32,
    pub local_window_size: u32,
    pub remote_window_size: u32,
    pub local_max_packet_size: u32,
    pub remote_max_packet_size: u32,
    pub confirmed: bool,
    /// Bytes of `CHANNEL_DATA`/`CHANNEL_EXTENDED_DATA` payload delivered
    /// since the last `CHANNEL_WINDOW_ADJUST` we sent (SPEC_FULL.md §H).
    pub consumed_since_adjust: u32,
}

struct Entry {
    operator: ChannelOperator,
    handler: Box<dyn ChannelHandler>,
}

/// Mapping from local channel number to {operator, handler}
/// (spec.md §3 Data Model).
pub struct ChannelTable {
    next_id: AtomicU32,
    entries: RwLock<HashMap<ChannelId, Entry>>,
}

impl ChannelTable {
    pub fn new() -> Self {
        ChannelTable {
            next_id: AtomicU32::new(0),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Allocates the next local channel number. Monotonic, never reused
    /// (spec.md §3 Invariants).
    pub fn allocate_id(&self) -> ChannelId {
        ChannelId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    pub fn insert(&self, operator: ChannelOperator, handler: Box<dyn ChannelHandler>) {
        let id = operator.local_id;
        self.entries
            .write()
            .expect("channel table lock poisoned")
            .insert(id, Entry { operator, handler });
    }

    pub fn remove(&self, id: ChannelId) -> bool {
        self.entries.write().expect("channel table lock poisoned").remove(&id).is_some()
    }

    pub fn contains(&self, id: ChannelId) -> bool {
        self.entries.read().expect("channel table lock poisoned").contains_key(&id)
    }

    pub fn with_mut<R>(&self, id: ChannelId, f: impl FnOnce(&mut ChannelOperator, &mut dyn ChannelHandler) -> R) -> Option<R> {
        let mut entries = self.entries.write().expect("channel table lock poisoned");
        entries.get_mut(&id).map(|e| f(&mut e.operator, &mut *e.handler))
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("channel table lock poisoned").len()
    }
}

impl Default for ChannelTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn operator(local_id: ChannelId) -> ChannelOperator {
        ChannelOperator {
            local_id,
            remote_id: 0,
            local_window_size: 2097152,
            remote_window_size: 0,
            local_max_packet_size: 32768,
            remote_max_packet_size: 0,
            confirmed: false,
            consumed_since_adjust: 0,
        }
    }

    struct NullHandler;
    impl ChannelHandler for NullHandler {}

    #[test]
    fn channel_open_failure_round_trips_through_wire_codes() {
        for code in 1u32..=4 {
            let reason = ChannelOpenFailure::from_u32(code).expect("1..=4 are all valid");
            assert_eq!(reason.code(), code);
        }
        assert!(ChannelOpenFailure::from_u32(0).is_none());
        assert!(ChannelOpenFailure::from_u32(5).is_none());
    }

    #[test]
    fn allocate_id_is_monotonic_and_never_reused() {
        let table = ChannelTable::new();
        let a = table.allocate_id();
        let b = table.allocate_id();
        let c = table.allocate_id();
        assert_eq!(a, ChannelId(0));
        assert_eq!(b, ChannelId(1));
        assert_eq!(c, ChannelId(2));
        table.insert(operator(a), Box::new(NullHandler));
        table.remove(a);
        // a's number is never handed out again even after it's removed.
        let d = table.allocate_id();
        assert_eq!(d, ChannelId(3));
    }

    #[test]
    fn insert_contains_remove_round_trip() {
        let table = ChannelTable::new();
        let id = table.allocate_id();
        assert!(!table.contains(id));
        table.insert(operator(id), Box::new(NullHandler));
        assert!(table.contains(id));
        assert_eq!(table.len(), 1);
        assert!(table.remove(id));
        assert!(!table.contains(id));
        assert!(!table.remove(id));
    }

    #[test]
    fn with_mut_on_missing_id_returns_none() {
        let table = ChannelTable::new();
        let result = table.with_mut(ChannelId(42), |_, _| panic!("must not be called"));
        assert!(result.is_none());
    }

    #[test]
    fn with_mut_exposes_operator_and_handler_for_update() {
        let table = ChannelTable::new();
        let id = table.allocate_id();
        table.insert(operator(id), Box::new(NullHandler));
        let window = table
            .with_mut(id, |op, _handler| {
                op.consumed_since_adjust += 100;
                op.local_window_size
            })
            .expect("entry exists");
        assert_eq!(window, 2097152);
        let consumed = table.with_mut(id, |op, _| op.consumed_since_adjust).unwrap();
        assert_eq!(consumed, 100);
    }
}
