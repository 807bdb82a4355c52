// SPDX-License-Identifier: Apache-2.0
// Copyright uswitch Authors

//! The exact-match flow table.

use ahash::RandomState;
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::trace;

use errno::ErrCode;
use net::FlowKey;
use net::eth::{ETHERTYPE_IPV4, IPPROTO_TCP};
use net::key::tcp_flags;

use crate::action::ActionList;
use crate::clock::TscClock;

/// Capacity of the production table. Tests size their own.
pub const FLOW_TABLE_CAPACITY: usize = 65536;

/// Opaque, stable reference to an installed flow. Valid until the entry is
/// deleted; the daemon stores it instead of re-sending keys.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct FlowHandle(u64);

impl FlowHandle {
    const TAG: u64 = 0x666C_6F77 << 32;

    fn from_slot(slot: usize) -> FlowHandle {
        FlowHandle(Self::TAG | slot as u64)
    }

    fn slot(self) -> usize {
        (self.0 & 0xFFFF_FFFF) as usize
    }

    /// Wire representation for control messages.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Decode a wire handle. `None` when the tag bits are wrong.
    #[must_use]
    pub const fn from_u64(raw: u64) -> Option<FlowHandle> {
        if raw & !0xFFFF_FFFF == Self::TAG {
            Some(FlowHandle(raw))
        } else {
            None
        }
    }
}

/// Per-flow statistics. Advisory: readers may observe a torn snapshot.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FlowStats {
    /// Packets matched.
    pub packet_count: u64,
    /// Bytes matched.
    pub byte_count: u64,
    /// Last-used time in cycles.
    pub used: u64,
    /// Union of TCP flags seen, masked to the six-flag set.
    pub tcp_flags: u8,
}

struct FlowEntry {
    key: FlowKey,
    actions: ActionList,
    stats: Mutex<FlowStats>,
    in_use: bool,
}

impl FlowEntry {
    fn vacant() -> FlowEntry {
        FlowEntry {
            key: FlowKey::default(),
            actions: ActionList::new(),
            stats: Mutex::new(FlowStats::default()),
            in_use: false,
        }
    }

    fn clear(&mut self) {
        self.key = FlowKey::default();
        self.actions.clear();
        *self.stats.lock() = FlowStats::default();
        self.in_use = false;
    }
}

/// Fixed-capacity exact-match table owned by one pipeline.
///
/// Lookups and stats updates take `&self`; structural mutation takes
/// `&mut self` and happens only on the owning pipeline thread while it
/// drains its request ring.
pub struct FlowTable {
    entries: Box<[FlowEntry]>,
    index: HashMap<FlowKey, usize, RandomState>,
    free: Vec<usize>,
    clock: TscClock,
}

impl FlowTable {
    /// A table of `capacity` slots using `clock` for last-used stamps.
    #[must_use]
    pub fn new(capacity: usize, clock: TscClock) -> FlowTable {
        let entries = (0..capacity).map(|_| FlowEntry::vacant()).collect();
        // top-of-stack is slot 0 so fills run in slot order
        let free = (0..capacity).rev().collect();
        FlowTable {
            entries,
            index: HashMap::with_capacity_and_hasher(capacity, RandomState::with_seed(0)),
            free,
            clock,
        }
    }

    /// Live entry count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// True when no flow is installed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Install a flow.
    ///
    /// # Errors
    ///
    /// `Exist` when the key is present, `NoSpc` when the table is full.
    pub fn add(&mut self, key: FlowKey, actions: ActionList) -> Result<FlowHandle, ErrCode> {
        if self.index.contains_key(&key) {
            return Err(ErrCode::Exist);
        }
        let slot = self.free.pop().ok_or(ErrCode::NoSpc)?;
        let entry = &mut self.entries[slot];
        entry.key = key;
        entry.actions = actions;
        *entry.stats.lock() = FlowStats::default();
        entry.in_use = true;
        self.index.insert(key, slot);
        trace!(?key, slot, "flow added");
        Ok(FlowHandle::from_slot(slot))
    }

    /// Replace the action list of an existing flow, optionally resetting
    /// statistics.
    ///
    /// # Errors
    ///
    /// `NoEnt` when the key is absent.
    pub fn modify(
        &mut self,
        key: &FlowKey,
        actions: ActionList,
        clear_stats: bool,
    ) -> Result<(), ErrCode> {
        let slot = *self.index.get(key).ok_or(ErrCode::NoEnt)?;
        let entry = &mut self.entries[slot];
        entry.actions = actions;
        if clear_stats {
            // zero the fields under the entry lock; the lock itself is never
            // re-initialised
            *entry.stats.lock() = FlowStats::default();
        }
        Ok(())
    }

    /// Remove a flow, returning its final statistics.
    ///
    /// # Errors
    ///
    /// `NoEnt` when the key is absent.
    pub fn delete(&mut self, key: &FlowKey) -> Result<FlowStats, ErrCode> {
        let slot = self.index.remove(key).ok_or(ErrCode::NoEnt)?;
        let entry = &mut self.entries[slot];
        let stats = *entry.stats.lock();
        entry.clear();
        self.free.push(slot);
        trace!(?key, slot, "flow deleted");
        Ok(stats)
    }

    /// Copy out a flow's action list and statistics.
    ///
    /// # Errors
    ///
    /// `NoEnt` when the key is absent.
    pub fn get(&self, key: &FlowKey) -> Result<(ActionList, FlowStats), ErrCode> {
        let slot = *self.index.get(key).ok_or(ErrCode::NoEnt)?;
        let entry = &self.entries[slot];
        Ok((entry.actions.clone(), *entry.stats.lock()))
    }

    /// Fast-path lookup.
    #[must_use]
    pub fn lookup(&self, key: &FlowKey) -> Option<FlowHandle> {
        self.index.get(key).map(|slot| FlowHandle::from_slot(*slot))
    }

    /// Action list for a handle returned by [`FlowTable::lookup`].
    #[must_use]
    pub fn actions(&self, handle: FlowHandle) -> Option<&ActionList> {
        let entry = self.entries.get(handle.slot())?;
        entry.in_use.then_some(&entry.actions)
    }

    /// First installed flow in iteration order.
    #[must_use]
    pub fn first(&self) -> Option<(FlowKey, ActionList, FlowStats)> {
        self.scan_from(0)
    }

    /// Flow following `prev` in iteration order. `None` past the end or when
    /// `prev` vanished under the iteration (callers treat both as
    /// end-of-sequence).
    #[must_use]
    pub fn next(&self, prev: &FlowKey) -> Option<(FlowKey, ActionList, FlowStats)> {
        let slot = *self.index.get(prev)?;
        self.scan_from(slot + 1)
    }

    fn scan_from(&self, start: usize) -> Option<(FlowKey, ActionList, FlowStats)> {
        self.entries[start..].iter().find_map(|entry| {
            entry
                .in_use
                .then(|| (entry.key, entry.actions.clone(), *entry.stats.lock()))
        })
    }

    /// Account one matched packet under the per-entry lock: bump counters,
    /// stamp last-used, and OR in the frame's TCP flags when the key is
    /// IPv4/TCP.
    pub fn update_stats(&self, handle: FlowHandle, frame: &[u8]) {
        let Some(entry) = self.entries.get(handle.slot()) else {
            return;
        };
        if !entry.in_use {
            return;
        }
        let flags = if entry.key.ether_type == ETHERTYPE_IPV4 && entry.key.ip_proto == IPPROTO_TCP
        {
            tcp_flags(frame)
        } else {
            0
        };
        let mut stats = entry.stats.lock();
        stats.used = self.clock.cycles();
        stats.packet_count += 1;
        stats.byte_count += frame.len() as u64;
        stats.tcp_flags |= flags;
    }

    /// Delete every entry.
    pub fn flush(&mut self) {
        for entry in &mut self.entries {
            if entry.in_use {
                entry.clear();
            }
        }
        self.index.clear();
        let capacity = self.entries.len();
        self.free = (0..capacity).rev().collect();
    }

    /// The clock used for last-used stamps.
    #[must_use]
    pub const fn clock(&self) -> &TscClock {
        &self.clock
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::action::Action;
    use net::test_frames::FrameSpec;

    fn key(n: u8) -> FlowKey {
        FlowKey {
            in_port: 0x10,
            ether_type: ETHERTYPE_IPV4,
            ip_proto: IPPROTO_TCP,
            ip_src: u32::from(n),
            ip_dst: 0x0a01_01fe,
            tran_src_port: 12345,
            tran_dst_port: 80,
            ..FlowKey::default()
        }
    }

    fn out(vport: u32) -> ActionList {
        let mut actions = ActionList::new();
        actions.push(Action::Output { vport });
        actions
    }

    fn table() -> FlowTable {
        FlowTable::new(16, TscClock::with_hz(1_000_000_000))
    }

    #[test]
    fn add_then_get_returns_actions_and_zero_stats() {
        let mut table = table();
        table.add(key(1), out(0x20)).unwrap();
        let (actions, stats) = table.get(&key(1)).unwrap();
        assert_eq!(actions, out(0x20));
        assert_eq!(stats, FlowStats::default());
    }

    #[test]
    fn duplicate_add_is_exist() {
        let mut table = table();
        table.add(key(1), out(1)).unwrap();
        assert_eq!(table.add(key(1), out(2)).unwrap_err(), ErrCode::Exist);
    }

    #[test]
    fn delete_then_get_is_noent() {
        let mut table = table();
        table.add(key(1), out(1)).unwrap();
        table.delete(&key(1)).unwrap();
        assert_eq!(table.get(&key(1)).unwrap_err(), ErrCode::NoEnt);
        assert_eq!(table.delete(&key(1)).unwrap_err(), ErrCode::NoEnt);
    }

    #[test]
    fn capacity_exhaustion_is_nospc() {
        let mut table = FlowTable::new(2, TscClock::with_hz(1));
        table.add(key(1), out(1)).unwrap();
        table.add(key(2), out(1)).unwrap();
        assert_eq!(table.add(key(3), out(1)).unwrap_err(), ErrCode::NoSpc);
        table.delete(&key(1)).unwrap();
        table.add(key(3), out(1)).unwrap();
    }

    #[test]
    fn handles_stay_stable_and_decode() {
        let mut table = table();
        let handle = table.add(key(1), out(7)).unwrap();
        table.add(key(2), out(8)).unwrap();
        table.delete(&key(2)).unwrap();
        assert_eq!(table.lookup(&key(1)), Some(handle));
        assert_eq!(FlowHandle::from_u64(handle.as_u64()), Some(handle));
        assert_eq!(FlowHandle::from_u64(0xDEAD), None);
        assert_eq!(table.actions(handle), Some(&out(7)));
    }

    #[test]
    fn modify_replaces_actions_and_optionally_stats() {
        let mut table = table();
        let handle = table.add(key(1), out(1)).unwrap();
        let frame = FrameSpec {
            tcp: Some((12345, 80)),
            ..FrameSpec::default()
        }
        .build();
        table.update_stats(handle, &frame);

        table.modify(&key(1), out(2), false).unwrap();
        let (actions, stats) = table.get(&key(1)).unwrap();
        assert_eq!(actions, out(2));
        assert_eq!(stats.packet_count, 1);

        table.modify(&key(1), out(3), true).unwrap();
        let (_, stats) = table.get(&key(1)).unwrap();
        assert_eq!(stats.packet_count, 0);
        assert_eq!(stats.used, 0);

        assert_eq!(
            table.modify(&key(9), out(1), false).unwrap_err(),
            ErrCode::NoEnt
        );
    }

    #[test]
    fn stats_accumulate_and_union_tcp_flags() {
        let mut table = table();
        let handle = table.add(key(1), out(1)).unwrap();
        let mut syn = FrameSpec {
            tcp: Some((12345, 80)),
            ..FrameSpec::default()
        }
        .build();
        syn[14 + 20 + 13] = 0x02;
        let mut ack = syn.clone();
        ack[14 + 20 + 13] = 0x10;

        table.update_stats(handle, &syn);
        table.update_stats(handle, &ack);

        let (_, stats) = table.get(&key(1)).unwrap();
        assert_eq!(stats.packet_count, 2);
        assert_eq!(stats.byte_count, (syn.len() + ack.len()) as u64);
        assert_eq!(stats.tcp_flags, 0x12);
        assert_ne!(stats.used, 0);
    }

    #[test]
    fn iteration_visits_each_entry_once() {
        let mut table = table();
        for n in 1..=3 {
            table.add(key(n), out(u32::from(n))).unwrap();
        }
        let mut seen = Vec::new();
        let (mut cursor, _, _) = table.first().unwrap();
        seen.push(cursor);
        while let Some((next_key, _, _)) = table.next(&cursor) {
            seen.push(next_key);
            cursor = next_key;
        }
        assert_eq!(seen.len(), 3);
        seen.sort_by_key(|k| k.ip_src);
        seen.dedup();
        assert_eq!(seen, vec![key(1), key(2), key(3)]);
    }

    #[test]
    fn next_after_vanished_cursor_ends_sequence() {
        let mut table = table();
        table.add(key(1), out(1)).unwrap();
        table.add(key(2), out(2)).unwrap();
        table.delete(&key(1)).unwrap();
        assert!(table.next(&key(1)).is_none());
    }

    #[test]
    fn flush_removes_everything() {
        let mut table = table();
        for n in 1..=5 {
            table.add(key(n), out(1)).unwrap();
        }
        table.flush();
        assert!(table.is_empty());
        assert!(table.first().is_none());
        // slots reusable after flush
        for n in 1..=5 {
            table.add(key(n), out(1)).unwrap();
        }
    }
}
