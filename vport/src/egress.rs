// SPDX-License-Identifier: Apache-2.0
// Copyright uswitch Authors

//! Per-core egress buffering.
//!
//! Enqueuing into a multi-producer ring one packet at a time is the
//! expensive part of ring egress, so each pipeline batches outbound packets
//! per port and flushes on cache-full or after a 100 µs cycle deadline.
//! Phy and FIFO-style ports skip the cache (direct I/O); phy tx rings are
//! drained here on the same deadline.

use net::buffer::PacketBuf;

use crate::registry::{PKT_BURST, VportRegistry};
use crate::types::{MAX_VPORTS, VportId, VportType};

/// Slots per port in the egress cache.
pub const TX_CACHE_SLOTS: usize = 32;
/// Flush deadline in microseconds.
pub const FLUSH_DEADLINE_US: u64 = 100;

struct PortCache {
    pkts: Vec<PacketBuf>,
    /// Cycle stamp of the oldest buffered packet (cache) or last drain (phy).
    since: u64,
}

/// One pipeline's egress buffers. Owned by exactly one core; nothing here is
/// shared.
pub struct EgressCache {
    ports: Box<[PortCache]>,
    deadline_cycles: u64,
}

impl EgressCache {
    /// `deadline_cycles` is [`FLUSH_DEADLINE_US`] converted with the
    /// pipeline's calibrated clock.
    #[must_use]
    pub fn new(deadline_cycles: u64) -> EgressCache {
        let ports = (0..MAX_VPORTS)
            .map(|_| PortCache {
                pkts: Vec::with_capacity(TX_CACHE_SLOTS),
                since: 0,
            })
            .collect();
        EgressCache {
            ports,
            deadline_cycles,
        }
    }

    /// Queue (or directly send) one packet toward `id`.
    pub fn send(&mut self, reg: &VportRegistry, id: VportId, pkt: PacketBuf, now_cycles: u64) {
        let ty = VportType::of_id(id).unwrap_or_default();
        if !ty.cached_egress() {
            // direct I/O; phy buffering happens in its own tx ring
            let _ = reg.send(id, pkt);
            return;
        }
        let Some(cache) = self.ports.get_mut(id as usize) else {
            let _ = reg.send(id, pkt);
            return;
        };
        if cache.pkts.is_empty() {
            cache.since = now_cycles;
        }
        cache.pkts.push(pkt);
        if cache.pkts.len() >= TX_CACHE_SLOTS {
            Self::drain(reg, id, cache);
        }
    }

    /// Flush caches past the deadline and drain idle phy tx rings.
    pub fn poll(&mut self, reg: &VportRegistry, now_cycles: u64) {
        for (idx, cache) in self.ports.iter_mut().enumerate() {
            let id = idx as VportId;
            if !cache.pkts.is_empty()
                && now_cycles.wrapping_sub(cache.since) >= self.deadline_cycles
            {
                Self::drain(reg, id, cache);
            }
            let txq = reg.phy_txq_len(id);
            if txq >= PKT_BURST
                || (txq > 0 && now_cycles.wrapping_sub(cache.since) >= self.deadline_cycles)
            {
                reg.flush(id);
                cache.since = now_cycles;
            }
        }
    }

    /// Unconditionally flush everything (shutdown, reconfiguration).
    pub fn flush_all(&mut self, reg: &VportRegistry) {
        for (idx, cache) in self.ports.iter_mut().enumerate() {
            let id = idx as VportId;
            if !cache.pkts.is_empty() {
                Self::drain(reg, id, cache);
            }
            if reg.phy_txq_len(id) > 0 {
                reg.flush(id);
            }
        }
    }

    fn drain(reg: &VportRegistry, id: VportId, cache: &mut PortCache) {
        for pkt in cache.pkts.drain(..) {
            // saturation is counted inside the registry
            let _ = reg.send(id, pkt);
        }
    }

    /// Buffered packets for a port (tests and stats display).
    #[must_use]
    pub fn buffered(&self, id: VportId) -> usize {
        self.ports.get(id as usize).map_or(0, |c| c.pkts.len())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::registry::VportIo;
    use net::buffer::BufferPool;
    use ring::Ring;
    use std::sync::Arc;

    fn client_registry(id: VportId, depth: usize) -> (VportRegistry, Arc<Ring<PacketBuf>>) {
        let reg = VportRegistry::new();
        let to_guest = Arc::new(Ring::new(depth));
        let from_guest = Arc::new(Ring::new(depth));
        reg.configure(
            id,
            VportIo::RingPair {
                to_guest: Arc::clone(&to_guest),
                from_guest,
            },
        )
        .unwrap();
        reg.enable(id);
        (reg, to_guest)
    }

    #[test]
    fn cache_holds_until_full() {
        let pool = BufferPool::new(64);
        let (reg, to_guest) = client_registry(0x01, 64);
        let mut cache = EgressCache::new(1_000_000);

        for _ in 0..TX_CACHE_SLOTS - 1 {
            cache.send(&reg, 0x01, pool.alloc().unwrap(), 0);
        }
        assert_eq!(cache.buffered(0x01), TX_CACHE_SLOTS - 1);
        assert!(to_guest.is_empty());

        cache.send(&reg, 0x01, pool.alloc().unwrap(), 0);
        assert_eq!(cache.buffered(0x01), 0);
        assert_eq!(to_guest.len(), TX_CACHE_SLOTS);
    }

    #[test]
    fn deadline_flushes_partial_cache() {
        let pool = BufferPool::new(8);
        let (reg, to_guest) = client_registry(0x02, 16);
        let mut cache = EgressCache::new(100);

        cache.send(&reg, 0x02, pool.alloc().unwrap(), 1000);
        cache.poll(&reg, 1050);
        assert_eq!(cache.buffered(0x02), 1, "deadline not reached yet");
        cache.poll(&reg, 1101);
        assert_eq!(cache.buffered(0x02), 0);
        assert_eq!(to_guest.len(), 1);
    }

    #[test]
    fn flush_all_empties_everything() {
        let pool = BufferPool::new(8);
        let (reg, to_guest) = client_registry(0x03, 16);
        let mut cache = EgressCache::new(u64::MAX);
        cache.send(&reg, 0x03, pool.alloc().unwrap(), 0);
        cache.flush_all(&reg);
        assert_eq!(to_guest.len(), 1);
        assert_eq!(cache.buffered(0x03), 0);
    }
}
