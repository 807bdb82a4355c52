// SPDX-License-Identifier: Apache-2.0
// Copyright uswitch Authors

//! Port and switch statistics.
//!
//! Counters are plain relaxed atomics: writers are the owning pipeline,
//! readers are the control path, and torn cross-field snapshots are
//! acceptable (counters are advisory). Every counter is monotonic
//! non-decreasing until an explicit clear.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live per-port counters.
#[derive(Debug, Default)]
pub struct PortStats {
    rx: AtomicU64,
    tx: AtomicU64,
    rx_bytes: AtomicU64,
    tx_bytes: AtomicU64,
    rx_drop: AtomicU64,
    tx_drop: AtomicU64,
    rx_error: AtomicU64,
    tx_error: AtomicU64,
}

/// Copied-out counter values, as carried in vport control replies.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PortStatsSnapshot {
    pub rx: u64,
    pub tx: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_drop: u64,
    pub tx_drop: u64,
    pub rx_error: u64,
    pub tx_error: u64,
}

impl PortStats {
    pub fn inc_rx(&self, packets: u64, bytes: u64) {
        self.rx.fetch_add(packets, Ordering::Relaxed);
        self.rx_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn inc_tx(&self, packets: u64, bytes: u64) {
        self.tx.fetch_add(packets, Ordering::Relaxed);
        self.tx_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn inc_rx_drop(&self, packets: u64) {
        self.rx_drop.fetch_add(packets, Ordering::Relaxed);
    }

    pub fn inc_tx_drop(&self, packets: u64) {
        self.tx_drop.fetch_add(packets, Ordering::Relaxed);
    }

    pub fn inc_rx_error(&self, packets: u64) {
        self.rx_error.fetch_add(packets, Ordering::Relaxed);
    }

    pub fn inc_tx_error(&self, packets: u64) {
        self.tx_error.fetch_add(packets, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> PortStatsSnapshot {
        PortStatsSnapshot {
            rx: self.rx.load(Ordering::Relaxed),
            tx: self.tx.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            rx_drop: self.rx_drop.load(Ordering::Relaxed),
            tx_drop: self.tx_drop.load(Ordering::Relaxed),
            rx_error: self.rx_error.load(Ordering::Relaxed),
            tx_error: self.tx_error.load(Ordering::Relaxed),
        }
    }

    /// Reset every counter to zero.
    pub fn clear(&self) {
        self.rx.store(0, Ordering::Relaxed);
        self.tx.store(0, Ordering::Relaxed);
        self.rx_bytes.store(0, Ordering::Relaxed);
        self.tx_bytes.store(0, Ordering::Relaxed);
        self.rx_drop.store(0, Ordering::Relaxed);
        self.tx_drop.store(0, Ordering::Relaxed);
        self.rx_error.store(0, Ordering::Relaxed);
        self.tx_error.store(0, Ordering::Relaxed);
    }
}

/// Switch-wide drop counters, separate from any port.
#[derive(Debug, Default)]
pub struct SwitchStats {
    rx_drop: AtomicU64,
    tx_drop: AtomicU64,
}

impl SwitchStats {
    /// Packets dropped by the action pipeline (explicit drops and misses
    /// that could not be upcalled).
    pub fn inc_rx_drop(&self, packets: u64) {
        self.rx_drop.fetch_add(packets, Ordering::Relaxed);
    }

    /// Packets dropped on saturated egress.
    pub fn inc_tx_drop(&self, packets: u64) {
        self.tx_drop.fetch_add(packets, Ordering::Relaxed);
    }

    #[must_use]
    pub fn rx_drop(&self) -> u64 {
        self.rx_drop.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn tx_drop(&self) -> u64 {
        self.tx_drop.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.rx_drop.store(0, Ordering::Relaxed);
        self.tx_drop.store(0, Ordering::Relaxed);
    }
}
