// SPDX-License-Identifier: Apache-2.0
// Copyright uswitch Authors

//! The daemon's persistent flow shadow.
//!
//! A flat array of `(key, handle, valid)` entries in a mapped file, sized to
//! the data-plane flow-table capacity and scanned linearly under one mutex.
//! Restarting daemons reattach and recover every handle they had installed.

use std::path::Path;

use parking_lot::Mutex;

use errno::ErrCode;
use net::FlowKey;
use shm::{RegionSchema, SharedRegion};

/// Historic location of the shadow file.
pub const FLOW_TABLE_PATH: &str = "/tmp/dpdk_flow_table";

const SHADOW_MAGIC: u32 = 0x666C_7774; // "flwt"
const SHADOW_VERSION: u32 = 1;

const ENTRY_LEN: usize = 56;
const E_KEY: usize = 0;
const E_HANDLE: usize = 40;
const E_VALID: usize = 48;

fn schema(capacity: usize) -> RegionSchema {
    RegionSchema {
        magic: SHADOW_MAGIC,
        version: SHADOW_VERSION,
        payload_len: capacity * ENTRY_LEN,
    }
}

struct Inner {
    region: SharedRegion,
    capacity: usize,
}

impl Inner {
    fn entry(&self, pos: usize) -> &[u8] {
        &self.region.payload()[pos * ENTRY_LEN..(pos + 1) * ENTRY_LEN]
    }

    fn valid(&self, pos: usize) -> bool {
        self.entry(pos)[E_VALID] != 0
    }

    fn key_at(&self, pos: usize) -> Option<FlowKey> {
        FlowKey::from_wire(&self.entry(pos)[E_KEY..E_KEY + FlowKey::WIRE_LEN])
    }

    fn handle_at(&self, pos: usize) -> u64 {
        u64::from_le_bytes(
            self.entry(pos)[E_HANDLE..E_HANDLE + 8]
                .try_into()
                .unwrap_or_default(),
        )
    }

    fn position_of(&self, key: &FlowKey) -> Option<usize> {
        (0..self.capacity).find(|pos| self.valid(*pos) && self.key_at(*pos) == Some(*key))
    }

    fn write(&mut self, pos: usize, key: &FlowKey, handle: u64, valid: bool) {
        let at = pos * ENTRY_LEN;
        let slot = &mut self.region.payload_mut()[at..at + ENTRY_LEN];
        slot[E_KEY..E_KEY + FlowKey::WIRE_LEN].copy_from_slice(&key.to_wire());
        slot[E_HANDLE..E_HANDLE + 8].copy_from_slice(&handle.to_le_bytes());
        slot[E_VALID] = u8::from(valid);
    }
}

/// Handle on the mapped shadow.
pub struct FlowShadow {
    inner: Mutex<Inner>,
}

impl FlowShadow {
    /// Create the shadow file for `capacity` entries, zeroed.
    ///
    /// # Errors
    ///
    /// Region failures (fatal at daemon startup).
    pub fn create(path: impl AsRef<Path>, capacity: usize) -> Result<FlowShadow, shm::RegionError> {
        Ok(FlowShadow {
            inner: Mutex::new(Inner {
                region: SharedRegion::create(path, schema(capacity))?,
                capacity,
            }),
        })
    }

    /// Reattach to an existing shadow, creating it when absent or stale.
    ///
    /// # Errors
    ///
    /// Region failures (fatal at daemon startup).
    pub fn open_or_create(
        path: impl AsRef<Path>,
        capacity: usize,
    ) -> Result<FlowShadow, shm::RegionError> {
        Ok(FlowShadow {
            inner: Mutex::new(Inner {
                region: SharedRegion::open_or_create(path, schema(capacity))?,
                capacity,
            }),
        })
    }

    /// Record `key -> handle`, updating in place when the key is already
    /// present.
    ///
    /// # Errors
    ///
    /// `NoSpc` when every slot is valid.
    pub fn insert(&self, key: &FlowKey, handle: u64) -> Result<(), ErrCode> {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.position_of(key) {
            inner.write(pos, key, handle, true);
            return Ok(());
        }
        let free = (0..inner.capacity)
            .find(|pos| !inner.valid(*pos))
            .ok_or(ErrCode::NoSpc)?;
        inner.write(free, key, handle, true);
        Ok(())
    }

    /// The handle recorded for `key`.
    #[must_use]
    pub fn find(&self, key: &FlowKey) -> Option<u64> {
        let inner = self.inner.lock();
        inner.position_of(key).map(|pos| inner.handle_at(pos))
    }

    /// Drop the record for `key`.
    ///
    /// # Errors
    ///
    /// `NoEnt` when absent.
    pub fn remove(&self, key: &FlowKey) -> Result<(), ErrCode> {
        let mut inner = self.inner.lock();
        let pos = inner.position_of(key).ok_or(ErrCode::NoEnt)?;
        let at = pos * ENTRY_LEN;
        inner.region.payload_mut()[at + E_VALID] = 0;
        Ok(())
    }

    /// Next valid entry at or after slot `from` (daemon-side dump cursor).
    #[must_use]
    pub fn next(&self, from: usize) -> Option<(usize, FlowKey, u64)> {
        let inner = self.inner.lock();
        (from..inner.capacity).find_map(|pos| {
            if !inner.valid(pos) {
                return None;
            }
            inner.key_at(pos).map(|key| (pos, key, inner.handle_at(pos)))
        })
    }

    /// Count of valid records.
    #[must_use]
    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        (0..inner.capacity).filter(|pos| inner.valid(*pos)).count()
    }

    /// True when no record is valid.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invalidate every record.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        for pos in 0..inner.capacity {
            let at = pos * ENTRY_LEN;
            inner.region.payload_mut()[at + E_VALID] = 0;
        }
    }

    /// Unmap and delete the shadow file.
    ///
    /// # Errors
    ///
    /// Filesystem removal failures.
    pub fn destroy(self) -> Result<(), shm::RegionError> {
        self.inner.into_inner().region.destroy()
    }
}
