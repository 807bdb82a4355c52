// SPDX-License-Identifier: Apache-2.0
// Copyright uswitch Authors

//! The persistent, memory-mapped vport table shared with the control daemon.
//!
//! The table survives daemon restarts: on reattach the daemon reads back
//! which ids are claimed, their types, names, and the pipeline each port was
//! placed on. All access is serialised by one table-wide mutex; individual
//! fields are stable after publication, so the data plane reads entries
//! without taking it.

use std::path::Path;

use parking_lot::Mutex;
use tracing::debug;

use errno::ErrCode;
use shm::{RegionSchema, SharedRegion};

use crate::types::{MAX_VPORT_NAME, MAX_VPORTS, VportId, VportType};

/// Historic location of the table file.
pub const VPORT_TABLE_PATH: &str = "/tmp/dpif_dpdk_vport_table";

const TABLE_MAGIC: u32 = 0x7670_7274; // "vprt"
const TABLE_VERSION: u32 = 1;

// entry layout
const ENTRY_LEN: usize = 40;
const E_IN_USE: usize = 0;
const E_LCORE: usize = 1;
const E_TYPE: usize = 5;
const E_NAME: usize = 6;

const SCHEMA: RegionSchema = RegionSchema {
    magic: TABLE_MAGIC,
    version: TABLE_VERSION,
    payload_len: ENTRY_LEN * MAX_VPORTS,
};

/// One decoded table entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShadowVport {
    pub in_use: bool,
    pub lcore: u32,
    pub ty: VportType,
    pub name: String,
}

/// Handle on the mapped table.
pub struct VportShadow {
    region: Mutex<SharedRegion>,
}

impl VportShadow {
    /// Create the table file (zeroing every entry) at `path`.
    ///
    /// # Errors
    ///
    /// Region failures are fatal at startup and surfaced verbatim.
    pub fn create(path: impl AsRef<Path>) -> Result<VportShadow, shm::RegionError> {
        Ok(VportShadow {
            region: Mutex::new(SharedRegion::create(path, SCHEMA)?),
        })
    }

    /// Attach to an existing table, or create it when absent or stale.
    ///
    /// # Errors
    ///
    /// Region failures are fatal at startup and surfaced verbatim.
    pub fn open_or_create(path: impl AsRef<Path>) -> Result<VportShadow, shm::RegionError> {
        Ok(VportShadow {
            region: Mutex::new(SharedRegion::open_or_create(path, SCHEMA)?),
        })
    }

    fn decode(payload: &[u8], id: VportId) -> ShadowVport {
        let at = id as usize * ENTRY_LEN;
        let entry = &payload[at..at + ENTRY_LEN];
        let name_bytes = &entry[E_NAME..E_NAME + MAX_VPORT_NAME];
        let name_len = name_bytes.iter().position(|b| *b == 0).unwrap_or(MAX_VPORT_NAME);
        ShadowVport {
            in_use: entry[E_IN_USE] != 0,
            lcore: u32::from_le_bytes(entry[E_LCORE..E_LCORE + 4].try_into().unwrap_or_default()),
            ty: VportType::from_wire(entry[E_TYPE]).unwrap_or_default(),
            name: String::from_utf8_lossy(&name_bytes[..name_len]).into_owned(),
        }
    }

    fn encode(payload: &mut [u8], id: VportId, entry: &ShadowVport) {
        let at = id as usize * ENTRY_LEN;
        let slot = &mut payload[at..at + ENTRY_LEN];
        slot[E_IN_USE] = u8::from(entry.in_use);
        slot[E_LCORE..E_LCORE + 4].copy_from_slice(&entry.lcore.to_le_bytes());
        slot[E_TYPE] = entry.ty.as_wire();
        let name = entry.name.as_bytes();
        let take = name.len().min(MAX_VPORT_NAME);
        slot[E_NAME..E_NAME + take].copy_from_slice(&name[..take]);
        for byte in &mut slot[E_NAME + take..E_NAME + MAX_VPORT_NAME] {
            *byte = 0;
        }
    }

    /// Claim a specific id.
    ///
    /// # Errors
    ///
    /// `Busy` when the id is claimed, `Inval` when the id is outside the
    /// type's range or the name too long.
    pub fn claim(
        &self,
        id: VportId,
        ty: VportType,
        lcore: u32,
        name: &str,
    ) -> Result<(), ErrCode> {
        if !ty.id_range().contains(&id) || name.len() > MAX_VPORT_NAME {
            return Err(ErrCode::Inval);
        }
        let mut region = self.region.lock();
        if Self::decode(region.payload(), id).in_use {
            return Err(ErrCode::Busy);
        }
        Self::encode(
            region.payload_mut(),
            id,
            &ShadowVport {
                in_use: true,
                lcore,
                ty,
                name: name.to_string(),
            },
        );
        debug!(id, ?ty, lcore, "claimed vport table entry");
        Ok(())
    }

    /// Claim the first free id in the type's range.
    ///
    /// # Errors
    ///
    /// `NoSpc` when the range is exhausted, `Inval` for oversized names.
    pub fn claim_next(&self, ty: VportType, lcore: u32, name: &str) -> Result<VportId, ErrCode> {
        if name.len() > MAX_VPORT_NAME {
            return Err(ErrCode::Inval);
        }
        let mut region = self.region.lock();
        let free = ty
            .id_range()
            .find(|id| !Self::decode(region.payload(), *id).in_use)
            .ok_or(ErrCode::NoSpc)?;
        Self::encode(
            region.payload_mut(),
            free,
            &ShadowVport {
                in_use: true,
                lcore,
                ty,
                name: name.to_string(),
            },
        );
        debug!(id = free, ?ty, lcore, "claimed vport table entry");
        Ok(free)
    }

    /// Release an id. The entry's type, name and placement are preserved for
    /// idempotent re-adds and post-mortem inspection.
    ///
    /// # Errors
    ///
    /// `NoEnt` when the id was not claimed.
    pub fn release(&self, id: VportId) -> Result<(), ErrCode> {
        let mut region = self.region.lock();
        if id as usize >= MAX_VPORTS {
            return Err(ErrCode::Inval);
        }
        let entry = Self::decode(region.payload(), id);
        if !entry.in_use {
            return Err(ErrCode::NoEnt);
        }
        let at = id as usize * ENTRY_LEN;
        region.payload_mut()[at + E_IN_USE] = 0;
        Ok(())
    }

    /// Read one entry.
    #[must_use]
    pub fn get(&self, id: VportId) -> Option<ShadowVport> {
        if id as usize >= MAX_VPORTS {
            return None;
        }
        let region = self.region.lock();
        Some(Self::decode(region.payload(), id))
    }

    /// First claimed id at or after `from`.
    #[must_use]
    pub fn next_in_use(&self, from: VportId) -> Option<(VportId, ShadowVport)> {
        let region = self.region.lock();
        (from..MAX_VPORTS as VportId).find_map(|id| {
            let entry = Self::decode(region.payload(), id);
            entry.in_use.then_some((id, entry))
        })
    }

    /// Resolve a claimed entry by name.
    #[must_use]
    pub fn name_to_id(&self, name: &str) -> Option<VportId> {
        let region = self.region.lock();
        (0..MAX_VPORTS as VportId).find(|id| {
            let entry = Self::decode(region.payload(), *id);
            entry.in_use && entry.name == name
        })
    }

    /// Release every entry.
    pub fn reset(&self) {
        let mut region = self.region.lock();
        for id in 0..MAX_VPORTS {
            region.payload_mut()[id * ENTRY_LEN + E_IN_USE] = 0;
        }
    }

    /// Unmap and delete the table file.
    ///
    /// # Errors
    ///
    /// Filesystem removal failures.
    pub fn destroy(self) -> Result<(), shm::RegionError> {
        self.region.into_inner().destroy()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::path::PathBuf;

    fn tmp(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("uswitch-vport-table-{name}-{}", std::process::id()));
        p
    }

    #[test]
    fn claim_persists_across_reopen() {
        let path = tmp("reopen");
        let table = VportShadow::create(&path).unwrap();
        table.claim(0x10, VportType::Phy, 2, "phy0").unwrap();
        drop(table);

        let table = VportShadow::open_or_create(&path).unwrap();
        let entry = table.get(0x10).unwrap();
        assert!(entry.in_use);
        assert_eq!(entry.lcore, 2);
        assert_eq!(entry.ty, VportType::Phy);
        assert_eq!(entry.name, "phy0");
        table.destroy().unwrap();
    }

    #[test]
    fn claim_same_id_twice_is_busy() {
        let path = tmp("busy");
        let table = VportShadow::create(&path).unwrap();
        table.claim(0x11, VportType::Phy, 0, "a").unwrap();
        assert_eq!(
            table.claim(0x11, VportType::Phy, 0, "b").unwrap_err(),
            ErrCode::Busy
        );
        table.destroy().unwrap();
    }

    #[test]
    fn claim_outside_range_is_inval() {
        let path = tmp("range");
        let table = VportShadow::create(&path).unwrap();
        assert_eq!(
            table.claim(0x10, VportType::Client, 0, "x").unwrap_err(),
            ErrCode::Inval
        );
        table.destroy().unwrap();
    }

    #[test]
    fn claim_next_walks_the_range() {
        let path = tmp("next");
        let table = VportShadow::create(&path).unwrap();
        assert_eq!(table.claim_next(VportType::Client, 0, "c0").unwrap(), 0x00);
        assert_eq!(table.claim_next(VportType::Client, 1, "c1").unwrap(), 0x01);
        table.release(0x00).unwrap();
        assert_eq!(table.claim_next(VportType::Client, 2, "c2").unwrap(), 0x00);
        table.destroy().unwrap();
    }

    #[test]
    fn release_preserves_fields() {
        let path = tmp("release");
        let table = VportShadow::create(&path).unwrap();
        table.claim(0x20, VportType::Kni, 3, "kni0").unwrap();
        table.release(0x20).unwrap();
        let entry = table.get(0x20).unwrap();
        assert!(!entry.in_use);
        assert_eq!(entry.name, "kni0");
        assert_eq!(entry.ty, VportType::Kni);
        assert_eq!(table.release(0x20).unwrap_err(), ErrCode::NoEnt);
        table.destroy().unwrap();
    }

    #[test]
    fn iteration_and_name_lookup() {
        let path = tmp("iter");
        let table = VportShadow::create(&path).unwrap();
        table.claim(0x00, VportType::Client, 0, "c0").unwrap();
        table.claim(0x10, VportType::Phy, 1, "p0").unwrap();
        let (first, _) = table.next_in_use(0).unwrap();
        assert_eq!(first, 0x00);
        let (second, entry) = table.next_in_use(first + 1).unwrap();
        assert_eq!(second, 0x10);
        assert_eq!(entry.name, "p0");
        assert!(table.next_in_use(second + 1).is_none());
        assert_eq!(table.name_to_id("p0"), Some(0x10));
        table.reset();
        assert!(table.next_in_use(0).is_none());
        table.destroy().unwrap();
    }
}
