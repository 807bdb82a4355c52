// SPDX-License-Identifier: Apache-2.0
// Copyright uswitch Authors

//! Shared-memory NIC ("memnic") port regions.
//!
//! A memnic port is a 16 MiB file in `/dev/shm` a guest process maps
//! directly: a 1 MiB header block, a 7 MiB uplink block (switch to guest),
//! a 1 MiB reserved block, and a 7 MiB downlink block (guest to switch).
//! Each data block is a 1 MiB info area followed by 1024 fixed 4 KiB packet
//! slots cycled FREE → USED → FILLED → FREE. One pipeline owns each side's
//! cursor, so slot claims need no atomics beyond the status word ordering
//! the layout already implies.

use std::path::PathBuf;

use rand::Rng;
use tracing::info;

use net::buffer::{BufferPool, PacketBuf};
use shm::{RegionSchema, SharedRegion};

/// Region stamp, bit-exact with the guest driver.
pub const MEMNIC_MAGIC: u32 = 0x4349_4e76;
/// Layout revision.
pub const MEMNIC_VERSION: u32 = 1;
/// Total region size.
pub const MEMNIC_AREA_SIZE: usize = 16 * 1024 * 1024;
/// Packet slots per direction.
pub const MEMNIC_NR_PACKET: usize = 1024;
/// Fixed slot size.
pub const MEMNIC_MAX_PACKET_SIZE: usize = 4096;
/// MTU + Ethernet header + VLAN tag.
pub const MEMNIC_MAX_FRAME_LEN: usize = 1500 + 14 + 4;

const MIB: usize = 1024 * 1024;

// Absolute offsets within the 16 MiB area. The region's {magic, version}
// stamp occupies the first eight bytes of the header block.
const OFF_VALID: usize = 8;
const OFF_RESET: usize = 12;
const OFF_MAC: usize = 24;
const OFF_UP: usize = MIB;
const OFF_RESERVED: usize = 8 * MIB;
const OFF_DOWN: usize = 9 * MIB;

const INFO_PKTS: usize = 8;
const INFO_BYTES: usize = 16;

const SLOT_STATUS: usize = 0;
const SLOT_LEN: usize = 4;
const SLOT_DATA: usize = 8;

const ST_FREE: u32 = 0;
const ST_FILLED: u32 = 2;

const SCHEMA: RegionSchema = RegionSchema {
    magic: MEMNIC_MAGIC,
    version: MEMNIC_VERSION,
    payload_len: MEMNIC_AREA_SIZE - shm::HEADER_LEN,
};

/// Errors from memnic operations.
#[derive(Debug, thiserror::Error)]
pub enum MemnicError {
    #[error(transparent)]
    Region(#[from] shm::RegionError),
    #[error("frame of {0} bytes exceeds the memnic frame limit")]
    FrameTooLong(usize),
    #[error("uplink queue full")]
    QueueFull,
    #[error("region not marked valid by the peer")]
    NotValid,
}

/// The switch-side handle on one memnic region.
pub struct MemnicPort {
    region: SharedRegion,
    up_idx: usize,
    down_idx: usize,
}

fn shm_path(name: &str) -> PathBuf {
    PathBuf::from(format!("/dev/shm/{name}"))
}

impl MemnicPort {
    /// Create `/dev/shm/<name>`, stamp it, seed a locally-administered
    /// unicast MAC, and mark the region valid.
    ///
    /// # Errors
    ///
    /// Region creation failures.
    pub fn create(name: &str) -> Result<MemnicPort, MemnicError> {
        let mut region = SharedRegion::create(shm_path(name), SCHEMA)?;
        let mut mac: [u8; 6] = rand::rng().random();
        mac[0] = (mac[0] | 0x02) & !0x01;
        let payload = region.payload_mut();
        payload[OFF_MAC - 8..OFF_MAC - 8 + 6].copy_from_slice(&mac);
        payload[OFF_VALID - 8..OFF_VALID - 8 + 4].copy_from_slice(&1u32.to_le_bytes());
        info!(name, mac = %net::Mac(mac), "created memnic region");
        Ok(MemnicPort {
            region,
            up_idx: 0,
            down_idx: 0,
        })
    }

    /// Map an existing region, validating magic and version.
    ///
    /// # Errors
    ///
    /// Region open/validation failures.
    pub fn open(name: &str) -> Result<MemnicPort, MemnicError> {
        let region = SharedRegion::open(shm_path(name), SCHEMA)?;
        Ok(MemnicPort {
            region,
            up_idx: 0,
            down_idx: 0,
        })
    }

    fn read_u32(&self, abs: usize) -> u32 {
        let at = abs - shm::HEADER_LEN;
        u32::from_le_bytes(
            self.region.payload()[at..at + 4]
                .try_into()
                .unwrap_or_default(),
        )
    }

    fn write_u32(&mut self, abs: usize, value: u32) {
        let at = abs - shm::HEADER_LEN;
        self.region.payload_mut()[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn read_u64(&self, abs: usize) -> u64 {
        let at = abs - shm::HEADER_LEN;
        u64::from_le_bytes(
            self.region.payload()[at..at + 8]
                .try_into()
                .unwrap_or_default(),
        )
    }

    fn write_u64(&mut self, abs: usize, value: u64) {
        let at = abs - shm::HEADER_LEN;
        self.region.payload_mut()[at..at + 8].copy_from_slice(&value.to_le_bytes());
    }

    const fn slot_off(block: usize, idx: usize) -> usize {
        block + MIB + idx * MEMNIC_MAX_PACKET_SIZE
    }

    /// The MAC seeded at creation.
    #[must_use]
    pub fn mac(&self) -> net::Mac {
        let at = OFF_MAC - shm::HEADER_LEN;
        let bytes: [u8; 6] = self.region.payload()[at..at + 6]
            .try_into()
            .unwrap_or_default();
        net::Mac(bytes)
    }

    /// True when the region is marked valid.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.read_u32(OFF_VALID) == 1
    }

    /// Honor a peer-requested reset: free every slot, rewind both cursors,
    /// and re-validate. Returns true when a reset was performed.
    pub fn handle_reset(&mut self) -> bool {
        if self.read_u32(OFF_RESET) != 1 {
            return false;
        }
        self.write_u32(OFF_VALID, 0);
        for idx in 0..MEMNIC_NR_PACKET {
            self.write_u32(Self::slot_off(OFF_UP, idx) + SLOT_STATUS, ST_FREE);
            self.write_u32(Self::slot_off(OFF_DOWN, idx) + SLOT_STATUS, ST_FREE);
        }
        self.up_idx = 0;
        self.down_idx = 0;
        self.write_u32(OFF_RESET, 0);
        self.write_u32(OFF_VALID, 1);
        true
    }

    /// Copy one frame into the next uplink slot.
    ///
    /// # Errors
    ///
    /// [`MemnicError::QueueFull`] when the guest has not drained the slot,
    /// [`MemnicError::FrameTooLong`] / [`MemnicError::NotValid`] as named.
    pub fn send(&mut self, frame: &[u8]) -> Result<(), MemnicError> {
        if !self.is_valid() {
            return Err(MemnicError::NotValid);
        }
        if frame.len() > MEMNIC_MAX_FRAME_LEN {
            return Err(MemnicError::FrameTooLong(frame.len()));
        }
        let slot = Self::slot_off(OFF_UP, self.up_idx);
        if self.read_u32(slot + SLOT_STATUS) != ST_FREE {
            return Err(MemnicError::QueueFull);
        }
        self.write_u32(slot + SLOT_LEN, frame.len() as u32);
        let at = slot + SLOT_DATA - shm::HEADER_LEN;
        self.region.payload_mut()[at..at + frame.len()].copy_from_slice(frame);
        self.write_u32(slot + SLOT_STATUS, ST_FILLED);
        self.up_idx = (self.up_idx + 1) % MEMNIC_NR_PACKET;

        let pkts = self.read_u64(OFF_UP + INFO_PKTS) + 1;
        self.write_u64(OFF_UP + INFO_PKTS, pkts);
        let bytes = self.read_u64(OFF_UP + INFO_BYTES) + frame.len() as u64;
        self.write_u64(OFF_UP + INFO_BYTES, bytes);
        Ok(())
    }

    /// Take one frame from the next downlink slot, if filled.
    pub fn recv(&mut self, pool: &BufferPool) -> Option<PacketBuf> {
        if self.handle_reset() || !self.is_valid() {
            return None;
        }
        loop {
            let slot = Self::slot_off(OFF_DOWN, self.down_idx);
            if self.read_u32(slot + SLOT_STATUS) != ST_FILLED {
                return None;
            }
            let len = self.read_u32(slot + SLOT_LEN) as usize;
            let frame_ok = len <= MEMNIC_MAX_FRAME_LEN;
            let buf = if frame_ok {
                let at = slot + SLOT_DATA - shm::HEADER_LEN;
                let frame = &self.region.payload()[at..at + len];
                pool.alloc_from(frame).ok()
            } else {
                None
            };
            self.write_u32(slot + SLOT_STATUS, ST_FREE);
            self.down_idx = (self.down_idx + 1) % MEMNIC_NR_PACKET;
            if let Some(buf) = buf {
                return Some(buf);
            }
            if !frame_ok {
                // oversized garbage slot: skip and keep draining
                continue;
            }
            // pool exhausted: stop polling, slot already released
            return None;
        }
    }

    /// Unmap and delete the backing region.
    ///
    /// # Errors
    ///
    /// Filesystem removal failures.
    pub fn destroy(self) -> Result<(), MemnicError> {
        self.region.destroy()?;
        Ok(())
    }

    /// Guest-side helper for tests: fill a downlink slot as a guest driver
    /// would.
    #[doc(hidden)]
    pub fn guest_inject(&mut self, frame: &[u8]) -> Result<(), MemnicError> {
        let slot = Self::slot_off(OFF_DOWN, self.guest_cursor());
        if self.read_u32(slot + SLOT_STATUS) != ST_FREE {
            return Err(MemnicError::QueueFull);
        }
        self.write_u32(slot + SLOT_LEN, frame.len() as u32);
        let at = slot + SLOT_DATA - shm::HEADER_LEN;
        self.region.payload_mut()[at..at + frame.len()].copy_from_slice(frame);
        self.write_u32(slot + SLOT_STATUS, ST_FILLED);
        Ok(())
    }

    fn guest_cursor(&self) -> usize {
        // first non-filled downlink slot from the switch cursor
        let mut idx = self.down_idx;
        for _ in 0..MEMNIC_NR_PACKET {
            let slot = Self::slot_off(OFF_DOWN, idx);
            if self.read_u32(slot + SLOT_STATUS) != ST_FILLED {
                return idx;
            }
            idx = (idx + 1) % MEMNIC_NR_PACKET;
        }
        idx
    }

}

#[cfg(test)]
mod test {
    use super::*;

    fn unique(name: &str) -> String {
        format!("uswitch-memnic-test-{name}-{}", std::process::id())
    }

    #[test]
    fn layout_constants() {
        assert_eq!(MEMNIC_AREA_SIZE, 16 * MIB);
        assert_eq!(OFF_UP, MIB);
        assert_eq!(OFF_RESERVED, 8 * MIB);
        assert_eq!(OFF_DOWN, 9 * MIB);
        // last up slot stays inside the up block
        assert!(MemnicPort::slot_off(OFF_UP, MEMNIC_NR_PACKET - 1) + MEMNIC_MAX_PACKET_SIZE <= OFF_RESERVED);
        // last down slot stays inside the area
        assert!(
            MemnicPort::slot_off(OFF_DOWN, MEMNIC_NR_PACKET - 1) + MEMNIC_MAX_PACKET_SIZE
                <= MEMNIC_AREA_SIZE
        );
    }

    #[test]
    fn create_stamps_and_seeds_mac() {
        let name = unique("mac");
        let port = MemnicPort::create(&name).unwrap();
        assert!(port.is_valid());
        let mac = port.mac();
        assert!(mac.is_local());
        assert!(!mac.is_multicast());
        port.destroy().unwrap();
    }

    #[test]
    fn uplink_send_fills_slots_in_order() {
        let name = unique("up");
        let mut port = MemnicPort::create(&name).unwrap();
        port.send(&[1, 2, 3]).unwrap();
        port.send(&[4, 5]).unwrap();
        assert_eq!(port.read_u32(MemnicPort::slot_off(OFF_UP, 0)), ST_FILLED);
        assert_eq!(port.read_u32(MemnicPort::slot_off(OFF_UP, 1) + SLOT_LEN), 2);
        assert_eq!(port.read_u64(OFF_UP + INFO_PKTS), 2);
        assert_eq!(port.read_u64(OFF_UP + INFO_BYTES), 5);
        port.destroy().unwrap();
    }

    #[test]
    fn downlink_recv_round_trip() {
        let name = unique("down");
        let pool = BufferPool::new(4);
        let mut port = MemnicPort::create(&name).unwrap();
        port.guest_inject(&[0xAB; 60]).unwrap();
        let buf = port.recv(&pool).unwrap();
        assert_eq!(buf.bytes(), &[0xAB; 60]);
        assert!(port.recv(&pool).is_none());
        port.destroy().unwrap();
    }

    #[test]
    fn oversized_frame_rejected() {
        let name = unique("big");
        let mut port = MemnicPort::create(&name).unwrap();
        let big = vec![0u8; MEMNIC_MAX_FRAME_LEN + 1];
        assert!(matches!(
            port.send(&big),
            Err(MemnicError::FrameTooLong(_))
        ));
        port.destroy().unwrap();
    }

    #[test]
    fn reset_protocol_clears_slots() {
        let name = unique("reset");
        let mut port = MemnicPort::create(&name).unwrap();
        port.send(&[1]).unwrap();
        port.write_u32(OFF_RESET, 1);
        assert!(port.handle_reset());
        assert!(port.is_valid());
        assert_eq!(port.read_u32(OFF_RESET), 0);
        assert_eq!(port.read_u32(MemnicPort::slot_off(OFF_UP, 0)), ST_FREE);
        port.destroy().unwrap();
    }
}
