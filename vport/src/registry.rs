// SPDX-License-Identifier: Apache-2.0
// Copyright uswitch Authors

//! The vport registry: dispatch point for all port I/O.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use arrayvec::ArrayString;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use errno::ErrCode;
use net::buffer::{BufferPool, PacketBuf};
use ring::Ring;

use crate::dev::PhyDriver;
use crate::memnic::MemnicPort;
use crate::stats::{PortStats, PortStatsSnapshot, SwitchStats};
use crate::types::{MAX_VPORT_NAME, MAX_VPORTS, VportId, VportType};

/// Packets moved per burst everywhere in the switch.
pub const PKT_BURST: usize = 32;

/// Depth of a phy port's local tx drain ring: one burst of slack on top of
/// the burst being drained.
const PHY_TXQ_SIZE: usize = PKT_BURST * 2;

/// Errors from registry configuration (startup-time) operations.
#[derive(Debug, thiserror::Error)]
pub enum VportError {
    #[error("vport id {0:#x} is outside every type range")]
    BadId(VportId),
    #[error("vport id {0:#x} is already configured")]
    AlreadyConfigured(VportId),
    #[error("io descriptor does not match the type owning id {0:#x}")]
    IoMismatch(VportId),
    #[error("port name longer than {MAX_VPORT_NAME} bytes")]
    NameTooLong,
}

/// Type-specific I/O descriptor of a configured port.
pub enum VportIo {
    /// Slot not populated.
    None,
    /// Physical NIC: driver plus the single-consumer tx drain ring.
    Phy {
        dev: Box<dyn PhyDriver>,
        txq: Ring<PacketBuf>,
    },
    /// Ring-pair port (client, kni, veth, vhost): `to_guest` carries egress,
    /// `from_guest` ingress.
    RingPair {
        to_guest: Arc<Ring<PacketBuf>>,
        from_guest: Arc<Ring<PacketBuf>>,
    },
    /// Shared-memory NIC region.
    Memnic { port: Mutex<MemnicPort> },
    /// The daemon's own port; carries no direct I/O (exception traffic goes
    /// over the control channel).
    Vswitchd,
}

impl VportIo {
    /// Wrap a memnic region as a port descriptor.
    #[must_use]
    pub fn memnic(port: MemnicPort) -> VportIo {
        VportIo::Memnic {
            port: Mutex::new(port),
        }
    }

    fn matches(&self, ty: VportType) -> bool {
        match self {
            VportIo::None => false,
            VportIo::Phy { .. } => ty == VportType::Phy,
            VportIo::RingPair { .. } => matches!(
                ty,
                VportType::Client
                    | VportType::Kni
                    | VportType::Veth
                    | VportType::Vhost
                    | VportType::Bridge
            ),
            VportIo::Memnic { .. } => ty == VportType::Memnic,
            VportIo::Vswitchd => ty == VportType::Vswitchd,
        }
    }
}

struct PortConfig {
    name: ArrayString<MAX_VPORT_NAME>,
    io: VportIo,
}

struct Vport {
    enabled: AtomicBool,
    owning_pipeline: AtomicU32,
    stats: PortStats,
    config: RwLock<PortConfig>,
}

impl Vport {
    fn vacant() -> Vport {
        Vport {
            enabled: AtomicBool::new(false),
            owning_pipeline: AtomicU32::new(0),
            stats: PortStats::default(),
            config: RwLock::new(PortConfig {
                name: ArrayString::new(),
                io: VportIo::None,
            }),
        }
    }
}

fn default_name(ty: VportType, id: VportId) -> ArrayString<MAX_VPORT_NAME> {
    let index = id - ty.id_range().start;
    let name = match ty {
        VportType::Client => format!("client{index}"),
        VportType::Phy => format!("phy{index}"),
        VportType::Kni => format!("kni{index}"),
        VportType::Veth => format!("veth{index}"),
        VportType::Vhost => format!("vhost{index}"),
        VportType::Memnic => format!("memnic{index}"),
        VportType::Bridge => format!("bridge{index}"),
        VportType::Vswitchd => String::from("vswitchd"),
        VportType::Disabled => String::new(),
    };
    ArrayString::from(&name).unwrap_or_default()
}

/// Table of every port the switch can address, plus the switch-wide drop
/// counters.
pub struct VportRegistry {
    slots: Box<[Vport]>,
    switch_stats: SwitchStats,
}

impl Default for VportRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl VportRegistry {
    #[must_use]
    pub fn new() -> VportRegistry {
        VportRegistry {
            slots: (0..MAX_VPORTS).map(|_| Vport::vacant()).collect(),
            switch_stats: SwitchStats::default(),
        }
    }

    #[must_use]
    pub fn switch_stats(&self) -> &SwitchStats {
        &self.switch_stats
    }

    fn slot(&self, id: VportId) -> Option<&Vport> {
        self.slots.get(id as usize)
    }

    /// Populate a slot with its I/O descriptor. Startup-time operation; the
    /// control channel only enables and disables what was configured here.
    ///
    /// # Errors
    ///
    /// [`VportError`] when the id or descriptor is wrong.
    pub fn configure(&self, id: VportId, io: VportIo) -> Result<(), VportError> {
        let ty = VportType::of_id(id).ok_or(VportError::BadId(id))?;
        if !io.matches(ty) {
            return Err(VportError::IoMismatch(id));
        }
        let slot = self.slot(id).ok_or(VportError::BadId(id))?;
        let mut config = slot.config.write();
        if !matches!(config.io, VportIo::None) {
            return Err(VportError::AlreadyConfigured(id));
        }
        config.io = io;
        config.name = default_name(ty, id);
        debug!(id, ?ty, "configured vport");
        Ok(())
    }

    /// True when the slot has an I/O descriptor.
    #[must_use]
    pub fn exists(&self, id: VportId) -> bool {
        self.slot(id)
            .is_some_and(|slot| !matches!(slot.config.read().io, VportIo::None))
    }

    #[must_use]
    pub fn is_enabled(&self, id: VportId) -> bool {
        self.slot(id)
            .is_some_and(|slot| slot.enabled.load(Ordering::Acquire))
    }

    pub fn enable(&self, id: VportId) {
        if let Some(slot) = self.slot(id) {
            slot.enabled.store(true, Ordering::Release);
        }
    }

    pub fn disable(&self, id: VportId) {
        if let Some(slot) = self.slot(id) {
            slot.enabled.store(false, Ordering::Release);
        }
    }

    /// Administrative name. `None` for unconfigured slots.
    #[must_use]
    pub fn name(&self, id: VportId) -> Option<String> {
        let slot = self.slot(id)?;
        let config = slot.config.read();
        if matches!(config.io, VportIo::None) {
            return None;
        }
        Some(config.name.to_string())
    }

    /// Rename a port.
    ///
    /// # Errors
    ///
    /// `Inval` when the name exceeds [`MAX_VPORT_NAME`], `NoDev` for
    /// unconfigured slots.
    pub fn set_name(&self, id: VportId, name: &str) -> Result<(), ErrCode> {
        let slot = self.slot(id).ok_or(ErrCode::NoDev)?;
        let mut config = slot.config.write();
        if matches!(config.io, VportIo::None) {
            return Err(ErrCode::NoDev);
        }
        config.name = ArrayString::from(name).map_err(|_| ErrCode::Inval)?;
        Ok(())
    }

    /// The type implied by the id, `Disabled` for unconfigured slots.
    #[must_use]
    pub fn vport_type(&self, id: VportId) -> VportType {
        if self.exists(id) {
            VportType::of_id(id).unwrap_or_default()
        } else {
            VportType::Disabled
        }
    }

    /// Resolve a port by name among configured ports.
    #[must_use]
    pub fn name_to_id(&self, name: &str) -> Option<VportId> {
        (0..MAX_VPORTS as VportId).find(|id| self.name(*id).as_deref() == Some(name))
    }

    /// First configured-but-disabled id in the type's range.
    #[must_use]
    pub fn next_available(&self, ty: VportType) -> Option<VportId> {
        ty.id_range().find(|id| self.exists(*id) && !self.is_enabled(*id))
    }

    /// First enabled id at or after `from` (the dump state machine).
    #[must_use]
    pub fn next_enabled(&self, from: VportId) -> Option<VportId> {
        (from..MAX_VPORTS as VportId).find(|id| self.is_enabled(*id))
    }

    #[must_use]
    pub fn owning_pipeline(&self, id: VportId) -> u32 {
        self.slot(id)
            .map_or(0, |slot| slot.owning_pipeline.load(Ordering::Relaxed))
    }

    pub fn set_owning_pipeline(&self, id: VportId, pipeline: u32) {
        if let Some(slot) = self.slot(id) {
            slot.owning_pipeline.store(pipeline, Ordering::Relaxed);
        }
    }

    #[must_use]
    pub fn stats(&self, id: VportId) -> Option<PortStatsSnapshot> {
        self.slot(id).map(|slot| slot.stats.snapshot())
    }

    pub fn clear_stats(&self, id: VportId) {
        if let Some(slot) = self.slot(id) {
            slot.stats.clear();
        }
    }

    /// Poll a port for ingress, appending up to `max` packets to `out`.
    /// Returns how many arrived.
    pub fn receive_burst(
        &self,
        id: VportId,
        pool: &BufferPool,
        out: &mut Vec<PacketBuf>,
        max: usize,
    ) -> usize {
        let Some(slot) = self.slot(id) else {
            return 0;
        };
        if !slot.enabled.load(Ordering::Acquire) {
            return 0;
        }
        let config = slot.config.read();
        let mut got = 0;
        let mut bytes = 0u64;
        match &config.io {
            VportIo::Phy { dev, .. } => {
                while got < max {
                    match dev.rx() {
                        Some(pkt) => {
                            bytes += pkt.len() as u64;
                            out.push(pkt);
                            got += 1;
                        }
                        None => break,
                    }
                }
            }
            VportIo::RingPair { from_guest, .. } => {
                while got < max {
                    match from_guest.dequeue() {
                        Some(pkt) => {
                            bytes += pkt.len() as u64;
                            out.push(pkt);
                            got += 1;
                        }
                        None => break,
                    }
                }
            }
            VportIo::Memnic { port } => {
                let mut port = port.lock();
                while got < max {
                    match port.recv(pool) {
                        Some(pkt) => {
                            bytes += pkt.len() as u64;
                            out.push(pkt);
                            got += 1;
                        }
                        None => break,
                    }
                }
            }
            VportIo::None | VportIo::Vswitchd => {}
        }
        if got > 0 {
            slot.stats.inc_rx(got as u64, bytes);
        }
        got
    }

    /// Send one packet out `id`. The packet is always consumed; on a
    /// saturated queue it is dropped, the port and switch tx-drop counters
    /// are incremented, and the error names the cause.
    ///
    /// # Errors
    ///
    /// `NoDev` for unknown/disabled ports, `NoBufs` on saturation.
    pub fn send(&self, id: VportId, pkt: PacketBuf) -> Result<(), ErrCode> {
        let Some(slot) = self.slot(id) else {
            self.switch_stats.inc_tx_drop(1);
            return Err(ErrCode::NoDev);
        };
        if !slot.enabled.load(Ordering::Acquire) {
            self.switch_stats.inc_tx_drop(1);
            slot.stats.inc_tx_drop(1);
            return Err(ErrCode::NoDev);
        }
        let config = slot.config.read();
        let len = pkt.len() as u64;
        let result = match &config.io {
            VportIo::Phy { txq, .. } => txq.enqueue(pkt).map_err(|_| ErrCode::NoBufs),
            VportIo::RingPair { to_guest, .. } => {
                let sent = to_guest.enqueue(pkt).map_err(|_| ErrCode::NoBufs);
                if sent.is_ok() {
                    slot.stats.inc_tx(1, len);
                }
                sent
            }
            VportIo::Memnic { port } => {
                let sent = port.lock().send(pkt.bytes()).map_err(|_| ErrCode::NoBufs);
                if sent.is_ok() {
                    slot.stats.inc_tx(1, len);
                }
                sent
            }
            VportIo::None | VportIo::Vswitchd => Err(ErrCode::NoDev),
        };
        if result.is_err() {
            slot.stats.inc_tx_drop(1);
            self.switch_stats.inc_tx_drop(1);
        }
        result
    }

    /// Drain a phy port's tx ring into its driver. No-op for other types.
    pub fn flush(&self, id: VportId) {
        let Some(slot) = self.slot(id) else {
            return;
        };
        let config = slot.config.read();
        if let VportIo::Phy { dev, txq } = &config.io {
            let mut sent = 0u64;
            let mut sent_bytes = 0u64;
            while let Some(pkt) = txq.dequeue() {
                let len = pkt.len() as u64;
                match dev.tx(pkt) {
                    Ok(()) => {
                        sent += 1;
                        sent_bytes += len;
                    }
                    Err(_rejected) => {
                        warn!(id, "phy device rejected frame on flush");
                        slot.stats.inc_tx_drop(1);
                        self.switch_stats.inc_tx_drop(1);
                    }
                }
            }
            if sent > 0 {
                slot.stats.inc_tx(sent, sent_bytes);
            }
        }
    }

    /// Occupancy of a phy port's tx ring (zero for other types).
    #[must_use]
    pub fn phy_txq_len(&self, id: VportId) -> usize {
        self.slot(id).map_or(0, |slot| match &slot.config.read().io {
            VportIo::Phy { txq, .. } => txq.len(),
            _ => 0,
        })
    }

    /// Build the tx ring for a phy descriptor.
    #[must_use]
    pub fn phy_txq() -> Ring<PacketBuf> {
        Ring::new(PHY_TXQ_SIZE)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dev::RingDev;

    fn ring_pair() -> (Arc<Ring<PacketBuf>>, Arc<Ring<PacketBuf>>) {
        (Arc::new(Ring::new(16)), Arc::new(Ring::new(16)))
    }

    fn registry_with_client(id: VportId) -> (VportRegistry, Arc<Ring<PacketBuf>>, Arc<Ring<PacketBuf>>) {
        let reg = VportRegistry::new();
        let (to_guest, from_guest) = ring_pair();
        reg.configure(
            id,
            VportIo::RingPair {
                to_guest: Arc::clone(&to_guest),
                from_guest: Arc::clone(&from_guest),
            },
        )
        .unwrap();
        reg.enable(id);
        (reg, to_guest, from_guest)
    }

    #[test]
    fn configure_checks_type_and_range() {
        let reg = VportRegistry::new();
        let (to_guest, from_guest) = ring_pair();
        // client io in the phy range is rejected
        let err = reg
            .configure(0x10, VportIo::RingPair { to_guest, from_guest })
            .unwrap_err();
        assert!(matches!(err, VportError::IoMismatch(0x10)));
        assert!(matches!(
            reg.configure(0x200, VportIo::Vswitchd).unwrap_err(),
            VportError::BadId(0x200)
        ));
    }

    #[test]
    fn default_names_follow_type() {
        let (reg, _t, _f) = registry_with_client(0x02);
        assert_eq!(reg.name(0x02).unwrap(), "client2");
        reg.set_name(0x02, "guest-a").unwrap();
        assert_eq!(reg.name(0x02).unwrap(), "guest-a");
        assert_eq!(reg.name_to_id("guest-a"), Some(0x02));
        assert_eq!(reg.name_to_id("nobody"), None);
    }

    #[test]
    fn ring_port_send_and_receive() {
        let pool = BufferPool::new(8);
        let (reg, to_guest, from_guest) = registry_with_client(0x01);

        from_guest.enqueue(pool.alloc_from(&[1, 2, 3]).unwrap()).unwrap();
        let mut out = Vec::new();
        assert_eq!(reg.receive_burst(0x01, &pool, &mut out, PKT_BURST), 1);
        assert_eq!(out[0].bytes(), &[1, 2, 3]);
        assert_eq!(reg.stats(0x01).unwrap().rx, 1);
        assert_eq!(reg.stats(0x01).unwrap().rx_bytes, 3);

        reg.send(0x01, out.pop().unwrap()).unwrap();
        assert_eq!(to_guest.dequeue().unwrap().bytes(), &[1, 2, 3]);
        assert_eq!(reg.stats(0x01).unwrap().tx, 1);
    }

    #[test]
    fn saturated_ring_drops_and_counts() {
        let pool = BufferPool::new(64);
        let reg = VportRegistry::new();
        let to_guest = Arc::new(Ring::new(2));
        let from_guest = Arc::new(Ring::new(2));
        reg.configure(
            0x03,
            VportIo::RingPair {
                to_guest: Arc::clone(&to_guest),
                from_guest,
            },
        )
        .unwrap();
        reg.enable(0x03);

        reg.send(0x03, pool.alloc().unwrap()).unwrap();
        reg.send(0x03, pool.alloc().unwrap()).unwrap();
        let before = pool.in_flight();
        assert_eq!(reg.send(0x03, pool.alloc().unwrap()).unwrap_err(), ErrCode::NoBufs);
        // dropped buffer went back to the pool, nothing leaked
        assert_eq!(pool.in_flight(), before);
        assert_eq!(reg.stats(0x03).unwrap().tx_drop, 1);
        assert_eq!(reg.switch_stats().tx_drop(), 1);
    }

    #[test]
    fn send_to_disabled_port_is_nodev() {
        let pool = BufferPool::new(4);
        let (reg, _t, _f) = registry_with_client(0x04);
        reg.disable(0x04);
        assert_eq!(reg.send(0x04, pool.alloc().unwrap()).unwrap_err(), ErrCode::NoDev);
        assert_eq!(pool.in_flight(), 0);
    }

    #[test]
    fn phy_send_buffers_until_flush() {
        let pool = BufferPool::new(8);
        let reg = VportRegistry::new();
        let wire_rx = Arc::new(Ring::new(8));
        let wire_tx = Arc::new(Ring::new(8));
        reg.configure(
            0x10,
            VportIo::Phy {
                dev: Box::new(RingDev::new(Arc::clone(&wire_rx), Arc::clone(&wire_tx))),
                txq: VportRegistry::phy_txq(),
            },
        )
        .unwrap();
        reg.enable(0x10);

        reg.send(0x10, pool.alloc_from(&[9]).unwrap()).unwrap();
        assert_eq!(reg.phy_txq_len(0x10), 1);
        assert!(wire_tx.is_empty());
        // tx counted at the wire, not at enqueue
        assert_eq!(reg.stats(0x10).unwrap().tx, 0);

        reg.flush(0x10);
        assert_eq!(reg.phy_txq_len(0x10), 0);
        assert_eq!(wire_tx.dequeue().unwrap().bytes(), &[9]);
        assert_eq!(reg.stats(0x10).unwrap().tx, 1);
    }

    #[test]
    fn dump_cursor_skips_disabled() {
        let (reg, _t, _f) = registry_with_client(0x05);
        let (to_guest, from_guest) = ring_pair();
        reg.configure(0x07, VportIo::RingPair { to_guest, from_guest }).unwrap();
        // 0x07 configured but not enabled
        assert_eq!(reg.next_enabled(0), Some(0x05));
        assert_eq!(reg.next_enabled(0x06), None);
        assert_eq!(reg.next_available(VportType::Client), Some(0x07));
    }
}
