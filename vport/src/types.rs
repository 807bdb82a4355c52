// SPDX-License-Identifier: Apache-2.0
// Copyright uswitch Authors

//! Vport types and the partitioned id space.
//!
//! Ids are globally unique and the ranges are disjoint, so the type of a
//! port is implied by its position: once allocated, a port's type never
//! changes.

use core::ops::Range;

/// A vport id. Plain `u32` on the wire; `u32::MAX` is the "resolve by name"
/// / "start of dump" sentinel on the control channel.
pub type VportId = u32;

/// Total size of the id space.
pub const MAX_VPORTS: usize = 256;

/// Longest accepted port name, bytes.
pub const MAX_VPORT_NAME: usize = 32;

/// The kind of a vport, which fixes both its id range and its I/O style.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum VportType {
    /// Unpopulated slot.
    #[default]
    Disabled = 0,
    /// Guest process attached over a shared ring pair.
    Client = 1,
    /// Physical NIC behind a [`crate::dev::PhyDriver`].
    Phy = 2,
    /// Kernel-NIC emulation FIFO pair.
    Kni = 3,
    /// Virtual ethernet FIFO pair.
    Veth = 4,
    /// Virtio/vhost queue pair.
    Vhost = 5,
    /// Shared-memory NIC region in `/dev/shm`.
    Memnic = 6,
    /// In-switch bridge port.
    Bridge = 7,
    /// The control daemon's own port (exception traffic).
    Vswitchd = 8,
}

impl VportType {
    /// The id range owned by this type.
    #[must_use]
    pub const fn id_range(self) -> Range<VportId> {
        match self {
            VportType::Disabled => 0..0,
            VportType::Client => 0x00..0x10,
            VportType::Phy => 0x10..0x20,
            VportType::Kni => 0x20..0x40,
            VportType::Veth => 0x40..0x50,
            VportType::Vhost => 0x50..0x60,
            VportType::Memnic => 0x60..0x80,
            VportType::Bridge => 0x80..0x90,
            VportType::Vswitchd => 0xE0..0xE1,
        }
    }

    /// The type owning `id`, or `None` for ids outside every range.
    #[must_use]
    pub fn of_id(id: VportId) -> Option<VportType> {
        const ALL: [VportType; 8] = [
            VportType::Client,
            VportType::Phy,
            VportType::Kni,
            VportType::Veth,
            VportType::Vhost,
            VportType::Memnic,
            VportType::Bridge,
            VportType::Vswitchd,
        ];
        ALL.into_iter().find(|ty| ty.id_range().contains(&id))
    }

    /// True when egress to this type goes through the per-core cache
    /// rather than direct I/O.
    #[must_use]
    pub const fn cached_egress(self) -> bool {
        !matches!(self, VportType::Phy | VportType::Kni | VportType::Veth)
    }

    /// Wire tag used in control messages.
    #[must_use]
    pub const fn as_wire(self) -> u8 {
        self as u8
    }

    /// Decode a wire tag.
    #[must_use]
    pub const fn from_wire(raw: u8) -> Option<VportType> {
        match raw {
            0 => Some(VportType::Disabled),
            1 => Some(VportType::Client),
            2 => Some(VportType::Phy),
            3 => Some(VportType::Kni),
            4 => Some(VportType::Veth),
            5 => Some(VportType::Vhost),
            6 => Some(VportType::Memnic),
            7 => Some(VportType::Bridge),
            8 => Some(VportType::Vswitchd),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ranges_are_disjoint_and_inside_the_space() {
        let types = [
            VportType::Client,
            VportType::Phy,
            VportType::Kni,
            VportType::Veth,
            VportType::Vhost,
            VportType::Memnic,
            VportType::Bridge,
            VportType::Vswitchd,
        ];
        for (i, a) in types.iter().enumerate() {
            assert!(a.id_range().end as usize <= MAX_VPORTS);
            for b in &types[i + 1..] {
                let (ra, rb) = (a.id_range(), b.id_range());
                assert!(
                    ra.end <= rb.start || rb.end <= ra.start,
                    "{a:?} and {b:?} overlap"
                );
            }
        }
    }

    #[test]
    fn id_resolves_to_owning_type() {
        assert_eq!(VportType::of_id(0x00), Some(VportType::Client));
        assert_eq!(VportType::of_id(0x10), Some(VportType::Phy));
        assert_eq!(VportType::of_id(0x20), Some(VportType::Kni));
        assert_eq!(VportType::of_id(0x40), Some(VportType::Veth));
        assert_eq!(VportType::of_id(0x50), Some(VportType::Vhost));
        assert_eq!(VportType::of_id(0x60), Some(VportType::Memnic));
        assert_eq!(VportType::of_id(0x80), Some(VportType::Bridge));
        assert_eq!(VportType::of_id(0xE0), Some(VportType::Vswitchd));
        assert_eq!(VportType::of_id(0x90), None);
    }

    #[test]
    fn direct_egress_for_phy_and_fifo_ports() {
        assert!(!VportType::Phy.cached_egress());
        assert!(!VportType::Kni.cached_egress());
        assert!(!VportType::Veth.cached_egress());
        assert!(VportType::Client.cached_egress());
        assert!(VportType::Vhost.cached_egress());
        assert!(VportType::Vswitchd.cached_egress());
    }

    #[test]
    fn wire_round_trip() {
        for raw in 0..=8 {
            let ty = VportType::from_wire(raw).unwrap();
            assert_eq!(ty.as_wire(), raw);
        }
        assert_eq!(VportType::from_wire(9), None);
    }
}
