// SPDX-License-Identifier: Apache-2.0
// Copyright uswitch Authors

//! The action vocabulary applied to matched packets.

use arrayvec::ArrayVec;
use net::Mac;

/// Hard cap on actions per flow, checked at message ingress.
pub const MAX_ACTIONS: usize = 48;

/// One step of a flow's action program.
///
/// Lists execute in order. `Output` may appear more than once; the executor
/// pre-scans for that case and clones the packet per output.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Action {
    /// Free the packet and count a switch rx drop.
    Drop,
    /// Send to a vport (direct I/O for phy/kni/veth, ring transport else).
    Output { vport: u32 },
    /// Strip one 802.1Q tag.
    PopVlan,
    /// Insert one 802.1Q tag with this TCI ahead of the EtherType.
    PushVlan { tci: u16 },
    /// Overwrite the L2 addresses.
    SetEthernet { dst: Mac, src: Mac },
    /// Overwrite L3 fields; checksum upkeep is the caller's concern.
    SetIpv4 { src: u32, dst: u32, tos: u8, ttl: u8 },
    /// Overwrite TCP ports.
    SetTcp { src: u16, dst: u16 },
    /// Overwrite UDP ports.
    SetUdp { src: u16, dst: u16 },
    /// Upcall to the daemon with reason ACTION and this opaque cookie.
    Vswitchd { pid: u32 },
}

/// Bounded, ordered action program.
pub type ActionList = ArrayVec<Action, MAX_ACTIONS>;

/// Count of `Output` actions in `actions`, stopping at two: the executor
/// only needs to know whether cloning is required.
#[must_use]
pub fn output_count(actions: &[Action]) -> usize {
    let mut outputs = 0;
    for action in actions {
        if matches!(action, Action::Output { .. }) {
            outputs += 1;
            if outputs > 1 {
                return outputs;
            }
        }
    }
    outputs
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn output_count_short_circuits_at_two() {
        let single: Vec<Action> = vec![Action::PopVlan, Action::Output { vport: 1 }];
        assert_eq!(output_count(&single), 1);

        let multi: Vec<Action> = (0..5).map(|vport| Action::Output { vport }).collect();
        assert_eq!(output_count(&multi), 2);

        assert_eq!(output_count(&[Action::Drop]), 0);
    }

    #[test]
    fn list_respects_cap() {
        let mut list = ActionList::new();
        for vport in 0..MAX_ACTIONS as u32 {
            list.push(Action::Output { vport });
        }
        assert!(list.try_push(Action::Drop).is_err());
    }
}
