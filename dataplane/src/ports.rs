// SPDX-License-Identifier: Apache-2.0
// Copyright uswitch Authors

//! Startup-time vport population.
//!
//! Ports are declared by the command line and configured here; the control
//! daemon later enables them by name or id. Physical ports attach to named
//! wire rings (driver processes feed those rings; NIC internals are outside
//! the switch core), guest ports to their shared ring pairs, memnic ports
//! to fresh `/dev/shm` regions.

use std::sync::Arc;

use tracing::info;

use args::CmdArgs;
use datapath::Switch;
use net::buffer::PacketBuf;
use vport::memnic::MemnicPort;
use vport::registry::VportIo;
use vport::types::{VportId, VportType};
use vport::VportRegistry;

use crate::InitError;

const WIRE_RING_SIZE: usize = 512;
const GUEST_RING_SIZE: usize = 2048;

fn wire_ring(port: u32, dir: &str) -> String {
    format!("uswitch_phy{port:02}_wire_{dir}")
}

fn guest_ring(kind: &str, index: u32, dir: &str) -> String {
    format!("{kind}{index:02}_{dir}_Ring")
}

fn configure_ring_pair(
    switch: &Switch,
    kind: &str,
    ty: VportType,
    index: u32,
) -> Result<(), InitError> {
    let id = ty.id_range().start + index;
    let to_guest = switch
        .rings
        .create::<PacketBuf>(&guest_ring(kind, index, "TX"), GUEST_RING_SIZE)?;
    let from_guest = switch
        .rings
        .create::<PacketBuf>(&guest_ring(kind, index, "RX"), GUEST_RING_SIZE)?;
    switch.vports.configure(
        id,
        VportIo::RingPair {
            to_guest,
            from_guest,
        },
    )?;
    Ok(())
}

/// Configure every port named on the command line.
pub fn populate(switch: &Arc<Switch>, cmd: &CmdArgs) -> Result<(), InitError> {
    let mut phys: Vec<u32> = cmd.config.0.iter().map(|binding| binding.port).collect();
    phys.sort_unstable();
    phys.dedup();
    for port in phys {
        let rx = switch
            .rings
            .create::<PacketBuf>(&wire_ring(port, "rx"), WIRE_RING_SIZE)?;
        let tx = switch
            .rings
            .create::<PacketBuf>(&wire_ring(port, "tx"), WIRE_RING_SIZE)?;
        switch.vports.configure(
            VportType::Phy.id_range().start + port,
            VportIo::Phy {
                dev: Box::new(vport::dev::RingDev::new(rx, tx)),
                txq: VportRegistry::phy_txq(),
            },
        )?;
    }

    for index in 0..cmd.clients {
        configure_ring_pair(switch, "Client", VportType::Client, index)?;
    }
    for index in 0..cmd.kni {
        configure_ring_pair(switch, "KNI", VportType::Kni, index)?;
    }
    for index in 0..cmd.veth {
        configure_ring_pair(switch, "vEth", VportType::Veth, index)?;
    }
    for index in 0..cmd.vhost {
        configure_ring_pair(switch, "Vhost", VportType::Vhost, index)?;
    }
    for index in 0..cmd.memnic {
        let name = format!("memnic{index}");
        let port = MemnicPort::create(&name)?;
        switch.vports.configure(
            VportType::Memnic.id_range().start + index,
            VportIo::memnic(port),
        )?;
    }

    switch.vports.configure(
        VportType::Vswitchd.id_range().start,
        VportIo::Vswitchd,
    )?;

    info!(
        phys = cmd.config.0.len(),
        clients = cmd.clients,
        kni = cmd.kni,
        veth = cmd.veth,
        vhost = cmd.vhost,
        memnic = cmd.memnic,
        "vport registry populated"
    );
    Ok(())
}

/// The ingress vports core `core` polls: its phy bindings, plus every
/// guest-facing port when it is the client-switching core.
pub fn ingress_for_core(cmd: &CmdArgs, core: u32) -> Vec<VportId> {
    let mut ingress: Vec<VportId> = cmd
        .config
        .0
        .iter()
        .filter(|binding| binding.lcore == core)
        .map(|binding| VportType::Phy.id_range().start + binding.port)
        .collect();

    if core == cmd.client_switching_core {
        for (ty, count) in [
            (VportType::Client, cmd.clients),
            (VportType::Kni, cmd.kni),
            (VportType::Veth, cmd.veth),
            (VportType::Vhost, cmd.vhost),
            (VportType::Memnic, cmd.memnic),
        ] {
            ingress.extend((0..count).map(|index| ty.id_range().start + index));
        }
    }
    ingress.sort_unstable();
    ingress.dedup();
    ingress
}

#[cfg(test)]
mod test {
    use super::*;
    use args::Parser;
    use flow::TscClock;

    #[test]
    fn ingress_assignment_follows_bindings() {
        let cmd = CmdArgs::parse_from([
            "uswitch-dataplane",
            "--config",
            "(0,0,2),(1,0,3)",
            "--client_switching_core",
            "2",
            "--clients",
            "2",
            "--kni",
            "1",
        ]);
        assert_eq!(ingress_for_core(&cmd, 3), vec![0x11]);
        // core 2 polls its phy binding plus every guest port
        assert_eq!(ingress_for_core(&cmd, 2), vec![0x00, 0x01, 0x10, 0x20]);
        assert!(ingress_for_core(&cmd, 9).is_empty());
    }

    #[test]
    fn populate_configures_declared_ports() {
        let cmd = CmdArgs::parse_from([
            "uswitch-dataplane",
            "--config",
            "(0,0,2)",
            "--clients",
            "2",
        ]);
        let switch = Arc::new(Switch::new(64, TscClock::with_hz(1)));
        populate(&switch, &cmd).unwrap();

        assert!(switch.vports.exists(0x10));
        assert!(switch.vports.exists(0x00));
        assert!(switch.vports.exists(0x01));
        assert!(!switch.vports.exists(0x02));
        assert!(switch.vports.exists(0xE0));
        // declared but not yet enabled: that is the daemon's decision
        assert!(!switch.vports.is_enabled(0x10));
        // guest rings resolvable by their published names
        assert!(
            switch
                .rings
                .lookup::<PacketBuf>(&guest_ring("Client", 0, "RX"))
                .is_ok()
        );
    }
}
