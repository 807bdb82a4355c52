// SPDX-License-Identifier: Apache-2.0
// Copyright uswitch Authors

//! The action executor.
//!
//! Action lists run in order. Whether the packet must be cloned is decided
//! once per packet by pre-scanning for multiple `Output` steps: with a
//! single output the buffer's ownership transfers into the sender, with
//! several each output gets its own clone and the original is freed after
//! the last action.

use tracing::warn;

use ctl::message::PacketCmd;
use ctl::{ChannelSet, WakeupTx};
use flow::action::{Action, output_count};
use net::FlowKey;
use net::buffer::PacketBuf;
use net::mutate;
use ring::RingFull;

use crate::context::Switch;
use vport::egress::EgressCache;

/// Everything an action list may touch while executing.
pub struct ExecCtx<'a> {
    pub switch: &'a Switch,
    pub egress: &'a mut EgressCache,
    pub chans: &'a ChannelSet,
    pub wake: &'a WakeupTx,
    pub now_cycles: u64,
}

/// Upcall one packet to the daemon: prepend the `{cmd, key}` header and
/// enqueue on the exception ring, waking the daemon on the ring's
/// empty-to-non-empty edge. Saturation and missing headroom drop the packet
/// and count a switch tx drop.
pub fn send_upcall(
    switch: &Switch,
    chans: &ChannelSet,
    wake: &WakeupTx,
    mut pkt: PacketBuf,
    cmd: PacketCmd,
    key: &FlowKey,
) {
    if ctl::upcall::prepend(&mut pkt, cmd, key).is_err() {
        warn!(
            pipeline = chans.pipeline,
            "upcall header does not fit in headroom, packet dropped"
        );
        switch.vports.switch_stats().inc_tx_drop(1);
        return;
    }
    let was_empty = chans.exception.is_empty();
    match chans.exception.enqueue(pkt) {
        Ok(()) => {
            if was_empty && !chans.exception.is_empty() {
                wake.signal();
            }
        }
        Err(RingFull(pkt)) => {
            drop(pkt);
            switch.vports.switch_stats().inc_tx_drop(1);
        }
    }
}

/// Run `actions` on `pkt`. The packet is always consumed.
pub fn execute(ctx: &mut ExecCtx<'_>, actions: &[Action], pkt: PacketBuf, key: &FlowKey) {
    if actions.is_empty() {
        drop(pkt);
        ctx.switch.vports.switch_stats().inc_rx_drop(1);
        return;
    }

    let multi = output_count(actions) > 1;
    let mut pkt = Some(pkt);

    for action in actions {
        let Some(current) = pkt.as_mut() else {
            break;
        };
        match *action {
            Action::Output { vport } => {
                if multi {
                    let clone = current.clone();
                    ctx.egress
                        .send(&ctx.switch.vports, vport, clone, ctx.now_cycles);
                } else if let Some(owned) = pkt.take() {
                    ctx.egress
                        .send(&ctx.switch.vports, vport, owned, ctx.now_cycles);
                }
            }
            Action::Drop => {
                drop(pkt.take());
                ctx.switch.vports.switch_stats().inc_rx_drop(1);
            }
            Action::PopVlan => {
                if let Err(err) = mutate::pop_vlan(current) {
                    warn!(%err, "pop_vlan skipped");
                }
            }
            Action::PushVlan { tci } => {
                if let Err(err) = mutate::push_vlan(current, tci) {
                    warn!(%err, "push_vlan skipped");
                }
            }
            Action::SetEthernet { dst, src } => {
                if let Err(err) = mutate::set_ethernet(current, dst, src) {
                    warn!(%err, "set_ethernet skipped");
                }
            }
            Action::SetIpv4 { src, dst, tos, ttl } => {
                if let Err(err) = mutate::set_ipv4(current, src, dst, tos, ttl) {
                    warn!(%err, "set_ipv4 skipped");
                }
            }
            Action::SetTcp { src, dst } | Action::SetUdp { src, dst } => {
                if let Err(err) = mutate::set_transport_ports(current, src, dst) {
                    warn!(%err, "transport port rewrite skipped");
                }
            }
            Action::Vswitchd { pid: _pid } => {
                if multi {
                    let clone = current.clone();
                    send_upcall(ctx.switch, ctx.chans, ctx.wake, clone, PacketCmd::Action, key);
                } else if let Some(owned) = pkt.take() {
                    send_upcall(ctx.switch, ctx.chans, ctx.wake, owned, PacketCmd::Action, key);
                }
            }
        }
    }

    // multi-output case: the original is freed here, after the last action
    drop(pkt);
}
