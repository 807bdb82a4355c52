// SPDX-License-Identifier: Apache-2.0
// Copyright uswitch Authors

//! The per-core forwarding pipeline and its control-message handler.

use std::sync::Arc;

use arrayvec::ArrayString;
use tracing::{debug, warn};

use ctl::message::{
    FLAG_CREATE, FLAG_DUMP, FLAG_REPLACE, FlowCmd, FlowMessage, Message, MessageBody, VportCmd,
    VportMessage,
};
use ctl::{ChannelSet, WakeupTx};
use errno::ErrCode;
use flow::{FLOW_TABLE_CAPACITY, FlowTable};
use net::FlowKey;
use net::buffer::PacketBuf;
use net::key::extract;
use ring::RingFull;
use ring::registry::RegistryError;
use vport::egress::{EgressCache, FLUSH_DEADLINE_US};
use vport::registry::PKT_BURST;
use vport::types::{VportId, VportType};

use crate::context::Switch;
use crate::executor::{ExecCtx, execute, send_upcall};

/// Construction-time pipeline parameters.
pub struct PipelineConfig {
    /// Pipeline id; also names the control rings.
    pub id: u32,
    /// Ingress vports polled by this pipeline.
    pub ingress: Vec<VportId>,
    /// Flow-table slots (production uses [`FLOW_TABLE_CAPACITY`]).
    pub flow_capacity: usize,
    /// Path of the daemon's wake-up socket.
    pub wake_path: std::path::PathBuf,
}

impl PipelineConfig {
    /// Defaults for pipeline `id`: no ingress, full-size table, default
    /// socket path.
    #[must_use]
    pub fn new(id: u32) -> PipelineConfig {
        PipelineConfig {
            id,
            ingress: Vec::new(),
            flow_capacity: FLOW_TABLE_CAPACITY,
            wake_path: std::path::PathBuf::from(ctl::DPIF_SOCK_PATH),
        }
    }
}

/// Errors constructing a pipeline (fatal at startup).
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Rings(#[from] RegistryError),
    #[error("wakeup socket: {0}")]
    Wakeup(#[from] std::io::Error),
}

/// One core's forwarding loop state.
pub struct Pipeline {
    id: u32,
    switch: Arc<Switch>,
    table: FlowTable,
    chans: ChannelSet,
    wake: WakeupTx,
    egress: EgressCache,
    ingress: Vec<VportId>,
    rx_scratch: Vec<PacketBuf>,
    req_scratch: Vec<Message>,
}

impl Pipeline {
    /// Build a pipeline and create its control rings.
    ///
    /// # Errors
    ///
    /// Ring-name collisions and socket failures, both fatal at startup.
    pub fn new(switch: Arc<Switch>, config: PipelineConfig) -> Result<Pipeline, PipelineError> {
        let chans = ChannelSet::create(&switch.rings, config.id)?;
        let wake = WakeupTx::new(&config.wake_path)?;
        let table = FlowTable::new(config.flow_capacity, switch.clock);
        let egress = EgressCache::new(switch.clock.cycles_per_us(FLUSH_DEADLINE_US));
        Ok(Pipeline {
            id: config.id,
            switch,
            table,
            chans,
            wake,
            egress,
            ingress: config.ingress,
            rx_scratch: Vec::with_capacity(PKT_BURST),
            req_scratch: Vec::with_capacity(PKT_BURST),
        })
    }

    /// Pipeline id.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// This pipeline's flow table (control-side inspection and tests).
    #[must_use]
    pub fn table(&self) -> &FlowTable {
        &self.table
    }

    /// One iteration of the forwarding loop: poll every ingress port, run
    /// matched actions or upcall, service egress deadlines, and drain the
    /// control rings.
    pub fn run_once(&mut self) {
        let now = self.switch.clock.cycles();

        for idx in 0..self.ingress.len() {
            let port = self.ingress[idx];
            let mut batch = std::mem::take(&mut self.rx_scratch);
            batch.clear();
            self.switch
                .vports
                .receive_burst(port, &self.switch.pool, &mut batch, PKT_BURST);
            for pkt in batch.drain(..) {
                self.process_frame(port, pkt, now);
            }
            self.rx_scratch = batch;
        }

        self.egress.poll(&self.switch.vports, now);
        self.handle_control(now);
    }

    /// Flush all buffered egress (shutdown path).
    pub fn flush_egress(&mut self) {
        self.egress.flush_all(&self.switch.vports);
    }

    fn process_frame(&mut self, port: VportId, pkt: PacketBuf, now: u64) {
        let key = extract(pkt.bytes(), port);
        match self.table.lookup(&key) {
            Some(handle) => {
                self.table.update_stats(handle, pkt.bytes());
                let Some(actions) = self.table.actions(handle).cloned() else {
                    return;
                };
                let mut ctx = ExecCtx {
                    switch: &self.switch,
                    egress: &mut self.egress,
                    chans: &self.chans,
                    wake: &self.wake,
                    now_cycles: now,
                };
                execute(&mut ctx, &actions, pkt, &key);
            }
            None => {
                send_upcall(
                    &self.switch,
                    &self.chans,
                    &self.wake,
                    pkt,
                    ctl::message::PacketCmd::Miss,
                    &key,
                );
            }
        }
    }

    fn handle_control(&mut self, now: u64) {
        let mut batch = std::mem::take(&mut self.req_scratch);
        batch.clear();
        self.chans.request.dequeue_burst(&mut batch, PKT_BURST);
        self.chans.packet.dequeue_burst(&mut batch, PKT_BURST);
        for msg in batch.drain(..) {
            self.dispatch(msg, now);
        }
        self.req_scratch = batch;
        self.chans.replenish(&self.switch.pool);
    }

    fn dispatch(&mut self, msg: Message, now: u64) {
        match msg.body {
            MessageBody::Vport(req) => {
                let (error, reply) = self.handle_vport(req);
                self.send_reply(Message {
                    error,
                    body: MessageBody::Vport(reply),
                });
            }
            MessageBody::Flow(req) => {
                let (error, reply) = self.handle_flow(req);
                self.send_reply(Message {
                    error,
                    body: MessageBody::Flow(reply),
                });
            }
            MessageBody::Packet(req) => {
                let key = extract(req.pkt.bytes(), 0);
                let mut ctx = ExecCtx {
                    switch: &self.switch,
                    egress: &mut self.egress,
                    chans: &self.chans,
                    wake: &self.wake,
                    now_cycles: now,
                };
                execute(&mut ctx, &req.actions, req.pkt, &key);
            }
            MessageBody::Unknown { mtype } => {
                debug!(pipeline = self.id, mtype, "unknown control family");
                self.send_reply(Message {
                    error: ErrCode::Inval.as_wire(),
                    body: MessageBody::Unknown { mtype },
                });
            }
        }
    }

    fn handle_vport(&mut self, mut req: VportMessage) -> (i16, VportMessage) {
        let reg = &self.switch.vports;
        let error = match req.cmd {
            VportCmd::New => {
                let ty = req.ty;
                let mut id = req.vportid;
                // daemons address phy ports by NIC index
                if ty == VportType::Phy && id != u32::MAX {
                    id = id.wrapping_add(VportType::Phy.id_range().start);
                }
                if !reg.exists(id) || VportType::of_id(id) != Some(ty) {
                    id = reg.next_available(ty).unwrap_or(u32::MAX);
                }
                if reg.exists(id) {
                    if reg.is_enabled(id) {
                        ErrCode::Busy.as_wire()
                    } else {
                        let name = if req.port_name.is_empty() {
                            reg.name(id).unwrap_or_default()
                        } else {
                            req.port_name.to_string()
                        };
                        match reg.set_name(id, &name) {
                            Ok(()) => {
                                reg.enable(id);
                                reg.set_owning_pipeline(id, self.id);
                                req.vportid = id;
                                req.port_name =
                                    ArrayString::from(&name).unwrap_or_default();
                                0
                            }
                            Err(err) => err.as_wire(),
                        }
                    }
                } else {
                    ErrCode::NoDev.as_wire()
                }
            }
            VportCmd::Del => {
                if reg.exists(req.vportid) && reg.is_enabled(req.vportid) {
                    reg.disable(req.vportid);
                    0
                } else {
                    ErrCode::NoDev.as_wire()
                }
            }
            VportCmd::Get => {
                if req.flags & FLAG_DUMP == FLAG_DUMP {
                    let from = if req.vportid == u32::MAX {
                        0
                    } else {
                        req.vportid + 1
                    };
                    match reg.next_enabled(from) {
                        Some(id) => {
                            req.vportid = id;
                            req.ty = reg.vport_type(id);
                            req.stats = reg.stats(id).unwrap_or_default();
                            req.port_name =
                                ArrayString::from(&reg.name(id).unwrap_or_default())
                                    .unwrap_or_default();
                            0
                        }
                        None => ErrCode::Eof.as_wire(),
                    }
                } else {
                    if req.vportid == u32::MAX {
                        match reg.name_to_id(&req.port_name) {
                            Some(id) => req.vportid = id,
                            None => return (ErrCode::NoDev.as_wire(), req),
                        }
                    }
                    if reg.exists(req.vportid) && reg.is_enabled(req.vportid) {
                        req.ty = reg.vport_type(req.vportid);
                        req.stats = reg.stats(req.vportid).unwrap_or_default();
                        req.port_name =
                            ArrayString::from(&reg.name(req.vportid).unwrap_or_default())
                                .unwrap_or_default();
                        0
                    } else {
                        ErrCode::NoDev.as_wire()
                    }
                }
            }
            VportCmd::Unspec => ErrCode::Inval.as_wire(),
        };
        (error, req)
    }

    fn handle_flow(&mut self, mut req: FlowMessage) -> (i16, FlowMessage) {
        let error = match req.cmd {
            FlowCmd::New => match self.table.lookup(&req.key) {
                None => {
                    if req.flags & FLAG_CREATE != 0 {
                        match self.table.add(req.key, req.actions.clone()) {
                            Ok(handle) => {
                                req.flow_handle = handle.as_u64();
                                0
                            }
                            Err(err) => err.as_wire(),
                        }
                    } else {
                        ErrCode::NoEnt.as_wire()
                    }
                }
                Some(handle) => {
                    if req.flags & FLAG_REPLACE != 0 {
                        // hand the pre-replace stats back to the daemon
                        if let Ok((_, stats)) = self.table.get(&req.key) {
                            req.stats = stats;
                        }
                        match self.table.modify(&req.key, req.actions.clone(), req.clear) {
                            Ok(()) => {
                                req.flow_handle = handle.as_u64();
                                0
                            }
                            Err(err) => err.as_wire(),
                        }
                    } else {
                        ErrCode::Exist.as_wire()
                    }
                }
            },
            FlowCmd::Del => {
                if req.key.is_empty() {
                    self.table.flush();
                    0
                } else {
                    match self.table.delete(&req.key) {
                        Ok(stats) => {
                            req.stats = stats;
                            0
                        }
                        Err(err) => err.as_wire(),
                    }
                }
            }
            FlowCmd::Get => {
                if req.flags & FLAG_DUMP == FLAG_DUMP {
                    let found = if req.key.is_empty() {
                        self.table.first()
                    } else {
                        self.table.next(&req.key)
                    };
                    match found {
                        Some((key, actions, stats)) => {
                            req.key = key;
                            req.actions = actions;
                            req.stats = stats;
                            0
                        }
                        None => ErrCode::Eof.as_wire(),
                    }
                } else {
                    match self.table.get(&req.key) {
                        Ok((actions, stats)) => {
                            req.actions = actions;
                            req.stats = stats;
                            if let Some(handle) = self.table.lookup(&req.key) {
                                req.flow_handle = handle.as_u64();
                            }
                            0
                        }
                        Err(err) => err.as_wire(),
                    }
                }
            }
            FlowCmd::Unspec => ErrCode::Inval.as_wire(),
        };
        (error, req)
    }

    fn send_reply(&self, reply: Message) {
        if let Err(RingFull(_)) = self.chans.reply.enqueue(reply) {
            warn!(pipeline = self.id, "reply ring saturated, reply dropped");
            self.switch.vports.switch_stats().inc_tx_drop(1);
        }
    }
}
