// SPDX-License-Identifier: Apache-2.0
// Copyright uswitch Authors

//! Blocking control transactions and the daemon's bookkeeping around them.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{debug, warn};

use ctl::message::{
    FLAG_DUMP, FlowCmd, FlowMessage, Message, MessageBody, PacketMessage, VportCmd, VportMessage,
};
use ctl::ChannelSet;
use errno::ErrCode;
use flow::ActionList;
use net::FlowKey;
use ring::RingFull;
use ring::registry::{RegistryError, RingRegistry};
use vport::table::VportShadow;
use vport::types::{VportId, VportType};

use crate::flow_shadow::FlowShadow;

/// Errors surfaced to daemon callers.
#[derive(Debug, thiserror::Error)]
pub enum DpifError {
    #[error(transparent)]
    Rings(#[from] RegistryError),
    #[error(transparent)]
    Region(#[from] shm::RegionError),
    /// The datapath answered with an error code.
    #[error("datapath: {0}")]
    Code(#[from] ErrCode),
    /// A reply of a family this client does not understand.
    #[error("unintelligible reply on pipeline {0}")]
    BadReply(u32),
    /// The addressed pipeline has no rings here.
    #[error("pipeline {0} is not attached")]
    NoPipeline(u32),
}

fn current_tid() -> u32 {
    nix::unistd::gettid().as_raw() as u32
}

/// The daemon's handle on every pipeline plus its persistent shadows.
pub struct DpifClient {
    channels: HashMap<u32, ChannelSet>,
    pipelines: Vec<u32>,
    flows: FlowShadow,
    vports: VportShadow,
    rr: AtomicUsize,
}

impl DpifClient {
    /// Attach to `pipelines`' ring sets and map the shadow files.
    ///
    /// # Errors
    ///
    /// Missing rings or unmappable shadow files, both fatal for the daemon.
    pub fn attach(
        rings: &RingRegistry,
        pipelines: &[u32],
        flow_shadow_path: impl AsRef<Path>,
        vport_shadow_path: impl AsRef<Path>,
        flow_capacity: usize,
    ) -> Result<DpifClient, DpifError> {
        let mut channels = HashMap::new();
        for pipeline in pipelines {
            channels.insert(*pipeline, ChannelSet::attach(rings, *pipeline)?);
        }
        Ok(DpifClient {
            channels,
            pipelines: pipelines.to_vec(),
            flows: FlowShadow::open_or_create(flow_shadow_path, flow_capacity)?,
            vports: VportShadow::open_or_create(vport_shadow_path)?,
            rr: AtomicUsize::new(0),
        })
    }

    /// The attached pipelines.
    #[must_use]
    pub fn pipelines(&self) -> &[u32] {
        &self.pipelines
    }

    /// The daemon's flow shadow.
    #[must_use]
    pub fn flow_shadow(&self) -> &FlowShadow {
        &self.flows
    }

    /// The shared vport table.
    #[must_use]
    pub fn vport_shadow(&self) -> &VportShadow {
        &self.vports
    }

    fn channel(&self, pipeline: u32) -> Result<&ChannelSet, DpifError> {
        self.channels
            .get(&pipeline)
            .ok_or(DpifError::NoPipeline(pipeline))
    }

    /// Round-robin placement over the attached pipelines.
    fn place(&self) -> u32 {
        let at = self.rr.fetch_add(1, Ordering::Relaxed);
        self.pipelines[at % self.pipelines.len()]
    }

    /// Pipeline owning `port`, falling back to the first attached one.
    fn owner_of(&self, port: VportId) -> u32 {
        self.vports
            .get(port)
            .filter(|entry| entry.in_use)
            .map_or(self.pipelines[0], |entry| entry.lcore)
    }

    /// Send one request and spin for this thread's reply, re-enqueuing
    /// replies addressed to other daemon threads untouched.
    ///
    /// # Errors
    ///
    /// [`DpifError::BadReply`] on an unintelligible reply family.
    pub fn transact(&self, pipeline: u32, mut msg: Message) -> Result<Message, DpifError> {
        let chans = self.channel(pipeline)?;
        let tid = current_tid();
        msg.set_thread_id(tid);

        let mut outgoing = msg;
        loop {
            match chans.request.enqueue(outgoing) {
                Ok(()) => break,
                Err(RingFull(back)) => {
                    outgoing = back;
                    std::hint::spin_loop();
                }
            }
        }

        loop {
            let Some(reply) = chans.reply.dequeue() else {
                std::hint::spin_loop();
                continue;
            };
            match reply.body {
                MessageBody::Vport(_) | MessageBody::Flow(_) => {
                    if reply.thread_id() == tid {
                        return Ok(reply);
                    }
                    // another daemon thread's reply: put it back untouched
                    let mut foreign = reply;
                    loop {
                        match chans.reply.enqueue(foreign) {
                            Ok(()) => break,
                            Err(RingFull(back)) => {
                                foreign = back;
                                std::hint::spin_loop();
                            }
                        }
                    }
                }
                // unknown-family replies carry no thread id to claim by
                MessageBody::Packet(_) | MessageBody::Unknown { .. } => {
                    warn!(pipeline, "unintelligible reply family");
                    return Err(DpifError::BadReply(pipeline));
                }
            }
        }
    }

    fn check(reply: &Message) -> Result<(), DpifError> {
        match reply.err() {
            None => Ok(()),
            Some(code) => Err(DpifError::Code(code)),
        }
    }

    /// Add a vport: pick an owning pipeline round-robin, ask it to enable
    /// the port, and record the placement in the shared table.
    ///
    /// # Errors
    ///
    /// Datapath error codes (`Busy`, `NoDev`, …) and transport failures.
    pub fn vport_add(
        &self,
        ty: VportType,
        requested: Option<VportId>,
        name: &str,
    ) -> Result<VportMessage, DpifError> {
        let pipeline = self.place();
        let mut req = VportMessage::request(VportCmd::New, requested.unwrap_or(u32::MAX));
        req.ty = ty;
        req.port_name = arrayvec_name(name);
        let reply = self.transact(pipeline, Message::request(MessageBody::Vport(req)))?;
        Self::check(&reply)?;
        let MessageBody::Vport(body) = reply.body else {
            return Err(DpifError::BadReply(pipeline));
        };
        // a stale claim from a previous daemon life is replaced
        let _ = self.vports.release(body.vportid);
        self.vports
            .claim(body.vportid, ty, pipeline, body.port_name.as_str())?;
        debug!(id = body.vportid, ?ty, pipeline, "vport added");
        Ok(body)
    }

    /// Delete a vport and release its table entry.
    ///
    /// # Errors
    ///
    /// Datapath error codes and transport failures.
    pub fn vport_del(&self, id: VportId) -> Result<(), DpifError> {
        let pipeline = self.owner_of(id);
        let req = VportMessage::request(VportCmd::Del, id);
        let reply = self.transact(pipeline, Message::request(MessageBody::Vport(req)))?;
        Self::check(&reply)?;
        let _ = self.vports.release(id);
        Ok(())
    }

    /// Fetch one vport's statistics (resolving by name when `id` is the
    /// sentinel).
    ///
    /// # Errors
    ///
    /// Datapath error codes and transport failures.
    pub fn vport_get(&self, id: VportId, name: Option<&str>) -> Result<VportMessage, DpifError> {
        let pipeline = if id == u32::MAX {
            self.pipelines[0]
        } else {
            self.owner_of(id)
        };
        let mut req = VportMessage::request(VportCmd::Get, id);
        if let Some(name) = name {
            req.port_name = arrayvec_name(name);
        }
        let reply = self.transact(pipeline, Message::request(MessageBody::Vport(req)))?;
        Self::check(&reply)?;
        match reply.body {
            MessageBody::Vport(body) => Ok(body),
            _ => Err(DpifError::BadReply(pipeline)),
        }
    }

    /// Dump every enabled vport.
    ///
    /// # Errors
    ///
    /// Transport failures; the dump's `EOF` is consumed internally.
    pub fn vport_dump(&self) -> Result<Vec<VportMessage>, DpifError> {
        let pipeline = self.pipelines[0];
        let mut out = Vec::new();
        let mut cursor = u32::MAX;
        loop {
            let mut req = VportMessage::request(VportCmd::Get, cursor);
            req.flags = FLAG_DUMP;
            let reply = self.transact(pipeline, Message::request(MessageBody::Vport(req)))?;
            match reply.err() {
                Some(ErrCode::Eof) => return Ok(out),
                Some(code) => return Err(DpifError::Code(code)),
                None => {}
            }
            let MessageBody::Vport(body) = reply.body else {
                return Err(DpifError::BadReply(pipeline));
            };
            cursor = body.vportid;
            out.push(body);
        }
    }

    /// Install or replace a flow on the pipeline owning its ingress port,
    /// recording the returned handle in the flow shadow.
    ///
    /// # Errors
    ///
    /// Datapath error codes and transport failures.
    pub fn flow_put(
        &self,
        key: FlowKey,
        actions: ActionList,
        flags: u32,
        clear_stats: bool,
    ) -> Result<FlowMessage, DpifError> {
        let pipeline = self.owner_of(key.in_port);
        let mut req = FlowMessage::request(FlowCmd::New, key);
        req.flags = flags;
        req.clear = clear_stats;
        req.actions = actions;
        let reply = self.transact(pipeline, Message::request(MessageBody::Flow(req)))?;
        Self::check(&reply)?;
        let MessageBody::Flow(body) = reply.body else {
            return Err(DpifError::BadReply(pipeline));
        };
        self.flows.insert(&key, body.flow_handle)?;
        Ok(body)
    }

    /// Delete one flow (returning its final statistics) and forget its
    /// handle.
    ///
    /// # Errors
    ///
    /// Datapath error codes and transport failures.
    pub fn flow_del(&self, key: FlowKey) -> Result<FlowMessage, DpifError> {
        let pipeline = self.owner_of(key.in_port);
        let req = FlowMessage::request(FlowCmd::Del, key);
        let reply = self.transact(pipeline, Message::request(MessageBody::Flow(req)))?;
        Self::check(&reply)?;
        let MessageBody::Flow(body) = reply.body else {
            return Err(DpifError::BadReply(pipeline));
        };
        let _ = self.flows.remove(&key);
        Ok(body)
    }

    /// Flush every pipeline's flow table and the shadow.
    ///
    /// # Errors
    ///
    /// Datapath error codes and transport failures.
    pub fn flow_flush(&self) -> Result<(), DpifError> {
        for pipeline in &self.pipelines {
            let req = FlowMessage::request(FlowCmd::Del, FlowKey::default());
            let reply = self.transact(*pipeline, Message::request(MessageBody::Flow(req)))?;
            Self::check(&reply)?;
        }
        self.flows.reset();
        Ok(())
    }

    /// Fetch one flow's actions and statistics.
    ///
    /// # Errors
    ///
    /// Datapath error codes and transport failures.
    pub fn flow_get(&self, key: FlowKey) -> Result<FlowMessage, DpifError> {
        let pipeline = self.owner_of(key.in_port);
        let req = FlowMessage::request(FlowCmd::Get, key);
        let reply = self.transact(pipeline, Message::request(MessageBody::Flow(req)))?;
        Self::check(&reply)?;
        match reply.body {
            MessageBody::Flow(body) => Ok(body),
            _ => Err(DpifError::BadReply(pipeline)),
        }
    }

    /// One step of a flow dump on `pipeline`; `None` cursor starts the
    /// dump, `Ok(None)` is end-of-table.
    ///
    /// # Errors
    ///
    /// Datapath error codes and transport failures.
    pub fn flow_dump_next(
        &self,
        pipeline: u32,
        cursor: Option<FlowKey>,
    ) -> Result<Option<FlowMessage>, DpifError> {
        let mut req = FlowMessage::request(FlowCmd::Get, cursor.unwrap_or_default());
        req.flags = FLAG_DUMP;
        let reply = self.transact(pipeline, Message::request(MessageBody::Flow(req)))?;
        match reply.err() {
            Some(ErrCode::Eof) => return Ok(None),
            Some(code) => return Err(DpifError::Code(code)),
            None => {}
        }
        match reply.body {
            MessageBody::Flow(body) => Ok(Some(body)),
            _ => Err(DpifError::BadReply(pipeline)),
        }
    }

    /// Inject a packet: stage the frame in a buffer drawn from the
    /// pipeline's alloc ring (never from the data plane's caches) and hand
    /// it over with its action list.
    ///
    /// # Errors
    ///
    /// `NoBufs` when the alloc or packet ring is dry/saturated.
    pub fn packet_execute(
        &self,
        pipeline: u32,
        actions: ActionList,
        frame: &[u8],
    ) -> Result<(), DpifError> {
        let chans = self.channel(pipeline)?;
        let mut buf = chans
            .packet_alloc
            .dequeue()
            .ok_or(DpifError::Code(ErrCode::NoBufs))?;
        buf.fill(frame).map_err(|_| DpifError::Code(ErrCode::Inval))?;
        let msg = Message::request(MessageBody::Packet(PacketMessage { actions, pkt: buf }));
        chans
            .packet
            .enqueue(msg)
            .map_err(|_| DpifError::Code(ErrCode::NoBufs))?;
        Ok(())
    }
}

fn arrayvec_name(name: &str) -> arrayvec::ArrayString<{ vport::MAX_VPORT_NAME }> {
    arrayvec::ArrayString::from(name).unwrap_or_default()
}
