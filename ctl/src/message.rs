// SPDX-License-Identifier: Apache-2.0
// Copyright uswitch Authors

//! Typed datapath messages.
//!
//! The wire contract is `{int16 type, int16 error, union}` with the family
//! tags and flag bits below; this module keeps those values bit-exact while
//! the substructures travel as typed values on the rings.

use arrayvec::ArrayString;

use errno::ErrCode;
use flow::{ActionList, FlowStats};
use net::FlowKey;
use net::buffer::PacketBuf;
use vport::{MAX_VPORT_NAME, PortStatsSnapshot, VportId, VportType};

/// Vport message family tag.
pub const VPORT_CMD_FAMILY: i16 = 0xE;
/// Flow message family tag.
pub const FLOW_CMD_FAMILY: i16 = 0xF;
/// Packet message family tag.
pub const PACKET_CMD_FAMILY: i16 = 0x1F;

/// Flow dump: start-of-table bit.
pub const FLAG_ROOT: u32 = 0x100;
/// Flow dump: match bit.
pub const FLAG_MATCH: u32 = 0x200;
/// Flow dump request.
pub const FLAG_DUMP: u32 = FLAG_ROOT | FLAG_MATCH;
/// Atomic dump bit.
pub const FLAG_ATOMIC: u32 = 0x400;

/// Flow put: replace an existing entry.
pub const FLAG_REPLACE: u32 = 0x100;
/// Flow put: fail when the entry exists.
pub const FLAG_EXCL: u32 = 0x200;
/// Flow put: create when missing.
pub const FLAG_CREATE: u32 = 0x400;
/// Flow put: append semantics (defined for wire compatibility; this
/// datapath only honors REPLACE and CREATE).
pub const FLAG_APPEND: u32 = 0x800;

/// Vport is an output port.
pub const VPORT_FLAG_OUT: u32 = 0x001;
/// Vport is an input port.
pub const VPORT_FLAG_IN: u32 = 0x002;
/// Vport carries traffic both ways.
pub const VPORT_FLAG_INOUT: u32 = VPORT_FLAG_IN | VPORT_FLAG_OUT;

/// Vport sub-commands.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VportCmd {
    Unspec = 0,
    New = 1,
    Del = 2,
    Get = 3,
}

/// Flow sub-commands.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FlowCmd {
    Unspec = 0,
    New = 1,
    Del = 2,
    Get = 3,
}

/// Packet sub-commands; `Miss` and `Action` double as upcall reasons.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PacketCmd {
    Unspec = 0,
    Miss = 1,
    Action = 2,
    Execute = 3,
}

impl PacketCmd {
    /// Decode the upcall `cmd` byte.
    #[must_use]
    pub const fn from_wire(raw: u8) -> Option<PacketCmd> {
        match raw {
            0 => Some(PacketCmd::Unspec),
            1 => Some(PacketCmd::Miss),
            2 => Some(PacketCmd::Action),
            3 => Some(PacketCmd::Execute),
            _ => None,
        }
    }
}

/// Vport request/reply body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VportMessage {
    /// Id of the daemon thread awaiting the reply.
    pub thread_id: u32,
    pub cmd: VportCmd,
    pub flags: u32,
    pub vportid: VportId,
    pub port_name: ArrayString<MAX_VPORT_NAME>,
    pub ty: VportType,
    pub stats: PortStatsSnapshot,
}

impl VportMessage {
    /// A request skeleton for `cmd` on `vportid`.
    #[must_use]
    pub fn request(cmd: VportCmd, vportid: VportId) -> VportMessage {
        VportMessage {
            thread_id: 0,
            cmd,
            flags: 0,
            vportid,
            port_name: ArrayString::new(),
            ty: VportType::Disabled,
            stats: PortStatsSnapshot::default(),
        }
    }
}

/// Flow request/reply body.
#[derive(Clone, Debug, PartialEq)]
pub struct FlowMessage {
    /// Id of the daemon thread awaiting the reply.
    pub thread_id: u32,
    pub cmd: FlowCmd,
    pub flags: u32,
    pub key: FlowKey,
    /// Clear statistics on replace.
    pub clear: bool,
    pub actions: ActionList,
    pub stats: FlowStats,
    /// Datapath handle, filled in replies.
    pub flow_handle: u64,
}

impl FlowMessage {
    /// A request skeleton for `cmd` on `key`.
    #[must_use]
    pub fn request(cmd: FlowCmd, key: FlowKey) -> FlowMessage {
        FlowMessage {
            thread_id: 0,
            cmd,
            flags: 0,
            key,
            clear: false,
            actions: ActionList::new(),
            stats: FlowStats::default(),
            flow_handle: 0,
        }
    }
}

/// Packet-execute body: run `actions` on the attached packet.
#[derive(Clone, Debug)]
pub struct PacketMessage {
    pub actions: ActionList,
    pub pkt: PacketBuf,
}

/// The message union.
#[derive(Clone, Debug)]
pub enum MessageBody {
    Vport(VportMessage),
    Flow(FlowMessage),
    Packet(PacketMessage),
    /// A family tag this datapath does not understand. Dispatch answers it
    /// with `INVAL` and touches no state.
    Unknown { mtype: i16 },
}

/// One control-channel message.
#[derive(Clone, Debug)]
pub struct Message {
    /// `ErrCode` wire value; zero in requests and successful replies.
    pub error: i16,
    pub body: MessageBody,
}

impl Message {
    #[must_use]
    pub fn request(body: MessageBody) -> Message {
        Message { error: 0, body }
    }

    /// The wire `type` field.
    #[must_use]
    pub fn family(&self) -> i16 {
        match &self.body {
            MessageBody::Vport(_) => VPORT_CMD_FAMILY,
            MessageBody::Flow(_) => FLOW_CMD_FAMILY,
            MessageBody::Packet(_) => PACKET_CMD_FAMILY,
            MessageBody::Unknown { mtype } => *mtype,
        }
    }

    /// Decoded error of a reply; `None` means success.
    #[must_use]
    pub fn err(&self) -> Option<ErrCode> {
        ErrCode::from_wire(self.error)
    }

    /// The thread id the reply should be claimed by.
    #[must_use]
    pub fn thread_id(&self) -> u32 {
        match &self.body {
            MessageBody::Vport(msg) => msg.thread_id,
            MessageBody::Flow(msg) => msg.thread_id,
            MessageBody::Packet(_) | MessageBody::Unknown { .. } => 0,
        }
    }

    /// Stamp the sending thread's id into the body.
    pub fn set_thread_id(&mut self, tid: u32) {
        match &mut self.body {
            MessageBody::Vport(msg) => msg.thread_id = tid,
            MessageBody::Flow(msg) => msg.thread_id = tid,
            MessageBody::Packet(_) | MessageBody::Unknown { .. } => {}
        }
    }
}
