// SPDX-License-Identifier: Apache-2.0
// Copyright uswitch Authors

//! The control channel between the data plane and the vswitch daemon.
//!
//! Each pipeline owns eight named rings: request/reply for typed control
//! messages, the exception ring for upcalled packets, the packet ring for
//! daemon-injected packets, and two alloc/free pairs that move empty
//! buffers across the process boundary so the daemon never touches the data
//! plane's per-core buffer caches (a hard invariant).
//!
//! Wake-up of a blocked daemon rides a best-effort UNIX datagram sent on
//! the exception ring's empty-to-non-empty edge.

pub mod channel;
pub mod message;
pub mod upcall;
pub mod wakeup;

pub use channel::{ALLOC_THRESHOLD, ChannelSet};
pub use message::{
    FLAG_ATOMIC, FLAG_CREATE, FLAG_DUMP, FLAG_EXCL, FLAG_MATCH, FLAG_REPLACE, FLAG_ROOT,
    FLOW_CMD_FAMILY, FlowCmd, FlowMessage, Message, MessageBody, PACKET_CMD_FAMILY, PacketCmd,
    PacketMessage, VPORT_CMD_FAMILY, VPORT_FLAG_IN, VPORT_FLAG_INOUT, VPORT_FLAG_OUT, VportCmd,
    VportMessage,
};
pub use wakeup::{DPIF_SOCK_PATH, WakeupRx, WakeupTx};
