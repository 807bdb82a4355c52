// SPDX-License-Identifier: Apache-2.0
// Copyright uswitch Authors

//! Packet primitives for the uswitch data plane.
//!
//! This crate owns everything that touches raw frame bytes: the [`Mac`]
//! address type and EtherType constants, the thirteen-tuple [`FlowKey`] and
//! its fixed-layout extractor, in-place frame mutation (VLAN push/pop, header
//! field rewrites), and the headroom-carrying [`PacketBuf`] backed by a
//! preallocated, per-core-cached [`BufferPool`].
//!
//! Nothing here allocates on the forwarding path: buffers come from the pool,
//! clones share payload by reference count, and mutation of a shared payload
//! copies into a fresh pool buffer first.

pub mod buffer;
pub mod eth;
pub mod key;
pub mod mutate;

#[cfg(any(doc, test, feature = "test_frames"))]
pub mod test_frames;

pub use buffer::{BufferError, BufferPool, PacketBuf};
pub use eth::Mac;
pub use key::{FlowKey, FragType};
