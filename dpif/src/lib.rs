// SPDX-License-Identifier: Apache-2.0
// Copyright uswitch Authors

//! The daemon-side datapath interface client.
//!
//! The vswitch daemon does not share an address space's worth of trust with
//! the data plane: it talks over the per-pipeline ring sets and keeps its
//! own persistent shadows — a flow table mapping installed keys to datapath
//! handles and a vport table recording which pipeline owns each port — in
//! memory-mapped files that survive daemon restarts.

pub mod client;
pub mod flow_shadow;

pub use client::{DpifClient, DpifError};
pub use flow_shadow::{FLOW_TABLE_PATH, FlowShadow};
