// SPDX-License-Identifier: Apache-2.0
// Copyright uswitch Authors

//! The forwarding core: per-core pipelines over the shared switch context.
//!
//! A [`Pipeline`] busy-polls its assigned ingress vports, classifies each
//! packet by the exact-match key, and either runs the matched action list
//! or upcalls the packet to the daemon. In the same loop it drains its
//! control rings, answering vport/flow/packet requests. All process-wide
//! state hangs off one [`Switch`] context threaded into every pipeline at
//! launch; there are no ambient globals.

pub mod context;
pub mod executor;
pub mod pipeline;

pub use context::Switch;
pub use pipeline::{Pipeline, PipelineConfig, PipelineError};
