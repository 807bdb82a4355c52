// SPDX-License-Identifier: Apache-2.0
// Copyright uswitch Authors

//! The vport layer: every packet source and sink the switch knows about.
//!
//! A vport is a named, typed port; the id space is partitioned by
//! [`VportType`] so an id alone identifies how a port does I/O. The
//! [`registry::VportRegistry`] dispatches receive/send/flush over the
//! type-specific descriptor, counts statistics, and backs the control-side
//! persistent table shared with the daemon across restarts.

pub mod dev;
pub mod egress;
pub mod memnic;
pub mod registry;
pub mod stats;
pub mod table;
pub mod types;

pub use registry::{VportError, VportRegistry};
pub use stats::{PortStats, PortStatsSnapshot, SwitchStats};
pub use types::{MAX_VPORT_NAME, MAX_VPORTS, VportId, VportType};
