// SPDX-License-Identifier: Apache-2.0
// Copyright uswitch Authors

//! The switch's root context.

use flow::TscClock;
use net::buffer::BufferPool;
use ring::registry::RingRegistry;
use vport::VportRegistry;

/// Process-wide state with one init/teardown lifecycle. Built once at
/// startup and handed to every pipeline as a shared reference.
pub struct Switch {
    /// The packet buffer pool.
    pub pool: BufferPool,
    /// Every port the switch can address.
    pub vports: VportRegistry,
    /// Named rings (control channels, ring-backed ports).
    pub rings: RingRegistry,
    /// Calibrated cycle clock shared by all pipelines.
    pub clock: TscClock,
}

impl Switch {
    /// Assemble a context around a pool of `pool_size` buffers.
    #[must_use]
    pub fn new(pool_size: usize, clock: TscClock) -> Switch {
        Switch {
            pool: BufferPool::new(pool_size),
            vports: VportRegistry::new(),
            rings: RingRegistry::new(),
            clock,
        }
    }
}
