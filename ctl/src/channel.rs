// SPDX-License-Identifier: Apache-2.0
// Copyright uswitch Authors

//! The per-pipeline ring set.

use std::sync::Arc;

use tracing::trace;

use net::buffer::{BufferPool, PacketBuf};
use ring::registry::{RegistryError, RingRegistry};
use ring::{Ring, names};

use crate::message::Message;

/// Refill each alloc ring up to this occupancy (a quarter of the ring).
pub const ALLOC_THRESHOLD: usize = names::CONTROL_RING_SIZE / 4;

/// The eight rings belonging to one pipeline.
pub struct ChannelSet {
    pub pipeline: u32,
    /// Daemon-to-datapath control requests.
    pub request: Arc<Ring<Message>>,
    /// Datapath-to-daemon control replies.
    pub reply: Arc<Ring<Message>>,
    /// Upcalled packets (header prepended).
    pub exception: Arc<Ring<PacketBuf>>,
    /// Daemon-to-datapath packet-execute messages.
    pub packet: Arc<Ring<Message>>,
    /// Packet buffers the daemon is done with.
    pub packet_free: Arc<Ring<PacketBuf>>,
    /// Control buffers the daemon is done with.
    pub control_free: Arc<Ring<PacketBuf>>,
    /// Empty buffers for the daemon's packet path.
    pub packet_alloc: Arc<Ring<PacketBuf>>,
    /// Empty buffers for the daemon's control path.
    pub control_alloc: Arc<Ring<PacketBuf>>,
}

impl ChannelSet {
    /// Create all eight rings for `pipeline` in `registry`.
    ///
    /// # Errors
    ///
    /// [`RegistryError::Exists`] when the pipeline's rings already exist.
    pub fn create(registry: &RingRegistry, pipeline: u32) -> Result<ChannelSet, RegistryError> {
        let size = names::CONTROL_RING_SIZE;
        Ok(ChannelSet {
            pipeline,
            request: registry.create(&names::request_ring(pipeline), size)?,
            reply: registry.create(&names::reply_ring(pipeline), size)?,
            exception: registry.create(&names::exception_ring(pipeline), size)?,
            packet: registry.create(&names::packet_ring(pipeline), size)?,
            packet_free: registry.create(&names::packet_free_ring(pipeline), size)?,
            control_free: registry.create(&names::control_free_ring(pipeline), size)?,
            packet_alloc: registry.create(&names::packet_alloc_ring(pipeline), size)?,
            control_alloc: registry.create(&names::control_alloc_ring(pipeline), size)?,
        })
    }

    /// Attach to a pipeline's existing rings (the daemon side).
    ///
    /// # Errors
    ///
    /// [`RegistryError::NotFound`] when the pipeline has not created them.
    pub fn attach(registry: &RingRegistry, pipeline: u32) -> Result<ChannelSet, RegistryError> {
        Ok(ChannelSet {
            pipeline,
            request: registry.lookup(&names::request_ring(pipeline))?,
            reply: registry.lookup(&names::reply_ring(pipeline))?,
            exception: registry.lookup(&names::exception_ring(pipeline))?,
            packet: registry.lookup(&names::packet_ring(pipeline))?,
            packet_free: registry.lookup(&names::packet_free_ring(pipeline))?,
            control_free: registry.lookup(&names::control_free_ring(pipeline))?,
            packet_alloc: registry.lookup(&names::packet_alloc_ring(pipeline))?,
            control_alloc: registry.lookup(&names::control_alloc_ring(pipeline))?,
        })
    }

    /// Return daemon-released buffers to the pool and top the alloc rings
    /// back up to [`ALLOC_THRESHOLD`]. Runs after each request batch.
    pub fn replenish(&self, pool: &BufferPool) {
        // freed buffers go home by being dropped on this (data plane) side
        while let Some(buf) = self.packet_free.dequeue() {
            drop(buf);
        }
        while let Some(buf) = self.control_free.dequeue() {
            drop(buf);
        }
        for alloc in [&self.packet_alloc, &self.control_alloc] {
            let mut topped = 0;
            while alloc.len() < ALLOC_THRESHOLD {
                // never hand the daemon the fast path's last quarter
                if pool.in_flight() * 4 >= pool.capacity() * 3 {
                    break;
                }
                match pool.alloc() {
                    Ok(buf) => {
                        if alloc.enqueue(buf).is_err() {
                            break;
                        }
                        topped += 1;
                    }
                    Err(_) => break,
                }
            }
            if topped > 0 {
                trace!(pipeline = self.pipeline, topped, "alloc ring replenished");
            }
        }
    }
}
