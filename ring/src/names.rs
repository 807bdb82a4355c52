// SPDX-License-Identifier: Apache-2.0
// Copyright uswitch Authors

//! Ring name templates, bit-exact with the control daemon's expectations.
//!
//! `%02u` in the original templates is the owning pipeline id.

/// Size of every control-channel ring.
pub const CONTROL_RING_SIZE: usize = 2048;

macro_rules! name_fn {
    ($fn_name:ident, $suffix:literal) => {
        #[doc = concat!("`OVDK%02u_", $suffix, "` for the given pipeline.")]
        #[must_use]
        pub fn $fn_name(pipeline: u32) -> String {
            format!(concat!("OVDK{:02}_", $suffix), pipeline)
        }
    };
}

name_fn!(request_ring, "Request_Ring");
name_fn!(reply_ring, "Reply_Ring");
name_fn!(exception_ring, "Exception_Ring");
name_fn!(packet_ring, "Packet_Ring");
name_fn!(packet_free_ring, "Packet_Free_Ring");
name_fn!(control_free_ring, "Control_Free_Ring");
name_fn!(packet_alloc_ring, "Packet_Alloc_Ring");
name_fn!(control_alloc_ring, "Control_Alloc_Ring");
