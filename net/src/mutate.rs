// SPDX-License-Identifier: Apache-2.0
// Copyright uswitch Authors

//! In-place frame rewrites used by the action executor.
//!
//! All offsets follow the fixed L2/L3/L4 layout the key extractor assumes.
//! VLAN push/pop move the 12 address bytes rather than the payload, so
//! payload alignment is preserved.

use crate::buffer::{BufferError, PacketBuf};
use crate::eth::{ETHER_HDR_LEN, ETHERTYPE_VLAN, IPV4_HDR_LEN, Mac, VLAN_HDR_LEN};

/// Errors from frame mutation.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MutateError {
    /// The frame is too short for the requested rewrite.
    #[error("frame too short: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    /// No 802.1Q tag to pop.
    #[error("frame carries no vlan tag")]
    NotTagged,
    #[error(transparent)]
    Buffer(#[from] BufferError),
}

fn check_len(buf: &PacketBuf, need: usize) -> Result<(), MutateError> {
    if buf.len() < need {
        return Err(MutateError::Truncated {
            need,
            have: buf.len(),
        });
    }
    Ok(())
}

/// Insert one 802.1Q tag with `tci` between the source MAC and the
/// EtherType. The frame grows by four bytes; the original EtherType shifts
/// to offset 16.
pub fn push_vlan(buf: &mut PacketBuf, tci: u16) -> Result<(), MutateError> {
    check_len(buf, ETHER_HDR_LEN)?;
    buf.prepend(VLAN_HDR_LEN)?;
    let bytes = buf.bytes_mut();
    // addresses slide forward into the new prefix
    bytes.copy_within(VLAN_HDR_LEN..VLAN_HDR_LEN + 12, 0);
    bytes[12..14].copy_from_slice(&ETHERTYPE_VLAN.to_be_bytes());
    bytes[14..16].copy_from_slice(&tci.to_be_bytes());
    Ok(())
}

/// Strip one 802.1Q tag, shrinking the frame by four bytes.
pub fn pop_vlan(buf: &mut PacketBuf) -> Result<(), MutateError> {
    check_len(buf, ETHER_HDR_LEN + VLAN_HDR_LEN)?;
    let bytes = buf.bytes_mut();
    if bytes[12..14] != ETHERTYPE_VLAN.to_be_bytes() {
        return Err(MutateError::NotTagged);
    }
    // addresses slide back over the tag
    bytes.copy_within(0..12, VLAN_HDR_LEN);
    buf.trim_front(VLAN_HDR_LEN)?;
    Ok(())
}

/// Overwrite the Ethernet destination and source addresses.
pub fn set_ethernet(buf: &mut PacketBuf, dst: Mac, src: Mac) -> Result<(), MutateError> {
    check_len(buf, ETHER_HDR_LEN)?;
    let bytes = buf.bytes_mut();
    bytes[0..6].copy_from_slice(&dst.0);
    bytes[6..12].copy_from_slice(&src.0);
    Ok(())
}

fn l3_offset(bytes: &[u8]) -> usize {
    if bytes.len() >= ETHER_HDR_LEN && bytes[12..14] == ETHERTYPE_VLAN.to_be_bytes() {
        ETHER_HDR_LEN + VLAN_HDR_LEN
    } else {
        ETHER_HDR_LEN
    }
}

/// Overwrite IPv4 source, destination, ToS and TTL. Checksum upkeep is the
/// caller's concern.
pub fn set_ipv4(
    buf: &mut PacketBuf,
    src: u32,
    dst: u32,
    tos: u8,
    ttl: u8,
) -> Result<(), MutateError> {
    let l3 = l3_offset(buf.bytes());
    check_len(buf, l3 + IPV4_HDR_LEN)?;
    let bytes = buf.bytes_mut();
    bytes[l3 + 1] = tos;
    bytes[l3 + 8] = ttl;
    bytes[l3 + 12..l3 + 16].copy_from_slice(&src.to_be_bytes());
    bytes[l3 + 16..l3 + 20].copy_from_slice(&dst.to_be_bytes());
    Ok(())
}

/// Overwrite the transport source and destination ports (TCP and UDP share
/// the port offsets).
pub fn set_transport_ports(buf: &mut PacketBuf, src: u16, dst: u16) -> Result<(), MutateError> {
    let l4 = l3_offset(buf.bytes()) + IPV4_HDR_LEN;
    check_len(buf, l4 + 4)?;
    let bytes = buf.bytes_mut();
    bytes[l4..l4 + 2].copy_from_slice(&src.to_be_bytes());
    bytes[l4 + 2..l4 + 4].copy_from_slice(&dst.to_be_bytes());
    Ok(())
}
