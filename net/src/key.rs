// SPDX-License-Identifier: Apache-2.0
// Copyright uswitch Authors

//! The exact-match flow key and its extractor.
//!
//! The key is a pure function of the ingress vport and the first
//! L2+L3+L4 headers of the frame. Multibyte fields are stored in host byte
//! order after extraction; layers absent from the frame leave their fields
//! zero, so the all-zero key doubles as the "empty key" sentinel on the
//! control channel.

use crate::eth::{
    ETHER_HDR_LEN, ETHERTYPE_IPV4, ETHERTYPE_VLAN, IPPROTO_TCP, IPPROTO_UDP, IPV4_HDR_LEN, Mac,
    TCP_FLAG_MASK, VLAN_HDR_LEN,
};

const VLAN_ID_MASK: u16 = 0xFFF;
const VLAN_PRIO_SHIFT: u16 = 13;
const IP_FRAG_OFFSET_MASK: u16 = 0x1FFF;
const IP_FLAG_MORE_FRAGMENTS: u16 = 0x2000;

/// IPv4 fragment classification carried in the key.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum FragType {
    /// Not a fragment.
    #[default]
    None = 0,
    /// First fragment (offset zero, more-fragments set).
    First = 1,
    /// Any later fragment.
    Later = 2,
}

/// Exact-match flow key: ingress port plus the twelve-tuple of L2/L3/L4
/// header fields.
///
/// `ether_type` holds the outer EtherType as seen at frame offset 12; for an
/// 802.1Q frame that is `0x8100` while `vlan_id`/`vlan_prio` carry the tag
/// and the encapsulated EtherType selects the L3 parse.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub in_port: u32,
    pub ether_dst: Mac,
    pub ether_src: Mac,
    pub ether_type: u16,
    pub vlan_id: u16,
    pub vlan_prio: u8,
    pub ip_src: u32,
    pub ip_dst: u32,
    pub ip_proto: u8,
    pub ip_tos: u8,
    pub ip_ttl: u8,
    pub ip_frag: FragType,
    pub tran_src_port: u16,
    pub tran_dst_port: u16,
}

impl FlowKey {
    /// Byte length of the fixed wire encoding used in shared tables.
    pub const WIRE_LEN: usize = 40;

    /// True for the all-zero key, the control channel's flush/first-dump
    /// sentinel.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == FlowKey::default()
    }

    /// Fixed little-endian encoding, stable across processes. The all-zero
    /// key encodes to all zeroes.
    #[must_use]
    pub fn to_wire(&self) -> [u8; Self::WIRE_LEN] {
        let mut out = [0u8; Self::WIRE_LEN];
        out[0..4].copy_from_slice(&self.in_port.to_le_bytes());
        out[4..10].copy_from_slice(&self.ether_dst.0);
        out[10..16].copy_from_slice(&self.ether_src.0);
        out[16..18].copy_from_slice(&self.ether_type.to_le_bytes());
        out[18..20].copy_from_slice(&self.vlan_id.to_le_bytes());
        out[20] = self.vlan_prio;
        out[21..25].copy_from_slice(&self.ip_src.to_le_bytes());
        out[25..29].copy_from_slice(&self.ip_dst.to_le_bytes());
        out[29] = self.ip_proto;
        out[30] = self.ip_tos;
        out[31] = self.ip_ttl;
        out[32] = self.ip_frag as u8;
        out[33..35].copy_from_slice(&self.tran_src_port.to_le_bytes());
        out[35..37].copy_from_slice(&self.tran_dst_port.to_le_bytes());
        out
    }

    /// Decode [`FlowKey::to_wire`] bytes. `None` when the slice is short or
    /// the fragment tag is out of range.
    #[must_use]
    pub fn from_wire(wire: &[u8]) -> Option<FlowKey> {
        if wire.len() < Self::WIRE_LEN {
            return None;
        }
        let frag = match wire[32] {
            0 => FragType::None,
            1 => FragType::First,
            2 => FragType::Later,
            _ => return None,
        };
        Some(FlowKey {
            in_port: u32::from_le_bytes(wire[0..4].try_into().ok()?),
            ether_dst: Mac(wire[4..10].try_into().ok()?),
            ether_src: Mac(wire[10..16].try_into().ok()?),
            ether_type: u16::from_le_bytes(wire[16..18].try_into().ok()?),
            vlan_id: u16::from_le_bytes(wire[18..20].try_into().ok()?),
            vlan_prio: wire[20],
            ip_src: u32::from_le_bytes(wire[21..25].try_into().ok()?),
            ip_dst: u32::from_le_bytes(wire[25..29].try_into().ok()?),
            ip_proto: wire[29],
            ip_tos: wire[30],
            ip_ttl: wire[31],
            ip_frag: frag,
            tran_src_port: u16::from_le_bytes(wire[33..35].try_into().ok()?),
            tran_dst_port: u16::from_le_bytes(wire[35..37].try_into().ok()?),
        })
    }
}

fn be16(frame: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_be_bytes([*frame.get(at)?, *frame.get(at + 1)?]))
}

fn be32(frame: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_be_bytes([
        *frame.get(at)?,
        *frame.get(at + 1)?,
        *frame.get(at + 2)?,
        *frame.get(at + 3)?,
    ]))
}

fn mac(frame: &[u8], at: usize) -> Option<Mac> {
    let bytes: [u8; 6] = frame.get(at..at + 6)?.try_into().ok()?;
    Some(Mac(bytes))
}

/// Extract the flow key for `frame` received on `in_port`.
///
/// Parses Ethernet, at most one 802.1Q tag, IPv4, and TCP/UDP ports, in that
/// order; a truncated frame stops the parse and leaves the remaining fields
/// zero. A second VLAN tag is not consumed: the inner tag stays in the
/// payload and no L3 fields are extracted for such frames.
#[must_use]
pub fn extract(frame: &[u8], in_port: u32) -> FlowKey {
    let mut key = FlowKey {
        in_port,
        ..FlowKey::default()
    };

    let (Some(dst), Some(src), Some(ether_type)) = (mac(frame, 0), mac(frame, 6), be16(frame, 12))
    else {
        return key;
    };
    key.ether_dst = dst;
    key.ether_src = src;
    key.ether_type = ether_type;

    let mut next_proto = ether_type;
    let mut at = ETHER_HDR_LEN;

    if next_proto == ETHERTYPE_VLAN {
        let Some(tci) = be16(frame, at) else {
            return key;
        };
        key.vlan_id = tci & VLAN_ID_MASK;
        key.vlan_prio = (tci >> VLAN_PRIO_SHIFT) as u8;
        let Some(inner) = be16(frame, at + 2) else {
            return key;
        };
        next_proto = inner;
        at += VLAN_HDR_LEN;
    }

    if next_proto != ETHERTYPE_IPV4 {
        return key;
    }
    let (Some(tos), Some(frag), Some(ttl), Some(proto), Some(ip_src), Some(ip_dst)) = (
        frame.get(at + 1).copied(),
        be16(frame, at + 6),
        frame.get(at + 8).copied(),
        frame.get(at + 9).copied(),
        be32(frame, at + 12),
        be32(frame, at + 16),
    ) else {
        return key;
    };
    key.ip_tos = tos;
    key.ip_ttl = ttl;
    key.ip_proto = proto;
    key.ip_src = ip_src;
    key.ip_dst = ip_dst;
    key.ip_frag = if frag & IP_FRAG_OFFSET_MASK != 0 {
        FragType::Later
    } else if frag & IP_FLAG_MORE_FRAGMENTS != 0 {
        FragType::First
    } else {
        FragType::None
    };
    at += IPV4_HDR_LEN;

    if key.ip_proto == IPPROTO_TCP || key.ip_proto == IPPROTO_UDP {
        let (Some(sport), Some(dport)) = (be16(frame, at), be16(frame, at + 2)) else {
            return key;
        };
        key.tran_src_port = sport;
        key.tran_dst_port = dport;
    }
    key
}

/// TCP flags of `frame`, masked to the six-flag set, or zero when the frame
/// is not untagged-or-single-tagged IPv4/TCP or is too short.
#[must_use]
pub fn tcp_flags(frame: &[u8]) -> u8 {
    let mut at = ETHER_HDR_LEN;
    let Some(mut ether_type) = be16(frame, 12) else {
        return 0;
    };
    if ether_type == ETHERTYPE_VLAN {
        let Some(inner) = be16(frame, at + 2) else {
            return 0;
        };
        ether_type = inner;
        at += VLAN_HDR_LEN;
    }
    if ether_type != ETHERTYPE_IPV4 {
        return 0;
    }
    if frame.get(at + 9).copied() != Some(IPPROTO_TCP) {
        return 0;
    }
    frame
        .get(at + IPV4_HDR_LEN + 13)
        .map_or(0, |flags| flags & TCP_FLAG_MASK)
}
