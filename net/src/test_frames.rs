// SPDX-License-Identifier: Apache-2.0
// Copyright uswitch Authors

//! Frame synthesis for tests.
//!
//! Builds Ethernet / 802.1Q / IPv4 / TCP / UDP frames with `etherparse` so
//! extractor and executor tests assert against independently-constructed
//! headers rather than this crate's own offsets.

use etherparse::{
    EtherType, Ethernet2Header, IpNumber, Ipv4Header, SingleVlanHeader, TcpHeader, UdpHeader,
    VlanId, VlanPcp,
};

use crate::eth::Mac;

/// Declarative description of a test frame.
#[derive(Copy, Clone, Debug)]
pub struct FrameSpec {
    pub ether_dst: Mac,
    pub ether_src: Mac,
    /// One 802.1Q tag: `(vlan id, priority)`.
    pub vlan: Option<(u16, u8)>,
    pub ip_src: [u8; 4],
    pub ip_dst: [u8; 4],
    pub ip_ttl: u8,
    /// TCP ports `(source, destination)`; exclusive with `udp`.
    pub tcp: Option<(u16, u16)>,
    /// UDP ports `(source, destination)`; exclusive with `tcp`.
    pub udp: Option<(u16, u16)>,
    /// Zero-pad the frame up to this length.
    pub pad_to: usize,
}

impl Default for FrameSpec {
    fn default() -> Self {
        FrameSpec {
            ether_dst: Mac([0x02, 0, 0, 0, 0, 0x02]),
            ether_src: Mac([0x02, 0, 0, 0, 0, 0x01]),
            vlan: None,
            ip_src: [10, 0, 0, 1],
            ip_dst: [10, 0, 0, 2],
            ip_ttl: 64,
            tcp: None,
            udp: None,
            pad_to: 64,
        }
    }
}

impl FrameSpec {
    /// Serialise the frame.
    #[must_use]
    #[allow(clippy::unwrap_used, clippy::missing_panics_doc)]
    pub fn build(&self) -> Vec<u8> {
        assert!(
            self.tcp.is_none() || self.udp.is_none(),
            "tcp and udp are exclusive"
        );
        let l2_len = 14 + if self.vlan.is_some() { 4 } else { 0 };
        let l4_len = if self.tcp.is_some() {
            20
        } else if self.udp.is_some() {
            8
        } else {
            0
        };
        let pad = self.pad_to.saturating_sub(l2_len + 20 + l4_len);

        let mut out = Vec::with_capacity(self.pad_to.max(l2_len + 20 + l4_len));

        Ethernet2Header {
            destination: self.ether_dst.0,
            source: self.ether_src.0,
            ether_type: if self.vlan.is_some() {
                EtherType::VLAN_TAGGED_FRAME
            } else {
                EtherType::IPV4
            },
        }
        .write(&mut out)
        .unwrap();

        if let Some((vid, pcp)) = self.vlan {
            SingleVlanHeader {
                pcp: VlanPcp::try_new(pcp).unwrap(),
                drop_eligible_indicator: false,
                vlan_id: VlanId::try_new(vid).unwrap(),
                ether_type: EtherType::IPV4,
            }
            .write(&mut out)
            .unwrap();
        }

        let protocol = if self.tcp.is_some() {
            IpNumber::TCP
        } else if self.udp.is_some() {
            IpNumber::UDP
        } else {
            // reserved-for-experimentation protocol number
            IpNumber(253)
        };
        let mut ip = Ipv4Header::new(
            (l4_len + pad) as u16,
            self.ip_ttl,
            protocol,
            self.ip_src,
            self.ip_dst,
        )
        .unwrap();
        ip.header_checksum = ip.calc_header_checksum();
        ip.write(&mut out).unwrap();

        if let Some((sport, dport)) = self.tcp {
            TcpHeader::new(sport, dport, 0, 8192).write(&mut out).unwrap();
        } else if let Some((sport, dport)) = self.udp {
            UdpHeader {
                source_port: sport,
                destination_port: dport,
                length: (8 + pad) as u16,
                checksum: 0,
            }
            .write(&mut out)
            .unwrap();
        }

        out.resize(out.len() + pad, 0);
        out
    }
}
