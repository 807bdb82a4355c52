// SPDX-License-Identifier: Apache-2.0
// Copyright uswitch Authors

//! The upcall header prepended to packets on the exception ring.
//!
//! Layout: `{uint8 cmd, flow_key}` ahead of the original frame. The daemon
//! strips the header before handing the packet to its OpenFlow pipeline.

use errno::ErrCode;
use net::FlowKey;
use net::buffer::PacketBuf;

use crate::message::PacketCmd;

/// Bytes the upcall header occupies in headroom.
pub const UPCALL_LEN: usize = 1 + FlowKey::WIRE_LEN;

/// A stripped upcall.
#[derive(Clone, Debug, PartialEq)]
pub struct Upcall {
    pub cmd: PacketCmd,
    pub key: FlowKey,
}

/// Prepend the upcall header to `pkt`.
///
/// # Errors
///
/// `NoBufs` when the header does not fit in the packet's headroom; the
/// caller drops the packet with a warning in that case.
pub fn prepend(pkt: &mut PacketBuf, cmd: PacketCmd, key: &FlowKey) -> Result<(), ErrCode> {
    let header = pkt.prepend(UPCALL_LEN).map_err(|_| ErrCode::NoBufs)?;
    header[0] = cmd as u8;
    header[1..].copy_from_slice(&key.to_wire());
    Ok(())
}

/// Strip and decode the upcall header from `pkt`, leaving the original
/// frame.
///
/// # Errors
///
/// `Inval` when the packet is shorter than a header or carries an unknown
/// command byte.
pub fn strip(pkt: &mut PacketBuf) -> Result<Upcall, ErrCode> {
    if pkt.len() < UPCALL_LEN {
        return Err(ErrCode::Inval);
    }
    let cmd = PacketCmd::from_wire(pkt.bytes()[0]).ok_or(ErrCode::Inval)?;
    let key = FlowKey::from_wire(&pkt.bytes()[1..UPCALL_LEN]).ok_or(ErrCode::Inval)?;
    pkt.trim_front(UPCALL_LEN).map_err(|_| ErrCode::Inval)?;
    Ok(Upcall { cmd, key })
}

#[cfg(test)]
mod test {
    use super::*;
    use net::buffer::BufferPool;
    use net::key::extract;
    use net::test_frames::FrameSpec;

    #[test]
    fn prepend_then_strip_restores_frame() {
        let pool = BufferPool::new(4);
        let frame = FrameSpec {
            tcp: Some((12345, 80)),
            ..FrameSpec::default()
        }
        .build();
        let key = extract(&frame, 0x10);
        let mut pkt = pool.alloc_from(&frame).unwrap();

        prepend(&mut pkt, PacketCmd::Miss, &key).unwrap();
        assert_eq!(pkt.len(), frame.len() + UPCALL_LEN);

        let upcall = strip(&mut pkt).unwrap();
        assert_eq!(upcall.cmd, PacketCmd::Miss);
        assert_eq!(upcall.key, key);
        assert_eq!(pkt.bytes(), &frame[..]);
    }

    #[test]
    fn prepend_without_headroom_reports_nobufs() {
        let pool = BufferPool::new(4);
        let mut pkt = pool.alloc_from(&[0u8; 32]).unwrap();
        // burn the headroom
        while pkt.headroom() >= UPCALL_LEN {
            pkt.prepend(UPCALL_LEN).unwrap();
        }
        assert_eq!(
            prepend(&mut pkt, PacketCmd::Miss, &FlowKey::default()).unwrap_err(),
            ErrCode::NoBufs
        );
    }

    #[test]
    fn strip_rejects_runts_and_garbage() {
        let pool = BufferPool::new(4);
        let mut runt = pool.alloc_from(&[1, 2, 3]).unwrap();
        assert_eq!(strip(&mut runt).unwrap_err(), ErrCode::Inval);

        let mut garbage = pool.alloc_from(&[0xEEu8; UPCALL_LEN + 8]).unwrap();
        assert_eq!(strip(&mut garbage).unwrap_err(), ErrCode::Inval);
    }
}
