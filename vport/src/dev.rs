// SPDX-License-Identifier: Apache-2.0
// Copyright uswitch Authors

//! Physical-port driver seam.
//!
//! NIC driver internals are outside the switch core; a phy vport talks to
//! whatever implements [`PhyDriver`]. Tests (and ringless deployments) use
//! [`RingDev`], which fronts a pair of named rings exactly like the
//! historical ring-backed port stubs.

use std::sync::Arc;

use net::PacketBuf;
use ring::Ring;

/// Poll-mode driver interface for a physical port.
///
/// Implementations are non-blocking: `rx` returns `None` when nothing is
/// pending, `tx` hands the packet back when the device queue is full.
pub trait PhyDriver: Send + Sync {
    /// Receive one frame, if available.
    fn rx(&self) -> Option<PacketBuf>;

    /// Transmit one frame.
    ///
    /// # Errors
    ///
    /// Returns the packet when the device cannot accept it.
    fn tx(&self, pkt: PacketBuf) -> Result<(), PacketBuf>;
}

/// A phy "device" backed by two rings: frames enqueued on `rx` appear on the
/// wire side, frames transmitted land on `tx`.
pub struct RingDev {
    rx: Arc<Ring<PacketBuf>>,
    tx: Arc<Ring<PacketBuf>>,
}

impl RingDev {
    #[must_use]
    pub fn new(rx: Arc<Ring<PacketBuf>>, tx: Arc<Ring<PacketBuf>>) -> RingDev {
        RingDev { rx, tx }
    }
}

impl PhyDriver for RingDev {
    fn rx(&self) -> Option<PacketBuf> {
        self.rx.dequeue()
    }

    fn tx(&self, pkt: PacketBuf) -> Result<(), PacketBuf> {
        self.tx.enqueue(pkt).map_err(|full| full.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use net::buffer::BufferPool;

    #[test]
    fn ring_dev_moves_frames() {
        let pool = BufferPool::new(4);
        let wire_in = Arc::new(Ring::new(8));
        let wire_out = Arc::new(Ring::new(8));
        let dev = RingDev::new(Arc::clone(&wire_in), Arc::clone(&wire_out));

        wire_in.enqueue(pool.alloc_from(&[1, 2, 3]).unwrap()).unwrap();
        let got = dev.rx().unwrap();
        assert_eq!(got.bytes(), &[1, 2, 3]);
        assert!(dev.rx().is_none());

        dev.tx(got).unwrap();
        assert_eq!(wire_out.dequeue().unwrap().bytes(), &[1, 2, 3]);
    }

    #[test]
    fn full_device_returns_packet() {
        let pool = BufferPool::new(4);
        let dev = RingDev::new(Arc::new(Ring::new(8)), Arc::new(Ring::new(2)));
        dev.tx(pool.alloc().unwrap()).unwrap();
        dev.tx(pool.alloc().unwrap()).unwrap();
        let back = dev.tx(pool.alloc().unwrap());
        assert!(back.is_err());
        drop(back);
        assert_eq!(pool.in_flight(), 2);
    }
}
