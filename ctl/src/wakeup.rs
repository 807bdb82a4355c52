// SPDX-License-Identifier: Apache-2.0
// Copyright uswitch Authors

//! Edge wake-up for the daemon's poll loop.
//!
//! The data plane sends a datagram when the exception ring goes from empty
//! to non-empty; pending bytes on the socket are the daemon's only wake
//! signal. Sends are non-blocking and best-effort: a lost wake is tolerated
//! because the daemon re-polls periodically.

use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

/// Default rendezvous path for the wake-up socket.
pub const DPIF_SOCK_PATH: &str = "/tmp/dpif_dpdk.sock";

/// Data-plane side: fire-and-forget wakes.
pub struct WakeupTx {
    sock: UnixDatagram,
    peer: PathBuf,
}

impl WakeupTx {
    /// An unbound, non-blocking sender towards `peer`.
    ///
    /// # Errors
    ///
    /// Socket creation failures (fatal at startup).
    pub fn new(peer: impl AsRef<Path>) -> std::io::Result<WakeupTx> {
        let sock = UnixDatagram::unbound()?;
        sock.set_nonblocking(true)?;
        Ok(WakeupTx {
            sock,
            peer: peer.as_ref().to_path_buf(),
        })
    }

    /// Send one wake. Errors (no listener, full socket buffer) are ignored.
    pub fn signal(&self) {
        let _ = self.sock.send_to(&1u32.to_ne_bytes(), &self.peer);
    }
}

/// Daemon side: blocks until woken or timed out.
pub struct WakeupRx {
    sock: UnixDatagram,
    path: PathBuf,
}

impl WakeupRx {
    /// Bind the wake-up socket, replacing any stale one at `path`.
    ///
    /// # Errors
    ///
    /// Bind failures.
    pub fn bind(path: impl AsRef<Path>) -> std::io::Result<WakeupRx> {
        let path = path.as_ref().to_path_buf();
        let _ = std::fs::remove_file(&path);
        let sock = UnixDatagram::bind(&path)?;
        debug!(path = %path.display(), "bound dpif wakeup socket");
        Ok(WakeupRx { sock, path })
    }

    /// Wait up to `timeout` for a wake. True when one (or more) arrived;
    /// all pending datagrams are drained either way.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut buf = [0u8; 8];
        self.sock.set_read_timeout(Some(timeout)).ok();
        let woken = self.sock.recv(&mut buf).is_ok();
        if woken {
            self.sock
                .set_read_timeout(Some(Duration::from_micros(1)))
                .ok();
            while self.sock.recv(&mut buf).is_ok() {}
        }
        woken
    }
}

impl Drop for WakeupRx {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sock_path(tag: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("uswitch-wake-{tag}-{}", std::process::id()));
        p
    }

    #[test]
    fn wake_crosses_the_socket() {
        let path = sock_path("cross");
        let rx = WakeupRx::bind(&path).unwrap();
        let tx = WakeupTx::new(&path).unwrap();
        tx.signal();
        assert!(rx.wait(Duration::from_millis(500)));
    }

    #[test]
    fn timeout_without_signal() {
        let path = sock_path("timeout");
        let rx = WakeupRx::bind(&path).unwrap();
        assert!(!rx.wait(Duration::from_millis(10)));
    }

    #[test]
    fn signal_without_listener_is_silent() {
        let tx = WakeupTx::new(sock_path("nobody")).unwrap();
        tx.signal();
        tx.signal();
    }
}
