// SPDX-License-Identifier: Apache-2.0
// Copyright uswitch Authors

//! Cycle-counter clock for flow timestamps and flush deadlines.
//!
//! On x86_64 the raw TSC is the clock source; elsewhere a monotonic
//! nanosecond counter stands in. The frequency is measured once at startup
//! and used to convert "last used" cycle stamps into monotonic milliseconds
//! for external reporting.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

fn process_epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

#[cfg(target_arch = "x86_64")]
#[allow(unsafe_code)]
fn read_cycles() -> u64 {
    // SAFETY: rdtsc has no preconditions.
    unsafe { core::arch::x86_64::_rdtsc() }
}

#[cfg(not(target_arch = "x86_64"))]
fn read_cycles() -> u64 {
    process_epoch().elapsed().as_nanos() as u64
}

/// Calibrated cycle clock.
#[derive(Copy, Clone, Debug)]
pub struct TscClock {
    hz: u64,
}

impl TscClock {
    /// Measure the cycle frequency over a one-second sample. Called once at
    /// startup.
    #[must_use]
    pub fn calibrate() -> TscClock {
        TscClock::calibrate_over(Duration::from_secs(1))
    }

    /// Measure over an arbitrary interval (tests use short ones).
    #[must_use]
    pub fn calibrate_over(sample: Duration) -> TscClock {
        let begin_cycles = read_cycles();
        let begin = Instant::now();
        std::thread::sleep(sample);
        let cycles = read_cycles().wrapping_sub(begin_cycles);
        let elapsed = begin.elapsed();
        let hz = (cycles as u128 * 1_000_000_000 / elapsed.as_nanos().max(1)) as u64;
        TscClock { hz: hz.max(1) }
    }

    /// Build a clock with a known frequency (tests).
    #[must_use]
    pub const fn with_hz(hz: u64) -> TscClock {
        TscClock { hz }
    }

    /// Current cycle count.
    #[must_use]
    pub fn cycles(&self) -> u64 {
        read_cycles()
    }

    /// Measured cycles per second.
    #[must_use]
    pub const fn hz(&self) -> u64 {
        self.hz
    }

    /// Cycles corresponding to `micros` microseconds.
    #[must_use]
    pub const fn cycles_per_us(&self, micros: u64) -> u64 {
        self.hz / 1_000_000 * micros
    }

    /// Translate a "last used" cycle stamp into monotonic milliseconds:
    /// `now_ms - (now_cycles - stamp) * 1000 / hz`.
    ///
    /// Cycle-counter overflow is on the order of years and is not handled;
    /// it would only yield one spurious reading.
    #[must_use]
    pub fn used_time_ms(&self, stamp: u64) -> u64 {
        let idle_ms = self.cycles().wrapping_sub(stamp) * 1000 / self.hz;
        let now_ms = process_epoch().elapsed().as_millis() as u64;
        now_ms.saturating_sub(idle_ms)
    }
}
