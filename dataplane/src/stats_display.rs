// SPDX-License-Identifier: Apache-2.0
// Copyright uswitch Authors

//! Periodic statistics display on the master core.

use std::sync::Arc;

use tracing::info;

use datapath::Switch;
use vport::types::MAX_VPORTS;

pub struct StatsDisplay {
    switch: Arc<Switch>,
}

impl StatsDisplay {
    pub fn new(switch: Arc<Switch>) -> StatsDisplay {
        StatsDisplay { switch }
    }

    /// Log one counter row per enabled port plus the switch-wide drops.
    pub fn print(&self) {
        let vports = &self.switch.vports;
        for id in 0..MAX_VPORTS as u32 {
            if !vports.is_enabled(id) {
                continue;
            }
            let Some(stats) = vports.stats(id) else {
                continue;
            };
            info!(
                vport = id,
                name = %vports.name(id).unwrap_or_default(),
                rx = stats.rx,
                tx = stats.tx,
                rx_bytes = stats.rx_bytes,
                tx_bytes = stats.tx_bytes,
                rx_drop = stats.rx_drop,
                tx_drop = stats.tx_drop,
                "port counters"
            );
        }
        let switch_stats = vports.switch_stats();
        info!(
            rx_drop = switch_stats.rx_drop(),
            tx_drop = switch_stats.tx_drop(),
            "switch counters"
        );
    }
}
