//! Interval module: maps (interval-scale name, watering-index value) to a
//! day count, letting a schedule's cycle length adapt to how dry or wet
//! conditions currently are instead of staying a fixed integer.

use crate::config::Config;
use std::collections::HashMap;
use tracing::warn;

pub const SCALE_LEN: usize = 11;

#[derive(Debug, Default)]
pub struct IntervalTable {
    scales: HashMap<String, [i64; SCALE_LEN]>,
}

impl IntervalTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refresh(&mut self, config: &Config) -> anyhow::Result<()> {
        self.scales.clear();
        for entry in config.intervals()? {
            if entry.scale.len() != SCALE_LEN {
                warn!(
                    interval = %entry.name,
                    len = entry.scale.len(),
                    "INVALID interval scale length"
                );
                continue;
            }
            let mut arr = [0i64; SCALE_LEN];
            arr.copy_from_slice(&entry.scale);
            self.scales.insert(entry.name, arr);
        }
        Ok(())
    }

    /// Day count for `index` under `name`. An unknown scale, or one with a
    /// bad vector length, falls back to 1 day so a misconfigured interval
    /// scale never blocks a schedule outright.
    pub fn days(&self, name: &str, index: i64) -> i64 {
        let Some(scale) = self.scales.get(name) else {
            return 1;
        };
        let slot = (index / 10).clamp(0, SCALE_LEN as i64 - 1) as usize;
        scale[slot].max(1)
    }
}
