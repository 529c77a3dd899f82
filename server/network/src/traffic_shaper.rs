//! The traffic shaper: converts the shaping configuration into periodic
//! meter deposits. One instance feeds every worker's flow groups; the
//! node assembly ticks it on a timer and hands the update to each Sender,
//! which schedules a `run_flow_groups` pass when queued traffic became
//! drainable.

use crate::flow_group::FlowGroupsUpdate;
use logd_primitives::{NodeLocationScope, Priority};
use std::time::Duration;

/// Shaping policy for one scope: bytes per second guaranteed per
/// priority, plus a burst allowance.
#[derive(Clone, Debug)]
pub struct ScopePolicy {
    pub enabled: bool,
    pub guaranteed_bytes_per_second: [u64; Priority::NUM],
    pub max_burst_bytes: [u64; Priority::NUM],
}

impl Default for ScopePolicy {
    fn default() -> ScopePolicy {
        ScopePolicy {
            enabled: false,
            guaranteed_bytes_per_second: [0; Priority::NUM],
            max_burst_bytes: [0; Priority::NUM],
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ShapingConfig {
    /// Indexed by NodeLocationScope.
    pub scopes: Vec<ScopePolicy>,
}

impl ShapingConfig {
    pub fn disabled() -> ShapingConfig {
        ShapingConfig {
            scopes: (0..NodeLocationScope::NUM).map(|_| ScopePolicy::default()).collect(),
        }
    }

    pub fn scope(&self, scope: NodeLocationScope) -> Option<&ScopePolicy> {
        self.scopes.get(scope.index())
    }
}

pub struct TrafficShaper {
    config: ShapingConfig,
    interval: Duration,
}

impl TrafficShaper {
    pub fn new(config: ShapingConfig, interval: Duration) -> TrafficShaper {
        TrafficShaper { config, interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn update_config(&mut self, config: ShapingConfig) {
        self.config = config;
    }

    pub fn is_enabled(&self) -> bool {
        self.config.scopes.iter().any(|s| s.enabled)
    }

    /// Budget for one interval. Scopes without a policy get no entry and
    /// their groups stay unlimited.
    pub fn make_update(&self) -> FlowGroupsUpdate {
        let mut entries = Vec::with_capacity(self.config.scopes.len());
        let interval_us = self.interval.as_micros() as i64;
        for policy in &self.config.scopes {
            let mut entry = [(0i64, 0i64); Priority::NUM];
            for pri in 0..Priority::NUM {
                let per_second = policy.guaranteed_bytes_per_second[pri] as i64;
                let deposit = per_second * interval_us / 1_000_000;
                let burst = policy.max_burst_bytes[pri] as i64;
                entry[pri] = (deposit, burst.max(deposit));
            }
            entries.push(entry);
        }
        FlowGroupsUpdate { entries }
    }

    pub fn scope_enabled(&self, scope: NodeLocationScope) -> bool {
        self.config.scope(scope).map(|p| p.enabled).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deposits_scale_with_interval() {
        let mut config = ShapingConfig::disabled();
        config.scopes[NodeLocationScope::Root.index()] = ScopePolicy {
            enabled: true,
            guaranteed_bytes_per_second: [1_000_000; Priority::NUM],
            max_burst_bytes: [2_000_000; Priority::NUM],
        };
        let shaper = TrafficShaper::new(config, Duration::from_millis(10));
        assert!(shaper.is_enabled());
        let update = shaper.make_update();
        let entry = &update.entries[NodeLocationScope::Root.index()];
        // 1 MB/s over 10ms is 10 KB.
        assert_eq!(entry[0].0, 10_000);
        assert_eq!(entry[0].1, 2_000_000);
    }
}
