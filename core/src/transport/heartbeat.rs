// Adaptive heartbeat interval

use crate::config::MeshConfig;
use std::time::Duration;

/// Picks the heartbeat period from neighborhood activity and battery.
///
/// Low battery wins over everything. Otherwise the heartbeat goes slow when
/// no peers have been around for the idle cooldown, fast when peers are
/// present and were heard recently, and default in between.
#[derive(Debug, Clone)]
pub struct HeartbeatPolicy {
    default: Duration,
    active: Duration,
    idle: Duration,
    low_battery: Duration,
    active_window: Duration,
    idle_cooldown: Duration,
    low_battery_percent: u8,
}

impl HeartbeatPolicy {
    pub fn from_config(config: &MeshConfig) -> Self {
        Self {
            default: Duration::from_millis(config.heartbeat_default_ms),
            active: Duration::from_millis(config.heartbeat_active_ms),
            idle: Duration::from_millis(config.heartbeat_idle_ms),
            low_battery: Duration::from_millis(config.heartbeat_low_battery_ms),
            active_window: Duration::from_millis(config.peer_active_window_ms),
            idle_cooldown: Duration::from_millis(config.peer_idle_cooldown_ms),
            low_battery_percent: config.low_battery_percent,
        }
    }

    pub fn interval(
        &self,
        peer_count: usize,
        since_activity: Duration,
        battery_percent: Option<u8>,
    ) -> Duration {
        if let Some(level) = battery_percent {
            if level <= self.low_battery_percent {
                return self.low_battery;
            }
        }
        if peer_count == 0 && since_activity > self.idle_cooldown {
            return self.idle;
        }
        if peer_count > 0 && since_activity < self.active_window {
            return self.active;
        }
        self.default
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> HeartbeatPolicy {
        HeartbeatPolicy::from_config(&MeshConfig::default())
    }

    #[test]
    fn test_active_neighborhood_is_fast() {
        assert_eq!(
            policy().interval(3, Duration::from_secs(5), Some(80)),
            Duration::from_secs(15)
        );
    }

    #[test]
    fn test_empty_neighborhood_goes_idle() {
        assert_eq!(
            policy().interval(0, Duration::from_secs(61), None),
            Duration::from_secs(60)
        );
        // not idle yet
        assert_eq!(
            policy().interval(0, Duration::from_secs(10), None),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_low_battery_overrides() {
        assert_eq!(
            policy().interval(5, Duration::ZERO, Some(15)),
            Duration::from_secs(120)
        );
    }

    #[test]
    fn test_quiet_peers_use_default() {
        assert_eq!(
            policy().interval(2, Duration::from_secs(45), Some(90)),
            Duration::from_secs(30)
        );
    }
}
