//! Per-fabric settings and runtime configuration.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Persisted per-fabric settings. The subscriber refreshes
/// `overlay_vnid`, `vpc_pair_type`, and `tz` from the controller during
/// validation and writes them back through the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub fabric: String,
    /// Vnid of the infra overlay context, required by the EPM event parser.
    pub overlay_vnid: u32,
    /// `pairT` of the fabric protection policy. A change forces a hard
    /// restart since it invalidates vpc node pairing.
    pub vpc_pair_type: String,
    pub tz: String,
    /// Buffer slow-MO events in the paused subscription layer during
    /// bootstrap. When false, events arriving during bootstrap are
    /// intentionally dropped.
    pub queue_init_events: bool,
    /// Same choice for the high-volume EPM classes.
    pub queue_init_epm_events: bool,
}

impl Settings {
    pub fn new(fabric: impl Into<String>) -> Self {
        Self {
            fabric: fabric.into(),
            overlay_vnid: 0,
            vpc_pair_type: String::new(),
            tz: String::new(),
            queue_init_events: true,
            queue_init_epm_events: true,
        }
    }
}

/// Static configuration handed to the subscriber by the supervisor.
#[derive(Debug, Clone)]
pub struct FabricConfig {
    /// Fabric name; keys every persisted row and wire envelope.
    pub fabric: String,
    /// Interval between subscription liveness checks in the steady loop.
    pub subscription_check_interval: Duration,
    /// Upper bound on messages folded into one bulk envelope.
    pub max_send_msg_length: usize,
    /// Heartbeat publish interval.
    pub hello_interval: Duration,
    /// Queue-depth sample and counter flush interval.
    pub stats_interval: Duration,
    /// Background batcher drain cadence.
    pub bg_event_handler_interval: Duration,
    /// Bound on the EPM EOF barrier before the fabric is forced to
    /// `running` with a warning.
    pub max_epm_build_time: Duration,
}

impl FabricConfig {
    pub fn new(fabric: impl Into<String>) -> Self {
        Self {
            fabric: fabric.into(),
            subscription_check_interval: Duration::from_secs(5),
            max_send_msg_length: MAX_SEND_MSG_LENGTH,
            hello_interval: HELLO_INTERVAL,
            stats_interval: STATS_INTERVAL,
            bg_event_handler_interval: BG_EVENT_HANDLER_INTERVAL,
            max_epm_build_time: MAX_EPM_BUILD_TIME,
        }
    }
}

/// Default cap on inner messages per bulk envelope.
pub const MAX_SEND_MSG_LENGTH: usize = 100;
/// Heartbeat publish interval.
pub const HELLO_INTERVAL: Duration = Duration::from_secs(5);
/// Queue stats flush interval.
pub const STATS_INTERVAL: Duration = Duration::from_secs(60);
/// Background event batcher cadence.
pub const BG_EVENT_HANDLER_INTERVAL: Duration = Duration::from_secs(1);
/// Maximum time to hold the watcher pause waiting for EPM EOF acks.
pub const MAX_EPM_BUILD_TIME: Duration = Duration::from_secs(900);
/// Refresh interval forced onto sessions against pre-4.x nodes.
pub const DEFAULT_SUBSCRIPTION_REFRESH: Duration = Duration::from_secs(60);

/// Convert a controller timezone string (`p480_Asia-Shanghai`,
/// `n300_America-New_York`) to an olson-style name. Unparseable input
/// falls back to UTC.
pub fn parse_tz(tz: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"^[pn]\d+_(?P<value>.+)$").expect("tz regex")
    });
    match re.captures(tz) {
        Some(caps) => {
            let name = &caps["value"];
            match name.split_once('-') {
                Some((region, rest)) => format!("{region}/{rest}"),
                None => name.to_string(),
            }
        }
        None => "UTC".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tz() {
        assert_eq!(parse_tz("p480_Asia-Shanghai"), "Asia/Shanghai");
        assert_eq!(parse_tz("n300_America-New_York"), "America/New_York");
        assert_eq!(parse_tz("bogus"), "UTC");
    }
}
