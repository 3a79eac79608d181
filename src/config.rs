use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::limits::DEFAULT_PAST_GRACE_MS;
use crate::model::Ms;

/// Booking rules that vary between deployments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingPolicy {
    /// Reject bookings that do not name a child.
    pub require_child: bool,
    /// Slots may start this far in the past and still be created.
    pub past_grace_ms: Ms,
}

impl Default for BookingPolicy {
    fn default() -> Self {
        Self {
            require_child: false,
            past_grace_ms: DEFAULT_PAST_GRACE_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub data_dir: PathBuf,
    /// Compact the log once this many events were appended since the last compaction.
    pub compact_threshold: u64,
    pub compact_interval: Duration,
    pub metrics_port: Option<u16>,
    pub policy: BookingPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            compact_threshold: 1000,
            compact_interval: Duration::from_secs(60),
            metrics_port: None,
            policy: BookingPolicy::default(),
        }
    }
}

impl SchedulerConfig {
    /// Read `CAREBOOK_*` variables, falling back to defaults for anything
    /// unset or unparsable.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| -> Option<String> { lookup(key).filter(|v| !v.trim().is_empty()) };
        fn num<T: FromStr>(raw: Option<String>) -> Option<T> {
            raw.and_then(|s| s.trim().parse().ok())
        }

        let data_dir = parsed("CAREBOOK_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);
        let compact_threshold =
            num(parsed("CAREBOOK_COMPACT_THRESHOLD")).unwrap_or(defaults.compact_threshold);
        let compact_interval = num::<u64>(parsed("CAREBOOK_COMPACT_INTERVAL_SECS"))
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.compact_interval);
        let metrics_port = num(parsed("CAREBOOK_METRICS_PORT"));
        let require_child = parsed("CAREBOOK_REQUIRE_CHILD")
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(defaults.policy.require_child);
        let past_grace_ms = num::<Ms>(parsed("CAREBOOK_PAST_GRACE_MS"))
            .filter(|ms| *ms >= 0)
            .unwrap_or(defaults.policy.past_grace_ms);

        Self {
            data_dir,
            compact_threshold,
            compact_interval,
            metrics_port,
            policy: BookingPolicy {
                require_child,
                past_grace_ms,
            },
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("carebook.wal")
    }
}
