use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::model::Ms;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_HOLD_TTL_MS: Ms = 7 * 24 * 3_600_000;
pub const DEFAULT_MAX_RECORDS: usize = 200;
pub const DEFAULT_STORAGE_KEY: &str = "holdsync.confirmedHolds";
pub const DEFAULT_QUOTA_BYTES: usize = 5 * 1024 * 1024;

/// Session-wide settings. Every field has a default; `from_env` overrides
/// from `HOLDSYNC_*` variables and ignores values that fail to parse or are
/// not positive.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub poll_interval: Duration,
    pub hold_ttl_ms: Ms,
    pub max_records: usize,
    pub storage_key: String,
    pub data_dir: PathBuf,
    pub profile: String,
    pub quota_bytes: usize,
    pub compact_threshold: u64,
    pub catalog_url: String,
    pub fetch_timeout: Duration,
    pub metrics_port: Option<u16>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            hold_ttl_ms: DEFAULT_HOLD_TTL_MS,
            max_records: DEFAULT_MAX_RECORDS,
            storage_key: DEFAULT_STORAGE_KEY.into(),
            data_dir: PathBuf::from("./data"),
            profile: "default".into(),
            quota_bytes: DEFAULT_QUOTA_BYTES,
            compact_threshold: 1000,
            catalog_url: "http://localhost:8080".into(),
            fetch_timeout: Duration::from_secs(30),
            metrics_port: None,
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            poll_interval: env_parse("HOLDSYNC_POLL_INTERVAL_SECS")
                .filter(|s: &u64| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(d.poll_interval),
            hold_ttl_ms: env_parse::<i64>("HOLDSYNC_HOLD_TTL_SECS")
                .filter(|s| *s > 0)
                .and_then(|s| s.checked_mul(1000))
                .unwrap_or(d.hold_ttl_ms),
            max_records: env_parse("HOLDSYNC_MAX_RECORDS")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(d.max_records),
            storage_key: std::env::var("HOLDSYNC_STORAGE_KEY").unwrap_or(d.storage_key),
            data_dir: std::env::var("HOLDSYNC_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.data_dir),
            profile: std::env::var("HOLDSYNC_PROFILE").unwrap_or(d.profile),
            quota_bytes: env_parse("HOLDSYNC_QUOTA_BYTES")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(d.quota_bytes),
            compact_threshold: env_parse("HOLDSYNC_COMPACT_THRESHOLD")
                .filter(|n: &u64| *n > 0)
                .unwrap_or(d.compact_threshold),
            catalog_url: std::env::var("HOLDSYNC_CATALOG_URL").unwrap_or(d.catalog_url),
            fetch_timeout: env_parse("HOLDSYNC_FETCH_TIMEOUT_SECS")
                .filter(|s: &u64| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(d.fetch_timeout),
            metrics_port: env_parse("HOLDSYNC_METRICS_PORT"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = SyncConfig::default();
        assert_eq!(c.poll_interval, Duration::from_secs(15));
        assert_eq!(c.hold_ttl_ms, 604_800_000);
        assert_eq!(c.max_records, 200);
        assert!(c.metrics_port.is_none());
    }

    // Single test touching the environment, so parallel tests can't race on it.
    #[test]
    fn env_overrides_and_bad_values() {
        // SAFETY: no other test in this crate reads or writes HOLDSYNC_* variables.
        unsafe {
            std::env::set_var("HOLDSYNC_POLL_INTERVAL_SECS", "5");
            std::env::set_var("HOLDSYNC_MAX_RECORDS", "not-a-number");
            std::env::set_var("HOLDSYNC_PROFILE", "guest");
            std::env::set_var("HOLDSYNC_HOLD_TTL_SECS", "3600");
            std::env::set_var("HOLDSYNC_FETCH_TIMEOUT_SECS", "0");
            std::env::set_var("HOLDSYNC_COMPACT_THRESHOLD", "0");
        }
        let c = SyncConfig::from_env();
        assert_eq!(c.poll_interval, Duration::from_secs(5));
        assert_eq!(c.max_records, DEFAULT_MAX_RECORDS);
        assert_eq!(c.profile, "guest");
        assert_eq!(c.hold_ttl_ms, 3_600_000);
        assert_eq!(c.fetch_timeout, Duration::from_secs(30));
        assert_eq!(c.compact_threshold, 1000);

        // overflowing, negative and zero values keep the defaults
        for (ttl, max) in [("9223372036854775807", "0"), ("-60", "-1")] {
            unsafe {
                std::env::set_var("HOLDSYNC_HOLD_TTL_SECS", ttl);
                std::env::set_var("HOLDSYNC_MAX_RECORDS", max);
            }
            let c = SyncConfig::from_env();
            assert_eq!(c.hold_ttl_ms, DEFAULT_HOLD_TTL_MS, "ttl {ttl}");
            assert_eq!(c.max_records, DEFAULT_MAX_RECORDS, "max {max}");
        }

        unsafe {
            for name in [
                "HOLDSYNC_POLL_INTERVAL_SECS",
                "HOLDSYNC_MAX_RECORDS",
                "HOLDSYNC_PROFILE",
                "HOLDSYNC_HOLD_TTL_SECS",
                "HOLDSYNC_FETCH_TIMEOUT_SECS",
                "HOLDSYNC_COMPACT_THRESHOLD",
            ] {
                std::env::remove_var(name);
            }
        }
    }
}
