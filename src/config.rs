use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::model::{
    DEFAULT_EDIT_WINDOW_SECS, DEFAULT_PAYMENT_WINDOW_SECS, HOUR_MS, MINUTE_MS, Ms, SECOND_MS,
};

/// Timer settings for the background sweeper.
#[derive(Debug, Clone, PartialEq)]
pub struct SweeperConfig {
    /// How often overdue payments and abandoned bookings are expired.
    pub expiry_every: Duration,
    /// How often payment reminders go out.
    pub reminder_every: Duration,
    /// Remind when a pending payment expires within this many ms.
    pub reminder_lead: Ms,
    /// How often forwarded bookings are checked for staleness.
    pub stale_every: Duration,
    /// A forwarded booking untouched this long gets the crew reminded.
    pub stale_after: Ms,
    pub report_every: Duration,
    /// How often the compactor looks at the WAL.
    pub compact_every: Duration,
    /// Compact once this many appends piled up since the last compaction.
    pub compact_threshold: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            expiry_every: Duration::from_secs(30),
            reminder_every: Duration::from_secs(60),
            reminder_lead: 2 * MINUTE_MS,
            stale_every: Duration::from_secs(5 * 60),
            stale_after: 24 * HOUR_MS,
            report_every: Duration::from_secs(24 * 60 * 60),
            compact_every: Duration::from_secs(60),
            compact_threshold: 1000,
        }
    }
}

/// Daemon settings, read from `SAFARID_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub edit_window_secs: u32,
    pub payment_window_secs: u32,
    /// Odds of approval for payments without a usable card number.
    pub payment_success_rate: f64,
    pub sweeper: SweeperConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            edit_window_secs: DEFAULT_EDIT_WINDOW_SECS,
            payment_window_secs: DEFAULT_PAYMENT_WINDOW_SECS,
            payment_success_rate: 0.8,
            sweeper: SweeperConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unset or unparsable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
            lookup(key).and_then(|s| s.trim().parse().ok())
        }
        let secs = |key: &str, default: Duration| {
            parsed::<u64>(&lookup, key)
                .filter(|s| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(default)
        };

        let defaults = Config::default();
        let sweeper = SweeperConfig {
            expiry_every: secs("SAFARID_EXPIRY_SWEEP_SECS", defaults.sweeper.expiry_every),
            reminder_every: secs("SAFARID_REMINDER_SWEEP_SECS", defaults.sweeper.reminder_every),
            stale_every: secs("SAFARID_STALE_SWEEP_SECS", defaults.sweeper.stale_every),
            stale_after: parsed::<u64>(&lookup, "SAFARID_STALE_AFTER_SECS")
                .and_then(|s| Ms::try_from(s).ok()?.checked_mul(SECOND_MS))
                .unwrap_or(defaults.sweeper.stale_after),
            compact_threshold: parsed(&lookup, "SAFARID_COMPACT_THRESHOLD")
                .unwrap_or(defaults.sweeper.compact_threshold),
            ..defaults.sweeper
        };

        Self {
            data_dir: lookup("SAFARID_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            metrics_port: parsed(&lookup, "SAFARID_METRICS_PORT"),
            edit_window_secs: parsed(&lookup, "SAFARID_EDIT_WINDOW_SECS")
                .filter(|s| *s <= crate::limits::MAX_WINDOW_SECS)
                .unwrap_or(defaults.edit_window_secs),
            payment_window_secs: parsed(&lookup, "SAFARID_PAYMENT_WINDOW_SECS")
                .filter(|s| *s <= crate::limits::MAX_WINDOW_SECS)
                .unwrap_or(defaults.payment_window_secs),
            payment_success_rate: parsed::<f64>(&lookup, "SAFARID_PAYMENT_SUCCESS_RATE")
                .filter(|r| (0.0..=1.0).contains(r))
                .unwrap_or(defaults.payment_success_rate),
            sweeper,
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("safarid.wal")
    }
}
