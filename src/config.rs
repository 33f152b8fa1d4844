use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// How lifecycle changes reach the schedule synchronizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Run in the caller's task before the operation returns.
    Inline,
    /// Hand the date to the background queue and return at once.
    Queued,
}

impl FromStr for SyncMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "inline" => Ok(Self::Inline),
            "queued" => Ok(Self::Queued),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    /// Early-opening window on slot start, display hours, `[start, end)`.
    pub early_open_start: u8,
    pub early_open_end: u8,
    pub overnight_sync: bool,
    pub advance_cutoff_hours: i64,
    pub admission_timeout: Duration,
    pub sync_mode: SyncMode,
    pub sync_retry_backoff: Duration,
    pub compact_threshold: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            early_open_start: 7,
            early_open_end: 12,
            overnight_sync: true,
            advance_cutoff_hours: 24,
            admission_timeout: Duration::from_millis(3000),
            sync_mode: SyncMode::Queued,
            sync_retry_backoff: Duration::from_millis(500),
            compact_threshold: 1000,
        }
    }
}

impl Config {
    /// Read `SLOTLOCK_*` variables. Absent ones fall back to the default;
    /// present but unparsable ones are an error.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let d = Self::default();
        let cfg = Self {
            data_dir: lookup("SLOTLOCK_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            early_open_start: parse(&lookup, "SLOTLOCK_EARLY_OPEN_START")?.unwrap_or(d.early_open_start),
            early_open_end: parse(&lookup, "SLOTLOCK_EARLY_OPEN_END")?.unwrap_or(d.early_open_end),
            overnight_sync: parse(&lookup, "SLOTLOCK_OVERNIGHT_SYNC")?.unwrap_or(d.overnight_sync),
            advance_cutoff_hours: parse(&lookup, "SLOTLOCK_ADVANCE_CUTOFF_HOURS")?
                .unwrap_or(d.advance_cutoff_hours),
            admission_timeout: parse(&lookup, "SLOTLOCK_ADMISSION_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(d.admission_timeout),
            sync_mode: parse(&lookup, "SLOTLOCK_SYNC_MODE")?.unwrap_or(d.sync_mode),
            sync_retry_backoff: parse(&lookup, "SLOTLOCK_SYNC_RETRY_BACKOFF_MS")?
                .map(Duration::from_millis)
                .unwrap_or(d.sync_retry_backoff),
            compact_threshold: parse(&lookup, "SLOTLOCK_COMPACT_THRESHOLD")?.unwrap_or(d.compact_threshold),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(6..=29).contains(&self.early_open_start) {
            return Err(invalid("SLOTLOCK_EARLY_OPEN_START", self.early_open_start));
        }
        if self.early_open_end <= self.early_open_start || self.early_open_end > 30 {
            return Err(invalid("SLOTLOCK_EARLY_OPEN_END", self.early_open_end));
        }
        if self.advance_cutoff_hours < 0 {
            return Err(invalid("SLOTLOCK_ADVANCE_CUTOFF_HOURS", self.advance_cutoff_hours));
        }
        Ok(())
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("slotlock.wal")
    }

    pub fn advance_cutoff(&self) -> chrono::Duration {
        chrono::Duration::hours(self.advance_cutoff_hours)
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}

fn invalid(key: &'static str, value: impl ToString) -> ConfigError {
    ConfigError::Invalid { key, value: value.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        assert_eq!(Config::from_lookup(lookup(&[])).unwrap(), Config::default());
    }

    #[test]
    fn overrides_parse() {
        let cfg = Config::from_lookup(lookup(&[
            ("SLOTLOCK_DATA_DIR", "/var/lib/slotlock"),
            ("SLOTLOCK_EARLY_OPEN_START", "6"),
            ("SLOTLOCK_SYNC_MODE", "Inline"),
            ("SLOTLOCK_OVERNIGHT_SYNC", "false"),
            ("SLOTLOCK_ADMISSION_TIMEOUT_MS", "250"),
        ]))
        .unwrap();
        assert_eq!(cfg.wal_path(), PathBuf::from("/var/lib/slotlock/slotlock.wal"));
        assert_eq!(cfg.early_open_start, 6);
        assert_eq!(cfg.sync_mode, SyncMode::Inline);
        assert!(!cfg.overnight_sync);
        assert_eq!(cfg.admission_timeout, Duration::from_millis(250));
    }

    #[test]
    fn garbage_is_rejected_not_defaulted() {
        let err = Config::from_lookup(lookup(&[("SLOTLOCK_ADVANCE_CUTOFF_HOURS", "soon")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid { key: "SLOTLOCK_ADVANCE_CUTOFF_HOURS", value: "soon".into() }
        );
        assert!(Config::from_lookup(lookup(&[("SLOTLOCK_SYNC_MODE", "eventually")])).is_err());
    }

    #[test]
    fn window_must_be_ordered() {
        let err = Config::from_lookup(lookup(&[
            ("SLOTLOCK_EARLY_OPEN_START", "12"),
            ("SLOTLOCK_EARLY_OPEN_END", "7"),
        ]))
        .unwrap_err();
        assert_eq!(err, ConfigError::Invalid { key: "SLOTLOCK_EARLY_OPEN_END", value: "7".into() });
    }
}
