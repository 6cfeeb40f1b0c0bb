//! Pipeline configuration with environment overrides.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{GridError, GridResult};
use crate::guards::{
    clamp_attempts, clamp_cached_rows, clamp_debounce_ms, clamp_margin, clamp_window_rows,
};

pub const DEFAULT_PREFETCH_MARGIN: u64 = 50;
pub const DEFAULT_MAX_CACHED_ROWS: usize = 20_000;
pub const DEFAULT_DEBOUNCE_MS: u64 = 60;
pub const DEFAULT_MAX_FETCH_ATTEMPTS: u32 = 2;

pub const ENV_PREFETCH_MARGIN: &str = "GRIDFETCH_PREFETCH_MARGIN";
pub const ENV_MAX_CACHED_ROWS: &str = "GRIDFETCH_MAX_CACHED_ROWS";
pub const ENV_DEBOUNCE_MS: &str = "GRIDFETCH_DEBOUNCE_MS";
pub const ENV_MAX_WINDOW_ROWS: &str = "GRIDFETCH_MAX_WINDOW_ROWS";
pub const ENV_MAX_FETCH_ATTEMPTS: &str = "GRIDFETCH_MAX_FETCH_ATTEMPTS";

/// Tunables for one grid pipeline.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridConfig {
    /// Extra rows fetched on each side of the visible range.
    pub prefetch_margin: u64,
    /// Row ceiling for the cache before LRU eviction kicks in.
    pub max_cached_rows: usize,
    /// Quiet period a viewport must hold before it is translated.
    #[serde(with = "duration_ms")]
    pub debounce: Duration,
    /// Largest single backend request. `None` sends every uncached gap as
    /// one request; with a cap, bigger gaps are split.
    #[serde(default)]
    pub max_window_rows: Option<u64>,
    /// How many times one window may be requested before it is left alone.
    pub max_fetch_attempts: u32,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            prefetch_margin: DEFAULT_PREFETCH_MARGIN,
            max_cached_rows: DEFAULT_MAX_CACHED_ROWS,
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            max_window_rows: None,
            max_fetch_attempts: DEFAULT_MAX_FETCH_ATTEMPTS,
        }
    }
}

impl GridConfig {
    /// Build a config from `GRIDFETCH_*` environment variables.
    pub fn from_env() -> GridResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup, falling back to defaults
    /// for absent keys. Present but unparsable values are an error.
    pub fn from_lookup<F>(lookup: F) -> GridResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(v) = parse_var::<u64, _>(&lookup, ENV_PREFETCH_MARGIN)? {
            config.prefetch_margin = v;
        }
        if let Some(v) = parse_var::<usize, _>(&lookup, ENV_MAX_CACHED_ROWS)? {
            config.max_cached_rows = v;
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, ENV_DEBOUNCE_MS)? {
            config.debounce = Duration::from_millis(v);
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, ENV_MAX_WINDOW_ROWS)? {
            // 0 turns the cap off.
            config.max_window_rows = (v > 0).then_some(v);
        }
        if let Some(v) = parse_var::<u32, _>(&lookup, ENV_MAX_FETCH_ATTEMPTS)? {
            config.max_fetch_attempts = v;
        }
        Ok(config.clamped())
    }

    /// Return a copy with every field pulled inside the guard bounds.
    pub fn clamped(mut self) -> Self {
        self.prefetch_margin = clamp_margin(self.prefetch_margin);
        self.max_cached_rows = clamp_cached_rows(self.max_cached_rows);
        self.debounce =
            Duration::from_millis(clamp_debounce_ms(self.debounce.as_millis() as u64));
        self.max_window_rows = self.max_window_rows.map(clamp_window_rows);
        self.max_fetch_attempts = clamp_attempts(self.max_fetch_attempts);
        self
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> GridResult<Option<T>>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            trimmed
                .parse::<T>()
                .map(Some)
                .map_err(|_| GridError::Config(format!("{key}={trimmed:?} is not a valid number")))
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = GridConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, GridConfig::default());
        assert_eq!(config.prefetch_margin, 50);
        assert_eq!(config.debounce, Duration::from_millis(60));
    }

    #[test]
    fn test_overrides_are_parsed_and_clamped() {
        let config = GridConfig::from_lookup(lookup_from(&[
            (ENV_PREFETCH_MARGIN, " 200 "),
            (ENV_MAX_CACHED_ROWS, "0"),
            (ENV_DEBOUNCE_MS, "99999"),
            (ENV_MAX_FETCH_ATTEMPTS, "3"),
        ]))
        .unwrap();
        assert_eq!(config.prefetch_margin, 200);
        assert_eq!(config.max_cached_rows, 1);
        assert_eq!(config.debounce, Duration::from_millis(5_000));
        assert_eq!(config.max_fetch_attempts, 3);
        assert_eq!(config.max_window_rows, None);
    }

    #[test]
    fn test_garbage_value_is_config_error() {
        let err = GridConfig::from_lookup(lookup_from(&[(ENV_MAX_WINDOW_ROWS, "lots")]))
            .unwrap_err();
        assert!(matches!(err, GridError::Config(_)));
        assert!(err.to_string().contains(ENV_MAX_WINDOW_ROWS));
    }

    #[test]
    fn test_window_cap_is_opt_in() {
        let capped = GridConfig::from_lookup(lookup_from(&[(ENV_MAX_WINDOW_ROWS, "250000")]))
            .unwrap();
        assert_eq!(capped.max_window_rows, Some(100_000));
        let off = GridConfig::from_lookup(lookup_from(&[(ENV_MAX_WINDOW_ROWS, "0")])).unwrap();
        assert_eq!(off.max_window_rows, None);
    }

    #[test]
    fn test_serde_uses_milliseconds() {
        let json = serde_json::to_value(GridConfig::default()).unwrap();
        assert_eq!(json["debounce"], 60);
    }
}
