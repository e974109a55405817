use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::FixedOffset;
use thiserror::Error;

use crate::engine::EngineSettings;
use crate::limits::MAX_HOLD_TTL_MS;
use crate::model::Ms;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Invalid { var: &'static str, value: String },
    #[error("{0}")]
    OutOfRange(&'static str),
    #[error("both COURTSIDE_TLS_CERT and COURTSIDE_TLS_KEY must be set, or neither")]
    PartialTls,
}

/// Server settings, read from `COURTSIDE_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends between compactions.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub hold_ttl_minutes: i64,
    /// Venue offset from UTC, e.g. 420 for UTC+07:00.
    pub utc_offset_minutes: i32,
    pub lapse_sweep_secs: u64,
    pub completion_sweep_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "courtside".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
            hold_ttl_minutes: 10,
            utc_offset_minutes: 0,
            lapse_sweep_secs: 900,
            completion_sweep_secs: 1800,
        }
    }
}

fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(var) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source. Unset variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let d = Config::default();
        let metrics_port = match lookup("COURTSIDE_METRICS_PORT") {
            None => None,
            Some(value) => Some(value.trim().parse().map_err(|_| ConfigError::Invalid {
                var: "COURTSIDE_METRICS_PORT",
                value,
            })?),
        };
        let config = Config {
            port: parsed(&lookup, "COURTSIDE_PORT", d.port)?,
            bind: lookup("COURTSIDE_BIND").unwrap_or(d.bind),
            data_dir: lookup("COURTSIDE_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            password: lookup("COURTSIDE_PASSWORD").unwrap_or(d.password),
            max_connections: parsed(&lookup, "COURTSIDE_MAX_CONNECTIONS", d.max_connections)?,
            compact_threshold: parsed(&lookup, "COURTSIDE_COMPACT_THRESHOLD", d.compact_threshold)?,
            metrics_port,
            tls_cert: lookup("COURTSIDE_TLS_CERT"),
            tls_key: lookup("COURTSIDE_TLS_KEY"),
            hold_ttl_minutes: parsed(&lookup, "COURTSIDE_HOLD_TTL_MINUTES", d.hold_ttl_minutes)?,
            utc_offset_minutes: parsed(&lookup, "COURTSIDE_UTC_OFFSET_MINUTES", d.utc_offset_minutes)?,
            lapse_sweep_secs: parsed(&lookup, "COURTSIDE_LAPSE_SWEEP_SECS", d.lapse_sweep_secs)?,
            completion_sweep_secs: parsed(
                &lookup,
                "COURTSIDE_COMPLETION_SWEEP_SECS",
                d.completion_sweep_secs,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.tls_cert.is_some() != self.tls_key.is_some() {
            return Err(ConfigError::PartialTls);
        }
        if self.max_connections == 0 {
            return Err(ConfigError::OutOfRange("COURTSIDE_MAX_CONNECTIONS must be positive"));
        }
        let ttl = self.hold_ttl_ms();
        if ttl <= 0 || ttl > MAX_HOLD_TTL_MS {
            return Err(ConfigError::OutOfRange(
                "COURTSIDE_HOLD_TTL_MINUTES must be between 1 and 1440",
            ));
        }
        if self.utc_offset().is_none() {
            return Err(ConfigError::OutOfRange(
                "COURTSIDE_UTC_OFFSET_MINUTES must be within +/-1439",
            ));
        }
        if self.lapse_sweep_secs == 0 || self.completion_sweep_secs == 0 {
            return Err(ConfigError::OutOfRange("sweep intervals must be positive"));
        }
        Ok(())
    }

    pub fn hold_ttl_ms(&self) -> Ms {
        self.hold_ttl_minutes.saturating_mul(60_000)
    }

    fn utc_offset(&self) -> Option<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_minutes.checked_mul(60)?)
    }

    pub fn engine_settings(&self) -> EngineSettings {
        let defaults = EngineSettings::default();
        EngineSettings {
            hold_ttl_ms: self.hold_ttl_ms(),
            utc_offset: self.utc_offset().unwrap_or(defaults.utc_offset),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("courtside.wal")
    }

    pub fn lapse_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.lapse_sweep_secs)
    }

    pub fn completion_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.completion_sweep_secs)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let config = from(&[]).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.wal_path(), PathBuf::from("./data/courtside.wal"));
        assert_eq!(config.engine_settings().hold_ttl_ms, 600_000);
        assert_eq!(config.listen_addr(), "0.0.0.0:5433");
    }

    #[test]
    fn overrides() {
        let config = from(&[
            ("COURTSIDE_PORT", "6000"),
            ("COURTSIDE_DATA_DIR", "/var/lib/courtside"),
            ("COURTSIDE_HOLD_TTL_MINUTES", "15"),
            ("COURTSIDE_UTC_OFFSET_MINUTES", "420"),
            ("COURTSIDE_METRICS_PORT", "9090"),
            ("COURTSIDE_LAPSE_SWEEP_SECS", "60"),
        ])
        .unwrap();
        assert_eq!(config.port, 6000);
        assert_eq!(config.metrics_port, Some(9090));
        assert_eq!(config.lapse_sweep_interval(), Duration::from_secs(60));
        let settings = config.engine_settings();
        assert_eq!(settings.hold_ttl_ms, 15 * 60_000);
        assert_eq!(settings.utc_offset.local_minus_utc(), 7 * 3600);
    }

    #[test]
    fn bad_number_names_the_variable() {
        let err = from(&[("COURTSIDE_PORT", "lots")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "COURTSIDE_PORT", .. }));
        assert!(err.to_string().contains("lots"));
    }

    #[test]
    fn tls_needs_both_halves() {
        assert!(matches!(
            from(&[("COURTSIDE_TLS_CERT", "cert.pem")]),
            Err(ConfigError::PartialTls)
        ));
        assert!(from(&[("COURTSIDE_TLS_CERT", "c.pem"), ("COURTSIDE_TLS_KEY", "k.pem")]).is_ok());
    }

    #[test]
    fn range_checks() {
        assert!(from(&[("COURTSIDE_HOLD_TTL_MINUTES", "0")]).is_err());
        assert!(from(&[("COURTSIDE_HOLD_TTL_MINUTES", "1441")]).is_err());
        assert!(from(&[("COURTSIDE_UTC_OFFSET_MINUTES", "1440")]).is_err());
        assert!(from(&[("COURTSIDE_UTC_OFFSET_MINUTES", "-600")]).is_ok());
        assert!(from(&[("COURTSIDE_MAX_CONNECTIONS", "0")]).is_err());
    }
}
