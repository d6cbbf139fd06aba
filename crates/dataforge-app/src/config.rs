//! Application configuration.
//!
//! Settings come from CLI flags first, then environment variables
//! (`DATAFORGE_DATA_DIR`, `DATAFORGE_TIMEZONE`, `DATAFORGE_LOG_LEVEL`,
//! `DATAFORGE_MAX_CONCURRENT`), then defaults. Validation failures map to
//! exit code 2.

use std::env;
use std::path::PathBuf;

use chrono_tz::Tz;
use dataforge_engine::AppSettings;

/// Configuration errors surfaced during startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid timezone {value:?}: not an IANA timezone name")]
    InvalidTimezone { value: String },

    #[error("Invalid value for {var}: {value:?}")]
    InvalidEnvVar { var: String, value: String },

    #[error("Data directory {path:?} is not usable: {message}")]
    BadDataDir { path: PathBuf, message: String },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub data_root: PathBuf,
    pub timezone: Tz,
    pub log_level: String,
    pub log_json: bool,
    pub max_concurrent: usize,
}

impl AppConfig {
    /// Resolve the effective configuration from CLI overrides plus the
    /// environment.
    pub fn resolve(
        data_dir: Option<PathBuf>,
        timezone: Option<String>,
        log_level: Option<String>,
        log_json: bool,
    ) -> Result<Self, ConfigError> {
        let data_root = data_dir
            .or_else(|| env::var("DATAFORGE_DATA_DIR").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("./dataforge-data"));

        let timezone_name = timezone
            .or_else(|| env::var("DATAFORGE_TIMEZONE").ok())
            .unwrap_or_else(|| "UTC".to_string());
        let timezone: Tz = timezone_name
            .parse()
            .map_err(|_| ConfigError::InvalidTimezone {
                value: timezone_name,
            })?;

        let log_level = log_level
            .or_else(|| env::var("DATAFORGE_LOG_LEVEL").ok())
            .unwrap_or_else(|| "info".to_string());

        let max_concurrent = match env::var("DATAFORGE_MAX_CONCURRENT") {
            Ok(value) => value.parse().map_err(|_| ConfigError::InvalidEnvVar {
                var: "DATAFORGE_MAX_CONCURRENT".to_string(),
                value,
            })?,
            Err(_) => 4,
        };
        if max_concurrent == 0 {
            return Err(ConfigError::InvalidEnvVar {
                var: "DATAFORGE_MAX_CONCURRENT".to_string(),
                value: "0".to_string(),
            });
        }

        Ok(AppConfig {
            data_root,
            timezone,
            log_level,
            log_json,
            max_concurrent,
        })
    }

    /// Check the data directory is creatable and writable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.data_root).map_err(|e| ConfigError::BadDataDir {
            path: self.data_root.clone(),
            message: e.to_string(),
        })?;
        let probe = self.data_root.join(".write-probe");
        std::fs::write(&probe, b"ok").map_err(|e| ConfigError::BadDataDir {
            path: self.data_root.clone(),
            message: e.to_string(),
        })?;
        let _ = std::fs::remove_file(probe);
        Ok(())
    }

    pub fn engine_settings(&self) -> AppSettings {
        let mut settings = AppSettings::new(&self.data_root);
        settings.timezone = self.timezone;
        settings.max_concurrent = self.max_concurrent;
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply() {
        let config = AppConfig::resolve(
            Some(PathBuf::from("/tmp/df-test")),
            None,
            None,
            false,
        )
        .unwrap();
        assert_eq!(config.timezone, chrono_tz::UTC);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.max_concurrent, 4);
    }

    #[test]
    fn cli_timezone_overrides() {
        let config = AppConfig::resolve(
            Some(PathBuf::from("/tmp/df-test")),
            Some("Europe/Berlin".to_string()),
            None,
            false,
        )
        .unwrap();
        assert_eq!(config.timezone, chrono_tz::Europe::Berlin);
    }

    #[test]
    fn bad_timezone_is_rejected() {
        let err = AppConfig::resolve(
            Some(PathBuf::from("/tmp/df-test")),
            Some("Mars/Olympus".to_string()),
            None,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidTimezone { .. }));
    }
}
