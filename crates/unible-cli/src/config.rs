//! unible CLI configuration
//!
//! Settings come from a TOML file (`--config`, or `unible/config.toml` under
//! the platform config directory when present) layered over defaults.
//! Command line flags override the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use unible_central::CentralConfig;
use unible_core::{GovernorConfig, DEFAULT_CACHE_NAMESPACE};

use crate::error::{CliError, Result};

// ----------------------------------------------------------------------------
// Configuration Types
// ----------------------------------------------------------------------------

/// Platform stack driving the central
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Simulated peripherals, no radio needed
    Demo,
    /// The host Bluetooth adapter
    Native,
}

/// Complete configuration for the CLI application
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub cli: CliConfig,
    pub central: CentralSettings,
}

/// CLI-specific configuration options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub backend: Backend,

    /// Tracing filter used when `RUST_LOG` is unset
    pub log_level: String,

    /// How long `scan` and `watch` run when no duration is given; 0 runs until Ctrl+C
    pub default_duration_secs: u64,
}

/// Central settings in file-friendly units
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CentralSettings {
    pub scan_max_starts: usize,
    pub scan_window_secs: u64,
    pub scan_retry_margin_secs: u64,
    pub system_device_timeout_ms: u64,
    pub cache_namespace: String,
    /// Service cache directory; defaults to `unible` under the platform cache dir
    pub cache_dir: Option<PathBuf>,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Demo,
            log_level: "info".to_string(),
            default_duration_secs: 10,
        }
    }
}

impl Default for CentralSettings {
    fn default() -> Self {
        let governor = GovernorConfig::default();
        Self {
            scan_max_starts: governor.max_starts,
            scan_window_secs: governor.window.as_secs(),
            scan_retry_margin_secs: governor.retry_margin.as_secs(),
            system_device_timeout_ms: 2_000,
            cache_namespace: DEFAULT_CACHE_NAMESPACE.to_string(),
            cache_dir: None,
        }
    }
}

// ----------------------------------------------------------------------------
// Loading
// ----------------------------------------------------------------------------

impl AppConfig {
    /// Load `path` if given, else the default file if it exists, else defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            info!("Loading configuration from: {}", path.display());
            return Self::load_from_file(path);
        }

        match Self::default_config_path() {
            Some(path) if path.exists() => {
                info!("Loading configuration from: {}", path.display());
                Self::load_from_file(path)
            }
            _ => {
                debug!("Using default configuration");
                Ok(Self::default())
            }
        }
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Ok(toml::from_str(&contents)?)
    }

    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("unible").join("config.toml"))
    }

    pub fn default_cache_dir() -> Option<PathBuf> {
        dirs::cache_dir().map(|dir| dir.join("unible"))
    }

    pub fn validate(&self) -> Result<()> {
        let central = &self.central;
        if central.scan_max_starts == 0 {
            return Err(CliError::Config(
                "scan_max_starts must be greater than 0".to_string(),
            ));
        }
        if central.scan_window_secs == 0 {
            return Err(CliError::Config(
                "scan_window_secs must be greater than 0".to_string(),
            ));
        }
        if central.system_device_timeout_ms == 0 {
            return Err(CliError::Config(
                "system_device_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if central.cache_namespace.trim().is_empty() {
            return Err(CliError::Config("cache_namespace is empty".to_string()));
        }
        Ok(())
    }

    /// Central configuration with the cache placed under the resolved directory
    pub fn central_config(&self) -> CentralConfig {
        let central = &self.central;
        let governor = GovernorConfig::default()
            .with_max_starts(central.scan_max_starts)
            .with_window(Duration::from_secs(central.scan_window_secs))
            .with_retry_margin(Duration::from_secs(central.scan_retry_margin_secs));

        let config = CentralConfig::new()
            .with_scan_governor(governor)
            .with_system_device_timeout(Duration::from_millis(central.system_device_timeout_ms))
            .with_cache_namespace(central.cache_namespace.clone());

        match central.cache_dir.clone().or_else(Self::default_cache_dir) {
            Some(dir) => config.with_cache_dir(dir),
            None => config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[cli]\nbackend = \"native\"\n\n[central]\nscan_max_starts = 3\n",
        )
        .unwrap();

        let config = AppConfig::load(Some(&path)).unwrap();

        assert_eq!(config.cli.backend, Backend::Native);
        assert_eq!(config.cli.log_level, "info");
        assert_eq!(config.central.scan_max_starts, 3);
        assert_eq!(config.central.scan_window_secs, 30);
    }

    #[test]
    fn test_round_trips_through_toml() {
        let config = AppConfig::default();
        let encoded = toml::to_string_pretty(&config).unwrap();
        let decoded: AppConfig = toml::from_str(&encoded).unwrap();
        assert_eq!(decoded, config);
    }

    #[test]
    fn test_validation_rejects_zero_limits() {
        let mut config = AppConfig::default();
        assert!(config.validate().is_ok());

        config.central.scan_max_starts = 0;
        assert!(matches!(config.validate(), Err(CliError::Config(_))));
    }

    #[test]
    fn test_central_config_conversion() {
        let mut config = AppConfig::default();
        config.central.cache_dir = Some(PathBuf::from("/tmp/unible-test"));
        config.central.system_device_timeout_ms = 750;

        let central = config.central_config();

        assert_eq!(central.scan_governor, GovernorConfig::default());
        assert_eq!(
            central.system_device_timeout_per_device,
            Duration::from_millis(750)
        );
        assert_eq!(central.cache_dir, Some(PathBuf::from("/tmp/unible-test")));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        assert!(matches!(
            AppConfig::load(Some(&missing)),
            Err(CliError::Io(_))
        ));
    }
}
