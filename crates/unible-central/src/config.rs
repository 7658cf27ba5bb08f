//! Central configuration

use std::path::PathBuf;
use std::time::Duration;

use unible_core::{GovernorConfig, DEFAULT_CACHE_NAMESPACE};

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Configuration for the BLE central
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct CentralConfig {
    /// Scan start rate limiting
    pub scan_governor: GovernorConfig,
    /// Per-device budget when filtering OS-connected devices by service
    pub system_device_timeout_per_device: Duration,
    /// Namespace of the persisted service cache
    pub cache_namespace: String,
    /// Directory holding the service cache; in-memory when unset
    pub cache_dir: Option<PathBuf>,
}

impl Default for CentralConfig {
    fn default() -> Self {
        Self {
            scan_governor: GovernorConfig::default(),
            system_device_timeout_per_device: Duration::from_secs(2),
            cache_namespace: DEFAULT_CACHE_NAMESPACE.to_string(),
            cache_dir: None,
        }
    }
}

impl CentralConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set scan governor limits
    pub fn with_scan_governor(mut self, governor: GovernorConfig) -> Self {
        self.scan_governor = governor;
        self
    }

    /// Set the per-device system device timeout
    pub fn with_system_device_timeout(mut self, timeout: Duration) -> Self {
        self.system_device_timeout_per_device = timeout;
        self
    }

    pub fn with_cache_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.cache_namespace = namespace.into();
        self
    }

    /// Persist the service cache under `dir`
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }
}
