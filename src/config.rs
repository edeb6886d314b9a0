use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail, ensure};
use reqwest::Url;
use serde::Deserialize;

use crate::catalog::Catalog;
use crate::sequencer::OrderingPolicy;
use crate::settings::DeviceSettings;

/// Where the display client gets its images. Exactly one of the two keys
/// must be set.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct CatalogConfig {
    /// Gallery endpoint returning a JSON array of images.
    pub url: Option<String>,
    /// Local photo library scanned recursively.
    pub directory: Option<PathBuf>,
}

impl CatalogConfig {
    pub fn source(&self) -> Result<Catalog> {
        match (&self.url, &self.directory) {
            (Some(url), None) => {
                let url = Url::parse(url).with_context(|| format!("invalid catalog url {url}"))?;
                Ok(Catalog::http(url))
            }
            (None, Some(dir)) => Ok(Catalog::directory(dir.clone())),
            (Some(_), Some(_)) => bail!("catalog takes either url or directory, not both"),
            (None, None) => bail!("catalog needs a url or a directory"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct Configuration {
    pub catalog: CatalogConfig,
    /// `host:port` of the relay daemon. Without it the client runs alone.
    pub relay_address: Option<String>,
    /// Device-local settings file (order, speed, color counters).
    pub settings_path: PathBuf,
    /// Crossfade duration.
    #[serde(with = "humantime_serde")]
    pub transition: Duration,
    /// Longest wait for one image to load before the transition is skipped.
    #[serde(with = "humantime_serde")]
    pub load_timeout: Duration,
    /// Re-fetch the catalog on this period.
    #[serde(with = "humantime_serde")]
    pub catalog_refresh: Option<Duration>,
    /// Used until the settings file says otherwise.
    pub default_order: OrderingPolicy,
    pub default_speed_secs: u64,
    /// Deterministic seed for random ordering.
    pub shuffle_seed: Option<u64>,
    /// Depth of the session command queue.
    pub command_buffer: usize,
}

impl Configuration {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let s = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&s)?)
    }

    pub fn validated(self) -> Result<Self> {
        self.catalog.source().context("invalid catalog configuration")?;
        ensure!(
            self.default_speed_secs > 0,
            "default-speed-secs must be greater than zero"
        );
        ensure!(
            self.command_buffer > 0,
            "command-buffer must be greater than zero"
        );
        ensure!(
            self.load_timeout > Duration::ZERO,
            "load-timeout must be positive"
        );
        if let Some(period) = self.catalog_refresh {
            ensure!(
                period >= Duration::from_secs(1),
                "catalog-refresh must be at least one second"
            );
        }
        if let Some(addr) = &self.relay_address {
            ensure!(!addr.trim().is_empty(), "relay-address must not be empty");
        }
        ensure!(
            !self.settings_path.as_os_str().is_empty(),
            "settings-path must not be empty"
        );
        Ok(self)
    }

    /// Settings used when the device has none stored yet.
    pub fn default_settings(&self) -> DeviceSettings {
        DeviceSettings {
            order: self.default_order,
            speed_secs: self.default_speed_secs,
            ..DeviceSettings::default()
        }
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            catalog: CatalogConfig::default(),
            relay_address: None,
            settings_path: PathBuf::from("device-settings.yaml"),
            transition: Duration::from_millis(1000),
            load_timeout: Duration::from_secs(10),
            catalog_refresh: None,
            default_order: OrderingPolicy::Alphabetical,
            default_speed_secs: 5,
            shuffle_seed: None,
            command_buffer: 32,
        }
    }
}
