use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::sequencer::OrderingPolicy;

/// Number of entries in the tag/pill color palettes the management UI
/// cycles through.
pub const PALETTE_LEN: usize = 8;

/// Per-device preferences kept across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DeviceSettings {
    pub order: OrderingPolicy,
    /// Auto-advance interval in seconds.
    pub speed_secs: u64,
    /// Next color handed to a newly created tag. Stored only.
    pub tag_color_index: usize,
    /// Next color handed to a newly rendered pill. Stored only.
    pub pill_color_index: usize,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            order: OrderingPolicy::Alphabetical,
            speed_secs: 5,
            tag_color_index: 0,
            pill_color_index: 0,
        }
    }
}

/// Next slot in a palette of `palette_len` colors.
pub fn cycle_color_index(current: usize, palette_len: usize) -> usize {
    if palette_len == 0 {
        return 0;
    }
    (current + 1) % palette_len
}

/// YAML-backed store for [`DeviceSettings`].
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored settings, or `fallback` when the file does not exist
    /// yet. A file that exists but fails to parse is an error.
    pub fn load_or(&self, fallback: DeviceSettings) -> Result<DeviceSettings> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no device settings yet; using defaults");
                return Ok(fallback);
            }
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to read device settings {}", self.path.display())
                });
            }
        };
        serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse device settings {}", self.path.display()))
    }

    /// Write through a sibling temp file so a watcher never sees a torn file.
    pub async fn save(&self, settings: &DeviceSettings) -> Result<()> {
        let yaml = serde_yaml::to_string(settings).context("failed to encode device settings")?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let tmp = self.path.with_extension("yaml.tmp");
        tokio::fs::write(&tmp, yaml)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        info!(
            path = %self.path.display(),
            order = %settings.order,
            speed_secs = settings.speed_secs,
            "device settings saved"
        );
        Ok(())
    }
}
