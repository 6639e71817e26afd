use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use snapback_boot::{BootEntryBackup, DEFAULT_RESTORE_MARKER, DEFAULT_ROLLBACK_TITLE};
use snapback_core::{read_optional_string, HostLayout};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/snapback.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct SnapbackConfig {
    pub host_root: Option<PathBuf>,
    pub boot: BootConfig,
    pub restore: RestoreConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BootConfig {
    pub grub_conf: Option<PathBuf>,
    pub rollback_title: String,
    pub restore_marker: String,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            grub_conf: None,
            rollback_title: DEFAULT_ROLLBACK_TITLE.to_string(),
            restore_marker: DEFAULT_RESTORE_MARKER.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RestoreConfig {
    pub reboot: bool,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self { reboot: true }
    }
}

impl SnapbackConfig {
    pub fn parse(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("failed to parse snapback config")
    }

    /// Reads `path`, or the default location when `path` is `None`. Only a
    /// missing default file falls back to built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
        };
        match read_optional_string(&path)? {
            Some(raw) => Self::parse(&raw)
                .with_context(|| format!("invalid config file: {}", path.display())),
            None if explicit => Err(anyhow::anyhow!(
                "config file not found: {}",
                path.display()
            )),
            None => Ok(Self::default()),
        }
    }

    pub fn layout(&self, host_root: Option<&Path>) -> HostLayout {
        let root = host_root
            .map(Path::to_path_buf)
            .or_else(|| self.host_root.clone())
            .unwrap_or_else(|| PathBuf::from("/"));
        let layout = HostLayout::new(root);
        match &self.boot.grub_conf {
            Some(grub_conf) => layout.with_grub_conf(grub_conf),
            None => layout,
        }
    }

    pub fn boot_backup(&self, layout: &HostLayout) -> BootEntryBackup {
        BootEntryBackup::new(layout)
            .with_title(&self.boot.rollback_title)
            .with_restore_marker(&self.boot.restore_marker)
    }
}
