use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use snapback_core::{move_file, remove_file_if_exists, sha256_file_hex, HostLayout};
use tracing::{debug, info, warn};

use crate::{BootChecksums, GrubConfig};

pub const SNAPSHOT_SUFFIX: &str = "snapshot";
pub const DEFAULT_ROLLBACK_TITLE: &str = "Snapshot Rollback";
pub const DEFAULT_RESTORE_MARKER: &str = "snapback.restore";

const BOOT_FILE_TEMPLATES: [(&str, &str); 5] = [
    ("initramfs-", ".img"),
    ("vmlinuz-", ""),
    ("System.map-", ""),
    ("symvers-", ".gz"),
    ("config-", ""),
];

pub fn boot_file_names(version: &str) -> Vec<String> {
    BOOT_FILE_TEMPLATES
        .iter()
        .map(|(prefix, suffix)| format!("{prefix}{version}{suffix}"))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BootBackup {
    pub files: Vec<String>,
    pub checksums: BootChecksums,
}

#[derive(Debug, Clone)]
pub struct BootEntryBackup {
    layout: HostLayout,
    title: String,
    restore_marker: String,
}

impl BootEntryBackup {
    pub fn new(layout: &HostLayout) -> Self {
        Self {
            layout: layout.clone(),
            title: DEFAULT_ROLLBACK_TITLE.to_string(),
            restore_marker: DEFAULT_RESTORE_MARKER.to_string(),
        }
    }

    pub fn with_title(mut self, title: &str) -> Self {
        self.title = title.to_string();
        self
    }

    pub fn with_restore_marker(mut self, marker: &str) -> Self {
        self.restore_marker = marker.to_string();
        self
    }

    pub fn rollback_kernel_file_name() -> String {
        format!("vmlinuz-{SNAPSHOT_SUFFIX}")
    }

    /// Copies the running kernel's boot artifacts to their `snapshot` names
    /// and the bootloader config to its `.preupg` backup.
    pub fn backup_boot_files(&self, version: &str) -> Result<BootBackup> {
        let sources: Vec<PathBuf> = boot_file_names(version)
            .iter()
            .map(|name| self.layout.boot_artifact_path(name))
            .collect();
        let grub_conf = self.layout.grub_conf_path();
        for source in sources.iter().chain(std::iter::once(&grub_conf)) {
            if !source.exists() {
                bail!("boot file to back up is missing: {}", source.display());
            }
        }

        let mut backup = BootBackup::default();
        for (source, name) in sources.iter().zip(boot_file_names(SNAPSHOT_SUFFIX)) {
            let dest = self.layout.boot_artifact_path(&name);
            self.copy_and_record(source, &dest, &mut backup)?;
            backup.files.push(self.layout.host_display(&dest));
        }
        self.copy_and_record(&grub_conf, &self.layout.grub_conf_backup_path(), &mut backup)?;

        info!(version, files = backup.files.len(), "backed up boot files");
        Ok(backup)
    }

    fn copy_and_record(
        &self,
        source: &Path,
        dest: &Path,
        backup: &mut BootBackup,
    ) -> Result<()> {
        fs::copy(source, dest).with_context(|| {
            format!("failed to copy {} to {}", source.display(), dest.display())
        })?;
        let digest = sha256_file_hex(dest)?;
        debug!(path = %dest.display(), sha256 = %digest, "backed up boot file");
        backup
            .checksums
            .insert(self.layout.host_display(dest), digest);
        Ok(())
    }

    /// Adds a boot entry for the `snapshot` artifacts, cloned from the default
    /// entry. Returns false when the default entry does not boot `version`.
    pub fn install_rollback_boot_entry(&self, version: &str) -> Result<bool> {
        let path = self.layout.grub_conf_path();
        let mut config = GrubConfig::load(&path)?;

        if config
            .find_by_kernel(&Self::rollback_kernel_file_name())
            .is_some()
        {
            debug!(config = %path.display(), "rollback boot entry already present");
            return Ok(true);
        }

        let Some(default) = config.default_entry() else {
            warn!(config = %path.display(), "bootloader config has no default entry");
            return Ok(false);
        };
        if !default.boots(&format!("vmlinuz-{version}")) {
            warn!(
                config = %path.display(),
                version,
                "default boot entry does not boot the running kernel"
            );
            return Ok(false);
        }

        let mut entry = default.with_version_replaced(version, SNAPSHOT_SUFFIX);
        entry.title = self.title.clone();
        entry.push_kernel_arg(&self.restore_marker);
        config.push_entry(entry);
        config.write(&path)?;

        info!(config = %path.display(), title = %self.title, "installed rollback boot entry");
        Ok(true)
    }

    /// Moves the `snapshot` artifacts and `.preupg` back. Pairs an earlier
    /// run already moved are skipped, see [`BootEntryBackup::verify_restore`].
    pub fn restore_boot_files(&self, version: &str) -> Result<()> {
        for (source, dest) in self.restore_pairs(version) {
            if !source.exists() && dest.exists() {
                debug!(path = %dest.display(), "boot file already restored");
                continue;
            }
            move_file(&source, &dest)
                .with_context(|| format!("failed to restore boot file {}", dest.display()))?;
        }

        info!(version, "restored boot files");
        Ok(())
    }

    fn restore_pairs(&self, version: &str) -> Vec<(PathBuf, PathBuf)> {
        let mut pairs: Vec<(PathBuf, PathBuf)> = boot_file_names(SNAPSHOT_SUFFIX)
            .iter()
            .zip(boot_file_names(version))
            .map(|(snapshot, versioned)| {
                (
                    self.layout.boot_artifact_path(snapshot),
                    self.layout.boot_artifact_path(&versioned),
                )
            })
            .collect();
        pairs.push((
            self.layout.grub_conf_backup_path(),
            self.layout.grub_conf_path(),
        ));
        pairs
    }

    pub fn clean_snapshot_boot_files(&self) -> Result<Vec<PathBuf>> {
        let mut removed = Vec::new();
        for name in boot_file_names(SNAPSHOT_SUFFIX) {
            let path = self.layout.boot_artifact_path(&name);
            if remove_file_if_exists(&path)
                .with_context(|| format!("failed to remove {}", path.display()))?
            {
                debug!(path = %path.display(), "removed snapshot boot file");
                removed.push(path);
            }
        }
        Ok(removed)
    }

    /// Puts `.preupg` back over the live bootloader config, undoing every
    /// entry added since the backup. Returns false when there is no backup.
    pub fn revert_config(&self) -> Result<bool> {
        let backup = self.layout.grub_conf_backup_path();
        if !backup.exists() {
            return Ok(false);
        }
        move_file(&backup, &self.layout.grub_conf_path())?;
        info!(config = %self.layout.grub_conf_path().display(), "reverted bootloader config");
        Ok(true)
    }

    pub fn discard_config_backup(&self) -> Result<bool> {
        let path = self.layout.grub_conf_backup_path();
        remove_file_if_exists(&path).with_context(|| format!("failed to remove {}", path.display()))
    }

    /// Like [`BootEntryBackup::verify_backup`], but accepts a backed-up file
    /// that is gone when its restored copy under the `version` name carries
    /// the recorded digest. Returns how many files are still to be restored.
    pub fn verify_restore(&self, version: &str, checksums: &BootChecksums) -> Result<usize> {
        if checksums.is_empty() {
            bail!("no boot backup checksums are recorded");
        }

        let mut pending = 0;
        for (source, dest) in self.restore_pairs(version) {
            let key = self.layout.host_display(&source);
            let Some(expected) = checksums.get(&key) else {
                bail!("no checksum is recorded for backed up boot file {key}");
            };
            if source.exists() {
                let actual = sha256_file_hex(&source)?;
                if actual != *expected {
                    bail!(
                        "backed up boot file was modified: {} (expected sha256 {expected}, found {actual})",
                        source.display()
                    );
                }
                pending += 1;
            } else if dest.is_file() && sha256_file_hex(&dest)? == *expected {
                debug!(path = %dest.display(), "boot file already restored");
            } else {
                bail!("backed up boot file is missing: {}", source.display());
            }
        }
        debug!(pending, "verified boot backup for restore");
        Ok(pending)
    }

    pub fn verify_backup(&self, checksums: &BootChecksums) -> Result<()> {
        if checksums.is_empty() {
            bail!("no boot backup checksums are recorded");
        }

        for (host_path, expected) in checksums {
            let path = self.layout.host_path(host_path);
            if !path.exists() {
                bail!("backed up boot file is missing: {}", path.display());
            }
            let actual = sha256_file_hex(&path)?;
            if actual != *expected {
                bail!(
                    "backed up boot file was modified: {} (expected sha256 {expected}, found {actual})",
                    path.display()
                );
            }
        }
        debug!(files = checksums.len(), "verified boot backup");
        Ok(())
    }
}
