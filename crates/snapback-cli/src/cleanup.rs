use anyhow::{Context, Result};
use std::path::PathBuf;

use snapback_boot::{
    clear_boot_state, read_snap_boot_files, remove_kernel_entry, BootEntryBackup, GrubConfig,
    SNAPSHOT_SUFFIX,
};
use snapback_core::{remove_file_if_exists, CommandExecutor, HostLayout};
use snapback_lvm::{SetOperationReport, SnapshotSet};
use tracing::{info, warn};

#[derive(Debug, Default)]
pub struct CleanupReport {
    pub removed_boot_entry: bool,
    pub removed_files: Vec<PathBuf>,
    pub snapshots: SetOperationReport,
    pub errors: Vec<String>,
}

impl CleanupReport {
    pub fn succeeded(&self) -> bool {
        self.errors.is_empty() && self.snapshots.succeeded()
    }

    fn record_error(&mut self, step: &str, err: anyhow::Error) {
        warn!(error = %format!("{err:#}"), "{step}");
        self.errors.push(format!("{step}: {err:#}"));
    }
}

/// Removes rollback artifacts. Every step checks for its target first, so a
/// run after a partial or complete cleanup is harmless.
pub struct CleanupAgent<'a> {
    layout: &'a HostLayout,
    backup: &'a BootEntryBackup,
}

impl<'a> CleanupAgent<'a> {
    pub fn new(layout: &'a HostLayout, backup: &'a BootEntryBackup) -> Self {
        Self { layout, backup }
    }

    pub fn run(&self, executor: &mut dyn CommandExecutor) -> CleanupReport {
        let mut report = CleanupReport::default();

        match self.rollback_entry_present() {
            Ok(true) => match remove_kernel_entry(executor, SNAPSHOT_SUFFIX) {
                Ok(()) => report.removed_boot_entry = true,
                Err(err) => report.record_error("failed to remove rollback boot entry", err.into()),
            },
            Ok(false) => {}
            Err(err) => report.record_error("failed to inspect bootloader config", err),
        }

        match self.backup.clean_snapshot_boot_files() {
            Ok(removed) => report.removed_files.extend(removed),
            Err(err) => report.record_error("failed to remove snapshot boot files", err),
        }
        match self.remove_listed_boot_files() {
            Ok(removed) => report.removed_files.extend(removed),
            Err(err) => report.record_error("failed to remove listed boot files", err),
        }

        match self.clean_snapshots(executor) {
            Ok(snapshots) => report.snapshots = snapshots,
            Err(err) => report.record_error("failed to remove snapshots", err),
        }

        match self.backup.discard_config_backup() {
            Ok(true) => report.removed_files.push(self.layout.grub_conf_backup_path()),
            Ok(false) => {}
            Err(err) => report.record_error("failed to remove bootloader config backup", err),
        }
        // boot state lists the files above, keep it for a rerun until they are gone
        if report.errors.is_empty() {
            match clear_boot_state(self.layout) {
                Ok(removed) => report.removed_files.extend(removed),
                Err(err) => report.record_error("failed to clear boot state", err),
            }
        }

        info!(
            files = report.removed_files.len(),
            snapshots = report.snapshots.completed.len(),
            boot_entry = report.removed_boot_entry,
            errors = report.errors.len(),
            "cleaned up rollback artifacts"
        );
        report
    }

    pub fn clean_snapshots(&self, executor: &mut dyn CommandExecutor) -> Result<SetOperationReport> {
        let mut set = SnapshotSet::load(self.layout)?;
        set.remove_snapshots(executor)
    }

    fn remove_listed_boot_files(&self) -> Result<Vec<PathBuf>> {
        let mut removed = Vec::new();
        for listed in read_snap_boot_files(self.layout)? {
            let path = self.layout.host_path(&listed);
            if remove_file_if_exists(&path)
                .with_context(|| format!("failed to remove {}", path.display()))?
            {
                removed.push(path);
            }
        }
        Ok(removed)
    }

    fn rollback_entry_present(&self) -> Result<bool> {
        let path = self.layout.grub_conf_path();
        if !path.exists() {
            return Ok(false);
        }
        let config = GrubConfig::load(&path)?;
        Ok(config
            .find_by_kernel(&BootEntryBackup::rollback_kernel_file_name())
            .is_some())
    }
}
