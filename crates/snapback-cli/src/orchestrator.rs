use anyhow::{anyhow, bail, Context, Result};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Command;

use snapback_boot::{
    clear_boot_state, has_boot_state, install_upgrade_entry, read_boot_state,
    remove_kernel_entry, write_active_kernel, write_all_kernels, write_boot_checksums,
    write_snap_boot_files, write_target_kernel, BootEntryBackup, BootState,
};
use snapback_core::{
    kernel_version_from_image, kernel_version_from_image_header, kernel_version_from_package,
    parse_installed_kernels, read_running_release, CommandExecutor, CommandFailure, HostLayout,
    SnapshotSpec,
};
use snapback_lvm::{SetOperationReport, SnapshotMetadataStore, SnapshotRecord, SnapshotSet};
use tracing::{error, info, warn};

use crate::attempt::{
    current_unix_timestamp, ensure_attempt_allows, ensure_stage_allowed, read_attempt_record,
    update_attempt_status, write_attempt_record, AttemptRecord, AttemptStatus,
};
use crate::cleanup::{CleanupAgent, CleanupReport};

#[derive(Debug, Clone, Default)]
pub struct StageRequest {
    pub root: Option<SnapshotSpec>,
    pub snapshots: Vec<SnapshotSpec>,
    pub target_kernel: Option<PathBuf>,
    pub target_initrd: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSummary {
    pub active_kernel: String,
    pub snapshots: Vec<String>,
    pub target_kernel: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreSummary {
    pub active_kernel: String,
    pub merged: Vec<String>,
    pub merge_failures: Vec<String>,
    pub removed_kernels: Vec<String>,
    pub rebooted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptOverview {
    pub record: Option<AttemptRecord>,
    pub snapshots: Vec<SnapshotRecord>,
    pub boot: BootState,
}

pub struct RollbackOrchestrator<'a> {
    layout: HostLayout,
    backup: BootEntryBackup,
    executor: &'a mut dyn CommandExecutor,
}

impl<'a> RollbackOrchestrator<'a> {
    pub fn new(
        layout: HostLayout,
        backup: BootEntryBackup,
        executor: &'a mut dyn CommandExecutor,
    ) -> Self {
        Self {
            layout,
            backup,
            executor,
        }
    }

    /// Snapshots the requested volumes and prepares the boot configuration
    /// for a rollback. Any failure leaves the host as it was.
    pub fn stage(&mut self, request: &StageRequest) -> Result<StageSummary> {
        self.layout.ensure_rollback_dirs()?;
        ensure_stage_allowed(&self.layout)?;
        let active = read_running_release(&self.layout)?;

        let mut record = AttemptRecord::new(AttemptStatus::Staging, current_unix_timestamp()?);
        record.active_kernel = Some(active.clone());
        write_attempt_record(&self.layout, &record)?;

        let mut set = match self.create_snapshots(request) {
            Ok(set) => set,
            Err(err) => {
                update_attempt_status(&self.layout, AttemptStatus::Prepared)?;
                return Err(err);
            }
        };

        match self.stage_boot(&active, request) {
            Ok(target_kernel) => {
                record.status = AttemptStatus::Staged;
                record.target_kernel = target_kernel.clone();
                record.updated_at_unix = current_unix_timestamp()?;
                write_attempt_record(&self.layout, &record)?;
                info!(active_kernel = %active, snapshots = set.len(), "staged upgrade attempt");
                Ok(StageSummary {
                    active_kernel: active,
                    snapshots: set.iter().map(|snapshot| snapshot.path()).collect(),
                    target_kernel,
                })
            }
            Err(err) => match self.compensate(&mut set) {
                Ok(()) => {
                    update_attempt_status(&self.layout, AttemptStatus::Prepared)?;
                    Err(err.context("staging failed, snapshots and boot changes were rolled back"))
                }
                Err(compensation) => {
                    error!(error = %compensation, "failed to undo partial staging");
                    update_attempt_status(&self.layout, AttemptStatus::Failed)?;
                    Err(err.context(format!(
                        "staging failed and could not be fully undone ({compensation}), run commit to clean up"
                    )))
                }
            },
        }
    }

    fn create_snapshots(&mut self, request: &StageRequest) -> Result<SnapshotSet> {
        if request.root.is_none() && request.snapshots.is_empty() {
            bail!("no snapshots requested, pass --snapshot-root-lv or --snapshot-lv");
        }
        let mut set = SnapshotSet::open(&self.layout, request.root.as_ref(), &request.snapshots)?;
        let report = set.create_snapshots(self.executor)?;
        if !report.succeeded() {
            bail!(describe_failures("failed to create snapshots", &report));
        }
        Ok(set)
    }

    fn stage_boot(&mut self, active: &str, request: &StageRequest) -> Result<Option<String>> {
        let installed = query_installed_kernels(self.executor)?;
        write_active_kernel(&self.layout, active)?;
        write_all_kernels(&self.layout, &installed)?;

        let backup = self.backup.backup_boot_files(active)?;
        write_snap_boot_files(&self.layout, &backup.files)?;
        write_boot_checksums(&self.layout, &backup.checksums)?;

        if !self.backup.install_rollback_boot_entry(active)? {
            bail!(
                "cannot install rollback boot entry: the default boot entry does not boot the running kernel {active}"
            );
        }

        let Some(kernel) = &request.target_kernel else {
            return Ok(None);
        };
        let version = target_kernel_version(&self.layout, kernel)?;
        let initrd = match &request.target_initrd {
            Some(initrd) => initrd.display().to_string(),
            None => format!("/boot/initramfs-{version}.img"),
        };
        install_upgrade_entry(self.executor, &version, &initrd)?;
        write_target_kernel(&self.layout, &version)?;
        Ok(Some(version))
    }

    fn compensate(&mut self, set: &mut SnapshotSet) -> Result<()> {
        warn!("undoing partial staging");
        let mut problems = Vec::new();

        if let Err(err) = self.backup.revert_config() {
            problems.push(format!("{err:#}"));
        }
        if let Err(err) = self.backup.clean_snapshot_boot_files() {
            problems.push(format!("{err:#}"));
        }
        match set.remove_snapshots(self.executor) {
            Ok(report) if report.succeeded() => {}
            Ok(report) => problems.push(describe_failures("failed to remove snapshots", &report)),
            Err(err) => problems.push(format!("{err:#}")),
        }
        if let Err(err) = clear_boot_state(&self.layout) {
            problems.push(format!("{err:#}"));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(anyhow!(problems.join("; ")))
        }
    }

    /// Merges the snapshots back and reinstates the pre-upgrade kernel and
    /// bootloader config. Refuses to touch the host unless the boot backup
    /// verifies.
    pub fn restore(&mut self, reboot: bool) -> Result<RestoreSummary> {
        let has_state = host_has_staged_state(&self.layout);
        let attempt = ensure_attempt_allows(
            &self.layout,
            "restore",
            AttemptStatus::allows_restore,
            has_state,
        )?;

        let state = read_boot_state(&self.layout)?;
        let active = state.active_kernel.clone().ok_or_else(|| {
            anyhow!(
                "cannot restore (reason=missing_boot_state): {} is missing",
                self.layout.active_kernel_path().display()
            )
        })?;
        let pending = self
            .backup
            .verify_restore(&active, &state.checksums)
            .context("cannot restore: boot backup failed verification")?;
        if attempt.is_some_and(|record| record.status == AttemptStatus::RollingBack) {
            info!(pending, "resuming interrupted restore");
        }

        update_attempt_status(&self.layout, AttemptStatus::RollingBack)?;
        let mut set = SnapshotSet::load(&self.layout)?;
        let report = set.restore_snapshots(self.executor)?;
        self.backup
            .restore_boot_files(&active)
            .context("restore stopped before the boot files were back, rerun restore to finish")?;

        let installed = match query_installed_kernels(self.executor) {
            Ok(installed) => installed,
            Err(err) => {
                warn!(error = %err, "could not list installed kernels");
                Vec::new()
            }
        };
        let stale = stale_kernel_packages(
            &installed,
            state.all_kernels.as_deref(),
            state.target_kernel.as_deref(),
            &active,
        );
        let mut removed_kernels = Vec::new();
        for package in &stale {
            let Some(version) = kernel_version_from_package(package) else {
                continue;
            };
            match remove_kernel_entry(self.executor, version) {
                Ok(()) => removed_kernels.push(version.to_string()),
                Err(err) => warn!(error = %err, kernel = version, "failed to remove boot entry"),
            }
        }

        clear_boot_state(&self.layout)?;
        let status = if report.succeeded() {
            AttemptStatus::RolledBack
        } else {
            AttemptStatus::Failed
        };
        update_attempt_status(&self.layout, status)?;
        info!(
            active_kernel = %active,
            merged = report.completed.len(),
            failed = report.failures.len(),
            "restored pre-upgrade state"
        );

        let summary = RestoreSummary {
            active_kernel: active,
            merged: report.completed.clone(),
            merge_failures: report
                .failures
                .iter()
                .map(|failure| format!("{}: {}", failure.snapshot, failure.error))
                .collect(),
            removed_kernels,
            rebooted: reboot,
        };
        if reboot {
            let mut command = Command::new("reboot");
            self.executor.execute(&mut command, "failed to reboot")?;
        }
        Ok(summary)
    }

    pub fn commit(&mut self) -> Result<CleanupReport> {
        let has_state = host_has_staged_state(&self.layout);
        ensure_attempt_allows(
            &self.layout,
            "commit",
            AttemptStatus::allows_commit,
            has_state,
        )?;

        let report = CleanupAgent::new(&self.layout, &self.backup).run(self.executor);
        let status = if report.succeeded() {
            AttemptStatus::Committed
        } else {
            AttemptStatus::Failed
        };
        update_attempt_status(&self.layout, status)?;
        Ok(report)
    }

    pub fn clean_snapshots(&mut self) -> Result<SetOperationReport> {
        CleanupAgent::new(&self.layout, &self.backup).clean_snapshots(self.executor)
    }

    pub fn status(&self) -> Result<AttemptOverview> {
        let store = SnapshotMetadataStore::open(self.layout.snapshot_metadata_path());
        Ok(AttemptOverview {
            record: read_attempt_record(&self.layout)?,
            snapshots: store.records().to_vec(),
            boot: read_boot_state(&self.layout)?,
        })
    }
}

fn host_has_staged_state(layout: &HostLayout) -> bool {
    has_boot_state(layout) || !SnapshotMetadataStore::open(layout.snapshot_metadata_path()).is_empty()
}

pub fn query_installed_kernels(
    executor: &mut dyn CommandExecutor,
) -> Result<Vec<String>, CommandFailure> {
    let mut command = Command::new("rpm");
    command.args(["-q", "kernel"]);
    let output = executor.execute(&mut command, "failed to list installed kernels")?;
    Ok(parse_installed_kernels(&output))
}

/// Kernel packages that appeared after staging: what is installed now plus
/// the recorded upgrade target, minus what was installed at staging time and
/// the kernel being restored. Nothing is stale without a staging record.
pub fn stale_kernel_packages(
    installed: &[String],
    recorded: Option<&[String]>,
    target_kernel: Option<&str>,
    active_kernel: &str,
) -> Vec<String> {
    let Some(recorded) = recorded else {
        return Vec::new();
    };
    let active = format!("kernel-{active_kernel}");
    let mut candidates: BTreeSet<String> = installed.iter().cloned().collect();
    if let Some(target) = target_kernel {
        candidates.insert(format!("kernel-{target}"));
    }
    candidates
        .into_iter()
        .filter(|package| *package != active && !recorded.contains(package))
        .collect()
}

fn target_kernel_version(layout: &HostLayout, kernel: &Path) -> Result<String> {
    if let Some(version) = kernel_version_from_image(kernel) {
        return Ok(version);
    }
    kernel_version_from_image_header(&layout.host_path(kernel))?
        .ok_or_else(|| anyhow!("cannot tell kernel version of {}", kernel.display()))
}

fn describe_failures(prefix: &str, report: &SetOperationReport) -> String {
    let details = report
        .failures
        .iter()
        .map(|failure| format!("{}: {}", failure.snapshot, failure.error))
        .collect::<Vec<_>>()
        .join("; ");
    format!("{prefix}: {details}")
}
