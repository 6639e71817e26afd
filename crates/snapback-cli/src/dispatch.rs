use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use snapback_core::{SnapshotSpec, SystemExecutor};

use crate::config::SnapbackConfig;
use crate::orchestrator::{AttemptOverview, RollbackOrchestrator, StageRequest};
use crate::render::TerminalRenderer;

#[derive(Parser, Debug)]
#[command(name = "snapback")]
#[command(about = "Snapshot-based rollback for in-place system upgrades", long_about = None)]
pub struct Cli {
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[arg(long, global = true)]
    pub host_root: Option<PathBuf>,
    #[arg(long, short, global = true)]
    pub verbose: bool,
    #[arg(long, global = true)]
    pub debuglog: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Snapshot volumes and install the rollback boot entry.
    Stage(StageArgs),
    /// Roll the host back to the staged snapshots.
    Restore {
        #[arg(long)]
        no_reboot: bool,
    },
    /// Keep the upgrade and remove all rollback artifacts.
    Commit,
    /// Remove the logical volume snapshots only.
    CleanSnapshots,
    Status,
}

#[derive(Args, Debug)]
pub struct StageArgs {
    /// Root volume snapshot, `VOLUME[:NAME[:SIZE]]`.
    #[arg(long, value_parser = parse_snapshot_spec)]
    pub snapshot_root_lv: Option<SnapshotSpec>,
    /// Additional snapshot, `VOLUME[:NAME[:SIZE]]`. Repeatable.
    #[arg(long, value_parser = parse_snapshot_spec)]
    pub snapshot_lv: Vec<SnapshotSpec>,
    #[arg(long)]
    pub target_kernel: Option<PathBuf>,
    #[arg(long, requires = "target_kernel")]
    pub target_initrd: Option<PathBuf>,
}

fn parse_snapshot_spec(value: &str) -> Result<SnapshotSpec, String> {
    SnapshotSpec::parse(value).map_err(|err| err.to_string())
}

pub fn run_cli(cli: Cli) -> Result<()> {
    let config = SnapbackConfig::load(cli.config.as_deref())?;
    let layout = config.layout(cli.host_root.as_deref());
    let backup = config.boot_backup(&layout);
    let renderer = TerminalRenderer::current();
    let mut executor = SystemExecutor;
    let mut orchestrator = RollbackOrchestrator::new(layout, backup, &mut executor);

    match cli.command {
        Commands::Stage(args) => {
            let request = StageRequest {
                root: args.snapshot_root_lv,
                snapshots: args.snapshot_lv,
                target_kernel: args.target_kernel,
                target_initrd: args.target_initrd,
            };
            let summary = renderer.run_step("stage", || orchestrator.stage(&request))?;
            for snapshot in &summary.snapshots {
                renderer.print_status("ok", &format!("snapshot {snapshot}"));
            }
            renderer.print_status(
                "ok",
                &format!("rollback entry boots kernel {}", summary.active_kernel),
            );
            if let Some(target) = &summary.target_kernel {
                renderer.print_status("ok", &format!("upgrade entry boots kernel {target}"));
            }
        }
        Commands::Restore { no_reboot } => {
            let reboot = config.restore.reboot && !no_reboot;
            let summary = renderer.run_step("restore", || orchestrator.restore(reboot))?;
            for merged in &summary.merged {
                renderer.print_status("ok", &format!("merged {merged}"));
            }
            for failure in &summary.merge_failures {
                renderer.print_status("err", &format!("merge failed {failure}"));
            }
            for kernel in &summary.removed_kernels {
                renderer.print_status("ok", &format!("removed boot entry for {kernel}"));
            }
            if !summary.merge_failures.is_empty() {
                bail!(
                    "restore finished with {} failed merge(s)",
                    summary.merge_failures.len()
                );
            }
        }
        Commands::Commit => {
            let report = renderer.run_step("commit", || orchestrator.commit())?;
            if report.removed_boot_entry {
                renderer.print_status("ok", "removed rollback boot entry");
            }
            for path in &report.removed_files {
                renderer.print_status("ok", &format!("removed {}", path.display()));
            }
            for failure in &report.snapshots.failures {
                renderer.print_status("err", &format!("{}: {}", failure.snapshot, failure.error));
            }
            for message in &report.errors {
                renderer.print_status("err", message);
            }
            if !report.succeeded() {
                bail!("commit left rollback artifacts behind, rerun commit");
            }
        }
        Commands::CleanSnapshots => {
            let report =
                renderer.run_step("clean-snapshots", || orchestrator.clean_snapshots())?;
            for snapshot in &report.completed {
                renderer.print_status("ok", &format!("removed {snapshot}"));
            }
            for failure in &report.failures {
                renderer.print_status("err", &format!("{}: {}", failure.snapshot, failure.error));
            }
            if !report.succeeded() {
                bail!("{} snapshot(s) could not be removed", report.failures.len());
            }
        }
        Commands::Status => {
            let overview = orchestrator.status()?;
            renderer.print_section("attempt");
            renderer.print_lines(&format_status_lines(&overview));
        }
    }

    Ok(())
}

pub fn format_status_lines(overview: &AttemptOverview) -> Vec<String> {
    let mut lines = Vec::new();
    match &overview.record {
        Some(record) => {
            lines.push(format!("status: {}", record.status.as_str()));
            lines.push(format!("started_at_unix: {}", record.started_at_unix));
            lines.push(format!("updated_at_unix: {}", record.updated_at_unix));
        }
        None => lines.push("status: none".to_string()),
    }
    if let Some(active) = &overview.boot.active_kernel {
        lines.push(format!("active kernel: {active}"));
    }
    if let Some(target) = &overview.boot.target_kernel {
        lines.push(format!("target kernel: {target}"));
    }
    for snapshot in &overview.snapshots {
        lines.push(format!(
            "snapshot: {} origin={} size={}",
            snapshot.section, snapshot.origin_volume, snapshot.size
        ));
    }
    if !overview.boot.snap_boot_files.is_empty() {
        lines.push(format!(
            "backed up boot files: {}",
            overview.boot.snap_boot_files.len()
        ));
    }
    lines
}
