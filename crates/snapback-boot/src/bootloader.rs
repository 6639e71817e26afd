use std::process::Command;

use snapback_core::{kernel_image_path, CommandExecutor, CommandFailure};
use tracing::info;

pub const UPGRADE_BANNER: &str = "System Upgrade";
pub const UPGRADE_KERNEL_ARGS: &str = "upgrade systemd.unit=system-upgrade.target";
pub const UPGRADE_REMOVED_ARGS: &str = "rhgb quiet";

pub fn build_grubby_remove_kernel_command(kernel_path: &str) -> Command {
    let mut command = Command::new("grubby");
    command
        .arg("--grub")
        .arg(format!("--remove-kernel={kernel_path}"));
    command
}

pub fn build_new_kernel_pkg_install_command(version: &str, initrd: &str) -> Command {
    let mut command = Command::new("new-kernel-pkg");
    command.args([
        "--initrdfile",
        initrd,
        "--banner",
        UPGRADE_BANNER,
        "--kernel-args",
        UPGRADE_KERNEL_ARGS,
        "--make-default",
        "--install",
        version,
    ]);
    command
}

pub fn build_new_kernel_pkg_update_command(version: &str) -> Command {
    let mut command = Command::new("new-kernel-pkg");
    command.args(["--remove-args", UPGRADE_REMOVED_ARGS, "--update", version]);
    command
}

pub fn remove_kernel_entry(
    executor: &mut dyn CommandExecutor,
    version: &str,
) -> Result<(), CommandFailure> {
    let kernel_path = kernel_image_path(version);
    let mut command = build_grubby_remove_kernel_command(&kernel_path);
    executor.execute(
        &mut command,
        &format!("failed to remove boot entry for {kernel_path}"),
    )?;
    info!(kernel = %kernel_path, "removed boot entry");
    Ok(())
}

pub fn install_upgrade_entry(
    executor: &mut dyn CommandExecutor,
    version: &str,
    initrd: &str,
) -> Result<(), CommandFailure> {
    let mut command = build_new_kernel_pkg_install_command(version, initrd);
    executor.execute(
        &mut command,
        &format!("failed to add upgrade boot entry for {version}"),
    )?;
    let mut command = build_new_kernel_pkg_update_command(version);
    executor.execute(
        &mut command,
        &format!("failed to update upgrade boot entry for {version}"),
    )?;
    info!(version, initrd, "installed upgrade boot entry");
    Ok(())
}
