use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use snapback_core::{read_optional_string, remove_file_if_exists, write_file_atomic, HostLayout};
use tracing::debug;

pub type BootChecksums = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BootState {
    pub active_kernel: Option<String>,
    pub all_kernels: Option<Vec<String>>,
    pub target_kernel: Option<String>,
    pub snap_boot_files: Vec<String>,
    pub checksums: BootChecksums,
}

impl BootState {
    pub fn is_empty(&self) -> bool {
        self.active_kernel.is_none()
            && self.all_kernels.is_none()
            && self.target_kernel.is_none()
            && self.snap_boot_files.is_empty()
            && self.checksums.is_empty()
    }
}

pub fn read_boot_state(layout: &HostLayout) -> Result<BootState> {
    Ok(BootState {
        active_kernel: read_active_kernel(layout)?,
        all_kernels: read_all_kernels(layout)?,
        target_kernel: read_target_kernel(layout)?,
        snap_boot_files: read_snap_boot_files(layout)?,
        checksums: read_boot_checksums(layout)?,
    })
}

pub fn write_active_kernel(layout: &HostLayout, version: &str) -> Result<()> {
    write_scratch(&layout.active_kernel_path(), format!("{version}\n"))
}

pub fn read_active_kernel(layout: &HostLayout) -> Result<Option<String>> {
    read_single_value(&layout.active_kernel_path())
}

pub fn write_all_kernels(layout: &HostLayout, packages: &[String]) -> Result<()> {
    let mut payload = String::new();
    for package in packages {
        payload.push_str(package);
        payload.push('\n');
    }
    write_scratch(&layout.all_kernels_path(), payload)
}

pub fn read_all_kernels(layout: &HostLayout) -> Result<Option<Vec<String>>> {
    let Some(raw) = read_optional_string(&layout.all_kernels_path())? else {
        return Ok(None);
    };
    Ok(Some(
        raw.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect(),
    ))
}

pub fn write_target_kernel(layout: &HostLayout, version: &str) -> Result<()> {
    write_scratch(&layout.target_kernel_path(), format!("{version}\n"))
}

pub fn read_target_kernel(layout: &HostLayout) -> Result<Option<String>> {
    read_single_value(&layout.target_kernel_path())
}

pub fn write_snap_boot_files(layout: &HostLayout, files: &[String]) -> Result<()> {
    let path = layout.snap_boot_files_path();
    let payload = serde_json::to_string_pretty(files)
        .with_context(|| format!("failed to encode {}", path.display()))?;
    write_scratch(&path, payload)
}

pub fn read_snap_boot_files(layout: &HostLayout) -> Result<Vec<String>> {
    let path = layout.snap_boot_files_path();
    let Some(raw) = read_optional_string(&path)? else {
        return Ok(Vec::new());
    };
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

pub fn write_boot_checksums(layout: &HostLayout, checksums: &BootChecksums) -> Result<()> {
    let path = layout.snap_boot_checksums_path();
    let payload = serde_json::to_string_pretty(checksums)
        .with_context(|| format!("failed to encode {}", path.display()))?;
    write_scratch(&path, payload)
}

pub fn read_boot_checksums(layout: &HostLayout) -> Result<BootChecksums> {
    let path = layout.snap_boot_checksums_path();
    let Some(raw) = read_optional_string(&path)? else {
        return Ok(BootChecksums::new());
    };
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

pub fn clear_boot_state(layout: &HostLayout) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    for path in scratch_paths(layout) {
        if remove_file_if_exists(&path)
            .with_context(|| format!("failed to remove {}", path.display()))?
        {
            debug!(path = %path.display(), "removed boot state file");
            removed.push(path);
        }
    }
    Ok(removed)
}

pub fn has_boot_state(layout: &HostLayout) -> bool {
    scratch_paths(layout).iter().any(|path| path.exists())
}

fn scratch_paths(layout: &HostLayout) -> [PathBuf; 5] {
    [
        layout.active_kernel_path(),
        layout.all_kernels_path(),
        layout.target_kernel_path(),
        layout.snap_boot_files_path(),
        layout.snap_boot_checksums_path(),
    ]
}

fn write_scratch(path: &Path, payload: String) -> Result<()> {
    write_file_atomic(path, payload.as_bytes())
        .with_context(|| format!("failed to write boot state: {}", path.display()))
}

fn read_single_value(path: &Path) -> Result<Option<String>> {
    Ok(read_optional_string(path)?
        .map(|raw| raw.trim().to_string())
        .filter(|value| !value.is_empty()))
}
