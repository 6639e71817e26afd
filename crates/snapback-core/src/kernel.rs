use anyhow::{anyhow, Context, Result};
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::HostLayout;

pub const KERNEL_IMAGE_PREFIX: &str = "/boot/vmlinuz-";

const KERNEL_PACKAGE_PREFIX: &str = "kernel-";
const SETUP_HEADER_MAGIC_OFFSET: u64 = 514;
const SETUP_HEADER_VERSION_OFFSET: u64 = 526;
const SETUP_HEADER_BASE: u64 = 0x200;

pub fn kernel_image_path(version: &str) -> String {
    format!("{KERNEL_IMAGE_PREFIX}{version}")
}

pub fn kernel_version_from_image(path: &Path) -> Option<String> {
    let file_name = path.file_name()?.to_str()?;
    let version = file_name.strip_prefix("vmlinuz-")?;
    if version.is_empty() {
        return None;
    }
    Some(version.to_string())
}

/// Reads the version string out of an x86 bzImage setup header.
pub fn kernel_version_from_image_header(path: &Path) -> Result<Option<String>> {
    let mut file = File::open(path)
        .with_context(|| format!("failed to open kernel image: {}", path.display()))?;

    let mut magic = [0_u8; 4];
    file.seek(SeekFrom::Start(SETUP_HEADER_MAGIC_OFFSET))
        .and_then(|_| file.read_exact(&mut magic))
        .with_context(|| format!("failed to read setup header: {}", path.display()))?;
    if &magic != b"HdrS" {
        return Ok(None);
    }

    let mut offset = [0_u8; 2];
    file.seek(SeekFrom::Start(SETUP_HEADER_VERSION_OFFSET))
        .and_then(|_| file.read_exact(&mut offset))
        .with_context(|| format!("failed to read kernel version offset: {}", path.display()))?;
    let offset = u64::from(u16::from_le_bytes(offset));

    let mut buf = Vec::with_capacity(256);
    file.seek(SeekFrom::Start(offset + SETUP_HEADER_BASE))
        .with_context(|| format!("failed to seek kernel version: {}", path.display()))?;
    file.take(256)
        .read_to_end(&mut buf)
        .with_context(|| format!("failed to read kernel version: {}", path.display()))?;

    let uname = buf.split(|byte| *byte == 0).next().unwrap_or_default();
    let uname = String::from_utf8_lossy(uname);
    Ok(uname
        .split(' ')
        .next()
        .filter(|version| !version.is_empty())
        .map(str::to_string))
}

/// `kernel-3.10.0-1160.el7.x86_64` gives `3.10.0-1160.el7.x86_64`.
pub fn kernel_version_from_package(package: &str) -> Option<&str> {
    package
        .trim()
        .strip_prefix(KERNEL_PACKAGE_PREFIX)
        .filter(|version| !version.is_empty())
}

pub fn parse_installed_kernels(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with(KERNEL_PACKAGE_PREFIX) && !line.contains(' '))
        .map(str::to_string)
        .collect()
}

pub fn read_running_release(layout: &HostLayout) -> Result<String> {
    let path = layout.osrelease_path();
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("failed to read running kernel release: {}", path.display()))?;
    let release = raw.trim();
    if release.is_empty() {
        return Err(anyhow!(
            "running kernel release is empty: {}",
            path.display()
        ));
    }
    Ok(release.to_string())
}
