use anyhow::{anyhow, Result};
use std::fmt;

pub const FULL_ORIGIN_EXTENTS: &str = "100%ORIGIN";

const SIZE_UNITS: &str = "bBsSkKmMgGtTpPeE";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SnapshotSize {
    FullOrigin,
    Explicit(String),
}

impl SnapshotSize {
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        if value.is_empty() || value.eq_ignore_ascii_case(FULL_ORIGIN_EXTENTS) {
            return Ok(Self::FullOrigin);
        }

        let digits = value
            .strip_suffix(|ch: char| SIZE_UNITS.contains(ch))
            .unwrap_or(value);
        let mut parts = digits.splitn(2, '.');
        let whole = parts.next().unwrap_or_default();
        let fraction = parts.next();
        let whole_ok = !whole.is_empty() && whole.chars().all(|ch| ch.is_ascii_digit());
        let fraction_ok = fraction
            .map(|part| !part.is_empty() && part.chars().all(|ch| ch.is_ascii_digit()))
            .unwrap_or(true);
        if !whole_ok || !fraction_ok {
            return Err(anyhow!("invalid snapshot size: '{value}'"));
        }

        Ok(Self::Explicit(value.to_string()))
    }

    /// Value stored under `size` in the snapshot metadata file. The full
    /// origin sentinel is stored as an empty value.
    pub fn as_metadata_value(&self) -> &str {
        match self {
            Self::FullOrigin => "",
            Self::Explicit(size) => size,
        }
    }

    pub fn lvcreate_args(&self) -> [&str; 2] {
        match self {
            Self::FullOrigin => ["-l", FULL_ORIGIN_EXTENTS],
            Self::Explicit(size) => ["--size", size.as_str()],
        }
    }
}

impl fmt::Display for SnapshotSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FullOrigin => f.write_str(FULL_ORIGIN_EXTENTS),
            Self::Explicit(size) => f.write_str(size),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotSpec {
    pub origin_volume: String,
    pub name: String,
    pub size: SnapshotSize,
}

impl SnapshotSpec {
    pub fn new(origin_volume: &str, name: Option<&str>, size: SnapshotSize) -> Result<Self> {
        validate_volume_path(origin_volume)?;
        let name = match name.map(str::trim).filter(|name| !name.is_empty()) {
            Some(name) => name.to_string(),
            None => default_snapshot_name(origin_volume),
        };
        validate_snapshot_name(&name)?;

        Ok(Self {
            origin_volume: origin_volume.to_string(),
            name,
            size,
        })
    }

    /// Accepted shapes: `<lv>`, `<lv>:<name>`, `<lv>:<name>:<size>`,
    /// `<lv>::<size>`.
    pub fn parse(value: &str) -> Result<Self> {
        let mut parts = value.splitn(3, ':');
        let origin = parts.next().unwrap_or_default().trim();
        let name = parts.next();
        let size = SnapshotSize::parse(parts.next().unwrap_or_default())?;
        Self::new(origin, name, size)
            .map_err(|err| anyhow!("invalid snapshot spec '{value}': {err}"))
    }

    pub fn path(&self) -> String {
        snapshot_volume_path(&self.origin_volume, &self.name)
    }
}

pub fn volume_name(volume: &str) -> &str {
    volume
        .rsplit_once('/')
        .map(|(_, name)| name)
        .unwrap_or(volume)
}

pub fn default_snapshot_name(origin_volume: &str) -> String {
    format!("snap_{}", volume_name(origin_volume))
}

/// Sibling of `origin_volume` named `name`: `/dev/vg0/root` + `s` gives
/// `/dev/vg0/s`.
pub fn snapshot_volume_path(origin_volume: &str, name: &str) -> String {
    match origin_volume.rsplit_once('/') {
        Some((parent, _)) if parent.is_empty() => format!("/{name}"),
        Some((parent, _)) => format!("{parent}/{name}"),
        None => name.to_string(),
    }
}

fn validate_volume_path(volume: &str) -> Result<()> {
    if volume.is_empty() {
        return Err(anyhow!("logical volume path must not be empty"));
    }
    if volume.chars().any(char::is_whitespace) {
        return Err(anyhow!("logical volume path must not contain whitespace"));
    }
    if volume_name(volume).is_empty() {
        return Err(anyhow!("logical volume path must name a volume: '{volume}'"));
    }
    Ok(())
}

fn validate_snapshot_name(name: &str) -> Result<()> {
    let valid_chars = name
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '+' | '_' | '.' | '-'));
    if !valid_chars || name.starts_with('-') || name == "." || name == ".." {
        return Err(anyhow!("invalid snapshot name: '{name}'"));
    }
    Ok(())
}
