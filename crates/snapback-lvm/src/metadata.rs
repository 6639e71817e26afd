use anyhow::{anyhow, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use snapback_core::{snapshot_volume_path, write_file_atomic, SnapshotSize};
use tracing::{debug, warn};

const KEY_ORIGIN: &str = "origin_lv";
const KEY_NAME: &str = "name";
const KEY_SIZE: &str = "size";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    pub section: String,
    pub origin_volume: String,
    pub name: String,
    pub size: SnapshotSize,
}

impl SnapshotRecord {
    pub fn new(origin_volume: &str, name: &str, size: SnapshotSize) -> Self {
        Self {
            section: snapshot_volume_path(origin_volume, name),
            origin_volume: origin_volume.to_string(),
            name: name.to_string(),
            size,
        }
    }

    pub fn path(&self) -> String {
        snapshot_volume_path(&self.origin_volume, &self.name)
    }
}

/// Section-per-snapshot record of what was snapshotted. Every mutating call
/// rewrites the backing file atomically before returning.
#[derive(Debug, Clone)]
pub struct SnapshotMetadataStore {
    path: PathBuf,
    records: Vec<SnapshotRecord>,
}

impl SnapshotMetadataStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let records = Self::load(&path);
        Self { path, records }
    }

    pub fn load(path: &Path) -> Vec<SnapshotRecord> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Vec::new(),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "ignoring unreadable snapshot metadata");
                return Vec::new();
            }
        };

        match parse_metadata(&raw) {
            Ok(records) => records,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "ignoring malformed snapshot metadata");
                Vec::new()
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> &[SnapshotRecord] {
        &self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, section: &str) -> Option<&SnapshotRecord> {
        self.records.iter().find(|record| record.section == section)
    }

    pub fn save_all(&mut self, records: impl IntoIterator<Item = SnapshotRecord>) -> Result<()> {
        for record in records {
            match self
                .records
                .iter_mut()
                .find(|existing| existing.section == record.section)
            {
                Some(existing) => *existing = record,
                None => self.records.push(record),
            }
        }
        self.persist()
    }

    pub fn remove_all(&mut self, sections: Option<&[String]>) -> Result<()> {
        match sections {
            Some(sections) => self
                .records
                .retain(|record| !sections.iter().any(|section| *section == record.section)),
            None => self.records.clear(),
        }
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        write_file_atomic(&self.path, render_metadata(&self.records).as_bytes())?;
        debug!(
            path = %self.path.display(),
            sections = self.records.len(),
            "rewrote snapshot metadata"
        );
        Ok(())
    }
}

pub(crate) fn render_metadata(records: &[SnapshotRecord]) -> String {
    let mut payload = String::new();
    for record in records {
        payload.push_str(&format!("[{}]\n", record.section));
        payload.push_str(&format!("{KEY_ORIGIN} = {}\n", record.origin_volume));
        payload.push_str(&format!("{KEY_NAME} = {}\n", record.name));
        let size = record.size.as_metadata_value();
        if size.is_empty() {
            payload.push_str(&format!("{KEY_SIZE} =\n"));
        } else {
            payload.push_str(&format!("{KEY_SIZE} = {size}\n"));
        }
        payload.push('\n');
    }
    payload
}

struct Section {
    name: String,
    origin_volume: Option<String>,
    name_value: Option<String>,
    size: Option<String>,
}

pub(crate) fn parse_metadata(raw: &str) -> Result<Vec<SnapshotRecord>> {
    let mut sections: Vec<Section> = Vec::new();

    for (index, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if let Some(header) = line.strip_prefix('[') {
            let name = header
                .strip_suffix(']')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .ok_or_else(|| anyhow!("line {}: malformed section header", index + 1))?;
            if sections.iter().any(|section| section.name == name) {
                return Err(anyhow!("line {}: duplicate section '{name}'", index + 1));
            }
            sections.push(Section {
                name: name.to_string(),
                origin_volume: None,
                name_value: None,
                size: None,
            });
            continue;
        }

        let (key, value) = line
            .split_once('=')
            .or_else(|| line.split_once(':'))
            .ok_or_else(|| anyhow!("line {}: expected key = value", index + 1))?;
        let section = sections
            .last_mut()
            .ok_or_else(|| anyhow!("line {}: value outside of any section", index + 1))?;
        let value = value.trim().to_string();
        match key.trim() {
            KEY_ORIGIN => section.origin_volume = Some(value),
            KEY_NAME => section.name_value = Some(value),
            KEY_SIZE => section.size = Some(value),
            _ => {}
        }
    }

    let mut records = Vec::with_capacity(sections.len());
    for section in sections {
        let (Some(origin_volume), Some(name), Some(size)) =
            (section.origin_volume, section.name_value, section.size)
        else {
            warn!(section = %section.name, "dropping incomplete snapshot metadata section");
            continue;
        };
        let size = match SnapshotSize::parse(&size) {
            Ok(size) => size,
            Err(err) => {
                warn!(section = %section.name, error = %err, "dropping snapshot metadata section");
                continue;
            }
        };
        records.push(SnapshotRecord {
            section: section.name,
            origin_volume,
            name,
            size,
        });
    }
    Ok(records)
}
