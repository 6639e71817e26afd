use std::process::Command;

use snapback_core::{
    snapshot_volume_path, CommandExecutor, CommandFailure, SnapshotSize, SnapshotSpec,
};
use thiserror::Error;
use tracing::info;

use crate::SnapshotRecord;

/// Marker `lvconvert` prints when the merge waits for the origin to be
/// reactivated.
const DEFERRED_MERGE_MARKER: &str = "next activation";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotState {
    Absent,
    Present,
    MergePending,
}

impl SnapshotState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Present => "present",
            Self::MergePending => "merge_pending",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    #[error(transparent)]
    Command(#[from] CommandFailure),
    #[error("snapshot {path} is not present")]
    NotPresent { path: String },
    #[error("snapshot {path} already exists with different parameters, run clean-snapshots first")]
    Conflict { path: String },
    #[error("snapshot {requested} cannot be the root snapshot, {existing} already is")]
    MultipleRoots { existing: String, requested: String },
}

#[derive(Debug, Clone)]
pub struct Snapshot {
    origin_volume: String,
    name: String,
    size: SnapshotSize,
    is_root: bool,
    state: SnapshotState,
}

impl Snapshot {
    pub fn new(spec: &SnapshotSpec, is_root: bool) -> Self {
        Self {
            origin_volume: spec.origin_volume.clone(),
            name: spec.name.clone(),
            size: spec.size.clone(),
            is_root,
            state: SnapshotState::Absent,
        }
    }

    pub(crate) fn from_record(record: &SnapshotRecord) -> Self {
        Self {
            origin_volume: record.origin_volume.clone(),
            name: record.name.clone(),
            size: record.size.clone(),
            is_root: false,
            state: SnapshotState::Present,
        }
    }

    pub fn origin_volume(&self) -> &str {
        &self.origin_volume
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> &SnapshotSize {
        &self.size
    }

    pub fn path(&self) -> String {
        snapshot_volume_path(&self.origin_volume, &self.name)
    }

    pub fn is_root(&self) -> bool {
        self.is_root
    }

    pub fn state(&self) -> SnapshotState {
        self.state
    }

    pub fn exists(&self) -> bool {
        self.state == SnapshotState::Present
    }

    pub fn record(&self) -> SnapshotRecord {
        SnapshotRecord::new(&self.origin_volume, &self.name, self.size.clone())
    }

    pub(crate) fn mark_root(&mut self) {
        self.is_root = true;
    }

    pub fn create(&mut self, executor: &mut dyn CommandExecutor) -> Result<(), SnapshotError> {
        if self.exists() {
            return Ok(());
        }

        let mut command = Command::new("lvcreate");
        command
            .args(self.size.lvcreate_args())
            .args(["--snapshot", "--name", self.name.as_str()])
            .arg(&self.origin_volume);
        executor.execute(
            &mut command,
            &format!("failed to create snapshot {}", self.path()),
        )?;

        self.state = SnapshotState::Present;
        info!(snapshot = %self.path(), origin = %self.origin_volume, size = %self.size, "created snapshot");
        Ok(())
    }

    pub fn remove(&mut self, executor: &mut dyn CommandExecutor) -> Result<(), SnapshotError> {
        if !self.exists() {
            return Ok(());
        }

        let path = self.path();
        let mut command = Command::new("lvremove");
        command.args(["-f", path.as_str()]);
        executor.execute(&mut command, &format!("failed to remove snapshot {path}"))?;

        self.state = SnapshotState::Absent;
        info!(snapshot = %path, "removed snapshot");
        Ok(())
    }

    /// Merges the snapshot back into its origin. A root volume merge is
    /// always deferred until reboot.
    pub fn merge(&mut self, executor: &mut dyn CommandExecutor) -> Result<(), SnapshotError> {
        let path = self.path();
        if !self.exists() {
            return Err(SnapshotError::NotPresent { path });
        }

        let mut command = Command::new("lvconvert");
        command.args(["--merge", path.as_str()]);
        let output = executor.execute(&mut command, &format!("failed to merge snapshot {path}"))?;

        self.state = if self.is_root || output.contains(DEFERRED_MERGE_MARKER) {
            SnapshotState::MergePending
        } else {
            SnapshotState::Absent
        };
        info!(snapshot = %path, state = self.state.as_str(), "merged snapshot");
        Ok(())
    }
}

impl PartialEq for Snapshot {
    fn eq(&self, other: &Self) -> bool {
        self.origin_volume == other.origin_volume
            && self.name == other.name
            && self.size == other.size
    }
}

impl Eq for Snapshot {}
