use anyhow::Result;

use snapback_core::{CommandExecutor, HostLayout, SnapshotSpec};
use tracing::{info, warn};

use crate::{Snapshot, SnapshotError, SnapshotMetadataStore};

#[derive(Debug)]
pub struct SnapshotFailure {
    pub snapshot: String,
    pub error: SnapshotError,
}

#[derive(Debug, Default)]
pub struct SetOperationReport {
    pub completed: Vec<String>,
    pub failures: Vec<SnapshotFailure>,
}

impl SetOperationReport {
    pub fn succeeded(&self) -> bool {
        self.failures.is_empty()
    }

    fn fail(&mut self, snapshot: String, error: SnapshotError) {
        warn!(snapshot = %snapshot, error = %error, "snapshot operation failed");
        self.failures.push(SnapshotFailure { snapshot, error });
    }
}

#[derive(Debug)]
pub struct SnapshotSet {
    members: Vec<Snapshot>,
    store: SnapshotMetadataStore,
}

impl SnapshotSet {
    pub fn load(layout: &HostLayout) -> Result<Self> {
        let mut store = SnapshotMetadataStore::open(layout.snapshot_metadata_path());
        let mut members = Vec::new();
        let mut stale = Vec::new();

        for record in store.records() {
            let device = layout.volume_device_path(&record.path());
            if device.exists() {
                members.push(Snapshot::from_record(record));
            } else {
                info!(snapshot = %record.section, "purging record of missing snapshot");
                stale.push(record.section.clone());
            }
        }
        if !stale.is_empty() {
            store.remove_all(Some(&stale))?;
        }

        Ok(Self { members, store })
    }

    /// Loads the recorded snapshots and registers the requested ones on top.
    /// The root spec is registered as well and marks every member sharing its
    /// origin as root.
    pub fn open(
        layout: &HostLayout,
        root: Option<&SnapshotSpec>,
        specs: &[SnapshotSpec],
    ) -> Result<Self> {
        let mut set = Self::load(layout)?;
        for spec in root.into_iter().chain(specs) {
            let is_root = root.is_some_and(|root| root.origin_volume == spec.origin_volume);
            set.register(spec, is_root)?;
        }
        Ok(set)
    }

    /// Adds `spec` unless an identical member exists. A member with the same
    /// path but different parameters is a conflict and leaves the set as is.
    pub fn register(&mut self, spec: &SnapshotSpec, is_root: bool) -> Result<(), SnapshotError> {
        let candidate = Snapshot::new(spec, is_root);
        let path = candidate.path();

        if is_root {
            if let Some(existing) = self
                .members
                .iter()
                .find(|member| member.is_root() && member.path() != path)
            {
                return Err(SnapshotError::MultipleRoots {
                    existing: existing.path(),
                    requested: path,
                });
            }
        }

        match self.members.iter_mut().find(|member| member.path() == path) {
            Some(existing) if *existing == candidate => {
                if is_root {
                    existing.mark_root();
                }
                Ok(())
            }
            Some(_) => Err(SnapshotError::Conflict { path }),
            None => {
                self.members.push(candidate);
                Ok(())
            }
        }
    }

    pub fn root_snapshot(&self) -> Option<&Snapshot> {
        self.members.iter().find(|member| member.is_root())
    }

    pub fn get(&self, path: &str) -> Option<&Snapshot> {
        self.members.iter().find(|member| member.path() == path)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Snapshot> {
        self.members.iter()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn store(&self) -> &SnapshotMetadataStore {
        &self.store
    }

    /// Creates every member in order. Either all members end up present and
    /// recorded, or every snapshot created by this call is removed again.
    pub fn create_snapshots(
        &mut self,
        executor: &mut dyn CommandExecutor,
    ) -> Result<SetOperationReport> {
        let mut report = SetOperationReport::default();
        let mut created = Vec::new();

        for index in 0..self.members.len() {
            let member = &mut self.members[index];
            if member.exists() {
                report.completed.push(member.path());
                continue;
            }
            match member.create(executor) {
                Ok(()) => {
                    report.completed.push(member.path());
                    created.push(index);
                }
                Err(err) => {
                    report.fail(member.path(), err);
                    self.discard_created(&created, executor, &mut report);
                    report.completed.clear();
                    return Ok(report);
                }
            }
        }

        let records: Vec<_> = self
            .members
            .iter()
            .filter(|member| member.exists())
            .map(Snapshot::record)
            .collect();
        if let Err(err) = self.store.save_all(records) {
            warn!(error = %err, "failed to record snapshots, removing the ones just created");
            let mut discarded = SetOperationReport::default();
            self.discard_created(&created, executor, &mut discarded);
            return Err(err);
        }

        Ok(report)
    }

    /// Removes every member, continuing past failures. Members that could not
    /// be removed stay recorded.
    pub fn remove_snapshots(
        &mut self,
        executor: &mut dyn CommandExecutor,
    ) -> Result<SetOperationReport> {
        let mut report = SetOperationReport::default();
        for member in &mut self.members {
            match member.remove(executor) {
                Ok(()) => report.completed.push(member.path()),
                Err(err) => report.fail(member.path(), err),
            }
        }

        if report.succeeded() {
            self.store.remove_all(None)?;
        } else {
            self.store.remove_all(Some(&report.completed))?;
        }
        Ok(report)
    }

    /// Merges every member back into its origin, continuing past failures,
    /// then forgets all records.
    pub fn restore_snapshots(
        &mut self,
        executor: &mut dyn CommandExecutor,
    ) -> Result<SetOperationReport> {
        let mut report = SetOperationReport::default();
        for member in &mut self.members {
            match member.merge(executor) {
                Ok(()) => report.completed.push(member.path()),
                Err(err) => report.fail(member.path(), err),
            }
        }

        self.store.remove_all(None)?;
        Ok(report)
    }

    fn discard_created(
        &mut self,
        created: &[usize],
        executor: &mut dyn CommandExecutor,
        report: &mut SetOperationReport,
    ) {
        for &index in created.iter().rev() {
            let member = &mut self.members[index];
            if let Err(err) = member.remove(executor) {
                report.fail(member.path(), err);
            }
        }
    }
}
