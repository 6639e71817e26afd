mod metadata;
mod set;
mod snapshot;

pub use metadata::{SnapshotMetadataStore, SnapshotRecord};
pub use set::{SetOperationReport, SnapshotFailure, SnapshotSet};
pub use snapshot::{Snapshot, SnapshotError, SnapshotState};

#[cfg(test)]
mod tests;
