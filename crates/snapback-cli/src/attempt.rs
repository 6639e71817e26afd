use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use snapback_core::{read_optional_string, write_file_atomic, HostLayout};
use tracing::debug;

pub const ATTEMPT_RECORD_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Prepared,
    Staging,
    Staged,
    RollingBack,
    RolledBack,
    Committed,
    Failed,
}

impl AttemptStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Prepared => "prepared",
            Self::Staging => "staging",
            Self::Staged => "staged",
            Self::RollingBack => "rolling_back",
            Self::RolledBack => "rolled_back",
            Self::Committed => "committed",
            Self::Failed => "failed",
        }
    }

    pub fn allows_stage(self) -> bool {
        matches!(
            self,
            Self::Prepared | Self::RolledBack | Self::Committed | Self::Failed
        )
    }

    pub fn allows_restore(self) -> bool {
        matches!(self, Self::Staged | Self::RollingBack)
    }

    pub fn allows_commit(self) -> bool {
        matches!(self, Self::Staged | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub version: u32,
    pub status: AttemptStatus,
    pub started_at_unix: u64,
    pub updated_at_unix: u64,
    #[serde(default)]
    pub active_kernel: Option<String>,
    #[serde(default)]
    pub target_kernel: Option<String>,
}

impl AttemptRecord {
    pub fn new(status: AttemptStatus, now_unix: u64) -> Self {
        Self {
            version: ATTEMPT_RECORD_VERSION,
            status,
            started_at_unix: now_unix,
            updated_at_unix: now_unix,
            active_kernel: None,
            target_kernel: None,
        }
    }
}

pub fn current_unix_timestamp() -> Result<u64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system time is before unix epoch")?
        .as_secs())
}

pub fn read_attempt_record(layout: &HostLayout) -> Result<Option<AttemptRecord>> {
    let path = layout.attempt_path();
    let Some(raw) = read_optional_string(&path)? else {
        return Ok(None);
    };
    let record = serde_json::from_str(&raw)
        .with_context(|| format!("failed parsing attempt record: {}", path.display()))?;
    Ok(Some(record))
}

pub fn write_attempt_record(layout: &HostLayout, record: &AttemptRecord) -> Result<PathBuf> {
    let path = layout.attempt_path();
    let payload = serde_json::to_string_pretty(record)
        .with_context(|| format!("failed to encode attempt record: {}", path.display()))?;
    write_file_atomic(&path, payload.as_bytes())
        .with_context(|| format!("failed to write attempt record: {}", path.display()))?;
    debug!(status = record.status.as_str(), "wrote attempt record");
    Ok(path)
}

/// Moves the attempt to `status`, creating the record when a host was staged
/// without one.
pub fn update_attempt_status(layout: &HostLayout, status: AttemptStatus) -> Result<AttemptRecord> {
    let now = current_unix_timestamp()?;
    let mut record =
        read_attempt_record(layout)?.unwrap_or_else(|| AttemptRecord::new(status, now));
    record.status = status;
    record.updated_at_unix = now;
    write_attempt_record(layout, &record)?;
    Ok(record)
}

pub fn ensure_stage_allowed(layout: &HostLayout) -> Result<()> {
    match read_attempt_record(layout)? {
        Some(record) if !record.status.allows_stage() => Err(anyhow!(
            "cannot stage (reason=attempt_in_progress status={}): run restore or commit first",
            record.status.as_str()
        )),
        _ => Ok(()),
    }
}

/// Checks `command` may run against the recorded attempt. Without a record,
/// `has_state` decides whether there is anything to act on.
pub fn ensure_attempt_allows(
    layout: &HostLayout,
    command: &str,
    allowed: fn(AttemptStatus) -> bool,
    has_state: bool,
) -> Result<Option<AttemptRecord>> {
    match read_attempt_record(layout)? {
        Some(record) if allowed(record.status) => Ok(Some(record)),
        Some(record) => Err(anyhow!(
            "cannot {command} (reason=attempt_status status={})",
            record.status.as_str()
        )),
        None if has_state => Ok(None),
        None => Err(anyhow!(
            "cannot {command} (reason=nothing_staged): no snapshot or boot state is recorded"
        )),
    }
}
