use anyhow::{Context, Result};
use std::fs;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostLayout {
    root: PathBuf,
    grub_conf: Option<PathBuf>,
}

impl HostLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            grub_conf: None,
        }
    }

    /// Overrides the bootloader configuration location. `path` is a host
    /// absolute path such as `/boot/grub/menu.lst`.
    pub fn with_grub_conf(mut self, path: impl AsRef<Path>) -> Self {
        self.grub_conf = Some(self.host_path(path));
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn host_path(&self, path: impl AsRef<Path>) -> PathBuf {
        let mut resolved = self.root.clone();
        for component in path.as_ref().components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::ParentDir => resolved.push(".."),
                Component::RootDir | Component::Prefix(_) | Component::CurDir => {}
            }
        }
        resolved
    }

    pub fn host_display(&self, path: &Path) -> String {
        match path.strip_prefix(&self.root) {
            Ok(relative) => format!("/{}", relative.display()),
            Err(_) => path.display().to_string(),
        }
    }

    pub fn boot_dir(&self) -> PathBuf {
        self.host_path("/boot")
    }

    pub fn dev_dir(&self) -> PathBuf {
        self.host_path("/dev")
    }

    pub fn grub_dir(&self) -> PathBuf {
        self.boot_dir().join("grub")
    }

    pub fn grub_conf_path(&self) -> PathBuf {
        self.grub_conf
            .clone()
            .unwrap_or_else(|| self.grub_dir().join("grub.conf"))
    }

    pub fn grub_conf_backup_path(&self) -> PathBuf {
        let mut raw = self.grub_conf_path().into_os_string();
        raw.push(".preupg");
        PathBuf::from(raw)
    }

    pub fn snapshot_metadata_path(&self) -> PathBuf {
        self.grub_dir().join("snapshot.metadata")
    }

    pub fn rollback_dir(&self) -> PathBuf {
        self.boot_dir().join("rollback")
    }

    pub fn active_kernel_path(&self) -> PathBuf {
        self.rollback_dir().join(".active-kernel")
    }

    pub fn all_kernels_path(&self) -> PathBuf {
        self.rollback_dir().join(".all-kernels")
    }

    pub fn target_kernel_path(&self) -> PathBuf {
        self.rollback_dir().join(".target-kernel")
    }

    pub fn snap_boot_files_path(&self) -> PathBuf {
        self.rollback_dir().join(".snap_boot_files")
    }

    pub fn snap_boot_checksums_path(&self) -> PathBuf {
        self.rollback_dir().join(".snap_boot_checksums")
    }

    pub fn attempt_path(&self) -> PathBuf {
        self.rollback_dir().join("attempt.json")
    }

    pub fn osrelease_path(&self) -> PathBuf {
        self.host_path("/proc/sys/kernel/osrelease")
    }

    pub fn boot_artifact_path(&self, file_name: &str) -> PathBuf {
        self.boot_dir().join(file_name)
    }

    pub fn volume_device_path(&self, volume: &str) -> PathBuf {
        if volume.starts_with('/') {
            self.host_path(volume)
        } else {
            self.dev_dir().join(volume)
        }
    }

    pub fn ensure_rollback_dirs(&self) -> Result<()> {
        for dir in [self.grub_dir(), self.rollback_dir()] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        if let Some(parent) = self.grub_conf_path().parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        Ok(())
    }
}
