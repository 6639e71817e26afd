mod backup;
mod bootloader;
mod grub;
mod state;

pub use backup::{
    boot_file_names, BootBackup, BootEntryBackup, DEFAULT_RESTORE_MARKER, DEFAULT_ROLLBACK_TITLE,
    SNAPSHOT_SUFFIX,
};
pub use bootloader::{
    build_grubby_remove_kernel_command, build_new_kernel_pkg_install_command,
    build_new_kernel_pkg_update_command, install_upgrade_entry, remove_kernel_entry,
    UPGRADE_BANNER, UPGRADE_KERNEL_ARGS, UPGRADE_REMOVED_ARGS,
};
pub use grub::{EntryLine, GrubConfig, GrubEntry};
pub use state::{
    clear_boot_state, has_boot_state, read_active_kernel, read_all_kernels, read_boot_checksums,
    read_boot_state, read_snap_boot_files, read_target_kernel, write_active_kernel,
    write_all_kernels, write_boot_checksums, write_snap_boot_files, write_target_kernel,
    BootChecksums, BootState,
};
