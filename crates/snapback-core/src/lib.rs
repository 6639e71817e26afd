mod checksum;
mod command;
mod fs_utils;
mod kernel;
mod layout;
mod volume;

pub use checksum::{sha256_file_hex, sha256_hex};
pub use command::{
    command_line, run_command, CommandExecutor, CommandFailure, SystemExecutor,
};
pub use fs_utils::{move_file, read_optional_string, remove_file_if_exists, write_file_atomic};
pub use kernel::{
    kernel_image_path, kernel_version_from_image, kernel_version_from_image_header,
    kernel_version_from_package, parse_installed_kernels, read_running_release,
    KERNEL_IMAGE_PREFIX,
};
pub use layout::HostLayout;
pub use volume::{
    default_snapshot_name, snapshot_volume_path, volume_name, SnapshotSize, SnapshotSpec,
    FULL_ORIGIN_EXTENTS,
};
