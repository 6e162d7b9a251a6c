mod device;
mod error;
pub mod lsblk;
pub mod mounts;
pub mod parted;

pub use device::{discover, BlockDevice, HostPaths};
pub use error::{HostError, UnmountFailure};
pub use lsblk::{parse_disk_ids, parse_tree_output};
pub use mounts::{parse_mount_table, system_disk_ids, MountEntry};
pub use parted::{
    parse_partition_numbers, parse_partition_rows, parse_partition_table, parse_table_kind, TableError,
};
