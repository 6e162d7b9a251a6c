use crate::lsblk::{parse_disk_ids, parse_tree_output};
use crate::mounts::{mount_points_for, read_mount_table};
use crate::parted::{
    parse_partition_numbers, parse_partition_rows, parse_partition_table, parse_table_kind, TableError,
};
use crate::{HostError, UnmountFailure};
use raspi_core::{human_size, size_bytes_from_sectors, DeviceSummary, PartitionRef, PartitionSpec};
use raspi_exec::{CommandRequest, CommandRunner};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct HostPaths {
    pub sysfs_block: PathBuf,
    pub mount_table: PathBuf,
}

impl Default for HostPaths {
    fn default() -> Self {
        Self {
            sysfs_block: PathBuf::from("/sys/block"),
            mount_table: PathBuf::from("/etc/mtab"),
        }
    }
}

/// Top-level disk ids reported by the block-tree lister, sorted.
pub fn discover(runner: &dyn CommandRunner) -> Result<Vec<String>, HostError> {
    let raw = list_tree(runner)?;
    Ok(parse_disk_ids(&raw))
}

fn list_tree(runner: &dyn CommandRunner) -> Result<String, HostError> {
    Ok(runner.capture(&CommandRequest::batch(["lsblk"]))?)
}

/// One physical block device. Identity and metadata are read once; everything
/// about partitions and mounts is re-queried on every call because the
/// provisioning stages keep changing it.
#[derive(Clone)]
pub struct BlockDevice {
    id: String,
    path: String,
    size_bytes: u64,
    human_size: String,
    vendor: String,
    model: String,
    runner: Arc<dyn CommandRunner>,
    paths: HostPaths,
}

impl BlockDevice {
    pub fn probe(
        id: &str,
        runner: Arc<dyn CommandRunner>,
        paths: &HostPaths,
    ) -> Result<Self, HostError> {
        let id = id.strip_prefix("/dev/").unwrap_or(id);
        let root = paths.sysfs_block.join(id);
        if id.is_empty() || !root.is_dir() {
            return Err(HostError::DeviceNotFound(id.to_string()));
        }
        let size_bytes = read_sector_count(&root.join("size")).map(size_bytes_from_sectors)?;
        let vendor = read_string(root.join("device/vendor")).unwrap_or_else(|| id.to_string());
        let model = read_string(root.join("device/model")).unwrap_or_else(|| id.to_string());
        Ok(Self {
            id: id.to_string(),
            path: format!("/dev/{}", id),
            size_bytes,
            human_size: human_size(size_bytes),
            vendor,
            model,
            runner,
            paths: paths.clone(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn human_size(&self) -> &str {
        &self.human_size
    }

    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn runner(&self) -> &dyn CommandRunner {
        self.runner.as_ref()
    }

    pub fn summary(&self) -> DeviceSummary {
        DeviceSummary {
            id: self.id.clone(),
            path: self.path.clone(),
            size_bytes: self.size_bytes,
            human_size: self.human_size.clone(),
            vendor: self.vendor.clone(),
            model: self.model.clone(),
        }
    }

    pub fn partitions(&self, full_paths: bool) -> Result<Vec<PartitionRef>, HostError> {
        let raw = list_tree(self.runner())?;
        Ok(parse_tree_output(&raw, &self.id, full_paths))
    }

    /// Raw output of the lister, kept for failure reports.
    pub fn tree_snapshot(&self) -> Result<String, HostError> {
        list_tree(self.runner())
    }

    pub fn partition_spec(&self, number: u32) -> Result<PartitionSpec, HostError> {
        let raw = self.print_table()?;
        parse_partition_table(&raw, number).map_err(|err| self.table_error(err))
    }

    /// All printer rows. A device the lister shows without partitions is
    /// answered without running the printer, which fails on a blank disk.
    pub fn partition_specs(&self) -> Result<Vec<PartitionSpec>, HostError> {
        if self.partitions(false)?.is_empty() {
            return Ok(Vec::new());
        }
        let raw = self.print_table()?;
        parse_partition_rows(&raw).map_err(|err| self.table_error(err))
    }

    /// Partition numbers the printer lists, including partitions without a
    /// file system. Blank devices skip the printer like [`Self::partition_specs`].
    pub fn partition_numbers(&self) -> Result<Vec<u32>, HostError> {
        if self.partitions(false)?.is_empty() {
            return Ok(Vec::new());
        }
        Ok(parse_partition_numbers(&self.print_table()?))
    }

    /// Label of the partition table, `None` on a disk without one.
    pub fn partition_table_kind(&self) -> Result<Option<String>, HostError> {
        let request = CommandRequest::batch(["parted", self.path.as_str(), "unit", "s", "print"])
            .privileged()
            .accept_exit_codes(&[0, 1]);
        Ok(parse_table_kind(&self.runner.capture(&request)?))
    }

    pub fn mount_points(&self) -> Result<Vec<String>, HostError> {
        let entries = read_mount_table(&self.paths.mount_table)?;
        let mut mounts = Vec::new();
        for partition in self.partitions(false)? {
            mounts.extend(mount_points_for(&entries, &partition));
        }
        Ok(mounts)
    }

    /// Unmounts every mount of every partition, deepest mount point first.
    ///
    /// Every mount is attempted. A failed unmount whose target has vanished
    /// from the mount table by the end is treated as the benign race it is;
    /// anything still mounted is reported as [`HostError::UnmountFailed`].
    pub fn unmount_all(&self) -> Result<Vec<String>, HostError> {
        let mut mounts = self.mount_points()?;
        mounts.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        mounts.dedup();

        let mut unmounted = Vec::new();
        let mut failed = Vec::new();
        for mount in mounts {
            info!("unmounting {}", mount);
            let request = CommandRequest::batch(["umount", mount.as_str()]).privileged();
            match self.runner.run(&request) {
                Ok(_) => unmounted.push(mount),
                Err(err) => {
                    warn!("unmount of {} failed: {}", mount, err);
                    failed.push(UnmountFailure {
                        mount_point: mount,
                        reason: err.to_string(),
                    });
                }
            }
        }
        if failed.is_empty() {
            return Ok(unmounted);
        }

        let remaining = self.mount_points()?;
        let failures: Vec<UnmountFailure> = failed
            .into_iter()
            .filter(|failure| remaining.contains(&failure.mount_point))
            .collect();
        if failures.is_empty() {
            Ok(unmounted)
        } else {
            Err(HostError::UnmountFailed {
                device: self.path.clone(),
                failures,
            })
        }
    }

    fn print_table(&self) -> Result<String, HostError> {
        let request = CommandRequest::batch(["parted", self.path.as_str(), "unit", "s", "print"]).privileged();
        Ok(self.runner.capture(&request)?)
    }

    fn table_error(&self, err: TableError) -> HostError {
        match err {
            TableError::PartitionNotFound(number) => HostError::PartitionNotFound {
                device: self.path.clone(),
                number,
            },
            other => HostError::ParseAnomaly {
                device: self.path.clone(),
                detail: other.to_string(),
            },
        }
    }
}

impl fmt::Display for BlockDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.vendor, self.model, self.human_size)
    }
}

impl fmt::Debug for BlockDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockDevice")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("size_bytes", &self.size_bytes)
            .field("vendor", &self.vendor)
            .field("model", &self.model)
            .finish()
    }
}

fn read_sector_count(path: &Path) -> Result<u64, HostError> {
    let raw = fs::read_to_string(path).map_err(|source| HostError::Sysfs {
        path: path.to_path_buf(),
        source,
    })?;
    raw.trim().parse::<u64>().map_err(|err| HostError::Sysfs {
        path: path.to_path_buf(),
        source: io::Error::new(io::ErrorKind::InvalidData, err),
    })
}

fn read_string(path: impl AsRef<Path>) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
