use raspi_exec::ExecError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnmountFailure {
    pub mount_point: String,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error("partition #{number} not found on {device}")]
    PartitionNotFound { device: String, number: u32 },

    #[error("unexpected partition table output for {device}: {detail}")]
    ParseAnomaly { device: String, detail: String },

    #[error("block device {0} not found")]
    DeviceNotFound(String),

    #[error("failed to read {}: {source}", .path.display())]
    Sysfs {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read mount table {}: {source}", .path.display())]
    MountTable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{device} still has mounts after unmount: {}", describe_failures(.failures))]
    UnmountFailed {
        device: String,
        failures: Vec<UnmountFailure>,
    },

    #[error(transparent)]
    Exec(#[from] ExecError),
}

fn describe_failures(failures: &[UnmountFailure]) -> String {
    failures
        .iter()
        .map(|failure| format!("{} ({})", failure.mount_point, failure.reason))
        .collect::<Vec<_>>()
        .join(", ")
}
