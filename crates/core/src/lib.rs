use serde::{Deserialize, Serialize};
use std::fmt;
use time::format_description::well_known::Rfc3339;

pub const RUN_SCHEMA_VERSION: &str = "1.0.0";

/// Sector size the kernel uses for `/sys/block/<id>/size`, regardless of the
/// device's logical sector size.
pub const SECTOR_SIZE: u64 = 512;

const UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];

/// A partition as listed by the block-tree lister.
///
/// `name` is either the short kernel name (`sdc1`) or, when full paths were
/// requested, the device file (`/dev/sdc1`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionRef {
    pub name: String,
}

impl PartitionRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// Short kernel name with any `/dev/` prefix removed.
    pub fn kernel_name(&self) -> &str {
        self.name.strip_prefix("/dev/").unwrap_or(&self.name)
    }

    pub fn device_path(&self) -> String {
        format!("/dev/{}", self.kernel_name())
    }
}

impl fmt::Display for PartitionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl PartialEq<&str> for PartitionRef {
    fn eq(&self, other: &&str) -> bool {
        self.name == *other
    }
}

/// One row of the partition-table printer (`parted DEV unit s print`).
///
/// Geometry stays in the printer's own sector-unit strings (`8192s`) so it can
/// be handed back to the partition editor unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSpec {
    pub number: u32,
    pub start: String,
    pub end: String,
    pub size: String,
    pub kind: String,
    pub filesystem: String,
    pub flags: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct DeviceSummary {
    pub id: String,
    pub path: String,
    pub size_bytes: u64,
    pub human_size: String,
    pub vendor: String,
    pub model: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Completed,
    ResolvedManually,
    Aborted,
    Skipped,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StageRecord {
    pub stage: String,
    pub status: StageStatus,
    pub duration_ms: u128,
    pub error: Option<String>,
    pub notes: Vec<String>,
}

pub fn size_bytes_from_sectors(sectors: u64) -> u64 {
    sectors.saturating_mul(SECTOR_SIZE)
}

/// Renders a byte count as `<integer><unit>`, dividing by 1024 until the value
/// drops under 1024 and truncating the remainder. Negative input is taken by
/// absolute value. Output never exceeds five characters: a scaled value of
/// 1000 to 1023 is clamped to `999` of that unit, and so is anything past the
/// petabyte range. Plain bytes need no clamp since `B` is a single letter.
pub fn human_size(bytes: impl Into<i128>) -> String {
    let mut size = bytes.into().unsigned_abs();
    let mut unit = 0;
    while size >= 1024 && unit < UNITS.len() - 1 {
        size /= 1024;
        unit += 1;
    }
    if unit > 0 {
        size = size.min(999);
    }
    format!("{}{}", size, UNITS[unit])
}

pub fn now_utc_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}
