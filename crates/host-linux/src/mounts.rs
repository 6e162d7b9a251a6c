use crate::{HostError, HostPaths};
use raspi_core::PartitionRef;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub mount_point: String,
    pub fs_type: String,
}

pub fn parse_mount_table(data: &str) -> Vec<MountEntry> {
    let mut entries = Vec::new();
    for line in data.lines() {
        let mut parts = line.split_whitespace();
        let (Some(source), Some(mount_point), Some(fs_type)) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        entries.push(MountEntry {
            source: unescape_mount(source),
            mount_point: unescape_mount(mount_point),
            fs_type: fs_type.to_string(),
        });
    }
    entries
}

pub fn read_mount_table(path: &Path) -> Result<Vec<MountEntry>, HostError> {
    let data = fs::read_to_string(path).map_err(|source| HostError::MountTable {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(parse_mount_table(&data))
}

/// Mount points whose source is exactly this partition.
pub fn mount_points_for(entries: &[MountEntry], partition: &PartitionRef) -> Vec<String> {
    let name = partition.kernel_name();
    let path = partition.device_path();
    entries
        .iter()
        .filter(|entry| entry.source == path || entry.source == name)
        .map(|entry| entry.mount_point.clone())
        .collect()
}

/// Disks holding the host's `/` mount.
///
/// Device-mapper and md roots (`/dev/mapper/vg-root`, `/dev/dm-0`, `/dev/md0`)
/// are followed through their sysfs `slaves/` links down to the partitions
/// underneath, so an LVM or LUKS root still reserves its physical disk.
pub fn system_disk_ids(paths: &HostPaths) -> Result<Vec<String>, HostError> {
    let entries = read_mount_table(&paths.mount_table)?;
    let roots: Vec<&str> = entries
        .iter()
        .filter(|entry| entry.mount_point == "/")
        .filter_map(|entry| entry.source.strip_prefix("/dev/"))
        .collect();
    if roots.is_empty() {
        return Ok(Vec::new());
    }

    let block = &paths.sysfs_block;
    let disks: Vec<String> = fs::read_dir(block)
        .map_err(|source| HostError::Sysfs {
            path: block.clone(),
            source,
        })?
        .flatten()
        .map(|entry| entry.file_name().to_string_lossy().to_string())
        .collect();

    let mut leaves = BTreeSet::new();
    for root in roots {
        let name = match root.strip_prefix("mapper/") {
            Some(mapped) => {
                mapper_device(block, &disks, mapped).unwrap_or_else(|| mapped.to_string())
            }
            None => file_name(root),
        };
        collect_leaves(block, &name, &mut BTreeSet::new(), &mut leaves);
    }

    let mut ids: Vec<String> = disks
        .into_iter()
        .filter(|disk| {
            leaves
                .iter()
                .any(|leaf| leaf == disk || block.join(disk).join(leaf).exists())
        })
        .collect();
    ids.sort();
    Ok(ids)
}

fn file_name(device: &str) -> String {
    Path::new(device)
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| device.to_string())
}

/// The `dm-N` entry whose `dm/name` is `mapped`.
fn mapper_device(block: &Path, disks: &[String], mapped: &str) -> Option<String> {
    disks
        .iter()
        .filter(|disk| disk.starts_with("dm-"))
        .find(|disk| {
            fs::read_to_string(block.join(disk).join("dm/name"))
                .map(|name| name.trim() == mapped)
                .unwrap_or(false)
        })
        .cloned()
}

fn collect_leaves(
    block: &Path,
    name: &str,
    seen: &mut BTreeSet<String>,
    leaves: &mut BTreeSet<String>,
) {
    if !seen.insert(name.to_string()) {
        return;
    }
    let slaves: Vec<String> = fs::read_dir(block.join(name).join("slaves"))
        .map(|dir| {
            dir.flatten()
                .map(|entry| entry.file_name().to_string_lossy().to_string())
                .collect()
        })
        .unwrap_or_default();
    if slaves.is_empty() {
        leaves.insert(name.to_string());
        return;
    }
    for slave in slaves {
        collect_leaves(block, &slave, seen, leaves);
    }
}

/// Decodes the kernel's `\NNN` octal escapes. Escapes are raw bytes, so a
/// multi-byte character arrives as several of them and is reassembled here.
fn unescape_mount(value: &str) -> String {
    let mut output: Vec<u8> = Vec::with_capacity(value.len());
    let mut chars = value.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            let mut buf = [0u8; 4];
            output.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
            continue;
        }
        let mut octal = String::new();
        while octal.len() < 3 {
            match chars.peek() {
                Some(next) if next.is_digit(8) => {
                    octal.push(*next);
                    chars.next();
                }
                _ => break,
            }
        }
        match u8::from_str_radix(&octal, 8) {
            Ok(byte) if octal.len() == 3 => output.push(byte),
            _ => {
                output.push(b'\\');
                output.extend_from_slice(octal.as_bytes());
            }
        }
    }
    String::from_utf8_lossy(&output).into_owned()
}
