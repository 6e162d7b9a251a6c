use raspi_core::PartitionRef;

/// Partitions of `device_id` from plain `lsblk` output, in tree order.
///
/// The device's own row is the first line containing `device_id`; its
/// partitions are the connector-indented lines right below it. Scanning stops
/// at the first non-child line after that, so a later device whose name merely
/// contains `device_id` is never picked up. Unknown devices and devices without
/// partitions both yield an empty list.
pub fn parse_tree_output(raw: &str, device_id: &str, full_paths: bool) -> Vec<PartitionRef> {
    let mut partitions = Vec::new();
    let mut seen = false;
    for line in raw.lines() {
        if !seen {
            if line.contains(device_id) {
                seen = true;
            }
            continue;
        }
        match child_name(line) {
            Some(name) if full_paths => partitions.push(PartitionRef::new(format!("/dev/{}", name))),
            Some(name) => partitions.push(PartitionRef::new(name)),
            None => break,
        }
    }
    partitions
}

/// Top-level rows whose TYPE column is `disk`, sorted and deduplicated.
pub fn parse_disk_ids(raw: &str) -> Vec<String> {
    let mut ids: Vec<String> = raw
        .lines()
        .filter(|line| !line.starts_with(char::is_whitespace) && child_name(line).is_none())
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            let name = tokens.next()?;
            tokens.any(|token| token == "disk").then(|| name.to_string())
        })
        .collect();
    ids.sort();
    ids.dedup();
    ids
}

/// Name token of a child row, accepting both the UTF-8 connectors and the
/// ASCII ones lsblk falls back to under a non-UTF-8 locale.
fn child_name(line: &str) -> Option<&str> {
    let mut rest = line;
    loop {
        let trimmed = rest.trim_start_matches([' ', '│']);
        match trimmed.strip_prefix("| ") {
            Some(next) => rest = next,
            None => {
                rest = trimmed;
                break;
            }
        }
    }
    let name = ["├─", "└─", "|-", "`-"]
        .iter()
        .find_map(|connector| rest.strip_prefix(connector))?;
    name.trim_start_matches('─').split_whitespace().next()
}
