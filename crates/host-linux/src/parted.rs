use raspi_core::PartitionSpec;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TableError {
    #[error("partition #{0} not found")]
    PartitionNotFound(u32),

    #[error("partition row {number} is missing columns: {line:?}")]
    MissingColumns { number: u32, line: String },
}

/// Row `number` of `parted DEV unit s print` output.
///
/// Only lines whose first token is an integer are data rows; headers, disk
/// metadata and blank lines are skipped. Flags are optional and become `None`
/// when the row ends after the file system column.
pub fn parse_partition_table(raw: &str, number: u32) -> Result<PartitionSpec, TableError> {
    for line in raw.lines() {
        match row_number(line) {
            Some(found) if found == number => return parse_row(line, found),
            _ => continue,
        }
    }
    Err(TableError::PartitionNotFound(number))
}

/// Every data row, in printer order.
pub fn parse_partition_rows(raw: &str) -> Result<Vec<PartitionSpec>, TableError> {
    raw.lines()
        .filter_map(|line| row_number(line).map(|number| parse_row(line, number)))
        .collect()
}

/// Numbers of every data row. Rows missing the file system column, as parted
/// prints them for unformatted partitions, still count.
pub fn parse_partition_numbers(raw: &str) -> Vec<u32> {
    raw.lines().filter_map(row_number).collect()
}

/// The label parted reports on its `Partition Table:` line, or `None` when the
/// disk carries no recognised table.
pub fn parse_table_kind(raw: &str) -> Option<String> {
    raw.lines()
        .find_map(|line| line.trim().strip_prefix("Partition Table:"))
        .map(str::trim)
        .filter(|kind| !kind.is_empty() && *kind != "unknown")
        .map(str::to_string)
}

fn row_number(line: &str) -> Option<u32> {
    line.split_whitespace().next()?.parse::<u32>().ok()
}

fn parse_row(line: &str, number: u32) -> Result<PartitionSpec, TableError> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < 6 {
        return Err(TableError::MissingColumns {
            number,
            line: line.trim().to_string(),
        });
    }
    // parted separates multiple flags with ", ", which whitespace splitting breaks apart.
    let flags = (tokens.len() > 6).then(|| tokens[6..].join(" "));
    Ok(PartitionSpec {
        number,
        start: tokens[1].to_string(),
        end: tokens[2].to_string(),
        size: tokens[3].to_string(),
        kind: tokens[4].to_string(),
        filesystem: tokens[5].to_string(),
        flags,
    })
}
