mod logging;
mod prompts;
mod provision;
mod recovery;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use raspi_exec::{CommandRunner, SystemRunner};
use raspi_host_linux::{discover, BlockDevice, HostPaths};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "raspi-maker")]
#[command(about = "Provision a Raspberry Pi SD card and USB thumb drive from a Raspbian image")]
#[command(version)]
struct Cli {
    /// More log output (-v debug, -vv trace); RUST_LOG overrides
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the disks the block-tree lister reports
    Devices {
        /// Print device summaries as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the partitions of one disk
    Partitions {
        /// Disk id, e.g. sdb
        id: String,
        /// Print /dev paths instead of kernel names
        #[arg(long)]
        full_paths: bool,
        /// Print the partition table rows (start, end, filesystem) instead
        #[arg(long)]
        table: bool,
        /// Run the table printer without sudo
        #[arg(long)]
        no_sudo: bool,
    },

    /// Flash, split and personalize an SD card plus thumb drive
    Provision(provision::ProvisionArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match cli.command {
        Commands::Devices { json } => list_devices(json),
        Commands::Partitions {
            id,
            full_paths,
            table,
            no_sudo,
        } => show_partitions(&id, full_paths, table, no_sudo),
        Commands::Provision(args) => provision::run(args),
    }
}

fn list_devices(json: bool) -> Result<()> {
    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner::new());
    let paths = HostPaths::default();
    let mut devices = Vec::new();
    for id in discover(runner.as_ref())? {
        match BlockDevice::probe(&id, Arc::clone(&runner), &paths) {
            Ok(device) => devices.push(device),
            Err(err) => tracing::debug!("skipping {}: {}", id, err),
        }
    }

    if json {
        let summaries: Vec<_> = devices.iter().map(BlockDevice::summary).collect();
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }
    for device in &devices {
        println!("{:<10} {}", device.id(), device);
    }
    Ok(())
}

fn show_partitions(id: &str, full_paths: bool, table: bool, no_sudo: bool) -> Result<()> {
    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner::new().with_sudo(!no_sudo));
    let device = BlockDevice::probe(id, runner, &HostPaths::default())
        .with_context(|| format!("probe {}", id))?;

    if table {
        for spec in device.partition_specs()? {
            println!(
                "{:>2} {:>10} {:>10} {:>10} {:<8} {:<10} {}",
                spec.number,
                spec.start,
                spec.end,
                spec.size,
                spec.kind,
                spec.filesystem,
                spec.flags.as_deref().unwrap_or("")
            );
        }
        return Ok(());
    }
    for partition in device.partitions(full_paths)? {
        println!("{}", partition);
    }
    Ok(())
}
