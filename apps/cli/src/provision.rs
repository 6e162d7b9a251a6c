use crate::prompts::{Prompter, SD_CARD_PROMPT, THUMB_DRIVE_PROMPT};
use crate::recovery::TerminalRecovery;
use anyhow::{anyhow, bail, Context, Result};
use clap::Args;
use raspi_content::{expand_home, locate_image, resolve_config, RaspiConfig, WirelessConfig};
use raspi_core::StageStatus;
use raspi_exec::{CommandRunner, SystemRunner};
use raspi_host_linux::{discover, system_disk_ids, BlockDevice, HostPaths};
use raspi_workflow_engine::{
    run_provisioning, FailFast, OperatorIdentity, Personalization, PipelineError, ProvisionParams,
    RecoveryHandler,
};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Default, Args)]
pub(crate) struct ProvisionArgs {
    /// YAML configuration file (defaults to ./raspi-maker.yaml when present)
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// SD card device id, e.g. mmcblk0
    #[arg(long)]
    pub sd_card: Option<String>,
    /// Thumb drive device id, e.g. sdb
    #[arg(long)]
    pub thumb_drive: Option<String>,
    /// Disk image to flash
    #[arg(long)]
    pub image: Option<PathBuf>,
    /// Expected SHA-256 of the image; the run is refused on mismatch
    #[arg(long)]
    pub image_sha256: Option<String>,
    /// Login name for the Pi
    #[arg(long)]
    pub user: Option<String>,
    /// Hostname for the Pi
    #[arg(long)]
    pub hostname: Option<String>,
    /// Wireless network name
    #[arg(long)]
    pub ssid: Option<String>,
    /// Wireless passphrase (prompted when an ssid is given without one)
    #[arg(long)]
    pub psk: Option<String>,
    /// Public key to authorize for the Pi user
    #[arg(long)]
    pub public_key: Option<PathBuf>,
    /// Skip the final confirmation
    #[arg(long, short = 'y')]
    pub yes: bool,
    /// Abort on the first failed stage instead of offering a recovery shell
    #[arg(long)]
    pub fail_fast: bool,
    /// Run privileged commands without sudo (already root)
    #[arg(long)]
    pub no_sudo: bool,
    /// Directory the reports/ folder is written under
    #[arg(long)]
    pub report_base: Option<PathBuf>,
}

struct Plan {
    sd_card: BlockDevice,
    thumb_drive: BlockDevice,
    personalization: Personalization,
}

pub(crate) fn run(args: ProvisionArgs) -> Result<()> {
    let config = apply_overrides(resolve_config(args.config.as_deref())?, &args)?;
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let image = locate_image(&config.image, home.as_deref())?;
    let public_key = match &config.public_key {
        Some(path) => expand_home(path, home.as_deref()),
        None => default_public_key(home.as_deref())?,
    };
    let operator = operator_from(std::env::var("SUDO_USER").ok(), std::env::var("USER").ok())
        .ok_or_else(|| anyhow!("cannot tell who is running this: neither SUDO_USER nor USER is set"))?;

    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner::new().with_sudo(config.use_sudo));
    let paths = HostPaths::default();
    let system = system_disk_ids(&paths).context("detect the disks holding /")?;
    let reserved = reserved_devices(&config.root_devices, system);
    info!(reserved = %reserved.join(","), "devices excluded from selection");

    let probe = |id: &str| {
        BlockDevice::probe(id, Arc::clone(&runner), &paths).with_context(|| format!("probe {}", id))
    };

    // The prompter holds the stdin lock; it has to be gone before the
    // recovery handler reads from stdin.
    let plan = {
        let stdin = io::stdin();
        let mut prompter = Prompter::new(stdin.lock(), io::stdout());
        let candidates = if config.devices.sd_card.is_some() && config.devices.thumb_drive.is_some() {
            Vec::new()
        } else {
            candidate_devices(&runner, &paths, &reserved)?
        };
        let plan = gather(&config, candidates, &probe, &mut prompter)?;
        print_plan(prompter.output(), &plan, &image)?;
        if !args.yes && !prompter.confirm("Are you sure?")? {
            writeln!(prompter.output(), "Nothing was changed.")?;
            return Ok(());
        }
        plan
    };

    let params = ProvisionParams {
        image,
        image_sha256: config.image.sha256.clone(),
        personalization: plan.personalization,
        operator: OperatorIdentity {
            user: operator,
            public_key,
        },
        target: config.target.clone(),
        image_defaults: config.image_defaults.clone(),
        root_devices: reserved,
        confirmed: true,
        report_base: config.report_dir.clone(),
        scratch_base: std::env::temp_dir(),
    };
    let mut recovery: Box<dyn RecoveryHandler> = if args.fail_fast {
        Box::new(FailFast)
    } else {
        Box::new(TerminalRecovery::from_env())
    };

    match run_provisioning(&plan.sd_card, &plan.thumb_drive, &params, recovery.as_mut()) {
        Ok(result) => {
            for record in &result.stages {
                println!("{:<22} {}", record.stage, status_label(record.status));
            }
            println!("report: {}", result.report.root.display());
            Ok(())
        }
        Err(err) => {
            if let PipelineError::Aborted {
                report: Some(report),
                ..
            } = &err
            {
                eprintln!("report: {}", report.root.display());
            }
            Err(err.into())
        }
    }
}

/// Flags win over the file.
fn apply_overrides(mut config: RaspiConfig, args: &ProvisionArgs) -> Result<RaspiConfig> {
    if let Some(id) = &args.sd_card {
        config.devices.sd_card = Some(id.clone());
    }
    if let Some(id) = &args.thumb_drive {
        config.devices.thumb_drive = Some(id.clone());
    }
    if let Some(image) = &args.image {
        config.image.path = Some(image.clone());
    }
    if let Some(sha256) = &args.image_sha256 {
        config.image.sha256 = Some(sha256.clone());
    }
    if let Some(user) = &args.user {
        config.user = Some(user.clone());
    }
    if let Some(hostname) = &args.hostname {
        config.hostname = Some(hostname.clone());
    }
    if let Some(key) = &args.public_key {
        config.public_key = Some(key.clone());
    }
    if args.no_sudo {
        config.use_sudo = false;
    }
    if let Some(base) = &args.report_base {
        config.report_dir = base.clone();
    }

    match (&args.ssid, &args.psk) {
        (Some(ssid), psk) => {
            // A psk from the file only belongs to the same network.
            let psk = psk.clone().or_else(|| {
                config
                    .wireless
                    .as_ref()
                    .filter(|wireless| wireless.ssid == *ssid)
                    .map(|wireless| wireless.psk.clone())
            });
            config.wireless = Some(WirelessConfig {
                ssid: ssid.clone(),
                psk: psk.unwrap_or_default(),
            });
        }
        (None, Some(psk)) => match config.wireless.as_mut() {
            Some(wireless) => wireless.psk = psk.clone(),
            None => bail!("--psk needs --ssid or a wireless section in the configuration"),
        },
        (None, None) => {}
    }
    Ok(config)
}

/// Fills whatever the configuration left open by asking.
fn gather<R, W, P>(
    config: &RaspiConfig,
    candidates: Vec<BlockDevice>,
    probe: &P,
    prompter: &mut Prompter<R, W>,
) -> Result<Plan>
where
    R: BufRead,
    W: Write,
    P: Fn(&str) -> Result<BlockDevice>,
{
    let configured_sd = config.devices.sd_card.as_deref();
    let configured_thumb = config.devices.thumb_drive.as_deref();
    let mut options: Vec<(String, BlockDevice)> = candidates
        .into_iter()
        .filter(|device| !matches_id(configured_sd, device.id()) && !matches_id(configured_thumb, device.id()))
        .map(|device| (device.id().to_string(), device))
        .collect();

    let (sd_card, thumb_drive) = match (configured_sd, configured_thumb) {
        (Some(sd), Some(thumb)) => (probe(sd)?, probe(thumb)?),
        (None, None) => prompter.devices_prompt(options)?,
        (Some(sd), None) => (probe(sd)?, prompter.ask(THUMB_DRIVE_PROMPT, &mut options)?),
        (None, Some(thumb)) => (prompter.ask(SD_CARD_PROMPT, &mut options)?, probe(thumb)?),
    };

    let user = match &config.user {
        Some(user) => user.clone(),
        None => prompter.freestyle("What user name should the Pi use?")?,
    };
    let hostname = match &config.hostname {
        Some(hostname) => hostname.clone(),
        None => prompter.freestyle("What hostname should the Pi use?")?,
    };
    let wireless = match config.wireless.clone() {
        Some(mut wireless) => {
            if wireless.psk.is_empty() {
                wireless.psk = prompter.freestyle(&format!("Wireless password for {}?", wireless.ssid))?;
            }
            Some(wireless)
        }
        None => None,
    };

    Ok(Plan {
        sd_card,
        thumb_drive,
        personalization: Personalization {
            user,
            hostname,
            wireless,
        },
    })
}

fn matches_id(configured: Option<&str>, id: &str) -> bool {
    configured.map_or(false, |configured| configured.strip_prefix("/dev/").unwrap_or(configured) == id)
}

fn print_plan<W: Write>(output: &mut W, plan: &Plan, image: &Path) -> Result<()> {
    let wireless = plan
        .personalization
        .wireless
        .as_ref()
        .map(|wireless| wireless.ssid.as_str())
        .unwrap_or("not configured");
    writeln!(output, "SD card:      {} ({})", plan.sd_card.path(), plan.sd_card)?;
    writeln!(output, "Thumb drive:  {} ({})", plan.thumb_drive.path(), plan.thumb_drive)?;
    writeln!(output, "Image:        {}", image.display())?;
    writeln!(output, "User:         {}", plan.personalization.user)?;
    writeln!(output, "Hostname:     {}", plan.personalization.hostname)?;
    writeln!(output, "Wireless:     {}", wireless)?;
    writeln!(output, "Everything on both devices will be erased.")?;
    Ok(())
}

/// Discovered disks minus the reserved ones. Disks without sysfs metadata
/// (already gone, or not real block devices) are left out.
pub(crate) fn candidate_devices(
    runner: &Arc<dyn CommandRunner>,
    paths: &HostPaths,
    reserved: &[String],
) -> Result<Vec<BlockDevice>> {
    let mut devices = Vec::new();
    for id in discover(runner.as_ref())? {
        if reserved.iter().any(|reserved| reserved.strip_prefix("/dev/").unwrap_or(reserved) == id) {
            continue;
        }
        match BlockDevice::probe(&id, Arc::clone(runner), paths) {
            Ok(device) => devices.push(device),
            Err(err) => debug!("skipping {}: {}", id, err),
        }
    }
    if devices.is_empty() {
        bail!("no candidate devices found; plug in the SD card and thumb drive");
    }
    Ok(devices)
}

pub(crate) fn reserved_devices(configured: &[String], system: Vec<String>) -> Vec<String> {
    let mut reserved: Vec<String> = configured
        .iter()
        .map(|id| id.strip_prefix("/dev/").unwrap_or(id).to_string())
        .collect();
    for id in system {
        if !reserved.contains(&id) {
            reserved.push(id);
        }
    }
    reserved
}

fn operator_from(sudo_user: Option<String>, user: Option<String>) -> Option<String> {
    sudo_user
        .filter(|name| !name.is_empty())
        .or(user.filter(|name| !name.is_empty()))
}

/// First existing key among the usual names. Falls back to the rsa path so
/// the pre-flight check can name what is missing.
fn default_public_key(home: Option<&Path>) -> Result<PathBuf> {
    let home = home.ok_or_else(|| anyhow!("HOME is not set; pass --public-key"))?;
    let ssh = home.join(".ssh");
    let candidates = [ssh.join("id_rsa.pub"), ssh.join("id_ed25519.pub")];
    Ok(candidates
        .iter()
        .find(|path| path.is_file())
        .unwrap_or(&candidates[0])
        .clone())
}

fn status_label(status: StageStatus) -> &'static str {
    match status {
        StageStatus::Completed => "completed",
        StageStatus::ResolvedManually => "resolved manually",
        StageStatus::Aborted => "aborted",
        StageStatus::Skipped => "skipped",
    }
}
