use crate::containment::{RecoveryDecision, RecoveryHandler, StageContext, StageFailure};
use crate::personalize::personalize;
use crate::stages::{self, Stage};
use anyhow::Result;
use raspi_content::{ImageDefaultsConfig, TargetConfig, WirelessConfig};
use raspi_core::{StageRecord, StageStatus};
use raspi_host_linux::BlockDevice;
use raspi_imaging::{inspect_image, verify_image_sha256, HashProgress, ImageInfo, ProgressObserver};
use raspi_report::{create_report_bundle, ReportPaths};
use raspi_safety::{
    can_write_to_disks, validate_hostname, validate_username, validate_wireless, SafetyContext,
    SafetyDecision,
};
use std::path::PathBuf;
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info, warn};

/// What the finished system should look like.
#[derive(Debug, Clone)]
pub struct Personalization {
    pub user: String,
    pub hostname: String,
    pub wireless: Option<WirelessConfig>,
}

/// The person running the tool, on the host side.
#[derive(Debug, Clone)]
pub struct OperatorIdentity {
    /// Host account that may temporarily own files inside the mounted image.
    pub user: String,
    pub public_key: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ProvisionParams {
    pub image: PathBuf,
    pub image_sha256: Option<String>,
    pub personalization: Personalization,
    pub operator: OperatorIdentity,
    pub target: TargetConfig,
    pub image_defaults: ImageDefaultsConfig,
    /// Disk ids that must never be written. Callers add the detected system disks.
    pub root_devices: Vec<String>,
    pub confirmed: bool,
    pub report_base: PathBuf,
    pub scratch_base: PathBuf,
}

#[derive(Debug)]
pub struct ProvisionResult {
    pub report: ReportPaths,
    pub stages: Vec<StageRecord>,
    pub image: ImageInfo,
    pub image_sha256: Option<String>,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("refusing to provision: {0}")]
    Refused(String),

    #[error("run aborted in stage {stage}: {cause}")]
    Aborted {
        stage: Stage,
        cause: String,
        report: Option<ReportPaths>,
    },

    #[error("failed to write run report: {0:#}")]
    Report(anyhow::Error),
}

struct Preflight {
    image: ImageInfo,
    sha256: Option<String>,
}

/// Runs every stage in order against `sd_card` and `thumb_drive`.
///
/// All guards run before the first command is issued and are final. After
/// that each stage failure goes to `recovery`; on abort the remaining stages
/// are recorded as skipped. A report bundle is written either way.
pub fn run_provisioning(
    sd_card: &BlockDevice,
    thumb_drive: &BlockDevice,
    params: &ProvisionParams,
    recovery: &mut dyn RecoveryHandler,
) -> Result<ProvisionResult, PipelineError> {
    let preflight = preflight(sd_card, thumb_drive, params)?;

    let mut logs = vec![
        "workflow=raspi-provision".to_string(),
        format!("sd_card={}", sd_card.path()),
        format!("thumb_drive={}", thumb_drive.path()),
        format!("image={}", preflight.image.path.display()),
    ];
    if let Some(sha256) = &preflight.sha256 {
        logs.push(format!("image_sha256={}", sha256));
    }

    let mut records = Vec::with_capacity(Stage::ALL.len());
    let mut aborted: Option<(Stage, String)> = None;

    for stage in Stage::ALL {
        if aborted.is_some() {
            records.push(record(stage, StageStatus::Skipped, 0, None, Vec::new()));
            logs.push(format!("stage={} status=skipped", stage));
            continue;
        }

        info!(stage = %stage, "stage started");
        let started = Instant::now();
        let mut ctx = StageContext::new(stage);
        let outcome = run_stage(stage, sd_card, thumb_drive, params, &mut ctx);
        let duration_ms = started.elapsed().as_millis();

        let (status, cause) = match outcome {
            Ok(()) => {
                info!(stage = %stage, duration_ms = %duration_ms, "stage completed");
                (StageStatus::Completed, None)
            }
            Err(cause) => {
                let message = format!("{:#}", cause);
                error!(stage = %stage, "stage failed: {}", message);
                let snapshot = stage_device(stage, sd_card, thumb_drive).tree_snapshot().ok();
                let failure = StageFailure {
                    stage,
                    cause,
                    notes: ctx.notes().to_vec(),
                    snapshot,
                };
                match recovery.recover(&failure) {
                    RecoveryDecision::Continue => {
                        warn!(stage = %stage, "continuing after manual recovery");
                        (StageStatus::ResolvedManually, Some(message))
                    }
                    RecoveryDecision::Abort => {
                        aborted = Some((stage, message.clone()));
                        (StageStatus::Aborted, Some(message))
                    }
                }
            }
        };
        logs.push(format!(
            "stage={} status={} duration_ms={}",
            stage,
            status_label(status),
            duration_ms
        ));
        records.push(record(stage, status, duration_ms, cause, ctx.into_notes()));
    }

    let meta = serde_json::json!({
        "workflow": "raspi-provision",
        "image": preflight.image.path.display().to_string(),
        "image_size_bytes": preflight.image.size_bytes,
        "image_sha256": preflight.sha256,
        "sd_card": sd_card.id(),
        "thumb_drive": thumb_drive.id(),
        "user": params.personalization.user,
        "hostname": params.personalization.hostname,
        "wireless": params.personalization.wireless.is_some(),
        "target_root_device": params.target.root_device,
        "aborted": aborted.as_ref().map(|(stage, _)| stage.name()),
    });
    let report = create_report_bundle(
        &params.report_base,
        &[sd_card.summary(), thumb_drive.summary()],
        &records,
        Some(meta),
        Some(&logs.join("\n")),
    );

    match (aborted, report) {
        (None, Ok(report)) => {
            info!(report = %report.root.display(), "provisioning finished");
            Ok(ProvisionResult {
                report,
                stages: records,
                image: preflight.image,
                image_sha256: preflight.sha256,
            })
        }
        (None, Err(err)) => Err(PipelineError::Report(err)),
        (Some((stage, cause)), report) => {
            let report = match report {
                Ok(report) => Some(report),
                Err(err) => {
                    warn!("failed to write run report: {:#}", err);
                    None
                }
            };
            Err(PipelineError::Aborted {
                stage,
                cause,
                report,
            })
        }
    }
}

fn preflight(
    sd_card: &BlockDevice,
    thumb_drive: &BlockDevice,
    params: &ProvisionParams,
) -> Result<Preflight, PipelineError> {
    let refuse = |err: &dyn std::fmt::Display| PipelineError::Refused(err.to_string());

    let wanted = &params.personalization;
    validate_username(&wanted.user).map_err(|err| refuse(&err))?;
    validate_hostname(&wanted.hostname).map_err(|err| refuse(&err))?;
    if let Some(wireless) = &wanted.wireless {
        validate_wireless(&wireless.ssid, &wireless.psk).map_err(|err| refuse(&err))?;
    }

    let ctx = SafetyContext {
        confirmed: params.confirmed,
        root_devices: params.root_devices.clone(),
    };
    if let SafetyDecision::Deny(reason) = can_write_to_disks(&ctx, sd_card.id(), thumb_drive.id()) {
        return Err(PipelineError::Refused(reason));
    }

    if !params.operator.public_key.is_file() {
        return Err(PipelineError::Refused(format!(
            "public key {} does not exist",
            params.operator.public_key.display()
        )));
    }

    let image = inspect_image(&params.image).map_err(|err| refuse(&format!("{:#}", err)))?;
    let sha256 = match &params.image_sha256 {
        Some(expected) => {
            info!(image = %image.path.display(), "verifying image checksum");
            let mut progress = LogProgress::default();
            let digest = verify_image_sha256(&image.path, expected, Some(&mut progress))
                .map_err(|err| refuse(&format!("{:#}", err)))?;
            Some(digest.sha256)
        }
        None => None,
    };
    Ok(Preflight { image, sha256 })
}

fn run_stage(
    stage: Stage,
    sd_card: &BlockDevice,
    thumb_drive: &BlockDevice,
    params: &ProvisionParams,
    ctx: &mut StageContext,
) -> Result<()> {
    match stage {
        Stage::ClearSdCard => stages::clear(sd_card, ctx),
        Stage::ClearThumbDrive => stages::clear(thumb_drive, ctx),
        Stage::FlashThumbDrive => stages::flash(&params.image, thumb_drive, ctx),
        Stage::CopyBootPartition => stages::copy_boot_partition(thumb_drive, sd_card, ctx),
        Stage::PatchBootConfig => {
            stages::patch_boot_config(sd_card, &params.scratch_base, &params.target.root_device, ctx)
        }
        Stage::ExpandRootPartition => stages::expand_root_partition(thumb_drive, ctx),
        Stage::PersonalizeRoot => personalize(thumb_drive, params, ctx),
    }
}

/// The device whose state matters when `stage` fails.
fn stage_device<'a>(stage: Stage, sd_card: &'a BlockDevice, thumb_drive: &'a BlockDevice) -> &'a BlockDevice {
    match stage {
        Stage::ClearSdCard | Stage::CopyBootPartition | Stage::PatchBootConfig => sd_card,
        Stage::ClearThumbDrive
        | Stage::FlashThumbDrive
        | Stage::ExpandRootPartition
        | Stage::PersonalizeRoot => thumb_drive,
    }
}

fn record(
    stage: Stage,
    status: StageStatus,
    duration_ms: u128,
    error: Option<String>,
    notes: Vec<String>,
) -> StageRecord {
    StageRecord {
        stage: stage.name().to_string(),
        status,
        duration_ms,
        error,
        notes,
    }
}

fn status_label(status: StageStatus) -> &'static str {
    match status {
        StageStatus::Completed => "completed",
        StageStatus::ResolvedManually => "resolved_manually",
        StageStatus::Aborted => "aborted",
        StageStatus::Skipped => "skipped",
    }
}

#[derive(Default)]
struct LogProgress {
    next_percent: u64,
}

impl ProgressObserver for LogProgress {
    fn on_progress(&mut self, progress: HashProgress) -> bool {
        if progress.total_bytes == 0 {
            return true;
        }
        let percent = progress.bytes_hashed.saturating_mul(100) / progress.total_bytes;
        if percent >= self.next_percent {
            info!("image checksum {}%", percent);
            self.next_percent = percent + 10;
        }
        true
    }
}
