use anyhow::{Context, Result};
use raspi_core::{now_utc_rfc3339, DeviceSummary, StageRecord, RUN_SCHEMA_VERSION};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct ReportPaths {
    pub run_id: String,
    pub root: PathBuf,
    pub devices_json: PathBuf,
    pub run_json: PathBuf,
    pub logs_path: PathBuf,
}

#[derive(Debug, Serialize)]
struct RunMetadata<'a> {
    run_id: String,
    created_at_utc: String,
    schema_version: &'static str,
    stages: &'a [StageRecord],
    meta: Option<Value>,
}

pub fn create_report_bundle(
    base: impl AsRef<Path>,
    devices: &[DeviceSummary],
    stages: &[StageRecord],
    meta: Option<Value>,
    logs: Option<&str>,
) -> Result<ReportPaths> {
    let run_id = Uuid::new_v4().to_string();
    let base = base.as_ref();
    let root = base.join("reports").join(&run_id);
    std::fs::create_dir_all(&root)
        .with_context(|| format!("create report dir {}", root.display()))?;

    let devices_json = root.join("devices.json");
    let run_json = root.join("run.json");
    let logs_path = root.join("logs.txt");

    std::fs::write(&devices_json, serde_json::to_string_pretty(devices)?)?;

    let run_meta = RunMetadata {
        run_id: run_id.clone(),
        created_at_utc: now_utc_rfc3339(),
        schema_version: RUN_SCHEMA_VERSION,
        stages,
        meta,
    };
    std::fs::write(&run_json, serde_json::to_string_pretty(&run_meta)?)?;

    std::fs::write(&logs_path, logs.unwrap_or(""))?;

    Ok(ReportPaths {
        run_id,
        root,
        devices_json,
        run_json,
        logs_path,
    })
}
