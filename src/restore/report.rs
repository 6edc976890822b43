use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;

use super::validator::ValidationResult;
use super::RestoreReport;
use crate::util::write_atomic;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RestoreReportFile<'a> {
    generated_at: String,
    validation: &'a ValidationResult,
    restore: &'a RestoreReport,
}

pub fn write_restore_report(
    reports_dir: &Path,
    validation: &ValidationResult,
    report: &RestoreReport,
) -> Result<PathBuf> {
    fs::create_dir_all(reports_dir)
        .with_context(|| format!("create reports directory {}", reports_dir.display()))?;

    let short_id: String = report.id.chars().take(8).collect();
    let name = format!(
        "{}-{short_id}.json",
        Utc::now().format("restore-%Y%m%d-%H%M%S")
    );
    let path = reports_dir.join(name);
    let payload = RestoreReportFile {
        generated_at: Utc::now().to_rfc3339(),
        validation,
        restore: report,
    };
    let json = serde_json::to_vec_pretty(&payload).context("serialize restore report")?;
    write_atomic(&path, &json)
        .with_context(|| format!("write restore report {}", path.display()))?;
    Ok(path)
}
