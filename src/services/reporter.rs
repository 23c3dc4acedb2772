use crate::db::{AttemptResult, FileRow};
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Serialize)]
struct ReportRow<'a> {
    #[serde(rename = "Path")]
    path: &'a str,
    #[serde(rename = "File Size")]
    file_size: Option<i64>,
    #[serde(rename = "Uploadcare UUID")]
    remote_id: Option<&'a str>,
    #[serde(rename = "Status")]
    status: &'a str,
    #[serde(rename = "Error")]
    error: Option<&'a str>,
}

impl<'a> From<&'a FileRow> for ReportRow<'a> {
    fn from(file: &'a FileRow) -> Self {
        Self {
            path: &file.path,
            file_size: file.file_size,
            remote_id: file.remote_id.as_deref(),
            status: file.status.as_str(),
            error: file.error.as_deref(),
        }
    }
}

pub struct Reporter;

impl Reporter {
    pub fn report_filename(
        attempt_id: i64,
        source: &str,
        at: chrono::DateTime<chrono::Local>,
    ) -> String {
        format!(
            "Attempt {} - {} - {}.csv",
            attempt_id,
            at.format("%Y-%m-%d %H-%M-%S"),
            source
        )
    }

    /// Writes one CSV row per file of the attempt into `reports_dir` and returns the report path.
    pub fn generate_report(
        reports_dir: &Path,
        source: &str,
        result: &AttemptResult,
    ) -> Result<PathBuf> {
        if !reports_dir.exists() {
            fs::create_dir_all(reports_dir).context("Failed to create reports directory")?;
        }

        let filename = Self::report_filename(result.attempt_id, source, chrono::Local::now());
        let report_path = reports_dir.join(filename);

        let mut writer = csv::Writer::from_path(&report_path)
            .with_context(|| format!("Failed to create report {:?}", report_path))?;
        if result.files.is_empty() {
            writer.write_record(["Path", "File Size", "Uploadcare UUID", "Status", "Error"])?;
        }
        for file in &result.files {
            writer.serialize(ReportRow::from(file))?;
        }
        writer.flush().context("Failed to write report")?;

        info!(
            "Generated report for attempt {}: {:?} ({} uploaded, {} failed)",
            result.attempt_id, report_path, result.successful, result.failed
        );
        Ok(report_path)
    }
}
