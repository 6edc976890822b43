pub mod execute;
pub mod report;
pub mod validator;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::AppError;

pub use report::write_restore_report;
pub use validator::{
    validate_backup, validate_backup_with_photos, ValidationError, ValidationResult,
    MIN_SUPPORTED_APP_VERSION,
};

/// Rows written per transaction while inserting.
pub const ROW_CHUNK_SIZE: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreStrategy {
    /// Empty every table, then insert the archive rows.
    #[default]
    ReplaceAll,
    /// Upsert archive rows by primary key; rows only in the live database stay.
    Merge,
}

impl RestoreStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestoreStrategy::ReplaceAll => "replace_all",
            RestoreStrategy::Merge => "merge",
        }
    }
}

impl fmt::Display for RestoreStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RestoreStrategy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().replace('-', "_").as_str() {
            "replace_all" => Ok(RestoreStrategy::ReplaceAll),
            "merge" => Ok(RestoreStrategy::Merge),
            other => Err(format!("unknown restore strategy {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreRequest {
    pub archive_path: PathBuf,
    pub strategy: RestoreStrategy,
    /// Loose photo directory of a directory-mode archive, when it is not the
    /// sibling of the archive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_dir: Option<PathBuf>,
}

impl RestoreRequest {
    pub fn new(archive_path: impl Into<PathBuf>, strategy: RestoreStrategy) -> Self {
        Self {
            archive_path: archive_path.into(),
            strategy,
            photo_dir: None,
        }
    }

    pub fn with_photo_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.photo_dir = Some(dir.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableRestoreSummary {
    pub table: String,
    pub rows_in_archive: u64,
    pub rows_written: u64,
    pub rows_deleted: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoRestoreSummary {
    pub copied: u64,
    pub missing: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreReport {
    pub id: String,
    pub archive_path: PathBuf,
    pub strategy: RestoreStrategy,
    pub manifest_id: String,
    pub app_schema_version: i64,
    pub started_at: String,
    pub completed_at: String,
    pub tables: Vec<TableRestoreSummary>,
    pub photos: PhotoRestoreSummary,
    /// Warnings from validation followed by those raised while restoring.
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_path: Option<PathBuf>,
}

impl RestoreReport {
    pub fn table(&self, name: &str) -> Option<&TableRestoreSummary> {
        self.tables.iter().find(|summary| summary.table == name)
    }

    pub fn rows_written(&self) -> u64 {
        self.tables.iter().map(|summary| summary.rows_written).sum()
    }
}

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("archive failed validation: {}", .errors.join("; "))]
    InvalidArchive { errors: Vec<String> },
    #[error("row {line} of {table} is malformed: {reason}")]
    MalformedRow {
        table: String,
        line: u64,
        reason: String,
    },
    #[error("failed to restore {table}: {source}")]
    Database {
        table: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("photo path {0} escapes the photo directory")]
    PathTraversal(String),
}

impl RestoreError {
    fn code(&self) -> &'static str {
        match self {
            RestoreError::InvalidArchive { .. } => "RESTORE/INVALID_ARCHIVE",
            RestoreError::MalformedRow { .. } => "RESTORE/MALFORMED_ROW",
            RestoreError::Database { .. } => "RESTORE/DATABASE",
            RestoreError::PathTraversal(_) => "RESTORE/PATH_TRAVERSAL",
        }
    }
}

impl From<RestoreError> for AppError {
    fn from(err: RestoreError) -> Self {
        let mut app = AppError::new(err.code(), err.to_string());
        match &err {
            RestoreError::MalformedRow { table, line, .. } => {
                app = app
                    .with_context("table", table.clone())
                    .with_context("line", line.to_string());
            }
            RestoreError::Database { table, source } => {
                app = app
                    .with_context("table", table.clone())
                    .with_cause(AppError::from(source.to_string()));
            }
            RestoreError::PathTraversal(path) => {
                app = app.with_context("path", path.clone());
            }
            RestoreError::InvalidArchive { .. } => {}
        }
        app
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_parses_cli_spellings() {
        assert_eq!("replace-all".parse::<RestoreStrategy>(), Ok(RestoreStrategy::ReplaceAll));
        assert_eq!("MERGE".parse::<RestoreStrategy>(), Ok(RestoreStrategy::Merge));
        assert!("upsert".parse::<RestoreStrategy>().is_err());
        assert_eq!(
            serde_json::to_value(RestoreStrategy::ReplaceAll).unwrap(),
            serde_json::json!("replace_all")
        );
    }

    #[test]
    fn restore_errors_carry_table_context() {
        let err: AppError = RestoreError::MalformedRow {
            table: "facilities".into(),
            line: 3,
            reason: "expected object".into(),
        }
        .into();
        assert_eq!(err.code(), "RESTORE/MALFORMED_ROW");
        assert_eq!(err.context().get("table"), Some(&"facilities".to_string()));

        let invalid: AppError = RestoreError::InvalidArchive {
            errors: vec!["a".into(), "b".into()],
        }
        .into();
        assert!(invalid.message().ends_with("a; b"));
    }
}
