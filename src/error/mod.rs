use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;

use anyhow::Error as AnyhowError;
use serde::{Deserialize, Serialize};
use serde_json::Error as SerdeJsonError;
use sqlx::Error as SqlxError;
use std::io::Error as IoError;
use zip::result::ZipError;

/// Structured error surfaced by every public backup, restore and catalog operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppError {
    /// Machine readable error code, `AREA/REASON`.
    pub code: String,
    /// Message suitable for display.
    pub message: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<AppError>>,
}

pub type AppResult<T> = std::result::Result<T, AppError>;

impl AppError {
    pub const UNKNOWN_CODE: &'static str = "APP/UNKNOWN";
    pub const GENERIC_CODE: &'static str = "APP/GENERIC";
    /// Another backup or restore already holds the operation lock.
    pub const BUSY_CODE: &'static str = "BACKUP/BUSY";
    pub const CANCELLED_CODE: &'static str = "BACKUP/CANCELLED";

    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        AppError {
            code: code.into(),
            message: message.into(),
            context: HashMap::new(),
            cause: None,
        }
    }

    pub fn busy() -> Self {
        AppError::new(
            Self::BUSY_CODE,
            "A backup or restore is already running. Try again once it finishes.",
        )
    }

    pub fn cancelled() -> Self {
        AppError::new(Self::CANCELLED_CODE, "Operation cancelled")
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> &HashMap<String, String> {
        &self.context
    }

    pub fn cause(&self) -> Option<&AppError> {
        self.cause.as_deref()
    }

    pub fn is_busy(&self) -> bool {
        self.code == Self::BUSY_CODE
    }

    pub fn is_cancelled(&self) -> bool {
        self.code == Self::CANCELLED_CODE
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_contexts<I, K, V>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.context
            .extend(entries.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn with_cause(mut self, cause: impl Into<AppError>) -> Self {
        self.cause = Some(Box::new(cause.into()));
        self
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if !self.context.is_empty() {
            let mut keys: Vec<_> = self.context.keys().collect();
            keys.sort();
            let rendered: Vec<String> = keys
                .into_iter()
                .map(|key| format!("{key}={}", self.context[key]))
                .collect();
            write!(f, " ({})", rendered.join(", "))?;
        }
        Ok(())
    }
}

impl StdError for AppError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn StdError + 'static))
    }
}

impl From<&str> for AppError {
    fn from(message: &str) -> Self {
        AppError::new(AppError::GENERIC_CODE, message)
    }
}

impl From<String> for AppError {
    fn from(message: String) -> Self {
        AppError::new(AppError::GENERIC_CODE, message)
    }
}

impl From<AnyhowError> for AppError {
    fn from(error: AnyhowError) -> Self {
        fn walk(err: &(dyn StdError + 'static)) -> AppError {
            if let Some(app) = err.downcast_ref::<AppError>() {
                return app.clone();
            }
            let mut node = AppError::new(AppError::UNKNOWN_CODE, err.to_string());
            node.cause = err.source().map(|source| Box::new(walk(source)));
            node
        }

        walk(error.as_ref())
    }
}

impl From<IoError> for AppError {
    fn from(error: IoError) -> Self {
        let mut app_error = AppError::new(format!("IO/{:?}", error.kind()), error.to_string());
        if let Some(os_code) = error.raw_os_error() {
            app_error = app_error.with_context("os_code", os_code.to_string());
        }
        app_error
    }
}

impl From<SerdeJsonError> for AppError {
    fn from(error: SerdeJsonError) -> Self {
        let code = match error.classify() {
            serde_json::error::Category::Data => "JSON/DATA",
            serde_json::error::Category::Syntax => "JSON/SYNTAX",
            serde_json::error::Category::Eof => "JSON/EOF",
            serde_json::error::Category::Io => "JSON/IO",
        };
        let mut app_error = AppError::new(code, error.to_string());
        if error.line() > 0 {
            app_error = app_error
                .with_context("line", error.line().to_string())
                .with_context("column", error.column().to_string());
        }
        app_error
    }
}

impl From<SqlxError> for AppError {
    fn from(error: SqlxError) -> Self {
        match error {
            SqlxError::RowNotFound => AppError::new("SQLX/ROW_NOT_FOUND", "Record not found"),
            SqlxError::PoolTimedOut => AppError::new(
                "SQLX/POOL_TIMEOUT",
                "Timed out acquiring a database connection",
            ),
            SqlxError::PoolClosed => AppError::new("SQLX/POOL_CLOSED", "Database pool is closed"),
            SqlxError::Io(err) => AppError::from(err).with_context("source", "sqlx"),
            SqlxError::Database(db) => {
                let code = db
                    .code()
                    .map(|code| format!("Sqlite/{code}"))
                    .unwrap_or_else(|| "SQLX/DATABASE".to_string());
                let mut app_error = AppError::new(code, db.message().to_string());
                if let Some(constraint) = db.constraint() {
                    app_error = app_error.with_context("constraint", constraint.to_string());
                }
                app_error
            }
            SqlxError::ColumnDecode { index, source } => {
                AppError::new("SQLX/COLUMN_DECODE", source.to_string())
                    .with_context("column_index", index.to_string())
            }
            other => AppError::new("SQLX/ERROR", other.to_string()),
        }
    }
}

impl From<ZipError> for AppError {
    fn from(error: ZipError) -> Self {
        match error {
            ZipError::Io(err) => AppError::from(err).with_context("source", "zip"),
            ZipError::FileNotFound => AppError::new("ZIP/ENTRY_NOT_FOUND", "Archive entry not found"),
            ZipError::InvalidArchive(reason) => {
                AppError::new("ZIP/INVALID_ARCHIVE", format!("Invalid archive: {reason}"))
            }
            ZipError::UnsupportedArchive(reason) => AppError::new(
                "ZIP/UNSUPPORTED_ARCHIVE",
                format!("Unsupported archive: {reason}"),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn context_and_cause_are_kept() {
        let error = AppError::new("BACKUP/WRITE", "Failed to write archive")
            .with_context("table", "facilities")
            .with_cause(AppError::from("disk went away"));

        assert_eq!(error.code(), "BACKUP/WRITE");
        assert_eq!(error.context().get("table"), Some(&"facilities".to_string()));
        let cause = error.cause().expect("cause present");
        assert_eq!(cause.code(), AppError::GENERIC_CODE);
        assert_eq!(cause.message(), "disk went away");
    }

    #[test]
    fn display_sorts_context_keys() {
        let error = AppError::new("RESTORE/TABLE", "insert failed")
            .with_context("table", "photos")
            .with_context("step", "inserting");
        assert_eq!(
            error.to_string(),
            "[RESTORE/TABLE] insert failed (step=inserting, table=photos)"
        );
    }

    #[test]
    fn anyhow_chain_becomes_nested_causes() {
        let err = (|| -> anyhow::Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"))
                .context("failed to stage archive")
        })()
        .unwrap_err();

        let app_error = AppError::from(err);
        assert_eq!(app_error.message(), "failed to stage archive");
        let cause = app_error.cause().expect("io cause present");
        assert!(cause.message().contains("disk full"));
    }

    #[test]
    fn anyhow_wrapping_app_error_keeps_original() {
        let inner = AppError::busy().with_context("operation", "restore");
        let err = AnyhowError::from(inner.clone()).context("outer");
        let converted = AppError::from(err);
        assert_eq!(converted.cause(), Some(&inner));
    }

    #[test]
    fn question_mark_lifts_app_error_into_anyhow() {
        fn fails() -> anyhow::Result<()> {
            Err(AppError::cancelled())?;
            Ok(())
        }
        let err = fails().unwrap_err();
        assert_eq!(err.downcast_ref::<AppError>(), Some(&AppError::cancelled()));
    }

    #[test]
    fn busy_and_cancelled_are_recognised() {
        assert!(AppError::busy().is_busy());
        assert!(AppError::cancelled().is_cancelled());
        assert!(!AppError::from("x").is_busy());
    }

    #[test]
    fn io_error_reports_os_code() {
        let app_error = AppError::from(IoError::from_raw_os_error(2));
        assert_eq!(app_error.code(), "IO/NotFound");
        assert_eq!(app_error.context().get("os_code"), Some(&"2".to_string()));
    }

    #[test]
    fn json_syntax_error_has_position() {
        let err = serde_json::from_str::<serde_json::Value>("{\"id\": }").expect_err("invalid");
        let app_error = AppError::from(err);
        assert_eq!(app_error.code(), "JSON/SYNTAX");
        assert!(app_error.context().contains_key("line"));
    }

    #[test]
    fn zip_invalid_archive_maps_to_code() {
        let app_error = AppError::from(ZipError::InvalidArchive("bad eocd"));
        assert_eq!(app_error.code(), "ZIP/INVALID_ARCHIVE");
    }

    #[test]
    fn serializes_without_empty_fields() {
        let json = serde_json::to_value(AppError::busy()).expect("serialize");
        assert_eq!(json["code"], "BACKUP/BUSY");
        assert!(json.get("context").is_none());
        assert!(json.get("cause").is_none());
    }
}
