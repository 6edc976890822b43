use std::path::Path;

use anyhow::{Context, Result as AnyResult};
use serde_json::{Map, Number, Value};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Column, Row, SqlitePool, TypeInfo, ValueRef};
use thiserror::Error;

use crate::AppError;

pub async fn open_sqlite_pool(db_path: &Path) -> AnyResult<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).map_err(|err| {
            tracing::error!(
                target: "qreport",
                event = "db_dir_create_failed",
                error = %err,
                path = %parent.display()
            );
            err
        })?;
    }
    tracing::info!(target: "qreport", event = "db_path", path = %db_path.display());

    let opts = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .foreign_keys(true)
        .busy_timeout(std::time::Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(opts)
        .await
        .with_context(|| format!("open database {}", db_path.display()))?;

    log_effective_pragmas(&pool).await;
    Ok(pool)
}

async fn log_effective_pragmas(pool: &SqlitePool) {
    let (sqlite_ver,): (String,) = sqlx::query_as("select sqlite_version()")
        .fetch_one(pool)
        .await
        .unwrap_or((String::from("unknown"),));
    let (journal_mode,): (String,) = sqlx::query_as("PRAGMA journal_mode;")
        .fetch_one(pool)
        .await
        .unwrap_or((String::from("unknown"),));
    let (foreign_keys,): (i64,) = sqlx::query_as("PRAGMA foreign_keys;")
        .fetch_one(pool)
        .await
        .unwrap_or((i64::MIN,));

    tracing::info!(
        target: "qreport",
        event = "db_open",
        sqlite_version = %sqlite_ver,
        journal_mode = %journal_mode,
        foreign_keys = foreign_keys
    );

    if foreign_keys != 1 {
        tracing::warn!(
            target: "qreport",
            event = "db_open_warning",
            msg = "foreign_keys disabled; restore ordering is not being enforced"
        );
    }
}

/// Key of the object a BLOB value is wrapped in: `{"$blob": "<hex>"}`.
pub const BLOB_KEY: &str = "$blob";

#[derive(Debug, Error)]
pub enum RowDecodeError {
    #[error("column {column} could not be read: {source}")]
    Unreadable {
        column: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("column {column} holds a REAL that JSON cannot represent")]
    NonFiniteReal { column: String },
}

impl RowDecodeError {
    pub fn column(&self) -> &str {
        match self {
            RowDecodeError::Unreadable { column, .. } | RowDecodeError::NonFiniteReal { column } => {
                column
            }
        }
    }
}

impl From<RowDecodeError> for AppError {
    fn from(err: RowDecodeError) -> Self {
        AppError::new("BACKUP/UNREPRESENTABLE_VALUE", err.to_string())
            .with_context("column", err.column().to_string())
    }
}

/// Converts a row into a JSON object keyed by column name. INTEGER, REAL and
/// TEXT keep their natural JSON type; BLOB values become `{"$blob": hex}`.
/// A value JSON cannot carry unchanged is an error, never a silent NULL.
pub fn row_to_json(row: &SqliteRow) -> Result<Value, RowDecodeError> {
    let mut object = Map::with_capacity(row.columns().len());
    for column in row.columns() {
        let idx = column.ordinal();
        let name = column.name();
        let unreadable = |source| RowDecodeError::Unreadable {
            column: name.to_string(),
            source,
        };
        let raw = row.try_get_raw(idx).map_err(unreadable)?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            let storage = raw.type_info().name().to_ascii_uppercase();
            decode_column(row, idx, name, &storage)?
        };
        object.insert(name.to_string(), value);
    }
    Ok(Value::Object(object))
}

fn decode_column(
    row: &SqliteRow,
    idx: usize,
    name: &str,
    storage: &str,
) -> Result<Value, RowDecodeError> {
    let unreadable = |source| RowDecodeError::Unreadable {
        column: name.to_string(),
        source,
    };
    let value = match storage {
        "INTEGER" | "BOOLEAN" => Value::from(row.try_get::<i64, _>(idx).map_err(unreadable)?),
        "REAL" => {
            let real = row.try_get::<f64, _>(idx).map_err(unreadable)?;
            let number = Number::from_f64(real).ok_or_else(|| RowDecodeError::NonFiniteReal {
                column: name.to_string(),
            })?;
            Value::Number(number)
        }
        "BLOB" => {
            let bytes = row.try_get::<Vec<u8>, _>(idx).map_err(unreadable)?;
            let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
            let mut tagged = Map::with_capacity(1);
            tagged.insert(BLOB_KEY.to_string(), Value::String(hex));
            Value::Object(tagged)
        }
        _ => Value::String(row.try_get::<String, _>(idx).map_err(unreadable)?),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn row_to_json_keeps_storage_types() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let row = sqlx::query(
            "SELECT 'c1' AS id, 42 AS hours, 1.5 AS ratio, NULL AS notes, x'0aff' AS raw",
        )
        .fetch_one(&pool)
        .await
        .unwrap();

        assert_eq!(
            row_to_json(&row).unwrap(),
            json!({"id": "c1", "hours": 42, "ratio": 1.5, "notes": null, "raw": {"$blob": "0aff"}})
        );
    }

    #[tokio::test]
    async fn unrepresentable_values_are_errors() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();

        let row = sqlx::query("SELECT CAST(x'ff41' AS TEXT) AS notes")
            .fetch_one(&pool)
            .await
            .unwrap();
        let err = row_to_json(&row).unwrap_err();
        assert_eq!(err.column(), "notes");
        assert!(matches!(err, RowDecodeError::Unreadable { .. }));

        let row = sqlx::query("SELECT 9e999 AS ratio")
            .fetch_one(&pool)
            .await
            .unwrap();
        let err = row_to_json(&row).unwrap_err();
        assert!(matches!(err, RowDecodeError::NonFiniteReal { .. }));
        assert_eq!(AppError::from(err).code(), "BACKUP/UNREPRESENTABLE_VALUE");
    }

    #[tokio::test]
    async fn opened_pool_enforces_foreign_keys() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_sqlite_pool(&dir.path().join("nested").join("q.sqlite3"))
            .await
            .unwrap();
        let (fk,): (i64,) = sqlx::query_as("PRAGMA foreign_keys;")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(fk, 1);
    }
}
