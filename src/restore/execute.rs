use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use sqlx::{Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use super::report::write_restore_report;
use super::validator::{validate_backup_with_photos, ValidationResult};
use super::{
    PhotoRestoreSummary, RestoreError, RestoreReport, RestoreRequest, RestoreStrategy,
    TableRestoreSummary, ROW_CHUNK_SIZE,
};
use crate::archive::{loose_photo_dir, ArchiveReader, BackupManifest, PhotoMode, PHOTO_INDEX_ENTRY};
use crate::config::BackupConfig;
use crate::db::BLOB_KEY;
use crate::photos::{load_photo_refs, parse_photo_index, PhotoIndexEntry};
use crate::progress::{ProgressSender, RestoreProgress, RestoreStep, StepProgress};
use crate::schema::{self, quote_ident, TableSpec};
use crate::state::CancelHandle;
use crate::util::{is_safe_relative_path, run_blocking, with_suffix, PartialGuard};
use crate::{AppError, AppResult};

const PHOTO_PROGRESS_BATCH: usize = 10;
const TASK_ERROR: &str = "RESTORE/TASK";

pub(crate) struct RestoreRunner<'a> {
    pool: &'a SqlitePool,
    config: &'a BackupConfig,
    request: &'a RestoreRequest,
    progress: &'a ProgressSender<RestoreProgress>,
    cancel: &'a CancelHandle,
    step: RestoreStep,
    warnings: Vec<String>,
}

impl<'a> RestoreRunner<'a> {
    pub(crate) fn new(
        pool: &'a SqlitePool,
        config: &'a BackupConfig,
        request: &'a RestoreRequest,
        progress: &'a ProgressSender<RestoreProgress>,
        cancel: &'a CancelHandle,
    ) -> Self {
        Self {
            pool,
            config,
            request,
            progress,
            cancel,
            step: RestoreStep::Validating,
            warnings: Vec::new(),
        }
    }

    pub(crate) fn step(&self) -> RestoreStep {
        self.step
    }

    fn emit(&mut self, update: StepProgress<RestoreStep>) {
        self.step = update.step;
        let update = update.cancellable(!self.cancel.is_sealed());
        self.progress.emit(RestoreProgress::InProgress(update));
    }

    pub(crate) async fn run(&mut self) -> AppResult<RestoreReport> {
        let started_at = now_millis();
        let strategy = self.request.strategy;
        self.emit(StepProgress::new(RestoreStep::Validating, 0.0));
        self.cancel.checkpoint()?;

        let validation = self.revalidate().await?;
        let Some(manifest) = validation.manifest.clone() else {
            return Err(RestoreError::InvalidArchive {
                errors: vec!["manifest.json is missing".to_string()],
            }
            .into());
        };
        self.warnings.extend(validation.warnings.iter().cloned());
        self.cancel.checkpoint()?;
        self.emit(StepProgress::new(RestoreStep::Validating, 0.1));

        tracing::info!(
            target: "qreport",
            event = "restore_started",
            archive = %self.request.archive_path.display(),
            manifest_id = %manifest.id,
            strategy = %strategy
        );

        let archive_path = self.request.archive_path.clone();
        let reader = run_blocking(TASK_ERROR, move || Ok(ArchiveReader::open(&archive_path)?)).await?;
        let mut tables: Vec<TableRestoreSummary> = schema::insert_order()
            .map(|spec| TableRestoreSummary {
                table: spec.name.to_string(),
                rows_in_archive: manifest.row_count(spec.name).unwrap_or(0),
                ..TableRestoreSummary::default()
            })
            .collect();

        if strategy == RestoreStrategy::ReplaceAll {
            self.cancel.seal()?;
            tracing::info!(target: "qreport", event = "restore_point_of_no_return", manifest_id = %manifest.id);
            self.delete_tables(&mut tables).await?;
        }

        let reader = self.insert_tables(reader, &manifest, &mut tables).await?;

        self.cancel.seal()?;
        let photos = self.relink_photos(reader, &manifest).await?;

        let mut report = RestoreReport {
            id: Uuid::new_v4().to_string(),
            archive_path: self.request.archive_path.clone(),
            strategy,
            manifest_id: manifest.id.clone(),
            app_schema_version: manifest.app_schema_version,
            started_at,
            completed_at: now_millis(),
            tables,
            photos,
            warnings: std::mem::take(&mut self.warnings),
            report_path: None,
        };
        match write_restore_report(&self.config.paths.reports_dir, &validation, &report) {
            Ok(path) => report.report_path = Some(path),
            Err(err) => {
                tracing::warn!(target: "qreport", event = "restore_report_failed", error = %err);
                report.warnings.push(format!("Restore report was not written: {err}"));
            }
        }

        tracing::info!(
            target: "qreport",
            event = "restore_completed",
            manifest_id = %report.manifest_id,
            rows = report.rows_written(),
            photos_copied = report.photos.copied,
            photos_missing = report.photos.missing,
            warnings = report.warnings.len()
        );
        Ok(report)
    }

    async fn revalidate(&self) -> AppResult<ValidationResult> {
        let archive_path = self.request.archive_path.clone();
        let photo_dir = self.request.photo_dir.clone();
        let validation = tokio::task::spawn_blocking(move || {
            validate_backup_with_photos(&archive_path, photo_dir.as_deref())
        })
        .await
        .map_err(|err| AppError::new("RESTORE/VALIDATION_TASK", err.to_string()))?;

        if !validation.is_valid {
            tracing::warn!(
                target: "qreport",
                event = "restore_refused_invalid",
                archive = %self.request.archive_path.display(),
                errors = validation.errors.len()
            );
            return Err(RestoreError::InvalidArchive {
                errors: validation.error_messages(),
            }
            .into());
        }
        Ok(validation)
    }

    async fn delete_tables(&mut self, tables: &mut [TableRestoreSummary]) -> AppResult<()> {
        let order: Vec<&'static TableSpec> = schema::delete_order().collect();
        self.emit(StepProgress::new(RestoreStep::Deleting, 0.1));
        for (idx, spec) in order.iter().enumerate() {
            let sql = format!("DELETE FROM {}", quote_ident(spec.name));
            let done = sqlx::query(&sql)
                .execute(self.pool)
                .await
                .map_err(|source| RestoreError::Database {
                    table: spec.name.to_string(),
                    source,
                })?;
            if let Some(summary) = tables.iter_mut().find(|t| t.table == spec.name) {
                summary.rows_deleted = done.rows_affected();
            }
            tracing::debug!(
                target: "qreport",
                event = "restore_table_cleared",
                table = spec.name,
                rows = done.rows_affected()
            );

            let fraction = 0.1 + 0.1 * (idx + 1) as f64 / order.len() as f64;
            self.emit(
                StepProgress::new(RestoreStep::Deleting, fraction)
                    .table(spec.name, (idx + 1) as u64, order.len() as u64),
            );
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    async fn insert_tables(
        &mut self,
        mut reader: ArchiveReader,
        manifest: &BackupManifest,
        tables: &mut [TableRestoreSummary],
    ) -> AppResult<ArchiveReader> {
        let strategy = self.request.strategy;
        let total_rows = manifest.total_rows().max(1);
        let mut processed_rows = 0_u64;
        self.emit(StepProgress::new(RestoreStep::Inserting, 0.2).records(0, manifest.total_rows()));

        for spec in schema::insert_order() {
            if strategy == RestoreStrategy::Merge {
                self.cancel.checkpoint()?;
            }
            let Some(expected) = manifest.row_count(spec.name) else {
                let outcome = match strategy {
                    RestoreStrategy::ReplaceAll => "it was cleared and stays empty",
                    RestoreStrategy::Merge => "existing rows were left as is",
                };
                self.warnings
                    .push(format!("Table {} is not in this backup; {outcome}", spec.name));
                continue;
            };

            let entry = spec.data_entry();
            let (returned, bytes) = run_blocking(TASK_ERROR, move || {
                let bytes = reader.read_entry(&entry);
                Ok((reader, bytes))
            })
            .await?;
            reader = returned;
            let bytes = bytes.map_err(|err| AppError::from(err).with_context("table", spec.name))?;
            let rows = parse_rows(spec.name, &bytes)?;
            let inserter = match TableInserter::prepare(self.pool, spec, &rows, strategy).await? {
                Some(inserter) => inserter,
                None => {
                    self.emit(
                        StepProgress::new(RestoreStep::Inserting, insert_fraction(processed_rows, total_rows))
                            .table(spec.name, 0, expected),
                    );
                    continue;
                }
            };
            if !inserter.dropped.is_empty() {
                self.warnings.push(format!(
                    "Ignored columns no longer in {}: {}",
                    spec.name,
                    inserter.dropped.join(", ")
                ));
            }

            let mut written = 0_u64;
            for chunk in rows.chunks(ROW_CHUNK_SIZE) {
                let db_error = |source| RestoreError::Database {
                    table: spec.name.to_string(),
                    source,
                };
                let mut tx = self.pool.begin().await.map_err(db_error)?;
                for row in chunk {
                    inserter.insert(&mut tx, row).await.map_err(db_error)?;
                }
                tx.commit().await.map_err(db_error)?;

                written += chunk.len() as u64;
                processed_rows += chunk.len() as u64;
                self.emit(
                    StepProgress::new(RestoreStep::Inserting, insert_fraction(processed_rows, total_rows))
                        .table(spec.name, written, expected),
                );
                tokio::task::yield_now().await;
            }

            if let Some(summary) = tables.iter_mut().find(|t| t.table == spec.name) {
                summary.rows_written = written;
            }
            tracing::debug!(target: "qreport", event = "restore_table_written", table = spec.name, rows = written);
        }
        Ok(reader)
    }

    async fn relink_photos(
        &mut self,
        mut reader: ArchiveReader,
        manifest: &BackupManifest,
    ) -> AppResult<PhotoRestoreSummary> {
        let mut summary = PhotoRestoreSummary::default();
        let photos_dir = self.config.paths.photos_dir.clone();
        self.emit(StepProgress::new(RestoreStep::RelinkingPhotos, 0.85));

        if manifest.includes_photos {
            let (returned, index) = run_blocking(TASK_ERROR, move || {
                let index = reader.read_entry(PHOTO_INDEX_ENTRY);
                Ok((reader, index))
            })
            .await?;
            reader = returned;
            let index =
                index.map_err(|err| AppError::from(err).with_context("step", "relinking_photos"))?;
            let entries = parse_photo_index(&String::from_utf8_lossy(&index)).map_err(|reason| {
                AppError::new("RESTORE/PHOTO_INDEX", reason).with_context("step", "relinking_photos")
            })?;
            let loose_root = match manifest.photo_mode {
                PhotoMode::Embedded => None,
                PhotoMode::Directory => Some(
                    self.request
                        .photo_dir
                        .clone()
                        .unwrap_or_else(|| loose_photo_dir(&self.request.archive_path)),
                ),
            };

            let total = entries.len();
            for (idx, entry) in entries.iter().enumerate() {
                if !is_safe_relative_path(&entry.relative_path) {
                    return Err(RestoreError::PathTraversal(entry.relative_path.clone()).into());
                }
                let dest = photos_dir.join(&entry.relative_path);
                let entry = entry.clone();
                let loose_root = loose_root.clone();
                let (returned, copied) = run_blocking(TASK_ERROR, move || {
                    let copied = copy_photo(&mut reader, &entry, loose_root.as_deref(), &dest)?;
                    Ok((reader, copied))
                })
                .await?;
                reader = returned;
                if copied {
                    summary.copied += 1;
                }

                let done = idx + 1;
                if done % PHOTO_PROGRESS_BATCH == 0 || done == total {
                    let fraction = 0.85 + 0.1 * done as f64 / total as f64;
                    self.emit(
                        StepProgress::new(RestoreStep::RelinkingPhotos, fraction)
                            .records(done as u64, total as u64),
                    );
                    tokio::task::yield_now().await;
                }
            }
        }

        let refs = load_photo_refs(self.pool, true).await.map_err(|source| {
            AppError::from(RestoreError::Database {
                table: schema::PHOTOS_TABLE.to_string(),
                source,
            })
        })?;
        let absent = run_blocking(TASK_ERROR, move || {
            Ok(refs
                .into_iter()
                .filter(|photo| !photos_dir.join(&photo.relative_path).is_file())
                .collect::<Vec<_>>())
        })
        .await?;
        for photo in absent {
            summary.missing += 1;
            self.warnings.push(format!(
                "Missing {} file {} for {} {}",
                photo.kind, photo.relative_path, photo.table, photo.row_id
            ));
        }
        if summary.missing > 0 {
            tracing::warn!(target: "qreport", event = "restore_photos_missing", missing = summary.missing);
        }
        self.emit(StepProgress::new(RestoreStep::RelinkingPhotos, 1.0));
        Ok(summary)
    }
}

/// Copies one indexed photo into place through a `.partial` sibling.
/// Returns false when a loose source file is absent.
fn copy_photo(
    reader: &mut ArchiveReader,
    entry: &PhotoIndexEntry,
    loose_root: Option<&Path>,
    dest: &Path,
) -> AppResult<bool> {
    let wrap = |err: std::io::Error, path: &Path| {
        AppError::from(err)
            .with_context("operation", "relink_photo")
            .with_context("path", path.display().to_string())
    };
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|err| wrap(err, parent))?;
    }
    let staging = with_suffix(dest, ".partial");
    let mut guard = PartialGuard::new(&staging);

    match loose_root {
        None => {
            reader.extract_to(&entry.entry_name(), &staging)?;
        }
        Some(root) => {
            let source: PathBuf = root.join(entry.entry_name());
            if !source.is_file() {
                tracing::debug!(target: "qreport", event = "restore_loose_photo_missing", path = %source.display());
                return Ok(false);
            }
            fs::copy(&source, &staging).map_err(|err| wrap(err, &source))?;
        }
    }
    fs::rename(&staging, dest).map_err(|err| wrap(err, dest))?;
    guard.disarm();
    Ok(true)
}

fn parse_rows(table: &str, bytes: &[u8]) -> Result<Vec<Value>, RestoreError> {
    let text = String::from_utf8_lossy(bytes);
    let mut rows = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let malformed = |reason: String| RestoreError::MalformedRow {
            table: table.to_string(),
            line: idx as u64 + 1,
            reason,
        };
        let value: Value = serde_json::from_str(trimmed).map_err(|err| malformed(err.to_string()))?;
        if !value.is_object() {
            return Err(malformed("expected object".to_string()));
        }
        rows.push(value);
    }
    Ok(rows)
}

fn insert_fraction(processed: u64, total: u64) -> f64 {
    0.2 + 0.65 * processed as f64 / total as f64
}

fn now_millis() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Prepared insert for one table. Columns are the live columns that appear
/// in the archive rows; values are pulled out of each row's JSON.
#[derive(Debug)]
struct TableInserter {
    sql: String,
    dropped: Vec<String>,
}

impl TableInserter {
    async fn prepare(
        pool: &SqlitePool,
        spec: &TableSpec,
        rows: &[Value],
        strategy: RestoreStrategy,
    ) -> AppResult<Option<Self>> {
        if rows.is_empty() {
            return Ok(None);
        }
        let live: Vec<String> = sqlx::query_scalar("SELECT name FROM pragma_table_info(?1)")
            .bind(spec.name)
            .fetch_all(pool)
            .await
            .map_err(|source| RestoreError::Database {
                table: spec.name.to_string(),
                source,
            })?;

        let archived: BTreeSet<&str> = rows
            .iter()
            .filter_map(Value::as_object)
            .flat_map(|row| row.keys().map(String::as_str))
            .collect();
        let columns: Vec<&str> = live
            .iter()
            .map(String::as_str)
            .filter(|column| archived.contains(column))
            .collect();
        let dropped = archived
            .iter()
            .filter(|key| !live.iter().any(|column| column.as_str() == **key))
            .map(|key| key.to_string())
            .collect();

        let names: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
        let values: Vec<String> = columns.iter().map(|c| json_extract_for_column(c)).collect();
        let mut sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(spec.name),
            names.join(", "),
            values.join(", ")
        );
        if strategy == RestoreStrategy::Merge {
            let updates: Vec<String> = columns
                .iter()
                .filter(|c| **c != spec.primary_key)
                .map(|c| format!("{0} = excluded.{0}", quote_ident(c)))
                .collect();
            let action = if updates.is_empty() {
                "NOTHING".to_string()
            } else {
                format!("UPDATE SET {}", updates.join(", "))
            };
            sql.push_str(&format!(
                " ON CONFLICT({}) DO {action}",
                quote_ident(spec.primary_key)
            ));
        }
        Ok(Some(Self { sql, dropped }))
    }

    async fn insert(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        row: &Value,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(&self.sql)
            .bind(row.to_string())
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}

/// SQL pulling one column out of the bound row. Tagged BLOBs are decoded
/// back to bytes.
fn json_extract_for_column(column: &str) -> String {
    let escaped = column
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\'', "''");
    let path = format!("'$.\"{escaped}\"'");
    let blob_path = format!("'$.\"{escaped}\".\"{BLOB_KEY}\"'");
    format!(
        "CASE json_type(?1, {path}) WHEN 'object' THEN unhex(json_extract(?1, {blob_path})) \
         ELSE json_extract(?1, {path}) END"
    )
}
