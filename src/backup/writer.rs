use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;

use super::catalog::apply_retention;
use super::estimate::estimate_size;
use super::{BackupOptions, BackupOutcome};
use crate::archive::{
    loose_photo_dir, unique_archive_path, ArchiveWriter, BackupManifest, PhotoMode, TableEntry,
    PARTIAL_SUFFIX, PHOTO_INDEX_ENTRY,
};
use crate::config::BackupConfig;
use crate::db::row_to_json;
use crate::photos::{load_photo_refs, PhotoIndexEntry, PhotoKind};
use crate::progress::{BackupProgress, BackupStep, ProgressSender, StepProgress};
use crate::schema::{self, quote_ident, TableSpec};
use crate::state::CancelHandle;
use crate::util::{
    format_bytes, free_disk_space, is_safe_relative_path, run_blocking, sync_dir, with_suffix,
    PartialGuard,
};
use crate::{migrate, AppError, AppResult};

const PHOTO_PROGRESS_BATCH: usize = 10;
const TASK_ERROR: &str = "BACKUP/TASK";

/// Rows of one table read with a single query, ordered by primary key.
#[derive(Debug, Clone)]
pub struct TableSnapshot {
    pub table: &'static str,
    pub rows: Vec<Value>,
}

impl TableSnapshot {
    pub async fn capture(pool: &SqlitePool, spec: &'static TableSpec) -> AppResult<Self> {
        let sql = format!(
            "SELECT * FROM {} ORDER BY {}",
            quote_ident(spec.name),
            quote_ident(spec.primary_key)
        );
        let rows = sqlx::query(&sql).fetch_all(pool).await?;
        let rows = rows
            .iter()
            .map(row_to_json)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            table: spec.name,
            rows,
        })
    }

    pub fn row_count(&self) -> u64 {
        self.rows.len() as u64
    }

    /// One JSON object per line.
    pub fn to_jsonl(&self) -> serde_json::Result<Vec<u8>> {
        let mut out = Vec::new();
        for row in &self.rows {
            serde_json::to_writer(&mut out, row)?;
            out.push(b'\n');
        }
        Ok(out)
    }
}

pub(crate) struct BackupWriter<'a> {
    pool: &'a SqlitePool,
    config: &'a BackupConfig,
    options: &'a BackupOptions,
    progress: &'a ProgressSender<BackupProgress>,
    cancel: &'a CancelHandle,
    step: BackupStep,
}

impl<'a> BackupWriter<'a> {
    pub(crate) fn new(
        pool: &'a SqlitePool,
        config: &'a BackupConfig,
        options: &'a BackupOptions,
        progress: &'a ProgressSender<BackupProgress>,
        cancel: &'a CancelHandle,
    ) -> Self {
        Self {
            pool,
            config,
            options,
            progress,
            cancel,
            step: BackupStep::Preparing,
        }
    }

    /// Step the writer was in when it last stopped.
    pub(crate) fn step(&self) -> BackupStep {
        self.step
    }

    fn emit(&mut self, update: StepProgress<BackupStep>) {
        self.step = update.step;
        self.progress.emit(BackupProgress::InProgress(update));
    }

    pub(crate) async fn run(&mut self) -> AppResult<BackupOutcome> {
        let config = self.config;
        let paths = &config.paths;
        let options = self.options;
        self.emit(StepProgress::new(BackupStep::Preparing, 0.0));

        fs::create_dir_all(&paths.backups_dir).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "create_backups_dir")
                .with_context("path", paths.backups_dir.display().to_string())
        })?;

        let schema_version = migrate::schema_version(self.pool)
            .await
            .map_err(|err| AppError::from(err).with_context("operation", "schema_version"))?;

        let estimate = estimate_size(
            self.pool,
            &paths.photos_dir,
            options.include_photos,
            options.include_thumbnails,
        )
        .await;
        let required = config.required_free_bytes(estimate.total_bytes());
        let available = free_disk_space(&paths.backups_dir, config.free_space_override)?;
        if available < required {
            return Err(AppError::new(
                "BACKUP/LOW_DISK",
                format!("Not enough disk space (need ~{}).", format_bytes(required)),
            )
            .with_context("available_bytes", available.to_string())
            .with_context("required_bytes", required.to_string()));
        }

        let archive_path = unique_archive_path(&paths.backups_dir, &Utc::now())?;
        let partial_path = with_suffix(&archive_path, PARTIAL_SUFFIX);
        let mut archive_guard = PartialGuard::new(&partial_path);

        let loose_dir = (options.include_photos && options.mode == PhotoMode::Directory)
            .then(|| loose_photo_dir(&archive_path));
        let loose_guard = match &loose_dir {
            Some(dir) => {
                let staging = with_suffix(dir, PARTIAL_SUFFIX);
                let guard = PartialGuard::new(&staging);
                fs::create_dir_all(&staging).map_err(|err| {
                    AppError::from(err)
                        .with_context("operation", "create_photo_dir")
                        .with_context("path", staging.display().to_string())
                })?;
                Some(guard)
            }
            None => None,
        };

        let mut manifest = BackupManifest::begin(
            schema_version,
            options.include_photos,
            options.include_thumbnails,
            options.mode,
            options.description.clone(),
        );
        tracing::info!(
            target: "qreport",
            event = "backup_started",
            id = %manifest.id,
            path = %archive_path.display(),
            include_photos = manifest.includes_photos,
            include_thumbnails = manifest.includes_thumbnails,
            estimate_bytes = estimate.total_bytes()
        );

        let create_path = partial_path.clone();
        let writer = run_blocking(TASK_ERROR, move || ArchiveWriter::create(&create_path)).await?;
        let mut writer = self.write_tables(writer, &mut manifest).await?;

        let mut warnings = Vec::new();
        if options.include_photos {
            let staging = loose_guard.as_ref().map(|guard| guard.path().to_path_buf());
            writer = self
                .write_photos(writer, &mut manifest, staging, &mut warnings)
                .await?;
        }

        self.cancel.seal()?;
        self.emit(StepProgress::new(BackupStep::Finalizing, 0.97).cancellable(false));

        let published_archive = archive_path.clone();
        let published_loose = loose_dir.clone();
        let backups_dir = paths.backups_dir.clone();
        let manifest = run_blocking(TASK_ERROR, move || {
            writer.finish(&mut manifest)?;

            // Photo directory goes live before the archive does.
            let mut published_dir = None;
            if let (Some(dir), Some(mut guard)) = (published_loose, loose_guard) {
                rename(guard.path(), &dir, "publish_photo_dir")?;
                guard.disarm();
                published_dir = Some(PartialGuard::new(dir));
            }
            rename(archive_guard.path(), &published_archive, "publish_archive")?;
            archive_guard.disarm();
            if let Some(guard) = published_dir.as_mut() {
                guard.disarm();
            }
            sync_dir(&backups_dir).ok();
            Ok(manifest)
        })
        .await?;

        tracing::info!(
            target: "qreport",
            event = "backup_completed",
            id = %manifest.id,
            path = %archive_path.display(),
            rows = manifest.total_rows(),
            photos = manifest.photos.count,
            bytes = manifest.total_size_bytes,
            warnings = warnings.len()
        );

        if let Err(err) = apply_retention(&paths.backups_dir, &config.retention, &archive_path) {
            tracing::warn!(target: "qreport", event = "retention_failed", error = %err);
        }

        Ok(BackupOutcome {
            archive_path,
            photo_dir: loose_dir,
            manifest,
            warnings,
        })
    }

    async fn write_tables(
        &mut self,
        mut writer: ArchiveWriter,
        manifest: &mut BackupManifest,
    ) -> AppResult<ArchiveWriter> {
        let specs = schema::tables();
        let share = if self.options.include_photos { 0.8 } else { 0.95 };
        self.emit(StepProgress::new(BackupStep::Tables, 0.0).records(0, specs.len() as u64));
        for (idx, spec) in specs.iter().enumerate() {
            self.cancel.checkpoint()?;
            let snapshot = TableSnapshot::capture(self.pool, spec)
                .await
                .map_err(|err| table_error(err, spec.name, "snapshot_table"))?;
            let payload = snapshot
                .to_jsonl()
                .map_err(|err| table_error(err.into(), spec.name, "serialize_table"))?;
            let entry = spec.data_entry();
            writer = run_blocking(TASK_ERROR, move || {
                writer.append_bytes(&entry, &payload)?;
                Ok(writer)
            })
            .await
            .map_err(|err| table_error(err, spec.name, "write_table"))?;

            let rows = snapshot.row_count();
            manifest.tables.push(TableEntry {
                name: spec.name.to_string(),
                row_count: rows,
            });
            tracing::debug!(target: "qreport", event = "backup_table_written", table = spec.name, rows);

            let fraction = share * (idx + 1) as f64 / specs.len() as f64;
            self.emit(StepProgress::new(BackupStep::Tables, fraction).table(spec.name, rows, rows));
            tokio::task::yield_now().await;
        }
        Ok(writer)
    }

    async fn write_photos(
        &mut self,
        mut writer: ArchiveWriter,
        manifest: &mut BackupManifest,
        staging: Option<PathBuf>,
        warnings: &mut Vec<String>,
    ) -> AppResult<ArchiveWriter> {
        let config = self.config;
        let photos_dir = &config.paths.photos_dir;
        let refs = load_photo_refs(self.pool, manifest.includes_thumbnails)
            .await
            .map_err(|err| table_error(err.into(), schema::PHOTOS_TABLE, "load_photo_refs"))?;
        let total = refs.len();
        self.emit(StepProgress::new(BackupStep::Photos, 0.8).records(0, total as u64));

        let mut index = Vec::with_capacity(total);
        for (idx, photo) in refs.iter().enumerate() {
            self.cancel.checkpoint()?;
            if !is_safe_relative_path(&photo.relative_path) {
                warnings.push(format!(
                    "Skipped {} with unsafe path {} (row {})",
                    photo.kind, photo.relative_path, photo.row_id
                ));
                manifest.photos.skipped += 1;
                continue;
            }

            let source = photos_dir.join(&photo.relative_path);
            let entry_name = photo.kind.entry_name(&photo.relative_path);
            let dest = staging.as_ref().map(|dir| dir.join(&entry_name));
            let copy_source = source.clone();
            let (returned, stored) = run_blocking(TASK_ERROR, move || {
                let stored = store_photo(&mut writer, &copy_source, &entry_name, dest.as_deref())?;
                Ok((writer, stored))
            })
            .await?;
            writer = returned;

            let Some((size, sha256)) = stored else {
                tracing::warn!(
                    target: "qreport",
                    event = "backup_photo_missing",
                    path = %source.display(),
                    row_id = %photo.row_id
                );
                warnings.push(format!("Missing {} file {}", photo.kind, photo.relative_path));
                manifest.photos.skipped += 1;
                continue;
            };
            match photo.kind {
                PhotoKind::Photo => manifest.photos.count += 1,
                PhotoKind::Thumbnail => manifest.photos.thumbnail_count += 1,
            }
            manifest.photos.bytes += size;
            index.push(PhotoIndexEntry {
                kind: photo.kind,
                relative_path: photo.relative_path.clone(),
                sha256,
                size,
            });

            let done = idx + 1;
            if done % PHOTO_PROGRESS_BATCH == 0 || done == total {
                let fraction = 0.8 + 0.15 * done as f64 / total as f64;
                self.emit(
                    StepProgress::new(BackupStep::Photos, fraction).records(done as u64, total as u64),
                );
                tokio::task::yield_now().await;
            }
        }

        let listing = index
            .iter()
            .map(PhotoIndexEntry::to_line)
            .collect::<serde_json::Result<String>>()?;
        run_blocking(TASK_ERROR, move || {
            writer.append_bytes(PHOTO_INDEX_ENTRY, listing.as_bytes())?;
            Ok(writer)
        })
        .await
    }
}

fn table_error(err: AppError, table: &str, operation: &'static str) -> AppError {
    err.with_context("table", table.to_string())
        .with_context("operation", operation)
}

fn rename(from: &Path, to: &Path, operation: &'static str) -> AppResult<()> {
    fs::rename(from, to).map_err(|err| {
        AppError::from(err)
            .with_context("operation", operation)
            .with_context("from", from.display().to_string())
            .with_context("to", to.display().to_string())
    })
}

/// Copies one photo into the archive or the staging directory. `None` when
/// the source file is gone.
fn store_photo(
    writer: &mut ArchiveWriter,
    source: &Path,
    entry_name: &str,
    dest: Option<&Path>,
) -> AppResult<Option<(u64, String)>> {
    let mut file = match File::open(source) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(AppError::from(err)
                .with_context("operation", "open_photo")
                .with_context("path", source.display().to_string()))
        }
    };
    let stored = match dest {
        Some(dest) => copy_and_hash(&mut file, dest)?,
        None => writer.append_reader(entry_name, &mut file)?,
    };
    Ok(Some(stored))
}

fn copy_and_hash(source: &mut File, dest: &Path) -> AppResult<(u64, String)> {
    let wrap = |err: io::Error| {
        AppError::from(err)
            .with_context("operation", "copy_photo")
            .with_context("path", dest.display().to_string())
    };
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(wrap)?;
    }
    let mut out = File::create(dest).map_err(wrap)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    let mut size = 0_u64;
    loop {
        let n = source.read(&mut buf).map_err(wrap)?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n]).map_err(wrap)?;
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    out.sync_all().map_err(wrap)?;
    Ok((size, format!("{:x}", hasher.finalize())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoragePaths;
    use crate::migrate::apply_migrations;
    use crate::progress::progress_channel;
    use sqlx::sqlite::SqlitePoolOptions;
    use tempfile::tempdir;

    async fn seeded_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        apply_migrations(&pool).await.unwrap();
        sqlx::query("INSERT INTO clients (id, name, created_at, updated_at) VALUES ('b', 'Beta', 1, 1), ('a', 'Acme', 1, 1)")
            .execute(&pool)
            .await
            .unwrap();
        pool
    }

    #[tokio::test]
    async fn snapshot_orders_by_primary_key() {
        let pool = seeded_pool().await;
        let spec = schema::lookup("clients").unwrap();
        let snapshot = TableSnapshot::capture(&pool, spec).await.unwrap();
        assert_eq!(snapshot.row_count(), 2);
        assert_eq!(snapshot.rows[0]["id"], "a");
        let text = String::from_utf8(snapshot.to_jsonl().unwrap()).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.ends_with('\n'));
    }

    #[tokio::test]
    async fn low_disk_refuses_before_creating_files() {
        let pool = seeded_pool().await;
        let tmp = tempdir().unwrap();
        let mut config = BackupConfig::new(StoragePaths::from_data_dir(tmp.path()));
        config.free_space_override = Some(1);
        let options = BackupOptions::default();
        let (tx, _rx) = progress_channel();
        let cancel = CancelHandle::new();

        let mut writer = BackupWriter::new(&pool, &config, &options, &tx, &cancel);
        let err = writer.run().await.unwrap_err();
        assert_eq!(err.code(), "BACKUP/LOW_DISK");
        assert_eq!(writer.step(), BackupStep::Preparing);
        assert_eq!(fs::read_dir(&config.paths.backups_dir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn finished_run_is_sealed_against_cancel() {
        let pool = seeded_pool().await;
        let tmp = tempdir().unwrap();
        let config = BackupConfig::new(StoragePaths::from_data_dir(tmp.path()));
        let options = BackupOptions {
            include_photos: false,
            ..BackupOptions::default()
        };
        let (tx, _rx) = progress_channel();
        let cancel = CancelHandle::new();

        let mut writer = BackupWriter::new(&pool, &config, &options, &tx, &cancel);
        let outcome = writer.run().await.unwrap();
        assert_eq!(writer.step(), BackupStep::Finalizing);
        assert!(outcome.archive_path.is_file());
        assert!(cancel.is_sealed());
        assert!(!cancel.cancel());
    }

    #[tokio::test]
    async fn cancelled_run_leaves_no_partial_files() {
        let pool = seeded_pool().await;
        let tmp = tempdir().unwrap();
        let config = BackupConfig::new(StoragePaths::from_data_dir(tmp.path()));
        let options = BackupOptions {
            mode: PhotoMode::Directory,
            ..BackupOptions::default()
        };
        let (tx, _rx) = progress_channel();
        let cancel = CancelHandle::new();
        cancel.cancel();

        let mut writer = BackupWriter::new(&pool, &config, &options, &tx, &cancel);
        let err = writer.run().await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(writer.step(), BackupStep::Preparing);
        assert_eq!(fs::read_dir(&config.paths.backups_dir).unwrap().count(), 0);
    }
}
