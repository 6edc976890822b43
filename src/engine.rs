use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use sqlx::SqlitePool;
use tokio::task::JoinHandle;

use crate::backup::writer::BackupWriter;
use crate::backup::{self, BackupInfo, BackupOptions, BackupSharer, BackupSizeEstimate};
use crate::config::BackupConfig;
use crate::progress::{
    progress_channel, BackupProgress, OperationFailure, ProgressStream, RestoreProgress, Terminal,
};
use crate::restore::execute::RestoreRunner;
use crate::restore::{validate_backup_with_photos, RestoreRequest, ValidationResult};
use crate::state::{CancelHandle, OperationKind, OperationLock};
use crate::{db, migrate, AppError, AppResult};

/// A running backup or restore. Yields progress events and ends after the
/// terminal one.
pub struct Job<P> {
    progress: ProgressStream<P>,
    cancel: CancelHandle,
    handle: JoinHandle<()>,
}

pub type BackupJob = Job<BackupProgress>;
pub type RestoreJob = Job<RestoreProgress>;

impl<P: Terminal> Job<P> {
    /// Asks the job to stop at its next checkpoint. Returns false once the
    /// job is past the point where stopping is safe.
    pub fn cancel(&self) -> bool {
        self.cancel.cancel()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Drains the remaining events and returns the terminal one.
    pub async fn wait(mut self) -> AppResult<P> {
        let mut last = None;
        while let Some(event) = self.progress.next().await {
            if event.is_terminal() {
                last = Some(event);
            }
        }
        if let Err(err) = (&mut self.handle).await {
            tracing::error!(target: "qreport", event = "job_join_failed", error = %err);
        }
        last.ok_or_else(|| AppError::new("JOB/ABORTED", "Job ended without a result"))
    }
}

impl<P> Stream for Job<P> {
    type Item = P;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<P>> {
        Pin::new(&mut self.get_mut().progress).poll_next(cx)
    }
}

/// Entry point for backup, restore and catalog operations on one data
/// directory. At most one backup, restore or delete runs at a time.
#[derive(Clone)]
pub struct BackupEngine {
    pool: SqlitePool,
    config: Arc<BackupConfig>,
    lock: OperationLock,
}

impl BackupEngine {
    pub fn new(pool: SqlitePool, config: BackupConfig) -> Self {
        Self {
            pool,
            config: Arc::new(config),
            lock: OperationLock::new(),
        }
    }

    /// Creates the storage directories, opens the database and brings its
    /// schema up to date.
    pub async fn open(config: BackupConfig) -> AppResult<Self> {
        config.paths.ensure_dirs()?;
        let pool = db::open_sqlite_pool(&config.paths.db_path).await?;
        migrate::apply_migrations(&pool)
            .await
            .map_err(|err| AppError::from(err).with_context("operation", "apply_migrations"))?;
        Ok(Self::new(pool, config))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    pub fn is_busy(&self) -> bool {
        self.lock.is_active()
    }

    pub async fn estimate_size(
        &self,
        include_photos: bool,
        include_thumbnails: bool,
    ) -> BackupSizeEstimate {
        backup::estimate_size(
            &self.pool,
            &self.config.paths.photos_dir,
            include_photos,
            include_thumbnails,
        )
        .await
    }

    /// Starts a backup on the current tokio runtime. Fails with
    /// `BACKUP/BUSY` without doing any work when another operation runs.
    pub fn start_backup(&self, options: BackupOptions) -> AppResult<BackupJob> {
        let permit = self.lock.try_acquire(OperationKind::Backup)?;
        let (tx, progress) = progress_channel();
        let cancel = CancelHandle::new();
        let job_cancel = cancel.clone();
        let pool = self.pool.clone();
        let config = Arc::clone(&self.config);

        let handle = tokio::spawn(async move {
            let mut writer = BackupWriter::new(&pool, &config, &options, &tx, &job_cancel);
            let result = writer.run().await;
            let step = writer.step();
            let terminal = match result {
                Ok(outcome) => BackupProgress::Completed {
                    archive_path: outcome.archive_path,
                    manifest: outcome.manifest,
                    warnings: outcome.warnings,
                },
                Err(err) => {
                    log_failure("backup", &err);
                    BackupProgress::Error(OperationFailure::from_error(&err, Some(step)))
                }
            };
            job_cancel.close();
            drop(permit);
            tx.emit(terminal);
        });

        Ok(Job {
            progress,
            cancel,
            handle,
        })
    }

    /// Starts a restore on the current tokio runtime. The archive is
    /// validated again inside the job before anything is touched.
    pub fn start_restore(&self, request: RestoreRequest) -> AppResult<RestoreJob> {
        let permit = self.lock.try_acquire(OperationKind::Restore)?;
        let (tx, progress) = progress_channel();
        let cancel = CancelHandle::new();
        let job_cancel = cancel.clone();
        let pool = self.pool.clone();
        let config = Arc::clone(&self.config);

        let handle = tokio::spawn(async move {
            let mut runner = RestoreRunner::new(&pool, &config, &request, &tx, &job_cancel);
            let result = runner.run().await;
            let step = runner.step();
            let terminal = match result {
                Ok(report) => RestoreProgress::Completed {
                    archive_path: request.archive_path.clone(),
                    report,
                },
                Err(err) => {
                    log_failure("restore", &err);
                    RestoreProgress::Error(OperationFailure::from_error(&err, Some(step)))
                }
            };
            job_cancel.close();
            drop(permit);
            tx.emit(terminal);
        });

        Ok(Job {
            progress,
            cancel,
            handle,
        })
    }

    pub async fn validate(&self, path: &Path) -> AppResult<ValidationResult> {
        self.validate_with_photos(path, None).await
    }

    pub async fn validate_with_photos(
        &self,
        path: &Path,
        photo_dir: Option<&Path>,
    ) -> AppResult<ValidationResult> {
        let path = path.to_path_buf();
        let photo_dir = photo_dir.map(Path::to_path_buf);
        tokio::task::spawn_blocking(move || validate_backup_with_photos(&path, photo_dir.as_deref()))
            .await
            .map_err(|err| AppError::new("BACKUP/VALIDATION_TASK", err.to_string()))
    }

    pub fn list_backups(&self) -> AppResult<Vec<BackupInfo>> {
        backup::list_backups(&self.config.paths.backups_dir)
    }

    pub fn find_backup(&self, id: &str) -> AppResult<BackupInfo> {
        backup::find_backup(&self.config.paths.backups_dir, id)
    }

    /// Resolves a catalog id or a path to an archive file.
    pub fn locate_archive(&self, target: &str) -> AppResult<PathBuf> {
        let as_path = Path::new(target);
        if as_path.is_file() {
            return Ok(as_path.to_path_buf());
        }
        Ok(self.find_backup(target)?.archive_path)
    }

    /// Deletes a backup. Shares the exclusivity slot with backup and restore.
    pub fn delete_backup(&self, id: &str) -> AppResult<()> {
        let _permit = self.lock.try_acquire(OperationKind::Delete)?;
        backup::delete_backup(&self.config.paths.backups_dir, id)
    }

    pub fn share_backup(&self, id: &str, sharer: &dyn BackupSharer) -> AppResult<()> {
        backup::share_backup(&self.config.paths.backups_dir, id, sharer)
    }
}

fn log_failure(operation: &'static str, err: &AppError) {
    if err.is_cancelled() {
        tracing::info!(target: "qreport", event = "operation_cancelled", operation);
    } else {
        tracing::error!(
            target: "qreport",
            event = "operation_failed",
            operation,
            code = %err.code(),
            error = %err
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoragePaths;
    use tempfile::tempdir;

    #[tokio::test]
    async fn open_creates_storage_and_migrates() {
        let tmp = tempdir().unwrap();
        let config = BackupConfig::new(StoragePaths::from_data_dir(tmp.path()));
        let engine = BackupEngine::open(config).await.unwrap();
        assert!(engine.config().paths.db_path.exists());
        assert!(engine.config().paths.backups_dir.is_dir());
        assert_eq!(
            migrate::schema_version(engine.pool()).await.unwrap(),
            migrate::CURRENT_SCHEMA_VERSION
        );
        assert!(engine.list_backups().unwrap().is_empty());
        assert!(!engine.is_busy());
    }

    #[tokio::test]
    async fn failed_backup_ends_with_error_event_and_frees_the_slot() {
        let tmp = tempdir().unwrap();
        let mut config = BackupConfig::new(StoragePaths::from_data_dir(tmp.path()));
        config.free_space_override = Some(0);
        let engine = BackupEngine::open(config).await.unwrap();
        sqlx::query("INSERT INTO clients (id, name, created_at, updated_at) VALUES ('c1', 'Acme', 0, 0)")
            .execute(engine.pool())
            .await
            .unwrap();

        let job = engine.start_backup(BackupOptions::default()).unwrap();
        match job.wait().await.unwrap() {
            BackupProgress::Error(failure) => assert_eq!(failure.code, "BACKUP/LOW_DISK"),
            other => panic!("unexpected terminal event {other:?}"),
        }
        assert!(!engine.is_busy());
    }

    #[tokio::test]
    async fn delete_of_unknown_backup_reports_not_found() {
        let tmp = tempdir().unwrap();
        let engine =
            BackupEngine::open(BackupConfig::new(StoragePaths::from_data_dir(tmp.path())))
                .await
                .unwrap();
        let err = engine.delete_backup("missing").unwrap_err();
        assert_eq!(err.code(), "CATALOG/NOT_FOUND");
        assert!(!engine.is_busy());
    }
}
