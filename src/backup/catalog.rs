use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::Serialize;
use walkdir::WalkDir;

use crate::archive::{
    is_archive_file_name, loose_photo_dir, read_manifest, BackupManifest, PARTIAL_SUFFIX,
};
use crate::config::RetentionConfig;
use crate::util::dir_size;
use crate::{AppError, AppResult};

/// Catalog view of one archive on disk. Rebuilt on every listing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupInfo {
    pub id: String,
    pub archive_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub photo_dir: Option<PathBuf>,
    pub size_bytes: u64,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub manifest: BackupManifest,
    #[serde(skip)]
    created: DateTime<Utc>,
}

impl BackupInfo {
    fn load(path: &Path, manifest: BackupManifest) -> AppResult<Self> {
        let archive_bytes = fs::metadata(path)
            .map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "archive_metadata")
                    .with_context("path", path.display().to_string())
            })?
            .len();
        let photo_dir = Some(loose_photo_dir(path)).filter(|dir| dir.is_dir());
        let photo_bytes = match &photo_dir {
            Some(dir) => dir_size(dir)?,
            None => 0,
        };
        let created = manifest
            .created_at_utc()
            .unwrap_or_else(|| fallback_created_at(path));
        Ok(Self {
            id: manifest.id.clone(),
            archive_path: path.to_path_buf(),
            photo_dir,
            size_bytes: archive_bytes + photo_bytes,
            created_at: manifest.created_at.clone(),
            description: manifest.description.clone(),
            manifest,
            created,
        })
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }
}

/// Hands an archive to something outside the engine (a share sheet, a
/// removable drive, an upload queue).
pub trait BackupSharer: Send + Sync {
    fn share(&self, backup: &BackupInfo) -> AppResult<()>;
}

/// Copies the archive, and its loose photo directory if any, into `dest`.
#[derive(Debug, Clone)]
pub struct DirectorySharer {
    dest: PathBuf,
}

impl DirectorySharer {
    pub fn new(dest: impl Into<PathBuf>) -> Self {
        Self { dest: dest.into() }
    }
}

impl BackupSharer for DirectorySharer {
    fn share(&self, backup: &BackupInfo) -> AppResult<()> {
        let wrap = |err: std::io::Error, path: &Path| {
            AppError::from(err)
                .with_context("operation", "share_backup")
                .with_context("path", path.display().to_string())
        };
        fs::create_dir_all(&self.dest).map_err(|err| wrap(err, &self.dest))?;

        let Some(name) = backup.archive_path.file_name() else {
            return Err(AppError::new("CATALOG/INVALID_PATH", "Archive path has no file name"));
        };
        let target = self.dest.join(name);
        fs::copy(&backup.archive_path, &target).map_err(|err| wrap(err, &target))?;

        if let Some(photo_dir) = &backup.photo_dir {
            let Some(dir_name) = photo_dir.file_name() else {
                return Ok(());
            };
            let root = self.dest.join(dir_name);
            for entry in WalkDir::new(photo_dir) {
                let entry = entry.map_err(|err| {
                    AppError::new("IO/WALK", err.to_string()).with_context("operation", "share_backup")
                })?;
                let Ok(rel) = entry.path().strip_prefix(photo_dir) else {
                    continue;
                };
                let out = root.join(rel);
                if entry.file_type().is_dir() {
                    fs::create_dir_all(&out).map_err(|err| wrap(err, &out))?;
                } else {
                    fs::copy(entry.path(), &out).map_err(|err| wrap(err, &out))?;
                }
            }
        }

        tracing::info!(
            target: "qreport",
            event = "backup_shared",
            id = %backup.id,
            dest = %target.display()
        );
        Ok(())
    }
}

/// Archives under `root`, newest first. Unreadable archives and in-flight
/// `.partial` files are skipped.
pub fn list_backups(root: &Path) -> AppResult<Vec<BackupInfo>> {
    if !root.exists() {
        return Ok(Vec::new());
    }

    let mut out = Vec::new();
    let entries = fs::read_dir(root).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "read_backups_dir")
            .with_context("path", root.display().to_string())
    })?;
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(target: "qreport", event = "catalog_entry_unreadable", error = %err);
                continue;
            }
        };
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(PARTIAL_SUFFIX) || !is_archive_file_name(&name) || !path.is_file() {
            continue;
        }

        let manifest = match read_manifest(&path) {
            Ok(manifest) => manifest,
            Err(err) => {
                tracing::warn!(
                    target: "qreport",
                    event = "catalog_skip_invalid",
                    path = %path.display(),
                    error = %err
                );
                continue;
            }
        };
        match BackupInfo::load(&path, manifest) {
            Ok(info) => out.push(info),
            Err(err) => tracing::warn!(
                target: "qreport",
                event = "catalog_skip_invalid",
                path = %path.display(),
                error = %err
            ),
        }
    }

    out.sort_by(|a, b| {
        b.created
            .cmp(&a.created)
            .then_with(|| b.archive_path.cmp(&a.archive_path))
    });
    Ok(out)
}

pub fn find_backup(root: &Path, id: &str) -> AppResult<BackupInfo> {
    list_backups(root)?
        .into_iter()
        .find(|info| info.id == id)
        .ok_or_else(|| {
            AppError::new("CATALOG/NOT_FOUND", "Backup not found").with_context("id", id.to_string())
        })
}

/// Removes the archive and any loose photo directory belonging to it.
pub fn delete_backup(root: &Path, id: &str) -> AppResult<()> {
    let info = find_backup(root, id)?;
    remove_backup_files(&info.archive_path)?;
    tracing::info!(
        target: "qreport",
        event = "backup_deleted",
        id = %info.id,
        path = %info.archive_path.display()
    );
    Ok(())
}

pub fn share_backup(root: &Path, id: &str, sharer: &dyn BackupSharer) -> AppResult<()> {
    let info = find_backup(root, id)?;
    sharer.share(&info)
}

fn remove_backup_files(archive_path: &Path) -> AppResult<()> {
    fs::remove_file(archive_path).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "delete_archive")
            .with_context("path", archive_path.display().to_string())
    })?;
    let photo_dir = loose_photo_dir(archive_path);
    if photo_dir.exists() {
        fs::remove_dir_all(&photo_dir).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "delete_photo_dir")
                .with_context("path", photo_dir.display().to_string())
        })?;
    }
    Ok(())
}

/// Deletes the oldest archives until both retention limits hold. `keep` is
/// never removed.
pub fn apply_retention(
    root: &Path,
    retention: &RetentionConfig,
    keep: &Path,
) -> AppResult<Vec<PathBuf>> {
    let mut records = list_backups(root)?;
    records.reverse();
    let mut total: u64 = records.iter().map(|r| r.size_bytes).sum();
    let mut remaining = records.len();
    let mut removed = Vec::new();

    for record in records {
        if remaining <= retention.max_count && total <= retention.max_bytes {
            break;
        }
        if record.archive_path == keep {
            continue;
        }
        if let Err(err) = remove_backup_files(&record.archive_path) {
            tracing::warn!(
                target: "qreport",
                event = "retention_remove_failed",
                path = %record.archive_path.display(),
                error = %err
            );
            continue;
        }
        tracing::info!(
            target: "qreport",
            event = "retention_removed",
            id = %record.id,
            path = %record.archive_path.display()
        );
        total = total.saturating_sub(record.size_bytes);
        remaining -= 1;
        removed.push(record.archive_path);
    }

    Ok(removed)
}

fn fallback_created_at(path: &Path) -> DateTime<Utc> {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| DateTime::<Utc>::from(SystemTime::UNIX_EPOCH))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{ArchiveWriter, PhotoMode};
    use tempfile::tempdir;

    fn write_archive(dir: &Path, name: &str, created_at: &str) -> (PathBuf, String) {
        let path = dir.join(name);
        let mut writer = ArchiveWriter::create(&path).unwrap();
        writer.append_bytes("data/clients.jsonl", b"").unwrap();
        let mut manifest = BackupManifest::begin(2, false, false, PhotoMode::Embedded, None);
        manifest.created_at = created_at.to_string();
        writer.finish(&mut manifest).unwrap();
        (path, manifest.id)
    }

    #[test]
    fn lists_newest_first_and_skips_junk() {
        let tmp = tempdir().unwrap();
        write_archive(tmp.path(), "qreport-backup-20250101-000000.zip", "2025-01-01T00:00:00.000Z");
        write_archive(tmp.path(), "qreport-backup-20250301-000000.zip", "2025-03-01T00:00:00.000Z");
        fs::write(tmp.path().join("qreport-backup-20250401-000000.zip.partial"), b"half").unwrap();
        fs::write(tmp.path().join("qreport-backup-20250501-000000.zip"), b"corrupt").unwrap();
        fs::write(tmp.path().join("notes.txt"), b"x").unwrap();

        let listed = list_backups(tmp.path()).unwrap();
        let names: Vec<_> = listed
            .iter()
            .map(|b| b.archive_path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec![
                "qreport-backup-20250301-000000.zip",
                "qreport-backup-20250101-000000.zip"
            ]
        );
        assert!(listed[0].size_bytes > 0);
    }

    #[test]
    fn delete_removes_archive_and_photo_dir() {
        let tmp = tempdir().unwrap();
        let (path, id) = write_archive(
            tmp.path(),
            "qreport-backup-20250101-000000.zip",
            "2025-01-01T00:00:00.000Z",
        );
        let photos = loose_photo_dir(&path);
        fs::create_dir_all(photos.join("photos")).unwrap();
        fs::write(photos.join("photos/a.jpg"), b"img").unwrap();

        let info = find_backup(tmp.path(), &id).unwrap();
        assert_eq!(info.photo_dir.as_deref(), Some(photos.as_path()));

        delete_backup(tmp.path(), &id).unwrap();
        assert!(!path.exists());
        assert!(!photos.exists());
        assert_eq!(
            delete_backup(tmp.path(), &id).unwrap_err().code(),
            "CATALOG/NOT_FOUND"
        );
    }

    #[test]
    fn retention_drops_oldest_but_never_keep() {
        let tmp = tempdir().unwrap();
        let (oldest, _) = write_archive(tmp.path(), "qreport-backup-20250101-000000.zip", "2025-01-01T00:00:00.000Z");
        let (middle, _) = write_archive(tmp.path(), "qreport-backup-20250201-000000.zip", "2025-02-01T00:00:00.000Z");
        let (newest, _) = write_archive(tmp.path(), "qreport-backup-20250301-000000.zip", "2025-03-01T00:00:00.000Z");

        let removed = apply_retention(
            tmp.path(),
            &RetentionConfig { max_count: 2, max_bytes: u64::MAX },
            &newest,
        )
        .unwrap();
        assert_eq!(removed, vec![oldest.clone()]);
        assert!(middle.exists());

        let removed = apply_retention(
            tmp.path(),
            &RetentionConfig { max_count: 10, max_bytes: 1 },
            &newest,
        )
        .unwrap();
        assert_eq!(removed, vec![middle]);
        assert!(newest.exists());
    }

    struct RecordingSharer(std::sync::Mutex<Vec<String>>);

    impl BackupSharer for RecordingSharer {
        fn share(&self, backup: &BackupInfo) -> AppResult<()> {
            self.0.lock().unwrap().push(backup.id.clone());
            Ok(())
        }
    }

    #[test]
    fn share_hands_backup_to_sharer() {
        let tmp = tempdir().unwrap();
        let (path, id) = write_archive(tmp.path(), "qreport-backup-20250101-000000.zip", "2025-01-01T00:00:00.000Z");

        let recorder = RecordingSharer(Default::default());
        share_backup(tmp.path(), &id, &recorder).unwrap();
        assert_eq!(recorder.0.lock().unwrap().as_slice(), &[id.clone()]);

        let out = tempdir().unwrap();
        share_backup(tmp.path(), &id, &DirectorySharer::new(out.path())).unwrap();
        assert!(out.path().join(path.file_name().unwrap()).exists());
    }
}
