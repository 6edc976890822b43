use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use fs2::available_space;
use walkdir::WalkDir;

use crate::{AppError, AppResult};

/// Bytes on disk under `path`; a plain file reports its own length.
pub fn dir_size(path: &Path) -> AppResult<u64> {
    let mut total = 0_u64;
    for entry in WalkDir::new(path) {
        let entry = entry.map_err(|err| {
            AppError::new("IO/WALK", err.to_string())
                .with_context("operation", "dir_size")
                .with_context("path", path.display().to_string())
        })?;
        if entry.file_type().is_file() {
            let meta = entry.metadata().map_err(|err| {
                AppError::new("IO/WALK", err.to_string())
                    .with_context("operation", "dir_size_metadata")
                    .with_context("path", entry.path().display().to_string())
            })?;
            total = total.saturating_add(meta.len());
        }
    }
    Ok(total)
}

/// Free bytes on the volume holding `path`. `override_bytes` wins when set.
pub fn free_disk_space(path: &Path, override_bytes: Option<u64>) -> AppResult<u64> {
    if let Some(value) = override_bytes {
        return Ok(value);
    }

    let target = path
        .ancestors()
        .find(|candidate| candidate.exists())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    available_space(&target).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "available_space")
            .with_context("path", target.display().to_string())
    })
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

pub fn sync_dir(path: &Path) -> io::Result<()> {
    fs::File::open(path)?.sync_all()
}

/// Writes `bytes` next to `path` and renames into place.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(err);
    }
    Ok(())
}

/// Rejects absolute paths and `..` so archive content cannot escape its root.
pub fn is_safe_relative_path(rel: &str) -> bool {
    let path = Path::new(rel);
    !rel.is_empty()
        && !path.is_absolute()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Runs file or archive work on the blocking pool and maps a panicked task to
/// `code`.
pub(crate) async fn run_blocking<T, F>(code: &'static str, work: F) -> AppResult<T>
where
    F: FnOnce() -> AppResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work).await.map_err(|err| {
        AppError::new(code, "File task panicked").with_context("error", err.to_string())
    })?
}

pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut raw = path.as_os_str().to_owned();
    raw.push(suffix);
    PathBuf::from(raw)
}

/// Removes a half-written file or directory unless disarmed.
pub(crate) struct PartialGuard {
    path: PathBuf,
    armed: bool,
}

impl PartialGuard {
    pub(crate) fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            armed: true,
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PartialGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let result = if self.path.is_dir() {
            fs::remove_dir_all(&self.path)
        } else if self.path.exists() {
            fs::remove_file(&self.path)
        } else {
            Ok(())
        };
        if let Err(err) = result {
            tracing::warn!(
                target: "qreport",
                event = "partial_cleanup_failed",
                path = %self.path.display(),
                error = %err
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn relative_path_rules() {
        assert!(is_safe_relative_path("checkups/c1/front.jpg"));
        assert!(is_safe_relative_path("./a.jpg"));
        assert!(!is_safe_relative_path("../outside.jpg"));
        assert!(!is_safe_relative_path("a/../../b.jpg"));
        assert!(!is_safe_relative_path("/etc/passwd"));
        assert!(!is_safe_relative_path(""));
    }

    #[test]
    fn guard_removes_file_and_dir_unless_disarmed() {
        let tmp = tempdir().unwrap();
        let file = tmp.path().join("a.zip.partial");
        let dir = tmp.path().join("a.photos.partial");
        let kept = tmp.path().join("b.zip");
        fs::write(&file, b"x").unwrap();
        fs::create_dir_all(dir.join("photos")).unwrap();
        fs::write(dir.join("photos").join("p.jpg"), b"x").unwrap();
        fs::write(&kept, b"x").unwrap();

        drop(PartialGuard::new(&file));
        drop(PartialGuard::new(&dir));
        let mut guard = PartialGuard::new(&kept);
        guard.disarm();
        drop(guard);

        assert!(!file.exists());
        assert!(!dir.exists());
        assert!(kept.exists());
    }

    #[test]
    fn dir_size_sums_nested_files() {
        let tmp = tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("x/y")).unwrap();
        fs::write(tmp.path().join("x/a"), [0u8; 10]).unwrap();
        fs::write(tmp.path().join("x/y/b"), [0u8; 5]).unwrap();
        assert_eq!(dir_size(tmp.path()).unwrap(), 15);
        assert_eq!(dir_size(&tmp.path().join("x/a")).unwrap(), 10);
    }

    #[test]
    fn fake_free_space_is_honoured() {
        assert_eq!(free_disk_space(Path::new("/nowhere"), Some(12)).unwrap(), 12);
    }

    #[test]
    fn write_atomic_replaces_content() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("report.json");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"two");
        assert!(!with_suffix(&path, ".tmp").exists());
    }

    #[test]
    fn formats_sizes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1_500_000), "1.5 MB");
    }
}
