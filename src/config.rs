use std::env;
use std::path::{Path, PathBuf};

use crate::{AppError, AppResult};

pub const DB_FILE_NAME: &str = "qreport.sqlite3";
const PHOTOS_DIR_NAME: &str = "photos";
const BACKUPS_DIR_NAME: &str = "backups";
const REPORTS_DIR_NAME: &str = "reports";
const LOGS_DIR_NAME: &str = "logs";

pub const ENV_DATA_DIR: &str = "QREPORT_DATA_DIR";
pub const ENV_BACKUP_DIR: &str = "QREPORT_BACKUP_DIR";
pub const ENV_MAX_COUNT: &str = "QREPORT_BACKUP_MAX_COUNT";
pub const ENV_MAX_BYTES: &str = "QREPORT_BACKUP_MAX_BYTES";
pub const ENV_FAKE_FREE_BYTES: &str = "QREPORT_BACKUP_FAKE_FREE_BYTES";

const DEFAULT_MAX_COUNT: usize = 10;
const HARD_MAX_COUNT: usize = 50;
const DEFAULT_MAX_BYTES: u64 = 2_000_000_000;
const MIN_RETENTION_BYTES: u64 = 10_000_000;
const HARD_MAX_BYTES: u64 = 50_000_000_000;
const REQUIRED_FREE_MULTIPLIER: f64 = 1.2;

/// Where the live database, photos, archives and reports live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePaths {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub photos_dir: PathBuf,
    pub backups_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub logs_dir: PathBuf,
}

impl StoragePaths {
    pub fn from_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            db_path: data_dir.join(DB_FILE_NAME),
            photos_dir: data_dir.join(PHOTOS_DIR_NAME),
            backups_dir: data_dir.join(BACKUPS_DIR_NAME),
            reports_dir: data_dir.join(REPORTS_DIR_NAME),
            logs_dir: data_dir.join(LOGS_DIR_NAME),
            data_dir,
        }
    }

    pub fn with_backups_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.backups_dir = dir.into();
        self
    }

    pub fn ensure_dirs(&self) -> AppResult<()> {
        for dir in [
            &self.data_dir,
            &self.photos_dir,
            &self.backups_dir,
            &self.reports_dir,
        ] {
            std::fs::create_dir_all(dir).map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "ensure_storage_dir")
                    .with_context("path", dir.display().to_string())
            })?;
        }
        Ok(())
    }
}

/// `QREPORT_DATA_DIR`, else the platform data directory.
pub fn default_data_dir() -> AppResult<PathBuf> {
    if let Some(dir) = env::var_os(ENV_DATA_DIR).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    dirs::data_dir()
        .map(|dir| dir.join("qreport"))
        .ok_or_else(|| {
            AppError::new(
                "CONFIG/NO_DATA_DIR",
                "Unable to determine the application data directory",
            )
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionConfig {
    pub max_count: usize,
    pub max_bytes: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_count: DEFAULT_MAX_COUNT,
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }
}

impl RetentionConfig {
    pub fn load() -> Self {
        let max_count = env_parse::<usize>(ENV_MAX_COUNT)
            .filter(|value| *value > 0)
            .map(|value| value.min(HARD_MAX_COUNT))
            .unwrap_or(DEFAULT_MAX_COUNT);
        let max_bytes = env_parse::<u64>(ENV_MAX_BYTES)
            .filter(|value| *value > 0)
            .map(|value| value.clamp(MIN_RETENTION_BYTES, HARD_MAX_BYTES))
            .unwrap_or(DEFAULT_MAX_BYTES);
        Self {
            max_count,
            max_bytes,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub paths: StoragePaths,
    pub retention: RetentionConfig,
    /// Test hook standing in for the free space of the backups volume.
    pub free_space_override: Option<u64>,
    pub required_free_multiplier: f64,
}

impl BackupConfig {
    pub fn new(paths: StoragePaths) -> Self {
        Self {
            paths,
            retention: RetentionConfig::default(),
            free_space_override: None,
            required_free_multiplier: REQUIRED_FREE_MULTIPLIER,
        }
    }

    /// Builds the configuration for `data_dir`, applying environment overrides.
    pub fn load(data_dir: &Path) -> Self {
        let mut paths = StoragePaths::from_data_dir(data_dir);
        if let Some(dir) = env::var_os(ENV_BACKUP_DIR).filter(|v| !v.is_empty()) {
            paths = paths.with_backups_dir(dir);
        }
        Self {
            paths,
            retention: RetentionConfig::load(),
            free_space_override: env_parse::<u64>(ENV_FAKE_FREE_BYTES),
            required_free_multiplier: REQUIRED_FREE_MULTIPLIER,
        }
    }

    pub fn required_free_bytes(&self, estimate: u64) -> u64 {
        (estimate as f64 * self.required_free_multiplier).ceil() as u64
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|value| value.trim().parse::<T>().ok())
}
