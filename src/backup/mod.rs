pub mod catalog;
pub mod estimate;
pub mod writer;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::archive::{BackupManifest, PhotoMode};

pub use catalog::{
    apply_retention, delete_backup, find_backup, list_backups, share_backup, BackupInfo,
    BackupSharer, DirectorySharer,
};
pub use estimate::{estimate_size, BackupSizeEstimate};
pub use writer::TableSnapshot;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupOptions {
    pub include_photos: bool,
    /// Ignored unless `include_photos` is set.
    pub include_thumbnails: bool,
    #[serde(default)]
    pub mode: PhotoMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            include_photos: true,
            include_thumbnails: true,
            mode: PhotoMode::Embedded,
            description: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupOutcome {
    pub archive_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_dir: Option<PathBuf>,
    pub manifest: BackupManifest,
    pub warnings: Vec<String>,
}
