use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// How photo files travel with an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhotoMode {
    /// Inside the archive under `photos/` and `thumbnails/`.
    #[default]
    Embedded,
    /// In a sibling `<archive stem>.photos/` directory.
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableEntry {
    pub name: String,
    pub row_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoSummary {
    pub count: u64,
    pub bytes: u64,
    #[serde(default)]
    pub thumbnail_count: u64,
    #[serde(default)]
    pub skipped: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupManifest {
    pub id: String,
    pub created_at: String,
    pub app_schema_version: i64,
    #[serde(default)]
    pub app_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub includes_photos: bool,
    pub includes_thumbnails: bool,
    #[serde(default)]
    pub photo_mode: PhotoMode,
    pub tables: Vec<TableEntry>,
    #[serde(default)]
    pub photos: PhotoSummary,
    #[serde(default)]
    pub total_size_bytes: u64,
    pub checksum: String,
}

impl BackupManifest {
    /// Manifest for a backup that is just starting; counts and checksum are
    /// filled in as the archive is written.
    pub fn begin(
        app_schema_version: i64,
        includes_photos: bool,
        includes_thumbnails: bool,
        photo_mode: PhotoMode,
        description: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            app_schema_version,
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            description: description.filter(|d| !d.trim().is_empty()),
            includes_photos,
            includes_thumbnails: includes_photos && includes_thumbnails,
            photo_mode,
            tables: Vec::new(),
            photos: PhotoSummary::default(),
            total_size_bytes: 0,
            checksum: String::new(),
        }
    }

    pub fn row_count(&self, table: &str) -> Option<u64> {
        self.tables
            .iter()
            .find(|entry| entry.name == table)
            .map(|entry| entry.row_count)
    }

    pub fn total_rows(&self) -> u64 {
        self.tables.iter().map(|entry| entry.row_count).sum()
    }

    pub fn created_at_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    }
}

pub fn file_sha256(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("open {} for hashing", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("read {} for hashing", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn begin_sets_identity_and_drops_thumbnails_without_photos() {
        let manifest = BackupManifest::begin(2, false, true, PhotoMode::Embedded, None);
        assert!(Uuid::parse_str(&manifest.id).is_ok());
        assert!(manifest.created_at.ends_with('Z'));
        assert!(manifest.created_at_utc().is_some());
        assert!(!manifest.includes_thumbnails);
        assert!(manifest.checksum.is_empty());
    }

    #[test]
    fn serializes_wire_field_names() {
        let mut manifest =
            BackupManifest::begin(2, true, true, PhotoMode::Directory, Some("site visit".into()));
        manifest.tables.push(TableEntry {
            name: "clients".into(),
            row_count: 3,
        });
        let value = serde_json::to_value(&manifest).unwrap();
        for key in [
            "id",
            "createdAt",
            "appSchemaVersion",
            "includesPhotos",
            "includesThumbnails",
            "tables",
            "checksum",
        ] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
        assert_eq!(value["tables"][0], json!({"name": "clients", "rowCount": 3}));
        assert_eq!(value["photoMode"], "directory");
    }

    #[test]
    fn parses_minimal_manifest() {
        let manifest: BackupManifest = serde_json::from_value(json!({
            "id": "a",
            "createdAt": "2025-01-01T00:00:00.000Z",
            "appSchemaVersion": 1,
            "includesPhotos": false,
            "includesThumbnails": false,
            "tables": [{"name": "clients", "rowCount": 2}],
            "checksum": "00"
        }))
        .unwrap();
        assert_eq!(manifest.photo_mode, PhotoMode::Embedded);
        assert_eq!(manifest.row_count("clients"), Some(2));
        assert_eq!(manifest.row_count("photos"), None);
        assert_eq!(manifest.total_rows(), 2);
    }

    #[test]
    fn file_sha256_hashes_content() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), b"abc123").unwrap();
        let expected = format!("{:x}", Sha256::digest(b"abc123"));
        assert_eq!(file_sha256(tmp.path()).unwrap(), expected);
    }
}
