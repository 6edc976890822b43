use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::archive::{
    file_sha256, loose_photo_dir, ArchiveChecksum, ArchiveError, ArchiveReader, BackupManifest,
    PhotoMode, DATA_PREFIX, MANIFEST_ENTRY, PHOTOS_PREFIX, PHOTO_INDEX_ENTRY, THUMBNAILS_PREFIX,
};
use crate::migrate::{
    is_restorable_schema_version, CURRENT_SCHEMA_VERSION, MIN_RESTORABLE_SCHEMA_VERSION,
};
use crate::photos::{parse_photo_index, PhotoKind};
use crate::schema;
use crate::util::is_safe_relative_path;

/// Oldest app release whose archives this build still reads.
pub const MIN_SUPPORTED_APP_VERSION: &str = "0.1.0";

const HASH_BUFFER: usize = 8192;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ValidationError {
    #[error("archive is unreadable: {reason}")]
    ArchiveUnreadable { reason: String },
    #[error("manifest.json is missing")]
    ManifestMissing,
    #[error("manifest.json is corrupt: {reason}")]
    ManifestCorrupt { reason: String },
    #[error("manifest.json is not the last archive entry")]
    ManifestNotLast,
    #[error("unsupported schema version {found} (supported {min} to {max})")]
    UnsupportedSchemaVersion { found: i64, min: i64, max: i64 },
    #[error("invalid app version {found}: {reason}")]
    AppVersionInvalid { found: String, reason: String },
    #[error("archive app version {found} is older than minimum supported {minimum}")]
    AppVersionTooOld { found: String, minimum: String },
    #[error("checksum mismatch: manifest has {expected}, archive hashes to {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("unknown table {table}")]
    UnknownTable { table: String },
    #[error("data for table {table} is missing")]
    MissingTable { table: String },
    #[error("table {table} declares {expected} rows but holds {actual}")]
    RowCountMismatch {
        table: String,
        expected: u64,
        actual: u64,
    },
    #[error("table {table} line {line} is not a JSON object")]
    MalformedRow { table: String, line: u64 },
    #[error("archive holds {count} photo entries but photos were not included")]
    UnexpectedPhotoEntries { count: u64 },
    #[error("photo index is missing")]
    PhotoIndexMissing,
    #[error("photo index is corrupt: {reason}")]
    PhotoIndexCorrupt { reason: String },
    #[error("photo path {path} escapes the photo directory")]
    UnsafePhotoPath { path: String },
    #[error("photo {path} is missing from the archive")]
    PhotoEntryMissing { path: String },
    #[error("{path} does not match its recorded hash")]
    PhotoHashMismatch { path: String },
    #[error("manifest declares {expected} {kind} files but the index lists {actual}")]
    PhotoCountMismatch {
        kind: PhotoKind,
        expected: u64,
        actual: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<BackupManifest>,
}

impl ValidationResult {
    fn finish(
        errors: Vec<ValidationError>,
        warnings: Vec<String>,
        manifest: Option<BackupManifest>,
    ) -> Self {
        Self {
            is_valid: errors.is_empty(),
            errors,
            warnings,
            manifest,
        }
    }

    fn fail(error: ValidationError) -> Self {
        Self::finish(vec![error], Vec::new(), None)
    }

    pub fn error_messages(&self) -> Vec<String> {
        self.errors.iter().map(ToString::to_string).collect()
    }
}

impl From<ArchiveError> for ValidationError {
    fn from(err: ArchiveError) -> Self {
        match err {
            ArchiveError::ManifestMissing => ValidationError::ManifestMissing,
            ArchiveError::ManifestCorrupt(reason) => ValidationError::ManifestCorrupt { reason },
            other => ValidationError::ArchiveUnreadable {
                reason: other.to_string(),
            },
        }
    }
}

/// Checks an archive without touching the database or the photo directory.
pub fn validate_backup(path: &Path) -> ValidationResult {
    validate_backup_with_photos(path, None)
}

/// Like [`validate_backup`], reading loose photos of a directory-mode
/// archive from `photo_dir` instead of the sibling directory.
pub fn validate_backup_with_photos(path: &Path, photo_dir: Option<&Path>) -> ValidationResult {
    let result = run_validation(path, photo_dir);
    tracing::info!(
        target: "qreport",
        event = "backup_validated",
        path = %path.display(),
        valid = result.is_valid,
        errors = result.errors.len(),
        warnings = result.warnings.len()
    );
    result
}

/// What one pass over the archive entries observed.
#[derive(Default)]
struct EntryScan {
    checksum: ArchiveChecksum,
    data_rows: HashMap<String, u64>,
    photo_hashes: HashMap<String, String>,
    photo_entries: u64,
}

fn run_validation(path: &Path, photo_dir: Option<&Path>) -> ValidationResult {
    let mut reader = match ArchiveReader::open(path) {
        Ok(reader) => reader,
        Err(err) => return ValidationResult::fail(err.into()),
    };
    let manifest = match reader.manifest() {
        Ok(manifest) => manifest,
        Err(err) => return ValidationResult::fail(err.into()),
    };
    if !reader.manifest_is_last() {
        return ValidationResult::finish(
            vec![ValidationError::ManifestNotLast],
            Vec::new(),
            Some(manifest),
        );
    }

    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if !is_restorable_schema_version(manifest.app_schema_version) {
        errors.push(ValidationError::UnsupportedSchemaVersion {
            found: manifest.app_schema_version,
            min: MIN_RESTORABLE_SCHEMA_VERSION,
            max: CURRENT_SCHEMA_VERSION,
        });
    }
    if let Some(err) = check_app_version(&manifest.app_version) {
        errors.push(err);
    }

    let scan = match scan_entries(&mut reader, &mut errors) {
        Ok(scan) => scan,
        Err(err) => {
            errors.push(err);
            return ValidationResult::finish(errors, warnings, Some(manifest));
        }
    };

    let actual = scan.checksum.hex();
    if !actual.eq_ignore_ascii_case(&manifest.checksum) {
        errors.push(ValidationError::ChecksumMismatch {
            expected: manifest.checksum.clone(),
            actual,
        });
    }

    check_tables(&manifest, &scan, &mut errors, &mut warnings);

    if manifest.includes_photos {
        check_photos(&mut reader, &manifest, &scan, photo_dir, &mut errors, &mut warnings);
    } else if scan.photo_entries > 0 {
        errors.push(ValidationError::UnexpectedPhotoEntries {
            count: scan.photo_entries,
        });
    }

    ValidationResult::finish(errors, warnings, Some(manifest))
}

fn check_app_version(found: &str) -> Option<ValidationError> {
    let version = match Version::parse(found) {
        Ok(version) => version,
        Err(err) => {
            return Some(ValidationError::AppVersionInvalid {
                found: found.to_string(),
                reason: err.to_string(),
            })
        }
    };
    let minimum = Version::parse(MIN_SUPPORTED_APP_VERSION).ok()?;
    (version < minimum).then(|| ValidationError::AppVersionTooOld {
        found: version.to_string(),
        minimum: minimum.to_string(),
    })
}

/// Reads every entry before the manifest once, feeding the archive checksum,
/// counting data rows and hashing photo entries.
fn scan_entries(
    reader: &mut ArchiveReader,
    errors: &mut Vec<ValidationError>,
) -> Result<EntryScan, ValidationError> {
    let mut scan = EntryScan::default();
    let names = reader.entry_names().to_vec();

    for (idx, name) in names.iter().enumerate() {
        if name == MANIFEST_ENTRY {
            continue;
        }
        let is_data = name.starts_with(DATA_PREFIX);
        let is_photo = name != PHOTO_INDEX_ENTRY
            && (name.starts_with(PHOTOS_PREFIX) || name.starts_with(THUMBNAILS_PREFIX));

        let mut entry = reader.open_index(idx)?;
        scan.checksum.begin_entry(name);
        let mut entry_hash = Sha256::new();
        let mut content = Vec::new();
        let mut buf = [0u8; HASH_BUFFER];
        loop {
            let n = entry
                .read(&mut buf)
                .map_err(|err| ValidationError::ArchiveUnreadable {
                    reason: format!("failed to read {name}: {err}"),
                })?;
            if n == 0 {
                break;
            }
            scan.checksum.update(&buf[..n]);
            if is_photo {
                entry_hash.update(&buf[..n]);
            }
            if is_data {
                content.extend_from_slice(&buf[..n]);
            }
        }
        scan.checksum.end_entry();

        if is_photo {
            scan.photo_entries += 1;
            scan.photo_hashes
                .insert(name.clone(), format!("{:x}", entry_hash.finalize()));
        }
        if is_data {
            let table = name
                .trim_start_matches(DATA_PREFIX)
                .trim_end_matches(".jsonl")
                .to_string();
            let rows = count_rows(&table, &content, errors);
            scan.data_rows.insert(table, rows);
        }
    }
    Ok(scan)
}

fn count_rows(table: &str, content: &[u8], errors: &mut Vec<ValidationError>) -> u64 {
    let text = String::from_utf8_lossy(content);
    let mut rows = 0;
    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        rows += 1;
        let is_object = serde_json::from_str::<Value>(line)
            .map(|value| value.is_object())
            .unwrap_or(false);
        if !is_object {
            errors.push(ValidationError::MalformedRow {
                table: table.to_string(),
                line: idx as u64 + 1,
            });
        }
    }
    rows
}

fn check_tables(
    manifest: &BackupManifest,
    scan: &EntryScan,
    errors: &mut Vec<ValidationError>,
    warnings: &mut Vec<String>,
) {
    for entry in &manifest.tables {
        if schema::lookup(&entry.name).is_none() {
            errors.push(ValidationError::UnknownTable {
                table: entry.name.clone(),
            });
            continue;
        }
        match scan.data_rows.get(&entry.name) {
            None => errors.push(ValidationError::MissingTable {
                table: entry.name.clone(),
            }),
            Some(&actual) if actual != entry.row_count => {
                errors.push(ValidationError::RowCountMismatch {
                    table: entry.name.clone(),
                    expected: entry.row_count,
                    actual,
                })
            }
            Some(_) => {}
        }
    }

    for spec in schema::tables() {
        if manifest.row_count(spec.name).is_none() {
            warnings.push(format!("Table {} is not in this backup", spec.name));
        }
    }
    let mut undeclared: Vec<_> = scan
        .data_rows
        .keys()
        .filter(|table| manifest.row_count(table).is_none())
        .collect();
    undeclared.sort();
    for table in undeclared {
        warnings.push(format!("Ignoring undeclared data entry for {table}"));
    }
}

fn check_photos(
    reader: &mut ArchiveReader,
    manifest: &BackupManifest,
    scan: &EntryScan,
    photo_dir: Option<&Path>,
    errors: &mut Vec<ValidationError>,
    warnings: &mut Vec<String>,
) {
    let index = match reader.read_entry(PHOTO_INDEX_ENTRY) {
        Ok(bytes) => bytes,
        Err(ArchiveError::EntryMissing(_)) => {
            errors.push(ValidationError::PhotoIndexMissing);
            return;
        }
        Err(err) => {
            errors.push(err.into());
            return;
        }
    };
    let entries = match parse_photo_index(&String::from_utf8_lossy(&index)) {
        Ok(entries) => entries,
        Err(reason) => {
            errors.push(ValidationError::PhotoIndexCorrupt { reason });
            return;
        }
    };

    let mut counts: HashMap<PhotoKind, u64> = HashMap::new();
    for entry in &entries {
        *counts.entry(entry.kind).or_default() += 1;
        if !is_safe_relative_path(&entry.relative_path) {
            errors.push(ValidationError::UnsafePhotoPath {
                path: entry.relative_path.clone(),
            });
        }
    }
    for (kind, expected) in [
        (PhotoKind::Photo, manifest.photos.count),
        (PhotoKind::Thumbnail, manifest.photos.thumbnail_count),
    ] {
        let actual = counts.get(&kind).copied().unwrap_or(0);
        if actual != expected {
            errors.push(ValidationError::PhotoCountMismatch {
                kind,
                expected,
                actual,
            });
        }
    }

    match manifest.photo_mode {
        PhotoMode::Embedded => {
            for entry in entries.iter().filter(|e| is_safe_relative_path(&e.relative_path)) {
                let name = entry.entry_name();
                match scan.photo_hashes.get(&name) {
                    None => errors.push(ValidationError::PhotoEntryMissing { path: name }),
                    Some(hash) if !hash.eq_ignore_ascii_case(&entry.sha256) => {
                        errors.push(ValidationError::PhotoHashMismatch { path: name })
                    }
                    Some(_) => {}
                }
            }
        }
        PhotoMode::Directory => {
            let root = photo_dir
                .map(Path::to_path_buf)
                .unwrap_or_else(|| loose_photo_dir(reader.path()));
            for entry in entries.iter().filter(|e| is_safe_relative_path(&e.relative_path)) {
                let name = entry.entry_name();
                let path = root.join(&name);
                if !path.is_file() {
                    warnings.push(format!("Loose photo {name} is missing"));
                    continue;
                }
                match file_sha256(&path) {
                    Ok(hash) if hash.eq_ignore_ascii_case(&entry.sha256) => {}
                    Ok(_) => errors.push(ValidationError::PhotoHashMismatch { path: name }),
                    Err(err) => warnings.push(format!("Loose photo {name} is unreadable: {err}")),
                }
            }
        }
    }
}
