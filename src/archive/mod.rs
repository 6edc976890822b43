//! Backup archive container.
//!
//! An archive is a zip file whose entries appear in this order: one
//! `data/<table>.jsonl` per registry table, the optional photo compartment
//! (`photos/...`, `thumbnails/...`, `photo-index.jsonl`) and finally
//! `manifest.json`. The manifest checksum covers every entry before it: for
//! each, in archive order, the entry name, a NUL byte, the uncompressed
//! content and another NUL byte are fed to SHA-256.

pub mod manifest;

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;
use zip::read::ZipFile;
use zip::result::ZipError;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

pub use manifest::{file_sha256, BackupManifest, PhotoMode, PhotoSummary, TableEntry};

use crate::{AppError, AppResult};

pub const MANIFEST_ENTRY: &str = "manifest.json";
pub const DATA_PREFIX: &str = "data/";
pub const PHOTOS_PREFIX: &str = "photos/";
pub const THUMBNAILS_PREFIX: &str = "thumbnails/";
pub const PHOTO_INDEX_ENTRY: &str = "photo-index.jsonl";

pub const ARCHIVE_PREFIX: &str = "qreport-backup-";
pub const ARCHIVE_EXTENSION: &str = "zip";
pub const PARTIAL_SUFFIX: &str = ".partial";
pub const LOOSE_PHOTOS_SUFFIX: &str = ".photos";

const COPY_BUFFER: usize = 8192;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("failed to open archive {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("archive {path} is not a readable zip file: {source}")]
    Container {
        path: String,
        #[source]
        source: ZipError,
    },
    #[error("archive has no manifest")]
    ManifestMissing,
    #[error("archive manifest is corrupt: {0}")]
    ManifestCorrupt(String),
    #[error("archive entry {0} is missing")]
    EntryMissing(String),
    #[error("failed to read archive entry {name}: {source}")]
    EntryIo {
        name: String,
        #[source]
        source: io::Error,
    },
}

impl ArchiveError {
    fn code(&self) -> &'static str {
        match self {
            ArchiveError::Open { .. } => "ARCHIVE/OPEN",
            ArchiveError::Container { .. } => "ARCHIVE/CONTAINER",
            ArchiveError::ManifestMissing => "ARCHIVE/MANIFEST_MISSING",
            ArchiveError::ManifestCorrupt(_) => "ARCHIVE/MANIFEST_CORRUPT",
            ArchiveError::EntryMissing(_) => "ARCHIVE/ENTRY_MISSING",
            ArchiveError::EntryIo { .. } => "ARCHIVE/ENTRY_IO",
        }
    }
}

impl From<ArchiveError> for AppError {
    fn from(err: ArchiveError) -> Self {
        AppError::new(err.code(), err.to_string())
    }
}

/// Running hash over archive entries in write order.
#[derive(Clone, Default)]
pub struct ArchiveChecksum {
    hasher: Sha256,
}

impl ArchiveChecksum {
    pub fn begin_entry(&mut self, name: &str) {
        self.hasher.update(name.as_bytes());
        self.hasher.update([0u8]);
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    pub fn end_entry(&mut self) {
        self.hasher.update([0u8]);
    }

    pub fn hex(&self) -> String {
        format!("{:x}", self.hasher.clone().finalize())
    }
}

/// Streams entries into a zip file while tracking the archive checksum.
pub struct ArchiveWriter {
    zip: ZipWriter<File>,
    checksum: ArchiveChecksum,
    payload_bytes: u64,
}

impl ArchiveWriter {
    pub fn create(path: &Path) -> AppResult<Self> {
        let file = File::create(path).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "create_archive")
                .with_context("path", path.display().to_string())
        })?;
        Ok(Self {
            zip: ZipWriter::new(file),
            checksum: ArchiveChecksum::default(),
            payload_bytes: 0,
        })
    }

    pub fn append_bytes(&mut self, name: &str, bytes: &[u8]) -> AppResult<u64> {
        let (size, _) = self.append_reader(name, &mut io::Cursor::new(bytes))?;
        Ok(size)
    }

    /// Copies `reader` into a new entry, returning its size and SHA-256.
    pub fn append_reader<R: Read>(&mut self, name: &str, reader: &mut R) -> AppResult<(u64, String)> {
        if name == MANIFEST_ENTRY {
            return Err(AppError::new(
                "ARCHIVE/RESERVED_ENTRY",
                "The manifest can only be written by finish()",
            ));
        }
        let method = if name.starts_with(DATA_PREFIX) || name == PHOTO_INDEX_ENTRY {
            CompressionMethod::Deflated
        } else {
            CompressionMethod::Stored
        };
        self.zip
            .start_file(name, FileOptions::default().compression_method(method))
            .map_err(|err| map_zip_error(err, "start_entry", name))?;

        self.checksum.begin_entry(name);
        let mut entry_hash = Sha256::new();
        let mut buf = [0u8; COPY_BUFFER];
        let mut size = 0_u64;
        loop {
            let n = reader.read(&mut buf).map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "read_entry_source")
                    .with_context("entry", name.to_string())
            })?;
            if n == 0 {
                break;
            }
            self.zip.write_all(&buf[..n]).map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "write_entry")
                    .with_context("entry", name.to_string())
            })?;
            self.checksum.update(&buf[..n]);
            entry_hash.update(&buf[..n]);
            size += n as u64;
        }
        self.checksum.end_entry();
        self.payload_bytes += size;
        Ok((size, format!("{:x}", entry_hash.finalize())))
    }

    pub fn payload_bytes(&self) -> u64 {
        self.payload_bytes
    }

    /// Seals the manifest with the checksum of everything written so far and
    /// appends it as the final entry.
    pub fn finish(mut self, manifest: &mut BackupManifest) -> AppResult<()> {
        manifest.checksum = self.checksum.hex();
        manifest.total_size_bytes = self.payload_bytes;
        let payload = serde_json::to_vec_pretty(manifest)
            .map_err(|err| AppError::from(err).with_context("operation", "serialize_manifest"))?;

        self.zip
            .start_file(
                MANIFEST_ENTRY,
                FileOptions::default().compression_method(CompressionMethod::Deflated),
            )
            .map_err(|err| map_zip_error(err, "start_manifest", MANIFEST_ENTRY))?;
        self.zip.write_all(&payload).map_err(|err| {
            AppError::from(err).with_context("operation", "write_manifest")
        })?;
        let file = self
            .zip
            .finish()
            .map_err(|err| map_zip_error(err, "finish_archive", MANIFEST_ENTRY))?;
        file.sync_all()
            .map_err(|err| AppError::from(err).with_context("operation", "sync_archive"))?;
        Ok(())
    }
}

fn map_zip_error(err: ZipError, operation: &'static str, entry: &str) -> AppError {
    AppError::from(err)
        .with_context("operation", operation)
        .with_context("entry", entry.to_string())
}

/// Read access to an archive; entry names are kept in archive order.
pub struct ArchiveReader {
    path: PathBuf,
    zip: ZipArchive<File>,
    names: Vec<String>,
}

impl ArchiveReader {
    pub fn open(path: &Path) -> Result<Self, ArchiveError> {
        let file = File::open(path).map_err(|source| ArchiveError::Open {
            path: path.display().to_string(),
            source,
        })?;
        let mut zip = ZipArchive::new(file).map_err(|source| ArchiveError::Container {
            path: path.display().to_string(),
            source,
        })?;
        let mut names = Vec::with_capacity(zip.len());
        for idx in 0..zip.len() {
            let entry = zip.by_index(idx).map_err(|source| ArchiveError::Container {
                path: path.display().to_string(),
                source,
            })?;
            names.push(entry.name().to_string());
        }
        Ok(Self {
            path: path.to_path_buf(),
            zip,
            names,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entry_names(&self) -> &[String] {
        &self.names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    pub fn manifest_is_last(&self) -> bool {
        self.names.last().map(String::as_str) == Some(MANIFEST_ENTRY)
    }

    pub fn manifest(&mut self) -> Result<BackupManifest, ArchiveError> {
        let bytes = match self.read_entry(MANIFEST_ENTRY) {
            Ok(bytes) => bytes,
            Err(ArchiveError::EntryMissing(_)) => return Err(ArchiveError::ManifestMissing),
            Err(other) => return Err(other),
        };
        serde_json::from_slice(&bytes).map_err(|err| ArchiveError::ManifestCorrupt(err.to_string()))
    }

    pub fn open_entry(&mut self, name: &str) -> Result<ZipFile<'_>, ArchiveError> {
        match self.zip.by_name(name) {
            Ok(entry) => Ok(entry),
            Err(ZipError::FileNotFound) => Err(ArchiveError::EntryMissing(name.to_string())),
            Err(source) => Err(ArchiveError::Container {
                path: self.path.display().to_string(),
                source,
            }),
        }
    }

    pub fn open_index(&mut self, idx: usize) -> Result<ZipFile<'_>, ArchiveError> {
        let path = self.path.display().to_string();
        self.zip
            .by_index(idx)
            .map_err(|source| ArchiveError::Container { path, source })
    }

    pub fn read_entry(&mut self, name: &str) -> Result<Vec<u8>, ArchiveError> {
        let mut entry = self.open_entry(name)?;
        let mut bytes = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut bytes)
            .map_err(|source| ArchiveError::EntryIo {
                name: name.to_string(),
                source,
            })?;
        Ok(bytes)
    }

    /// Copies an entry to `dest`, returning the SHA-256 of what was written.
    pub fn extract_to(&mut self, name: &str, dest: &Path) -> AppResult<String> {
        let mut entry = self.open_entry(name)?;
        let mut out = File::create(dest).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "extract_entry")
                .with_context("path", dest.display().to_string())
        })?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; COPY_BUFFER];
        loop {
            let n = entry.read(&mut buf).map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "read_entry")
                    .with_context("entry", name.to_string())
            })?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n]).map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "extract_entry")
                    .with_context("path", dest.display().to_string())
            })?;
            hasher.update(&buf[..n]);
        }
        out.sync_all().ok();
        Ok(format!("{:x}", hasher.finalize()))
    }
}

pub fn read_manifest(path: &Path) -> Result<BackupManifest, ArchiveError> {
    ArchiveReader::open(path)?.manifest()
}

pub fn archive_file_name(timestamp: &DateTime<Utc>, suffix: u32) -> String {
    let base = timestamp.format("%Y%m%d-%H%M%S");
    if suffix == 0 {
        format!("{ARCHIVE_PREFIX}{base}.{ARCHIVE_EXTENSION}")
    } else {
        format!("{ARCHIVE_PREFIX}{base}-{suffix:02}.{ARCHIVE_EXTENSION}")
    }
}

/// First path for `timestamp` not taken by a finished archive, a `.partial`
/// file or a loose photo directory.
pub fn unique_archive_path(root: &Path, timestamp: &DateTime<Utc>) -> AppResult<PathBuf> {
    for suffix in 0..100 {
        let candidate = root.join(archive_file_name(timestamp, suffix));
        let partial = crate::util::with_suffix(&candidate, PARTIAL_SUFFIX);
        if !candidate.exists() && !partial.exists() && !loose_photo_dir(&candidate).exists() {
            return Ok(candidate);
        }
    }
    Err(AppError::new(
        "BACKUP/NAME_COLLISION",
        "Unable to allocate a backup file name",
    ))
}

pub fn is_archive_file_name(name: &str) -> bool {
    name.starts_with(ARCHIVE_PREFIX) && name.ends_with(&format!(".{ARCHIVE_EXTENSION}"))
}

/// Directory holding loose photos for `archive_path` in directory mode.
pub fn loose_photo_dir(archive_path: &Path) -> PathBuf {
    let stem = archive_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    archive_path.with_file_name(format!("{stem}{LOOSE_PHOTOS_SUFFIX}"))
}
