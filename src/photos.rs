use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

use crate::archive::{PHOTOS_PREFIX, THUMBNAILS_PREFIX};
use crate::schema::{self, quote_ident};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhotoKind {
    Photo,
    Thumbnail,
}

impl PhotoKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhotoKind::Photo => "photo",
            PhotoKind::Thumbnail => "thumbnail",
        }
    }

    /// Compartment prefix inside the archive or loose directory.
    pub fn compartment(&self) -> &'static str {
        match self {
            PhotoKind::Photo => PHOTOS_PREFIX,
            PhotoKind::Thumbnail => THUMBNAILS_PREFIX,
        }
    }

    pub fn entry_name(&self, relative_path: &str) -> String {
        format!("{}{}", self.compartment(), relative_path)
    }
}

impl fmt::Display for PhotoKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A file referenced by a photo-bearing row, relative to the live photo root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhotoRef {
    pub table: &'static str,
    pub row_id: String,
    pub kind: PhotoKind,
    pub relative_path: String,
}

/// Every photo (and optionally thumbnail) path referenced by the database,
/// sorted and deduplicated by kind and path.
pub async fn load_photo_refs(
    pool: &SqlitePool,
    include_thumbnails: bool,
) -> Result<Vec<PhotoRef>, sqlx::Error> {
    let mut refs = Vec::new();
    for spec in schema::tables().iter().filter(|s| s.is_photo_bearing()) {
        for column in spec.photo_columns {
            if column.thumbnail && !include_thumbnails {
                continue;
            }
            let kind = if column.thumbnail {
                PhotoKind::Thumbnail
            } else {
                PhotoKind::Photo
            };
            let sql = format!(
                "SELECT CAST({pk} AS TEXT) AS row_id, {col} AS path FROM {table} \
                 WHERE {col} IS NOT NULL AND {col} != '' ORDER BY {pk}",
                pk = quote_ident(spec.primary_key),
                col = quote_ident(column.column),
                table = quote_ident(spec.name),
            );
            for row in sqlx::query(&sql).fetch_all(pool).await? {
                refs.push(PhotoRef {
                    table: spec.name,
                    row_id: row.try_get("row_id")?,
                    kind,
                    relative_path: row.try_get("path")?,
                });
            }
        }
    }
    refs.sort_by(|a, b| {
        (a.kind.as_str(), &a.relative_path).cmp(&(b.kind.as_str(), &b.relative_path))
    });
    refs.dedup_by(|a, b| a.kind == b.kind && a.relative_path == b.relative_path);
    Ok(refs)
}

/// One line of the photo index, a JSON object per file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoIndexEntry {
    pub kind: PhotoKind,
    pub relative_path: String,
    pub sha256: String,
    pub size: u64,
}

impl PhotoIndexEntry {
    pub fn entry_name(&self) -> String {
        self.kind.entry_name(&self.relative_path)
    }

    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

pub fn parse_photo_index(text: &str) -> Result<Vec<PhotoIndexEntry>, String> {
    let mut out = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let entry = serde_json::from_str(line)
            .map_err(|err| format!("photo index line {} is malformed: {err}", idx + 1))?;
        out.push(entry);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_lines_parse_back() {
        let entries = vec![
            PhotoIndexEntry {
                kind: PhotoKind::Photo,
                relative_path: "c1/front.jpg".into(),
                sha256: "ab".into(),
                size: 10,
            },
            PhotoIndexEntry {
                kind: PhotoKind::Thumbnail,
                relative_path: "thumbs/front.jpg".into(),
                sha256: "cd".into(),
                size: 2,
            },
        ];
        let text: String = entries.iter().map(|e| e.to_line().unwrap()).collect();
        assert_eq!(text.lines().count(), 2);
        assert_eq!(parse_photo_index(&text).unwrap(), entries);
        assert_eq!(entries[1].entry_name(), "thumbnails/thumbs/front.jpg");
    }

    #[test]
    fn tabs_and_newlines_in_file_names_survive_the_index() {
        let entry = PhotoIndexEntry {
            kind: PhotoKind::Photo,
            relative_path: "weld\tjoint\nleft.jpg".into(),
            sha256: "ef".into(),
            size: 3,
        };
        let line = entry.to_line().unwrap();
        assert_eq!(line.matches('\n').count(), 1);
        assert_eq!(parse_photo_index(&line).unwrap(), vec![entry]);
    }

    #[test]
    fn malformed_index_is_rejected() {
        assert!(parse_photo_index("photo\tonly-two\n").is_err());
        assert!(parse_photo_index(r#"{"kind":"video","relativePath":"a.mp4","sha256":"ff","size":1}"#).is_err());
        assert!(parse_photo_index(r#"{"kind":"photo","relativePath":"a.jpg","sha256":"ff","size":"ten"}"#).is_err());
        let err = parse_photo_index("\n[]\n").unwrap_err();
        assert!(err.starts_with("photo index line 2 is malformed"), "{err}");
    }
}
