use std::path::Path;

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::photos::{load_photo_refs, PhotoKind};
use crate::schema::{self, quote_ident};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupSizeEstimate {
    pub database_bytes: u64,
    pub photo_bytes: u64,
    pub thumbnail_bytes: u64,
    pub photo_files: u64,
    /// Referenced files that could not be found on disk.
    pub missing_files: u64,
    /// Set when a query or filesystem error forced part of the estimate to be skipped.
    pub partial: bool,
}

impl BackupSizeEstimate {
    pub fn total_bytes(&self) -> u64 {
        self.database_bytes
            .saturating_add(self.photo_bytes)
            .saturating_add(self.thumbnail_bytes)
    }
}

/// Advisory size of a backup with the given options. Never fails: a table or
/// file that cannot be inspected is logged and left out.
pub async fn estimate_size(
    pool: &SqlitePool,
    photos_dir: &Path,
    include_photos: bool,
    include_thumbnails: bool,
) -> BackupSizeEstimate {
    let mut estimate = BackupSizeEstimate::default();

    for spec in schema::tables() {
        let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(spec.name));
        match sqlx::query_scalar::<_, i64>(&sql).fetch_one(pool).await {
            Ok(count) => {
                let rows = u64::try_from(count).unwrap_or(0);
                estimate.database_bytes = estimate
                    .database_bytes
                    .saturating_add(rows.saturating_mul(spec.avg_row_bytes));
            }
            Err(err) => {
                estimate.partial = true;
                tracing::warn!(
                    target: "qreport",
                    event = "estimate_table_skipped",
                    table = spec.name,
                    error = %err
                );
            }
        }
    }

    if !include_photos {
        return estimate;
    }

    let refs = match load_photo_refs(pool, include_thumbnails).await {
        Ok(refs) => refs,
        Err(err) => {
            estimate.partial = true;
            tracing::warn!(target: "qreport", event = "estimate_photos_skipped", error = %err);
            return estimate;
        }
    };

    for photo in refs {
        let path = photos_dir.join(&photo.relative_path);
        match std::fs::metadata(&path) {
            Ok(meta) if meta.is_file() => {
                estimate.photo_files += 1;
                match photo.kind {
                    PhotoKind::Photo => estimate.photo_bytes += meta.len(),
                    PhotoKind::Thumbnail => estimate.thumbnail_bytes += meta.len(),
                }
            }
            Ok(_) | Err(_) => {
                estimate.missing_files += 1;
                tracing::debug!(
                    target: "qreport",
                    event = "estimate_photo_missing",
                    path = %path.display()
                );
            }
        }
    }

    estimate
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::apply_migrations;
    use sqlx::sqlite::SqlitePoolOptions;
    use tempfile::tempdir;

    async fn pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        apply_migrations(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn sums_rows_and_photo_files() {
        let pool = pool().await;
        let photos = tempdir().unwrap();
        sqlx::query(
            "INSERT INTO clients (id, name, created_at, updated_at) VALUES ('c1', 'Acme', 0, 0), ('c2', 'Beta', 0, 0)",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query("INSERT INTO facilities (id, client_id, name, created_at, updated_at) VALUES ('f1', 'c1', 'Plant', 0, 0)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO islands (id, facility_id, serial_number, created_at, updated_at) VALUES ('i1', 'f1', 'SN1', 0, 0)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO checkups (id, island_id, technician, status, created_at, updated_at) VALUES ('k1', 'i1', 'Ana', 'open', 0, 0)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO check_items (id, checkup_id, module, description, status, created_at, updated_at) VALUES ('ci1', 'k1', 'axis', 'Grease', 'ok', 0, 0)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO photos (id, check_item_id, file_path, thumbnail_path, created_at) VALUES ('p1', 'ci1', 'a.jpg', 't/a.jpg', 0), ('p2', 'ci1', 'gone.jpg', NULL, 0)")
            .execute(&pool)
            .await
            .unwrap();
        std::fs::write(photos.path().join("a.jpg"), vec![0u8; 1000]).unwrap();
        std::fs::create_dir_all(photos.path().join("t")).unwrap();
        std::fs::write(photos.path().join("t/a.jpg"), vec![0u8; 100]).unwrap();

        let without = estimate_size(&pool, photos.path(), false, false).await;
        let rows_only = 2 * 320 + 280 + 260 + 300 + 360 + 2 * 220;
        assert_eq!(without.database_bytes, rows_only);
        assert_eq!(without.photo_bytes, 0);
        assert!(!without.partial);

        let with = estimate_size(&pool, photos.path(), true, true).await;
        assert_eq!(with.photo_bytes, 1000);
        assert_eq!(with.thumbnail_bytes, 100);
        assert_eq!(with.missing_files, 1);
        assert_eq!(with.total_bytes(), rows_only + 1100);
    }

    #[tokio::test]
    async fn missing_tables_degrade_to_partial_estimate() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let estimate = estimate_size(&pool, Path::new("/nonexistent"), true, true).await;
        assert!(estimate.partial);
        assert_eq!(estimate.total_bytes(), 0);
    }
}
