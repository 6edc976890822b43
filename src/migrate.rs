use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::{Executor, Row, SqlitePool};
use std::collections::HashMap;
use tracing::{error, info};

/// Embedded migrations in application order. The schema version of a
/// database is the number of these that have been applied.
static MIGRATIONS: &[(&str, &str)] = &[
    (
        "0001_initial.sql",
        include_str!("../migrations/0001_initial.sql"),
    ),
    (
        "0002_photo_thumbnails.sql",
        include_str!("../migrations/0002_photo_thumbnails.sql"),
    ),
];

/// Schema version written by this build.
pub const CURRENT_SCHEMA_VERSION: i64 = MIGRATIONS.len() as i64;
/// Oldest archive schema this build can restore.
pub const MIN_RESTORABLE_SCHEMA_VERSION: i64 = 1;

pub fn is_restorable_schema_version(version: i64) -> bool {
    (MIN_RESTORABLE_SCHEMA_VERSION..=CURRENT_SCHEMA_VERSION).contains(&version)
}

fn preview(sql: &str) -> String {
    let one_line = sql.replace(['\n', '\t'], " ");
    let trimmed = one_line.trim();
    match trimmed.char_indices().nth(120) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

fn strip_comments(raw_sql: &str) -> String {
    raw_sql
        .lines()
        .filter(|line| {
            let t = line.trim_start();
            !(t.is_empty() || t.starts_with("--"))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub async fn apply_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
    pool.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (\
           version    TEXT PRIMARY KEY,\
           applied_at INTEGER NOT NULL,\
           checksum   TEXT NOT NULL\
         )",
    )
    .await?;

    let rows = sqlx::query("SELECT version, checksum FROM schema_migrations")
        .fetch_all(pool)
        .await?;
    let mut applied: HashMap<String, String> = HashMap::new();
    for row in rows {
        applied.insert(row.try_get("version")?, row.try_get("checksum")?);
    }

    for (filename, raw_sql) in MIGRATIONS {
        let cleaned = strip_comments(raw_sql);
        let checksum = format!("{:x}", Sha256::digest(cleaned.as_bytes()));

        if let Some(stored) = applied.get(*filename) {
            if stored != &checksum {
                anyhow::bail!("migration {} edited after application", filename);
            }
            continue;
        }

        let mut tx = pool.begin().await?;
        for stmt in cleaned.split(';') {
            let sql = stmt.trim();
            if sql.is_empty() {
                continue;
            }
            if let Err(err) = sqlx::query(sql).execute(&mut *tx).await {
                error!(
                    target: "qreport",
                    event = "migration_stmt_error",
                    file = %filename,
                    sql = %preview(sql),
                    error = %err
                );
                return Err(err.into());
            }
        }

        sqlx::query(
            "INSERT INTO schema_migrations (version, applied_at, checksum) VALUES (?, ?, ?)",
        )
        .bind(*filename)
        .bind(Utc::now().timestamp_millis())
        .bind(&checksum)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(target: "qreport", event = "migration_applied", file = %filename);
    }

    Ok(())
}

/// Number of migrations recorded in `schema_migrations`, 0 for a blank database.
pub async fn schema_version(pool: &SqlitePool) -> anyhow::Result<i64> {
    let has_table: Option<i64> = sqlx::query_scalar(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_migrations'",
    )
    .fetch_optional(pool)
    .await?;
    if has_table.is_none() {
        return Ok(0);
    }
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM schema_migrations")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("memory pool")
    }

    #[tokio::test]
    async fn applies_every_migration_once() {
        let pool = memory_pool().await;
        assert_eq!(schema_version(&pool).await.unwrap(), 0);

        apply_migrations(&pool).await.unwrap();
        apply_migrations(&pool).await.unwrap();

        assert_eq!(schema_version(&pool).await.unwrap(), CURRENT_SCHEMA_VERSION);
        let has_thumbnail: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM pragma_table_info('photos') WHERE name = 'thumbnail_path'",
        )
        .fetch_optional(&pool)
        .await
        .unwrap();
        assert!(has_thumbnail.is_some());
    }

    #[tokio::test]
    async fn edited_migration_is_rejected() {
        let pool = memory_pool().await;
        apply_migrations(&pool).await.unwrap();
        sqlx::query("UPDATE schema_migrations SET checksum = 'tampered' WHERE version = ?")
            .bind("0001_initial.sql")
            .execute(&pool)
            .await
            .unwrap();

        let err = apply_migrations(&pool).await.unwrap_err();
        assert!(err.to_string().contains("edited after application"));
    }

    #[test]
    fn restorable_range_covers_current_version() {
        assert!(is_restorable_schema_version(CURRENT_SCHEMA_VERSION));
        assert!(is_restorable_schema_version(MIN_RESTORABLE_SCHEMA_VERSION));
        assert!(!is_restorable_schema_version(CURRENT_SCHEMA_VERSION + 1));
        assert!(!is_restorable_schema_version(0));
    }
}
