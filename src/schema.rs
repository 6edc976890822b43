//! Registry of every persisted table, in foreign-key dependency order.
//!
//! Parents always precede their children in [`TABLES`]. Restores insert in
//! that order and delete in the reverse order, so enforced foreign keys are
//! never violated at an intermediate step.

/// Column on a table that references a file under the live photo root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhotoColumn {
    pub column: &'static str,
    pub thumbnail: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSpec {
    pub name: &'static str,
    pub primary_key: &'static str,
    pub parents: &'static [&'static str],
    /// Serialized bytes per row, used only by the size estimate.
    pub avg_row_bytes: u64,
    pub photo_columns: &'static [PhotoColumn],
}

impl TableSpec {
    const fn new(name: &'static str, parents: &'static [&'static str], avg_row_bytes: u64) -> Self {
        Self {
            name,
            primary_key: "id",
            parents,
            avg_row_bytes,
            photo_columns: &[],
        }
    }

    pub fn is_photo_bearing(&self) -> bool {
        !self.photo_columns.is_empty()
    }

    /// Archive entry holding this table's rows.
    pub fn data_entry(&self) -> String {
        data_entry_name(self.name)
    }
}

pub const PHOTOS_TABLE: &str = "photos";

pub static TABLES: &[TableSpec] = &[
    TableSpec::new("clients", &[], 320),
    TableSpec::new("facilities", &["clients"], 280),
    TableSpec::new("islands", &["facilities"], 260),
    TableSpec::new("contacts", &["clients", "facilities"], 300),
    TableSpec::new("contracts", &["clients"], 260),
    TableSpec::new("checkups", &["islands"], 300),
    TableSpec::new("check_items", &["checkups"], 360),
    TableSpec::new("spare_parts", &["checkups"], 240),
    TableSpec {
        photo_columns: &[
            PhotoColumn {
                column: "file_path",
                thumbnail: false,
            },
            PhotoColumn {
                column: "thumbnail_path",
                thumbnail: true,
            },
        ],
        ..TableSpec::new(PHOTOS_TABLE, &["check_items"], 220)
    },
    TableSpec {
        primary_key: "key",
        ..TableSpec::new("app_settings", &[], 120)
    },
];

pub fn tables() -> &'static [TableSpec] {
    TABLES
}

pub fn lookup(name: &str) -> Option<&'static TableSpec> {
    TABLES.iter().find(|spec| spec.name == name)
}

/// Position of `name` in dependency order; unknown tables sort last.
pub fn table_order_key(name: &str) -> (usize, &str) {
    let rank = TABLES
        .iter()
        .position(|spec| spec.name == name)
        .unwrap_or(usize::MAX);
    (rank, name)
}

/// Parents before children.
pub fn insert_order() -> impl Iterator<Item = &'static TableSpec> {
    TABLES.iter()
}

/// Children before parents.
pub fn delete_order() -> impl Iterator<Item = &'static TableSpec> {
    TABLES.iter().rev()
}

pub fn data_entry_name(table: &str) -> String {
    format!("{}{table}.jsonl", crate::archive::DATA_PREFIX)
}

/// True when every table appears after all of its parents.
pub fn is_dependency_ordered<'a, I>(order: I) -> bool
where
    I: IntoIterator<Item = &'a str>,
{
    let mut seen: Vec<&str> = Vec::new();
    for name in order {
        let Some(spec) = lookup(name) else {
            return false;
        };
        if spec.parents.iter().any(|parent| !seen.contains(parent)) {
            return false;
        }
        seen.push(name);
    }
    true
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::apply_migrations;
    use sqlx::sqlite::SqlitePoolOptions;
    use sqlx::Row;

    #[test]
    fn registry_is_topologically_sorted() {
        assert!(is_dependency_ordered(insert_order().map(|s| s.name)));
        assert!(!is_dependency_ordered(delete_order().map(|s| s.name)));
    }

    #[test]
    fn table_order_key_ranks_unknown_last() {
        let mut names = vec!["photos", "mystery", "clients", "check_items"];
        names.sort_by_key(|name| table_order_key(*name));
        assert_eq!(names, vec!["clients", "check_items", "photos", "mystery"]);
    }

    #[test]
    fn only_photos_table_carries_files() {
        let bearing: Vec<_> = tables()
            .iter()
            .filter(|spec| spec.is_photo_bearing())
            .map(|spec| spec.name)
            .collect();
        assert_eq!(bearing, vec![PHOTOS_TABLE]);
        assert_eq!(lookup("app_settings").map(|s| s.primary_key), Some("key"));
    }

    #[tokio::test]
    async fn registry_matches_migrated_schema() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        apply_migrations(&pool).await.unwrap();

        let rows = sqlx::query(
            "SELECT name FROM sqlite_master WHERE type = 'table' \
             AND name NOT LIKE 'sqlite_%' AND name != 'schema_migrations' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        let mut live: Vec<String> = rows.iter().map(|r| r.get::<String, _>("name")).collect();
        let mut registered: Vec<String> = tables().iter().map(|s| s.name.to_string()).collect();
        live.sort();
        registered.sort();
        assert_eq!(live, registered);

        for spec in tables() {
            let fks = sqlx::query(&format!(
                "SELECT \"table\" AS parent FROM pragma_foreign_key_list('{}')",
                spec.name
            ))
            .fetch_all(&pool)
            .await
            .unwrap();
            let mut parents: Vec<String> =
                fks.iter().map(|r| r.get::<String, _>("parent")).collect();
            parents.sort();
            parents.dedup();
            let mut declared: Vec<String> = spec.parents.iter().map(|p| p.to_string()).collect();
            declared.sort();
            assert_eq!(parents, declared, "parents of {}", spec.name);
        }
    }
}
