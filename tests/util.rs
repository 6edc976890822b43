#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use qreport_backup::db::row_to_json;
use qreport_backup::{
    schema, BackupConfig, BackupEngine, BackupManifest, BackupOptions, BackupProgress,
    RestoreProgress, RestoreRequest, StoragePaths, Terminal,
};
use serde_json::Value;
use sqlx::SqlitePool;

const SEED: &[&str] = &[
    "INSERT INTO clients (id, name, vat_number, created_at, updated_at) VALUES
       ('c1', 'Acme Robotics', 'IT0001', 1700000000000, 1700000000000),
       ('c2', 'Beta Foods', NULL, 1700000000001, 1700000000001),
       ('c3', 'Gamma Steel', 'IT0003', 1700000000002, 1700000000002)",
    "INSERT INTO facilities (id, client_id, name, city, is_primary, created_at, updated_at) VALUES
       ('f1', 'c1', 'Acme North', 'Milano', 1, 1, 1),
       ('f2', 'c1', 'Acme South', 'Napoli', 0, 1, 1),
       ('f3', 'c2', 'Beta Plant', 'Torino', 1, 1, 1),
       ('f4', 'c2', 'Beta Depot', NULL, 0, 1, 1),
       ('f5', 'c3', 'Gamma Works', 'Brescia', 1, 1, 1)",
    "INSERT INTO islands (id, facility_id, serial_number, model, operating_hours, created_at, updated_at) VALUES
       ('i1', 'f1', 'SN-100', 'IRB 6700', 12000, 1, 1),
       ('i2', 'f3', 'SN-200', 'KR 210', 800, 1, 1)",
    "INSERT INTO contacts (id, client_id, facility_id, first_name, last_name, email, created_at, updated_at) VALUES
       ('ct1', 'c1', 'f1', 'Marta', 'Rossi', 'marta@acme.test', 1, 1),
       ('ct2', 'c2', NULL, 'Luca', NULL, NULL, 1, 1)",
    "INSERT INTO contracts (id, client_id, contract_number, start_date, visits_per_year, created_at, updated_at) VALUES
       ('k1', 'c1', 'CTR-2024-01', 1704067200000, 2, 1, 1)",
    "INSERT INTO checkups (id, island_id, technician, status, performed_at, created_at, updated_at) VALUES
       ('cu1', 'i1', 'Ana', 'completed', 1710000000000, 1, 1),
       ('cu2', 'i2', 'Ana', 'draft', NULL, 1, 1)",
    "INSERT INTO check_items (id, checkup_id, module, description, status, position, created_at, updated_at) VALUES
       ('ci1', 'cu1', 'axis_1', 'Grease bearings', 'ok', 0, 1, 1),
       ('ci2', 'cu1', 'gripper', 'Check pneumatic lines', 'warning', 1, 1, 1),
       ('ci3', 'cu2', 'cabinet', 'Inspect fans', 'ko', 0, 1, 1)",
    "INSERT INTO spare_parts (id, checkup_id, part_number, description, quantity, urgency, created_at, updated_at) VALUES
       ('sp1', 'cu1', '3HAC-1234', 'Gearbox seal', 2, 'high', 1, 1)",
    "INSERT INTO photos (id, check_item_id, file_path, thumbnail_path, caption, width, height, created_at) VALUES
       ('p1', 'ci1', 'cu1/front.jpg', 'thumbs/cu1/front.jpg', 'Front view', 1024, 768, 1),
       ('p2', 'ci3', 'cu2/back.jpg', NULL, NULL, NULL, NULL, 1)",
    "INSERT INTO app_settings (key, value, updated_at) VALUES
       ('technician_name', 'Ana', 1),
       ('locale', 'it-IT', 1)",
];

pub const PHOTO_FILES: &[(&str, &[u8])] = &[
    ("cu1/front.jpg", b"\xff\xd8front-jpeg-bytes"),
    ("thumbs/cu1/front.jpg", b"\xff\xd8thumb"),
    ("cu2/back.jpg", b"\xff\xd8back-jpeg-bytes-longer"),
];

pub fn config_for(data_dir: &Path) -> BackupConfig {
    BackupConfig::new(StoragePaths::from_data_dir(data_dir))
}

pub async fn open_engine(data_dir: &Path) -> BackupEngine {
    BackupEngine::open(config_for(data_dir))
        .await
        .expect("open backup engine")
}

/// 3 clients, 5 facilities and 2 photos (one with a thumbnail), plus a row
/// or two in every other table. Photo files are written under `photos_dir`.
pub async fn seed(pool: &SqlitePool, photos_dir: &Path) {
    for statement in SEED {
        sqlx::query(statement).execute(pool).await.unwrap();
    }
    for (rel, bytes) in PHOTO_FILES {
        let path = photos_dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, bytes).unwrap();
    }
}

/// Every registry table, rows ordered by primary key.
pub async fn dump(pool: &SqlitePool) -> BTreeMap<String, Vec<Value>> {
    let mut out = BTreeMap::new();
    for spec in schema::tables() {
        let sql = format!(
            "SELECT * FROM \"{}\" ORDER BY \"{}\"",
            spec.name, spec.primary_key
        );
        let rows = sqlx::query(&sql).fetch_all(pool).await.unwrap();
        out.insert(
            spec.name.to_string(),
            rows.iter().map(|row| row_to_json(row).unwrap()).collect(),
        );
    }
    out
}

pub async fn count(pool: &SqlitePool, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM \"{table}\""))
        .fetch_one(pool)
        .await
        .unwrap()
}

pub async fn backup(engine: &BackupEngine, options: BackupOptions) -> (PathBuf, BackupManifest) {
    let job = engine.start_backup(options).unwrap();
    match job.wait().await.unwrap() {
        BackupProgress::Completed {
            archive_path,
            manifest,
            ..
        } => (archive_path, manifest),
        other => panic!("backup did not complete: {other:?}"),
    }
}

pub async fn restore(engine: &BackupEngine, request: RestoreRequest) -> RestoreProgress {
    let job = engine.start_restore(request).unwrap();
    let terminal = job.wait().await.unwrap();
    assert!(terminal.is_terminal());
    terminal
}

pub fn files_in(dir: &Path) -> Vec<String> {
    if !dir.exists() {
        return Vec::new();
    }
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
