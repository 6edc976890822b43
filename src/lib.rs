//! Local backup and restore for the QReport field-service database.
//!
//! [`BackupEngine`] snapshots the SQLite database and the photo files its
//! rows reference into a zip archive, validates archives, restores them with
//! a replace-all or merge strategy and keeps a catalog of what is on disk.

pub mod archive;
pub mod backup;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod logging;
pub mod migrate;
pub mod photos;
pub mod progress;
pub mod restore;
pub mod schema;
pub mod state;
pub mod util;

pub use archive::{BackupManifest, PhotoMode};
pub use backup::{BackupInfo, BackupOptions, BackupSharer, BackupSizeEstimate, DirectorySharer};
pub use config::{BackupConfig, RetentionConfig, StoragePaths};
pub use engine::{BackupEngine, BackupJob, Job, RestoreJob};
pub use error::{AppError, AppResult};
pub use progress::{
    BackupProgress, BackupStep, OperationFailure, RestoreProgress, RestoreStep, StepProgress,
    Terminal,
};
pub use restore::{
    RestoreReport, RestoreRequest, RestoreStrategy, ValidationError, ValidationResult,
};
pub use state::CancelHandle;
