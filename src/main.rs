use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use serde_json::json;
use tokio::runtime::Runtime;

use qreport_backup::config::default_data_dir;
use qreport_backup::logging::init_logging;
use qreport_backup::util::format_bytes;
use qreport_backup::{
    AppError, AppResult, BackupConfig, BackupEngine, BackupOptions, BackupProgress, BackupStep,
    DirectorySharer, OperationFailure, PhotoMode, RestoreProgress, RestoreRequest, RestoreStep,
    RestoreStrategy, StepProgress,
};

const EXIT_ERROR: i32 = 1;
const EXIT_INVALID: i32 = 2;
const EXIT_BUSY: i32 = 3;
const INVALID_ARCHIVE_CODE: &str = "RESTORE/INVALID_ARCHIVE";

#[derive(Debug, Parser)]
#[command(name = "qreport-backup", about = "QReport backup and restore", version)]
struct Cli {
    /// Directory holding the database, photos and backups.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Write a new backup archive.
    Create {
        #[arg(long)]
        no_photos: bool,
        #[arg(long)]
        no_thumbnails: bool,
        /// Keep photos inside the archive or in a sibling directory.
        #[arg(long, value_enum, default_value_t = ModeArg::Embedded)]
        mode: ModeArg,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// List archives in the backups directory, newest first.
    List {
        #[arg(long)]
        json: bool,
    },
    /// Check an archive without restoring it.
    Validate {
        path: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Restore an archive, given by catalog id or path.
    Restore {
        target: String,
        /// `replace-all` or `merge`.
        #[arg(long, default_value = "replace-all")]
        strategy: RestoreStrategy,
        /// Loose photo directory of a directory-mode archive.
        #[arg(long)]
        photo_dir: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Delete a backup and its loose photo directory.
    Delete { id: String },
    /// Estimate the size of a backup.
    Estimate {
        #[arg(long)]
        no_photos: bool,
        #[arg(long)]
        no_thumbnails: bool,
        #[arg(long)]
        json: bool,
    },
    /// Copy a backup into another directory.
    Share {
        id: String,
        #[arg(long)]
        to: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Embedded,
    Directory,
}

impl From<ModeArg> for PhotoMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Embedded => PhotoMode::Embedded,
            ModeArg::Directory => PhotoMode::Directory,
        }
    }
}

fn main() {
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err}");
            exit_code_for(&err)
        }
    };
    process::exit(code);
}

fn exit_code_for(err: &AppError) -> i32 {
    if err.is_busy() {
        EXIT_BUSY
    } else if err.code() == INVALID_ARCHIVE_CODE {
        EXIT_INVALID
    } else {
        EXIT_ERROR
    }
}

fn run(cli: Cli) -> AppResult<i32> {
    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => default_data_dir()?,
    };
    let config = BackupConfig::load(&data_dir);
    let _log_guard = init_logging(Some(&config.paths.logs_dir))?;

    let runtime = Runtime::new()
        .map_err(|err| AppError::from(err).with_context("operation", "start_runtime"))?;
    let engine = runtime.block_on(BackupEngine::open(config))?;

    match cli.command {
        Commands::Create {
            no_photos,
            no_thumbnails,
            mode,
            description,
            json,
        } => {
            let options = BackupOptions {
                include_photos: !no_photos,
                include_thumbnails: !no_thumbnails,
                mode: mode.into(),
                description,
            };
            runtime.block_on(handle_create(&engine, options, json))
        }
        Commands::List { json } => handle_list(&engine, json),
        Commands::Validate { path, json } => {
            let result = runtime.block_on(engine.validate(&path))?;
            if json {
                print_json(&result)?;
            } else {
                println!("{}: {}", path.display(), if result.is_valid { "valid" } else { "invalid" });
                for message in result.error_messages() {
                    println!("  error: {message}");
                }
                for warning in &result.warnings {
                    println!("  warning: {warning}");
                }
            }
            Ok(if result.is_valid { 0 } else { EXIT_INVALID })
        }
        Commands::Restore {
            target,
            strategy,
            photo_dir,
            json,
        } => {
            let archive = engine.locate_archive(&target)?;
            let mut request = RestoreRequest::new(archive, strategy);
            if let Some(dir) = photo_dir {
                request = request.with_photo_dir(dir);
            }
            runtime.block_on(handle_restore(&engine, request, json))
        }
        Commands::Delete { id } => {
            engine.delete_backup(&id)?;
            println!("Deleted backup {id}");
            Ok(0)
        }
        Commands::Estimate {
            no_photos,
            no_thumbnails,
            json,
        } => {
            let estimate = runtime.block_on(engine.estimate_size(!no_photos, !no_thumbnails));
            if json {
                print_json(&estimate)?;
            } else {
                println!("Database : {}", format_bytes(estimate.database_bytes));
                println!("Photos   : {}", format_bytes(estimate.photo_bytes));
                println!("Thumbs   : {}", format_bytes(estimate.thumbnail_bytes));
                println!("Total    : {}", format_bytes(estimate.total_bytes()));
                if estimate.missing_files > 0 {
                    println!("Missing  : {} files", estimate.missing_files);
                }
            }
            Ok(0)
        }
        Commands::Share { id, to } => {
            engine.share_backup(&id, &DirectorySharer::new(&to))?;
            println!("Copied backup {id} to {}", to.display());
            Ok(0)
        }
    }
}

async fn handle_create(engine: &BackupEngine, options: BackupOptions, json: bool) -> AppResult<i32> {
    let mut job = engine.start_backup(options)?;
    let mut terminal = None;
    while let Some(event) = job.next().await {
        match event {
            BackupProgress::InProgress(progress) => print_progress(&progress, backup_step_label),
            other => terminal = Some(other),
        }
    }

    match terminal {
        Some(BackupProgress::Completed {
            archive_path,
            manifest,
            warnings,
        }) => {
            for warning in &warnings {
                eprintln!("Warning: {warning}");
            }
            if json {
                print_json(&json!({
                    "archivePath": archive_path,
                    "manifest": manifest,
                    "warnings": warnings,
                }))?;
            } else {
                print_json(&manifest)?;
                println!("Backup stored at {}", archive_path.display());
            }
            Ok(0)
        }
        Some(BackupProgress::Error(failure)) => Err(failure_error(failure, backup_step_label)),
        _ => Err(AppError::new("JOB/ABORTED", "Backup ended without a result")),
    }
}

async fn handle_restore(engine: &BackupEngine, request: RestoreRequest, json: bool) -> AppResult<i32> {
    let mut job = engine.start_restore(request)?;
    let mut terminal = None;
    while let Some(event) = job.next().await {
        match event {
            RestoreProgress::InProgress(progress) => print_progress(&progress, restore_step_label),
            other => terminal = Some(other),
        }
    }

    match terminal {
        Some(RestoreProgress::Completed { report, .. }) => {
            if json {
                print_json(&report)?;
            } else {
                println!("Restored {} rows ({})", report.rows_written(), report.strategy);
                for table in &report.tables {
                    println!(
                        "{:<14} {:>8} written {:>8} deleted",
                        table.table, table.rows_written, table.rows_deleted
                    );
                }
                println!(
                    "Photos: {} copied, {} missing",
                    report.photos.copied, report.photos.missing
                );
                for warning in &report.warnings {
                    println!("Warning: {warning}");
                }
                if let Some(path) = &report.report_path {
                    println!("Report written to {}", path.display());
                }
            }
            Ok(0)
        }
        Some(RestoreProgress::Error(failure)) => Err(failure_error(failure, restore_step_label)),
        _ => Err(AppError::new("JOB/ABORTED", "Restore ended without a result")),
    }
}

fn handle_list(engine: &BackupEngine, json: bool) -> AppResult<i32> {
    let backups = engine.list_backups()?;
    if json {
        print_json(&backups)?;
        return Ok(0);
    }
    if backups.is_empty() {
        println!("No backups found.");
        return Ok(0);
    }
    println!("{:<36}  {:<24}  {:>10}  {:>6}  Path", "ID", "Created", "Size", "Photos");
    for backup in &backups {
        println!(
            "{:<36}  {:<24}  {:>10}  {:>6}  {}",
            backup.id,
            backup.created_at,
            format_bytes(backup.size_bytes),
            backup.manifest.photos.count,
            backup.archive_path.display()
        );
    }
    Ok(0)
}

fn print_progress<S: Copy>(progress: &StepProgress<S>, label: fn(S) -> &'static str) {
    let percent = (progress.fraction * 100.0).round();
    match &progress.current_table {
        Some(table) => eprintln!(
            "[{percent:>3}%] {:<10} Table: {table} ({}/{})",
            label(progress.step),
            progress.processed_records,
            progress.total_records
        ),
        None if progress.total_records > 0 => eprintln!(
            "[{percent:>3}%] {:<10} {}/{}",
            label(progress.step),
            progress.processed_records,
            progress.total_records
        ),
        None => eprintln!("[{percent:>3}%] {}", label(progress.step)),
    }
}

fn failure_error<S: Copy>(failure: OperationFailure<S>, label: fn(S) -> &'static str) -> AppError {
    let mut err = AppError::new(failure.code, failure.message);
    if let Some(step) = failure.step {
        err = err.with_context("step", label(step));
    }
    if let Some(table) = failure.table {
        err = err.with_context("table", table);
    }
    err
}

fn backup_step_label(step: BackupStep) -> &'static str {
    match step {
        BackupStep::Preparing => "Preparing",
        BackupStep::Tables => "Tables",
        BackupStep::Photos => "Photos",
        BackupStep::Finalizing => "Finalizing",
    }
}

fn restore_step_label(step: RestoreStep) -> &'static str {
    match step {
        RestoreStep::Validating => "Validating",
        RestoreStep::Deleting => "Deleting",
        RestoreStep::Inserting => "Inserting",
        RestoreStep::RelinkingPhotos => "Photos",
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> AppResult<()> {
    let text = serde_json::to_string_pretty(value)?;
    println!("{text}");
    Ok(())
}
