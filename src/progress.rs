use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::archive::BackupManifest;
use crate::restore::RestoreReport;
use crate::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStep {
    Preparing,
    Tables,
    Photos,
    Finalizing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreStep {
    Validating,
    Deleting,
    Inserting,
    RelinkingPhotos,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepProgress<S> {
    pub step: S,
    /// Overall completion, 0.0 to 1.0.
    pub fraction: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_table: Option<String>,
    pub processed_records: u64,
    pub total_records: u64,
    /// False once the operation has entered a region that cannot be undone.
    pub cancellable: bool,
}

impl<S> StepProgress<S> {
    pub fn new(step: S, fraction: f64) -> Self {
        Self {
            step,
            fraction: fraction.clamp(0.0, 1.0),
            current_table: None,
            processed_records: 0,
            total_records: 0,
            cancellable: true,
        }
    }

    pub fn table(mut self, table: &str, processed: u64, total: u64) -> Self {
        self.current_table = Some(table.to_string());
        self.processed_records = processed;
        self.total_records = total;
        self
    }

    pub fn records(mut self, processed: u64, total: u64) -> Self {
        self.processed_records = processed;
        self.total_records = total;
        self
    }

    pub fn cancellable(mut self, cancellable: bool) -> Self {
        self.cancellable = cancellable;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", bound(deserialize = "S: Deserialize<'de>"))]
pub struct OperationFailure<S> {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<S>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
}

impl<S> OperationFailure<S> {
    pub fn from_error(error: &AppError, step: Option<S>) -> Self {
        Self {
            code: error.code().to_string(),
            message: error.message().to_string(),
            step,
            table: error.context().get("table").cloned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BackupProgress {
    #[default]
    Idle,
    InProgress(StepProgress<BackupStep>),
    #[serde(rename_all = "camelCase")]
    Completed {
        archive_path: PathBuf,
        manifest: BackupManifest,
        warnings: Vec<String>,
    },
    Error(OperationFailure<BackupStep>),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RestoreProgress {
    #[default]
    Idle,
    InProgress(StepProgress<RestoreStep>),
    #[serde(rename_all = "camelCase")]
    Completed {
        archive_path: PathBuf,
        report: RestoreReport,
    },
    Error(OperationFailure<RestoreStep>),
}

/// Progress events that end a stream.
pub trait Terminal {
    fn is_terminal(&self) -> bool;
}

impl Terminal for BackupProgress {
    fn is_terminal(&self) -> bool {
        matches!(self, BackupProgress::Completed { .. } | BackupProgress::Error(_))
    }
}

impl Terminal for RestoreProgress {
    fn is_terminal(&self) -> bool {
        matches!(self, RestoreProgress::Completed { .. } | RestoreProgress::Error(_))
    }
}

pub(crate) fn progress_channel<T>() -> (ProgressSender<T>, ProgressStream<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ProgressSender { tx }, ProgressStream { rx })
}

pub(crate) struct ProgressSender<T> {
    tx: mpsc::UnboundedSender<T>,
}

impl<T> ProgressSender<T> {
    /// A dropped receiver is not an error; the operation keeps running.
    pub(crate) fn emit(&self, event: T) {
        let _ = self.tx.send(event);
    }
}

/// Events of one backup or restore, ending with a terminal event.
pub struct ProgressStream<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Stream for ProgressStream<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.get_mut().rx.poll_recv(cx)
    }
}
