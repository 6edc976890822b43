use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use crate::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Backup,
    Restore,
    Delete,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OperationKind::Backup => "backup",
            OperationKind::Restore => "restore",
            OperationKind::Delete => "delete",
        })
    }
}

/// Single slot shared by backup, restore and catalog deletes. Acquiring never
/// waits: a second caller is turned away with `BACKUP/BUSY`.
#[derive(Debug, Clone, Default)]
pub struct OperationLock {
    active: Arc<AtomicBool>,
}

impl OperationLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self, kind: OperationKind) -> AppResult<OperationPermit> {
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::info!(target: "qreport", event = "operation_rejected_busy", operation = %kind);
            return Err(AppError::busy().with_context("operation", kind.to_string()));
        }
        Ok(OperationPermit {
            flag: self.active.clone(),
            kind,
        })
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// Held for the lifetime of one operation; dropping it frees the slot.
#[derive(Debug)]
pub struct OperationPermit {
    flag: Arc<AtomicBool>,
    kind: OperationKind,
}

impl OperationPermit {
    pub fn kind(&self) -> OperationKind {
        self.kind
    }
}

impl Drop for OperationPermit {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

const OPEN: u8 = 0;
const CANCEL_REQUESTED: u8 = 1;
const SEALED: u8 = 2;

/// Cooperative cancellation shared between the caller and a running job.
///
/// A job seals the handle before entering work that cannot be undone; from
/// then on [`CancelHandle::cancel`] is refused.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    state: Arc<AtomicU8>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Returns false when the job already sealed itself.
    pub fn cancel(&self) -> bool {
        match self
            .state
            .compare_exchange(OPEN, CANCEL_REQUESTED, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => true,
            Err(current) => current == CANCEL_REQUESTED,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::SeqCst) == CANCEL_REQUESTED
    }

    pub fn is_sealed(&self) -> bool {
        self.state.load(Ordering::SeqCst) == SEALED
    }

    /// Fails with a cancellation error if one is pending.
    pub fn checkpoint(&self) -> AppResult<()> {
        if self.is_cancelled() {
            return Err(AppError::cancelled());
        }
        Ok(())
    }

    /// Enters the non-cancellable region. Fails if cancellation won the race.
    pub(crate) fn seal(&self) -> AppResult<()> {
        match self
            .state
            .compare_exchange(OPEN, SEALED, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => Ok(()),
            Err(SEALED) => Ok(()),
            Err(_) => Err(AppError::cancelled()),
        }
    }

    /// Marks the job as finished; later cancel requests are refused.
    pub(crate) fn close(&self) {
        self.state.store(SEALED, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_until_permit_dropped() {
        let lock = OperationLock::new();
        let permit = lock.try_acquire(OperationKind::Backup).unwrap();
        assert_eq!(permit.kind(), OperationKind::Backup);
        assert!(lock.is_active());

        let err = lock.try_acquire(OperationKind::Restore).unwrap_err();
        assert!(err.is_busy());
        assert_eq!(err.context().get("operation"), Some(&"restore".to_string()));

        drop(permit);
        assert!(!lock.is_active());
        assert!(lock.try_acquire(OperationKind::Restore).is_ok());
    }

    #[test]
    fn clones_share_the_slot() {
        let lock = OperationLock::new();
        let other = lock.clone();
        let _permit = lock.try_acquire(OperationKind::Restore).unwrap();
        assert!(other.try_acquire(OperationKind::Backup).is_err());
    }

    #[test]
    fn cancel_before_seal_wins() {
        let handle = CancelHandle::new();
        assert!(handle.cancel());
        assert!(handle.cancel());
        assert!(handle.checkpoint().unwrap_err().is_cancelled());
        assert!(handle.seal().is_err());
    }

    #[test]
    fn sealed_handle_refuses_cancel() {
        let handle = CancelHandle::new();
        handle.seal().unwrap();
        handle.seal().unwrap();
        assert!(!handle.cancel());
        assert!(handle.is_sealed());
        assert!(handle.checkpoint().is_ok());
    }

    #[test]
    fn closed_handle_refuses_cancel_even_after_a_request() {
        let handle = CancelHandle::new();
        assert!(handle.cancel());
        handle.close();
        assert!(!handle.cancel());
        assert!(!handle.is_cancelled());
    }
}
