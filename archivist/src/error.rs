//! Domain errors and their classification into exit codes.
//!
//! Errors travel as `anyhow::Error`; the ones the caller needs to tell apart
//! are raised as [`ArchivistError`] and recovered with [`error_kind`].

use utils::lock_file::LockError;

use crate::catalog::{BackupId, BackupStatus};

/// How a failure should be reported to the caller of the binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum ErrorKind {
    /// I/O failures, busy locks, missing WAL. Retrying may help.
    Transient,
    /// Stored data does not match its checksums or its catalog.
    Integrity,
    /// The request was refused.
    Policy,
    /// The catalog is in a state the operation cannot continue from.
    Fatal,
}

impl ErrorKind {
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::Transient => 1,
            ErrorKind::Integrity => 2,
            ErrorKind::Policy => 3,
            ErrorKind::Fatal => 4,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ArchivistError {
    #[error("WAL segment {0} is absent")]
    WalAbsent(String),
    #[error("WAL segment {name} could not be archived in {timeout}")]
    WalTimeout {
        name: String,
        timeout: humantime::Duration,
    },
    #[error("WAL file {0} already exists in archive with different checksum")]
    ChecksumConflict(String),
    #[error("Backup {0} is not found")]
    BackupNotFound(BackupId),
    #[error("Incremental chain is broken: backup {missing} is missing, parent of {child}")]
    ChainBroken { missing: BackupId, child: BackupId },
    #[error("Backup {id} has status {status}, operation is not possible")]
    InvalidStatus { id: BackupId, status: BackupStatus },
    #[error("Backup {0} cannot be used as parent, it is being merged")]
    ParentMerging(BackupId),
    #[error("{0}")]
    Corrupt(String),
    #[error("{0}")]
    Policy(String),
    #[error(transparent)]
    Lock(#[from] LockError),
}

impl ArchivistError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ArchivistError::WalAbsent(_)
            | ArchivistError::WalTimeout { .. }
            | ArchivistError::Lock(_) => ErrorKind::Transient,
            ArchivistError::ChecksumConflict(_)
            | ArchivistError::InvalidStatus { .. }
            | ArchivistError::Corrupt(_) => ErrorKind::Integrity,
            ArchivistError::BackupNotFound(_)
            | ArchivistError::ParentMerging(_)
            | ArchivistError::Policy(_) => ErrorKind::Policy,
            ArchivistError::ChainBroken { .. } => ErrorKind::Fatal,
        }
    }
}

/// Classifies an error by the first [`ArchivistError`] in its chain.
/// Anything else is a generic failure.
pub fn error_kind(err: &anyhow::Error) -> ErrorKind {
    err.chain()
        .find_map(|e| e.downcast_ref::<ArchivistError>())
        .map(ArchivistError::kind)
        .or_else(|| {
            err.chain()
                .any(|e| e.downcast_ref::<LockError>().is_some())
                .then_some(ErrorKind::Transient)
        })
        .unwrap_or(ErrorKind::Transient)
}

/// Shorthand for refusing a request.
pub fn policy(msg: impl Into<String>) -> anyhow::Error {
    ArchivistError::Policy(msg.into()).into()
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::*;

    #[test]
    fn kinds_survive_context() {
        let err: anyhow::Error = ArchivistError::ChecksumConflict("000000010000000000000001".into())
            .into();
        let err = err.context("archive-push failed");
        assert_eq!(error_kind(&err), ErrorKind::Integrity);
        assert_eq!(error_kind(&err).exit_code(), 2);

        let err = Err::<(), _>(policy("refused"))
            .context("restore")
            .unwrap_err();
        assert_eq!(error_kind(&err), ErrorKind::Policy);

        let err = anyhow::anyhow!("disk on fire");
        assert_eq!(error_kind(&err).exit_code(), 1);
    }
}
