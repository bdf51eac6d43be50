//! `utils` is intended to be a place to put code that is shared
//! between the crates of this repository.

pub mod backoff;

/// `Lsn` type implements common tasks on Log Sequence Numbers
pub mod lsn;

// helper functions for creating and fsyncing
pub mod crashsafe;

// common log initialisation routine
pub mod logging;

/// Pid-file based advisory locks shared between processes.
pub mod lock_file;

pub mod fs_ext;
