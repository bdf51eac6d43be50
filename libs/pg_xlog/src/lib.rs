//! PostgreSQL on-disk formats needed to archive and restore a cluster:
//! WAL and history file naming, timeline history files, relation file
//! names, the standard page header and the fields of `pg_control` that a
//! backup tool reads.
//!
//! Nothing here interprets WAL records. Segments are opaque blocks
//! identified by timeline and segment number.

pub mod controlfile;
pub mod page;
pub mod relfile_utils;
pub mod timeline_history;
pub mod xlog_utils;

pub use xlog_utils::{TimeLineID, XLogSegNo};

/// Size of a relation data page.
pub const BLCKSZ: usize = 8192;

/// Default size of a WAL segment file.
pub const DEFAULT_WAL_SEG_SIZE: usize = 16 * 1024 * 1024;

/// Number of blocks in a relation segment file (1 GiB / BLCKSZ).
pub const RELSEG_SIZE: u32 = 1024 * 1024 * 1024 / BLCKSZ as u32;

// From storage_xlog.h / relpath.h
pub const MAIN_FORKNUM: u8 = 0;
pub const FSM_FORKNUM: u8 = 1;
pub const VISIBILITYMAP_FORKNUM: u8 = 2;
pub const INIT_FORKNUM: u8 = 3;

/// OID of the `pg_global` tablespace, and the first OID assigned to user objects.
pub const GLOBALTABLESPACE_OID: u32 = 1664;
pub const DEFAULTTABLESPACE_OID: u32 = 1663;
pub const FIRST_NORMAL_OBJECT_ID: u32 = 16384;

/// Relative path of the control file inside a data directory.
pub const PG_CONTROL_FILE_PATH: &str = "global/pg_control";
pub const PG_CONTROL_FILE_SIZE: usize = 8192;

/// Is the given WAL segment size one PostgreSQL accepts (power of two
/// between 1 MiB and 1 GiB)?
pub fn is_valid_wal_seg_size(size: usize) -> bool {
    size.is_power_of_two() && (1024 * 1024..=1024 * 1024 * 1024).contains(&size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wal_seg_size_validation() {
        assert!(is_valid_wal_seg_size(DEFAULT_WAL_SEG_SIZE));
        assert!(is_valid_wal_seg_size(1024 * 1024));
        assert!(!is_valid_wal_seg_size(1000));
        assert!(!is_valid_wal_seg_size(2 * 1024 * 1024 * 1024));
        assert_eq!(RELSEG_SIZE, 131072);
    }
}
