//!
//! Reading the handful of `pg_control` fields a backup tool needs.
//!
//! The control file is stored in the data directory as `global/pg_control`.
//! Only the leading, version-independent part of ControlFileData is decoded:
//!
//! ```text
//!  0  system_identifier   u64
//!  8  pg_control_version  u32
//! 12  catalog_version_no  u32
//! 16  state               u32
//! 24  time                i64
//! 32  checkPoint          u64
//! -- checkPointCopy (CheckPoint) --
//! 40  redo                u64
//! 48  ThisTimeLineID      u32
//! 52  PrevTimeLineID      u32
//! ```
//!
//! The trailing CRC is not verified, the layout after these fields differs
//! between server versions.
//!
use anyhow::{Result, bail};
use byteorder::{ByteOrder, LittleEndian};
use utils::lsn::Lsn;

use crate::{PG_CONTROL_FILE_SIZE, TimeLineID};

const CONTROL_FIELDS_END: usize = 56;

/// DBState from pg_control.h
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbState {
    Startup,
    Shutdowned,
    ShutdownedInRecovery,
    Shutdowning,
    InCrashRecovery,
    InArchiveRecovery,
    InProduction,
    Unknown(u32),
}

impl From<u32> for DbState {
    fn from(v: u32) -> Self {
        match v {
            0 => DbState::Startup,
            1 => DbState::Shutdowned,
            2 => DbState::ShutdownedInRecovery,
            3 => DbState::Shutdowning,
            4 => DbState::InCrashRecovery,
            5 => DbState::InArchiveRecovery,
            6 => DbState::InProduction,
            other => DbState::Unknown(other),
        }
    }
}

impl From<DbState> for u32 {
    fn from(s: DbState) -> u32 {
        match s {
            DbState::Startup => 0,
            DbState::Shutdowned => 1,
            DbState::ShutdownedInRecovery => 2,
            DbState::Shutdowning => 3,
            DbState::InCrashRecovery => 4,
            DbState::InArchiveRecovery => 5,
            DbState::InProduction => 6,
            DbState::Unknown(v) => v,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlFileData {
    pub system_identifier: u64,
    pub pg_control_version: u32,
    pub catalog_version_no: u32,
    pub state: DbState,
    /// Unix time of the last pg_control update.
    pub time: i64,
    /// Location of the last checkpoint record.
    pub checkpoint: Lsn,
    /// REDO start point of the last checkpoint.
    pub redo: Lsn,
    pub this_timeline_id: TimeLineID,
    pub prev_timeline_id: TimeLineID,
}

impl ControlFileData {
    pub fn decode(buf: &[u8]) -> Result<ControlFileData> {
        if buf.len() < CONTROL_FIELDS_END {
            bail!("control file is too short: {} bytes", buf.len());
        }
        Ok(ControlFileData {
            system_identifier: LittleEndian::read_u64(&buf[0..8]),
            pg_control_version: LittleEndian::read_u32(&buf[8..12]),
            catalog_version_no: LittleEndian::read_u32(&buf[12..16]),
            state: DbState::from(LittleEndian::read_u32(&buf[16..20])),
            time: LittleEndian::read_i64(&buf[24..32]),
            checkpoint: Lsn(LittleEndian::read_u64(&buf[32..40])),
            redo: Lsn(LittleEndian::read_u64(&buf[40..48])),
            this_timeline_id: LittleEndian::read_u32(&buf[48..52]),
            prev_timeline_id: LittleEndian::read_u32(&buf[52..56]),
        })
    }

    /// Encodes the decoded fields into a zero-padded control file image.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; PG_CONTROL_FILE_SIZE];
        LittleEndian::write_u64(&mut buf[0..8], self.system_identifier);
        LittleEndian::write_u32(&mut buf[8..12], self.pg_control_version);
        LittleEndian::write_u32(&mut buf[12..16], self.catalog_version_no);
        LittleEndian::write_u32(&mut buf[16..20], self.state.into());
        LittleEndian::write_i64(&mut buf[24..32], self.time);
        LittleEndian::write_u64(&mut buf[32..40], self.checkpoint.0);
        LittleEndian::write_u64(&mut buf[40..48], self.redo.0);
        LittleEndian::write_u32(&mut buf[48..52], self.this_timeline_id);
        LittleEndian::write_u32(&mut buf[52..56], self.prev_timeline_id);
        buf
    }

    /// Was the server shut down cleanly, so that the data directory can be
    /// copied without a running server?
    pub fn is_cleanly_shut_down(&self) -> bool {
        matches!(
            self.state,
            DbState::Shutdowned | DbState::ShutdownedInRecovery
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_control_file() {
        let data = ControlFileData {
            system_identifier: 7_234_567_890_123_456_789,
            pg_control_version: 1300,
            catalog_version_no: 202307071,
            state: DbState::Shutdowned,
            time: 1_700_000_000,
            checkpoint: Lsn(0x3000060),
            redo: Lsn(0x3000028),
            this_timeline_id: 2,
            prev_timeline_id: 1,
        };
        let buf = data.encode();
        assert_eq!(buf.len(), PG_CONTROL_FILE_SIZE);
        let decoded = ControlFileData::decode(&buf).unwrap();
        assert_eq!(decoded, data);
        assert!(decoded.is_cleanly_shut_down());
        assert_eq!(crc32c::crc32c(&buf), crc32c::crc32c(&decoded.encode()));

        assert!(ControlFileData::decode(&buf[..10]).is_err());
    }
}
