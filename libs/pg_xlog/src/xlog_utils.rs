//
// Naming of the files that live in a WAL archive: segments, partial
// segments, timeline history files and backup history labels.
//
// The helpers mirror the PostgreSQL macros of the same names in
// xlog_internal.h, which is why they don't follow the usual Rust naming
// conventions.
//

use utils::lsn::Lsn;

pub const XLOG_FNAME_LEN: usize = 24;

pub type XLogRecPtr = u64;
pub type TimeLineID = u32;
pub type XLogSegNo = u64;

pub const PARTIAL_SUFFIX: &str = ".partial";
pub const HISTORY_SUFFIX: &str = ".history";
pub const BACKUP_SUFFIX: &str = ".backup";

#[allow(non_snake_case)]
pub fn XLogSegmentsPerXLogId(wal_segsz_bytes: usize) -> XLogSegNo {
    (0x100000000u64 / wal_segsz_bytes as u64) as XLogSegNo
}

#[allow(non_snake_case)]
pub fn XLogSegNoOffsetToRecPtr(
    segno: XLogSegNo,
    offset: u32,
    wal_segsz_bytes: usize,
) -> XLogRecPtr {
    segno * (wal_segsz_bytes as u64) + (offset as u64)
}

#[allow(non_snake_case)]
pub fn XLogFileName(tli: TimeLineID, logSegNo: XLogSegNo, wal_segsz_bytes: usize) -> String {
    format!(
        "{:>08X}{:>08X}{:>08X}",
        tli,
        logSegNo / XLogSegmentsPerXLogId(wal_segsz_bytes),
        logSegNo % XLogSegmentsPerXLogId(wal_segsz_bytes)
    )
}

/// Parses a 24-character segment name. Returns `None` for anything else.
#[allow(non_snake_case)]
pub fn XLogFromFileName(fname: &str, wal_seg_size: usize) -> Option<(XLogSegNo, TimeLineID)> {
    if !IsXLogFileName(fname) {
        return None;
    }
    let tli = u32::from_str_radix(&fname[0..8], 16).ok()?;
    let log = u32::from_str_radix(&fname[8..16], 16).ok()? as XLogSegNo;
    let seg = u32::from_str_radix(&fname[16..24], 16).ok()? as XLogSegNo;
    Some((log * XLogSegmentsPerXLogId(wal_seg_size) + seg, tli))
}

#[allow(non_snake_case)]
pub fn IsXLogFileName(fname: &str) -> bool {
    fname.len() == XLOG_FNAME_LEN && fname.chars().all(|c| c.is_ascii_hexdigit())
}

#[allow(non_snake_case)]
pub fn IsPartialXLogFileName(fname: &str) -> bool {
    fname
        .strip_suffix(PARTIAL_SUFFIX)
        .is_some_and(IsXLogFileName)
}

#[allow(non_snake_case)]
pub fn TLHistoryFileName(tli: TimeLineID) -> String {
    format!("{tli:>08X}{HISTORY_SUFFIX}")
}

#[allow(non_snake_case)]
pub fn IsTLHistoryFileName(fname: &str) -> bool {
    fname
        .strip_suffix(HISTORY_SUFFIX)
        .is_some_and(|tli| tli.len() == 8 && tli.chars().all(|c| c.is_ascii_hexdigit()))
}

#[allow(non_snake_case)]
pub fn BackupHistoryFileName(
    tli: TimeLineID,
    logSegNo: XLogSegNo,
    start: Lsn,
    wal_segsz_bytes: usize,
) -> String {
    format!(
        "{}.{:>08X}{BACKUP_SUFFIX}",
        XLogFileName(tli, logSegNo, wal_segsz_bytes),
        start.segment_offset(wal_segsz_bytes)
    )
}

#[allow(non_snake_case)]
pub fn IsBackupHistoryFileName(fname: &str) -> bool {
    fname.len() == XLOG_FNAME_LEN + 1 + 8 + BACKUP_SUFFIX.len()
        && fname.ends_with(BACKUP_SUFFIX)
        && IsXLogFileName(&fname[..XLOG_FNAME_LEN])
        && fname.as_bytes()[XLOG_FNAME_LEN] == b'.'
        && fname[XLOG_FNAME_LEN + 1..XLOG_FNAME_LEN + 9]
            .chars()
            .all(|c| c.is_ascii_hexdigit())
}

/// Classification of a file name found in a WAL archive, after any
/// compression suffix has been stripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XLogFileKind {
    /// A complete WAL segment.
    Segment { tli: TimeLineID, segno: XLogSegNo },
    /// A segment that was not completed before a timeline switch.
    Partial { tli: TimeLineID, segno: XLogSegNo },
    /// `TTTTTTTT.history`
    History { tli: TimeLineID },
    /// `<segment>.XXXXXXXX.backup`
    BackupLabel { tli: TimeLineID, segno: XLogSegNo },
}

impl XLogFileKind {
    pub fn parse(fname: &str, wal_seg_size: usize) -> Option<XLogFileKind> {
        if IsXLogFileName(fname) {
            let (segno, tli) = XLogFromFileName(fname, wal_seg_size)?;
            Some(XLogFileKind::Segment { tli, segno })
        } else if IsPartialXLogFileName(fname) {
            let (segno, tli) = XLogFromFileName(&fname[..XLOG_FNAME_LEN], wal_seg_size)?;
            Some(XLogFileKind::Partial { tli, segno })
        } else if IsTLHistoryFileName(fname) {
            let tli = u32::from_str_radix(&fname[..8], 16).ok()?;
            Some(XLogFileKind::History { tli })
        } else if IsBackupHistoryFileName(fname) {
            let (segno, tli) = XLogFromFileName(&fname[..XLOG_FNAME_LEN], wal_seg_size)?;
            Some(XLogFileKind::BackupLabel { tli, segno })
        } else {
            None
        }
    }

    pub fn tli(&self) -> TimeLineID {
        match *self {
            XLogFileKind::Segment { tli, .. }
            | XLogFileKind::Partial { tli, .. }
            | XLogFileKind::History { tli }
            | XLogFileKind::BackupLabel { tli, .. } => tli,
        }
    }

    /// Segment number, for the kinds that have one.
    pub fn segno(&self) -> Option<XLogSegNo> {
        match *self {
            XLogFileKind::Segment { segno, .. }
            | XLogFileKind::Partial { segno, .. }
            | XLogFileKind::BackupLabel { segno, .. } => Some(segno),
            XLogFileKind::History { .. } => None,
        }
    }

    pub fn is_full_segment(&self) -> bool {
        matches!(self, XLogFileKind::Segment { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DEFAULT_WAL_SEG_SIZE;

    #[test]
    fn test_xlog_file_names() {
        let seg_sz = DEFAULT_WAL_SEG_SIZE;
        assert_eq!(XLogFileName(1, 1, seg_sz), "000000010000000000000001");
        assert_eq!(XLogFileName(3, 0x112, seg_sz), "000000030000000100000012");
        assert_eq!(
            XLogFromFileName("000000030000000100000012", seg_sz),
            Some((0x112, 3))
        );
        assert_eq!(XLogFromFileName("00000003000000010000001", seg_sz), None);
        assert_eq!(XLogFromFileName("00000003000000010000001Z", seg_sz), None);

        // 64MB segments: 64 segments per xlogid
        let big = 64 * 1024 * 1024;
        assert_eq!(XLogFileName(1, 65, big), "000000010000000100000001");
        assert_eq!(XLogFromFileName("000000010000000100000001", big), Some((65, 1)));
    }

    #[test]
    fn test_file_kinds() {
        let seg_sz = DEFAULT_WAL_SEG_SIZE;
        assert_eq!(
            XLogFileKind::parse("000000020000000000000005.partial", seg_sz),
            Some(XLogFileKind::Partial { tli: 2, segno: 5 })
        );
        assert_eq!(
            XLogFileKind::parse("0000000A.history", seg_sz),
            Some(XLogFileKind::History { tli: 10 })
        );
        assert_eq!(TLHistoryFileName(10), "0000000A.history");
        let label = BackupHistoryFileName(1, 2, Lsn(0x2000028), seg_sz);
        assert_eq!(label, "000000010000000000000002.00000028.backup");
        assert_eq!(
            XLogFileKind::parse(&label, seg_sz),
            Some(XLogFileKind::BackupLabel { tli: 1, segno: 2 })
        );
        assert_eq!(XLogFileKind::parse("archive_status", seg_sz), None);
        assert_eq!(XLogFileKind::parse("0000000A.history.part", seg_sz), None);
    }
}
