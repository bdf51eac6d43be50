//! The timeline forest derived from the WAL archive.
//!
//! [`TimelineIndex::build`] is a pure function of the archive listing, the
//! history file contents and the backup list. Timelines are stored in an
//! arena ordered by timeline id; `parent` is an index into the same arena.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use pg_xlog::timeline_history::TimelineHistory;
use pg_xlog::xlog_utils::XLogFileKind;
use pg_xlog::{TimeLineID, XLogSegNo};
use tracing::warn;
use utils::lsn::Lsn;

use crate::catalog::{BackupId, BackupInfo, BackupStatus};
use crate::segment_store::ArchivedFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TimelineStatus {
    Ok,
    Degraded,
}

/// Closed interval of missing segment numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentInterval {
    pub begin: XLogSegNo,
    pub end: XLogSegNo,
}

#[derive(Debug, Clone)]
pub struct TimelineInfo {
    pub tli: TimeLineID,
    /// 0 when the timeline has no (readable) history.
    pub parent_tli: TimeLineID,
    /// Where this timeline forked from its parent, `0/0` for the root.
    pub switchpoint: Lsn,
    /// Arena index of the parent, if the parent timeline is in the archive.
    pub parent: Option<usize>,
    /// Ancestors with their switchpoints, nearest first.
    pub lineage: Vec<(TimeLineID, Lsn)>,
    pub min_segno: Option<XLogSegNo>,
    pub max_segno: Option<XLogSegNo>,
    pub n_segments: usize,
    /// Bytes on disk of every archived file of this timeline.
    pub size: u64,
    pub status: TimelineStatus,
    pub lost_segments: Vec<SegmentInterval>,
    /// Backups taken on this timeline, oldest first.
    pub backups: Vec<BackupId>,
    pub closest_backup_id: Option<BackupId>,
    /// Full segments present in the archive.
    pub segments: BTreeSet<XLogSegNo>,
}

#[derive(Debug, Clone, Default)]
pub struct TimelineIndex {
    pub timelines: Vec<TimelineInfo>,
    wal_seg_size: usize,
}

impl TimelineIndex {
    pub fn build(
        files: &[ArchivedFile],
        histories: &HashMap<TimeLineID, String>,
        backups: &[BackupInfo],
        wal_seg_size: usize,
    ) -> TimelineIndex {
        #[derive(Default)]
        struct Acc {
            segments: BTreeSet<XLogSegNo>,
            size: u64,
        }
        let mut per_tli: BTreeMap<TimeLineID, Acc> = BTreeMap::new();
        for file in files {
            let acc = per_tli.entry(file.kind.tli()).or_default();
            acc.size += file.size;
            if let XLogFileKind::Segment { segno, .. } = file.kind {
                if !file.compressed && file.size != wal_seg_size as u64 {
                    warn!(
                        "WAL segment {} has size {}, expected {wal_seg_size}, treating it as lost",
                        file.name, file.size
                    );
                    continue;
                }
                acc.segments.insert(segno);
            }
        }

        let mut timelines: Vec<TimelineInfo> = per_tli
            .into_iter()
            .map(|(tli, acc)| {
                let lineage = parse_lineage(tli, histories.get(&tli).map(String::as_str));
                let (parent_tli, switchpoint) = lineage.first().copied().unwrap_or((0, Lsn(0)));
                let lost_segments = lost_intervals(&acc.segments);
                TimelineInfo {
                    tli,
                    parent_tli,
                    switchpoint,
                    parent: None,
                    lineage,
                    min_segno: acc.segments.first().copied(),
                    max_segno: acc.segments.last().copied(),
                    n_segments: acc.segments.len(),
                    size: acc.size,
                    status: if lost_segments.is_empty() {
                        TimelineStatus::Ok
                    } else {
                        TimelineStatus::Degraded
                    },
                    lost_segments,
                    backups: backups
                        .iter()
                        .filter(|b| b.tli == tli)
                        .map(|b| b.id)
                        .collect(),
                    closest_backup_id: None,
                    segments: acc.segments,
                }
            })
            .collect();

        let positions: HashMap<TimeLineID, usize> = timelines
            .iter()
            .enumerate()
            .map(|(i, t)| (t.tli, i))
            .collect();
        for t in timelines.iter_mut() {
            t.parent = positions.get(&t.parent_tli).copied();
            t.closest_backup_id = closest_backup(&t.lineage, backups).map(|b| b.id);
        }

        TimelineIndex {
            timelines,
            wal_seg_size,
        }
    }

    pub fn wal_seg_size(&self) -> usize {
        self.wal_seg_size
    }

    pub fn get(&self, tli: TimeLineID) -> Option<&TimelineInfo> {
        self.timelines.iter().find(|t| t.tli == tli)
    }

    pub fn has_segment(&self, tli: TimeLineID, segno: XLogSegNo) -> bool {
        self.get(tli).is_some_and(|t| t.segments.contains(&segno))
    }

    /// Arena indexes of the ancestors of `idx`, nearest first.
    pub fn ancestors(&self, idx: usize) -> impl Iterator<Item = usize> + '_ {
        let mut current = self.timelines[idx].parent;
        let mut hops = 0;
        std::iter::from_fn(move || {
            let i = current?;
            hops += 1;
            if hops > self.timelines.len() {
                return None;
            }
            current = self.timelines[i].parent;
            Some(i)
        })
    }

    /// Segments that must be present to replay WAL from `from` to `to` on
    /// timeline `tli`, as (timeline, segno) pairs following the lineage
    /// across switchpoints.
    pub fn wal_path(
        &self,
        tli: TimeLineID,
        lineage: &[(TimeLineID, Lsn)],
        from: Lsn,
        to: Lsn,
    ) -> Vec<(TimeLineID, XLogSegNo)> {
        wal_path(tli, lineage, from, to, self.wal_seg_size)
    }
}

/// See [`TimelineIndex::wal_path`].
pub fn wal_path(
    tli: TimeLineID,
    lineage: &[(TimeLineID, Lsn)],
    from: Lsn,
    to: Lsn,
    wal_seg_size: usize,
) -> Vec<(TimeLineID, XLogSegNo)> {
    if from > to {
        return Vec::new();
    }
    // the segment holding a switchpoint is read from the newer timeline
    (from.segment_number(wal_seg_size)..=to.segment_number(wal_seg_size))
        .map(|segno| {
            let mut owner = tli;
            for &(ancestor, switchpoint) in lineage {
                if segno < switchpoint.segment_number(wal_seg_size) {
                    owner = ancestor;
                } else {
                    break;
                }
            }
            (owner, segno)
        })
        .collect()
}

/// The timeline that WAL at `lsn` belongs to, for a server on `tli` with the
/// given lineage (nearest ancestor first).
pub fn timeline_of(tli: TimeLineID, lineage: &[(TimeLineID, Lsn)], lsn: Lsn) -> TimeLineID {
    // the oldest ancestor whose switchpoint is after lsn owns it
    let mut owner = tli;
    for &(ancestor, switchpoint) in lineage {
        if lsn < switchpoint {
            owner = ancestor;
        } else {
            break;
        }
    }
    owner
}

/// Lineage of `tli` from its history file, nearest ancestor first. Empty for
/// timeline 1 and for timelines whose history is missing or unreadable.
pub fn parse_lineage(tli: TimeLineID, history: Option<&str>) -> Vec<(TimeLineID, Lsn)> {
    if tli == 1 {
        return Vec::new();
    }
    let parsed = history.map(|content| TimelineHistory::parse(tli, content));
    match parsed {
        Some(Ok(h)) => lineage_of(&h),
        Some(Err(e)) => {
            warn!("History file is corrupted or missing for timeline {tli}: {e}");
            Vec::new()
        }
        None => {
            warn!("History file is corrupted or missing for timeline {tli}");
            Vec::new()
        }
    }
}

/// Ancestors of a parsed history, nearest first.
pub fn lineage_of(history: &TimelineHistory) -> Vec<(TimeLineID, Lsn)> {
    history
        .entries
        .iter()
        .rev()
        .map(|e| (e.tli, e.switchpoint))
        .collect()
}

/// For each ancestor (nearest first), the latest OK backup on it that stops
/// at or before the point where the lineage left that ancestor.
pub fn closest_backup<'a>(
    lineage: &[(TimeLineID, Lsn)],
    backups: &'a [BackupInfo],
) -> Option<&'a BackupInfo> {
    lineage.iter().find_map(|&(ancestor, switchpoint)| {
        backups
            .iter()
            .filter(|b| {
                b.status == BackupStatus::Ok && b.tli == ancestor && b.stop_lsn <= switchpoint
            })
            .max_by_key(|b| (b.stop_lsn, b.id))
    })
}

fn lost_intervals(segments: &BTreeSet<XLogSegNo>) -> Vec<SegmentInterval> {
    let mut lost = Vec::new();
    let mut prev: Option<XLogSegNo> = None;
    for &segno in segments {
        if let Some(p) = prev {
            if segno > p + 1 {
                lost.push(SegmentInterval {
                    begin: p + 1,
                    end: segno - 1,
                });
            }
        }
        prev = Some(segno);
    }
    lost
}
