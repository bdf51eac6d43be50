//! Retention: which backups and WAL files an instance no longer needs.
//!
//! Planning is pure ([`plan_retention`], [`plan_wal_purge`]) and takes the
//! current time as an argument; [`purge`] carries a plan out in an order
//! that never leaves a retained backup without its dependencies: victims
//! are marked `DELETING`, then expired chains are merged, then WAL is
//! removed, and finally backup directories, children before parents.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use pg_xlog::xlog_utils::XLogFileKind;
use pg_xlog::{TimeLineID, XLogSegNo};
use tracing::{info, instrument, warn};
use utils::lock_file::LockMode;

use crate::InstanceContext;
use crate::catalog::{self, BackupId, BackupInfo, BackupStatus, Catalog};
use crate::merge;
use crate::segment_store::{ArchivedFile, TransientFile};
use crate::timeline_index::{TimelineIndex, closest_backup, wal_path};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Number of FULL backups to keep.
    pub redundancy: u32,
    /// Keep backups that can restore to a point within this many days.
    pub window_days: u32,
    /// Number of backups per timeline that keep the ability to restore to
    /// any point after them. 0 keeps it for every retained backup.
    pub wal_depth: u32,
}

impl RetentionPolicy {
    pub fn is_set(&self) -> bool {
        self.redundancy > 0 || self.window_days > 0
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeleteOptions {
    pub expired: bool,
    pub merge_expired: bool,
    pub wal: bool,
    pub dry_run: bool,
    pub threads: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionPlan {
    /// Merges to run, as (FULL backup, backup it is merged into).
    pub merges: Vec<(BackupId, BackupId)>,
    /// Backups to delete, newest first.
    pub delete: Vec<BackupId>,
    pub keep: Vec<BackupId>,
}

/// What a purge did, or would do on a dry run.
#[derive(Debug, Clone, Default)]
pub struct PurgeReport {
    pub merged: Vec<(BackupId, BackupId)>,
    pub deleted: Vec<BackupId>,
    pub wal_removed: Vec<String>,
    pub transients_removed: Vec<String>,
}

/// Backups retention may consider at all.
fn is_candidate(b: &BackupInfo) -> bool {
    !matches!(
        b.status,
        BackupStatus::Running | BackupStatus::Merging | BackupStatus::Merged | BackupStatus::Deleting
    )
}

pub fn plan_retention(
    backups: &[BackupInfo],
    policy: RetentionPolicy,
    now: DateTime<Utc>,
    merge_expired: bool,
) -> RetentionPlan {
    let mut newest_first: Vec<&BackupInfo> = backups.iter().collect();
    newest_first.sort_by(|a, b| b.id.cmp(&a.id));

    let window_start = now - chrono::Duration::days(policy.window_days as i64);
    // position of each valid FULL backup, newest first, starting at 1
    let full_rank: HashMap<BackupId, u32> = newest_first
        .iter()
        .filter(|b| b.is_full() && b.is_ok())
        .zip(1..)
        .map(|(b, rank)| (b.id, rank))
        .collect();
    let chain_rank = |b: &BackupInfo| {
        catalog::parent_chain(backups, b.id)
            .ok()
            .and_then(|chain| chain.last().and_then(|full| full_rank.get(&full.id).copied()))
    };

    let mut keep: HashSet<BackupId> = HashSet::new();
    let mut expired: HashSet<BackupId> = HashSet::new();
    for b in &newest_first {
        if !is_candidate(b) {
            if b.status != BackupStatus::Deleting {
                keep.insert(b.id);
            }
            continue;
        }
        let kept = !policy.is_set()
            || (policy.redundancy > 0 && chain_rank(b).is_some_and(|rank| rank <= policy.redundancy))
            || (policy.window_days > 0 && b.recovery_time_or_start() >= window_start)
            || b.is_pinned(now);
        if kept {
            keep.insert(b.id);
        } else {
            expired.insert(b.id);
        }
    }

    // a kept backup keeps its whole chain, or the chain gets merged into it
    let mut merges: Vec<(BackupId, BackupId)> = Vec::new();
    let mut merged_away: HashSet<BackupId> = HashSet::new();
    let kept_now: Vec<BackupId> = keep.iter().copied().collect();
    let mut needed: HashMap<BackupId, Vec<BackupId>> = HashMap::new();
    for id in kept_now {
        let mut current = catalog::find_backup(backups, id);
        let mut path = Vec::new();
        while let Some(b) = current {
            path.push(b.id);
            if b.is_full() {
                break;
            }
            current = b.parent_backup_id.and_then(|p| catalog::find_backup(backups, p));
        }
        if let (Some(&full), true) = (path.last(), path.len() > 1) {
            needed.entry(full).or_default().push(id);
        }
        for ancestor in path {
            if expired.contains(&ancestor) {
                keep.insert(ancestor);
            }
        }
    }
    if merge_expired {
        for (full, dependents) in &needed {
            if !expired.contains(full) {
                continue;
            }
            let Some(&oldest) = dependents.iter().min() else {
                continue;
            };
            // every kept dependent must sit on the merged branch
            let mergeable = dependents
                .iter()
                .all(|d| catalog::is_ancestor(backups, oldest, *d))
                && catalog::parent_chain(backups, oldest).is_ok_and(|chain| {
                    chain.iter().all(|b| b.is_ok())
                });
            if !mergeable {
                continue;
            }
            if let Ok(chain) = catalog::parent_chain(backups, oldest) {
                for b in chain.iter().skip(1) {
                    merged_away.insert(b.id);
                }
            }
            merges.push((*full, oldest));
        }
        merges.sort();
    }

    // an interrupted delete is finished, it takes its dependents along
    let mut doomed: HashSet<BackupId> = HashSet::new();
    for b in backups.iter().filter(|b| b.status == BackupStatus::Deleting) {
        doomed.insert(b.id);
        doomed.extend(catalog::descendants(backups, b.id).iter().map(|d| d.id));
    }
    let mut delete: Vec<BackupId> = backups
        .iter()
        .filter(|b| doomed.contains(&b.id) || (expired.contains(&b.id) && !keep.contains(&b.id)))
        .map(|b| b.id)
        .collect();
    delete.sort_by(|a, b| b.cmp(a));
    let mut keep: Vec<BackupId> = keep
        .into_iter()
        .filter(|id| !merged_away.contains(id) && !doomed.contains(id))
        .collect();
    keep.sort();
    RetentionPlan {
        merges,
        delete,
        keep,
    }
}

/// Inclusive segment ranges per timeline that must stay in the archive.
fn protected_ranges(
    index: &TimelineIndex,
    retained: &[BackupInfo],
    wal_depth: u32,
) -> HashMap<TimeLineID, Vec<(XLogSegNo, XLogSegNo)>> {
    let seg = index.wal_seg_size();
    let mut ranges: HashMap<TimeLineID, Vec<(XLogSegNo, XLogSegNo)>> = HashMap::new();

    let tlis: BTreeSet<TimeLineID> = index
        .timelines
        .iter()
        .map(|t| t.tli)
        .chain(retained.iter().map(|b| b.tli))
        .collect();
    for &tli in &tlis {
        let own: Vec<&BackupInfo> = retained.iter().filter(|b| b.tli == tli).collect();
        let protect = ranges.entry(tli).or_default();
        for b in &own {
            let end = if b.status == BackupStatus::Running {
                XLogSegNo::MAX
            } else {
                b.stop_lsn.segment_number(seg)
            };
            protect.push((b.start_lsn.segment_number(seg), end));
        }
        // restore to any point after the floor
        let mut valid: Vec<&&BackupInfo> = own.iter().filter(|b| b.is_ok()).collect();
        valid.sort_by(|a, b| b.start_lsn.cmp(&a.start_lsn));
        let floor = match wal_depth {
            0 => valid.last(),
            depth => valid.get(depth as usize - 1).or(valid.last()),
        };
        if let Some(floor) = floor {
            protect.push((floor.start_lsn.segment_number(seg), XLogSegNo::MAX));
        }
    }

    // WAL that leads from a backup on an ancestor to a timeline that is kept
    let valid_retained: Vec<BackupInfo> = retained.iter().filter(|b| b.is_ok()).cloned().collect();
    for t in &index.timelines {
        if t.lineage.is_empty() || ranges.get(&t.tli).is_none_or(|r| r.is_empty()) {
            continue;
        }
        let Some(anchor) = closest_backup(&t.lineage, &valid_retained) else {
            continue;
        };
        for (owner, segno) in wal_path(t.tli, &t.lineage, anchor.start_lsn, t.switchpoint, seg) {
            ranges.entry(owner).or_default().push((segno, segno));
        }
    }
    ranges
}

/// Archived WAL files that no retained backup or kept timeline needs.
/// History files are never selected.
pub fn plan_wal_purge(
    index: &TimelineIndex,
    files: &[ArchivedFile],
    retained: &[BackupInfo],
    wal_depth: u32,
) -> Vec<ArchivedFile> {
    let ranges = protected_ranges(index, retained, wal_depth);
    let is_protected = |tli: TimeLineID, segno: XLogSegNo| {
        ranges
            .get(&tli)
            .is_some_and(|r| r.iter().any(|&(begin, end)| begin <= segno && segno <= end))
    };
    files
        .iter()
        .filter(|f| match f.kind {
            XLogFileKind::History { .. } => false,
            XLogFileKind::Segment { tli, segno }
            | XLogFileKind::Partial { tli, segno }
            | XLogFileKind::BackupLabel { tli, segno } => !is_protected(tli, segno),
        })
        .cloned()
        .collect()
}

fn stale_transients(transients: &[TransientFile], part_timeout: Duration, now: SystemTime) -> Vec<String> {
    transients
        .iter()
        .filter(|t| now.duration_since(t.modified).unwrap_or_default() >= part_timeout)
        .map(|t| t.file_name.clone())
        .collect()
}

/// Applies the retention policy: merges or deletes expired backups with
/// `expired`/`merge_expired`, purges WAL with `wal`.
#[instrument(skip_all, fields(instance = %ctx.instance))]
pub async fn purge(
    ctx: &InstanceContext,
    policy: RetentionPolicy,
    opts: &DeleteOptions,
    now: DateTime<Utc>,
) -> anyhow::Result<PurgeReport> {
    let catalog = ctx.catalog();
    let _instance_lock = catalog.lock_instance()?;
    let mut report = PurgeReport::default();

    let mut backups = catalog.list()?;
    let plan = plan_retention(&backups, policy, now, opts.merge_expired);
    if !policy.is_set() && (opts.expired || opts.merge_expired) {
        info!("Retention policy is not set, no backups expire");
    }
    for id in &plan.keep {
        info!("Backup {id} is kept by retention");
    }

    let victims: Vec<BackupId> = if opts.expired || opts.merge_expired {
        plan.delete.clone()
    } else {
        // without a policy to apply, only interrupted deletes are finished
        plan_retention(&backups, RetentionPolicy::default(), now, false).delete
    };
    let merged_away: HashSet<BackupId> = if opts.dry_run {
        plan.merges
            .iter()
            .flat_map(|&(_, into)| {
                catalog::parent_chain(&backups, into)
                    .map(|chain| chain.iter().skip(1).map(|b| b.id).collect::<Vec<_>>())
                    .unwrap_or_default()
            })
            .collect()
    } else {
        HashSet::new()
    };
    for id in &victims {
        info!("Backup {id} is expired, deleting it");
    }
    // marked before merging, a merge leaves branches that are being deleted alone
    if !opts.dry_run {
        mark_deleting(&catalog, &backups, &victims)?;
    }

    if opts.merge_expired {
        for &(full, into) in &plan.merges {
            info!("Merging expired FULL backup {full} into {into}");
            report.merged.push((full, into));
            if !opts.dry_run {
                merge::merge_backup(ctx, into, opts.threads).await?;
            }
        }
        if !opts.dry_run {
            backups = catalog.list()?;
        }
    }

    if opts.wal {
        let store = ctx.wal_store();
        let listing = store.list().await?;
        let histories = store.read_histories(&listing).await?;
        let retained: Vec<BackupInfo> = backups
            .iter()
            .filter(|b| !victims.contains(&b.id) && !merged_away.contains(&b.id))
            .filter(|b| !matches!(b.status, BackupStatus::Deleting | BackupStatus::Error))
            .cloned()
            .collect();
        let index = TimelineIndex::build(&listing.files, &histories, &retained, store.wal_seg_size());
        for file in plan_wal_purge(&index, &listing.files, &retained, policy.wal_depth) {
            report.wal_removed.push(file.file_name());
            if !opts.dry_run {
                store.remove(&file).await?;
            }
        }
        let stale = stale_transients(&listing.transients, ctx.config.part_timeout, SystemTime::now());
        for name in stale {
            warn!("removing stale transient WAL file {name}");
            if !opts.dry_run {
                store.remove_file_name(&name).await?;
            }
            report.transients_removed.push(name);
        }
        info!("{} WAL files to remove", report.wal_removed.len());
    }

    if !opts.dry_run {
        remove_backups(&catalog, &victims)?;
    }
    report.deleted = victims;
    Ok(report)
}

fn mark_deleting(catalog: &Catalog, backups: &[BackupInfo], victims: &[BackupId]) -> anyhow::Result<()> {
    for id in victims {
        let Some(b) = catalog::find_backup(backups, *id) else {
            continue;
        };
        if b.status == BackupStatus::Deleting {
            continue;
        }
        let _lock = catalog.lock_backup(*id, LockMode::Exclusive)?;
        let mut b = b.clone();
        catalog.set_status(&mut b, BackupStatus::Deleting)?;
    }
    Ok(())
}

/// Removes backup directories newest first, so a child is always gone
/// before its parent.
fn remove_backups(catalog: &Catalog, victims: &[BackupId]) -> anyhow::Result<()> {
    let mut ordered = victims.to_vec();
    ordered.sort_by(|a, b| b.cmp(a));
    for id in ordered {
        let _lock = catalog.lock_backup(id, LockMode::Exclusive)?;
        catalog.remove_backup_dir(id)?;
        info!("Backup {id} is deleted");
    }
    Ok(())
}

/// Deletes a backup and every backup that depends on it.
#[instrument(skip_all, fields(instance = %ctx.instance, backup_id = %id))]
pub async fn delete_backup(ctx: &InstanceContext, id: BackupId, dry_run: bool) -> anyhow::Result<Vec<BackupId>> {
    let catalog = ctx.catalog();
    let _instance_lock = catalog.lock_instance()?;
    let backups = catalog.list()?;
    catalog::find_backup(&backups, id).ok_or(crate::error::ArchivistError::BackupNotFound(id))?;
    let mut victims: Vec<BackupId> = catalog::descendants(&backups, id).iter().map(|b| b.id).collect();
    victims.push(id);
    delete_victims(&catalog, &backups, victims, dry_run)
}

/// Deletes every backup with `status`, together with its dependents.
#[instrument(skip_all, fields(instance = %ctx.instance, %status))]
pub async fn delete_by_status(
    ctx: &InstanceContext,
    status: BackupStatus,
    dry_run: bool,
) -> anyhow::Result<Vec<BackupId>> {
    let catalog = ctx.catalog();
    let _instance_lock = catalog.lock_instance()?;
    let backups = catalog.list()?;
    let mut victims = BTreeSet::new();
    for b in backups.iter().filter(|b| b.status == status) {
        victims.insert(b.id);
        victims.extend(catalog::descendants(&backups, b.id).iter().map(|d| d.id));
    }
    if victims.is_empty() {
        info!("There are no backups with status {status}");
    }
    delete_victims(&catalog, &backups, victims.into_iter().collect(), dry_run)
}

fn delete_victims(
    catalog: &Catalog,
    backups: &[BackupInfo],
    mut victims: Vec<BackupId>,
    dry_run: bool,
) -> anyhow::Result<Vec<BackupId>> {
    victims.sort_by(|a, b| b.cmp(a));
    victims.dedup();
    for id in &victims {
        info!("Backup {id} {}", if dry_run { "would be deleted" } else { "is deleted" });
    }
    if !dry_run {
        mark_deleting(catalog, backups, &victims)?;
        remove_backups(catalog, &victims)?;
    }
    Ok(victims)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use pg_xlog::xlog_utils::{TLHistoryFileName, XLogFileName};
    use utils::lsn::Lsn;

    use super::*;
    use crate::catalog::BackupMode;

    const SEG: usize = 16 * 1024 * 1024;

    fn day(d: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + d * 86_400, 0).unwrap()
    }

    fn backup(id: u64, mode: BackupMode, parent: Option<u64>, d: i64) -> BackupInfo {
        let mut b = BackupInfo::new(BackupId(id), mode, day(d));
        b.status = BackupStatus::Ok;
        b.parent_backup_id = parent.map(BackupId);
        b.recovery_time = Some(day(d));
        b.start_lsn = Lsn(id * SEG as u64 + 0x28);
        b.stop_lsn = Lsn(id * SEG as u64 + 0x1000);
        b.wal_seg_size = SEG;
        b
    }

    fn ids(v: &[u64]) -> Vec<BackupId> {
        v.iter().copied().map(BackupId).collect()
    }

    /// F1 <- D2 <- D3   F4 <- D5   F6
    fn catalog() -> Vec<BackupInfo> {
        vec![
            backup(1, BackupMode::Full, None, 0),
            backup(2, BackupMode::Delta, Some(1), 1),
            backup(3, BackupMode::Page, Some(2), 2),
            backup(4, BackupMode::Full, None, 3),
            backup(5, BackupMode::Delta, Some(4), 4),
            backup(6, BackupMode::Full, None, 5),
        ]
    }

    #[test]
    fn redundancy_keeps_whole_chains() {
        let policy = RetentionPolicy {
            redundancy: 1,
            ..Default::default()
        };
        let plan = plan_retention(&catalog(), policy, day(10), false);
        assert_eq!(plan.delete, ids(&[5, 4, 3, 2, 1]));
        assert_eq!(plan.keep, ids(&[6]));

        // incrementals count with the FULL backup they are built on
        let policy = RetentionPolicy {
            redundancy: 2,
            ..Default::default()
        };
        let plan = plan_retention(&catalog(), policy, day(10), false);
        assert_eq!(plan.delete, ids(&[3, 2, 1]));
        assert_eq!(plan.keep, ids(&[4, 5, 6]));

        let plan = plan_retention(&catalog(), RetentionPolicy::default(), day(10), false);
        assert!(plan.delete.is_empty());
    }

    #[test]
    fn window_never_orphans_kept_backups() {
        let policy = RetentionPolicy {
            window_days: 7,
            ..Default::default()
        };
        // only D3 and newer are inside the window, D3 needs F1 and D2
        let plan = plan_retention(&catalog(), policy, day(9), false);
        assert!(plan.delete.is_empty(), "{plan:?}");

        let plan = plan_retention(&catalog(), policy, day(11), false);
        assert_eq!(plan.delete, ids(&[3, 2, 1]));
    }

    #[test]
    fn pinned_and_busy_backups_stay() {
        let mut backups = catalog();
        backups[0].expire_time = Some(day(20));
        backups[1].status = BackupStatus::Merging;
        backups[3].status = BackupStatus::Deleting;
        let policy = RetentionPolicy {
            redundancy: 1,
            ..Default::default()
        };
        let plan = plan_retention(&backups, policy, day(10), false);
        assert!(plan.keep.contains(&BackupId(1)));
        assert!(plan.keep.contains(&BackupId(2)));
        // an interrupted delete is finished, together with what depends on it;
        // D3 belongs to the second newest valid FULL backup and expires
        assert_eq!(plan.delete, ids(&[5, 4, 3]));
    }

    #[test]
    fn merge_expired_merges_into_oldest_kept() {
        let policy = RetentionPolicy {
            window_days: 7,
            ..Default::default()
        };
        let plan = plan_retention(&catalog(), policy, day(9), true);
        assert_eq!(plan.merges, vec![(BackupId(1), BackupId(3))]);
        assert!(!plan.keep.contains(&BackupId(1)));
        assert!(!plan.keep.contains(&BackupId(2)));
        assert!(plan.delete.is_empty());

        // a second branch off the FULL backup blocks the merge
        let mut backups = catalog();
        backups.push(backup(7, BackupMode::Delta, Some(1), 6));
        let plan = plan_retention(&backups, policy, day(9), true);
        assert!(plan.merges.is_empty());
        assert!(plan.keep.contains(&BackupId(1)));
    }

    fn archive(tli: TimeLineID, segnos: std::ops::RangeInclusive<u64>) -> Vec<ArchivedFile> {
        segnos
            .map(|segno| ArchivedFile {
                name: XLogFileName(tli, segno, SEG),
                kind: XLogFileKind::Segment { tli, segno },
                compressed: false,
                size: SEG as u64,
            })
            .collect()
    }

    fn removed(files: &[ArchivedFile]) -> Vec<(TimeLineID, XLogSegNo)> {
        files
            .iter()
            .filter_map(|f| match f.kind {
                XLogFileKind::Segment { tli, segno } => Some((tli, segno)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn wal_depth_sets_the_pitr_floor() {
        let files = archive(1, 1..=8);
        let retained = vec![
            backup(2, BackupMode::Full, None, 0),
            backup(4, BackupMode::Full, None, 1),
            backup(6, BackupMode::Full, None, 2),
        ];
        let index = TimelineIndex::build(&files, &HashMap::new(), &retained, SEG);

        let purge = plan_wal_purge(&index, &files, &retained, 0);
        assert_eq!(removed(&purge), vec![(1, 1)]);

        // segments of older backups stay, the gaps between them go
        let purge = plan_wal_purge(&index, &files, &retained, 1);
        assert_eq!(removed(&purge), vec![(1, 1), (1, 3), (1, 5)]);
    }

    #[test]
    fn timelines_without_backups_are_purged_but_history_stays() {
        let mut files = archive(1, 1..=6);
        files.extend(archive(2, 4..=9));
        files.push(ArchivedFile {
            name: TLHistoryFileName(2),
            kind: XLogFileKind::History { tli: 2 },
            compressed: false,
            size: 40,
        });
        let mut histories = HashMap::new();
        histories.insert(2, "1\t0/4800000\tno recovery target specified\n".to_string());

        // a backup on tli 2 whose chain starts at the FULL backup on tli 1
        let full = backup(2, BackupMode::Full, None, 0);
        let mut page = backup(7, BackupMode::Page, Some(2), 2);
        page.tli = 2;
        let retained = vec![full.clone(), backup(6, BackupMode::Full, None, 1), page];
        let index = TimelineIndex::build(&files, &histories, &retained, SEG);
        let purge = plan_wal_purge(&index, &files, &retained, 1);
        // tli 1 keeps the path from the FULL backup to the switchpoint, the
        // segment holding the switchpoint comes from tli 2
        assert_eq!(removed(&purge), vec![(1, 1), (1, 4), (1, 5), (2, 5), (2, 6)]);

        // without backups on tli 2, nothing of it is needed
        let retained = vec![full];
        let index = TimelineIndex::build(&files, &histories, &retained, SEG);
        let purge = plan_wal_purge(&index, &files, &retained, 1);
        assert!(removed(&purge).contains(&(2, 9)));
        assert!(purge.iter().all(|f| !matches!(f.kind, XLogFileKind::History { .. })));
    }

    #[test]
    fn stale_parts_are_selected() {
        let now = SystemTime::now();
        let transients = vec![
            TransientFile {
                file_name: "000000010000000000000001.part".into(),
                modified: now - Duration::from_secs(600),
            },
            TransientFile {
                file_name: "000000010000000000000002.part".into(),
                modified: now,
            },
        ];
        assert_eq!(
            stale_transients(&transients, Duration::from_secs(300), now),
            vec!["000000010000000000000001.part".to_string()]
        );
    }
}
