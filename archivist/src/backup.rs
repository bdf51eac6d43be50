//! Taking backups.
//!
//! A FULL backup copies every file of the data directory. PAGE, DELTA and
//! PTRACK backups copy only what changed since the parent backup: data
//! files as page streams of the changed blocks, other files only when their
//! content differs from the parent's copy. The parent is the newest valid
//! backup on the server's timeline or one of its ancestors.

use std::collections::{BTreeSet, HashMap};
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use pg_xlog::timeline_history::TimelineHistory;
use pg_xlog::xlog_utils::TLHistoryFileName;
use pg_xlog::TimeLineID;
use tracing::{error, info, instrument, warn};
use utils::backoff::poll_until;
use utils::lock_file::LockMode;
use utils::lsn::Lsn;

use crate::InstanceContext;
use crate::catalog::{self, BackupInfo, BackupMode, BackupStatus, WalMode};
use crate::compression::{self, CompressAlg};
use crate::config::InstanceConfig;
use crate::content::{FileEntry, FileKind};
use crate::datafile::{PageSelector, backup_data_file, is_relation_datafile};
use crate::error::{self, ArchivistError};
use crate::server::{BACKUP_LABEL_FILE, PageMap, ServerControl, TABLESPACE_MAP_FILE};
use crate::timeline_index::{lineage_of, wal_path};

/// Top-level directories whose content is never backed up. The directories
/// themselves are, the server expects them to exist.
const EXCLUDED_DIR_CONTENTS: &[&str] = &[
    "pg_wal",
    "pg_replslot",
    "pg_stat_tmp",
    "pg_notify",
    "pg_serial",
    "pg_snapshots",
    "pg_subtrans",
    "pg_dynshmem",
];

/// File names skipped wherever they appear.
const EXCLUDED_FILES: &[&str] = &[
    "postmaster.pid",
    "postmaster.opts",
    "pg_internal.init",
    "backup_label",
    "backup_label.old",
    "tablespace_map",
    "recovery.signal",
    "standby.signal",
];

const TEMP_FILE_PREFIX: &str = "pgsql_tmp";

#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub mode: BackupMode,
    /// Copy the WAL needed to make the backup consistent into the backup
    /// itself instead of relying on the archive.
    pub stream: bool,
    pub external_dirs: Vec<Utf8PathBuf>,
    pub compress_alg: CompressAlg,
    pub compress_level: u32,
    pub threads: usize,
    pub note: Option<String>,
    /// Pins the backup for this long. Takes precedence over `expire_time`.
    pub ttl: Option<Duration>,
    pub expire_time: Option<DateTime<Utc>>,
    /// How long to wait for the WAL of an ARCHIVE backup to be archived.
    pub archive_timeout: Duration,
}

impl BackupOptions {
    pub fn new(mode: BackupMode, config: &InstanceConfig) -> BackupOptions {
        BackupOptions {
            mode,
            stream: false,
            external_dirs: config.external_dirs.clone(),
            compress_alg: config.compress_alg,
            compress_level: config.compress_level,
            threads: crate::defaults::DEFAULT_THREADS,
            note: None,
            ttl: None,
            expire_time: None,
            archive_timeout: config.archive_timeout,
        }
    }
}

/// Takes a backup of the server's data directory.
#[instrument(skip_all, fields(instance = %ctx.instance, mode = %opts.mode))]
pub async fn take_backup<S: ServerControl>(
    ctx: &InstanceContext,
    server: &S,
    opts: &BackupOptions,
) -> anyhow::Result<BackupInfo> {
    opts.compress_alg.validate_level(opts.compress_level)?;
    let catalog = ctx.catalog();
    let backups = catalog.list()?;

    let mut parent = None;
    let mut _parent_locks = Vec::new();
    if opts.mode.is_incremental() {
        let history = server.timeline_history().await?;
        let chain = select_parent(&backups, &history)?;
        _parent_locks = catalog.lock_chain(&chain, LockMode::Shared)?;
        info!(
            "Parent backup: {}, chain of {} backups down to FULL backup {}",
            chain[0].id,
            chain.len(),
            chain[chain.len() - 1].id
        );
        parent = Some(chain[0].clone());
    }

    let start_time = Utc::now();
    let id = catalog.create_backup_dir(start_time)?;
    let _lock = catalog.lock_backup(id, LockMode::Exclusive)?;
    let mut info = BackupInfo::new(id, opts.mode, start_time);
    info.parent_backup_id = parent.as_ref().map(|p| p.id);
    info.wal = if opts.stream {
        WalMode::Stream
    } else {
        WalMode::Archive
    };
    info.compress_alg = opts.compress_alg;
    info.compress_level = opts.compress_level;
    info.wal_seg_size = ctx.config.wal_seg_size;
    info.block_size = ctx.config.block_size;
    info.external_dirs = opts.external_dirs.clone();
    info.note = opts.note.clone();
    info.expire_time = match opts.ttl {
        Some(ttl) => Some(start_time + chrono::Duration::from_std(ttl)?),
        None => opts.expire_time,
    };
    catalog.write_control(&info)?;
    info!("Backup {id} started, mode {}", opts.mode);

    if let Err(e) = run_backup(ctx, server, opts, parent.as_ref(), &mut info).await {
        error!("Backup {id} failed: {e:#}");
        info.end_time = Some(Utc::now());
        if let Err(status_err) = catalog.set_status(&mut info, BackupStatus::Error) {
            warn!("failed to mark backup {id} as failed: {status_err:#}");
        }
        return Err(e);
    }
    Ok(info)
}

/// The parent chain for a new incremental backup, newest first: the newest
/// backup on the server's timeline or one of its ancestors, followed down to
/// its FULL backup. Every member must be valid.
pub fn select_parent<'a>(
    backups: &'a [BackupInfo],
    history: &TimelineHistory,
) -> anyhow::Result<Vec<&'a BackupInfo>> {
    let candidate = backups
        .iter()
        .rev()
        .filter(|b| history.contains(b.tli, b.stop_lsn))
        .find(|b| {
            matches!(
                b.status,
                BackupStatus::Ok | BackupStatus::Merging | BackupStatus::Merged
            )
        })
        .ok_or_else(|| {
            error::policy(format!(
                "Valid full backup on current timeline {} is not found, take a FULL backup first",
                history.tli
            ))
        })?;
    let chain = catalog::parent_chain(backups, candidate.id)?;
    if chain
        .iter()
        .any(|b| matches!(b.status, BackupStatus::Merging | BackupStatus::Merged))
    {
        return Err(ArchivistError::ParentMerging(candidate.id).into());
    }
    if let Some(invalid) = chain.iter().find(|b| !b.is_ok()) {
        return Err(ArchivistError::InvalidStatus {
            id: invalid.id,
            status: invalid.status,
        }
        .into());
    }
    Ok(chain)
}

async fn run_backup<S: ServerControl>(
    ctx: &InstanceContext,
    server: &S,
    opts: &BackupOptions,
    parent: Option<&BackupInfo>,
    info: &mut BackupInfo,
) -> anyhow::Result<()> {
    let catalog = ctx.catalog();
    let backup_dir = catalog.backup_dir(info.id);
    let no_sync = ctx.conf.no_sync;

    let start = server
        .start_backup(&format!("archivist backup {}", info.id))
        .await?;
    if let Some(expected) = ctx.config.system_identifier {
        if expected != start.system_identifier {
            return Err(error::policy(format!(
                "server system identifier {} does not match instance '{}' ({expected})",
                start.system_identifier, ctx.instance
            )));
        }
    }
    info.tli = start.tli;
    info.start_lsn = start.start_lsn;
    info.system_identifier = start.system_identifier;
    catalog.write_control(info)?;

    let changes = match parent {
        None => Changes::All,
        Some(parent) => {
            if start.start_lsn < parent.start_lsn {
                return Err(ArchivistError::Corrupt(format!(
                    "Current START LSN {} is lower than START LSN {} of previous backup {}. \
                     It may indicate that we are trying to backup PostgreSQL instance from the past",
                    start.start_lsn, parent.start_lsn, parent.id
                ))
                .into());
            }
            match info.backup_mode {
                BackupMode::Page => {
                    check_wal_continuity(ctx, server, parent.start_lsn, start.start_lsn).await?;
                    Changes::Map(
                        server
                            .wal_page_map(start.tli, parent.start_lsn, start.start_lsn)
                            .await?,
                    )
                }
                BackupMode::Ptrack => Changes::Map(server.ptrack_page_map(parent.start_lsn).await?),
                BackupMode::Delta => Changes::Lsn(parent.start_lsn),
                BackupMode::Full => Changes::All,
            }
        }
    };

    let parent_entries = match parent {
        Some(parent) => catalog
            .read_content(parent.id)?
            .into_iter()
            .map(|e| ((e.external_dir_num, e.path.clone()), e))
            .collect(),
        None => HashMap::new(),
    };

    let mut roots = vec![(0, server.pgdata().to_path_buf())];
    for (i, dir) in opts.external_dirs.iter().enumerate() {
        roots.push((i as u32 + 1, dir.clone()));
    }
    let mut entries = Vec::new();
    let mut files = Vec::new();
    for (ext, root) in &roots {
        let (dirs, found) = scan_source(root, *ext)?;
        entries.extend(dirs);
        files.extend(found);
    }
    for dir in &entries {
        utils::crashsafe::create_dir_all(dir.stored_path(&backup_dir))?;
    }
    for (ext, _) in &roots {
        utils::crashsafe::create_dir_all(crate::content::stored_path(&backup_dir, *ext, ""))?;
    }
    info!("copying {} files", files.len());

    let job = Arc::new(CopyJob {
        backup_dir: backup_dir.clone(),
        compress_alg: opts.compress_alg,
        compress_level: opts.compress_level,
        parent_entries,
        changes,
        no_sync,
    });
    let copied: Vec<anyhow::Result<Option<FileEntry>>> = futures::stream::iter(files)
        .map(|file| {
            let job = Arc::clone(&job);
            async move {
                let rel = file.rel.clone();
                tokio::task::spawn_blocking(move || job.copy(file))
                    .await
                    .context("file copy task panicked")?
                    .with_context(|| format!("failed to back up {rel}"))
            }
        })
        .buffer_unordered(opts.threads.max(1))
        .collect()
        .await;
    for result in copied {
        if let Some(entry) = result? {
            entries.push(entry);
        }
    }

    let stop = server.stop_backup().await?;
    info.stop_lsn = stop.stop_lsn;
    info.recovery_time = stop.recovery_time;
    info.recovery_xid = stop.recovery_xid;
    entries.push(store_generated(&backup_dir, BACKUP_LABEL_FILE, stop.backup_label.as_bytes(), no_sync)?);
    if let Some(map) = &stop.tablespace_map {
        entries.push(store_generated(&backup_dir, TABLESPACE_MAP_FILE, map.as_bytes(), no_sync)?);
    }

    let seg = info.wal_seg_size;
    if opts.stream {
        let history = server.timeline_history().await?;
        for segno in start.start_lsn.segment_number(seg)..=stop.stop_lsn.segment_number(seg) {
            let name = ctx.wal_store().segment_name(start.tli, segno);
            let data = server.fetch_wal(start.tli, segno).await?;
            info.wal_bytes += data.len() as u64;
            entries.push(store_generated(&backup_dir, &format!("pg_wal/{name}"), &data, no_sync)?);
        }
        if start.tli > 1 {
            let name = TLHistoryFileName(start.tli);
            entries.push(store_generated(
                &backup_dir,
                &format!("pg_wal/{name}"),
                history.render().as_bytes(),
                no_sync,
            )?);
        }
    } else {
        info.wal_bytes =
            wait_for_archive(ctx, start.tli, start.start_lsn, stop.stop_lsn, opts.archive_timeout).await?;
    }

    entries.sort_by(|a, b| a.key().cmp(&b.key()));
    info.data_bytes = entries.iter().filter_map(|e| e.write_size).sum();
    catalog.write_content(info.id, &entries)?;
    catalog.write_database_map(info.id, &server.database_map().await?)?;
    info.end_time = Some(Utc::now());
    catalog.set_status(info, BackupStatus::Ok)?;
    info!(
        "Backup {} completed, {} files, {} bytes of data, start LSN {}, stop LSN {}",
        info.id,
        entries.len(),
        info.data_bytes,
        info.start_lsn,
        info.stop_lsn
    );
    Ok(())
}

/// A PAGE backup reads the changes from WAL, so every segment between the
/// parent's start and ours must be in the archive. The segment holding our
/// own start is still being written.
async fn check_wal_continuity<S: ServerControl>(
    ctx: &InstanceContext,
    server: &S,
    from: Lsn,
    to: Lsn,
) -> anyhow::Result<()> {
    let seg = ctx.config.wal_seg_size;
    let history = server.timeline_history().await?;
    let lineage = lineage_of(&history);
    let Some(last) = to.segment_lsn(seg).checked_sub(1u64) else {
        return Ok(());
    };
    let store = ctx.wal_store();
    for (tli, segno) in wal_path(history.tli, &lineage, from, last, seg) {
        let name = store.segment_name(tli, segno);
        if store.find(&name).await?.is_none() {
            return Err(anyhow::Error::new(ArchivistError::WalAbsent(name)).context(format!(
                "WAL between LSN {from} and {to} is not continuous in the archive, \
                 a PAGE backup is not possible"
            )));
        }
    }
    Ok(())
}

/// Waits until every segment from `start` to `stop` on `tli` is archived.
/// Returns the archived WAL size.
async fn wait_for_archive(
    ctx: &InstanceContext,
    tli: TimeLineID,
    start: Lsn,
    stop: Lsn,
    timeout: Duration,
) -> anyhow::Result<u64> {
    let store = ctx.wal_store();
    let seg = store.wal_seg_size();
    let deadline = Instant::now() + timeout;
    let mut total = 0;
    for segno in start.segment_number(seg)..=stop.segment_number(seg) {
        let name = store.segment_name(tli, segno);
        let remaining = deadline.saturating_duration_since(Instant::now());
        let found = poll_until(remaining, || store.find(&name)).await?;
        match found {
            Some(_) => total += seg as u64,
            None => {
                return Err(ArchivistError::WalTimeout {
                    name,
                    timeout: timeout.into(),
                }
                .into());
            }
        }
    }
    info!("WAL from {start} to {stop} on timeline {tli} is archived");
    Ok(total)
}

/// How the blocks of a data file are selected relative to the parent.
enum Changes {
    All,
    Lsn(Lsn),
    Map(PageMap),
}

struct SourceFile {
    rel: String,
    ext: u32,
    abs: Utf8PathBuf,
    mode: u32,
}

struct CopyJob {
    backup_dir: Utf8PathBuf,
    compress_alg: CompressAlg,
    compress_level: u32,
    parent_entries: HashMap<(u32, String), FileEntry>,
    changes: Changes,
    no_sync: bool,
}

impl CopyJob {
    /// Copies one file. `None` if it disappeared while the backup ran.
    fn copy(&self, file: SourceFile) -> anyhow::Result<Option<FileEntry>> {
        let mut entry = FileEntry {
            path: file.rel.clone(),
            kind: FileKind::File,
            external_dir_num: file.ext,
            mode: file.mode,
            size: 0,
            write_size: Some(0),
            crc: 0,
            content_crc: 0,
            compress_alg: CompressAlg::None,
            is_datafile: false,
            n_blocks: None,
            db_oid: if file.ext == 0 { db_oid_of(&file.rel) } else { 0 },
            link_target: None,
        };
        let dst = entry.stored_path(&self.backup_dir);
        let parent = self.parent_entries.get(&(file.ext, file.rel.clone()));

        if file.ext == 0 && is_relation_datafile(&file.rel) {
            let empty = BTreeSet::new();
            let selector = match parent.filter(|p| p.is_datafile) {
                None => PageSelector::All,
                Some(p) => {
                    let parent_n_blocks = p.n_blocks.unwrap_or(0);
                    match &self.changes {
                        Changes::All => PageSelector::All,
                        Changes::Lsn(since) => PageSelector::Lsn {
                            since: *since,
                            parent_n_blocks,
                        },
                        Changes::Map(map) => PageSelector::Map {
                            blocks: map.get(&file.rel).unwrap_or(&empty),
                            parent_n_blocks,
                        },
                    }
                }
            };
            let copied = match backup_data_file(
                &file.abs,
                &dst,
                self.compress_alg,
                self.compress_level,
                selector,
                self.no_sync,
            ) {
                Ok(copied) => copied,
                Err(e) if is_not_found(&e) => {
                    warn!("file {} disappeared during backup, skipping it", file.abs);
                    return Ok(None);
                }
                Err(e) => return Err(e),
            };
            if copied.invalid_pages > 0 {
                warn!(
                    "{} has {} pages with invalid headers",
                    file.rel, copied.invalid_pages
                );
            }
            entry.is_datafile = true;
            entry.size = copied.n_blocks as u64 * pg_xlog::BLCKSZ as u64;
            entry.n_blocks = Some(copied.n_blocks);
            entry.write_size = Some(copied.write_size);
            entry.crc = copied.crc;
            entry.compress_alg = self.compress_alg;
            return Ok(Some(entry));
        }

        let data = match std::fs::read(&file.abs) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("file {} disappeared during backup, skipping it", file.abs);
                return Ok(None);
            }
            Err(e) => return Err(e).with_context(|| format!("failed to read {}", file.abs)),
        };
        entry.size = data.len() as u64;
        entry.content_crc = crc32c::crc32c(&data);
        if let Some(p) = parent {
            if !p.is_dir() && !p.is_datafile && p.content_crc == entry.content_crc && p.size == entry.size {
                entry.write_size = None;
                return Ok(Some(entry));
            }
        }
        let (stored, alg) = match compression::compress(self.compress_alg, self.compress_level, &data)? {
            Some(compressed) => (compressed, self.compress_alg),
            None => (data, CompressAlg::None),
        };
        write_file(&dst, &stored, self.no_sync)?;
        entry.write_size = Some(stored.len() as u64);
        entry.crc = crc32c::crc32c(&stored);
        entry.compress_alg = alg;
        Ok(Some(entry))
    }
}

fn is_not_found(e: &anyhow::Error) -> bool {
    e.chain().any(|c| {
        c.downcast_ref::<io::Error>()
            .is_some_and(|io| io.kind() == io::ErrorKind::NotFound)
    })
}

fn write_file(path: &Utf8Path, data: &[u8], no_sync: bool) -> anyhow::Result<()> {
    let mut file = std::fs::File::create(path).with_context(|| format!("failed to create {path}"))?;
    file.write_all(data)
        .with_context(|| format!("failed to write {path}"))?;
    if !no_sync {
        file.sync_all()
            .with_context(|| format!("failed to fsync {path}"))?;
    }
    Ok(())
}

/// Stores a file that is not copied from the data directory (backup label,
/// streamed WAL) uncompressed.
fn store_generated(
    backup_dir: &Utf8Path,
    rel: &str,
    data: &[u8],
    no_sync: bool,
) -> anyhow::Result<FileEntry> {
    let mut entry = FileEntry::dir(rel, 0, 0o600);
    entry.kind = FileKind::File;
    entry.size = data.len() as u64;
    entry.write_size = Some(data.len() as u64);
    entry.crc = crc32c::crc32c(data);
    entry.content_crc = entry.crc;
    let path = entry.stored_path(backup_dir);
    if let Some(parent) = path.parent() {
        utils::crashsafe::create_dir_all(parent)?;
    }
    write_file(&path, data, no_sync)?;
    Ok(entry)
}

/// Whether a path of the data directory is left out of backups.
pub fn is_excluded(rel: &str) -> bool {
    let name = rel.rsplit('/').next().unwrap_or(rel);
    if name.starts_with(TEMP_FILE_PREFIX) || EXCLUDED_FILES.contains(&name) {
        return true;
    }
    match rel.split_once('/') {
        Some((top, _)) => EXCLUDED_DIR_CONTENTS.contains(&top),
        None => false,
    }
}

/// Database a path of the data directory belongs to, 0 for shared files.
fn db_oid_of(rel: &str) -> u32 {
    let parts: Vec<&str> = rel.split('/').collect();
    match parts.as_slice() {
        ["base", db, ..] | ["pg_tblspc", _, _, db, ..] => db.parse().unwrap_or(0),
        _ => 0,
    }
}

/// Walks a source directory. Returns directory entries and the files to copy.
fn scan_source(root: &Utf8Path, ext: u32) -> anyhow::Result<(Vec<FileEntry>, Vec<SourceFile>)> {
    let mut dirs = Vec::new();
    let mut files = Vec::new();
    let walker = walkdir::WalkDir::new(root)
        .follow_links(true)
        .sort_by_file_name()
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| {
            ext != 0
                || Utf8Path::from_path(e.path())
                    .and_then(|p| p.strip_prefix(root).ok())
                    .is_none_or(|rel| !is_excluded(rel.as_str()))
        });
    for entry in walker {
        let entry = entry.with_context(|| format!("failed to scan {root}"))?;
        let abs = Utf8Path::from_path(entry.path())
            .with_context(|| format!("{} is not valid UTF-8", entry.path().display()))?
            .to_path_buf();
        let rel = abs.strip_prefix(root)?.as_str().to_string();
        let meta = entry
            .metadata()
            .with_context(|| format!("failed to stat {abs}"))?;
        let mode = meta.permissions().mode() & 0o7777;
        if meta.is_dir() {
            let mut dir = FileEntry::dir(rel.as_str(), ext, mode);
            if ext == 0 && entry.path_is_symlink() && rel.starts_with("pg_tblspc/") {
                let target = std::fs::read_link(&abs)
                    .with_context(|| format!("failed to read link {abs}"))?;
                dir.link_target = Some(
                    Utf8PathBuf::from_path_buf(target)
                        .map_err(|p| anyhow::anyhow!("{} is not valid UTF-8", p.display()))?,
                );
            }
            dir.db_oid = if ext == 0 { db_oid_of(&rel) } else { 0 };
            dirs.push(dir);
        } else if meta.is_file() {
            files.push(SourceFile { rel, ext, abs, mode });
        }
    }
    Ok((dirs, files))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use pg_xlog::BLCKSZ;

    use super::*;
    use crate::catalog::BackupId;
    use crate::error::{ErrorKind, error_kind};
    use crate::test_utils::Env;

    fn backup(id: u64, mode: BackupMode, parent: Option<u64>, tli: TimeLineID, stop: u64) -> BackupInfo {
        let mut b = BackupInfo::new(BackupId(id), mode, Utc.timestamp_opt(id as i64, 0).unwrap());
        b.status = BackupStatus::Ok;
        b.parent_backup_id = parent.map(BackupId);
        b.tli = tli;
        b.start_lsn = Lsn(stop - 0x100);
        b.stop_lsn = Lsn(stop);
        b
    }

    #[test]
    fn exclusions() {
        assert!(is_excluded("postmaster.pid"));
        assert!(is_excluded("pg_wal/000000010000000000000001"));
        assert!(is_excluded("pg_replslot/slot1/state"));
        assert!(is_excluded("base/16384/pg_internal.init"));
        assert!(is_excluded("base/pgsql_tmp"));
        assert!(!is_excluded("pg_wal"));
        assert!(!is_excluded("base/16384/16385"));
        assert!(!is_excluded("global/pg_control"));
        assert_eq!(db_oid_of("base/16384/16385_fsm"), 16384);
        assert_eq!(db_oid_of("pg_tblspc/16400/PG_16_202307071/16384/16401"), 16384);
        assert_eq!(db_oid_of("global/1262"), 0);
    }

    #[test]
    fn parent_follows_timeline_history() -> anyhow::Result<()> {
        let history = TimelineHistory::root().child(2, Lsn(0x3000000), "promoted");
        let mut backups = vec![
            backup(10, BackupMode::Full, None, 1, 0x2000000),
            backup(20, BackupMode::Delta, Some(10), 1, 0x2800000),
            // on tli 1 after the fork, not part of tli 2
            backup(30, BackupMode::Delta, Some(20), 1, 0x3800000),
        ];
        let chain = select_parent(&backups, &history)?;
        assert_eq!(
            chain.iter().map(|b| b.id.0).collect::<Vec<_>>(),
            vec![20, 10]
        );

        backups[0].status = BackupStatus::Merging;
        let err = select_parent(&backups, &history).unwrap_err();
        assert!(err.to_string().contains("cannot be used as parent"), "{err}");
        assert_eq!(error_kind(&err), ErrorKind::Policy);

        backups[0].status = BackupStatus::Corrupt;
        let err = select_parent(&backups, &history).unwrap_err();
        assert!(err.to_string().contains("status CORRUPT"), "{err}");

        let err = select_parent(&backups[2..], &history).unwrap_err();
        assert_eq!(error_kind(&err), ErrorKind::Policy);
        Ok(())
    }

    #[tokio::test]
    async fn full_then_delta() -> anyhow::Result<()> {
        let env = Env::new()?;
        let mut opts = BackupOptions::new(BackupMode::Full, &env.ctx.config);
        opts.compress_alg = CompressAlg::Zstd;
        opts.compress_level = 3;
        opts.archive_timeout = Duration::from_secs(5);
        let full = take_backup(&env.ctx, &env.cluster, &opts).await?;
        assert_eq!(full.status, BackupStatus::Ok);
        assert!(full.stop_lsn > full.start_lsn);

        let catalog = env.ctx.catalog();
        let content = catalog.read_content(full.id)?;
        let rel = content.iter().find(|e| e.path == "base/1/1259").unwrap();
        assert!(rel.is_datafile);
        assert_eq!(rel.n_blocks, Some(2));
        assert_eq!(rel.compress_alg, CompressAlg::Zstd);
        assert!(content.iter().any(|e| e.path == "pg_wal" && e.is_dir()));
        assert!(!content.iter().any(|e| e.path.starts_with("pg_wal/")));
        assert!(!content.iter().any(|e| e.path == "postmaster.pid"));
        assert!(content.iter().any(|e| e.path == "backup_label"));

        env.cluster.write_pages("base/1/1259", &[(1, 7), (2, 7)])?;
        env.cluster.write_file("postgresql.conf", b"shared_buffers = 256MB\n")?;
        opts.mode = BackupMode::Delta;
        let delta = take_backup(&env.ctx, &env.cluster, &opts).await?;
        assert_eq!(delta.parent_backup_id, Some(full.id));

        let content = catalog.read_content(delta.id)?;
        let rel = content.iter().find(|e| e.path == "base/1/1259").unwrap();
        assert_eq!(rel.n_blocks, Some(3));
        let stored: Vec<u32> = crate::datafile::open_page_stream(&rel.stored_path(&catalog.backup_dir(delta.id)))?
            .map(|p| p.map(|p| p.blkno))
            .collect::<anyhow::Result<_>>()?;
        assert_eq!(stored, vec![1, 2]);
        let version = content.iter().find(|e| e.path == "PG_VERSION").unwrap();
        assert!(version.is_unchanged());
        let conf = content.iter().find(|e| e.path == "postgresql.conf").unwrap();
        assert!(conf.write_size.is_some());
        assert_eq!(rel.size, 3 * BLCKSZ as u64);
        Ok(())
    }

    #[tokio::test]
    async fn archive_timeout_fails_backup() -> anyhow::Result<()> {
        let env = Env::new()?;
        // nothing archives WAL for this server
        let cluster = crate::test_utils::ScriptedServer::init(
            &env.path().join("other"),
            crate::test_utils::TEST_WAL_SEG_SIZE,
        )?;
        let mut opts = BackupOptions::new(BackupMode::Full, &env.ctx.config);
        opts.archive_timeout = Duration::ZERO;
        let err = take_backup(&env.ctx, &cluster, &opts).await.unwrap_err();
        assert!(err.to_string().contains("could not be archived"), "{err}");

        let backups = env.ctx.catalog().list()?;
        assert_eq!(backups.len(), 1);
        assert_eq!(backups[0].status, BackupStatus::Error);
        Ok(())
    }

    #[tokio::test]
    async fn stream_backup_carries_its_wal() -> anyhow::Result<()> {
        let env = Env::new()?;
        let mut opts = BackupOptions::new(BackupMode::Full, &env.ctx.config);
        opts.stream = true;
        let full = take_backup(&env.ctx, &env.cluster, &opts).await?;
        assert_eq!(full.wal, WalMode::Stream);
        let content = env.ctx.catalog().read_content(full.id)?;
        let wal: Vec<&FileEntry> = content
            .iter()
            .filter(|e| e.path.starts_with("pg_wal/"))
            .collect();
        assert!(!wal.is_empty());
        assert_eq!(wal[0].size, crate::test_utils::TEST_WAL_SEG_SIZE as u64);
        Ok(())
    }

    #[tokio::test]
    async fn page_backup_needs_archived_wal() -> anyhow::Result<()> {
        let env = Env::new()?;
        let opts = BackupOptions::new(BackupMode::Full, &env.ctx.config);
        let full = take_backup(&env.ctx, &env.cluster, &opts).await?;

        env.cluster.write_pages("global/1262", &[(0, 9)])?;
        env.cluster.switch_wal()?;
        env.cluster.write_pages("base/1/1259", &[(0, 9)])?;
        let mut page_opts = BackupOptions::new(BackupMode::Page, &env.ctx.config);
        page_opts.archive_timeout = Duration::from_secs(5);
        // the switched segment is ready, but not archived yet
        let err = take_backup(&env.ctx, &env.cluster, &page_opts).await.unwrap_err();
        assert!(format!("{err:#}").contains("is absent"), "{err:#}");

        env.archive_wal().await?;
        let page = take_backup(&env.ctx, &env.cluster, &page_opts).await?;
        assert_eq!(page.parent_backup_id, Some(full.id));
        let content = env.ctx.catalog().read_content(page.id)?;
        let global = content.iter().find(|e| e.path == "global/1262").unwrap();
        assert_eq!(global.write_size.map(|s| s > 0), Some(true));
        Ok(())
    }
}
