//! Restoring a backup into a data directory.
//!
//! Every file of the chosen backup is rebuilt from its chain. An
//! incremental restore updates an existing data directory in place: blocks
//! and files that are already current are left alone and files the backup
//! does not have are removed. While it runs, `global/pg_control` is parked
//! as `global/pg_control.pbk.bak` so that a half-restored directory can
//! never be started; the real one is written last.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::io::Write as _;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use pg_xlog::controlfile::ControlFileData;
use pg_xlog::{FIRST_NORMAL_OBJECT_ID, PG_CONTROL_FILE_PATH, TimeLineID};
use tracing::{info, instrument, warn};
use utils::crashsafe::durable_rename_sync;
use utils::fs_ext::PathExt;
use utils::lock_file::{LockMode, process_is_alive};
use utils::lsn::Lsn;

use crate::InstanceContext;
use crate::backup::is_excluded;
use crate::catalog::{self, BackupId, BackupInfo, BackupStatus, ChainScan, WalMode};
use crate::content::FileEntry;
use crate::error::{self, ArchivistError};
use crate::reconstruct::{ChainView, FilePlan, IncrementalMode, materialize_pages, materialize_whole};
use crate::server::POSTMASTER_PID_FILE;
use crate::timeline_index::parse_lineage;
use crate::validate;

pub const PG_CONTROL_BACKUP_SUFFIX: &str = ".pbk.bak";
pub const RECOVERY_SIGNAL_FILE: &str = "recovery.signal";
pub const AUTO_CONF_FILE: &str = "postgresql.auto.conf";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryTarget {
    pub lsn: Option<Lsn>,
    pub time: Option<DateTime<Utc>>,
    pub xid: Option<u64>,
    pub tli: Option<TimeLineID>,
    /// Stop as soon as the backup is consistent.
    pub immediate: bool,
    pub inclusive: Option<bool>,
    pub action: Option<String>,
}

impl RecoveryTarget {
    pub fn is_set(&self) -> bool {
        self.lsn.is_some() || self.time.is_some() || self.xid.is_some() || self.immediate
    }

    /// Can recovery from `backup` reach this target?
    fn reachable_from(&self, backup: &BackupInfo, lineage: &[(TimeLineID, Lsn)]) -> bool {
        if let Some(tli) = self.tli {
            let on_lineage = backup.tli == tli
                || lineage
                    .iter()
                    .any(|&(ancestor, switchpoint)| ancestor == backup.tli && backup.stop_lsn <= switchpoint);
            if !on_lineage {
                return false;
            }
        }
        self.lsn.is_none_or(|lsn| backup.stop_lsn <= lsn)
            && self.time.is_none_or(|t| backup.recovery_time_or_start() <= t)
            && self
                .xid
                .is_none_or(|xid| backup.recovery_xid.is_none_or(|b| b <= xid))
    }
}

#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Newest backup that can reach the recovery target when unset.
    pub backup_id: Option<BackupId>,
    pub pgdata: Utf8PathBuf,
    pub incremental_mode: Option<IncrementalMode>,
    pub recovery_target: RecoveryTarget,
    pub db_include: Vec<String>,
    pub db_exclude: Vec<String>,
    /// Tablespace locations, old to new.
    pub tablespace_mapping: Vec<(Utf8PathBuf, Utf8PathBuf)>,
    pub skip_external_dirs: bool,
    pub threads: usize,
    pub no_validate: bool,
    pub restore_command: Option<String>,
    pub no_sync: bool,
}

impl RestoreOptions {
    pub fn new(pgdata: impl Into<Utf8PathBuf>) -> RestoreOptions {
        RestoreOptions {
            backup_id: None,
            pgdata: pgdata.into(),
            incremental_mode: None,
            recovery_target: RecoveryTarget::default(),
            db_include: Vec::new(),
            db_exclude: Vec::new(),
            tablespace_mapping: Vec::new(),
            skip_external_dirs: false,
            threads: crate::defaults::DEFAULT_THREADS,
            no_validate: false,
            restore_command: None,
            no_sync: false,
        }
    }

    fn is_partial(&self) -> bool {
        !self.db_include.is_empty() || !self.db_exclude.is_empty()
    }

    fn map_tablespace(&self, target: &Utf8Path) -> Utf8PathBuf {
        self.tablespace_mapping
            .iter()
            .find(|(old, _)| old == target)
            .map(|(_, new)| new.clone())
            .unwrap_or_else(|| target.to_path_buf())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    pub backup_id: Option<BackupId>,
    pub files_written: usize,
    pub files_skipped: usize,
    pub files_removed: usize,
    pub blocks_skipped: u64,
}

#[instrument(skip_all, fields(instance = %ctx.instance, pgdata = %opts.pgdata))]
pub async fn restore(ctx: &InstanceContext, opts: &RestoreOptions) -> anyhow::Result<RestoreSummary> {
    check_request(opts)?;

    let catalog = ctx.catalog();
    let backups = catalog.list()?;
    let target = match opts.backup_id {
        Some(id) => catalog::find_backup(&backups, id).ok_or(ArchivistError::BackupNotFound(id))?,
        None => select_backup(ctx, &backups, &opts.recovery_target).await?,
    };
    let chain = match catalog::scan_parent_chain(&backups, target.id)? {
        ChainScan::Intact(chain) => chain,
        ChainScan::Broken { missing, child } => {
            return Err(ArchivistError::ChainBroken { missing, child }.into());
        }
        ChainScan::Invalid { invalid, .. } => {
            return Err(ArchivistError::InvalidStatus {
                id: invalid.id,
                status: invalid.status,
            }
            .into());
        }
    };
    check_tablespaces(opts, &catalog.read_content(target.id)?)?;
    if opts.incremental_mode.is_some() {
        check_incremental_destination(&opts.pgdata, target)?;
    }
    let _locks = catalog.lock_chain(&chain, LockMode::Shared)?;
    if !opts.no_validate {
        validate::validate_backup(ctx, target.id, opts.threads).await?;
    }

    let excluded_dbs = excluded_databases(opts, &catalog.read_database_map(target.id)?)?;
    let view = ChainView::load(&catalog, &chain)?;
    info!(
        "Restoring backup {} ({} backups in chain) into {}",
        target.id,
        chain.len(),
        opts.pgdata
    );

    let mut roots: Vec<Option<Utf8PathBuf>> = vec![Some(opts.pgdata.clone())];
    for dir in &target.external_dirs {
        roots.push((!opts.skip_external_dirs).then(|| dir.clone()));
    }
    let mut summary = RestoreSummary {
        backup_id: Some(target.id),
        ..Default::default()
    };

    utils::crashsafe::create_dir_all(&opts.pgdata)?;
    let control_path = opts.pgdata.join(PG_CONTROL_FILE_PATH);
    let parked_control = control_parking_path(&opts.pgdata);
    if opts.incremental_mode.is_some() {
        if control_path.exists() {
            durable_rename_sync(&control_path, &parked_control, !opts.no_sync)?;
        }
        summary.files_removed = remove_extra_files(&view, &roots)?;
    }
    create_directories(&view, &roots, opts)?;

    let control_idx = view
        .newest_entries()
        .iter()
        .position(|e| e.external_dir_num == 0 && e.path == PG_CONTROL_FILE_PATH);
    let files: Vec<usize> = view
        .newest_entries()
        .iter()
        .enumerate()
        .filter(|(i, e)| !e.is_dir() && Some(*i) != control_idx)
        .map(|(i, _)| i)
        .collect();
    let job = Arc::new(RestoreJob {
        view,
        roots,
        incremental: opts.incremental_mode,
        excluded_dbs,
        no_sync: opts.no_sync,
    });
    let results: Vec<anyhow::Result<FileOutcome>> = futures::stream::iter(files)
        .map(|idx| {
            let job = Arc::clone(&job);
            async move {
                tokio::task::spawn_blocking(move || job.restore_file(idx))
                    .await
                    .context("restore task panicked")?
            }
        })
        .buffer_unordered(opts.threads.max(1))
        .collect()
        .await;
    for result in results {
        summary.add(result?);
    }

    // pg_control goes last, it makes the directory startable
    match control_idx {
        Some(idx) => {
            let job = Arc::clone(&job);
            let outcome = tokio::task::spawn_blocking(move || job.restore_file(idx))
                .await
                .context("restore task panicked")??;
            summary.add(outcome);
        }
        None => warn!("backup {} has no {PG_CONTROL_FILE_PATH}", target.id),
    }
    if parked_control.exists() {
        std::fs::remove_file(&parked_control)
            .with_context(|| format!("failed to remove {parked_control}"))?;
    }

    if target.wal == WalMode::Archive || opts.recovery_target.is_set() {
        write_recovery_conf(ctx, opts, target)?;
    }
    info!(
        "Restore of backup {} completed: {} files written, {} unchanged, {} removed",
        target.id, summary.files_written, summary.files_skipped, summary.files_removed
    );
    Ok(summary)
}

impl RestoreSummary {
    fn add(&mut self, outcome: FileOutcome) {
        match outcome {
            FileOutcome::Written { blocks_skipped } => {
                self.files_written += 1;
                self.blocks_skipped += blocks_skipped as u64;
            }
            FileOutcome::Unchanged => self.files_skipped += 1,
            FileOutcome::Skipped => {}
        }
    }
}

fn control_parking_path(pgdata: &Utf8Path) -> Utf8PathBuf {
    pgdata.join(format!("{PG_CONTROL_FILE_PATH}{PG_CONTROL_BACKUP_SUFFIX}"))
}

/// Refusals that only depend on the request and the destination.
fn check_request(opts: &RestoreOptions) -> anyhow::Result<()> {
    if !opts.db_include.is_empty() && !opts.db_exclude.is_empty() {
        return Err(error::policy(
            "You cannot specify --db-include and --db-exclude together",
        ));
    }
    let pgdata = &opts.pgdata;
    if pgdata.exists() && !pgdata.is_empty_dir()? {
        match opts.incremental_mode {
            None => {
                return Err(error::policy(format!(
                    "Restore destination is not empty: \"{pgdata}\""
                )));
            }
            Some(_) if opts.is_partial() => {
                return Err(error::policy(
                    "Partial incremental restore into non-empty PGDATA is forbidden",
                ));
            }
            Some(_) => {}
        }
    }
    if let Ok(pid) = std::fs::read_to_string(pgdata.join(POSTMASTER_PID_FILE)) {
        let pid = pid.lines().next().and_then(|l| l.trim().parse().ok()).unwrap_or(0);
        if process_is_alive(pid) {
            return Err(error::policy(format!(
                "Postmaster with pid {pid} is running in destination directory \"{pgdata}\""
            )));
        }
    }
    for (old, new) in &opts.tablespace_mapping {
        if !old.is_absolute() || !new.is_absolute() {
            return Err(error::policy(format!(
                "tablespace mapping {old}={new}: both directories must be absolute paths"
            )));
        }
    }
    Ok(())
}

/// Tablespace locations the backup links to must be empty, unless the
/// restore is incremental.
fn check_tablespaces(opts: &RestoreOptions, entries: &[FileEntry]) -> anyhow::Result<()> {
    if opts.incremental_mode.is_some() {
        return Ok(());
    }
    for target in entries.iter().filter_map(|e| e.link_target.as_deref()) {
        let dest = opts.map_tablespace(target);
        if dest.exists() && !dest.is_empty_dir()? {
            return Err(error::policy(format!(
                "restore tablespace destination is not empty: \"{dest}\""
            )));
        }
    }
    Ok(())
}

fn check_incremental_destination(pgdata: &Utf8Path, backup: &BackupInfo) -> anyhow::Result<()> {
    let control = pgdata.join(PG_CONTROL_FILE_PATH);
    let parked = control_parking_path(pgdata);
    let path = if control.exists() { control } else { parked };
    let Ok(data) = std::fs::read(&path) else {
        return Ok(());
    };
    let control = ControlFileData::decode(&data).with_context(|| format!("failed to decode {path}"))?;
    if control.system_identifier != backup.system_identifier {
        return Err(error::policy(format!(
            "Incremental restore is not allowed: system identifier {} of \"{pgdata}\" \
             does not match backup {} ({})",
            control.system_identifier, backup.id, backup.system_identifier
        )));
    }
    Ok(())
}

/// Newest valid backup from which recovery can reach `target`.
async fn select_backup<'a>(
    ctx: &InstanceContext,
    backups: &'a [BackupInfo],
    target: &RecoveryTarget,
) -> anyhow::Result<&'a BackupInfo> {
    let lineage = match target.tli {
        Some(tli) => parse_lineage(tli, ctx.wal_store().read_history(tli).await?.as_deref()),
        None => Vec::new(),
    };
    backups
        .iter()
        .rev()
        .filter(|b| b.status == BackupStatus::Ok)
        .find(|b| target.reachable_from(b, &lineage))
        .ok_or_else(|| error::policy("Backup satisfying target options is not found"))
}

/// Databases whose data files are restored empty.
fn excluded_databases(
    opts: &RestoreOptions,
    map: &[crate::content::DatabaseEntry],
) -> anyhow::Result<HashSet<u32>> {
    let by_name: HashMap<&str, u32> = map.iter().map(|d| (d.name.as_str(), d.oid)).collect();
    let lookup = |name: &String| -> anyhow::Result<u32> {
        by_name
            .get(name.as_str())
            .copied()
            .ok_or_else(|| error::policy(format!("There is no database with name \"{name}\" in the backup")))
    };
    if !opts.db_include.is_empty() {
        let included = opts.db_include.iter().map(lookup).collect::<anyhow::Result<HashSet<u32>>>()?;
        return Ok(map
            .iter()
            .map(|d| d.oid)
            .filter(|oid| *oid >= FIRST_NORMAL_OBJECT_ID && !included.contains(oid))
            .collect());
    }
    let mut excluded = HashSet::new();
    for name in &opts.db_exclude {
        let oid = lookup(name)?;
        if oid < FIRST_NORMAL_OBJECT_ID {
            return Err(error::policy(format!(
                "Database \"{name}\" is a system database and cannot be excluded"
            )));
        }
        excluded.insert(oid);
    }
    Ok(excluded)
}

fn root_of<'r>(roots: &'r [Option<Utf8PathBuf>], ext: u32) -> Option<&'r Utf8Path> {
    roots.get(ext as usize).and_then(|r| r.as_deref())
}

/// Removes files of the destination that the backup does not have.
fn remove_extra_files(view: &ChainView, roots: &[Option<Utf8PathBuf>]) -> anyhow::Result<usize> {
    let wanted: HashSet<(u32, &str)> = view.newest_entries().iter().map(|e| e.key()).collect();
    let mut removed = 0;
    for (ext, root) in roots.iter().enumerate() {
        let Some(root) = root else { continue };
        if !root.exists() {
            continue;
        }
        let ext = ext as u32;
        let mut extra_dirs = Vec::new();
        for entry in walkdir::WalkDir::new(root).follow_links(true).min_depth(1) {
            let entry = entry.with_context(|| format!("failed to scan {root}"))?;
            let Some(abs) = Utf8Path::from_path(entry.path()) else {
                continue;
            };
            let rel = abs.strip_prefix(root)?.as_str();
            if ext == 0
                && (is_excluded(rel)
                    || rel.ends_with(PG_CONTROL_BACKUP_SUFFIX)
                    || rel == PG_CONTROL_FILE_PATH)
            {
                continue;
            }
            if wanted.contains(&(ext, rel)) {
                continue;
            }
            if entry.file_type().is_dir() {
                extra_dirs.push(abs.to_path_buf());
            } else {
                std::fs::remove_file(abs).with_context(|| format!("failed to remove {abs}"))?;
                info!("removed {abs}, it is not in the backup");
                removed += 1;
            }
        }
        for dir in extra_dirs.iter().rev() {
            if let Err(e) = std::fs::remove_dir(dir) {
                warn!("failed to remove directory {dir}: {e}");
            }
        }
    }
    Ok(removed)
}

fn create_directories(
    view: &ChainView,
    roots: &[Option<Utf8PathBuf>],
    opts: &RestoreOptions,
) -> anyhow::Result<()> {
    for entry in view.newest_entries().iter().filter(|e| e.is_dir()) {
        let Some(root) = root_of(roots, entry.external_dir_num) else {
            continue;
        };
        let path = root.join(&entry.path);
        match &entry.link_target {
            Some(target) => {
                let dest = opts.map_tablespace(target);
                utils::crashsafe::create_dir_all(&dest)?;
                match std::fs::read_link(&path) {
                    Ok(existing) if existing == dest.as_std_path() => continue,
                    Ok(_) => std::fs::remove_file(&path)
                        .with_context(|| format!("failed to remove link {path}"))?,
                    Err(_) => {}
                }
                if let Some(parent) = path.parent() {
                    utils::crashsafe::create_dir_all(parent)?;
                }
                std::os::unix::fs::symlink(&dest, &path)
                    .with_context(|| format!("failed to create link {path} -> {dest}"))?;
            }
            None => {
                utils::crashsafe::create_dir_all(&path)?;
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(entry.mode))
                    .with_context(|| format!("failed to set permissions of {path}"))?;
            }
        }
    }
    Ok(())
}

enum FileOutcome {
    Written { blocks_skipped: u32 },
    /// Already current in the destination.
    Unchanged,
    /// Not restored (skipped external directory).
    Skipped,
}

struct RestoreJob {
    view: ChainView,
    roots: Vec<Option<Utf8PathBuf>>,
    incremental: Option<IncrementalMode>,
    excluded_dbs: HashSet<u32>,
    no_sync: bool,
}

impl RestoreJob {
    fn restore_file(&self, idx: usize) -> anyhow::Result<FileOutcome> {
        let newest = &self.view.newest_entries()[idx];
        let Some(root) = root_of(&self.roots, newest.external_dir_num) else {
            return Ok(FileOutcome::Skipped);
        };
        let dst = root.join(&newest.path);
        let plan = self.view.plan_file(newest)?;
        let outcome = match &plan {
            FilePlan::Dir(_) => return Ok(FileOutcome::Skipped),
            FilePlan::Pages { .. }
                if newest.external_dir_num == 0 && self.excluded_dbs.contains(&newest.db_oid) =>
            {
                std::fs::File::create(&dst).with_context(|| format!("failed to create {dst}"))?;
                FileOutcome::Written { blocks_skipped: 0 }
            }
            FilePlan::Pages { .. } => {
                let stats = materialize_pages(&self.view, &plan, &dst, self.incremental, self.no_sync)
                    .with_context(|| format!("failed to restore {}", newest.path))?;
                if self.incremental.is_some() && stats.blocks_written == 0 {
                    FileOutcome::Unchanged
                } else {
                    FileOutcome::Written {
                        blocks_skipped: stats.blocks_skipped,
                    }
                }
            }
            FilePlan::Whole { source, .. } => {
                if self.incremental.is_some() && has_content(&dst, newest)? {
                    FileOutcome::Unchanged
                } else {
                    materialize_whole(&self.view, source, &dst, self.no_sync)
                        .with_context(|| format!("failed to restore {}", newest.path))?;
                    FileOutcome::Written { blocks_skipped: 0 }
                }
            }
        };
        std::fs::set_permissions(&dst, std::fs::Permissions::from_mode(newest.mode))
            .with_context(|| format!("failed to set permissions of {dst}"))?;
        Ok(outcome)
    }
}

/// Whether `path` already holds the source content of `entry`.
fn has_content(path: &Utf8Path, entry: &FileEntry) -> anyhow::Result<bool> {
    match std::fs::metadata(path) {
        Ok(m) if m.len() == entry.size => {}
        _ => return Ok(false),
    }
    let data = std::fs::read(path).with_context(|| format!("failed to read {path}"))?;
    Ok(crc32c::crc32c(&data) == entry.content_crc)
}

fn default_restore_command(ctx: &InstanceContext) -> String {
    let exe = std::env::current_exe()
        .ok()
        .and_then(|p| Utf8PathBuf::from_path_buf(p).ok())
        .map(|p| p.to_string())
        .unwrap_or_else(|| crate::defaults::PROGRAM_NAME.to_string());
    format!(
        "\"{exe}\" archive-get -B \"{}\" --instance \"{}\" --wal-file-path=\"%p\" --wal-file-name=\"%f\"",
        ctx.conf.backup_path, ctx.instance
    )
}

/// Makes the server start in recovery: `recovery.signal` plus recovery
/// settings appended to `postgresql.auto.conf`.
fn write_recovery_conf(ctx: &InstanceContext, opts: &RestoreOptions, backup: &BackupInfo) -> anyhow::Result<()> {
    let target = &opts.recovery_target;
    let mut conf = String::new();
    writeln!(
        conf,
        "\n# recovery settings added by {} restore of backup {} at {}",
        crate::defaults::PROGRAM_NAME,
        backup.id,
        Utc::now().format("%Y-%m-%d %H:%M:%S%z")
    )?;
    if backup.wal == WalMode::Archive || target.is_set() {
        let command = opts
            .restore_command
            .clone()
            .or_else(|| ctx.config.restore_command.clone())
            .unwrap_or_else(|| default_restore_command(ctx));
        writeln!(conf, "restore_command = '{}'", command.replace('\'', "''"))?;
    }
    if target.immediate {
        writeln!(conf, "recovery_target = 'immediate'")?;
    }
    if let Some(lsn) = target.lsn {
        writeln!(conf, "recovery_target_lsn = '{lsn}'")?;
    }
    if let Some(time) = target.time {
        writeln!(conf, "recovery_target_time = '{}'", time.format("%Y-%m-%d %H:%M:%S%z"))?;
    }
    if let Some(xid) = target.xid {
        writeln!(conf, "recovery_target_xid = '{xid}'")?;
    }
    if let Some(inclusive) = target.inclusive {
        writeln!(conf, "recovery_target_inclusive = '{inclusive}'")?;
    }
    if let Some(tli) = target.tli {
        writeln!(conf, "recovery_target_timeline = '{tli}'")?;
    }
    if let Some(action) = &target.action {
        writeln!(conf, "recovery_target_action = '{action}'")?;
    }

    let auto_conf = opts.pgdata.join(AUTO_CONF_FILE);
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(&auto_conf)
        .with_context(|| format!("failed to open {auto_conf}"))?;
    file.write_all(conf.as_bytes())
        .with_context(|| format!("failed to write {auto_conf}"))?;
    let signal = opts.pgdata.join(RECOVERY_SIGNAL_FILE);
    std::fs::write(&signal, b"").with_context(|| format!("failed to create {signal}"))?;
    if !opts.no_sync {
        file.sync_all()?;
        utils::crashsafe::fsync_file_and_parent(&signal)?;
    }
    Ok(())
}
