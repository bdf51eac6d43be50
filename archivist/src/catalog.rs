//! The backup catalog of one instance: `backups/<instance>/<backup-id>/`.
//!
//! Each backup directory holds `backup.control` (TOML, see [`BackupInfo`]),
//! the file list `backup_content.control`, the database map and the stored
//! files under `database/` and `external_directories/`.

use std::collections::HashSet;
use std::fmt;
use std::io;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use pg_xlog::TimeLineID;
use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, DisplayFromStr, SerializeDisplay, serde_as};
use tracing::{info, warn};
use utils::crashsafe::{overwrite_with_sync, path_with_suffix_extension};
use utils::lock_file::{LockGuard, LockMode, lock_dir};
use utils::lsn::Lsn;

use crate::compression::CompressAlg;
use crate::content::{self, DatabaseEntry, FileEntry};
use crate::error::ArchivistError;

pub const CONTROL_FILE_NAME: &str = "backup.control";
pub const CONTENT_FILE_NAME: &str = "backup_content.control";
pub const DATABASE_MAP_FILE_NAME: &str = "database_map";
pub const BACKUP_LOCK_FILE: &str = "backup.pid";
pub const INSTANCE_LOCK_FILE: &str = "instance.pid";
pub const MERGE_STAGING_PREFIX: &str = ".merge-";

/// Backup id: the start time in unix seconds, rendered in base 36.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, SerializeDisplay, DeserializeFromStr)]
pub struct BackupId(pub u64);

impl BackupId {
    pub fn from_time(t: DateTime<Utc>) -> BackupId {
        BackupId(t.timestamp().max(0) as u64)
    }

    pub fn next(self) -> BackupId {
        BackupId(self.0 + 1)
    }
}

impl fmt::Display for BackupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const DIGITS: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
        let mut n = self.0;
        let mut buf = Vec::new();
        loop {
            buf.push(DIGITS[(n % 36) as usize]);
            n /= 36;
            if n == 0 {
                break;
            }
        }
        buf.reverse();
        f.write_str(&String::from_utf8_lossy(&buf))
    }
}

impl fmt::Debug for BackupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid backup id '{0}'")]
pub struct BackupIdParseError(String);

impl FromStr for BackupId {
    type Err = BackupIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.len() > 12 {
            return Err(BackupIdParseError(s.to_string()));
        }
        u64::from_str_radix(s, 36)
            .map(BackupId)
            .map_err(|_| BackupIdParseError(s.to_string()))
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum BackupMode {
    Full,
    Page,
    Delta,
    Ptrack,
}

impl BackupMode {
    pub fn is_incremental(self) -> bool {
        self != BackupMode::Full
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum BackupStatus {
    Ok,
    Error,
    Running,
    Merging,
    Merged,
    Corrupt,
    Orphan,
    Deleting,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum WalMode {
    Archive,
    Stream,
}

/// Contents of `backup.control`.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BackupInfo {
    pub id: BackupId,
    pub backup_mode: BackupMode,
    pub status: BackupStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_backup_id: Option<BackupId>,
    pub tli: TimeLineID,
    pub start_lsn: Lsn,
    pub stop_lsn: Lsn,
    pub wal: WalMode,
    pub compress_alg: CompressAlg,
    pub compress_level: u32,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_time: Option<DateTime<Utc>>,
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_xid: Option<u64>,
    #[serde(default)]
    pub data_bytes: u64,
    #[serde(default)]
    pub wal_bytes: u64,
    pub wal_seg_size: usize,
    pub block_size: usize,
    #[serde_as(as = "DisplayFromStr")]
    pub system_identifier: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub external_dirs: Vec<Utf8PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_dest_id: Option<BackupId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_time: Option<DateTime<Utc>>,
    pub program_version: String,
}

impl BackupInfo {
    pub fn new(id: BackupId, backup_mode: BackupMode, start_time: DateTime<Utc>) -> BackupInfo {
        BackupInfo {
            id,
            backup_mode,
            status: BackupStatus::Running,
            parent_backup_id: None,
            tli: 1,
            start_lsn: Lsn::INVALID,
            stop_lsn: Lsn::INVALID,
            wal: WalMode::Archive,
            compress_alg: CompressAlg::None,
            compress_level: 0,
            start_time,
            end_time: None,
            recovery_time: None,
            recovery_xid: None,
            data_bytes: 0,
            wal_bytes: 0,
            wal_seg_size: pg_xlog::DEFAULT_WAL_SEG_SIZE,
            block_size: pg_xlog::BLCKSZ,
            system_identifier: 0,
            external_dirs: Vec::new(),
            note: None,
            expire_time: None,
            merge_dest_id: None,
            merge_time: None,
            program_version: crate::defaults::PROGRAM_VERSION.to_string(),
        }
    }

    pub fn is_full(&self) -> bool {
        self.backup_mode == BackupMode::Full
    }

    pub fn is_ok(&self) -> bool {
        self.status == BackupStatus::Ok
    }

    /// Time the backup can restore to at the earliest.
    pub fn recovery_time_or_start(&self) -> DateTime<Utc> {
        self.recovery_time.unwrap_or(self.start_time)
    }

    /// Pinned backups are kept by retention until their expire time.
    pub fn is_pinned(&self, now: DateTime<Utc>) -> bool {
        self.expire_time.is_some_and(|t| t > now)
    }
}

/// Outcome of following `parent-backup-id` links from a backup.
#[derive(Debug)]
pub enum ChainScan<'a> {
    /// Every member exists and is OK. Newest first, ends with the FULL backup.
    Intact(Vec<&'a BackupInfo>),
    /// A parent is missing from the catalog.
    Broken { missing: BackupId, child: BackupId },
    /// Every member exists, but `invalid` is not OK.
    Invalid {
        chain: Vec<&'a BackupInfo>,
        invalid: &'a BackupInfo,
    },
}

pub fn find_backup(backups: &[BackupInfo], id: BackupId) -> Option<&BackupInfo> {
    backups.iter().find(|b| b.id == id)
}

/// The chain from `id` down to its FULL backup, newest first, without any
/// status checks.
pub fn parent_chain(backups: &[BackupInfo], id: BackupId) -> anyhow::Result<Vec<&BackupInfo>> {
    let mut chain = Vec::new();
    let mut current = find_backup(backups, id).ok_or(ArchivistError::BackupNotFound(id))?;
    loop {
        chain.push(current);
        if current.is_full() {
            return Ok(chain);
        }
        anyhow::ensure!(
            chain.len() <= backups.len(),
            "parent links of backup {id} form a cycle"
        );
        let Some(parent_id) = current.parent_backup_id else {
            return Err(ArchivistError::Corrupt(format!(
                "incremental backup {} has no parent",
                current.id
            ))
            .into());
        };
        current = find_backup(backups, parent_id).ok_or(ArchivistError::ChainBroken {
            missing: parent_id,
            child: current.id,
        })?;
    }
}

pub fn scan_parent_chain(backups: &[BackupInfo], id: BackupId) -> anyhow::Result<ChainScan<'_>> {
    let chain = match parent_chain(backups, id) {
        Ok(chain) => chain,
        Err(e) => {
            if let Some(ArchivistError::ChainBroken { missing, child }) = e.downcast_ref() {
                return Ok(ChainScan::Broken {
                    missing: *missing,
                    child: *child,
                });
            }
            return Err(e);
        }
    };
    // report the oldest invalid member, that's where the damage starts
    if let Some(invalid) = chain.iter().rev().find(|b| !b.is_ok()) {
        let invalid = *invalid;
        return Ok(ChainScan::Invalid { chain, invalid });
    }
    Ok(ChainScan::Intact(chain))
}

/// All backups that depend on `id`, directly or transitively, oldest first.
pub fn descendants(backups: &[BackupInfo], id: BackupId) -> Vec<&BackupInfo> {
    let mut ancestors: HashSet<BackupId> = HashSet::from([id]);
    let mut result = Vec::new();
    // ids grow with start time and a child always starts after its parent
    let mut sorted: Vec<&BackupInfo> = backups.iter().collect();
    sorted.sort_by_key(|b| b.id);
    for b in sorted {
        if let Some(parent) = b.parent_backup_id {
            if !b.is_full() && ancestors.contains(&parent) && b.id != id {
                ancestors.insert(b.id);
                result.push(b);
            }
        }
    }
    result
}

/// Is `ancestor` on the parent chain of `id` (or equal to it)?
pub fn is_ancestor(backups: &[BackupInfo], ancestor: BackupId, id: BackupId) -> bool {
    let mut current = find_backup(backups, id);
    let mut hops = 0;
    while let Some(b) = current {
        if b.id == ancestor {
            return true;
        }
        if b.is_full() || hops > backups.len() {
            return false;
        }
        current = b.parent_backup_id.and_then(|p| find_backup(backups, p));
        hops += 1;
    }
    false
}

#[derive(Debug, Clone)]
pub struct Catalog {
    dir: Utf8PathBuf,
    no_sync: bool,
    lock_timeout: Duration,
}

impl Catalog {
    pub fn new(dir: impl Into<Utf8PathBuf>, no_sync: bool, lock_timeout: Duration) -> Catalog {
        Catalog {
            dir: dir.into(),
            no_sync,
            lock_timeout,
        }
    }

    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    pub fn no_sync(&self) -> bool {
        self.no_sync
    }

    pub fn backup_dir(&self, id: BackupId) -> Utf8PathBuf {
        self.dir.join(id.to_string())
    }

    pub fn merge_staging_dir(&self, id: BackupId) -> Utf8PathBuf {
        self.dir.join(format!("{MERGE_STAGING_PREFIX}{id}"))
    }

    /// Every backup of the instance, oldest first. Directories without a
    /// readable control file are skipped with a warning.
    pub fn list(&self) -> anyhow::Result<Vec<BackupInfo>> {
        let mut backups = Vec::new();
        for name in utils::fs_ext::list_dir_sync(&self.dir)? {
            let Ok(id) = name.parse::<BackupId>() else {
                continue;
            };
            let dir = self.dir.join(&name);
            if !dir.is_dir() {
                continue;
            }
            match read_control(&dir) {
                Ok(Some(info)) if info.id == id => backups.push(info),
                Ok(Some(info)) => {
                    warn!("backup directory {dir} contains control file of backup {}, skipping", info.id)
                }
                Ok(None) => warn!("backup directory {dir} has no control file, skipping"),
                Err(e) => warn!("skipping backup directory {dir}: {e:#}"),
            }
        }
        backups.sort_by_key(|b| b.id);
        Ok(backups)
    }

    pub fn load(&self, id: BackupId) -> anyhow::Result<BackupInfo> {
        read_control(&self.backup_dir(id))?.ok_or_else(|| ArchivistError::BackupNotFound(id).into())
    }

    /// Creates the directory of a new backup. The id comes from `start`; if
    /// it is taken, the next free second is used.
    pub fn create_backup_dir(&self, start: DateTime<Utc>) -> anyhow::Result<BackupId> {
        utils::crashsafe::create_dir_all(&self.dir)?;
        let mut id = BackupId::from_time(start);
        loop {
            match std::fs::create_dir(self.backup_dir(id)) {
                Ok(()) => return Ok(id),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => id = id.next(),
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("failed to create backup directory for {id}"));
                }
            }
        }
    }

    pub fn write_control(&self, info: &BackupInfo) -> anyhow::Result<()> {
        write_control(&self.backup_dir(info.id), info, self.no_sync)
    }

    /// Persists a status change.
    pub fn set_status(&self, info: &mut BackupInfo, status: BackupStatus) -> anyhow::Result<()> {
        info.status = status;
        self.write_control(info)?;
        info!("Backup {} status: {status}", info.id);
        Ok(())
    }

    /// Changes the note or pin of a backup, as `set-backup` does. Only
    /// finished backups can be changed.
    pub fn update_backup(
        &self,
        id: BackupId,
        update: impl FnOnce(&mut BackupInfo),
    ) -> anyhow::Result<BackupInfo> {
        let _lock = self.lock_backup(id, LockMode::Exclusive)?;
        let mut info = self.load(id)?;
        if !matches!(
            info.status,
            BackupStatus::Ok | BackupStatus::Orphan | BackupStatus::Corrupt
        ) {
            return Err(ArchivistError::InvalidStatus {
                id,
                status: info.status,
            }
            .into());
        }
        update(&mut info);
        self.write_control(&info)?;
        Ok(info)
    }

    pub fn read_content(&self, id: BackupId) -> anyhow::Result<Vec<FileEntry>> {
        content::read_content(&self.backup_dir(id).join(CONTENT_FILE_NAME))
    }

    pub fn write_content(&self, id: BackupId, entries: &[FileEntry]) -> anyhow::Result<()> {
        content::write_content(
            &self.backup_dir(id).join(CONTENT_FILE_NAME),
            entries,
            self.no_sync,
        )
    }

    pub fn read_database_map(&self, id: BackupId) -> anyhow::Result<Vec<DatabaseEntry>> {
        content::read_database_map(&self.backup_dir(id).join(DATABASE_MAP_FILE_NAME))
    }

    pub fn write_database_map(&self, id: BackupId, map: &[DatabaseEntry]) -> anyhow::Result<()> {
        content::write_database_map(
            &self.backup_dir(id).join(DATABASE_MAP_FILE_NAME),
            map,
            self.no_sync,
        )
    }

    pub fn lock_backup(&self, id: BackupId, mode: LockMode) -> anyhow::Result<LockGuard> {
        let dir = self.backup_dir(id);
        anyhow::ensure!(dir.is_dir(), ArchivistError::BackupNotFound(id));
        lock_dir(&dir, BACKUP_LOCK_FILE, mode, self.lock_timeout)
            .map_err(ArchivistError::from)
            .with_context(|| format!("failed to lock backup {id}"))
    }

    pub fn lock_chain(
        &self,
        chain: &[&BackupInfo],
        mode: LockMode,
    ) -> anyhow::Result<Vec<LockGuard>> {
        chain.iter().map(|b| self.lock_backup(b.id, mode)).collect()
    }

    /// Serializes catalog-wide maintenance (retention runs) of the instance.
    pub fn lock_instance(&self) -> anyhow::Result<LockGuard> {
        lock_dir(
            &self.dir,
            INSTANCE_LOCK_FILE,
            LockMode::Exclusive,
            self.lock_timeout,
        )
        .map_err(ArchivistError::from)
        .context("failed to lock instance")
    }

    pub fn remove_backup_dir(&self, id: BackupId) -> anyhow::Result<()> {
        let dir = self.backup_dir(id);
        utils::fs_ext::remove_dir_all(&dir)
            .with_context(|| format!("failed to remove backup directory {dir}"))?;
        if !self.no_sync {
            utils::crashsafe::fsync(&self.dir)?;
        }
        Ok(())
    }

    /// Marks every valid descendant of `id` as ORPHAN.
    pub fn mark_orphans(&self, backups: &[BackupInfo], id: BackupId) -> anyhow::Result<Vec<BackupId>> {
        let parent_status = find_backup(backups, id).map(|b| b.status);
        let mut orphaned = Vec::new();
        for child in descendants(backups, id) {
            if child.status != BackupStatus::Ok {
                continue;
            }
            let mut child = child.clone();
            warn!(
                "Backup {} is orphaned because its parent {id} has status: {}",
                child.id,
                parent_status.map(|s| s.to_string()).unwrap_or_else(|| "missing".into())
            );
            self.set_status(&mut child, BackupStatus::Orphan)?;
            orphaned.push(child.id);
        }
        Ok(orphaned)
    }
}

/// Reads `backup.control` from a backup directory. `Ok(None)` if it doesn't exist.
pub fn read_control(backup_dir: &Utf8Path) -> anyhow::Result<Option<BackupInfo>> {
    let path = backup_dir.join(CONTROL_FILE_NAME);
    let content = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("failed to open control file at {path}")),
    };
    let info = toml::from_str(&content)
        .with_context(|| format!("failed to parse control file at {path}"))?;
    Ok(Some(info))
}

pub fn write_control(backup_dir: &Utf8Path, info: &BackupInfo, no_sync: bool) -> anyhow::Result<()> {
    let path = backup_dir.join(CONTROL_FILE_NAME);
    let content = toml::to_string(info).context("failed to serialize backup control file")?;
    overwrite_with_sync(
        &path,
        &path_with_suffix_extension(&path, "tmp"),
        content.as_bytes(),
        !no_sync,
    )
    .with_context(|| format!("failed to write control file at {path}"))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn backup(id: u64, mode: BackupMode, parent: Option<u64>) -> BackupInfo {
        let mut b = BackupInfo::new(BackupId(id), mode, Utc.timestamp_opt(id as i64, 0).unwrap());
        b.status = BackupStatus::Ok;
        b.parent_backup_id = parent.map(BackupId);
        b
    }

    #[test]
    fn backup_id_base36() {
        let id = BackupId(1_700_000_000);
        assert_eq!(id.to_string(), "S44WE8");
        assert_eq!("S44WE8".parse::<BackupId>().unwrap(), id);
        assert_eq!("s44we8".parse::<BackupId>().unwrap(), id);
        assert_eq!(BackupId(0).to_string(), "0");
        assert!("".parse::<BackupId>().is_err());
        assert!("HELLO!".parse::<BackupId>().is_err());
        assert!(BackupId(10) < BackupId(36));
    }

    #[test]
    fn control_file_roundtrip() -> anyhow::Result<()> {
        let dir = camino_tempfile::tempdir()?;
        let mut info = backup(1_700_000_000, BackupMode::Page, Some(1_699_999_000));
        info.start_lsn = Lsn(0x3000028);
        info.stop_lsn = Lsn(0x3000100);
        info.system_identifier = u64::MAX;
        info.recovery_xid = Some(745);
        info.note = Some("before upgrade".into());
        write_control(dir.path(), &info, true)?;

        let text = std::fs::read_to_string(dir.path().join(CONTROL_FILE_NAME))?;
        assert!(text.contains("backup-mode = \"PAGE\""), "{text}");
        assert!(text.contains("start-lsn = \"0/3000028\""), "{text}");
        assert!(text.contains("parent-backup-id = \"S44VMG\""), "{text}");

        assert_eq!(read_control(dir.path())?, Some(info));
        Ok(())
    }

    #[test]
    fn chain_helpers() {
        let backups = vec![
            backup(100, BackupMode::Full, None),
            backup(200, BackupMode::Page, Some(100)),
            backup(300, BackupMode::Delta, Some(200)),
            backup(400, BackupMode::Page, Some(100)),
            backup(500, BackupMode::Full, None),
            backup(600, BackupMode::Page, Some(999)),
        ];

        let chain = parent_chain(&backups, BackupId(300)).unwrap();
        let ids: Vec<u64> = chain.iter().map(|b| b.id.0).collect();
        assert_eq!(ids, [300, 200, 100]);

        let desc: Vec<u64> = descendants(&backups, BackupId(100)).iter().map(|b| b.id.0).collect();
        assert_eq!(desc, [200, 300, 400]);
        assert!(descendants(&backups, BackupId(500)).is_empty());

        assert!(is_ancestor(&backups, BackupId(100), BackupId(300)));
        assert!(!is_ancestor(&backups, BackupId(400), BackupId(300)));

        assert!(matches!(
            scan_parent_chain(&backups, BackupId(600)).unwrap(),
            ChainScan::Broken { missing: BackupId(999), child: BackupId(600) }
        ));

        let mut backups = backups;
        backups[1].status = BackupStatus::Corrupt;
        match scan_parent_chain(&backups, BackupId(300)).unwrap() {
            ChainScan::Invalid { invalid, chain } => {
                assert_eq!(invalid.id, BackupId(200));
                assert_eq!(chain.len(), 3);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            scan_parent_chain(&backups, BackupId(400)).unwrap(),
            ChainScan::Intact(_)
        ));
    }

    #[test]
    fn catalog_list_and_orphans() -> anyhow::Result<()> {
        let dir = camino_tempfile::tempdir()?;
        let catalog = Catalog::new(dir.path(), true, Duration::ZERO);
        let start = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        let full_id = catalog.create_backup_dir(start)?;
        let page_id = catalog.create_backup_dir(start)?;
        assert_eq!(page_id, full_id.next());

        let mut full = backup(full_id.0, BackupMode::Full, None);
        catalog.write_control(&full)?;
        let page = backup(page_id.0, BackupMode::Page, Some(full_id.0));
        catalog.write_control(&page)?;
        std::fs::create_dir(dir.path().join("not-a-backup"))?;

        let backups = catalog.list()?;
        assert_eq!(backups.len(), 2);

        catalog.set_status(&mut full, BackupStatus::Corrupt)?;
        let backups = catalog.list()?;
        assert_eq!(catalog.mark_orphans(&backups, full_id)?, vec![page_id]);
        assert_eq!(catalog.load(page_id)?.status, BackupStatus::Orphan);

        let _guard = catalog.lock_backup(page_id, LockMode::Exclusive)?;
        assert!(catalog.backup_dir(page_id).join(BACKUP_LOCK_FILE).exists());
        Ok(())
    }

    #[test]
    fn update_backup_sets_pin() -> anyhow::Result<()> {
        let dir = camino_tempfile::tempdir()?;
        let catalog = Catalog::new(dir.path(), true, Duration::ZERO);
        let start = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let id = catalog.create_backup_dir(start)?;
        let mut info = backup(id.0, BackupMode::Full, None);
        catalog.write_control(&info)?;

        let expire = start + chrono::Duration::days(3);
        catalog.update_backup(id, |b| {
            b.note = Some("before upgrade".into());
            b.expire_time = Some(expire);
        })?;
        let loaded = catalog.load(id)?;
        assert_eq!(loaded.note.as_deref(), Some("before upgrade"));
        assert!(loaded.is_pinned(start));
        assert!(!loaded.is_pinned(expire));

        catalog.set_status(&mut info, BackupStatus::Running)?;
        assert!(catalog.update_backup(id, |b| b.note = None).is_err());
        Ok(())
    }
}
