//! Folding an incremental backup and its ancestors into one FULL backup.
//!
//! The merged backup is assembled in a staging directory next to the
//! backups, `.merge-<id>`, and only replaces the chain once it is complete.
//! Progress is persisted through backup statuses, a journal of merged files
//! and the staging control file, so an interrupted merge is finished by
//! running it again:
//!
//! | phase              | persisted as                                        |
//! |--------------------|-----------------------------------------------------|
//! | locked             | chain `MERGING`, FULL's `merge-dest-id` set          |
//! | files merged       | `merge.journal` lists every merged file               |
//! | file list written  | staging `backup_content.control`, `database_map`      |
//! | control written    | staging `backup.control` `MERGED`, FULL `MERGED`       |
//! | renamed            | chain directories removed, staging renamed            |
//! | done               | merged backup `OK`                                    |

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::sync::Arc;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use utils::lock_file::LockMode;

use crate::InstanceContext;
use crate::catalog::{
    self, BackupId, BackupInfo, BackupMode, BackupStatus, CONTENT_FILE_NAME, Catalog,
    DATABASE_MAP_FILE_NAME,
};
use crate::compression::CompressAlg;
use crate::content::{self, FileEntry};
use crate::datafile::PageStreamWriter;
use crate::error::{self, ArchivistError};
use crate::reconstruct::{ChainView, FilePlan};

pub const MERGE_JOURNAL_FILE: &str = "merge.journal";

/// Where [`merge_backup_until`] stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, strum_macros::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum MergePhase {
    Locked,
    FilesMerged,
    FilelistWritten,
    ControlWritten,
    Renamed,
    Done,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "kebab-case")]
enum JournalRecord {
    /// Ids of the merged chain, newest first. Always the first record.
    Chain { ids: Vec<BackupId> },
    /// A file of the merged backup, complete in the staging directory.
    File { entry: FileEntry },
}

struct Journal {
    path: Utf8PathBuf,
    file: File,
    no_sync: bool,
}

impl Journal {
    /// Opens the journal for appending after its first `intact` bytes.
    fn open(path: Utf8PathBuf, intact: u64, no_sync: bool) -> anyhow::Result<Journal> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open merge journal {path}"))?;
        file.set_len(intact)
            .with_context(|| format!("failed to truncate merge journal {path}"))?;
        Ok(Journal {
            path,
            file,
            no_sync,
        })
    }

    fn append(&mut self, record: &JournalRecord) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(record).context("failed to serialize journal record")?;
        line.push(b'\n');
        self.file
            .write_all(&line)
            .with_context(|| format!("failed to write merge journal {}", self.path))?;
        if !self.no_sync {
            self.file.sync_data()?;
        }
        Ok(())
    }
}

/// Records of a journal and the length of its intact prefix. A torn last
/// line, left by a crash, is not part of it.
fn read_journal(path: &Utf8Path) -> anyhow::Result<(Vec<JournalRecord>, u64)> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e).with_context(|| format!("failed to read merge journal {path}")),
    };
    let mut records = Vec::new();
    let mut intact = 0;
    for line in text.split_inclusive('\n') {
        if !line.ends_with('\n') {
            warn!("ignoring torn record at the end of merge journal {path}");
            break;
        }
        match serde_json::from_str(line) {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!("ignoring torn record in merge journal {path}: {e}");
                break;
            }
        }
        intact += line.len() as u64;
    }
    Ok((records, intact))
}

fn journaled_chain(records: &[JournalRecord]) -> Option<&[BackupId]> {
    match records.first() {
        Some(JournalRecord::Chain { ids }) => Some(ids),
        _ => None,
    }
}

/// Merges backup `id` with its ancestors into a FULL backup that takes
/// over `id`. Resumes an interrupted merge of `id`. A FULL backup is left
/// as it is.
pub async fn merge_backup(ctx: &InstanceContext, id: BackupId, threads: usize) -> anyhow::Result<BackupInfo> {
    merge_backup_until(ctx, id, threads, MergePhase::Done).await
}

/// Runs a merge up to and including `stop`, leaving the catalog as a merge
/// interrupted right after that phase would.
#[instrument(skip_all, fields(instance = %ctx.instance, backup_id = %id))]
pub async fn merge_backup_until(
    ctx: &InstanceContext,
    id: BackupId,
    threads: usize,
    stop: MergePhase,
) -> anyhow::Result<BackupInfo> {
    let catalog = ctx.catalog();
    if let Some(merged) = resume_staged(&catalog, id, stop).await? {
        return Ok(merged);
    }

    let backups = catalog.list()?;
    let mut target = catalog::find_backup(&backups, id).ok_or(ArchivistError::BackupNotFound(id))?;
    if target.is_full() {
        match (target.status, target.merge_dest_id) {
            (BackupStatus::Merged, None) => {
                info!("Resuming merge of backup {id} at phase {}", MergePhase::Done);
                let _lock = catalog.lock_backup(id, LockMode::Exclusive)?;
                let mut merged = target.clone();
                catalog.set_status(&mut merged, BackupStatus::Ok)?;
                utils::fs_ext::ignore_absent_files(|| {
                    std::fs::remove_file(catalog.backup_dir(id).join(MERGE_JOURNAL_FILE))
                })?;
                return Ok(merged);
            }
            (BackupStatus::Merging | BackupStatus::Merged, Some(dest)) => {
                info!("Backup {id} is being merged into {dest}, resuming that merge");
                if let Some(merged) = resume_staged(&catalog, dest, stop).await? {
                    return Ok(merged);
                }
                target = catalog::find_backup(&backups, dest).ok_or(ArchivistError::ChainBroken {
                    missing: dest,
                    child: id,
                })?;
            }
            _ => {
                info!("Backup {id} is a FULL backup, nothing to merge");
                return Ok(target.clone());
            }
        }
    }
    let id = target.id;
    let staging = catalog.merge_staging_dir(id);

    let chain = catalog::parent_chain(&backups, id)?;
    for member in &chain {
        if !matches!(
            member.status,
            BackupStatus::Ok | BackupStatus::Merging | BackupStatus::Merged
        ) {
            return Err(ArchivistError::InvalidStatus {
                id: member.id,
                status: member.status,
            }
            .into());
        }
        if member.merge_dest_id.is_some_and(|dest| dest != id) {
            return Err(ArchivistError::ParentMerging(member.id).into());
        }
    }
    let branches = other_branches(&backups, &chain);
    if !branches.is_empty() {
        return Err(error::policy(format!(
            "Backup {id} cannot be merged, backups {} are built on its parents on another branch",
            itertools::join(&branches, ", ")
        )));
    }
    let full = chain[chain.len() - 1];
    let _locks = catalog.lock_chain(&chain, LockMode::Exclusive)?;
    info!(
        "Merging backup {id} with {} parent backups into FULL backup {}",
        chain.len() - 1,
        full.id
    );

    // locked
    for member in &chain {
        let mut member = (*member).clone();
        if member.id == full.id && member.merge_dest_id.is_none() {
            member.merge_dest_id = Some(id);
            member.merge_time = Some(Utc::now());
        }
        if member.status == BackupStatus::Ok {
            catalog.set_status(&mut member, BackupStatus::Merging)?;
        } else {
            catalog.write_control(&member)?;
        }
    }
    if stop == MergePhase::Locked {
        return catalog.load(id);
    }

    // files
    utils::crashsafe::create_dir_all(&staging)?;
    let journal_path = staging.join(MERGE_JOURNAL_FILE);
    let (records, intact) = read_journal(&journal_path)?;
    let chain_ids: Vec<BackupId> = chain.iter().map(|b| b.id).collect();
    let mut journal = Journal::open(journal_path, intact, catalog.no_sync())?;
    match journaled_chain(&records) {
        Some(ids) => anyhow::ensure!(
            ids == chain_ids.as_slice(),
            "merge journal of backup {id} belongs to chain {ids:?}, expected {chain_ids:?}"
        ),
        None => journal.append(&JournalRecord::Chain {
            ids: chain_ids.clone(),
        })?,
    }
    let mut merged_files: HashMap<(u32, String), FileEntry> = records
        .into_iter()
        .filter_map(|r| match r {
            JournalRecord::File { entry } => Some(((entry.external_dir_num, entry.path.clone()), entry)),
            JournalRecord::Chain { .. } => None,
        })
        .collect();
    if !merged_files.is_empty() {
        info!("Resuming merge of backup {id}, {} files already merged", merged_files.len());
    }

    let view = ChainView::load(&catalog, &chain)?;
    utils::crashsafe::create_dir_all(staging.join(content::DATABASE_DIR))?;
    for dir in view.newest_entries().iter().filter(|e| e.is_dir()) {
        utils::crashsafe::create_dir_all(dir.stored_path(&staging))?;
    }
    let todo: Vec<usize> = view
        .newest_entries()
        .iter()
        .enumerate()
        .filter(|(_, e)| !e.is_dir() && !merged_files.contains_key(&(e.external_dir_num, e.path.clone())))
        .map(|(i, _)| i)
        .collect();
    let job = Arc::new(MergeJob {
        view,
        staging: staging.clone(),
        compress_level: target.compress_level,
        no_sync: catalog.no_sync(),
    });
    let mut merging = futures::stream::iter(todo)
        .map(|idx| {
            let job = Arc::clone(&job);
            async move {
                tokio::task::spawn_blocking(move || job.merge_file(idx))
                    .await
                    .context("merge task panicked")?
            }
        })
        .buffer_unordered(threads.max(1));
    while let Some(entry) = merging.next().await {
        let entry = entry?;
        journal.append(&JournalRecord::File {
            entry: entry.clone(),
        })?;
        merged_files.insert((entry.external_dir_num, entry.path.clone()), entry);
    }
    drop(merging);
    if stop == MergePhase::FilesMerged {
        return catalog.load(id);
    }

    // file list
    let mut entries = Vec::with_capacity(job.view.newest_entries().len());
    for newest in job.view.newest_entries() {
        if newest.is_dir() {
            entries.push(newest.clone());
            continue;
        }
        let merged = merged_files
            .remove(&(newest.external_dir_num, newest.path.clone()))
            .with_context(|| format!("file {} was not merged", newest.path))?;
        entries.push(merged);
    }
    content::write_content(&staging.join(CONTENT_FILE_NAME), &entries, catalog.no_sync())?;
    content::write_database_map(
        &staging.join(DATABASE_MAP_FILE_NAME),
        &catalog.read_database_map(id)?,
        catalog.no_sync(),
    )?;
    if stop == MergePhase::FilelistWritten {
        return catalog.load(id);
    }

    // control
    let mut merged = target.clone();
    merged.backup_mode = BackupMode::Full;
    merged.parent_backup_id = None;
    merged.status = BackupStatus::Merged;
    merged.merge_dest_id = None;
    merged.merge_time = Some(Utc::now());
    merged.data_bytes = entries.iter().filter_map(|e| e.write_size).sum();
    catalog::write_control(&staging, &merged, catalog.no_sync())?;
    let mut full = catalog.load(full.id)?;
    catalog.set_status(&mut full, BackupStatus::Merged)?;
    if stop == MergePhase::ControlWritten {
        return Ok(merged);
    }

    finish(&catalog, merged, &chain_ids, stop).await
}

/// Backups that depend on a parent of `chain[0]` without depending on
/// `chain[0]` itself. Merging would remove their parents. Backups being
/// deleted and failed ones don't count.
fn other_branches(backups: &[BackupInfo], chain: &[&BackupInfo]) -> Vec<BackupId> {
    let target = chain[0].id;
    let mut on_branch: HashSet<BackupId> = chain.iter().map(|b| b.id).collect();
    on_branch.extend(catalog::descendants(backups, target).iter().map(|b| b.id));
    let mut others: Vec<BackupId> = chain[1..]
        .iter()
        .flat_map(|parent| catalog::descendants(backups, parent.id))
        .filter(|b| !on_branch.contains(&b.id))
        .filter(|b| !matches!(b.status, BackupStatus::Deleting | BackupStatus::Error))
        .map(|b| b.id)
        .collect();
    others.sort();
    others.dedup();
    others
}

/// Finishes a merge of `id` whose staged backup is complete.
async fn resume_staged(catalog: &Catalog, id: BackupId, stop: MergePhase) -> anyhow::Result<Option<BackupInfo>> {
    let staging = catalog.merge_staging_dir(id);
    if !is_staged(&staging)? {
        return Ok(None);
    }
    let (records, _) = read_journal(&staging.join(MERGE_JOURNAL_FILE))?;
    let chain_ids = journaled_chain(&records).unwrap_or_default().to_vec();
    let _locks = chain_ids
        .iter()
        .filter(|member| catalog.backup_dir(**member).is_dir())
        .map(|member| catalog.lock_backup(*member, LockMode::Exclusive))
        .collect::<anyhow::Result<Vec<_>>>()?;
    // another run may have finished it while we waited for the locks
    match catalog::read_control(&staging)? {
        Some(merged) if merged.status == BackupStatus::Merged => {
            info!("Resuming merge of backup {id} at phase {}", MergePhase::Renamed);
            finish(catalog, merged, &chain_ids, stop).await.map(Some)
        }
        _ => Ok(None),
    }
}

fn is_staged(staging: &Utf8Path) -> anyhow::Result<bool> {
    Ok(catalog::read_control(staging)?.is_some_and(|b| b.status == BackupStatus::Merged))
}

/// Replaces the chain with the staged backup and marks it OK.
async fn finish(
    catalog: &Catalog,
    mut merged: BackupInfo,
    chain_ids: &[BackupId],
    stop: MergePhase,
) -> anyhow::Result<BackupInfo> {
    let id = merged.id;
    let staging = catalog.merge_staging_dir(id);
    // children before parents
    for member in chain_ids {
        if catalog.backup_dir(*member).exists() {
            catalog.remove_backup_dir(*member)?;
            info!("Removed backup {member}, merged into {id}");
        }
    }
    utils::crashsafe::durable_rename(&staging, catalog.backup_dir(id), !catalog.no_sync())
        .await
        .with_context(|| format!("failed to rename {staging} to the directory of backup {id}"))?;
    if stop == MergePhase::Renamed {
        return Ok(merged);
    }

    catalog.set_status(&mut merged, BackupStatus::Ok)?;
    utils::fs_ext::ignore_absent_files(|| {
        std::fs::remove_file(catalog.backup_dir(id).join(MERGE_JOURNAL_FILE))
    })?;
    info!("Merge of backup {id} completed");
    Ok(merged)
}

struct MergeJob {
    view: ChainView,
    staging: Utf8PathBuf,
    compress_level: u32,
    no_sync: bool,
}

impl MergeJob {
    /// Writes file `idx` of the newest backup into the staging directory and
    /// returns its entry in the merged file list.
    fn merge_file(&self, idx: usize) -> anyhow::Result<FileEntry> {
        let newest = &self.view.newest_entries()[idx];
        let dst = newest.stored_path(&self.staging);
        if let Some(parent) = dst.parent() {
            utils::crashsafe::create_dir_all(parent)?;
        }
        // left over by an interrupted run
        utils::fs_ext::ignore_absent_files(|| std::fs::remove_file(&dst))?;

        let plan = self.view.plan_file(newest)?;
        let mut merged = newest.clone();
        if let Some(source) = plan.single_source() {
            let src = self.view.stored_path(&source);
            std::fs::hard_link(&src, &dst).with_context(|| format!("failed to link {src} to {dst}"))?;
            merged.write_size = source.entry.write_size;
            merged.crc = source.entry.crc;
            merged.compress_alg = source.entry.compress_alg;
            return Ok(merged);
        }
        let FilePlan::Pages { layers, .. } = &plan else {
            anyhow::bail!("cannot merge {}: no single source for a whole file", newest.path);
        };
        let pages = self.view.collect_pages(&plan)?;
        // pages are re-encoded only when they come with different codecs
        let codecs: HashSet<CompressAlg> = pages
            .values()
            .filter(|(_, page)| page.compressed)
            .map(|(alg, _)| *alg)
            .collect();
        let alg = match codecs.iter().next() {
            Some(only) if codecs.len() == 1 => *only,
            _ => layers
                .first()
                .map(|l| l.entry.compress_alg)
                .unwrap_or(CompressAlg::None),
        };

        let file = File::create(&dst).with_context(|| format!("failed to create {dst}"))?;
        let mut writer = PageStreamWriter::new(BufWriter::new(file));
        for (blkno, (page_alg, page)) in pages {
            if !page.compressed || page_alg == alg {
                writer.write_stored(&page)?;
            } else {
                let raw = page.decode(page_alg)?;
                writer.write_page(alg, self.compress_level, blkno, &raw)?;
            }
        }
        let (buf, crc, written) = writer.finish();
        let file = buf
            .into_inner()
            .map_err(|e| e.into_error())
            .with_context(|| format!("failed to write {dst}"))?;
        if !self.no_sync {
            file.sync_all()
                .with_context(|| format!("failed to fsync {dst}"))?;
        }
        merged.write_size = Some(written);
        merged.crc = crc;
        merged.compress_alg = alg;
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::{BackupOptions, take_backup};
    use crate::error::{ErrorKind, error_kind};
    use crate::test_utils::Env;

    async fn backup(env: &Env, mode: BackupMode, alg: CompressAlg) -> anyhow::Result<BackupInfo> {
        let mut opts = BackupOptions::new(mode, &env.ctx.config);
        opts.compress_alg = alg;
        take_backup(&env.ctx, &env.cluster, &opts).await
    }

    #[tokio::test]
    async fn merge_builds_full_backup() -> anyhow::Result<()> {
        let env = Env::new()?;
        let catalog = env.ctx.catalog();
        let full = backup(&env, BackupMode::Full, CompressAlg::Zlib).await?;
        env.cluster.write_pages("base/16384/16385", &[(0, 3), (1, 3)])?;
        backup(&env, BackupMode::Delta, CompressAlg::Zstd).await?;
        env.cluster.write_pages("base/16384/16385", &[(1, 4)])?;
        let mut last = backup(&env, BackupMode::Delta, CompressAlg::Lz4).await?;
        last.note = Some("before upgrade".into());
        catalog.write_control(&last)?;

        let merged = merge_backup(&env.ctx, last.id, 2).await?;
        assert_eq!(merged.id, last.id);
        assert_eq!(merged.backup_mode, BackupMode::Full);
        assert_eq!(merged.status, BackupStatus::Ok);
        assert_eq!(merged.note.as_deref(), Some("before upgrade"));
        assert_eq!(merged.parent_backup_id, None);

        let backups = catalog.list()?;
        assert_eq!(backups.iter().map(|b| b.id).collect::<Vec<_>>(), vec![last.id]);
        assert!(!catalog.merge_staging_dir(last.id).exists());
        assert!(!catalog.backup_dir(full.id).exists());

        let entries = catalog.read_content(last.id)?;
        let rel = entries.iter().find(|e| e.path == "base/16384/16385").unwrap();
        assert_eq!(rel.n_blocks, Some(2));
        // the newest layer's codec wins
        assert_eq!(rel.compress_alg, CompressAlg::Lz4);
        let untouched = entries.iter().find(|e| e.path == "base/1/1259").unwrap();
        assert_eq!(untouched.compress_alg, CompressAlg::Zlib);
        crate::validate::validate_backup(&env.ctx, last.id, 1).await?;

        // merging a FULL backup changes nothing
        let again = merge_backup(&env.ctx, last.id, 1).await?;
        assert_eq!(again, catalog.load(last.id)?);
        Ok(())
    }

    #[tokio::test]
    async fn invalid_chain_member_is_reported() -> anyhow::Result<()> {
        let env = Env::new()?;
        let catalog = env.ctx.catalog();
        let full = backup(&env, BackupMode::Full, CompressAlg::None).await?;
        let delta = backup(&env, BackupMode::Delta, CompressAlg::None).await?;

        let mut corrupt = catalog.load(full.id)?;
        catalog.set_status(&mut corrupt, BackupStatus::Corrupt)?;
        let err = merge_backup(&env.ctx, delta.id, 1).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("Backup {} has status CORRUPT, operation is not possible", full.id)
        );
        assert_eq!(catalog.load(delta.id)?.status, BackupStatus::Ok);

        catalog.remove_backup_dir(full.id)?;
        let err = merge_backup(&env.ctx, delta.id, 1).await.unwrap_err();
        assert_eq!(error_kind(&err), ErrorKind::Fatal);
        assert!(err.to_string().contains("Incremental chain is broken"), "{err}");
        Ok(())
    }

    #[tokio::test]
    async fn torn_journal_is_resumed() -> anyhow::Result<()> {
        let env = Env::new()?;
        let catalog = env.ctx.catalog();
        let full = backup(&env, BackupMode::Full, CompressAlg::None).await?;
        env.cluster.write_pages("base/1/1259", &[(1, 9)])?;
        let delta = backup(&env, BackupMode::Delta, CompressAlg::None).await?;

        merge_backup_until(&env.ctx, delta.id, 1, MergePhase::FilesMerged).await?;
        assert_eq!(catalog.load(full.id)?.status, BackupStatus::Merging);
        assert_eq!(catalog.load(full.id)?.merge_dest_id, Some(delta.id));
        assert_eq!(catalog.load(delta.id)?.status, BackupStatus::Merging);

        // keep the chain record and one file, then a torn line
        let journal = catalog.merge_staging_dir(delta.id).join(MERGE_JOURNAL_FILE);
        let text = std::fs::read_to_string(&journal)?;
        let mut kept: String = text.lines().take(2).map(|l| format!("{l}\n")).collect();
        kept.push_str("{\"record\":\"fi");
        std::fs::write(&journal, kept)?;

        // resuming through the FULL backup works too
        let merged = merge_backup(&env.ctx, full.id, 1).await?;
        assert_eq!(merged.id, delta.id);
        assert_eq!(merged.status, BackupStatus::Ok);
        crate::validate::validate_backup(&env.ctx, delta.id, 1).await?;
        Ok(())
    }

    #[tokio::test]
    async fn merge_refuses_to_strand_another_branch() -> anyhow::Result<()> {
        let env = Env::new()?;
        let catalog = env.ctx.catalog();
        let full = backup(&env, BackupMode::Full, CompressAlg::None).await?;
        env.cluster.write_pages("base/16384/16385", &[(0, 2)])?;
        let mut d1 = backup(&env, BackupMode::Delta, CompressAlg::None).await?;
        // D2 branches off the FULL backup while D1 is failed
        catalog.set_status(&mut d1, BackupStatus::Error)?;
        env.cluster.write_pages("base/16384/16385", &[(1, 3)])?;
        let d2 = backup(&env, BackupMode::Delta, CompressAlg::None).await?;
        assert_eq!(d2.parent_backup_id, Some(full.id));
        catalog.set_status(&mut d1, BackupStatus::Ok)?;

        let err = merge_backup(&env.ctx, d1.id, 1).await.unwrap_err();
        assert_eq!(error_kind(&err), ErrorKind::Policy);
        assert!(err.to_string().contains(&d2.id.to_string()), "{err}");
        for id in [full.id, d1.id, d2.id] {
            assert_eq!(catalog.load(id)?.status, BackupStatus::Ok);
        }
        assert!(!catalog.merge_staging_dir(d1.id).exists());
        crate::validate::validate_backup(&env.ctx, d2.id, 1).await?;

        // a failed branch does not hold the merge back
        let mut d2 = catalog.load(d2.id)?;
        catalog.set_status(&mut d2, BackupStatus::Error)?;
        let merged = merge_backup(&env.ctx, d1.id, 1).await?;
        assert_eq!(merged.backup_mode, BackupMode::Full);
        assert!(!catalog.backup_dir(full.id).exists());
        Ok(())
    }

    #[tokio::test]
    async fn resumed_merge_waits_for_readers_of_the_chain() -> anyhow::Result<()> {
        let env = Env::new()?;
        let catalog = env.ctx.catalog();
        let full = backup(&env, BackupMode::Full, CompressAlg::None).await?;
        env.cluster.write_pages("base/1/1259", &[(1, 7)])?;
        let delta = backup(&env, BackupMode::Delta, CompressAlg::None).await?;
        merge_backup_until(&env.ctx, delta.id, 1, MergePhase::ControlWritten).await?;

        // a restore in another live process is reading the FULL backup
        let reader = catalog.backup_dir(full.id).join("ro.1.pid");
        std::fs::write(&reader, "1\n")?;
        let err = merge_backup(&env.ctx, delta.id, 1).await.unwrap_err();
        assert_eq!(error_kind(&err), ErrorKind::Transient, "{err:#}");
        assert!(catalog.backup_dir(full.id).join(catalog::CONTROL_FILE_NAME).exists());
        assert!(catalog.backup_dir(delta.id).exists());
        assert!(catalog.merge_staging_dir(delta.id).exists());

        std::fs::remove_file(&reader)?;
        let merged = merge_backup(&env.ctx, delta.id, 1).await?;
        assert_eq!(merged.status, BackupStatus::Ok);
        assert!(!catalog.backup_dir(full.id).exists());
        assert!(!catalog.merge_staging_dir(delta.id).exists());
        Ok(())
    }

    #[test]
    fn journal_records_are_tagged() -> anyhow::Result<()> {
        let line = serde_json::to_string(&JournalRecord::Chain {
            ids: vec![BackupId(36), BackupId(1)],
        })?;
        assert_eq!(line, r#"{"record":"chain","ids":["10","1"]}"#);
        Ok(())
    }
}
