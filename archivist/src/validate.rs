//! Validation of backups: stored files against the sizes and checksums in
//! the file list, and the WAL an ARCHIVE backup needs to become consistent.
//! A backup that fails is marked CORRUPT and the backups depending on it
//! ORPHAN.

use std::io;

use anyhow::Context;
use camino::Utf8PathBuf;
use futures::StreamExt;
use tracing::{info, instrument, warn};
use utils::lock_file::LockMode;

use crate::InstanceContext;
use crate::catalog::{self, BackupId, BackupInfo, BackupStatus, Catalog, ChainScan, WalMode};
use crate::content::FileEntry;
use crate::error::ArchivistError;

/// Problems with the stored files of one backup, one message per file.
pub async fn check_backup_files(
    dir: Utf8PathBuf,
    entries: Vec<FileEntry>,
    threads: usize,
) -> anyhow::Result<Vec<String>> {
    let results: Vec<anyhow::Result<Option<String>>> = futures::stream::iter(entries)
        .filter(|e| std::future::ready(!e.is_dir() && !e.is_unchanged()))
        .map(|entry| {
            let path = entry.stored_path(&dir);
            async move {
                tokio::task::spawn_blocking(move || check_file(&path, &entry))
                    .await
                    .context("file check task panicked")?
            }
        })
        .buffer_unordered(threads.max(1))
        .collect()
        .await;
    let mut problems = Vec::new();
    for result in results {
        if let Some(problem) = result? {
            problems.push(problem);
        }
    }
    problems.sort();
    Ok(problems)
}

fn check_file(path: &camino::Utf8Path, entry: &FileEntry) -> anyhow::Result<Option<String>> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Ok(Some(format!("file {} is missing", entry.path)));
        }
        Err(e) => return Err(e).with_context(|| format!("failed to read {path}")),
    };
    let expected = entry.write_size.unwrap_or(0);
    if data.len() as u64 != expected {
        return Ok(Some(format!(
            "file {} has size {}, expected {expected}",
            entry.path,
            data.len()
        )));
    }
    let crc = crc32c::crc32c(&data);
    if crc != entry.crc {
        return Ok(Some(format!(
            "file {} has checksum {crc:08X}, expected {:08X}",
            entry.path, entry.crc
        )));
    }
    Ok(None)
}

/// Validates a backup and every backup it depends on.
#[instrument(skip_all, fields(instance = %ctx.instance, backup_id = %id))]
pub async fn validate_backup(ctx: &InstanceContext, id: BackupId, threads: usize) -> anyhow::Result<()> {
    let catalog = ctx.catalog();
    let backups = catalog.list()?;
    let chain = match catalog::scan_parent_chain(&backups, id)? {
        ChainScan::Intact(chain) => chain,
        ChainScan::Broken { missing, child } => {
            if let Some(target) = catalog::find_backup(&backups, id).filter(|b| b.is_ok()) {
                let mut target = target.clone();
                warn!("Backup {id} is orphaned because its parent {missing} is missing");
                catalog.set_status(&mut target, BackupStatus::Orphan)?;
            }
            return Err(ArchivistError::ChainBroken { missing, child }.into());
        }
        ChainScan::Invalid { invalid, .. } => {
            catalog.mark_orphans(&backups, invalid.id)?;
            return Err(ArchivistError::InvalidStatus {
                id: invalid.id,
                status: invalid.status,
            }
            .into());
        }
    };
    let _locks = catalog.lock_chain(&chain, LockMode::Shared)?;

    for backup in chain.iter().rev() {
        let problems = check_backup_files(
            catalog.backup_dir(backup.id),
            catalog.read_content(backup.id)?,
            threads,
        )
        .await?;
        if !problems.is_empty() {
            for problem in &problems {
                warn!("Backup {}: {problem}", backup.id);
            }
            mark_corrupt(&catalog, &backups, backup)?;
            return Err(ArchivistError::Corrupt(format!(
                "Backup {} is corrupt, {} files failed validation",
                backup.id,
                problems.len()
            ))
            .into());
        }
    }

    let target = chain[0];
    if target.wal == WalMode::Archive {
        if let Some(missing) = first_missing_segment(ctx, target).await? {
            mark_corrupt(&catalog, &backups, target)?;
            return Err(ArchivistError::Corrupt(format!(
                "WAL segment {missing} needed by backup {id} is absent from the archive"
            ))
            .into());
        }
    }
    info!("Backup {id} is valid");
    Ok(())
}

/// Validates every valid backup of the instance. Returns the ids that
/// failed.
pub async fn validate_instance(ctx: &InstanceContext, threads: usize) -> anyhow::Result<Vec<BackupId>> {
    let mut failed = Vec::new();
    for backup in ctx.catalog().list()? {
        if backup.status != BackupStatus::Ok {
            continue;
        }
        if let Err(e) = validate_backup(ctx, backup.id, threads).await {
            warn!("Backup {} failed validation: {e:#}", backup.id);
            failed.push(backup.id);
        }
    }
    Ok(failed)
}

fn mark_corrupt(catalog: &Catalog, backups: &[BackupInfo], backup: &BackupInfo) -> anyhow::Result<()> {
    let mut backup = backup.clone();
    catalog.set_status(&mut backup, BackupStatus::Corrupt)?;
    catalog.mark_orphans(backups, backup.id)?;
    Ok(())
}

async fn first_missing_segment(ctx: &InstanceContext, backup: &BackupInfo) -> anyhow::Result<Option<String>> {
    let store = ctx.wal_store();
    let seg = backup.wal_seg_size;
    for segno in backup.start_lsn.segment_number(seg)..=backup.stop_lsn.segment_number(seg) {
        let name = store.segment_name(backup.tli, segno);
        if store.find(&name).await?.is_none() {
            return Ok(Some(name));
        }
    }
    Ok(None)
}
