//! `archive-push`: copies WAL files from the server's `pg_wal` into the
//! archive.
//!
//! A push writes `<name>.part`, created exclusively, and renames it into
//! place. The `.part` file is what serializes concurrent pushes of the same
//! name: the loser waits for it to go away and then compares checksums with
//! what the winner archived. A `.part` that has not been touched for
//! `part_timeout` is a leftover of a killed push and is taken over.
//!
//! With `batch_size > 1` further files the server has marked ready
//! (`archive_status/<name>.ready`) are pushed in the same run. Files are
//! prepared in parallel but committed one by one in WAL order.

use std::io::{self, Write};
use std::time::{Duration, SystemTime};

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use futures::StreamExt;
use pg_xlog::xlog_utils::XLogFileKind;
use scopeguard::ScopeGuard;
use tracing::{info, instrument, warn};
use utils::backoff::{DEFAULT_BASE_BACKOFF_SECONDS, exponential_backoff};
use utils::crashsafe::durable_rename;

use crate::compression;
use crate::defaults::DEFAULT_PART_TIMEOUT;
use crate::error::ArchivistError;
use crate::segment_store::{GZ_SUFFIX, SegmentStore};

pub const ARCHIVE_STATUS_DIR: &str = "archive_status";
pub const READY_SUFFIX: &str = ".ready";
pub const DONE_SUFFIX: &str = ".done";

#[derive(Debug, Clone)]
pub struct PushOptions {
    /// Gzip full segments.
    pub compress: bool,
    pub compress_level: u32,
    pub overwrite: bool,
    pub batch_size: usize,
    pub threads: usize,
    pub dry_run: bool,
    /// Leave `.ready` markers of extra batch members alone.
    pub no_ready_rename: bool,
    pub part_timeout: Duration,
    pub no_sync: bool,
}

impl Default for PushOptions {
    fn default() -> Self {
        PushOptions {
            compress: false,
            compress_level: 1,
            overwrite: false,
            batch_size: 1,
            threads: 1,
            dry_run: false,
            no_ready_rename: false,
            part_timeout: DEFAULT_PART_TIMEOUT,
            no_sync: false,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PushSummary {
    pub pushed: Vec<String>,
    /// Already archived with the same checksum.
    pub skipped: Vec<String>,
    /// Extra batch members that failed; they stay `.ready`.
    pub failed: Vec<String>,
}

struct BatchMember {
    name: String,
    kind: XLogFileKind,
    /// The file archive-push was invoked for, as opposed to a ready extra.
    requested: bool,
}

enum Prepared {
    AlreadyArchived,
    DryRun,
    Part {
        part_path: Utf8PathBuf,
        final_path: Utf8PathBuf,
        /// The other representation of the same name, replaced by an overwrite.
        stale_other: Option<Utf8PathBuf>,
    },
}

#[instrument(skip_all, fields(file = %wal_file_name))]
pub async fn push(
    store: &SegmentStore,
    source_dir: &Utf8Path,
    wal_file_name: &str,
    opts: &PushOptions,
) -> anyhow::Result<PushSummary> {
    let kind = XLogFileKind::parse(wal_file_name, store.wal_seg_size())
        .ok_or_else(|| anyhow::anyhow!("{wal_file_name} is not a WAL file name"))?;
    let archive_dir = tokio::fs::metadata(store.dir())
        .await
        .with_context(|| format!("WAL archive directory {} is not accessible", store.dir()))?;
    anyhow::ensure!(
        archive_dir.is_dir() && !archive_dir.permissions().readonly(),
        "WAL archive directory {} is not writable",
        store.dir()
    );

    let mut batch = vec![BatchMember {
        name: wal_file_name.to_string(),
        kind,
        requested: true,
    }];
    if opts.batch_size > 1 {
        let mut ready = ready_files(store, source_dir).await?;
        ready.retain(|m| m.name != wal_file_name);
        ready.sort_by(|a, b| batch_order(a).cmp(&batch_order(b)));
        ready.truncate(opts.batch_size - 1);
        batch.extend(ready);
    }
    batch.sort_by(|a, b| batch_order(a).cmp(&batch_order(b)));

    let prepared: Vec<anyhow::Result<Prepared>> = futures::stream::iter(batch.iter())
        .map(|member| {
            let src = source_dir.join(&member.name);
            async move {
                prepare(store, &src, member, opts)
                    .await
                    .with_context(|| format!("failed to push WAL file {}", member.name))
            }
        })
        .buffered(opts.threads.max(1))
        .collect()
        .await;

    let mut summary = PushSummary::default();
    let mut requested_error = None;
    for (member, result) in batch.iter().zip(prepared) {
        let result = match result {
            Ok(prepared) => commit(source_dir, member, prepared, opts).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(true) => summary.pushed.push(member.name.clone()),
            Ok(false) => summary.skipped.push(member.name.clone()),
            Err(e) if member.requested => requested_error = Some(e),
            Err(e) => {
                warn!("{e:#}");
                summary.failed.push(member.name.clone());
            }
        }
    }
    if let Some(e) = requested_error {
        return Err(e);
    }
    info!(
        "pushed {} WAL files, skipped {}, failed {}",
        summary.pushed.len(),
        summary.skipped.len(),
        summary.failed.len()
    );
    Ok(summary)
}

/// History files go first, then segments in segment number order.
fn batch_order(member: &BatchMember) -> (u8, u64, &str) {
    match member.kind {
        XLogFileKind::History { tli } => (0, u64::from(tli), &member.name),
        _ => (1, member.kind.segno().unwrap_or(u64::MAX), &member.name),
    }
}

async fn ready_files(store: &SegmentStore, source_dir: &Utf8Path) -> anyhow::Result<Vec<BatchMember>> {
    let status_dir = source_dir.join(ARCHIVE_STATUS_DIR);
    if !tokio::fs::try_exists(&status_dir).await.unwrap_or(false) {
        return Ok(Vec::new());
    }
    let names = utils::fs_ext::list_dir(&status_dir).await?;
    Ok(names
        .into_iter()
        .filter_map(|f| f.strip_suffix(READY_SUFFIX).map(str::to_string))
        .filter_map(|name| {
            XLogFileKind::parse(&name, store.wal_seg_size()).map(|kind| BatchMember {
                name,
                kind,
                requested: false,
            })
        })
        .collect())
}

async fn prepare(
    store: &SegmentStore,
    src: &Utf8Path,
    member: &BatchMember,
    opts: &PushOptions,
) -> anyhow::Result<Prepared> {
    let data = tokio::fs::read(src)
        .await
        .with_context(|| format!("failed to read source file {src}"))?;
    if member.kind.is_full_segment() && data.len() != store.wal_seg_size() {
        anyhow::bail!(
            "source file {src} has size {}, expected {}",
            data.len(),
            store.wal_seg_size()
        );
    }
    let crc = crc32c::crc32c(&data);
    let compress = opts.compress && member.kind.is_full_segment();
    let final_path = store.path_of(&member.name, compress);
    let part_path = store.part_path(&member.name);

    let part_file = loop {
        let mut stale_other = None;
        if let Some(existing) = store.find(&member.name).await? {
            let archived = store.read(&existing).await?;
            if crc32c::crc32c(&archived) == crc {
                info!(
                    "WAL file {} already exists in archive with the same checksum, skip pushing",
                    member.name
                );
                return Ok(Prepared::AlreadyArchived);
            }
            if !opts.overwrite {
                return Err(ArchivistError::ChecksumConflict(member.name.clone()).into());
            }
            warn!(
                "WAL file {} already exists in archive with different checksum, overwriting",
                member.name
            );
            if existing.compressed != compress {
                stale_other = Some(store.dir().join(existing.file_name()));
            }
        }
        if opts.dry_run {
            info!("dry run: would push {} to {final_path}", member.name);
            return Ok(Prepared::DryRun);
        }

        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&part_path)
        {
            Ok(file) => break (file, stale_other),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if wait_for_part(&part_path, opts.part_timeout).await? {
                    warn!("taking over stale file {part_path}");
                    tokio::fs::remove_file(&part_path)
                        .await
                        .or_else(utils::fs_ext::ignore_not_found)
                        .with_context(|| format!("failed to remove {part_path}"))?;
                }
                // the concurrent push finished or was abandoned, look again
            }
            Err(e) => return Err(e).with_context(|| format!("failed to create {part_path}")),
        }
    };
    let (file, stale_other) = part_file;

    // the part file is ours now, remove it unless it is handed to commit
    let guard = scopeguard::guard(part_path.clone(), |p| {
        let _ = std::fs::remove_file(p);
    });
    let level = opts.compress_level;
    let no_sync = opts.no_sync;
    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        let payload = if compress {
            compression::gzip(&data, level)?
        } else {
            data
        };
        let mut file = file;
        file.write_all(&payload)?;
        if !no_sync {
            file.sync_all()?;
        }
        Ok(())
    })
    .await?
    .with_context(|| format!("failed to write {part_path}"))?;

    Ok(Prepared::Part {
        part_path: ScopeGuard::into_inner(guard),
        final_path,
        stale_other,
    })
}

/// Waits until `part_path` disappears (`false`) or has not been modified for
/// `part_timeout` (`true`, the file is stale).
async fn wait_for_part(part_path: &Utf8Path, part_timeout: Duration) -> anyhow::Result<bool> {
    let mut attempt = 0;
    loop {
        let modified = match tokio::fs::metadata(part_path).await {
            Ok(m) => m.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e).with_context(|| format!("failed to stat {part_path}")),
        };
        let idle = SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO);
        if idle >= part_timeout {
            return Ok(true);
        }
        if attempt == 0 {
            info!("{part_path} exists, waiting for the concurrent push to finish");
        }
        attempt += 1;
        exponential_backoff(attempt, DEFAULT_BASE_BACKOFF_SECONDS, 1.0).await;
    }
}

/// Returns whether something was written.
async fn commit(
    source_dir: &Utf8Path,
    member: &BatchMember,
    prepared: Prepared,
    opts: &PushOptions,
) -> anyhow::Result<bool> {
    let written = match prepared {
        Prepared::DryRun => return Ok(false),
        Prepared::AlreadyArchived => false,
        Prepared::Part {
            part_path,
            final_path,
            stale_other,
        } => {
            durable_rename(&part_path, &final_path, !opts.no_sync)
                .await
                .with_context(|| format!("failed to rename {part_path} to {final_path}"))?;
            if let Some(other) = stale_other {
                tokio::fs::remove_file(&other)
                    .await
                    .or_else(utils::fs_ext::ignore_not_found)
                    .with_context(|| format!("failed to remove {other}"))?;
            }
            info!(
                "pushed WAL file {}{}",
                member.name,
                if final_path.as_str().ends_with(GZ_SUFFIX) { " (compressed)" } else { "" }
            );
            true
        }
    };
    if !member.requested && !opts.no_ready_rename {
        let status_dir = source_dir.join(ARCHIVE_STATUS_DIR);
        let ready = status_dir.join(format!("{}{READY_SUFFIX}", member.name));
        let done = status_dir.join(format!("{}{DONE_SUFFIX}", member.name));
        durable_rename(&ready, &done, !opts.no_sync)
            .await
            .with_context(|| format!("failed to rename {ready} to {done}"))?;
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use camino_tempfile::Utf8TempDir;
    use pg_xlog::xlog_utils::XLogFileName;

    use super::*;
    use crate::error::{ErrorKind, error_kind};

    const SEG: usize = 1024 * 1024;

    struct Setup {
        _dir: Utf8TempDir,
        pg_wal: Utf8PathBuf,
        store: SegmentStore,
    }

    fn setup() -> anyhow::Result<Setup> {
        let dir = camino_tempfile::tempdir()?;
        let pg_wal = dir.path().join("pg_wal");
        std::fs::create_dir_all(pg_wal.join(ARCHIVE_STATUS_DIR))?;
        let archive = dir.path().join("archive");
        std::fs::create_dir_all(&archive)?;
        Ok(Setup {
            store: SegmentStore::new(archive, SEG, true),
            pg_wal,
            _dir: dir,
        })
    }

    fn write_segment(s: &Setup, segno: u64, fill: u8, ready: bool) -> anyhow::Result<String> {
        let name = XLogFileName(1, segno, SEG);
        std::fs::write(s.pg_wal.join(&name), vec![fill; SEG])?;
        if ready {
            std::fs::write(
                s.pg_wal.join(ARCHIVE_STATUS_DIR).join(format!("{name}{READY_SUFFIX}")),
                b"",
            )?;
        }
        Ok(name)
    }

    fn opts() -> PushOptions {
        PushOptions {
            no_sync: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn push_is_idempotent() -> anyhow::Result<()> {
        let s = setup()?;
        let name = write_segment(&s, 1, 7, false)?;

        let summary = push(&s.store, &s.pg_wal, &name, &opts()).await?;
        assert_eq!(summary.pushed, [name.clone()]);
        assert_eq!(std::fs::read(s.store.path_of(&name, false))?, vec![7; SEG]);

        let summary = push(&s.store, &s.pg_wal, &name, &opts()).await?;
        assert_eq!(summary.skipped, [name.clone()]);

        // different content, refused unless overwriting
        std::fs::write(s.pg_wal.join(&name), vec![8; SEG])?;
        let err = push(&s.store, &s.pg_wal, &name, &opts()).await.unwrap_err();
        assert_eq!(error_kind(&err), ErrorKind::Integrity);
        assert!(format!("{err:#}").contains("different checksum"), "{err:#}");

        let overwrite = PushOptions {
            overwrite: true,
            compress: true,
            ..opts()
        };
        push(&s.store, &s.pg_wal, &name, &overwrite).await?;
        // the plain copy is replaced by the compressed one
        assert!(!s.store.path_of(&name, false).exists());
        let file = s.store.find(&name).await?.unwrap();
        assert!(file.compressed);
        assert_eq!(s.store.read(&file).await?, vec![8; SEG]);
        Ok(())
    }

    #[tokio::test]
    async fn batch_pushes_ready_files_in_order() -> anyhow::Result<()> {
        let s = setup()?;
        let first = write_segment(&s, 3, 1, true)?;
        for segno in [6, 4, 5] {
            write_segment(&s, segno, segno as u8, true)?;
        }
        let history = "00000002.history";
        std::fs::write(s.pg_wal.join(history), b"1\t0/3000000\tno recovery target specified\n")?;
        std::fs::write(
            s.pg_wal.join(ARCHIVE_STATUS_DIR).join(format!("{history}{READY_SUFFIX}")),
            b"",
        )?;

        let batch = PushOptions {
            batch_size: 4,
            threads: 3,
            compress: true,
            ..opts()
        };
        let summary = push(&s.store, &s.pg_wal, &first, &batch).await?;
        assert_eq!(
            summary.pushed,
            [
                history.to_string(),
                first.clone(),
                XLogFileName(1, 4, SEG),
                XLogFileName(1, 5, SEG),
            ]
        );
        // the history file is never compressed
        assert!(s.store.path_of(history, false).exists());
        assert!(s.store.path_of(&XLogFileName(1, 4, SEG), true).exists());

        let status = s.pg_wal.join(ARCHIVE_STATUS_DIR);
        assert!(status.join(format!("{}{DONE_SUFFIX}", XLogFileName(1, 4, SEG))).exists());
        assert!(status.join(format!("{}{READY_SUFFIX}", XLogFileName(1, 6, SEG))).exists());
        // the requested file's marker is the server's business
        assert!(status.join(format!("{first}{READY_SUFFIX}")).exists());
        Ok(())
    }

    #[tokio::test]
    async fn failed_extra_member_is_a_warning() -> anyhow::Result<()> {
        let s = setup()?;
        let first = write_segment(&s, 1, 1, false)?;
        let broken = XLogFileName(1, 2, SEG);
        // marked ready, but the file is gone
        std::fs::write(
            s.pg_wal.join(ARCHIVE_STATUS_DIR).join(format!("{broken}{READY_SUFFIX}")),
            b"",
        )?;
        let summary = push(
            &s.store,
            &s.pg_wal,
            &first,
            &PushOptions {
                batch_size: 2,
                ..opts()
            },
        )
        .await?;
        assert_eq!(summary.pushed, [first]);
        assert_eq!(summary.failed, [broken.clone()]);
        assert!(
            s.pg_wal
                .join(ARCHIVE_STATUS_DIR)
                .join(format!("{broken}{READY_SUFFIX}"))
                .exists()
        );
        Ok(())
    }

    #[tokio::test]
    async fn stale_part_file_is_taken_over() -> anyhow::Result<()> {
        let s = setup()?;
        let name = write_segment(&s, 9, 3, false)?;
        let part = s.store.part_path(&name);
        let leftover = std::fs::File::create(&part)?;
        leftover.set_modified(SystemTime::now() - Duration::from_secs(3600))?;
        drop(leftover);

        let summary = push(
            &s.store,
            &s.pg_wal,
            &name,
            &PushOptions {
                part_timeout: Duration::from_secs(60),
                ..opts()
            },
        )
        .await?;
        assert_eq!(summary.pushed, [name.clone()]);
        assert!(!part.exists());
        assert_eq!(std::fs::read(s.store.path_of(&name, false))?.len(), SEG);
        Ok(())
    }

    #[tokio::test]
    async fn dry_run_writes_nothing() -> anyhow::Result<()> {
        let s = setup()?;
        let name = write_segment(&s, 1, 1, false)?;
        let summary = push(
            &s.store,
            &s.pg_wal,
            &name,
            &PushOptions {
                dry_run: true,
                ..opts()
            },
        )
        .await?;
        assert!(summary.pushed.is_empty());
        assert!(s.store.list().await?.files.is_empty());
        assert!(s.store.list().await?.transients.is_empty());
        Ok(())
    }
}
