//! `archive-get`: serves archived WAL back to a recovering server.
//!
//! With `batch_size > 1` the segments following the requested one are
//! staged into a prefetch directory while the requested one is served, so
//! that the next calls are answered from local disk. Every prefetched
//! segment has a `.crc` sidecar and is validated again before it is used.

use std::time::Duration;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use futures::StreamExt;
use pg_xlog::xlog_utils::XLogFileKind;
use pg_xlog::{TimeLineID, XLogSegNo};
use tracing::{debug, info, instrument, warn};
use utils::backoff::poll_until;
use utils::crashsafe::durable_rename;
use utils::fs_ext::ignore_not_found;

use crate::defaults::DEFAULT_WAIT_TIMEOUT;
use crate::error::ArchivistError;
use crate::segment_store::{SegmentStore, TMP_MARKER};

pub const PREFETCH_DIR_NAME: &str = "pbk_prefetch";
pub const CRC_SUFFIX: &str = ".crc";

#[derive(Debug, Clone)]
pub struct GetOptions {
    pub batch_size: usize,
    pub threads: usize,
    /// Defaults to `pbk_prefetch` next to the destination.
    pub prefetch_dir: Option<Utf8PathBuf>,
    /// How long to wait for a missing segment to show up.
    pub wait_timeout: Duration,
    pub dry_run: bool,
    pub no_sync: bool,
}

impl Default for GetOptions {
    fn default() -> Self {
        GetOptions {
            batch_size: 1,
            threads: 1,
            prefetch_dir: None,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            dry_run: false,
            no_sync: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Served {
    Prefetch,
    Archive,
    DryRun,
}

#[instrument(skip_all, fields(file = %wal_file_name))]
pub async fn get(
    store: &SegmentStore,
    wal_file_name: &str,
    dest_path: &Utf8Path,
    opts: &GetOptions,
) -> anyhow::Result<Served> {
    let kind = XLogFileKind::parse(wal_file_name, store.wal_seg_size())
        .ok_or_else(|| anyhow::anyhow!("{wal_file_name} is not a WAL file name"))?;

    let prefetch = match kind {
        XLogFileKind::Segment { tli, segno } if opts.batch_size > 1 && !opts.dry_run => {
            let dir = match &opts.prefetch_dir {
                Some(dir) => dir.clone(),
                None => dest_path
                    .parent()
                    .unwrap_or(Utf8Path::new("."))
                    .join(PREFETCH_DIR_NAME),
            };
            Some((dir, tli, segno))
        }
        _ => None,
    };

    if let Some((dir, tli, segno)) = &prefetch {
        if let Some(data) = take_prefetched(dir, wal_file_name, store.wal_seg_size()).await? {
            write_dest(dest_path, &data, opts.no_sync).await?;
            info!("WAL file {wal_file_name} served from prefetch directory");
            run_prefetch(store, dir, *tli, *segno, opts).await;
            return Ok(Served::Prefetch);
        }
    }

    let serve = serve_from_archive(store, wal_file_name, kind, dest_path, opts);
    let served = match &prefetch {
        Some((dir, tli, segno)) => {
            let (served, ()) = tokio::join!(serve, run_prefetch(store, dir, *tli, *segno, opts));
            served?
        }
        None => serve.await?,
    };
    Ok(served)
}

async fn serve_from_archive(
    store: &SegmentStore,
    name: &str,
    kind: XLogFileKind,
    dest_path: &Utf8Path,
    opts: &GetOptions,
) -> anyhow::Result<Served> {
    // only segments can still be in flight, a missing history file means
    // the timeline simply does not exist
    let wait = if kind.is_full_segment() {
        opts.wait_timeout
    } else {
        Duration::ZERO
    };
    let found = poll_until(wait, || store.find_for_restore(name)).await?;
    let Some(file) = found else {
        if wait.is_zero() {
            return Err(ArchivistError::WalAbsent(name.to_string()).into());
        }
        return Err(ArchivistError::WalTimeout {
            name: name.to_string(),
            timeout: wait.into(),
        }
        .into());
    };
    let data = store.read(&file).await?;
    if opts.dry_run {
        info!("dry run: would copy {} to {dest_path}", file.file_name());
        return Ok(Served::DryRun);
    }
    write_dest(dest_path, &data, opts.no_sync).await?;
    info!("WAL file {} copied to {dest_path}", file.file_name());
    Ok(Served::Archive)
}

/// Writes through `<dest>~tmp<pid>` so the server never sees a torn file.
async fn write_dest(dest_path: &Utf8Path, data: &[u8], no_sync: bool) -> anyhow::Result<()> {
    let tmp = Utf8PathBuf::from(format!("{dest_path}{TMP_MARKER}{}", std::process::id()));
    let result = async {
        tokio::fs::write(&tmp, data)
            .await
            .with_context(|| format!("failed to write {tmp}"))?;
        durable_rename(&tmp, dest_path, !no_sync)
            .await
            .with_context(|| format!("failed to rename {tmp} to {dest_path}"))
    }
    .await;
    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    result
}

/// Validated content of a prefetched segment, removed from the prefetch
/// directory. `None` if there is none or it failed validation.
async fn take_prefetched(
    dir: &Utf8Path,
    name: &str,
    wal_seg_size: usize,
) -> anyhow::Result<Option<Vec<u8>>> {
    let path = dir.join(name);
    let crc_path = dir.join(format!("{name}{CRC_SUFFIX}"));
    let data = match tokio::fs::read(&path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("failed to read {path}")),
    };
    let expected_crc = tokio::fs::read_to_string(&crc_path)
        .await
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok());
    let valid = data.len() == wal_seg_size && expected_crc == Some(crc32c::crc32c(&data));
    remove_prefetched(dir, name).await?;
    if !valid {
        warn!("Prefetched WAL segment {name} is invalid, cannot use it");
        return Ok(None);
    }
    Ok(Some(data))
}

async fn remove_prefetched(dir: &Utf8Path, name: &str) -> anyhow::Result<()> {
    for file in [name.to_string(), format!("{name}{CRC_SUFFIX}")] {
        let path = dir.join(file);
        tokio::fs::remove_file(&path)
            .await
            .or_else(ignore_not_found)
            .with_context(|| format!("failed to remove {path}"))?;
    }
    Ok(())
}

enum Prefetch {
    Present,
    Fetched(Vec<u8>),
    Absent,
}

/// Stages segments `segno + 1 .. segno + batch_size - 1`. Never fails, a
/// prefetch problem only costs a round trip to the archive later.
async fn run_prefetch(
    store: &SegmentStore,
    dir: &Utf8Path,
    tli: TimeLineID,
    segno: XLogSegNo,
    opts: &GetOptions,
) {
    if let Err(e) = prefetch(store, dir, tli, segno, opts).await {
        warn!("WAL prefetch failed: {e:#}");
    }
}

async fn prefetch(
    store: &SegmentStore,
    dir: &Utf8Path,
    tli: TimeLineID,
    segno: XLogSegNo,
    opts: &GetOptions,
) -> anyhow::Result<()> {
    utils::crashsafe::create_dir_all(dir)?;

    // anything at or before the requested segment has been consumed
    for file in utils::fs_ext::list_dir(dir).await? {
        let stem = file.strip_suffix(CRC_SUFFIX).unwrap_or(&file);
        let stale = file.contains(TMP_MARKER)
            || matches!(
                XLogFileKind::parse(stem, store.wal_seg_size()),
                Some(XLogFileKind::Segment { segno: s, .. }) if s <= segno
            );
        if stale {
            tokio::fs::remove_file(dir.join(&file))
                .await
                .or_else(ignore_not_found)
                .with_context(|| format!("failed to remove {dir}/{file}"))?;
        }
    }

    let last = segno + opts.batch_size as u64 - 1;
    let mut fetches = futures::stream::iter(segno + 1..=last)
        .map(|s| {
            let name = store.segment_name(tli, s);
            async move {
                let staged = tokio::fs::try_exists(dir.join(&name)).await.unwrap_or(false)
                    && tokio::fs::try_exists(dir.join(format!("{name}{CRC_SUFFIX}")))
                        .await
                        .unwrap_or(false);
                if staged {
                    return Ok::<_, anyhow::Error>((name, Prefetch::Present));
                }
                match store.find(&name).await? {
                    Some(file) => {
                        let data = store.read(&file).await?;
                        Ok((name, Prefetch::Fetched(data)))
                    }
                    None => Ok((name, Prefetch::Absent)),
                }
            }
        })
        .buffered(opts.threads.max(1));

    let mut staged = 0;
    while let Some(result) = fetches.next().await {
        let (name, fetched) = result?;
        let data = match fetched {
            Prefetch::Present => continue,
            Prefetch::Absent => {
                debug!("stopping prefetch at absent segment {name}");
                break;
            }
            Prefetch::Fetched(data) => data,
        };
        if data.len() != store.wal_seg_size() {
            warn!("archived segment {name} has size {}, not prefetching it", data.len());
            break;
        }
        let crc = crc32c::crc32c(&data);
        write_dest(&dir.join(&name), &data, opts.no_sync).await?;
        let crc_path = dir.join(format!("{name}{CRC_SUFFIX}"));
        write_dest(&crc_path, crc.to_string().as_bytes(), opts.no_sync).await?;
        staged += 1;
    }
    if staged > 0 {
        info!("prefetched {staged} WAL segments into {dir}");
    }
    Ok(())
}
