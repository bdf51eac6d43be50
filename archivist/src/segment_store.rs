//! The WAL archive of one instance: a flat directory of segments, partial
//! segments, timeline history files and backup history labels, each stored
//! plain or gzip-compressed.
//!
//! In-flight writes live next to their final name as `<name>.part` (push)
//! or `<name>~tmp<pid>` (fetch); they are never considered archived.

use std::collections::HashMap;
use std::io;
use std::time::SystemTime;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use pg_xlog::xlog_utils::{PARTIAL_SUFFIX, TLHistoryFileName, XLogFileKind};
use pg_xlog::{TimeLineID, XLogSegNo};
use tracing::{info, warn};
use utils::fs_ext::ignore_not_found;

use crate::compression;

pub const GZ_SUFFIX: &str = ".gz";
pub const PART_SUFFIX: &str = ".part";
pub const TMP_MARKER: &str = "~tmp";

/// An archived (non-transient) file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedFile {
    /// Logical name, without the compression suffix.
    pub name: String,
    pub kind: XLogFileKind,
    pub compressed: bool,
    /// Size on disk.
    pub size: u64,
}

impl ArchivedFile {
    /// Name of the file on disk.
    pub fn file_name(&self) -> String {
        if self.compressed {
            format!("{}{GZ_SUFFIX}", self.name)
        } else {
            self.name.clone()
        }
    }
}

/// A write in progress, or the leftover of one that was interrupted.
#[derive(Debug, Clone)]
pub struct TransientFile {
    pub file_name: String,
    pub modified: SystemTime,
}

#[derive(Debug, Default)]
pub struct StoreListing {
    pub files: Vec<ArchivedFile>,
    pub transients: Vec<TransientFile>,
    /// Names the archive does not recognize. Left alone.
    pub unknown: Vec<String>,
}

impl StoreListing {
    pub fn history_tlis(&self) -> impl Iterator<Item = TimeLineID> + '_ {
        self.files.iter().filter_map(|f| match f.kind {
            XLogFileKind::History { tli } => Some(tli),
            _ => None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SegmentStore {
    dir: Utf8PathBuf,
    wal_seg_size: usize,
    no_sync: bool,
}

impl SegmentStore {
    pub fn new(dir: impl Into<Utf8PathBuf>, wal_seg_size: usize, no_sync: bool) -> SegmentStore {
        SegmentStore {
            dir: dir.into(),
            wal_seg_size,
            no_sync,
        }
    }

    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    pub fn wal_seg_size(&self) -> usize {
        self.wal_seg_size
    }

    pub fn no_sync(&self) -> bool {
        self.no_sync
    }

    pub fn segment_name(&self, tli: TimeLineID, segno: XLogSegNo) -> String {
        pg_xlog::xlog_utils::XLogFileName(tli, segno, self.wal_seg_size)
    }

    pub fn path_of(&self, name: &str, compressed: bool) -> Utf8PathBuf {
        if compressed {
            self.dir.join(format!("{name}{GZ_SUFFIX}"))
        } else {
            self.dir.join(name)
        }
    }

    /// `.part` file that a push of `file_name` (on-disk name) writes into.
    pub fn part_path(&self, file_name: &str) -> Utf8PathBuf {
        self.dir.join(format!("{file_name}{PART_SUFFIX}"))
    }

    pub fn classify(&self, file_name: &str) -> Option<(String, XLogFileKind, bool)> {
        let (name, compressed) = match file_name.strip_suffix(GZ_SUFFIX) {
            Some(name) => (name, true),
            None => (file_name, false),
        };
        let kind = XLogFileKind::parse(name, self.wal_seg_size)?;
        Some((name.to_string(), kind, compressed))
    }

    pub async fn list(&self) -> anyhow::Result<StoreListing> {
        let mut listing = StoreListing::default();
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(listing),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to list WAL archive {}", self.dir));
            }
        };
        while let Some(entry) = dir
            .next_entry()
            .await
            .with_context(|| format!("failed to list WAL archive {}", self.dir))?
        {
            let Ok(file_name) = entry.file_name().into_string() else {
                continue;
            };
            let metadata = match entry.metadata().await {
                Ok(m) => m,
                // removed concurrently
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e).with_context(|| format!("failed to stat {file_name}")),
            };
            if !metadata.is_file() {
                continue;
            }
            if file_name.ends_with(PART_SUFFIX) || file_name.contains(TMP_MARKER) {
                listing.transients.push(TransientFile {
                    file_name,
                    modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                });
                continue;
            }
            match self.classify(&file_name) {
                Some((name, kind, compressed)) => listing.files.push(ArchivedFile {
                    name,
                    kind,
                    compressed,
                    size: metadata.len(),
                }),
                None => listing.unknown.push(file_name),
            }
        }
        listing.files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(listing)
    }

    /// Looks up the archived representation of `name`: plain first, then gzip.
    pub async fn find(&self, name: &str) -> anyhow::Result<Option<ArchivedFile>> {
        let Some(kind) = XLogFileKind::parse(name, self.wal_seg_size) else {
            anyhow::bail!("invalid WAL file name {name}");
        };
        for compressed in [false, true] {
            let path = self.path_of(name, compressed);
            match tokio::fs::metadata(&path).await {
                Ok(m) => {
                    return Ok(Some(ArchivedFile {
                        name: name.to_string(),
                        kind,
                        compressed,
                        size: m.len(),
                    }));
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).with_context(|| format!("failed to stat {path}")),
            }
        }
        Ok(None)
    }

    /// Lookup used to serve a recovering server: for a segment, a partial
    /// segment of the same name is accepted when the full one is missing.
    pub async fn find_for_restore(&self, name: &str) -> anyhow::Result<Option<ArchivedFile>> {
        if let Some(file) = self.find(name).await? {
            return Ok(Some(file));
        }
        match XLogFileKind::parse(name, self.wal_seg_size) {
            Some(XLogFileKind::Segment { .. }) => {
                self.find(&format!("{name}{PARTIAL_SUFFIX}")).await
            }
            _ => Ok(None),
        }
    }

    /// Reads and, if needed, decompresses an archived file.
    pub async fn read(&self, file: &ArchivedFile) -> anyhow::Result<Vec<u8>> {
        let path = self.dir.join(file.file_name());
        let data = tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read archived file {path}"))?;
        if file.compressed {
            tokio::task::spawn_blocking(move || compression::gunzip(&data))
                .await?
                .with_context(|| format!("failed to decompress {path}"))
        } else {
            Ok(data)
        }
    }

    /// Contents of every readable timeline history file.
    pub async fn read_histories(
        &self,
        listing: &StoreListing,
    ) -> anyhow::Result<HashMap<TimeLineID, String>> {
        let mut histories = HashMap::new();
        for file in &listing.files {
            let XLogFileKind::History { tli } = file.kind else {
                continue;
            };
            match self.read(file).await {
                Ok(data) => {
                    histories.insert(tli, String::from_utf8_lossy(&data).into_owned());
                }
                Err(e) => warn!("failed to read history file {}: {e:#}", file.name),
            }
        }
        Ok(histories)
    }

    pub async fn read_history(&self, tli: TimeLineID) -> anyhow::Result<Option<String>> {
        match self.find(&TLHistoryFileName(tli)).await? {
            Some(file) => Ok(Some(
                String::from_utf8_lossy(&self.read(&file).await?).into_owned(),
            )),
            None => Ok(None),
        }
    }

    pub async fn remove(&self, file: &ArchivedFile) -> anyhow::Result<()> {
        self.remove_file_name(&file.file_name()).await
    }

    pub async fn remove_file_name(&self, file_name: &str) -> anyhow::Result<()> {
        let path = self.dir.join(file_name);
        tokio::fs::remove_file(&path)
            .await
            .or_else(ignore_not_found)
            .with_context(|| format!("failed to remove {path}"))?;
        info!("removed WAL file {file_name}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pg_xlog::DEFAULT_WAL_SEG_SIZE;

    use super::*;

    #[tokio::test]
    async fn list_classifies_files() -> anyhow::Result<()> {
        let dir = camino_tempfile::tempdir()?;
        let store = SegmentStore::new(dir.path(), DEFAULT_WAL_SEG_SIZE, true);
        for name in [
            "000000010000000000000001",
            "000000010000000000000002.gz",
            "000000010000000000000003.partial",
            "00000002.history",
            "000000010000000000000004.part",
            "000000010000000000000004.gz.part",
            "000000010000000000000005~tmp123",
            "README",
        ] {
            std::fs::write(dir.path().join(name), b"x")?;
        }
        let listing = store.list().await?;
        let names: Vec<_> = listing.files.iter().map(|f| f.file_name()).collect();
        assert_eq!(
            names,
            [
                "000000010000000000000001",
                "000000010000000000000002.gz",
                "000000010000000000000003.partial",
                "00000002.history",
            ]
        );
        assert_eq!(listing.transients.len(), 3);
        assert_eq!(listing.unknown, ["README"]);
        assert_eq!(listing.history_tlis().collect::<Vec<_>>(), [2]);
        Ok(())
    }

    #[tokio::test]
    async fn find_prefers_plain_and_falls_back_to_partial() -> anyhow::Result<()> {
        let dir = camino_tempfile::tempdir()?;
        let store = SegmentStore::new(dir.path(), DEFAULT_WAL_SEG_SIZE, true);
        let name = "000000010000000000000007";

        assert!(store.find(name).await?.is_none());

        std::fs::write(
            dir.path().join(format!("{name}.partial.gz")),
            compression::gzip(b"partial", 1)?,
        )?;
        let file = store.find_for_restore(name).await?.unwrap();
        assert_eq!(file.file_name(), format!("{name}.partial.gz"));
        assert_eq!(store.read(&file).await?, b"partial");

        std::fs::write(dir.path().join(format!("{name}.gz")), compression::gzip(b"gz", 1)?)?;
        std::fs::write(dir.path().join(name), b"plain")?;
        let file = store.find_for_restore(name).await?.unwrap();
        assert!(!file.compressed);
        assert_eq!(store.read(&file).await?, b"plain");

        assert!(store.find("garbage").await.is_err());
        Ok(())
    }
}
