//! Reconstruction of files from an incremental chain.
//!
//! A [`ChainView`] holds the file lists of a chain, newest backup first.
//! For every entry of the newest backup, [`ChainView::plan`] works out which
//! backups contribute to the file:
//!
//! * a non-data file comes whole from the newest backup that stored it;
//! * a data file is the union of the page streams of every backup down to
//!   the FULL one, newest page wins, cut to the newest block count.
//!
//! The walk stops at the first backup that does not list the file. A file
//! that was dropped and created again is rebuilt only from the backups
//! taken after it reappeared.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use pg_xlog::BLCKSZ;
use pg_xlog::page::{is_zeroed, page_lsn};

use crate::catalog::{BackupInfo, Catalog};
use crate::compression::{self, CompressAlg};
use crate::content::FileEntry;
use crate::datafile::{StoredPage, open_page_stream};
use crate::error::ArchivistError;

/// File lists of a chain, newest backup first.
pub struct ChainView {
    pub backups: Vec<BackupInfo>,
    pub dirs: Vec<Utf8PathBuf>,
    pub contents: Vec<Vec<FileEntry>>,
    index: Vec<HashMap<(u32, String), usize>>,
}

/// A contribution of one backup of the chain to a file.
#[derive(Debug, Clone, Copy)]
pub struct Layer<'a> {
    /// Position in the chain, 0 is the newest backup.
    pub pos: usize,
    pub entry: &'a FileEntry,
}

#[derive(Debug)]
pub enum FilePlan<'a> {
    Dir(&'a FileEntry),
    /// The file is copied as stored in `source`.
    Whole {
        newest: &'a FileEntry,
        source: Layer<'a>,
    },
    /// Page layers newest first; blocks none of them has come from `base`,
    /// a whole copy stored while the file was not a data file.
    Pages {
        newest: &'a FileEntry,
        layers: Vec<Layer<'a>>,
        base: Option<Layer<'a>>,
    },
}

impl<'a> FilePlan<'a> {
    pub fn newest(&self) -> &'a FileEntry {
        match self {
            FilePlan::Dir(e) => e,
            FilePlan::Whole { newest, .. } | FilePlan::Pages { newest, .. } => newest,
        }
    }

    /// The only backup the file's content comes from, if it is a single one.
    pub fn single_source(&self) -> Option<Layer<'a>> {
        match self {
            FilePlan::Whole { source, .. } => Some(*source),
            FilePlan::Pages {
                newest,
                layers,
                base: None,
            } if layers.len() == 1 && layers[0].entry.n_blocks == newest.n_blocks => {
                Some(layers[0])
            }
            _ => None,
        }
    }
}

impl ChainView {
    pub fn load(catalog: &Catalog, chain: &[&BackupInfo]) -> anyhow::Result<ChainView> {
        let dirs = chain.iter().map(|b| catalog.backup_dir(b.id)).collect();
        let contents = chain
            .iter()
            .map(|b| catalog.read_content(b.id))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(ChainView::new(
            chain.iter().map(|b| (*b).clone()).collect(),
            dirs,
            contents,
        ))
    }

    pub fn new(
        backups: Vec<BackupInfo>,
        dirs: Vec<Utf8PathBuf>,
        contents: Vec<Vec<FileEntry>>,
    ) -> ChainView {
        let index = contents
            .iter()
            .map(|entries| {
                entries
                    .iter()
                    .enumerate()
                    .map(|(i, e)| ((e.external_dir_num, e.path.clone()), i))
                    .collect()
            })
            .collect();
        ChainView {
            backups,
            dirs,
            contents,
            index,
        }
    }

    pub fn newest_entries(&self) -> &[FileEntry] {
        &self.contents[0]
    }

    pub fn lookup(&self, pos: usize, key: (u32, &str)) -> Option<&FileEntry> {
        self.index[pos]
            .get(&(key.0, key.1.to_string()))
            .map(|&i| &self.contents[pos][i])
    }

    pub fn stored_path(&self, layer: &Layer) -> Utf8PathBuf {
        layer.entry.stored_path(&self.dirs[layer.pos])
    }

    pub fn plan(&self) -> anyhow::Result<Vec<FilePlan<'_>>> {
        self.newest_entries()
            .iter()
            .map(|e| self.plan_file(e))
            .collect()
    }

    pub fn plan_file<'s>(&'s self, newest: &'s FileEntry) -> anyhow::Result<FilePlan<'s>> {
        if newest.is_dir() {
            return Ok(FilePlan::Dir(newest));
        }
        let key = newest.key();
        let mut layers = Vec::new();
        for pos in 0..self.backups.len() {
            let Some(entry) = self.lookup(pos, key) else {
                break;
            };
            if entry.is_datafile {
                if entry.is_unchanged() {
                    continue;
                }
                layers.push(Layer { pos, entry });
                if self.backups[pos].is_full() {
                    break;
                }
                continue;
            }
            if entry.is_unchanged() {
                continue;
            }
            let source = Layer { pos, entry };
            if newest.is_datafile {
                return Ok(FilePlan::Pages {
                    newest,
                    layers,
                    base: Some(source),
                });
            }
            return Ok(FilePlan::Whole { newest, source });
        }
        if newest.is_datafile {
            return Ok(FilePlan::Pages {
                newest,
                layers,
                base: None,
            });
        }
        Err(ArchivistError::Corrupt(format!(
            "file {} of backup {} is marked unchanged, but no older backup in the chain stores it",
            newest.path, self.backups[0].id
        ))
        .into())
    }

    /// Raw content of a file stored whole.
    pub fn read_whole(&self, layer: &Layer) -> anyhow::Result<Vec<u8>> {
        let path = self.stored_path(layer);
        let stored = std::fs::read(&path).with_context(|| format!("failed to read {path}"))?;
        if layer.entry.compress_alg == CompressAlg::None {
            return Ok(stored);
        }
        compression::decompress(layer.entry.compress_alg, &stored, layer.entry.size as usize)
            .with_context(|| format!("failed to decompress {path}"))
    }

    /// Pages of a data file plan with the codec of the layer they come
    /// from, in block order.
    pub fn collect_pages(
        &self,
        plan: &FilePlan,
    ) -> anyhow::Result<BTreeMap<u32, (CompressAlg, StoredPage)>> {
        let FilePlan::Pages {
            newest,
            layers,
            base,
        } = plan
        else {
            anyhow::bail!("{} is not reconstructed page by page", plan.newest().path);
        };
        let n_blocks = newest.n_blocks.unwrap_or(0);
        let mut pages = BTreeMap::new();
        for layer in layers {
            let path = self.stored_path(layer);
            for page in open_page_stream(&path)? {
                let page = page.with_context(|| format!("failed to read page stream {path}"))?;
                if page.blkno < n_blocks && !pages.contains_key(&page.blkno) {
                    pages.insert(page.blkno, (layer.entry.compress_alg, page));
                }
            }
        }
        if let Some(base) = base {
            let data = self.read_whole(base)?;
            for (blkno, chunk) in data.chunks(BLCKSZ).enumerate() {
                let blkno = blkno as u32;
                if blkno >= n_blocks || pages.contains_key(&blkno) {
                    continue;
                }
                let mut page = chunk.to_vec();
                page.resize(BLCKSZ, 0);
                pages.insert(
                    blkno,
                    (
                        CompressAlg::None,
                        StoredPage {
                            blkno,
                            compressed: false,
                            payload: page,
                        },
                    ),
                );
            }
        }
        Ok(pages)
    }
}

/// How an incremental restore decides that a block already in place is
/// current.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::EnumString, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum IncrementalMode {
    /// The existing page is byte-identical.
    Checksum,
    /// The existing page carries the same page LSN.
    Lsn,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MaterializeStats {
    pub blocks_written: u32,
    pub blocks_skipped: u32,
}

/// Writes the raw content of a data file plan into `dst`. With
/// `incremental` set, `dst` is updated in place and blocks that are already
/// current are left alone.
pub fn materialize_pages(
    view: &ChainView,
    plan: &FilePlan,
    dst: &Utf8Path,
    incremental: Option<IncrementalMode>,
    no_sync: bool,
) -> anyhow::Result<MaterializeStats> {
    let FilePlan::Pages {
        newest,
        layers,
        base,
    } = plan
    else {
        anyhow::bail!("{} is not reconstructed page by page", plan.newest().path);
    };
    let n_blocks = newest.n_blocks.unwrap_or(0);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(incremental.is_none())
        .open(dst)
        .with_context(|| format!("failed to open {dst}"))?;
    let existing_len = file.metadata()?.len();

    let mut stats = MaterializeStats::default();
    let mut done: HashSet<u32> = HashSet::new();
    let mut existing = vec![0u8; BLCKSZ];
    let mut put = |blkno: u32, page: &[u8], stats: &mut MaterializeStats| -> anyhow::Result<()> {
        let offset = blkno as u64 * BLCKSZ as u64;
        if let Some(mode) = incremental {
            if offset + BLCKSZ as u64 <= existing_len {
                file.read_exact_at(&mut existing, offset)
                    .with_context(|| format!("failed to read block {blkno} of {dst}"))?;
                if block_is_current(mode, &existing, page) {
                    stats.blocks_skipped += 1;
                    return Ok(());
                }
            }
        }
        file.write_all_at(page, offset)
            .with_context(|| format!("failed to write block {blkno} of {dst}"))?;
        stats.blocks_written += 1;
        Ok(())
    };

    for layer in layers {
        let path = view.stored_path(layer);
        for page in open_page_stream(&path)? {
            let page = page.with_context(|| format!("failed to read page stream {path}"))?;
            if page.blkno >= n_blocks || !done.insert(page.blkno) {
                continue;
            }
            let raw = page.decode(layer.entry.compress_alg)?;
            put(page.blkno, &raw, &mut stats)?;
        }
    }
    if let Some(base) = base {
        let data = view.read_whole(base)?;
        for (blkno, chunk) in data.chunks(BLCKSZ).enumerate() {
            let blkno = blkno as u32;
            if blkno >= n_blocks || done.contains(&blkno) {
                continue;
            }
            let mut page = chunk.to_vec();
            page.resize(BLCKSZ, 0);
            put(blkno, &page, &mut stats)?;
        }
    }
    drop(put);

    file.set_len(n_blocks as u64 * BLCKSZ as u64)
        .with_context(|| format!("failed to truncate {dst}"))?;
    if !no_sync {
        file.sync_all()
            .with_context(|| format!("failed to fsync {dst}"))?;
    }
    Ok(stats)
}

fn block_is_current(mode: IncrementalMode, existing: &[u8], page: &[u8]) -> bool {
    match mode {
        IncrementalMode::Checksum => existing == page,
        IncrementalMode::Lsn => {
            !is_zeroed(existing) && page_lsn(existing) == page_lsn(page)
        }
    }
}

/// Writes the raw content of a whole-file plan into `dst`.
pub fn materialize_whole(
    view: &ChainView,
    source: &Layer,
    dst: &Utf8Path,
    no_sync: bool,
) -> anyhow::Result<()> {
    let data = view.read_whole(source)?;
    let mut file = File::create(dst).with_context(|| format!("failed to create {dst}"))?;
    std::io::Write::write_all(&mut file, &data).with_context(|| format!("failed to write {dst}"))?;
    if !no_sync {
        file.sync_all()
            .with_context(|| format!("failed to fsync {dst}"))?;
    }
    Ok(())
}
