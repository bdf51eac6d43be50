//!
//! Relation data files are stored as page streams: a sequence of records
//!
//! ```text
//!   blkno            u32 LE
//!   compressed_size  i32 LE   (-1: the payload is a raw BLCKSZ page)
//!   payload          compressed_size bytes, or BLCKSZ
//! ```
//!
//! in ascending block order. An incremental backup stores only the blocks
//! that changed since its parent; the block count of the source file is kept
//! in the file list so that truncation can be replayed on restore.
//!
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};

use anyhow::{Context, bail};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use camino::Utf8Path;
use pg_xlog::page::{is_zeroed, page_lsn, verify_page};
use pg_xlog::relfile_utils::parse_relation_path;
use pg_xlog::{BLCKSZ, INIT_FORKNUM, MAIN_FORKNUM};
use tracing::warn;
use utils::lsn::Lsn;

use crate::compression::{self, CompressAlg};

/// `compressed_size` of a page stored without compression.
pub const RAW_PAGE: i32 = -1;

/// Files that are backed up page by page: main and init forks of
/// relations in the data directory.
pub fn is_relation_datafile(rel_path: &str) -> bool {
    parse_relation_path(rel_path)
        .is_some_and(|loc| loc.forknum == MAIN_FORKNUM || loc.forknum == INIT_FORKNUM)
}

/// One record of a page stream, payload as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPage {
    pub blkno: u32,
    pub compressed: bool,
    pub payload: Vec<u8>,
}

impl StoredPage {
    pub fn encode(alg: CompressAlg, level: u32, blkno: u32, page: &[u8]) -> anyhow::Result<StoredPage> {
        Ok(match compression::compress(alg, level, page)? {
            Some(payload) => StoredPage {
                blkno,
                compressed: true,
                payload,
            },
            None => StoredPage {
                blkno,
                compressed: false,
                payload: page.to_vec(),
            },
        })
    }

    /// The raw page.
    pub fn decode(&self, alg: CompressAlg) -> anyhow::Result<Vec<u8>> {
        if !self.compressed {
            return Ok(self.payload.clone());
        }
        compression::decompress(alg, &self.payload, BLCKSZ)
            .with_context(|| format!("failed to decompress block {}", self.blkno))
    }
}

/// Reads page stream records one at a time.
pub struct PageStreamReader<R> {
    inner: R,
    last_blkno: Option<u32>,
}

impl<R: Read> PageStreamReader<R> {
    pub fn new(inner: R) -> Self {
        PageStreamReader {
            inner,
            last_blkno: None,
        }
    }

    pub fn next_page(&mut self) -> anyhow::Result<Option<StoredPage>> {
        let blkno = match self.inner.read_u32::<LittleEndian>() {
            Ok(blkno) => blkno,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e).context("failed to read page header"),
        };
        let compressed_size = self
            .inner
            .read_i32::<LittleEndian>()
            .context("page stream is truncated")?;
        let (compressed, len) = match compressed_size {
            RAW_PAGE => (false, BLCKSZ),
            n if n > 0 && (n as usize) < BLCKSZ => (true, n as usize),
            n => bail!("block {blkno} has invalid compressed size {n}"),
        };
        if self.last_blkno.is_some_and(|last| blkno <= last) {
            bail!("page stream is not in block order at block {blkno}");
        }
        self.last_blkno = Some(blkno);
        let mut payload = vec![0u8; len];
        self.inner
            .read_exact(&mut payload)
            .with_context(|| format!("page stream is truncated at block {blkno}"))?;
        Ok(Some(StoredPage {
            blkno,
            compressed,
            payload,
        }))
    }
}

impl<R: Read> Iterator for PageStreamReader<R> {
    type Item = anyhow::Result<StoredPage>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_page().transpose()
    }
}

pub fn open_page_stream(path: &Utf8Path) -> anyhow::Result<PageStreamReader<BufReader<File>>> {
    let file = File::open(path).with_context(|| format!("failed to open page stream {path}"))?;
    Ok(PageStreamReader::new(BufReader::new(file)))
}

/// Writes page stream records and tracks the crc and size of what was written.
pub struct PageStreamWriter<W: Write> {
    inner: W,
    crc: u32,
    written: u64,
}

impl<W: Write> PageStreamWriter<W> {
    pub fn new(inner: W) -> Self {
        PageStreamWriter {
            inner,
            crc: 0,
            written: 0,
        }
    }

    pub fn write_stored(&mut self, page: &StoredPage) -> io::Result<()> {
        let mut header = [0u8; 8];
        let mut cursor = &mut header[..];
        cursor.write_u32::<LittleEndian>(page.blkno)?;
        cursor.write_i32::<LittleEndian>(if page.compressed {
            page.payload.len() as i32
        } else {
            RAW_PAGE
        })?;
        self.put(&header)?;
        self.put(&page.payload)
    }

    pub fn write_page(
        &mut self,
        alg: CompressAlg,
        level: u32,
        blkno: u32,
        page: &[u8],
    ) -> anyhow::Result<()> {
        let stored = StoredPage::encode(alg, level, blkno, page)?;
        self.write_stored(&stored)?;
        Ok(())
    }

    fn put(&mut self, buf: &[u8]) -> io::Result<()> {
        self.inner.write_all(buf)?;
        self.crc = crc32c::crc32c_append(self.crc, buf);
        self.written += buf.len() as u64;
        Ok(())
    }

    /// Returns the inner writer, the crc32c and the number of bytes written.
    pub fn finish(self) -> (W, u32, u64) {
        (self.inner, self.crc, self.written)
    }
}

/// Which blocks of a data file go into a backup.
#[derive(Debug, Clone, Copy)]
pub enum PageSelector<'a> {
    /// FULL backups, and files the parent backup does not have.
    All,
    /// DELTA: blocks whose page LSN is at or after `since`.
    Lsn { since: Lsn, parent_n_blocks: u32 },
    /// PAGE and PTRACK: blocks the server reported as changed.
    Map {
        blocks: &'a BTreeSet<u32>,
        parent_n_blocks: u32,
    },
}

impl PageSelector<'_> {
    fn wants(&self, blkno: u32, page: &[u8]) -> bool {
        match *self {
            PageSelector::All => true,
            PageSelector::Lsn {
                since,
                parent_n_blocks,
            } => blkno >= parent_n_blocks || (!is_zeroed(page) && page_lsn(page) >= since),
            PageSelector::Map {
                blocks,
                parent_n_blocks,
            } => blkno >= parent_n_blocks || blocks.contains(&blkno),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataFileBackup {
    pub n_blocks: u32,
    pub pages_written: u32,
    pub invalid_pages: u32,
    pub write_size: u64,
    pub crc: u32,
}

/// Copies the selected blocks of `src` into a page stream at `dst`.
pub fn backup_data_file(
    src: &Utf8Path,
    dst: &Utf8Path,
    alg: CompressAlg,
    level: u32,
    selector: PageSelector<'_>,
    no_sync: bool,
) -> anyhow::Result<DataFileBackup> {
    let mut reader = BufReader::new(
        File::open(src).with_context(|| format!("failed to open data file {src}"))?,
    );
    let out = File::create(dst).with_context(|| format!("failed to create {dst}"))?;
    let mut writer = PageStreamWriter::new(BufWriter::new(out));

    let mut page = vec![0u8; BLCKSZ];
    let mut blkno: u32 = 0;
    let mut pages_written = 0;
    let mut invalid_pages = 0;
    loop {
        match read_block(&mut reader, &mut page)
            .with_context(|| format!("failed to read block {blkno} of {src}"))?
        {
            0 => break,
            n if n < BLCKSZ => {
                // the file grew or shrank while we were reading, the rest is
                // covered by WAL replay
                warn!("data file {src} has a partial block {blkno} of {n} bytes, skipping it");
                break;
            }
            _ => {}
        }
        if let Err(e) = verify_page(&page) {
            warn!("Corruption detected in file {src}, block {blkno}: {e}");
            invalid_pages += 1;
        }
        if selector.wants(blkno, &page) {
            writer.write_page(alg, level, blkno, &page)?;
            pages_written += 1;
        }
        blkno += 1;
    }

    let (out, crc, write_size) = writer.finish();
    let file = out
        .into_inner()
        .map_err(|e| e.into_error())
        .with_context(|| format!("failed to flush {dst}"))?;
    if !no_sync {
        file.sync_all()
            .with_context(|| format!("failed to fsync {dst}"))?;
    }
    Ok(DataFileBackup {
        n_blocks: blkno,
        pages_written,
        invalid_pages,
        write_size,
        crc,
    })
}

/// Fills `page` as far as the file allows, returns the number of bytes read.
fn read_block(reader: &mut impl Read, page: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < page.len() {
        match reader.read(&mut page[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use pg_xlog::page::init_page;

    use super::*;

    fn page(lsn: u64, fill: u8) -> Vec<u8> {
        let mut page = vec![0u8; BLCKSZ];
        init_page(&mut page, Lsn(lsn));
        page[100..].fill(fill);
        page
    }

    fn write_relation(path: &Utf8Path, pages: &[Vec<u8>]) -> anyhow::Result<()> {
        std::fs::write(path, pages.concat())?;
        Ok(())
    }

    fn read_all(path: &Utf8Path, alg: CompressAlg) -> anyhow::Result<Vec<(u32, Vec<u8>)>> {
        open_page_stream(path)?
            .map(|p| {
                let p = p?;
                Ok((p.blkno, p.decode(alg)?))
            })
            .collect()
    }

    #[test]
    fn datafile_classification() {
        assert!(is_relation_datafile("base/16384/16385"));
        assert!(is_relation_datafile("base/16384/16385.3"));
        assert!(is_relation_datafile("base/16384/16385_init"));
        assert!(is_relation_datafile("global/1262"));
        assert!(is_relation_datafile("pg_tblspc/16400/PG_16_202307071/16384/16401"));
        assert!(!is_relation_datafile("base/16384/16385_fsm"));
        assert!(!is_relation_datafile("base/16384/16385_vm"));
        assert!(!is_relation_datafile("global/pg_control"));
        assert!(!is_relation_datafile("base/16384/PG_VERSION"));
        assert!(!is_relation_datafile("pg_xact/0000"));
    }

    #[test]
    fn full_backup_stores_every_block() -> anyhow::Result<()> {
        let dir = camino_tempfile::tempdir()?;
        let src = dir.path().join("16385");
        let dst = dir.path().join("16385.stream");
        let pages = vec![page(0x100, 1), page(0x200, 2), vec![0u8; BLCKSZ]];
        write_relation(&src, &pages)?;

        for alg in [CompressAlg::None, CompressAlg::Zlib, CompressAlg::Lz4, CompressAlg::Pglz] {
            let result = backup_data_file(&src, &dst, alg, 1, PageSelector::All, true)?;
            assert_eq!(result.n_blocks, 3);
            assert_eq!(result.pages_written, 3);
            assert_eq!(result.invalid_pages, 0);
            let stored = std::fs::read(&dst)?;
            assert_eq!(result.write_size, stored.len() as u64);
            assert_eq!(result.crc, crc32c::crc32c(&stored));

            let restored = read_all(&dst, alg)?;
            assert_eq!(restored.len(), 3);
            for (i, (blkno, data)) in restored.iter().enumerate() {
                assert_eq!(*blkno, i as u32);
                assert_eq!(data, &pages[i], "{alg} block {i}");
            }
        }
        Ok(())
    }

    #[test]
    fn delta_selects_by_lsn_and_new_blocks() -> anyhow::Result<()> {
        let dir = camino_tempfile::tempdir()?;
        let src = dir.path().join("16385");
        let dst = dir.path().join("16385.stream");
        write_relation(
            &src,
            &[page(0x100, 1), page(0x900, 2), page(0x100, 3), page(0x50, 4)],
        )?;

        let result = backup_data_file(
            &src,
            &dst,
            CompressAlg::None,
            0,
            PageSelector::Lsn {
                since: Lsn(0x800),
                parent_n_blocks: 3,
            },
            true,
        )?;
        assert_eq!(result.n_blocks, 4);
        let blocks: Vec<u32> = read_all(&dst, CompressAlg::None)?.iter().map(|p| p.0).collect();
        // block 1 changed, block 3 is beyond the parent's end
        assert_eq!(blocks, [1, 3]);

        let changed = BTreeSet::from([0]);
        backup_data_file(
            &src,
            &dst,
            CompressAlg::None,
            0,
            PageSelector::Map {
                blocks: &changed,
                parent_n_blocks: 4,
            },
            true,
        )?;
        let blocks: Vec<u32> = read_all(&dst, CompressAlg::None)?.iter().map(|p| p.0).collect();
        assert_eq!(blocks, [0]);
        Ok(())
    }

    #[test]
    fn invalid_pages_are_counted_and_kept() -> anyhow::Result<()> {
        let dir = camino_tempfile::tempdir()?;
        let src = dir.path().join("16385");
        let dst = dir.path().join("16385.stream");
        let mut bad = page(0x100, 1);
        bad[12] = 0xff; // pd_lower
        bad[13] = 0xff;
        write_relation(&src, &[page(0x100, 1), bad.clone()])?;

        let result = backup_data_file(&src, &dst, CompressAlg::None, 0, PageSelector::All, true)?;
        assert_eq!(result.invalid_pages, 1);
        assert_eq!(read_all(&dst, CompressAlg::None)?[1].1, bad);
        Ok(())
    }

    #[test]
    fn truncated_stream_is_an_error() -> anyhow::Result<()> {
        let dir = camino_tempfile::tempdir()?;
        let src = dir.path().join("16385");
        let dst = dir.path().join("16385.stream");
        write_relation(&src, &[page(0x100, 1), page(0x100, 2)])?;
        backup_data_file(&src, &dst, CompressAlg::None, 0, PageSelector::All, true)?;

        let stored = std::fs::read(&dst)?;
        std::fs::write(&dst, &stored[..stored.len() - 10])?;
        let err = read_all(&dst, CompressAlg::None).unwrap_err();
        assert!(format!("{err:#}").contains("truncated at block 1"), "{err:#}");
        Ok(())
    }
}
