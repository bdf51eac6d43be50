//! The file list of a backup (`backup_content.control`): one JSON object
//! per line, one line per file or directory.

use std::io::{BufRead, BufReader, Write};

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use utils::crashsafe::{overwrite_with_sync, path_with_suffix_extension};

use crate::compression::CompressAlg;

pub const DATABASE_DIR: &str = "database";
pub const EXTERNAL_DIR: &str = "external_directories";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Dir,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FileEntry {
    /// Path relative to the data directory (or external directory), `/`-separated.
    pub path: String,
    pub kind: FileKind,
    /// 0 for the data directory, N for the N-th external directory.
    #[serde(default)]
    pub external_dir_num: u32,
    pub mode: u32,
    /// Size of the source file.
    pub size: u64,
    /// Bytes stored in this backup. `None` means the file is unchanged since
    /// the parent backup and nothing was stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_size: Option<u64>,
    /// crc32c of the stored bytes.
    #[serde(default)]
    pub crc: u32,
    /// crc32c of the source bytes, for non-data files.
    #[serde(default)]
    pub content_crc: u32,
    #[serde(default)]
    pub compress_alg: CompressAlg,
    #[serde(default)]
    pub is_datafile: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_blocks: Option<u32>,
    #[serde(default)]
    pub db_oid: u32,
    /// Target of a tablespace symlink under `pg_tblspc`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_target: Option<Utf8PathBuf>,
}

impl FileEntry {
    pub fn dir(path: impl Into<String>, external_dir_num: u32, mode: u32) -> FileEntry {
        FileEntry {
            path: path.into(),
            kind: FileKind::Dir,
            external_dir_num,
            mode,
            size: 0,
            write_size: Some(0),
            crc: 0,
            content_crc: 0,
            compress_alg: CompressAlg::None,
            is_datafile: false,
            n_blocks: None,
            db_oid: 0,
            link_target: None,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Dir
    }

    /// Nothing stored here, the content lives in an older backup.
    pub fn is_unchanged(&self) -> bool {
        self.write_size.is_none()
    }

    /// Entries are identified by (external dir, path).
    pub fn key(&self) -> (u32, &str) {
        (self.external_dir_num, self.path.as_str())
    }

    /// Where the stored bytes of this entry live inside `backup_dir`.
    pub fn stored_path(&self, backup_dir: &Utf8Path) -> Utf8PathBuf {
        stored_path(backup_dir, self.external_dir_num, &self.path)
    }
}

pub fn stored_path(backup_dir: &Utf8Path, external_dir_num: u32, path: &str) -> Utf8PathBuf {
    if external_dir_num == 0 {
        backup_dir.join(DATABASE_DIR).join(path)
    } else {
        backup_dir
            .join(EXTERNAL_DIR)
            .join(format!("externaldir{external_dir_num}"))
            .join(path)
    }
}

pub fn read_content(path: &Utf8Path) -> anyhow::Result<Vec<FileEntry>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open file list at {path}"))?;
    let mut entries = Vec::new();
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("failed to read file list at {path}"))?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: FileEntry = serde_json::from_str(&line)
            .with_context(|| format!("invalid entry at {path}:{}", lineno + 1))?;
        entries.push(entry);
    }
    Ok(entries)
}

pub fn write_content(path: &Utf8Path, entries: &[FileEntry], no_sync: bool) -> anyhow::Result<()> {
    let mut buf = Vec::new();
    for entry in entries {
        serde_json::to_writer(&mut buf, entry).context("failed to serialize file entry")?;
        buf.write_all(b"\n")?;
    }
    overwrite_with_sync(path, &path_with_suffix_extension(path, "tmp"), &buf, !no_sync)
        .with_context(|| format!("failed to write file list at {path}"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseEntry {
    pub oid: u32,
    pub name: String,
}

pub fn read_database_map(path: &Utf8Path) -> anyhow::Result<Vec<DatabaseEntry>> {
    match std::fs::read(path) {
        Ok(data) => serde_json::from_slice(&data)
            .with_context(|| format!("failed to parse database map at {path}")),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e).with_context(|| format!("failed to read database map at {path}")),
    }
}

pub fn write_database_map(
    path: &Utf8Path,
    map: &[DatabaseEntry],
    no_sync: bool,
) -> anyhow::Result<()> {
    let data = serde_json::to_vec_pretty(map).context("failed to serialize database map")?;
    overwrite_with_sync(path, &path_with_suffix_extension(path, "tmp"), &data, !no_sync)
        .with_context(|| format!("failed to write database map at {path}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_file_roundtrip() -> anyhow::Result<()> {
        let dir = camino_tempfile::tempdir()?;
        let path = dir.path().join("backup_content.control");
        let entries = vec![
            FileEntry::dir("base", 0, 0o700),
            FileEntry {
                path: "base/16384/16385".into(),
                kind: FileKind::File,
                external_dir_num: 0,
                mode: 0o600,
                size: 16384,
                write_size: Some(8200),
                crc: 0xdeadbeef,
                content_crc: 0,
                compress_alg: CompressAlg::Lz4,
                is_datafile: true,
                n_blocks: Some(2),
                db_oid: 16384,
                link_target: None,
            },
        ];
        write_content(&path, &entries, true)?;
        let text = std::fs::read_to_string(&path)?;
        assert_eq!(text.lines().count(), 2);
        assert!(text.contains("\"external-dir-num\":0"), "{text}");
        assert_eq!(read_content(&path)?, entries);
        Ok(())
    }

    #[test]
    fn stored_paths() {
        let backup = Utf8Path::new("/b/S2KX0Q");
        assert_eq!(
            stored_path(backup, 0, "global/pg_control"),
            "/b/S2KX0Q/database/global/pg_control"
        );
        assert_eq!(
            stored_path(backup, 2, "conf/a.conf"),
            "/b/S2KX0Q/external_directories/externaldir2/conf/a.conf"
        );
    }
}
