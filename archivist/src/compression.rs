//! Codecs for files stored in backups, and gzip for the WAL archive.

use std::io::{Read, Write};

use anyhow::{Context, bail};
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::pglz;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
    strum_macros::VariantNames,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CompressAlg {
    #[default]
    None,
    Zlib,
    Pglz,
    Lz4,
    Zstd,
}

impl CompressAlg {
    pub fn validate_level(self, level: u32) -> anyhow::Result<()> {
        let range = match self {
            CompressAlg::Zlib => 0..=9,
            CompressAlg::Zstd => 1..=22,
            CompressAlg::None | CompressAlg::Pglz | CompressAlg::Lz4 => return Ok(()),
        };
        if !range.contains(&level) {
            bail!(
                "compress-level {level} is out of range {}..={} for {self}",
                range.start(),
                range.end()
            );
        }
        Ok(())
    }
}

/// Compresses `data`. Returns `None` when the codec is `none` or the result
/// would not be smaller than the input; the caller then stores the raw bytes.
pub fn compress(alg: CompressAlg, level: u32, data: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
    let compressed = match alg {
        CompressAlg::None => return Ok(None),
        CompressAlg::Zlib => {
            let mut encoder =
                flate2::write::ZlibEncoder::new(Vec::new(), Compression::new(level.min(9)));
            encoder.write_all(data).context("zlib compression failed")?;
            encoder.finish().context("zlib compression failed")?
        }
        CompressAlg::Pglz => match pglz::compress(data) {
            Some(c) => c,
            None => return Ok(None),
        },
        CompressAlg::Lz4 => lz4_flex::compress_prepend_size(data),
        CompressAlg::Zstd => {
            zstd::encode_all(data, level as i32).context("zstd compression failed")?
        }
    };
    if compressed.len() >= data.len() {
        return Ok(None);
    }
    Ok(Some(compressed))
}

/// Inverse of [`compress`]. `raw_len` is the expected decompressed size.
pub fn decompress(alg: CompressAlg, data: &[u8], raw_len: usize) -> anyhow::Result<Vec<u8>> {
    let raw = match alg {
        CompressAlg::None => data.to_vec(),
        CompressAlg::Zlib => {
            let mut out = Vec::with_capacity(raw_len);
            flate2::read::ZlibDecoder::new(data)
                .read_to_end(&mut out)
                .context("zlib decompression failed")?;
            out
        }
        CompressAlg::Pglz => pglz::decompress(data, raw_len)?,
        CompressAlg::Lz4 => {
            lz4_flex::decompress_size_prepended(data).context("lz4 decompression failed")?
        }
        CompressAlg::Zstd => zstd::decode_all(data).context("zstd decompression failed")?,
    };
    if raw.len() != raw_len {
        bail!(
            "{alg} decompression produced {} bytes, expected {raw_len}",
            raw.len()
        );
    }
    Ok(raw)
}

/// Compresses a WAL file for the archive (`.gz`).
pub fn gzip(data: &[u8], level: u32) -> anyhow::Result<Vec<u8>> {
    let mut encoder = flate2::write::GzEncoder::new(
        Vec::with_capacity(data.len() / 4),
        Compression::new(level.min(9)),
    );
    encoder.write_all(data).context("gzip compression failed")?;
    encoder.finish().context("gzip compression failed")
}

pub fn gunzip(data: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::new();
    flate2::read::GzDecoder::new(data)
        .read_to_end(&mut out)
        .context("gzip decompression failed")?;
    Ok(out)
}
