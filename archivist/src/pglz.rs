//! PostgreSQL's LZ format (pg_lzcompress.c).
//!
//! The stream is a sequence of groups: one control byte followed by up to
//! eight items, bit `i` (LSB first) of the control byte telling whether item
//! `i` is a literal byte (0) or a back-reference tag (1). A tag is two bytes,
//! `[offset_hi:4 | len-3:4] [offset_lo:8]`, plus a third byte `len-18` when
//! the length nibble is 0xf. Offsets are 1..=4095, lengths 3..=273.

use anyhow::{bail, ensure};

const MAX_OFFSET: usize = 0x0fff;
const MIN_MATCH: usize = 3;
const MAX_MATCH: usize = 273;

const MIN_INPUT_SIZE: usize = 32;
/// Output must save at least this percentage of the input.
const MIN_COMP_RATE: usize = 25;
/// Give up if no match was found within the first this many input bytes.
const FIRST_SUCCESS_BY: usize = 1024;
/// Stop searching once a match at least this long is found.
const GOOD_MATCH: usize = 128;
const MAX_CHAIN: usize = 64;

const HASH_BITS: u32 = 13;

fn hash3(data: &[u8], pos: usize) -> usize {
    let v = (data[pos] as u32) << 16 | (data[pos + 1] as u32) << 8 | data[pos + 2] as u32;
    (v.wrapping_mul(2654435761) >> (32 - HASH_BITS)) as usize
}

/// Compresses `src`, or returns `None` if it is too small or does not
/// compress well enough to be worth storing compressed.
pub fn compress(src: &[u8]) -> Option<Vec<u8>> {
    let slen = src.len();
    if slen < MIN_INPUT_SIZE {
        return None;
    }
    let result_max = slen - slen * MIN_COMP_RATE / 100;

    let mut out: Vec<u8> = Vec::with_capacity(result_max + 4);
    let mut head = vec![usize::MAX; 1 << HASH_BITS];
    let mut prev = vec![usize::MAX; slen];

    let mut ctrl_pos = 0;
    let mut ctrl_bit = 8; // forces a new control byte on the first item
    let mut found_match = false;

    let mut pos = 0;
    while pos < slen {
        if out.len() >= result_max {
            return None;
        }
        if !found_match && pos >= FIRST_SUCCESS_BY {
            return None;
        }

        if ctrl_bit == 8 {
            ctrl_pos = out.len();
            out.push(0);
            ctrl_bit = 0;
        }

        let (mut best_len, mut best_off) = (0, 0);
        if pos + MIN_MATCH <= slen {
            let h = hash3(src, pos);
            let mut cand = head[h];
            let mut chain = 0;
            while cand != usize::MAX && chain < MAX_CHAIN && pos - cand <= MAX_OFFSET {
                let max_len = (slen - pos).min(MAX_MATCH);
                let len = src[cand..]
                    .iter()
                    .zip(&src[pos..pos + max_len])
                    .take_while(|(a, b)| a == b)
                    .count();
                if len > best_len {
                    best_len = len;
                    best_off = pos - cand;
                    if len >= GOOD_MATCH {
                        break;
                    }
                }
                cand = prev[cand];
                chain += 1;
            }
        }

        let advance = if best_len >= MIN_MATCH {
            found_match = true;
            out[ctrl_pos] |= 1 << ctrl_bit;
            if best_len > 17 {
                out.push((((best_off & 0xf00) >> 4) | 0x0f) as u8);
                out.push((best_off & 0xff) as u8);
                out.push((best_len - 18) as u8);
            } else {
                out.push((((best_off & 0xf00) >> 4) | (best_len - 3)) as u8);
                out.push((best_off & 0xff) as u8);
            }
            best_len
        } else {
            out.push(src[pos]);
            1
        };
        ctrl_bit += 1;

        for p in pos..pos + advance {
            if p + MIN_MATCH <= slen {
                let h = hash3(src, p);
                prev[p] = head[h];
                head[h] = p;
            }
        }
        pos += advance;
    }

    if out.len() >= result_max {
        return None;
    }
    Some(out)
}

/// Decompresses `src` into exactly `raw_len` bytes.
pub fn decompress(src: &[u8], raw_len: usize) -> anyhow::Result<Vec<u8>> {
    let mut out: Vec<u8> = Vec::with_capacity(raw_len);
    let mut sp = 0;
    while sp < src.len() && out.len() < raw_len {
        let mut ctrl = src[sp];
        sp += 1;
        for _ in 0..8 {
            if sp >= src.len() || out.len() >= raw_len {
                break;
            }
            if ctrl & 1 != 0 {
                ensure!(sp + 1 < src.len(), "pglz: truncated match tag");
                let mut len = (src[sp] & 0x0f) as usize + 3;
                let off = ((src[sp] as usize & 0xf0) << 4) | src[sp + 1] as usize;
                sp += 2;
                if len == 18 {
                    ensure!(sp < src.len(), "pglz: truncated match length");
                    len += src[sp] as usize;
                    sp += 1;
                }
                if off == 0 || off > out.len() {
                    bail!("pglz: invalid back-reference offset {off}");
                }
                len = len.min(raw_len - out.len());
                let start = out.len() - off;
                // the source may overlap the bytes being produced
                for i in 0..len {
                    let b = out[start + i];
                    out.push(b);
                }
            } else {
                out.push(src[sp]);
                sp += 1;
            }
            ctrl >>= 1;
        }
    }
    if out.len() != raw_len {
        bail!(
            "pglz: decompressed {} bytes, expected {raw_len}",
            out.len()
        );
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compress_repetitive_page() {
        let mut page = vec![0u8; 8192];
        for (i, chunk) in page.chunks_mut(64).enumerate() {
            chunk[..8].copy_from_slice(&(i as u64).to_le_bytes());
        }
        let compressed = compress(&page).expect("page should compress");
        assert!(compressed.len() < page.len() / 4);
        assert_eq!(decompress(&compressed, page.len()).unwrap(), page);
    }

    #[test]
    fn long_and_overlapping_matches() {
        let mut data = b"abcabcabcabcabcabcabcabcabcabcabcabcabcabcabc".to_vec();
        data.extend(std::iter::repeat_n(b'z', 1000));
        data.extend_from_slice(b"tail that does not repeat 0123456789");
        let compressed = compress(&data).unwrap();
        assert_eq!(decompress(&compressed, data.len()).unwrap(), data);
    }

    #[test]
    fn refuse_small_or_random_input() {
        assert!(compress(b"short").is_none());
        let mut x: u32 = 12345;
        let noise: Vec<u8> = (0..4096)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 17;
                x ^= x << 5;
                x as u8
            })
            .collect();
        assert!(compress(&noise).is_none());
    }

    #[test]
    fn reject_corrupt_stream() {
        // a match tag pointing before the start of the output
        let bogus = [0x01u8, 0x10, 0x05];
        assert!(decompress(&bogus, 10).is_err());
        // stream ends early
        let data = vec![7u8; 100];
        let compressed = compress(&data).unwrap();
        assert!(decompress(&compressed[..2], data.len()).is_err());
    }
}
