//!
//! The standard page header that starts every relation data page
//! (PageHeaderData in bufpage.h).
//!
//! ```text
//!  0  pd_lsn          (xlogid u32, xrecoff u32)
//!  8  pd_checksum     u16
//! 10  pd_flags        u16
//! 12  pd_lower        u16
//! 14  pd_upper        u16
//! 16  pd_special      u16
//! 18  pd_pagesize_version u16
//! 20  pd_prune_xid    u32
//! ```
//!
use byteorder::{ByteOrder, LittleEndian};
use utils::lsn::Lsn;

use crate::BLCKSZ;

pub const SIZE_OF_PAGE_HEADER_DATA: usize = 24;
pub const PG_PAGE_LAYOUT_VERSION: u16 = 4;
/// `PD_HAS_FREE_LINES | PD_PAGE_FULL | PD_ALL_VISIBLE`
pub const PD_VALID_FLAG_BITS: u16 = 0x0007;
const MAXIMUM_ALIGNOF: u16 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    pub lsn: Lsn,
    pub checksum: u16,
    pub flags: u16,
    pub lower: u16,
    pub upper: u16,
    pub special: u16,
    pub pagesize_version: u16,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum PageVerifyError {
    #[error("page is {0} bytes, expected {BLCKSZ}")]
    WrongSize(usize),
    #[error("invalid page header: {0}")]
    InvalidHeader(&'static str),
}

impl PageHeader {
    pub fn decode(page: &[u8]) -> PageHeader {
        PageHeader {
            lsn: page_lsn(page),
            checksum: LittleEndian::read_u16(&page[8..10]),
            flags: LittleEndian::read_u16(&page[10..12]),
            lower: LittleEndian::read_u16(&page[12..14]),
            upper: LittleEndian::read_u16(&page[14..16]),
            special: LittleEndian::read_u16(&page[16..18]),
            pagesize_version: LittleEndian::read_u16(&page[18..20]),
        }
    }
}

/// LSN of the last WAL record that modified the page.
pub fn page_lsn(page: &[u8]) -> Lsn {
    let xlogid = LittleEndian::read_u32(&page[0..4]) as u64;
    let xrecoff = LittleEndian::read_u32(&page[4..8]) as u64;
    Lsn((xlogid << 32) | xrecoff)
}

pub fn set_page_lsn(page: &mut [u8], lsn: Lsn) {
    LittleEndian::write_u32(&mut page[0..4], (lsn.0 >> 32) as u32);
    LittleEndian::write_u32(&mut page[4..8], lsn.0 as u32);
}

/// A freshly extended relation contains all-zero pages; they are valid.
pub fn is_zeroed(page: &[u8]) -> bool {
    page.iter().all(|b| *b == 0)
}

/// Header sanity checks in the spirit of PageIsVerified(). Page checksums
/// are not verified.
pub fn verify_page(page: &[u8]) -> Result<(), PageVerifyError> {
    if page.len() != BLCKSZ {
        return Err(PageVerifyError::WrongSize(page.len()));
    }
    if is_zeroed(page) {
        return Ok(());
    }
    let hdr = PageHeader::decode(page);
    if hdr.flags & !PD_VALID_FLAG_BITS != 0 {
        return Err(PageVerifyError::InvalidHeader("unknown flag bits"));
    }
    if (hdr.lower as usize) < SIZE_OF_PAGE_HEADER_DATA
        || hdr.lower > hdr.upper
        || hdr.upper > hdr.special
        || hdr.special as usize > BLCKSZ
    {
        return Err(PageVerifyError::InvalidHeader("pointers out of range"));
    }
    if hdr.special % MAXIMUM_ALIGNOF != 0 {
        return Err(PageVerifyError::InvalidHeader("pd_special is not aligned"));
    }
    if hdr.pagesize_version != BLCKSZ as u16 | PG_PAGE_LAYOUT_VERSION {
        return Err(PageVerifyError::InvalidHeader("unexpected page size or layout version"));
    }
    Ok(())
}

/// Initializes an empty page (PageInit()) stamped with `lsn`.
pub fn init_page(page: &mut [u8], lsn: Lsn) {
    page.fill(0);
    set_page_lsn(page, lsn);
    LittleEndian::write_u16(&mut page[12..14], SIZE_OF_PAGE_HEADER_DATA as u16);
    LittleEndian::write_u16(&mut page[14..16], BLCKSZ as u16);
    LittleEndian::write_u16(&mut page[16..18], BLCKSZ as u16);
    LittleEndian::write_u16(&mut page[18..20], BLCKSZ as u16 | PG_PAGE_LAYOUT_VERSION);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_header_roundtrip() {
        let mut page = vec![0u8; BLCKSZ];
        assert!(is_zeroed(&page));
        verify_page(&page).unwrap();

        init_page(&mut page, Lsn(0x1_0000_0028));
        assert!(!is_zeroed(&page));
        assert_eq!(page_lsn(&page), Lsn(0x1_0000_0028));
        let hdr = PageHeader::decode(&page);
        assert_eq!(hdr.lower, 24);
        assert_eq!(hdr.upper, 8192);
        verify_page(&page).unwrap();
    }

    #[test]
    fn detect_broken_headers() {
        let mut page = vec![0u8; BLCKSZ];
        init_page(&mut page, Lsn(0x100));
        page[12] = 0xff;
        page[13] = 0xff;
        assert!(matches!(
            verify_page(&page),
            Err(PageVerifyError::InvalidHeader(_))
        ));

        init_page(&mut page, Lsn(0x100));
        page[10] = 0x80;
        assert!(verify_page(&page).is_err());

        assert_eq!(verify_page(&page[..100]), Err(PageVerifyError::WrongSize(100)));
    }
}
