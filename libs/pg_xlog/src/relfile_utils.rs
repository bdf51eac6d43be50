//!
//! Common utilities for dealing with PostgreSQL relation files.
//!
use once_cell::sync::Lazy;
use regex::Regex;

use crate::{FSM_FORKNUM, INIT_FORKNUM, MAIN_FORKNUM, VISIBILITYMAP_FORKNUM};

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum FilePathError {
    #[error("invalid relation fork name")]
    InvalidForkName,
    #[error("invalid relation data file name")]
    InvalidFileName,
}

impl From<core::num::ParseIntError> for FilePathError {
    fn from(_e: core::num::ParseIntError) -> Self {
        FilePathError::InvalidFileName
    }
}

/// Convert Postgres relation file's fork suffix to fork number.
pub fn forkname_to_number(forkname: Option<&str>) -> Result<u8, FilePathError> {
    match forkname {
        // "main" is not in filenames, it's implicit if the fork name is not present
        None => Ok(MAIN_FORKNUM),
        Some("fsm") => Ok(FSM_FORKNUM),
        Some("vm") => Ok(VISIBILITYMAP_FORKNUM),
        Some("init") => Ok(INIT_FORKNUM),
        Some(_) => Err(FilePathError::InvalidForkName),
    }
}

static RELFILENAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<relnode>\d+)(_(?P<forkname>[a-z]+))?(\.(?P<segno>\d+))?$")
        .expect("valid regex")
});

///
/// Parse a filename of a relation file. Returns (relfilenode, forknum, segno) tuple.
///
/// Formats:
/// <oid>
/// <oid>_<fork name>
/// <oid>.<segment number>
/// <oid>_<fork name>.<segment number>
///
pub fn parse_relfilename(fname: &str) -> Result<(u32, u8, u32), FilePathError> {
    let caps = RELFILENAME_RE
        .captures(fname)
        .ok_or(FilePathError::InvalidFileName)?;

    let relnode = caps
        .name("relnode")
        .ok_or(FilePathError::InvalidFileName)?
        .as_str()
        .parse::<u32>()?;

    let forknum = forkname_to_number(caps.name("forkname").map(|f| f.as_str()))?;

    let segno = match caps.name("segno") {
        None => 0,
        Some(m) => m.as_str().parse::<u32>()?,
    };

    Ok((relnode, forknum, segno))
}

/// Where a relation file lives, as derived from its path relative to the
/// data directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelFileLocation {
    pub spcnode: u32,
    pub dbnode: u32,
    pub relnode: u32,
    pub forknum: u8,
    pub segno: u32,
}

/// Recognizes relation files by their path relative to the data directory:
/// `global/<rel>`, `base/<db>/<rel>` and
/// `pg_tblspc/<spc>/<version dir>/<db>/<rel>`. Returns `None` for anything
/// that is not a relation file.
pub fn parse_relation_path(rel_path: &str) -> Option<RelFileLocation> {
    let parts: Vec<&str> = rel_path.split('/').collect();
    let (spcnode, dbnode, fname) = match parts.as_slice() {
        ["global", fname] => (crate::GLOBALTABLESPACE_OID, 0, *fname),
        ["base", db, fname] => (crate::DEFAULTTABLESPACE_OID, db.parse().ok()?, *fname),
        ["pg_tblspc", spc, _version, db, fname] => (spc.parse().ok()?, db.parse().ok()?, *fname),
        _ => return None,
    };
    let (relnode, forknum, segno) = parse_relfilename(fname).ok()?;
    Some(RelFileLocation {
        spcnode,
        dbnode,
        relnode,
        forknum,
        segno,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_relfilenames() {
        assert_eq!(parse_relfilename("1234"), Ok((1234, 0, 0)));
        assert_eq!(parse_relfilename("1234_fsm"), Ok((1234, 1, 0)));
        assert_eq!(parse_relfilename("1234_vm"), Ok((1234, 2, 0)));
        assert_eq!(parse_relfilename("1234_init"), Ok((1234, 3, 0)));

        assert_eq!(parse_relfilename("1234.12"), Ok((1234, 0, 12)));
        assert_eq!(parse_relfilename("1234_fsm.12"), Ok((1234, 1, 12)));

        // relfilenode is unsigned, so it can go up to 2^32-1
        assert_eq!(parse_relfilename("3147483648"), Ok((3147483648, 0, 0)));
    }

    #[test]
    fn test_parse_invalid_relfilenames() {
        assert_eq!(
            parse_relfilename("foo"),
            Err(FilePathError::InvalidFileName)
        );
        assert_eq!(
            parse_relfilename("1.2.3"),
            Err(FilePathError::InvalidFileName)
        );
        assert_eq!(
            parse_relfilename("1234_invalid"),
            Err(FilePathError::InvalidForkName)
        );
        // too large for u32
        assert_eq!(
            parse_relfilename("12345678901"),
            Err(FilePathError::InvalidFileName)
        );
    }

    #[test]
    fn test_parse_relation_paths() {
        assert_eq!(
            parse_relation_path("base/16384/16385_vm"),
            Some(RelFileLocation {
                spcnode: 1663,
                dbnode: 16384,
                relnode: 16385,
                forknum: VISIBILITYMAP_FORKNUM,
                segno: 0,
            })
        );
        assert_eq!(
            parse_relation_path("global/1262").map(|l| (l.spcnode, l.dbnode)),
            Some((1664, 0))
        );
        assert_eq!(
            parse_relation_path("pg_tblspc/16400/PG_16_202307071/16384/16401.1")
                .map(|l| (l.spcnode, l.segno)),
            Some((16400, 1))
        );
        assert_eq!(parse_relation_path("base/16384/PG_VERSION"), None);
        assert_eq!(parse_relation_path("global/pg_control"), None);
        assert_eq!(parse_relation_path("pg_xact/0000"), None);
    }
}
