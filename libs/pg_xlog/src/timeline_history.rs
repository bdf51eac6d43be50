//!
//! Parsing of timeline history files (`TTTTTTTT.history`).
//!
//! A history file of timeline N lists every ancestor of N, oldest first, one
//! per line: `parentTLI<TAB>switchpoint<TAB>reason`. The switchpoint is the
//! LSN at which the lineage left that ancestor. Blank lines and lines
//! starting with `#` are ignored.
//!
use std::fmt::Write;

use utils::lsn::Lsn;

use crate::TimeLineID;

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum HistoryParseError {
    #[error("syntax error in history file line {line}: {reason}")]
    Syntax { line: usize, reason: &'static str },
    #[error("invalid data in history file: timeline IDs must be in increasing sequence")]
    NotIncreasing,
    #[error("history file has no entries")]
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineHistoryEntry {
    pub tli: TimeLineID,
    /// LSN where the lineage switched away from `tli`.
    pub switchpoint: Lsn,
    pub reason: String,
}

/// Parsed history of one timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineHistory {
    /// The timeline this history file belongs to.
    pub tli: TimeLineID,
    /// Ancestors, oldest first. The last entry is the direct parent.
    pub entries: Vec<TimelineHistoryEntry>,
}

impl TimelineHistory {
    pub fn parse(tli: TimeLineID, content: &str) -> Result<TimelineHistory, HistoryParseError> {
        let mut entries: Vec<TimelineHistoryEntry> = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.splitn(3, char::is_whitespace);
            let parent = fields
                .next()
                .and_then(|s| s.parse::<TimeLineID>().ok())
                .ok_or(HistoryParseError::Syntax {
                    line: lineno + 1,
                    reason: "expected a numeric timeline ID",
                })?;
            let switchpoint = fields
                .next()
                .map(str::trim)
                .and_then(|s| s.parse::<Lsn>().ok())
                .ok_or(HistoryParseError::Syntax {
                    line: lineno + 1,
                    reason: "expected a write-ahead log switchpoint location",
                })?;
            let reason = fields.next().unwrap_or("").trim().to_string();

            if let Some(prev) = entries.last() {
                if parent <= prev.tli {
                    return Err(HistoryParseError::NotIncreasing);
                }
            }
            entries.push(TimelineHistoryEntry {
                tli: parent,
                switchpoint,
                reason,
            });
        }
        if entries.is_empty() {
            return Err(HistoryParseError::Empty);
        }
        if entries.iter().any(|e| e.tli >= tli) {
            return Err(HistoryParseError::NotIncreasing);
        }
        Ok(TimelineHistory { tli, entries })
    }

    /// Direct parent and the LSN where this timeline forked from it.
    pub fn parent(&self) -> Option<(TimeLineID, Lsn)> {
        self.entries.last().map(|e| (e.tli, e.switchpoint))
    }

    /// Is `lsn` on timeline `tli` part of this timeline's past? True for
    /// ancestors up to their switchpoint, and for this timeline itself.
    pub fn contains(&self, tli: TimeLineID, lsn: Lsn) -> bool {
        if tli == self.tli {
            return true;
        }
        self.entries
            .iter()
            .any(|e| e.tli == tli && lsn <= e.switchpoint)
    }

    /// Renders the history in the PostgreSQL file format.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for e in &self.entries {
            let _ = writeln!(out, "{}\t{}\t{}", e.tli, e.switchpoint, e.reason);
        }
        out
    }

    /// History of a child timeline forked from this one at `switchpoint`.
    pub fn child(&self, child_tli: TimeLineID, switchpoint: Lsn, reason: &str) -> TimelineHistory {
        let mut entries = self.entries.clone();
        entries.push(TimelineHistoryEntry {
            tli: self.tli,
            switchpoint,
            reason: reason.to_string(),
        });
        TimelineHistory {
            tli: child_tli,
            entries,
        }
    }

    /// History of timeline 1, which has no ancestors.
    pub fn root() -> TimelineHistory {
        TimelineHistory {
            tli: 1,
            entries: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_history_file() {
        let content = "# comment\n\
                       1\t0/3000000\tno recovery target specified\n\
                       \n\
                       2\t0/5000A28\tbefore 2020-01-01 00:00:00+00\n";
        let history = TimelineHistory::parse(3, content).unwrap();
        assert_eq!(history.entries.len(), 2);
        assert_eq!(history.parent(), Some((2, Lsn(0x5000A28))));
        assert_eq!(history.entries[1].reason, "before 2020-01-01 00:00:00+00");

        assert!(history.contains(1, Lsn(0x2FFFFFF)));
        assert!(!history.contains(1, Lsn(0x3000001)));
        assert!(history.contains(3, Lsn::MAX));

        let reparsed = TimelineHistory::parse(3, &history.render()).unwrap();
        assert_eq!(reparsed, history);
    }

    #[test]
    fn reject_bad_history_files() {
        assert_eq!(
            TimelineHistory::parse(2, ""),
            Err(HistoryParseError::Empty)
        );
        assert_eq!(
            TimelineHistory::parse(2, "# only comments\n"),
            Err(HistoryParseError::Empty)
        );
        assert!(matches!(
            TimelineHistory::parse(2, "x\t0/0\n"),
            Err(HistoryParseError::Syntax { line: 1, .. })
        ));
        assert!(matches!(
            TimelineHistory::parse(2, "1\tgarbage\n"),
            Err(HistoryParseError::Syntax { line: 1, .. })
        ));
        assert_eq!(
            TimelineHistory::parse(4, "2\t0/1\n1\t0/2\n"),
            Err(HistoryParseError::NotIncreasing)
        );
        // a timeline can't be its own ancestor
        assert_eq!(
            TimelineHistory::parse(2, "2\t0/1\n"),
            Err(HistoryParseError::NotIncreasing)
        );
    }

    #[test]
    fn child_history() {
        let tli2 = TimelineHistory::root().child(2, Lsn(0x3000000), "promote");
        let tli3 = tli2.child(3, Lsn(0x6000000), "promote");
        assert_eq!(tli3.entries.len(), 2);
        assert_eq!(tli3.parent(), Some((2, Lsn(0x6000000))));
        assert_eq!(tli3.render(), "1\t0/3000000\tpromote\n2\t0/6000000\tpromote\n");
    }
}
