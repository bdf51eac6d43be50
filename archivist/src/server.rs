//! The database server, as seen by the backup engine.
//!
//! Everything the engine needs from a server goes through
//! [`ServerControl`]: backup start/stop, the current timeline history,
//! change maps for incremental backups and WAL for STREAM backups.
//! [`OfflineCluster`] implements it for a cleanly stopped data directory.

use std::collections::{BTreeSet, HashMap};
use std::fmt::Write;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use pg_xlog::controlfile::ControlFileData;
use pg_xlog::timeline_history::TimelineHistory;
use pg_xlog::xlog_utils::{TLHistoryFileName, XLogFileName};
use pg_xlog::{PG_CONTROL_FILE_PATH, TimeLineID, XLogSegNo};
use tracing::info;
use utils::lsn::Lsn;

use crate::content::DatabaseEntry;
use crate::error;

pub const BACKUP_LABEL_FILE: &str = "backup_label";
pub const TABLESPACE_MAP_FILE: &str = "tablespace_map";
pub const POSTMASTER_PID_FILE: &str = "postmaster.pid";

/// Changed blocks per data file, keyed by path relative to the data directory.
pub type PageMap = HashMap<String, BTreeSet<u32>>;

#[derive(Debug, Clone)]
pub struct BackupStart {
    pub start_lsn: Lsn,
    pub tli: TimeLineID,
    pub start_time: DateTime<Utc>,
    pub system_identifier: u64,
}

#[derive(Debug, Clone)]
pub struct BackupStop {
    pub stop_lsn: Lsn,
    pub recovery_time: Option<DateTime<Utc>>,
    pub recovery_xid: Option<u64>,
    /// Content of `backup_label`, stored with the backup.
    pub backup_label: String,
    pub tablespace_map: Option<String>,
}

#[allow(async_fn_in_trait)]
pub trait ServerControl {
    fn pgdata(&self) -> &Utf8Path;

    /// History of the timeline the server is on.
    async fn timeline_history(&self) -> anyhow::Result<TimelineHistory>;

    async fn start_backup(&self, label: &str) -> anyhow::Result<BackupStart>;

    async fn stop_backup(&self) -> anyhow::Result<BackupStop>;

    async fn database_map(&self) -> anyhow::Result<Vec<DatabaseEntry>>;

    /// Blocks changed since `since`, from the server's change tracking.
    async fn ptrack_page_map(&self, since: Lsn) -> anyhow::Result<PageMap>;

    /// Blocks touched by the WAL between `from` and `to`.
    async fn wal_page_map(&self, tli: TimeLineID, from: Lsn, to: Lsn) -> anyhow::Result<PageMap>;

    /// Content of a WAL segment, for STREAM backups.
    async fn fetch_wal(&self, tli: TimeLineID, segno: XLogSegNo) -> anyhow::Result<Vec<u8>>;
}

/// A data directory whose server is shut down. The backup covers exactly
/// the last checkpoint; change maps are not available.
#[derive(Debug, Clone)]
pub struct OfflineCluster {
    pgdata: Utf8PathBuf,
    wal_seg_size: usize,
}

impl OfflineCluster {
    pub fn new(pgdata: impl Into<Utf8PathBuf>, wal_seg_size: usize) -> OfflineCluster {
        OfflineCluster {
            pgdata: pgdata.into(),
            wal_seg_size,
        }
    }

    async fn control_file(&self) -> anyhow::Result<ControlFileData> {
        let path = self.pgdata.join(PG_CONTROL_FILE_PATH);
        let data = tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read control file {path}"))?;
        ControlFileData::decode(&data).with_context(|| format!("failed to decode {path}"))
    }
}

impl ServerControl for OfflineCluster {
    fn pgdata(&self) -> &Utf8Path {
        &self.pgdata
    }

    async fn timeline_history(&self) -> anyhow::Result<TimelineHistory> {
        let tli = self.control_file().await?.this_timeline_id;
        if tli == 1 {
            return Ok(TimelineHistory::root());
        }
        let path = self.pgdata.join("pg_wal").join(TLHistoryFileName(tli));
        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read history file {path}"))?;
        TimelineHistory::parse(tli, &content).with_context(|| format!("failed to parse {path}"))
    }

    async fn start_backup(&self, label: &str) -> anyhow::Result<BackupStart> {
        if tokio::fs::try_exists(self.pgdata.join(POSTMASTER_PID_FILE)).await? {
            return Err(error::policy(format!(
                "server is running in {}, an offline backup needs it stopped",
                self.pgdata
            )));
        }
        let control = self.control_file().await?;
        if !control.is_cleanly_shut_down() {
            return Err(error::policy(format!(
                "server in {} was not shut down cleanly (state {:?})",
                self.pgdata, control.state
            )));
        }
        info!(
            "starting offline backup '{label}' at checkpoint {} on timeline {}",
            control.redo, control.this_timeline_id
        );
        Ok(BackupStart {
            start_lsn: control.redo,
            tli: control.this_timeline_id,
            start_time: Utc::now(),
            system_identifier: control.system_identifier,
        })
    }

    async fn stop_backup(&self) -> anyhow::Result<BackupStop> {
        let control = self.control_file().await?;
        let start_segment = XLogFileName(
            control.this_timeline_id,
            control.redo.segment_number(self.wal_seg_size),
            self.wal_seg_size,
        );
        let mut label = String::new();
        writeln!(
            label,
            "START WAL LOCATION: {} (file {start_segment})",
            control.redo
        )?;
        writeln!(label, "CHECKPOINT LOCATION: {}", control.checkpoint)?;
        writeln!(label, "BACKUP METHOD: streamed")?;
        writeln!(label, "BACKUP FROM: primary")?;
        writeln!(label, "START TIMELINE: {}", control.this_timeline_id)?;

        let mut tablespace_map = String::new();
        for name in utils::fs_ext::list_dir_sync(self.pgdata.join("pg_tblspc"))? {
            let link = self.pgdata.join("pg_tblspc").join(&name);
            if let Ok(target) = std::fs::read_link(&link) {
                writeln!(tablespace_map, "{name} {}", target.display())?;
            }
        }

        Ok(BackupStop {
            stop_lsn: control.checkpoint.max(control.redo),
            recovery_time: DateTime::from_timestamp(control.time, 0),
            recovery_xid: None,
            backup_label: label,
            tablespace_map: (!tablespace_map.is_empty()).then_some(tablespace_map),
        })
    }

    async fn database_map(&self) -> anyhow::Result<Vec<DatabaseEntry>> {
        // without a running server there is no catalog to read names from
        let mut map: Vec<DatabaseEntry> = utils::fs_ext::list_dir_sync(self.pgdata.join("base"))?
            .into_iter()
            .filter_map(|name| {
                name.parse::<u32>().ok().map(|oid| DatabaseEntry {
                    oid,
                    name: oid.to_string(),
                })
            })
            .collect();
        map.sort_by_key(|e| e.oid);
        Ok(map)
    }

    async fn ptrack_page_map(&self, _since: Lsn) -> anyhow::Result<PageMap> {
        Err(error::policy(
            "PTRACK backups need change tracking of a running server",
        ))
    }

    async fn wal_page_map(&self, _tli: TimeLineID, _from: Lsn, _to: Lsn) -> anyhow::Result<PageMap> {
        Err(error::policy(
            "PAGE backups need a WAL page map from a running server",
        ))
    }

    async fn fetch_wal(&self, tli: TimeLineID, segno: XLogSegNo) -> anyhow::Result<Vec<u8>> {
        let path = self
            .pgdata
            .join("pg_wal")
            .join(XLogFileName(tli, segno, self.wal_seg_size));
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read WAL segment {path}"))
    }
}

#[cfg(test)]
mod tests {
    use pg_xlog::controlfile::DbState;

    use super::*;
    use crate::error::{ErrorKind, error_kind};

    const SEG: usize = 1024 * 1024;

    fn control(state: DbState, tli: TimeLineID) -> ControlFileData {
        ControlFileData {
            system_identifier: 42,
            pg_control_version: 1300,
            catalog_version_no: 202307071,
            state,
            time: 1_700_000_000,
            checkpoint: Lsn(0x3000060),
            redo: Lsn(0x3000028),
            this_timeline_id: tli,
            prev_timeline_id: tli,
        }
    }

    #[tokio::test]
    async fn offline_backup_reads_control_file() -> anyhow::Result<()> {
        let dir = camino_tempfile::tempdir()?;
        std::fs::create_dir_all(dir.path().join("global"))?;
        std::fs::create_dir_all(dir.path().join("base/16384"))?;
        std::fs::create_dir_all(dir.path().join("pg_wal"))?;
        std::fs::write(
            dir.path().join(PG_CONTROL_FILE_PATH),
            control(DbState::Shutdowned, 2).encode(),
        )?;
        std::fs::write(
            dir.path().join("pg_wal/00000002.history"),
            "1\t0/2000000\tno recovery target specified\n",
        )?;
        let server = OfflineCluster::new(dir.path(), SEG);

        let start = server.start_backup("test").await?;
        assert_eq!((start.start_lsn, start.tli, start.system_identifier), (Lsn(0x3000028), 2, 42));
        let stop = server.stop_backup().await?;
        assert_eq!(stop.stop_lsn, Lsn(0x3000060));
        assert!(stop.backup_label.contains("START TIMELINE: 2"), "{}", stop.backup_label);
        assert!(stop.tablespace_map.is_none());

        let history = server.timeline_history().await?;
        assert_eq!(history.parent(), Some((1, Lsn(0x2000000))));
        assert_eq!(server.database_map().await?[0].oid, 16384);

        let err = server.wal_page_map(2, Lsn(0), Lsn(1)).await.unwrap_err();
        assert_eq!(error_kind(&err), ErrorKind::Policy);
        Ok(())
    }

    #[tokio::test]
    async fn running_server_is_refused() -> anyhow::Result<()> {
        let dir = camino_tempfile::tempdir()?;
        std::fs::create_dir_all(dir.path().join("global"))?;
        std::fs::write(
            dir.path().join(PG_CONTROL_FILE_PATH),
            control(DbState::InProduction, 1).encode(),
        )?;
        let server = OfflineCluster::new(dir.path(), SEG);
        assert!(server.start_backup("test").await.is_err());

        std::fs::write(
            dir.path().join(PG_CONTROL_FILE_PATH),
            control(DbState::Shutdowned, 1).encode(),
        )?;
        std::fs::write(dir.path().join(POSTMASTER_PID_FILE), "12345\n")?;
        let err = server.start_backup("test").await.unwrap_err();
        assert!(err.to_string().contains("server is running"), "{err}");
        Ok(())
    }
}
