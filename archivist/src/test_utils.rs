use std::collections::BTreeMap;
use std::os::unix::fs::FileExt;
use std::sync::Mutex;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use camino_tempfile::Utf8TempDir;
use chrono::Utc;
use pg_xlog::controlfile::{ControlFileData, DbState};
use pg_xlog::page::init_page;
use pg_xlog::timeline_history::TimelineHistory;
use pg_xlog::xlog_utils::{TLHistoryFileName, XLogFileName};
use pg_xlog::{BLCKSZ, PG_CONTROL_FILE_PATH, TimeLineID, XLogSegNo};
use utils::lsn::Lsn;

use crate::archive_push::{self, ARCHIVE_STATUS_DIR, DONE_SUFFIX, PushOptions, READY_SUFFIX};
use crate::config::InstanceConfig;
use crate::content::DatabaseEntry;
use crate::segment_store::SegmentStore;
use crate::server::{BackupStart, BackupStop, POSTMASTER_PID_FILE, PageMap, ServerControl};
use crate::timeline_index::{lineage_of, timeline_of};
use crate::{ArchivistConf, InstanceContext};

/// WAL segment size used by tests, the smallest one PostgreSQL allows.
pub const TEST_WAL_SEG_SIZE: usize = 1024 * 1024;
pub const TEST_INSTANCE: &str = "node";
pub const TEST_SYSTEM_ID: u64 = 7_300_000_000_000_000_001;

/// A test environment: a backup catalog and a cluster in a temporary
/// directory, removed on drop.
pub struct Env {
    pub tempdir: Utf8TempDir,
    pub ctx: InstanceContext,
    pub cluster: ScriptedServer,
}

impl Env {
    pub fn new() -> anyhow::Result<Env> {
        let tempdir = camino_tempfile::tempdir()?;
        let pgdata = tempdir.path().join("pgdata");

        let mut conf = ArchivistConf::new(tempdir.path().join("backups"));
        conf.no_sync = true;
        conf.init_catalog()?;
        let config = InstanceConfig {
            pgdata: Some(pgdata.clone()),
            system_identifier: Some(TEST_SYSTEM_ID),
            wal_seg_size: TEST_WAL_SEG_SIZE,
            ..Default::default()
        };
        conf.add_instance(TEST_INSTANCE, &config)?;
        let ctx = InstanceContext::load(&conf, TEST_INSTANCE)?;
        let cluster = ScriptedServer::init(&pgdata, TEST_WAL_SEG_SIZE)?.with_archive(ctx.wal_store());
        Ok(Env {
            tempdir,
            ctx,
            cluster,
        })
    }

    pub fn path(&self) -> &Utf8Path {
        self.tempdir.path()
    }

    /// A fresh directory to restore into.
    pub fn restore_dir(&self, name: &str) -> Utf8PathBuf {
        self.tempdir.path().join(name)
    }

    /// Pushes every WAL file the cluster has marked ready, the way the
    /// server's archiver would.
    pub async fn archive_wal(&self) -> anyhow::Result<()> {
        self.cluster.archive_ready(&self.ctx.wal_store()).await
    }
}

/// A scripted cluster: a real data directory whose relations are written
/// page by page, with a linear WAL position, timeline switches, and
/// change tracking for PAGE and PTRACK backups.
pub struct ScriptedServer {
    pgdata: Utf8PathBuf,
    wal_seg_size: usize,
    /// Archive that ready WAL is pushed to when a backup stops.
    archive: Option<SegmentStore>,
    state: Mutex<ScriptState>,
}

struct ScriptState {
    lsn: Lsn,
    history: TimelineHistory,
    /// First segment number not yet written to pg_wal.
    next_segno: XLogSegNo,
    /// Every page write, in WAL order.
    changes: Vec<(Lsn, String, u32)>,
    databases: Vec<DatabaseEntry>,
}

impl ScriptedServer {
    pub fn init(pgdata: &Utf8Path, wal_seg_size: usize) -> anyhow::Result<ScriptedServer> {
        for dir in [
            "global",
            "base/1",
            "base/16384",
            "pg_wal/archive_status",
            "pg_xact",
            "pg_tblspc",
            "pg_stat_tmp",
            "pg_replslot/slot1",
        ] {
            std::fs::create_dir_all(pgdata.join(dir))?;
        }
        std::fs::write(pgdata.join("PG_VERSION"), "16\n")?;
        std::fs::write(pgdata.join("base/1/PG_VERSION"), "16\n")?;
        std::fs::write(pgdata.join("base/16384/PG_VERSION"), "16\n")?;
        std::fs::write(pgdata.join("postgresql.conf"), "shared_buffers = 128MB\n")?;
        std::fs::write(pgdata.join("pg_xact/0000"), vec![0x55u8; BLCKSZ])?;
        std::fs::write(pgdata.join("pg_stat_tmp/global.stat"), b"stats")?;
        std::fs::write(pgdata.join("pg_replslot/slot1/state"), b"slot")?;
        std::fs::write(pgdata.join(POSTMASTER_PID_FILE), format!("{}\n", std::process::id()))?;

        let server = ScriptedServer {
            pgdata: pgdata.to_path_buf(),
            wal_seg_size,
            archive: None,
            state: Mutex::new(ScriptState {
                lsn: Lsn(wal_seg_size as u64 + 0x28),
                history: TimelineHistory::root(),
                next_segno: 1,
                changes: Vec::new(),
                databases: vec![
                    DatabaseEntry {
                        oid: 1,
                        name: "template1".into(),
                    },
                    DatabaseEntry {
                        oid: 16384,
                        name: "app".into(),
                    },
                ],
            }),
        };
        server.write_pages("base/1/1259", &[(0, 1), (1, 1)])?;
        server.write_pages("global/1262", &[(0, 2)])?;
        server.write_control(DbState::InProduction)?;
        Ok(server)
    }

    pub fn with_archive(mut self, store: SegmentStore) -> ScriptedServer {
        self.archive = Some(store);
        self
    }

    pub fn pgdata(&self) -> &Utf8Path {
        &self.pgdata
    }

    pub fn tli(&self) -> TimeLineID {
        self.lock().history.tli
    }

    pub fn lsn(&self) -> Lsn {
        self.lock().lsn
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap()
    }

    /// Writes full pages of `fill` bytes at the given blocks of a relation,
    /// each stamped with a fresh LSN. The file grows as needed.
    pub fn write_pages(&self, rel_path: &str, blocks: &[(u32, u8)]) -> anyhow::Result<()> {
        let path = self.pgdata.join(rel_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("failed to open {path}"))?;
        let mut state = self.lock();
        for &(blkno, fill) in blocks {
            state.lsn += 0x100;
            let mut page = vec![0u8; BLCKSZ];
            init_page(&mut page, state.lsn);
            page[64..].fill(fill);
            file.write_all_at(&page, blkno as u64 * BLCKSZ as u64)?;
            let lsn = state.lsn;
            state.changes.push((lsn, rel_path.to_string(), blkno));
        }
        Ok(())
    }

    pub fn truncate(&self, rel_path: &str, n_blocks: u32) -> anyhow::Result<()> {
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(self.pgdata.join(rel_path))?;
        file.set_len(n_blocks as u64 * BLCKSZ as u64)?;
        self.lock().lsn += 0x100;
        Ok(())
    }

    pub fn remove_file(&self, rel_path: &str) -> anyhow::Result<()> {
        std::fs::remove_file(self.pgdata.join(rel_path))?;
        self.lock().lsn += 0x100;
        Ok(())
    }

    pub fn write_file(&self, rel_path: &str, data: &[u8]) -> anyhow::Result<()> {
        let path = self.pgdata.join(rel_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, data)?;
        self.lock().lsn += 0x100;
        Ok(())
    }

    /// Finishes the current WAL segment: every segment up to the current
    /// position is written to pg_wal and marked ready, and the position
    /// moves to the start of the next segment.
    pub fn switch_wal(&self) -> anyhow::Result<Vec<String>> {
        let mut state = self.lock();
        let seg = self.wal_seg_size;
        let last = state.lsn.segment_number(seg);
        let mut written = Vec::new();
        for segno in state.next_segno..=last {
            let tli = timeline_of(
                state.history.tli,
                &lineage_of(&state.history),
                Lsn::from_segment_number(segno, seg),
            );
            let name = XLogFileName(tli, segno, seg);
            let mut data = vec![(segno % 251) as u8; seg];
            data[..4].copy_from_slice(&tli.to_le_bytes());
            std::fs::write(self.pgdata.join("pg_wal").join(&name), data)?;
            self.mark_ready(&name)?;
            written.push(name);
        }
        state.next_segno = last + 1;
        state.lsn = Lsn::from_segment_number(last + 1, seg) + 0x28;
        Ok(written)
    }

    /// Ends recovery on a new timeline, forking at the current position.
    /// The current segment is switched first, so the fork is at a segment
    /// boundary.
    pub fn promote(&self) -> anyhow::Result<TimeLineID> {
        self.switch_wal()?;
        let mut state = self.lock();
        let switchpoint = state.lsn.segment_lsn(self.wal_seg_size);
        let new_tli = state.history.tli + 1;
        state.history = state
            .history
            .child(new_tli, switchpoint, "no recovery target specified");
        let name = TLHistoryFileName(new_tli);
        std::fs::write(self.pgdata.join("pg_wal").join(&name), state.history.render())?;
        self.mark_ready(&name)?;
        drop(state);
        self.write_control(DbState::InProduction)?;
        Ok(new_tli)
    }

    /// Stops the server cleanly, for offline backups.
    pub fn shutdown(&self) -> anyhow::Result<()> {
        std::fs::remove_file(self.pgdata.join(POSTMASTER_PID_FILE))?;
        self.write_control(DbState::Shutdowned)
    }

    fn mark_ready(&self, name: &str) -> anyhow::Result<()> {
        std::fs::write(
            self.pgdata
                .join("pg_wal")
                .join(ARCHIVE_STATUS_DIR)
                .join(format!("{name}{READY_SUFFIX}")),
            b"",
        )?;
        Ok(())
    }

    fn write_control(&self, db_state: DbState) -> anyhow::Result<()> {
        let state = self.lock();
        let control = ControlFileData {
            system_identifier: TEST_SYSTEM_ID,
            pg_control_version: 1300,
            catalog_version_no: 202307071,
            state: db_state,
            time: Utc::now().timestamp(),
            checkpoint: state.lsn,
            redo: state.lsn,
            this_timeline_id: state.history.tli,
            prev_timeline_id: state.history.parent().map_or(state.history.tli, |(tli, _)| tli),
        };
        std::fs::write(self.pgdata.join(PG_CONTROL_FILE_PATH), control.encode())?;
        Ok(())
    }

    /// Archives every file marked ready, oldest first, and marks it done.
    pub async fn archive_ready(&self, store: &SegmentStore) -> anyhow::Result<()> {
        let pg_wal = self.pgdata.join("pg_wal");
        let status_dir = pg_wal.join(ARCHIVE_STATUS_DIR);
        let mut ready: Vec<String> = utils::fs_ext::list_dir(&status_dir)
            .await?
            .into_iter()
            .filter_map(|f| f.strip_suffix(READY_SUFFIX).map(str::to_string))
            .collect();
        // history files sort after segments by name, push them first
        ready.sort_by_key(|name| (!name.ends_with(".history"), name.clone()));
        let opts = PushOptions {
            no_sync: true,
            ..Default::default()
        };
        for name in ready {
            archive_push::push(store, &pg_wal, &name, &opts).await?;
            std::fs::rename(
                status_dir.join(format!("{name}{READY_SUFFIX}")),
                status_dir.join(format!("{name}{DONE_SUFFIX}")),
            )?;
        }
        Ok(())
    }

    fn changes_since(&self, from: Lsn, to: Lsn) -> PageMap {
        let mut map = PageMap::new();
        for (lsn, path, blkno) in &self.lock().changes {
            if *lsn >= from && *lsn <= to {
                map.entry(path.clone()).or_default().insert(*blkno);
            }
        }
        map
    }
}

impl ServerControl for ScriptedServer {
    fn pgdata(&self) -> &Utf8Path {
        &self.pgdata
    }

    async fn timeline_history(&self) -> anyhow::Result<TimelineHistory> {
        Ok(self.lock().history.clone())
    }

    async fn start_backup(&self, _label: &str) -> anyhow::Result<BackupStart> {
        {
            let mut state = self.lock();
            state.lsn += 0x28;
        }
        self.write_control(DbState::InProduction)?;
        let state = self.lock();
        Ok(BackupStart {
            start_lsn: state.lsn,
            tli: state.history.tli,
            start_time: Utc::now(),
            system_identifier: TEST_SYSTEM_ID,
        })
    }

    async fn stop_backup(&self) -> anyhow::Result<BackupStop> {
        let (stop_lsn, tli) = {
            let mut state = self.lock();
            state.lsn += 0x100;
            (state.lsn, state.history.tli)
        };
        // the stop record must reach the archive
        self.switch_wal()?;
        if let Some(store) = &self.archive {
            self.archive_ready(store).await?;
        }
        Ok(BackupStop {
            stop_lsn,
            recovery_time: Some(Utc::now()),
            recovery_xid: Some(1000 + stop_lsn.0 / 0x100),
            backup_label: format!("START TIMELINE: {tli}\nBACKUP METHOD: streamed\n"),
            tablespace_map: None,
        })
    }

    async fn database_map(&self) -> anyhow::Result<Vec<DatabaseEntry>> {
        Ok(self.lock().databases.clone())
    }

    async fn ptrack_page_map(&self, since: Lsn) -> anyhow::Result<PageMap> {
        Ok(self.changes_since(since, Lsn::MAX))
    }

    async fn wal_page_map(&self, _tli: TimeLineID, from: Lsn, to: Lsn) -> anyhow::Result<PageMap> {
        Ok(self.changes_since(from, to))
    }

    async fn fetch_wal(&self, tli: TimeLineID, segno: XLogSegNo) -> anyhow::Result<Vec<u8>> {
        let path = self
            .pgdata
            .join("pg_wal")
            .join(XLogFileName(tli, segno, self.wal_seg_size));
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read {path}"))
    }
}

/// Contents of every regular file under `dir`, by relative path. Used to
/// compare a restored data directory with the source.
pub fn dir_snapshot(dir: &Utf8Path, skip: &[&str]) -> anyhow::Result<BTreeMap<String, Vec<u8>>> {
    let mut files = BTreeMap::new();
    for entry in walkdir::WalkDir::new(dir).follow_links(true) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(dir.as_std_path())?
            .to_string_lossy()
            .into_owned();
        if skip.iter().any(|s| rel == *s || rel.starts_with(&format!("{s}/"))) {
            continue;
        }
        files.insert(rel, std::fs::read(entry.path())?);
    }
    Ok(files)
}
