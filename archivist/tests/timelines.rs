//! WAL archive and timeline index, end to end: a cluster that is backed up,
//! promoted onto a new timeline and backed up again, with damage to the
//! archive showing up in `show-archive`.

use archivist::archive_get::{self, GetOptions};
use archivist::archive_push::{self, PushOptions};
use archivist::backup::{BackupOptions, take_backup};
use archivist::catalog::BackupMode;
use archivist::restore::{RestoreOptions, restore};
use archivist::show::{self, ShowFormat};
use archivist::test_utils::{Env, TEST_WAL_SEG_SIZE, dir_snapshot};
use archivist::timeline_index::TimelineStatus;
use pg_xlog::xlog_utils::{TLHistoryFileName, XLogFileName};
use serde_json::Value;

const NOT_COMPARED: &[&str] = &[
    "pg_wal",
    "postmaster.pid",
    "pg_stat_tmp",
    "pg_replslot",
    "backup_label",
    "recovery.signal",
    "postgresql.auto.conf",
];

fn opts(env: &Env, mode: BackupMode) -> BackupOptions {
    BackupOptions::new(mode, &env.ctx.config)
}

fn timeline<'a>(report: &'a Value, tli: u64) -> &'a Value {
    report[0]["timelines"]
        .as_array()
        .and_then(|timelines| timelines.iter().find(|t| t["tli"] == tli))
        .unwrap_or_else(|| panic!("timeline {tli} is missing from {report}"))
}

#[tokio::test]
async fn promoted_cluster_keeps_both_timelines() -> anyhow::Result<()> {
    let env = Env::new()?;
    let full = take_backup(&env.ctx, &env.cluster, &opts(&env, BackupMode::Full)).await?;
    env.cluster.write_pages("base/16384/16385", &[(0, 1), (1, 1), (2, 1)])?;
    let page1 = take_backup(&env.ctx, &env.cluster, &opts(&env, BackupMode::Page)).await?;
    assert_eq!(page1.tli, 1);
    assert_eq!(page1.parent_backup_id, Some(full.id));

    let new_tli = env.cluster.promote()?;
    assert_eq!(new_tli, 2);
    env.archive_wal().await?;

    env.cluster.write_pages("base/16384/16385", &[(1, 2)])?;
    let page2 = take_backup(&env.ctx, &env.cluster, &opts(&env, BackupMode::Page)).await?;
    assert_eq!(page2.tli, 2);
    assert_eq!(page2.parent_backup_id, Some(page1.id));
    env.cluster.write_pages("base/1/1259", &[(0, 7)])?;
    let delta2 = take_backup(&env.ctx, &env.cluster, &opts(&env, BackupMode::Delta)).await?;
    assert_eq!(delta2.parent_backup_id, Some(page2.id));
    let expected = dir_snapshot(env.cluster.pgdata(), NOT_COMPARED)?;

    // the newest backup on tli 2 restores through the chain that starts on tli 1
    let dest = env.restore_dir("restored");
    let mut ropts = RestoreOptions::new(&dest);
    ropts.no_sync = true;
    let summary = restore(&env.ctx, &ropts).await?;
    assert_eq!(summary.backup_id, Some(delta2.id));
    assert_eq!(dir_snapshot(&dest, NOT_COMPARED)?, expected);

    // one more segment on tli 2, then damage the one before it
    env.cluster.switch_wal()?;
    env.archive_wal().await?;
    let index = show::archive_index(&env.ctx).await?;
    let t2 = index.get(2).expect("timeline 2 is archived");
    assert_eq!(t2.status, TimelineStatus::Ok);
    let damaged = XLogFileName(2, t2.max_segno.unwrap() - 1, TEST_WAL_SEG_SIZE);
    std::fs::OpenOptions::new()
        .write(true)
        .open(env.ctx.wal_dir().join(&damaged))?
        .set_len(100)?;

    let index = show::archive_index(&env.ctx).await?;
    let t1 = index.get(1).expect("timeline 1 is archived");
    let t2 = index.get(2).expect("timeline 2 is archived");
    assert_eq!(t1.status, TimelineStatus::Ok);
    assert_eq!(t2.status, TimelineStatus::Degraded);
    assert_eq!(t2.parent_tli, 1);
    assert_eq!(t2.backups, vec![page2.id, delta2.id]);
    assert_eq!(t2.closest_backup_id, Some(page1.id));
    assert_eq!(t1.backups, vec![full.id, page1.id]);

    let report: Value = serde_json::from_str(&show::show_archive(&env.ctx, ShowFormat::Json).await?)?;
    let t2 = timeline(&report, 2);
    assert_eq!(t2["status"], "DEGRADED");
    assert_eq!(t2["parent-tli"], 1);
    assert_eq!(t2["lost-segments"][0]["begin-segno"], damaged.as_str());
    assert_eq!(t2["lost-segments"][0]["end-segno"], damaged.as_str());
    assert_eq!(t2["closest-backup-id"], page1.id.to_string());
    assert_eq!(timeline(&report, 1)["status"], "OK");
    assert!(timeline(&report, 1)["lost-segments"].as_array().unwrap().is_empty());

    let table = show::show_archive(&env.ctx, ShowFormat::Plain).await?;
    assert!(table.contains("DEGRADED"), "{table}");
    Ok(())
}

#[tokio::test]
async fn lost_segments_are_reported_as_intervals() -> anyhow::Result<()> {
    let env = Env::new()?;
    let source = env.path().join("pg_wal_copy");
    std::fs::create_dir_all(&source)?;
    let store = env.ctx.wal_store();
    let push_opts = PushOptions {
        no_sync: true,
        ..Default::default()
    };

    let history = TLHistoryFileName(3);
    std::fs::write(
        source.join(&history),
        "1\t0/500000\tno recovery target specified\n2\t0/F00000\tno recovery target specified\n",
    )?;
    archive_push::push(&store, &source, &history, &push_opts).await?;
    for segno in (0x10..=0x1a).filter(|s| ![0x12, 0x13, 0x17].contains(s)) {
        let name = XLogFileName(3, segno, TEST_WAL_SEG_SIZE);
        std::fs::write(source.join(&name), vec![segno as u8; TEST_WAL_SEG_SIZE])?;
        archive_push::push(&store, &source, &name, &push_opts).await?;
    }

    let report: Value = serde_json::from_str(&show::show_archive(&env.ctx, ShowFormat::Json).await?)?;
    let t3 = timeline(&report, 3);
    assert_eq!(t3["status"], "DEGRADED");
    assert_eq!(t3["parent-tli"], 2);
    assert_eq!(t3["switchpoint"], "0/F00000");
    assert_eq!(t3["n-segments"], 8);
    assert_eq!(t3["min-segno"], "000000030000000000000010");
    assert_eq!(t3["max-segno"], "00000003000000000000001A");
    assert_eq!(
        t3["lost-segments"],
        serde_json::json!([
            {"begin-segno": "000000030000000000000012", "end-segno": "000000030000000000000013"},
            {"begin-segno": "000000030000000000000017", "end-segno": "000000030000000000000017"},
        ])
    );
    assert_eq!(t3["closest-backup-id"], Value::Null);
    Ok(())
}

#[tokio::test]
async fn pushed_segments_come_back_unchanged() -> anyhow::Result<()> {
    let env = Env::new()?;
    let source = env.path().join("pg_wal_copy");
    std::fs::create_dir_all(&source)?;
    let store = env.ctx.wal_store();
    let name = XLogFileName(1, 5, TEST_WAL_SEG_SIZE);
    let data: Vec<u8> = (0..TEST_WAL_SEG_SIZE).map(|i| (i % 253) as u8).collect();
    std::fs::write(source.join(&name), &data)?;

    let push_opts = PushOptions {
        compress: true,
        no_sync: true,
        ..Default::default()
    };
    let first = archive_push::push(&store, &source, &name, &push_opts).await?;
    assert_eq!(first.pushed, vec![name.clone()]);
    // a retried archive_command is accepted without rewriting the file
    let again = archive_push::push(&store, &source, &name, &push_opts).await?;
    assert_eq!(again.skipped, vec![name.clone()]);

    let dest = env.path().join("pg_wal_restored").join("RECOVERYXLOG");
    std::fs::create_dir_all(dest.parent().unwrap())?;
    let get_opts = GetOptions {
        no_sync: true,
        ..Default::default()
    };
    archive_get::get(&store, &name, &dest, &get_opts).await?;
    assert_eq!(std::fs::read(&dest)?, data);

    let missing = XLogFileName(1, 6, TEST_WAL_SEG_SIZE);
    let err = archive_get::get(&store, &missing, &dest, &get_opts).await.unwrap_err();
    assert!(format!("{err:#}").contains("is absent"), "{err:#}");
    Ok(())
}
