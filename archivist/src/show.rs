//! `show` and `show-archive`: the backup list and the timeline index, as a
//! table or as JSON.

use std::fmt::Write;

use chrono::{DateTime, Utc};
use pg_xlog::TimeLineID;
use pg_xlog::xlog_utils::XLogFileName;
use serde::Serialize;
use utils::lsn::Lsn;

use crate::InstanceContext;
use crate::catalog::{BackupId, BackupInfo};
use crate::error::ArchivistError;
use crate::timeline_index::TimelineIndex;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, strum_macros::EnumString, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ShowFormat {
    #[default]
    Plain,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct LostSegments {
    pub begin_segno: String,
    pub end_segno: String,
}

/// One timeline of `show-archive`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TimelineReport {
    pub tli: TimeLineID,
    pub parent_tli: TimeLineID,
    pub switchpoint: Lsn,
    pub min_segno: Option<String>,
    pub max_segno: Option<String>,
    pub n_segments: usize,
    pub size: u64,
    pub status: String,
    pub lost_segments: Vec<LostSegments>,
    pub backups: Vec<BackupId>,
    pub closest_backup_id: Option<BackupId>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct InstanceReport<T> {
    instance: String,
    #[serde(flatten)]
    body: T,
}

#[derive(Debug, Serialize)]
struct Timelines {
    timelines: Vec<TimelineReport>,
}

#[derive(Debug, Serialize)]
struct Backups<'a> {
    backups: &'a [BackupInfo],
}

/// The timeline index of the instance's archive and catalog.
pub async fn archive_index(ctx: &InstanceContext) -> anyhow::Result<TimelineIndex> {
    let store = ctx.wal_store();
    let listing = store.list().await?;
    let histories = store.read_histories(&listing).await?;
    let backups = ctx.catalog().list()?;
    Ok(TimelineIndex::build(
        &listing.files,
        &histories,
        &backups,
        store.wal_seg_size(),
    ))
}

/// Timelines newest first, segment numbers rendered as segment file names.
pub fn timeline_reports(index: &TimelineIndex) -> Vec<TimelineReport> {
    let seg = index.wal_seg_size();
    let mut reports: Vec<TimelineReport> = index
        .timelines
        .iter()
        .map(|t| TimelineReport {
            tli: t.tli,
            parent_tli: t.parent_tli,
            switchpoint: t.switchpoint,
            min_segno: t.min_segno.map(|s| XLogFileName(t.tli, s, seg)),
            max_segno: t.max_segno.map(|s| XLogFileName(t.tli, s, seg)),
            n_segments: t.n_segments,
            size: t.size,
            status: t.status.to_string(),
            lost_segments: t
                .lost_segments
                .iter()
                .map(|l| LostSegments {
                    begin_segno: XLogFileName(t.tli, l.begin, seg),
                    end_segno: XLogFileName(t.tli, l.end, seg),
                })
                .collect(),
            backups: t.backups.clone(),
            closest_backup_id: t.closest_backup_id,
        })
        .collect();
    reports.sort_by(|a, b| b.tli.cmp(&a.tli));
    reports
}

pub async fn show_archive(ctx: &InstanceContext, format: ShowFormat) -> anyhow::Result<String> {
    let reports = timeline_reports(&archive_index(ctx).await?);
    match format {
        ShowFormat::Json => {
            let report = InstanceReport {
                instance: ctx.instance.clone(),
                body: Timelines { timelines: reports },
            };
            Ok(serde_json::to_string_pretty(&[report])?)
        }
        ShowFormat::Plain => {
            let mut table = comfy_table::Table::new();
            table.load_preset(comfy_table::presets::ASCII_BORDERS_ONLY_CONDENSED);
            table.set_header([
                "TLI",
                "Parent TLI",
                "Switchpoint",
                "Min Segno",
                "Max Segno",
                "N segments",
                "Size",
                "N backups",
                "Status",
            ]);
            for r in &reports {
                table.add_row([
                    r.tli.to_string(),
                    r.parent_tli.to_string(),
                    r.switchpoint.to_string(),
                    r.min_segno.clone().unwrap_or_else(|| "-".into()),
                    r.max_segno.clone().unwrap_or_else(|| "-".into()),
                    r.n_segments.to_string(),
                    pretty_size(r.size),
                    r.backups.len().to_string(),
                    r.status.clone(),
                ]);
            }
            Ok(format!("ARCHIVE INSTANCE '{}'\n{table}", ctx.instance))
        }
    }
}

/// The backup list, newest first.
pub fn show_backups(ctx: &InstanceContext, format: ShowFormat) -> anyhow::Result<String> {
    let mut backups = ctx.catalog().list()?;
    backups.reverse();
    match format {
        ShowFormat::Json => {
            let report = InstanceReport {
                instance: ctx.instance.clone(),
                body: Backups { backups: &backups },
            };
            Ok(serde_json::to_string_pretty(&[report])?)
        }
        ShowFormat::Plain => Ok(format!(
            "BACKUP INSTANCE '{}'\n{}",
            ctx.instance,
            backup_table(&ctx.instance, &backups)
        )),
    }
}

/// Everything the catalog records about one backup.
pub fn show_backup(ctx: &InstanceContext, id: BackupId, format: ShowFormat) -> anyhow::Result<String> {
    let backup = ctx
        .catalog()
        .list()?
        .into_iter()
        .find(|b| b.id == id)
        .ok_or(ArchivistError::BackupNotFound(id))?;
    match format {
        ShowFormat::Json => Ok(serde_json::to_string_pretty(&backup)?),
        ShowFormat::Plain => Ok(toml::to_string(&backup)?),
    }
}

fn backup_table(instance: &str, backups: &[BackupInfo]) -> comfy_table::Table {
    let mut table = comfy_table::Table::new();
    table.load_preset(comfy_table::presets::ASCII_BORDERS_ONLY_CONDENSED);
    table.set_header([
        "Instance",
        "ID",
        "Recovery Time",
        "Mode",
        "WAL Mode",
        "TLI",
        "Time",
        "Data",
        "WAL",
        "Zalg",
        "Start LSN",
        "Stop LSN",
        "Status",
    ]);
    for b in backups {
        table.add_row([
            instance.to_string(),
            b.id.to_string(),
            b.recovery_time.map(format_time).unwrap_or_else(|| "----".into()),
            b.backup_mode.to_string(),
            b.wal.to_string(),
            b.tli.to_string(),
            b.end_time
                .map(|end| pretty_duration(end - b.start_time))
                .unwrap_or_else(|| "----".into()),
            pretty_size(b.data_bytes),
            pretty_size(b.wal_bytes),
            b.compress_alg.to_string(),
            b.start_lsn.to_string(),
            b.stop_lsn.to_string(),
            b.status.to_string(),
        ]);
    }
    table
}

fn format_time(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%S%:z").to_string()
}

fn pretty_duration(d: chrono::TimeDelta) -> String {
    let secs = d.num_seconds().max(0);
    match secs {
        s if s < 60 => format!("{s}s"),
        s if s < 3600 => format!("{}m:{}s", s / 60, s % 60),
        s => format!("{}h:{}m", s / 3600, s % 3600 / 60),
    }
}

/// `1536` -> `2kB`, in the units PostgreSQL's pg_size_pretty uses.
pub fn pretty_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["bytes", "kB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    let mut out = String::new();
    let _ = write!(out, "{}{}", value.round() as u64, UNITS[unit]);
    out
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use pg_xlog::xlog_utils::XLogFileKind;

    use super::*;
    use crate::segment_store::ArchivedFile;

    const SEG: usize = 16 * 1024 * 1024;

    #[test]
    fn sizes() {
        assert_eq!(pretty_size(0), "0bytes");
        assert_eq!(pretty_size(1536), "2kB");
        assert_eq!(pretty_size(16 * 1024 * 1024), "16MB");
    }

    #[test]
    fn archive_report_uses_segment_names() -> anyhow::Result<()> {
        let files: Vec<ArchivedFile> = [1, 2, 5]
            .into_iter()
            .map(|segno| ArchivedFile {
                name: XLogFileName(1, segno, SEG),
                kind: XLogFileKind::Segment { tli: 1, segno },
                compressed: false,
                size: SEG as u64,
            })
            .collect();
        let index = TimelineIndex::build(&files, &HashMap::new(), &[], SEG);
        let reports = timeline_reports(&index);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].status, "DEGRADED");
        assert_eq!(
            reports[0].lost_segments,
            vec![LostSegments {
                begin_segno: "000000010000000000000003".into(),
                end_segno: "000000010000000000000004".into(),
            }]
        );

        let json = serde_json::to_value(&reports[0])?;
        assert_eq!(json["switchpoint"], "0/0");
        assert_eq!(json["min-segno"], "000000010000000000000001");
        assert_eq!(json["closest-backup-id"], serde_json::Value::Null);
        Ok(())
    }
}
