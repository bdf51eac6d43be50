//
// Main entry point for the archivist executable
//
use std::time::Duration;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use pg_xlog::controlfile::ControlFileData;
use pg_xlog::{PG_CONTROL_FILE_PATH, TimeLineID};
use tracing::{debug, info, warn};
use utils::logging::{self, LogFormat};
use utils::lsn::Lsn;

use archivist::archive_get::{self, GetOptions};
use archivist::archive_push::{self, PushOptions};
use archivist::backup::{BackupOptions, take_backup};
use archivist::catalog::{BackupId, BackupMode, BackupStatus};
use archivist::compression::CompressAlg;
use archivist::config::InstanceConfig;
use archivist::defaults::PROGRAM_FULL_VERSION;
use archivist::error::{self, ArchivistError, error_kind};
use archivist::reconstruct::IncrementalMode;
use archivist::restore::{RecoveryTarget, RestoreOptions, restore};
use archivist::retention::{self, DeleteOptions};
use archivist::server::OfflineCluster;
use archivist::show::{self, ShowFormat};
use archivist::{ArchivistConf, InstanceContext, merge, validate};

#[derive(Parser, Debug)]
#[command(name = "archivist", version, about = "Backup and point-in-time recovery for PostgreSQL")]
struct Cli {
    /// Root directory of the backup catalog
    #[arg(short = 'B', long, global = true, env = "BACKUP_PATH")]
    backup_path: Option<Utf8PathBuf>,

    #[arg(long, global = true)]
    instance: Option<String>,

    /// Format of the log output: plain or json
    #[arg(long, global = true, default_value = "plain")]
    log_format: String,

    /// Do not fsync written files
    #[arg(long, global = true)]
    no_sync: bool,

    /// Number of parallel workers
    #[arg(short = 'j', long, global = true)]
    threads: Option<usize>,

    /// How long to wait for a lock held by another live process
    #[arg(long, global = true, value_parser = humantime::parse_duration)]
    lock_timeout: Option<Duration>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an empty backup catalog
    Init,
    /// Register a database cluster in the catalog
    AddInstance {
        #[arg(short = 'D', long)]
        pgdata: Utf8PathBuf,
    },
    /// Change instance settings, given as KEY=VALUE
    SetConfig {
        #[arg(value_parser = parse_key_value)]
        settings: Vec<(String, String)>,
        /// Reset a setting to its default
        #[arg(long)]
        unset: Vec<String>,
    },
    ShowConfig {
        #[arg(long, default_value_t)]
        format: ShowFormat,
    },
    /// Copy a WAL file into the archive, as archive_command
    ArchivePush {
        #[arg(long)]
        wal_file_name: String,
        /// Path of the file, or of the directory holding it
        #[arg(long)]
        wal_file_path: Option<Utf8PathBuf>,
        #[arg(long)]
        compress: bool,
        #[arg(long)]
        overwrite: bool,
        #[arg(long, default_value_t = 1)]
        batch_size: usize,
        #[arg(long)]
        no_ready_rename: bool,
        #[arg(long)]
        dry_run: bool,
    },
    /// Copy a WAL file out of the archive, as restore_command
    ArchiveGet {
        #[arg(long)]
        wal_file_name: String,
        #[arg(long)]
        wal_file_path: Utf8PathBuf,
        #[arg(long, default_value_t = 1)]
        batch_size: usize,
        #[arg(long)]
        prefetch_dir: Option<Utf8PathBuf>,
        #[arg(long, value_parser = humantime::parse_duration)]
        wait_timeout: Option<Duration>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Take a backup
    Backup(BackupArgs),
    /// Merge an incremental backup with its parents into a FULL backup
    Merge {
        #[arg(short = 'i', long)]
        backup_id: BackupId,
        /// Then merge expired FULL backups into their oldest kept dependent
        #[arg(long)]
        merge_expired: bool,
    },
    /// Restore a backup into a data directory
    Restore(RestoreArgs),
    /// Check stored files and WAL of one backup or of every backup
    Validate {
        #[arg(short = 'i', long)]
        backup_id: Option<BackupId>,
    },
    /// List backups, or describe one
    Show {
        #[arg(short = 'i', long)]
        backup_id: Option<BackupId>,
        #[arg(long, default_value_t)]
        format: ShowFormat,
    },
    /// Describe the timelines of the WAL archive
    ShowArchive {
        #[arg(long, default_value_t)]
        format: ShowFormat,
    },
    /// Delete backups and WAL
    Delete(DeleteArgs),
    /// Change the note or the pin of a backup
    SetBackup {
        #[arg(short = 'i', long)]
        backup_id: BackupId,
        #[arg(long)]
        note: Option<String>,
        /// Pin the backup for this long, 0 unpins
        #[arg(long, value_parser = humantime::parse_duration, conflicts_with = "expire_time")]
        ttl: Option<Duration>,
        #[arg(long, value_parser = parse_time)]
        expire_time: Option<DateTime<Utc>>,
    },
}

#[derive(Args, Debug)]
struct BackupArgs {
    #[arg(short = 'b', long)]
    backup_mode: BackupMode,
    /// Include the WAL needed for consistency in the backup
    #[arg(long)]
    stream: bool,
    #[arg(long = "compress-algorithm")]
    compress_alg: Option<CompressAlg>,
    #[arg(long)]
    compress_level: Option<u32>,
    #[arg(short = 'E', long, value_delimiter = ':')]
    external_dirs: Option<Vec<Utf8PathBuf>>,
    #[arg(long)]
    note: Option<String>,
    #[arg(long, value_parser = humantime::parse_duration, conflicts_with = "expire_time")]
    ttl: Option<Duration>,
    #[arg(long, value_parser = parse_time)]
    expire_time: Option<DateTime<Utc>>,
    #[arg(long, value_parser = humantime::parse_duration)]
    archive_timeout: Option<Duration>,
    /// Apply retention after a successful backup
    #[arg(long)]
    delete_expired: bool,
    #[arg(long)]
    merge_expired: bool,
    #[arg(long)]
    delete_wal: bool,
}

#[derive(Args, Debug)]
struct RestoreArgs {
    #[arg(short = 'i', long)]
    backup_id: Option<BackupId>,
    /// Destination, the instance's pgdata by default
    #[arg(short = 'D', long)]
    pgdata: Option<Utf8PathBuf>,
    /// Reuse a non-empty destination: checksum, lsn or none
    #[arg(short = 'I', long, default_value = "none")]
    incremental_mode: String,
    #[arg(long)]
    recovery_target_lsn: Option<Lsn>,
    #[arg(long, value_parser = parse_time)]
    recovery_target_time: Option<DateTime<Utc>>,
    #[arg(long)]
    recovery_target_xid: Option<u64>,
    #[arg(long)]
    recovery_target_timeline: Option<TimeLineID>,
    /// Only `immediate` is accepted
    #[arg(long)]
    recovery_target: Option<String>,
    #[arg(long)]
    recovery_target_inclusive: Option<bool>,
    #[arg(long)]
    recovery_target_action: Option<String>,
    #[arg(long)]
    db_include: Vec<String>,
    #[arg(long)]
    db_exclude: Vec<String>,
    /// Relocate a tablespace, OLDDIR=NEWDIR
    #[arg(short = 'T', long, value_parser = parse_mapping)]
    tablespace_mapping: Vec<(Utf8PathBuf, Utf8PathBuf)>,
    #[arg(long)]
    skip_external_dirs: bool,
    #[arg(long)]
    no_validate: bool,
    #[arg(long)]
    restore_command: Option<String>,
}

#[derive(Args, Debug)]
struct DeleteArgs {
    #[arg(short = 'i', long, conflicts_with_all = ["status", "expired", "merge_expired"])]
    backup_id: Option<BackupId>,
    #[arg(long, conflicts_with_all = ["expired", "merge_expired"])]
    status: Option<BackupStatus>,
    /// Delete backups outside the retention policy
    #[arg(long)]
    expired: bool,
    /// Merge expired FULL backups into their oldest kept dependent
    #[arg(long)]
    merge_expired: bool,
    /// Remove WAL no retained backup needs
    #[arg(long)]
    wal: bool,
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    retention_redundancy: Option<u32>,
    #[arg(long)]
    retention_window: Option<u32>,
    #[arg(long)]
    wal_depth: Option<u32>,
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = init_logging(&cli.log_format) {
        eprintln!("ERROR: {e:#}");
        std::process::exit(error::ErrorKind::Fatal.exit_code());
    }
    let _panic_hook = logging::replace_panic_hook_with_tracing_panic_hook();

    let result = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")
        .and_then(|runtime| runtime.block_on(run(cli)));
    if let Err(e) = result {
        let kind = error_kind(&e);
        debug!("{PROGRAM_FULL_VERSION} failed, error kind {kind}");
        eprintln!("ERROR: {e:#}");
        std::process::exit(kind.exit_code());
    }
}

fn init_logging(log_format: &str) -> anyhow::Result<()> {
    logging::init(LogFormat::from_config(log_format)?, logging::Output::Stderr)
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let backup_path = cli
        .backup_path
        .clone()
        .ok_or_else(|| error::policy("required parameter not specified: --backup-path (-B)"))?;
    anyhow::ensure!(
        backup_path.is_absolute(),
        "-B, --backup-path must be an absolute path"
    );
    let mut conf = ArchivistConf::new(backup_path);
    conf.no_sync = cli.no_sync;
    conf.lock_timeout = cli.lock_timeout;
    if let Some(threads) = cli.threads {
        conf.threads = threads.max(1);
    }

    match cli.command {
        Command::Init => {
            conf.init_catalog()?;
            info!("Backup catalog '{}' successfully initialized", conf.backup_path);
        }
        Command::AddInstance { pgdata } => {
            let instance = instance_name(&cli.instance)?;
            let mut config = InstanceConfig {
                pgdata: Some(pgdata.clone()),
                ..Default::default()
            };
            config.system_identifier = read_system_identifier(&pgdata)?;
            conf.add_instance(instance, &config)?;
            info!("Instance '{instance}' successfully initialized");
        }
        Command::SetConfig { settings, unset } => {
            let mut ctx = instance_ctx(&conf, &cli.instance)?;
            for key in &unset {
                ctx.config.unset(key)?;
            }
            for (key, value) in &settings {
                ctx.config.set(key, value)?;
            }
            ctx.save_config()?;
        }
        Command::ShowConfig { format } => {
            let ctx = instance_ctx(&conf, &cli.instance)?;
            let out = match format {
                ShowFormat::Plain => toml::to_string_pretty(&ctx.config)?,
                ShowFormat::Json => serde_json::to_string_pretty(&ctx.config)?,
            };
            println!("{out}");
        }
        Command::ArchivePush {
            wal_file_name,
            wal_file_path,
            compress,
            overwrite,
            batch_size,
            no_ready_rename,
            dry_run,
        } => {
            let ctx = instance_ctx(&conf, &cli.instance)?;
            let source_dir = push_source_dir(&ctx, wal_file_path.as_deref(), &wal_file_name)?;
            let opts = PushOptions {
                compress,
                compress_level: ctx.config.compress_level,
                overwrite,
                batch_size: batch_size.max(1),
                threads: conf.threads,
                dry_run,
                no_ready_rename,
                part_timeout: ctx.config.part_timeout,
                no_sync: conf.no_sync,
            };
            let summary = archive_push::push(&ctx.wal_store(), &source_dir, &wal_file_name, &opts).await?;
            info!(
                "pushed {} files, skipped {}, failed {}",
                summary.pushed.len(),
                summary.skipped.len(),
                summary.failed.len()
            );
        }
        Command::ArchiveGet {
            wal_file_name,
            wal_file_path,
            batch_size,
            prefetch_dir,
            wait_timeout,
            dry_run,
        } => {
            let ctx = instance_ctx(&conf, &cli.instance)?;
            let mut opts = GetOptions {
                batch_size: batch_size.max(1),
                threads: conf.threads,
                prefetch_dir,
                dry_run,
                no_sync: conf.no_sync,
                ..Default::default()
            };
            if let Some(timeout) = wait_timeout {
                opts.wait_timeout = timeout;
            }
            archive_get::get(&ctx.wal_store(), &wal_file_name, &wal_file_path, &opts).await?;
        }
        Command::Backup(args) => {
            let ctx = instance_ctx(&conf, &cli.instance)?;
            run_backup(&ctx, args).await?;
        }
        Command::Merge {
            backup_id,
            merge_expired,
        } => {
            let ctx = instance_ctx(&conf, &cli.instance)?;
            let merged = merge::merge_backup(&ctx, backup_id, conf.threads).await?;
            info!("Merge of backup {backup_id} completed into {}", merged.id);
            if merge_expired {
                let opts = DeleteOptions {
                    merge_expired: true,
                    threads: conf.threads,
                    ..Default::default()
                };
                retention::purge(&ctx, ctx.config.retention_policy(), &opts, Utc::now()).await?;
            }
        }
        Command::Restore(args) => {
            let ctx = instance_ctx(&conf, &cli.instance)?;
            run_restore(&ctx, args).await?;
        }
        Command::Validate { backup_id } => {
            let ctx = instance_ctx(&conf, &cli.instance)?;
            match backup_id {
                Some(id) => validate::validate_backup(&ctx, id, conf.threads).await?,
                None => {
                    let failed = validate::validate_instance(&ctx, conf.threads).await?;
                    if !failed.is_empty() {
                        return Err(ArchivistError::Corrupt(format!(
                            "Some backups are not valid: {}",
                            itertools::join(&failed, ", ")
                        ))
                        .into());
                    }
                    info!("All backups are valid");
                }
            }
        }
        Command::Show { backup_id, format } => {
            let instances = match &cli.instance {
                Some(instance) => vec![instance.clone()],
                None => conf.list_instances()?,
            };
            for instance in instances {
                let ctx = InstanceContext::load(&conf, &instance)?;
                let out = match backup_id {
                    Some(id) => show::show_backup(&ctx, id, format)?,
                    None => show::show_backups(&ctx, format)?,
                };
                println!("{out}");
            }
        }
        Command::ShowArchive { format } => {
            let ctx = instance_ctx(&conf, &cli.instance)?;
            println!("{}", show::show_archive(&ctx, format).await?);
        }
        Command::Delete(args) => {
            let ctx = instance_ctx(&conf, &cli.instance)?;
            run_delete(&ctx, args).await?;
        }
        Command::SetBackup {
            backup_id,
            note,
            ttl,
            expire_time,
        } => {
            let ctx = instance_ctx(&conf, &cli.instance)?;
            let now = Utc::now();
            let expire = match ttl {
                Some(ttl) if ttl.is_zero() => Some(None),
                Some(ttl) => Some(Some(now + chrono::Duration::from_std(ttl)?)),
                None => expire_time.map(Some),
            };
            let info = ctx.catalog().update_backup(backup_id, |b| {
                if let Some(note) = note {
                    b.note = (note != "none").then_some(note);
                }
                if let Some(expire) = expire {
                    b.expire_time = expire;
                }
            })?;
            match info.expire_time {
                Some(t) => info!("Backup {backup_id} is pinned until {t}"),
                None => info!("Backup {backup_id} is not pinned"),
            }
        }
    }
    Ok(())
}

async fn run_backup(ctx: &InstanceContext, args: BackupArgs) -> anyhow::Result<()> {
    let mut opts = BackupOptions::new(args.backup_mode, &ctx.config);
    opts.stream = args.stream;
    opts.threads = ctx.conf.threads;
    if let Some(alg) = args.compress_alg {
        opts.compress_alg = alg;
    }
    if let Some(level) = args.compress_level {
        opts.compress_level = level;
    }
    if let Some(dirs) = args.external_dirs {
        opts.external_dirs = dirs;
    }
    if let Some(timeout) = args.archive_timeout {
        opts.archive_timeout = timeout;
    }
    opts.note = args.note;
    opts.ttl = args.ttl;
    opts.expire_time = args.expire_time;

    let server = OfflineCluster::new(ctx.pgdata()?, ctx.config.wal_seg_size);
    let info = take_backup(ctx, &server, &opts).await?;
    info!("Backup {} completed", info.id);

    if args.delete_expired || args.merge_expired || args.delete_wal {
        let delete = DeleteOptions {
            expired: args.delete_expired,
            merge_expired: args.merge_expired,
            wal: args.delete_wal,
            dry_run: false,
            threads: ctx.conf.threads,
        };
        retention::purge(ctx, ctx.config.retention_policy(), &delete, Utc::now()).await?;
    }
    Ok(())
}

async fn run_restore(ctx: &InstanceContext, args: RestoreArgs) -> anyhow::Result<()> {
    let pgdata = match args.pgdata {
        Some(pgdata) => pgdata,
        None => ctx.pgdata()?.to_path_buf(),
    };
    let immediate = match args.recovery_target.as_deref() {
        None => false,
        Some("immediate") => true,
        Some(other) => {
            return Err(error::policy(format!(
                "invalid value for --recovery-target: '{other}', only 'immediate' is supported"
            )));
        }
    };
    let mut opts = RestoreOptions::new(pgdata);
    opts.backup_id = args.backup_id;
    opts.incremental_mode = match args.incremental_mode.as_str() {
        "none" => None,
        mode => Some(mode.parse::<IncrementalMode>().map_err(|_| {
            error::policy(format!(
                "invalid value for --incremental-mode: '{mode}', expected checksum, lsn or none"
            ))
        })?),
    };
    opts.recovery_target = RecoveryTarget {
        lsn: args.recovery_target_lsn,
        time: args.recovery_target_time,
        xid: args.recovery_target_xid,
        tli: args.recovery_target_timeline,
        immediate,
        inclusive: args.recovery_target_inclusive,
        action: args.recovery_target_action,
    };
    opts.db_include = args.db_include;
    opts.db_exclude = args.db_exclude;
    opts.tablespace_mapping = args.tablespace_mapping;
    opts.skip_external_dirs = args.skip_external_dirs;
    opts.threads = ctx.conf.threads;
    opts.no_validate = args.no_validate;
    opts.restore_command = args.restore_command.or_else(|| ctx.config.restore_command.clone());
    opts.no_sync = ctx.conf.no_sync;

    let summary = restore(ctx, &opts).await?;
    info!(
        "Restore of backup {} completed: {} files written, {} unchanged, {} removed",
        summary
            .backup_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".into()),
        summary.files_written,
        summary.files_skipped,
        summary.files_removed
    );
    Ok(())
}

async fn run_delete(ctx: &InstanceContext, args: DeleteArgs) -> anyhow::Result<()> {
    if let Some(id) = args.backup_id {
        let deleted = retention::delete_backup(ctx, id, args.dry_run).await?;
        info!("Deleted backups: {}", itertools::join(&deleted, ", "));
        return Ok(());
    }
    if let Some(status) = args.status {
        let deleted = retention::delete_by_status(ctx, status, args.dry_run).await?;
        info!("Deleted backups: {}", itertools::join(&deleted, ", "));
        return Ok(());
    }
    if !(args.expired || args.merge_expired || args.wal) {
        return Err(error::policy(
            "You must specify at least one of the delete options: --expired, --wal, --merge-expired, --status or (-i, --backup-id)",
        ));
    }

    let mut policy = ctx.config.retention_policy();
    if let Some(redundancy) = args.retention_redundancy {
        policy.redundancy = redundancy;
    }
    if let Some(window) = args.retention_window {
        policy.window_days = window;
    }
    if let Some(depth) = args.wal_depth {
        policy.wal_depth = depth;
    }
    let opts = DeleteOptions {
        expired: args.expired,
        merge_expired: args.merge_expired,
        wal: args.wal,
        dry_run: args.dry_run,
        threads: ctx.conf.threads,
    };
    let report = retention::purge(ctx, policy, &opts, Utc::now()).await?;
    info!(
        "Purge finished: {} merged, {} deleted, {} WAL files removed, {} stale partial files removed",
        report.merged.len(),
        report.deleted.len(),
        report.wal_removed.len(),
        report.transients_removed.len()
    );
    Ok(())
}

fn instance_name(instance: &Option<String>) -> anyhow::Result<&str> {
    instance
        .as_deref()
        .ok_or_else(|| error::policy("required parameter not specified: --instance"))
}

fn instance_ctx(conf: &ArchivistConf, instance: &Option<String>) -> anyhow::Result<InstanceContext> {
    InstanceContext::load(conf, instance_name(instance)?)
}

fn read_system_identifier(pgdata: &Utf8Path) -> anyhow::Result<Option<u64>> {
    let path = pgdata.join(PG_CONTROL_FILE_PATH);
    match std::fs::read(&path) {
        Ok(data) => {
            let control = ControlFileData::decode(&data).with_context(|| format!("failed to decode {path}"))?;
            Ok(Some(control.system_identifier))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("{path} does not exist, system identifier is not recorded");
            Ok(None)
        }
        Err(e) => Err(e).with_context(|| format!("failed to read {path}")),
    }
}

/// archive_command passes `%p`, the path of the file relative to the data
/// directory. The pushed file and its batch siblings are read from its
/// directory.
fn push_source_dir(
    ctx: &InstanceContext,
    wal_file_path: Option<&Utf8Path>,
    wal_file_name: &str,
) -> anyhow::Result<Utf8PathBuf> {
    match wal_file_path {
        Some(path) if path.is_dir() => Ok(path.to_path_buf()),
        Some(path) if path.file_name() == Some(wal_file_name) => Ok(path
            .parent()
            .filter(|p| !p.as_str().is_empty())
            .unwrap_or(Utf8Path::new("."))
            .to_path_buf()),
        Some(path) => Ok(path.to_path_buf()),
        None => match ctx.config.pgdata.as_deref() {
            Some(pgdata) => Ok(pgdata.join("pg_wal")),
            None => Ok(Utf8PathBuf::from(".")),
        },
    }
}

fn parse_key_value(s: &str) -> anyhow::Result<(String, String)> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("expected KEY=VALUE, got '{s}'"))?;
    Ok((key.trim().to_string(), value.trim().to_string()))
}

fn parse_mapping(s: &str) -> anyhow::Result<(Utf8PathBuf, Utf8PathBuf)> {
    let (old, new) = s
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("tablespace mapping format is incorrect, expected OLDDIR=NEWDIR: '{s}'"))?;
    Ok((Utf8PathBuf::from(old), Utf8PathBuf::from(new)))
}

fn parse_time(s: &str) -> Result<DateTime<Utc>, humantime::TimestampError> {
    humantime::parse_rfc3339_weak(s).map(DateTime::<Utc>::from)
}
