//! Point-in-time backup and recovery for a PostgreSQL-style cluster.
//!
//! The WAL archive (`wal/<instance>/`) is written by `archive-push` and read
//! by `archive-get`; the backup catalog (`backups/<instance>/`) holds FULL
//! backups and incremental chains on top of them. Merge folds a chain into
//! one FULL backup, retention purges backups and WAL that are no longer
//! needed to restore any kept backup to any point in time.

use std::time::Duration;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};

pub mod archive_get;
pub mod archive_push;
pub mod backup;
pub mod catalog;
pub mod compression;
pub mod config;
pub mod content;
pub mod datafile;
pub mod error;
pub mod merge;
pub mod pglz;
pub mod reconstruct;
pub mod restore;
pub mod retention;
pub mod segment_store;
pub mod server;
pub mod show;
#[cfg(any(test, feature = "testing"))]
pub mod test_utils;
pub mod timeline_index;
pub mod validate;

use catalog::Catalog;
use config::InstanceConfig;
use segment_store::SegmentStore;

pub mod defaults {
    use const_format::formatcp;
    use std::time::Duration;

    pub const DEFAULT_THREADS: usize = 1;
    pub const DEFAULT_COMPRESS_LEVEL: u32 = 1;
    pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::ZERO;
    pub const DEFAULT_PART_TIMEOUT: Duration = Duration::from_secs(300);
    pub const DEFAULT_ARCHIVE_TIMEOUT: Duration = Duration::from_secs(300);
    pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::ZERO;

    pub const PROGRAM_NAME: &str = "archivist";
    pub const PROGRAM_VERSION: &str = env!("CARGO_PKG_VERSION");
    pub const PROGRAM_FULL_VERSION: &str = formatcp!("{PROGRAM_NAME} {PROGRAM_VERSION}");
}

pub const BACKUPS_DIR: &str = "backups";
pub const WAL_DIR: &str = "wal";
pub const INSTANCE_CONFIG_FILE: &str = "instance.toml";

/// Process-wide settings, from the command line.
#[derive(Debug, Clone)]
pub struct ArchivistConf {
    /// Root of the backup catalog (`-B`).
    pub backup_path: Utf8PathBuf,
    pub no_sync: bool,
    pub threads: usize,
    /// Overrides the instance's `lock-timeout` when set.
    pub lock_timeout: Option<Duration>,
}

impl ArchivistConf {
    pub fn new(backup_path: impl Into<Utf8PathBuf>) -> Self {
        ArchivistConf {
            backup_path: backup_path.into(),
            no_sync: false,
            threads: defaults::DEFAULT_THREADS,
            lock_timeout: None,
        }
    }

    pub fn backups_dir(&self) -> Utf8PathBuf {
        self.backup_path.join(BACKUPS_DIR)
    }

    pub fn wal_dir(&self) -> Utf8PathBuf {
        self.backup_path.join(WAL_DIR)
    }

    pub fn instance_backups_dir(&self, instance: &str) -> Utf8PathBuf {
        self.backups_dir().join(instance)
    }

    pub fn instance_wal_dir(&self, instance: &str) -> Utf8PathBuf {
        self.wal_dir().join(instance)
    }

    pub fn instance_config_path(&self, instance: &str) -> Utf8PathBuf {
        self.instance_backups_dir(instance).join(INSTANCE_CONFIG_FILE)
    }

    /// Creates the catalog skeleton. Fails if the directory is already in use.
    pub fn init_catalog(&self) -> anyhow::Result<()> {
        if self.backup_path.exists() && std::fs::read_dir(&self.backup_path)?.next().is_some() {
            return Err(error::policy(format!(
                "backup catalog already exists and is not empty: {}",
                self.backup_path
            )));
        }
        utils::crashsafe::create_dir_all(self.backups_dir())?;
        utils::crashsafe::create_dir_all(self.wal_dir())?;
        Ok(())
    }

    /// Registers a new instance with the given configuration.
    pub fn add_instance(&self, instance: &str, config: &InstanceConfig) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.backups_dir().is_dir(),
            "backup catalog is not initialized at {}",
            self.backup_path
        );
        let backups_dir = self.instance_backups_dir(instance);
        if backups_dir.exists() {
            return Err(error::policy(format!(
                "instance '{instance}' already exists in {}",
                self.backup_path
            )));
        }
        utils::crashsafe::create_dir_all(&backups_dir)?;
        utils::crashsafe::create_dir_all(self.instance_wal_dir(instance))?;
        config.store(&self.instance_config_path(instance), self.no_sync)
    }

    /// Names of registered instances.
    pub fn list_instances(&self) -> anyhow::Result<Vec<String>> {
        let mut names: Vec<String> = utils::fs_ext::list_dir_sync(self.backups_dir())?
            .into_iter()
            .filter(|name| self.instance_config_path(name).exists())
            .collect();
        names.sort();
        Ok(names)
    }
}

/// Everything an operation on one instance needs: where things live and how
/// the instance is configured. Passed explicitly, there is no global state.
#[derive(Debug, Clone)]
pub struct InstanceContext {
    pub conf: ArchivistConf,
    pub instance: String,
    pub config: InstanceConfig,
}

impl InstanceContext {
    pub fn load(conf: &ArchivistConf, instance: &str) -> anyhow::Result<InstanceContext> {
        let path = conf.instance_config_path(instance);
        if !path.exists() {
            return Err(error::policy(format!(
                "instance '{instance}' does not exist in {}",
                conf.backup_path
            )));
        }
        let config = InstanceConfig::load(&path)
            .with_context(|| format!("failed to load configuration of instance '{instance}'"))?;
        Ok(InstanceContext {
            conf: conf.clone(),
            instance: instance.to_string(),
            config,
        })
    }

    pub fn backups_dir(&self) -> Utf8PathBuf {
        self.conf.instance_backups_dir(&self.instance)
    }

    pub fn wal_dir(&self) -> Utf8PathBuf {
        self.conf.instance_wal_dir(&self.instance)
    }

    pub fn lock_timeout(&self) -> Duration {
        self.conf.lock_timeout.unwrap_or(self.config.lock_timeout)
    }

    pub fn catalog(&self) -> Catalog {
        Catalog::new(self.backups_dir(), self.conf.no_sync, self.lock_timeout())
    }

    pub fn wal_store(&self) -> SegmentStore {
        SegmentStore::new(self.wal_dir(), self.config.wal_seg_size, self.conf.no_sync)
    }

    pub fn save_config(&self) -> anyhow::Result<()> {
        self.config.store(
            &self.conf.instance_config_path(&self.instance),
            self.conf.no_sync,
        )
    }

    pub fn pgdata(&self) -> anyhow::Result<&Utf8Path> {
        self.config
            .pgdata
            .as_deref()
            .ok_or_else(|| error::policy(format!("pgdata is not set for instance '{}'", self.instance)))
    }
}
