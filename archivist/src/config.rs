//! Per-instance configuration, stored as `backups/<instance>/instance.toml`.

use std::time::Duration;

use anyhow::{Context, bail};
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use serde_with::{DisplayFromStr, serde_as};
use utils::crashsafe::{overwrite_with_sync, path_with_suffix_extension};

use crate::compression::CompressAlg;
use crate::defaults::*;

/// Options that are omitted from the file when unset.
const OPTIONAL_KEYS: &[&str] = &[
    "pgdata",
    "system-identifier",
    "restore-command",
    "external-dirs",
];

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct InstanceConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pgdata: Option<Utf8PathBuf>,
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_identifier: Option<u64>,
    pub wal_seg_size: usize,
    pub block_size: usize,

    pub compress_alg: CompressAlg,
    pub compress_level: u32,

    /// Number of FULL backups to keep, 0 = unlimited.
    pub retention_redundancy: u32,
    /// Days of recoverability to keep, 0 = unlimited.
    pub retention_window: u32,
    /// Number of valid backups on each timeline whose WAL stays
    /// restorable to any point in time, 0 = only what backups need.
    pub wal_depth: u32,

    #[serde(with = "humantime_serde")]
    pub archive_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub lock_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub part_timeout: Duration,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub restore_command: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub external_dirs: Vec<Utf8PathBuf>,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        InstanceConfig {
            pgdata: None,
            system_identifier: None,
            wal_seg_size: pg_xlog::DEFAULT_WAL_SEG_SIZE,
            block_size: pg_xlog::BLCKSZ,
            compress_alg: CompressAlg::None,
            compress_level: DEFAULT_COMPRESS_LEVEL,
            retention_redundancy: 0,
            retention_window: 0,
            wal_depth: 0,
            archive_timeout: DEFAULT_ARCHIVE_TIMEOUT,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            part_timeout: DEFAULT_PART_TIMEOUT,
            restore_command: None,
            external_dirs: Vec::new(),
        }
    }
}

impl InstanceConfig {
    pub fn load(path: &Utf8Path) -> anyhow::Result<InstanceConfig> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read instance config at {path}"))?;
        let config: InstanceConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse instance config at {path}"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn store(&self, path: &Utf8Path, no_sync: bool) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self).context("failed to serialize instance config")?;
        overwrite_with_sync(
            path,
            &path_with_suffix_extension(path, "tmp"),
            content.as_bytes(),
            !no_sync,
        )
        .with_context(|| format!("failed to write instance config at {path}"))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !pg_xlog::is_valid_wal_seg_size(self.wal_seg_size) {
            bail!("invalid wal-seg-size {}", self.wal_seg_size);
        }
        if self.block_size != pg_xlog::BLCKSZ {
            bail!(
                "unsupported block-size {}, only {} is supported",
                self.block_size,
                pg_xlog::BLCKSZ
            );
        }
        self.compress_alg.validate_level(self.compress_level)?;
        Ok(())
    }

    fn to_table(&self) -> anyhow::Result<toml::Table> {
        match toml::Value::try_from(self).context("failed to serialize config")? {
            toml::Value::Table(table) => Ok(table),
            other => bail!("config serialized to {}", other.type_str()),
        }
    }

    /// Sets one option by its kebab-case name, as `set-config` does.
    /// The value is parsed according to the type of the option.
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut table = self.to_table()?;
        let parsed = match table.get(key) {
            Some(toml::Value::Integer(_)) => toml::Value::Integer(
                value
                    .parse()
                    .with_context(|| format!("option {key} expects an integer, got '{value}'"))?,
            ),
            Some(toml::Value::Boolean(_)) => toml::Value::Boolean(
                value
                    .parse()
                    .with_context(|| format!("option {key} expects a boolean, got '{value}'"))?,
            ),
            _ if key == "external-dirs" => toml::Value::Array(
                value
                    .split(':')
                    .filter(|s| !s.is_empty())
                    .map(|s| toml::Value::String(s.to_string()))
                    .collect(),
            ),
            _ => toml::Value::String(value.to_string()),
        };
        table.insert(key.to_string(), parsed);
        let updated: InstanceConfig = toml::Value::Table(table)
            .try_into()
            .with_context(|| format!("invalid value '{value}' for option {key}"))?;
        updated.validate()?;
        *self = updated;
        Ok(())
    }

    /// Removes an optional setting, falling back to its default.
    pub fn unset(&mut self, key: &str) -> anyhow::Result<()> {
        let mut table = self.to_table()?;
        let known = InstanceConfig::default().to_table()?.contains_key(key)
            || OPTIONAL_KEYS.contains(&key);
        if !known {
            bail!("unknown option {key}");
        }
        table.remove(key);
        let updated: InstanceConfig = toml::Value::Table(table)
            .try_into()
            .with_context(|| format!("failed to reset option {key}"))?;
        *self = updated;
        Ok(())
    }

    pub fn retention_policy(&self) -> crate::retention::RetentionPolicy {
        crate::retention::RetentionPolicy {
            redundancy: self.retention_redundancy,
            window_days: self.retention_window,
            wal_depth: self.wal_depth,
        }
    }
}
