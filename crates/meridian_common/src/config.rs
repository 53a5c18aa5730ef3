use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MeridianError, MeridianResult};

/// Top-level node configuration for the transaction core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeridianConfig {
    #[serde(default)]
    pub xact: XactConfig,
    #[serde(default)]
    pub proc: ProcConfig,
    #[serde(default)]
    pub shared_snapshot: SharedSnapshotConfig,
    #[serde(default)]
    pub distrib_cache: DistribCacheConfig,
    #[serde(default)]
    pub wal: WalConfig,
    #[serde(default)]
    pub lock: LockConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct XactConfig {
    /// Warn each time the number of savepoints opened in one transaction
    /// reaches a multiple of this value (0 disables the warning).
    pub subtrans_warn_limit: u32,
    /// Record a skip-link to the ancestor this many frames back.
    pub fast_link_interval: usize,
    /// Unreported sub-transaction ids batched into one assignment record.
    pub assignment_batch_size: usize,
    /// Flush the commit record before reporting success.
    pub synchronous_commit: bool,
    /// Emit assignment records for standby replicas.
    pub standby_logging: bool,
    pub max_prepared_transactions: usize,
}

impl Default for XactConfig {
    fn default() -> Self {
        Self {
            subtrans_warn_limit: 16_777_216,
            fast_link_interval: 100,
            assignment_batch_size: 64,
            synchronous_commit: true,
            standby_logging: true,
            max_prepared_transactions: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcConfig {
    pub max_backends: usize,
    /// Capacity of the per-process sub-transaction id cache.
    pub max_cached_subxids: usize,
}

impl Default for ProcConfig {
    fn default() -> Self {
        Self {
            max_backends: 100,
            max_cached_subxids: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SharedSnapshotConfig {
    /// How long `add`/`lookup` keep retrying before giving up.
    pub add_timeout_secs: u64,
    pub retry_interval_ms: u64,
    /// In-progress id capacity per slot (0 = max_backends + max_prepared_transactions).
    pub max_xip: usize,
    /// Sub-transaction ids kept in the slot before spilling to a side file.
    pub max_inmemory_subxids: usize,
    /// Directory for cursor snapshot and sub-xid spill files (empty = system temp dir).
    pub scratch_dir: String,
}

impl Default for SharedSnapshotConfig {
    fn default() -> Self {
        Self {
            add_timeout_secs: 10,
            retry_interval_ms: 100,
            max_xip: 0,
            max_inmemory_subxids: 64,
            scratch_dir: String::new(),
        }
    }
}

impl SharedSnapshotConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms.max(1))
    }

    /// Number of polling rounds that fit in the configured timeout.
    pub fn max_retries(&self) -> u64 {
        (self.add_timeout_secs * 1000) / self.retry_interval_ms.max(1)
    }

    pub fn scratch_path(&self) -> PathBuf {
        if self.scratch_dir.is_empty() {
            std::env::temp_dir()
        } else {
            PathBuf::from(&self.scratch_dir)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistribCacheConfig {
    /// Maximum cached local→distributed mappings (0 disables the cache).
    pub capacity: usize,
    /// Log hit/miss statistics when a backend exits.
    pub log_stats: bool,
}

impl Default for DistribCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            log_stats: false,
        }
    }
}

/// fsync policy for the durable log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    None,
    FSync,
    FDataSync,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    /// Root directory for the log file, two-phase state and relation files.
    pub data_dir: String,
    pub sync_mode: SyncMode,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            data_dir: "./meridian_data".into(),
            sync_mode: SyncMode::FDataSync,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Wait this long on a lock before running the deadlock check.
    pub deadlock_timeout_ms: u64,
    /// Give up waiting on a lock after this long (0 = wait forever).
    pub lock_timeout_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            deadlock_timeout_ms: 1000,
            lock_timeout_ms: 0,
        }
    }
}

impl MeridianConfig {
    /// Load configuration from a TOML file, falling back to defaults when the
    /// file is missing or unparsable.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to parse config {}: {}, using defaults",
                        path.display(),
                        e
                    );
                    MeridianConfig::default()
                }
            },
            Err(_) => {
                tracing::info!("Config file {} not found, using defaults", path.display());
                MeridianConfig::default()
            }
        }
    }

    /// Strict variant of [`MeridianConfig::load`] for callers that must not
    /// start with defaults.
    pub fn from_toml_str(content: &str) -> MeridianResult<Self> {
        let config: MeridianConfig =
            toml::from_str(content).map_err(|e| MeridianError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> MeridianResult<String> {
        toml::to_string_pretty(self).map_err(|e| MeridianError::Config(e.to_string()))
    }

    pub fn validate(&self) -> MeridianResult<()> {
        if self.proc.max_backends == 0 {
            return Err(MeridianError::Config("proc.max_backends must be > 0".into()));
        }
        if self.xact.fast_link_interval == 0 {
            return Err(MeridianError::Config(
                "xact.fast_link_interval must be > 0".into(),
            ));
        }
        if self.xact.assignment_batch_size == 0 {
            return Err(MeridianError::Config(
                "xact.assignment_batch_size must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Shared snapshot slots: two per prepared transaction, at least one.
    pub fn shared_snapshot_slots(&self) -> usize {
        (2 * self.xact.max_prepared_transactions).max(1)
    }

    /// In-progress id capacity of one shared snapshot slot.
    pub fn max_xip(&self) -> usize {
        if self.shared_snapshot.max_xip > 0 {
            self.shared_snapshot.max_xip
        } else {
            self.proc.max_backends + self.xact.max_prepared_transactions
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.wal.data_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MeridianConfig::default();
        assert_eq!(config.xact.subtrans_warn_limit, 16_777_216);
        assert_eq!(config.shared_snapshot_slots(), 100);
        assert_eq!(config.max_xip(), 150);
        assert_eq!(config.shared_snapshot.max_retries(), 100);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = MeridianConfig::from_toml_str(
            r#"
            [xact]
            max_prepared_transactions = 3

            [wal]
            sync_mode = "none"
            "#,
        )
        .unwrap();
        assert_eq!(config.xact.max_prepared_transactions, 3);
        assert_eq!(config.xact.fast_link_interval, 100);
        assert_eq!(config.wal.sync_mode, SyncMode::None);
        assert_eq!(config.shared_snapshot_slots(), 6);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = MeridianConfig::from_toml_str("[proc]\nmax_backends = 0\n").unwrap_err();
        assert!(err.to_string().contains("max_backends"));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = MeridianConfig::load(&dir.path().join("absent.toml"));
        assert_eq!(config.proc.max_backends, 100);
    }

    #[test]
    fn test_load_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meridian.toml");
        let mut config = MeridianConfig::default();
        config.lock.deadlock_timeout_ms = 250;
        std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();
        let loaded = MeridianConfig::load(&path);
        assert_eq!(loaded.lock.deadlock_timeout_ms, 250);
    }
}
