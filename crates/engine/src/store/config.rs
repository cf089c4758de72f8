//! Message store configuration via `msgstore.toml`
//!
//! A default `msgstore.toml` can be written next to the data on first use.
//! Settings are read once at `initialize()`; to change them, edit the file
//! and start a fresh store instance.

use msgstore_core::{StoreError, StoreResult};
use msgstore_durability::{PersistenceConfig, PersistenceKind, SyncPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Config file name placed in the data directory.
pub const CONFIG_FILE_NAME: &str = "msgstore.toml";

const MIB: u64 = 1024 * 1024;

fn default_log_directory() -> PathBuf {
    PathBuf::from("log")
}

fn default_permanent_store_directory() -> PathBuf {
    PathBuf::from("permanent")
}

fn default_temporary_store_directory() -> PathBuf {
    PathBuf::from("temporary")
}

fn default_persistence_str() -> String {
    "file".to_string()
}

fn default_expiry_interval_ms() -> i64 {
    1000
}

fn default_spill_upper_limit() -> u64 {
    100_000
}

fn default_spill_lower_limit() -> u64 {
    50_000
}

fn default_permanent_store_file_max_size() -> u64 {
    256 * MIB
}

fn default_log_file_size() -> u64 {
    16 * MIB
}

fn default_unique_id_block_size() -> u64 {
    1000
}

fn default_stop_timeout_ms() -> u64 {
    5000
}

/// Message store configuration loaded from `msgstore.toml`.
///
/// # Example
///
/// ```toml
/// persistence = "file"
/// log_directory = "/var/lib/msgstore/log"
/// expiry_interval_ms = 500
/// spill_upper_limit = 10000
/// spill_lower_limit = 5000
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreConfig {
    /// Delete all persisted data when the store starts.
    #[serde(default)]
    pub clean_persistence_on_start: bool,
    /// Directory holding the transaction log.
    #[serde(default = "default_log_directory")]
    pub log_directory: PathBuf,
    /// Directory holding the checkpointed permanent store.
    #[serde(default = "default_permanent_store_directory")]
    pub permanent_store_directory: PathBuf,
    /// Directory holding spilled records.
    #[serde(default = "default_temporary_store_directory")]
    pub temporary_store_directory: PathBuf,
    /// Persistence manager: `"file"` or `"memory"`.
    #[serde(default = "default_persistence_str")]
    pub persistence: String,
    /// Expirer scan interval in milliseconds; below 1 disables the expirer.
    #[serde(default = "default_expiry_interval_ms")]
    pub expiry_interval_ms: i64,
    /// Stream occupancy at which spilling starts.
    #[serde(default = "default_spill_upper_limit")]
    pub spill_upper_limit: u64,
    /// Stream occupancy at which spilling stops.
    #[serde(default = "default_spill_lower_limit")]
    pub spill_lower_limit: u64,
    /// Maximum size of the permanent store file in bytes.
    #[serde(default = "default_permanent_store_file_max_size")]
    pub permanent_store_file_max_size: u64,
    /// Log size in bytes that triggers a checkpoint.
    #[serde(default = "default_log_file_size")]
    pub log_file_size: u64,
    /// Bytes of in-memory item data allowed; 0 is unlimited.
    #[serde(default)]
    pub cache_size_limit: u64,
    /// Ids reserved per durable reservation.
    #[serde(default = "default_unique_id_block_size")]
    pub unique_id_block_size: u64,
    /// Drain timeout used by `stop_default()`, in milliseconds.
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            clean_persistence_on_start: false,
            log_directory: default_log_directory(),
            permanent_store_directory: default_permanent_store_directory(),
            temporary_store_directory: default_temporary_store_directory(),
            persistence: default_persistence_str(),
            expiry_interval_ms: default_expiry_interval_ms(),
            spill_upper_limit: default_spill_upper_limit(),
            spill_lower_limit: default_spill_lower_limit(),
            permanent_store_file_max_size: default_permanent_store_file_max_size(),
            log_file_size: default_log_file_size(),
            cache_size_limit: 0,
            unique_id_block_size: default_unique_id_block_size(),
            stop_timeout_ms: default_stop_timeout_ms(),
        }
    }
}

impl StoreConfig {
    /// File-backed configuration with all three directories under `dir`.
    pub fn for_directory(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            log_directory: dir.join(default_log_directory()),
            permanent_store_directory: dir.join(default_permanent_store_directory()),
            temporary_store_directory: dir.join(default_temporary_store_directory()),
            ..Self::default()
        }
    }

    /// Load `msgstore.toml` from `dir`, writing the default file first if
    /// there is none. Relative store directories are resolved against `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the file
    /// cannot be read, parsed or validated.
    pub fn load_from_directory(dir: impl AsRef<Path>) -> StoreResult<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = dir.join(CONFIG_FILE_NAME);
        Self::write_default_if_missing(&path)?;
        let mut config = Self::from_file(&path)?;
        for directory in [
            &mut config.log_directory,
            &mut config.permanent_store_directory,
            &mut config.temporary_store_directory,
        ] {
            if directory.is_relative() {
                *directory = dir.join(&*directory);
            }
        }
        Ok(config)
    }

    /// Configuration that persists nothing.
    pub fn in_memory() -> Self {
        Self {
            persistence: "memory".to_string(),
            ..Self::default()
        }
    }

    /// Parse the persistence selector.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not `"file"` or `"memory"`.
    pub fn persistence_kind(&self) -> StoreResult<PersistenceKind> {
        PersistenceKind::from_str(&self.persistence)
    }

    /// Expirer interval, or `None` when the expirer is disabled.
    pub fn expiry_interval(&self) -> Option<Duration> {
        if self.expiry_interval_ms < 1 {
            None
        } else {
            Some(Duration::from_millis(self.expiry_interval_ms as u64))
        }
    }

    /// Drain timeout used by `stop_default()`.
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    /// Check every option.
    pub fn validate(&self) -> StoreResult<()> {
        self.persistence_kind()?;
        if self.spill_lower_limit >= self.spill_upper_limit {
            return Err(StoreError::invalid_config(format!(
                "spill_lower_limit ({}) must be below spill_upper_limit ({})",
                self.spill_lower_limit, self.spill_upper_limit
            )));
        }
        if self.log_file_size == 0 {
            return Err(StoreError::invalid_config("log_file_size must be positive"));
        }
        if self.permanent_store_file_max_size == 0 {
            return Err(StoreError::invalid_config(
                "permanent_store_file_max_size must be positive",
            ));
        }
        if self.unique_id_block_size == 0 {
            return Err(StoreError::invalid_config(
                "unique_id_block_size must be positive",
            ));
        }
        Ok(())
    }

    /// Settings handed to the persistence manager.
    pub fn persistence_config(&self) -> PersistenceConfig {
        PersistenceConfig {
            log_directory: self.log_directory.clone(),
            permanent_store_directory: self.permanent_store_directory.clone(),
            temporary_store_directory: self.temporary_store_directory.clone(),
            log_file_size: self.log_file_size,
            permanent_store_file_max_size: self.permanent_store_file_max_size,
            sync_policy: SyncPolicy::default(),
        }
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Message store configuration
#
# Persistence manager: "file" (default) or "memory"
#   "file"   = transaction log + checkpointed permanent store
#   "memory" = nothing survives a restart
persistence = "file"

# Remove all persisted data when the store starts (default: false)
clean_persistence_on_start = false

# Store directories, relative to the working directory unless absolute
log_directory = "log"
permanent_store_directory = "permanent"
temporary_store_directory = "temporary"

# Expirer scan interval in milliseconds; a value below 1 disables expiry
expiry_interval_ms = 1000

# A stream starts spilling at the upper limit and stops at the lower limit
spill_upper_limit = 100000
spill_lower_limit = 50000

# Permanent store file size limit in bytes (default 256 MiB)
permanent_store_file_max_size = 268435456

# Log size in bytes that triggers a checkpoint (default 16 MiB)
log_file_size = 16777216

# In-memory item data limit in bytes; 0 means unlimited
cache_size_limit = 0

# Ids reserved per durable reservation
unique_id_block_size = 1000

# Default drain timeout for stop, in milliseconds
stop_timeout_ms = 5000
"#
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> StoreResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            StoreError::invalid_config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config: StoreConfig = toml::from_str(&content).map_err(|e| {
            StoreError::invalid_config(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    ///
    /// Returns `Ok(())` whether the file was created or already existed.
    pub fn write_default_if_missing(path: &Path) -> StoreResult<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                StoreError::internal(format!(
                    "Failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> StoreResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| StoreError::internal(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            StoreError::internal(format!(
                "Failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }
}
