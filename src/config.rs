use crate::error::{CourierError, Result};
use crate::logging::log_debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_MULTIPART_THRESHOLD: u64 = 16_777_216;
pub const DEFAULT_MINIMUM_CHUNK_SIZE: u64 = 8_388_608;
pub const DEFAULT_MAXIMUM_CHUNK_COUNT: u64 = 900;
pub const DEFAULT_STATISTICS_INTERVAL_MS: u64 = 250;
pub const DEFAULT_RETENTION_DAYS: u32 = 30;
pub const DEFAULT_STATUS_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CourierConfig {
    pub data_directory: PathBuf,
    pub multipart_threshold: u64,
    pub minimum_chunk_size: u64,
    pub maximum_chunk_count: u64,
    pub statistics_interval_ms: u64,
    pub retention_days: u32,
    pub status_channel_capacity: usize,
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            data_directory: default_data_directory(),
            multipart_threshold: DEFAULT_MULTIPART_THRESHOLD,
            minimum_chunk_size: DEFAULT_MINIMUM_CHUNK_SIZE,
            maximum_chunk_count: DEFAULT_MAXIMUM_CHUNK_COUNT,
            statistics_interval_ms: DEFAULT_STATISTICS_INTERVAL_MS,
            retention_days: DEFAULT_RETENTION_DAYS,
            status_channel_capacity: DEFAULT_STATUS_CHANNEL_CAPACITY,
        }
    }
}

impl CourierConfig {
    /// Configuration rooted at a specific data directory
    pub fn with_data_directory(data_directory: impl Into<PathBuf>) -> Self {
        Self {
            data_directory: data_directory.into(),
            ..Self::default()
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_directory.join("courier.db")
    }

    pub fn logs_directory(&self) -> PathBuf {
        self.data_directory.join("logs")
    }

    pub fn statistics_interval(&self) -> Duration {
        Duration::from_millis(self.statistics_interval_ms)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }

    pub fn validate(&self) -> Result<()> {
        if self.maximum_chunk_count == 0 {
            return Err(CourierError::Config(
                "maximumChunkCount must be at least 1".to_string(),
            ));
        }
        if self.minimum_chunk_size == 0 {
            return Err(CourierError::Config(
                "minimumChunkSize must be positive".to_string(),
            ));
        }
        if self.multipart_threshold < self.minimum_chunk_size {
            return Err(CourierError::Config(format!(
                "multipartThreshold ({}) is below minimumChunkSize ({})",
                self.multipart_threshold, self.minimum_chunk_size
            )));
        }
        if self.statistics_interval_ms == 0 {
            return Err(CourierError::Config(
                "statisticsIntervalMs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_data_directory() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("s3-courier")
}

pub fn default_config_file_path() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|dir| dir.join("s3-courier").join("config.json"))
        .ok_or_else(|| CourierError::Config("Could not find config directory".to_string()))
}

pub fn ensure_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;

        // Set permissions to 700 (read/write/execute for owner only) on Unix systems
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let metadata = fs::metadata(dir)?;
            let mut permissions = metadata.permissions();
            permissions.set_mode(0o700);
            fs::set_permissions(dir, permissions)?;
        }
    }
    Ok(())
}

pub fn load_config(path: &Path) -> Result<CourierConfig> {
    if !path.exists() {
        log_debug("config", &format!("No config at {}, using defaults", path.display()))
            .unwrap_or_default();
        return Ok(CourierConfig::default());
    }

    let content = fs::read_to_string(path)?;
    let config: CourierConfig = serde_json::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

pub fn save_config(path: &Path, config: &CourierConfig) -> Result<()> {
    config.validate()?;
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }

    let content = serde_json::to_string_pretty(config)?;
    fs::write(path, content)?;

    // Set permissions to 600 (read/write for owner only) on Unix systems
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let metadata = fs::metadata(path)?;
        let mut permissions = metadata.permissions();
        permissions.set_mode(0o600);
        fs::set_permissions(path, permissions)?;
    }

    Ok(())
}
