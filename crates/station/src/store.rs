//! Persisted, remotely tunable station configuration.
//!
//! The record is a small JSON object written with a temp-file + rename so a
//! reader never observes a half-written file.  Anything unreadable on load is
//! treated as absent and replaced by the defaults.

use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::StorageError;

pub const DEFAULT_MOISTURE_LIMIT: u8 = 15;
pub const DEFAULT_PUMP_ACTIVE_SECONDS: u32 = 5;
pub const DEFAULT_MEASUREMENT_INTERVAL_SECONDS: u32 = 3600;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationConfig {
    /// Irrigate when soil moisture drops below this percentage.
    #[serde(rename = "MOISTURE_LIMIT", alias = "MOISTURELIMIT")]
    pub moisture_limit: u8,

    #[serde(rename = "ACTIVE_PUMP_FOR")]
    pub pump_active_seconds: u32,

    #[serde(rename = "MISURATION_INTERVAL")]
    pub measurement_interval_seconds: u32,

    /// Local ISO-8601 time of the last irrigation, empty if never.
    #[serde(rename = "LAST_IRRIGATION", deserialize_with = "last_irrigation")]
    pub last_irrigation_timestamp: String,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            moisture_limit: DEFAULT_MOISTURE_LIMIT,
            pump_active_seconds: DEFAULT_PUMP_ACTIVE_SECONDS,
            measurement_interval_seconds: DEFAULT_MEASUREMENT_INTERVAL_SECONDS,
            last_irrigation_timestamp: String::new(),
        }
    }
}

impl StationConfig {
    fn is_valid(&self) -> bool {
        self.moisture_limit <= 100 && self.measurement_interval_seconds > 0
    }
}

/// Older stations stored `0` for "never irrigated".
fn last_irrigation<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(i64),
    }

    Ok(match Raw::deserialize(d)? {
        Raw::Text(s) => s,
        Raw::Number(0) => String::new(),
        Raw::Number(n) => n.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the persisted configuration.  A missing, empty, malformed or
    /// out-of-range record yields the defaults, which are written back.
    pub fn load(&self) -> StationConfig {
        match self.read() {
            Some(cfg) => {
                tracing::info!(
                    path = %self.path.display(),
                    moisture_limit = cfg.moisture_limit,
                    pump_active_seconds = cfg.pump_active_seconds,
                    measurement_interval_seconds = cfg.measurement_interval_seconds,
                    "station config loaded"
                );
                cfg
            }
            None => {
                let cfg = StationConfig::default();
                if let Err(e) = self.save(&cfg) {
                    tracing::error!("writing default station config failed: {e}");
                }
                cfg
            }
        }
    }

    fn read(&self) -> Option<StationConfig> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), "no station config ({e}), using defaults");
                return None;
            }
        };

        if contents.trim().is_empty() {
            tracing::warn!(path = %self.path.display(), "station config is empty, using defaults");
            return None;
        }

        // Older firmware wrote the record with single quotes.
        let parsed = serde_json::from_str::<StationConfig>(&contents).or_else(|e| {
            serde_json::from_str::<StationConfig>(&contents.replace('\'', "\"")).map_err(|_| e)
        });

        match parsed {
            Ok(cfg) if cfg.is_valid() => Some(cfg),
            Ok(cfg) => {
                tracing::warn!(?cfg, "station config out of range, using defaults");
                None
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), "station config malformed ({e}), using defaults");
                None
            }
        }
    }

    /// Write the whole record atomically.  Only call this when the in-memory
    /// copy is dirty: every call costs a flash erase cycle.
    pub fn save(&self, cfg: &StationConfig) -> Result<(), StorageError> {
        let body = serde_json::to_vec(cfg)?;
        let tmp = self.tmp_path();

        let write = |path: &Path| -> std::io::Result<()> {
            let mut f = fs::File::create(path)?;
            f.write_all(&body)?;
            f.sync_all()
        };

        write(&tmp).map_err(|source| StorageError::Write {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &self.path).map_err(|source| StorageError::Write {
            path: self.path.clone(),
            source,
        })?;

        tracing::debug!(path = %self.path.display(), "station config saved");
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
