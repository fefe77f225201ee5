use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Socket path the guest-side plugin connects to by default
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/.sound/AServer";

/// Returns the path to the settings file: `~/.config/aserver/settings.json`
fn settings_path() -> PathBuf {
    let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push("aserver");
    path.push("settings.json");
    path
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse settings: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Malformed option entry '{0}' (expected key=value)")]
    MalformedEntry(String),

    #[error("Invalid value '{value}' for option '{key}'")]
    InvalidValue { key: String, value: String },
}

/// Host performance hint, numbered as the launcher passes it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PerformanceMode {
    None,
    #[default]
    LowLatency,
    PowerSaving,
}

impl PerformanceMode {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::None),
            1 => Some(Self::LowLatency),
            2 => Some(Self::PowerSaving),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::None => 0,
            Self::LowLatency => 1,
            Self::PowerSaving => 2,
        }
    }
}

/// Per-stream audio options, fixed for the life of a client
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioOptions {
    /// Target latency used to answer buffer size queries
    pub latency_millis: u16,
    pub performance_mode: PerformanceMode,
    /// Output volume (0.0 to 1.0)
    pub volume: f32,
}

impl Default for AudioOptions {
    fn default() -> Self {
        Self {
            latency_millis: 16,
            performance_mode: PerformanceMode::LowLatency,
            volume: 1.0,
        }
    }
}

impl AudioOptions {
    /// Parse the launcher's `key=value,key=value` option string.
    ///
    /// Recognised keys are `latencyMillis`, `performanceMode` and `volume`;
    /// anything else is ignored. Missing keys keep their defaults.
    pub fn from_key_values(input: &str) -> Result<Self, ConfigError> {
        let mut options = Self::default();

        for entry in input.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (key, value) = entry
                .split_once('=')
                .ok_or_else(|| ConfigError::MalformedEntry(entry.to_string()))?;
            let (key, value) = (key.trim(), value.trim());
            let invalid = || ConfigError::InvalidValue {
                key: key.to_string(),
                value: value.to_string(),
            };

            match key {
                "latencyMillis" => {
                    options.latency_millis = value.parse().map_err(|_| invalid())?;
                }
                "performanceMode" => {
                    let code: u8 = value.parse().map_err(|_| invalid())?;
                    options.performance_mode =
                        PerformanceMode::from_code(code).ok_or_else(invalid)?;
                }
                "volume" => {
                    let volume: f32 = value.parse().map_err(|_| invalid())?;
                    if !volume.is_finite() || volume < 0.0 {
                        return Err(invalid());
                    }
                    options.volume = volume.min(1.0);
                }
                other => log::debug!("Ignoring unknown audio option '{}'", other),
            }
        }

        Ok(options)
    }
}

/// Persisted server settings.
///
/// Serialized as JSON to the platform config directory.
/// Fields use `#[serde(default)]` so that adding new settings
/// won't break existing config files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub socket_path: PathBuf,
    /// Offer a shared memory segment on PREPARE
    pub use_shm: bool,
    /// Serve each connection on its own thread
    pub multithreaded_clients: bool,
    pub audio: AudioOptions,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            use_shm: true,
            multithreaded_clients: true,
            audio: AudioOptions::default(),
        }
    }
}

impl ServerSettings {
    /// Load settings from disk, falling back to defaults on any error.
    pub fn load() -> Self {
        let path = settings_path();
        match Self::load_from(&path) {
            Ok(settings) => {
                log::info!("Loaded settings from {}", path.display());
                settings
            }
            Err(ConfigError::Read { source, .. }) => {
                log::info!("No settings file found ({}), using defaults", source);
                Self::default()
            }
            Err(e) => {
                log::warn!("{}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Load settings from an explicit file
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Save settings to disk as pretty JSON.
    pub fn save(&self) {
        let path = settings_path();
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                log::warn!("Failed to create config directory: {}", e);
                return;
            }
        }
        match serde_json::to_string_pretty(self) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&path, json) {
                    log::warn!("Failed to write settings: {}", e);
                }
            }
            Err(e) => {
                log::warn!("Failed to serialize settings: {}", e);
            }
        }
    }
}
