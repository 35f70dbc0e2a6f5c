//! Persistent CLI settings

use std::path::PathBuf;

use cell_detect::{ProbeConfig, ScannerConfig};
use cell_mux::{CmuxParams, ConfOptions, MuxConfig};
use serde::{Deserialize, Serialize};

/// Settings loaded from `settings.json`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Serial port used when `--port` is not given
    pub port: Option<String>,
    /// Baud rate used when `--baud` is not given
    pub baud_rate: u32,
    /// Baud rates tried by `probe`
    pub baud_rates: Vec<u32>,
    /// `AT+CMUX` parameters
    pub cmux: CmuxParams,
    /// Modem configuration run before multiplexing
    pub configure: ConfOptions,
    /// Multiplexer tuning
    pub mux: MuxConfig,
    /// Port probing
    pub probe: ProbeConfig,
    /// Port enumeration
    pub scanner: ScannerConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: 115200,
            baud_rates: cell_detect::DEFAULT_BAUDS.to_vec(),
            cmux: CmuxParams::default(),
            configure: ConfOptions::default(),
            mux: MuxConfig::default(),
            probe: ProbeConfig::default(),
            scanner: ScannerConfig::default(),
        }
    }
}

impl Settings {
    /// Get the XDG config directory for cellmux
    /// Uses $XDG_CONFIG_HOME/cellmux, falls back to ~/.config/cellmux
    fn config_dir() -> Option<PathBuf> {
        if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
            let path = PathBuf::from(xdg_config);
            if path.is_absolute() {
                return Some(path.join("cellmux"));
            }
        }

        dirs::home_dir().map(|h| h.join(".config").join("cellmux"))
    }

    /// Get the settings file path
    pub fn settings_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("settings.json"))
    }

    /// Load settings from `path`, or the default location
    ///
    /// A missing or unreadable file yields the defaults.
    pub fn load(path: Option<PathBuf>) -> Self {
        path.or_else(Self::settings_path)
            .and_then(|path| std::fs::read_to_string(path).ok())
            .and_then(|s| Self::from_json(&s).ok())
            .unwrap_or_default()
    }

    /// Parse settings, filling missing fields with defaults
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Save settings to the default location
    pub fn save(&self) -> Result<PathBuf, String> {
        let path =
            Self::settings_path().ok_or_else(|| "Could not determine settings path".to_string())?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create settings directory: {}", e))?;
        }

        let json = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize settings: {}", e))?;

        std::fs::write(&path, json).map_err(|e| format!("Failed to write settings: {}", e))?;

        Ok(path)
    }
}
