//! # Configuration Module
//!
//! User settings and platform data locations for Rotation.
//!
//! ## Settings
//!
//! Settings live in a JSON file, by default
//! `<config dir>/rotation/config.json`. The first run writes the defaults
//! there so users have something to edit. Any field may be omitted; a
//! missing field takes its default.
//!
//! ```json
//! {
//!   "music_dir": "/home/me/Music",
//!   "max_playlist_size": 25,
//!   "min_track_secs": 90,
//!   "socket_path": "/tmp/rotation.sock",
//!   "player_command": ["ffplay", "-nodisp", "-autoexit", "-loglevel", "quiet"],
//!   "tick_ms": 250
//! }
//! ```
//!
//! ## Data Storage
//!
//! The library cache is kept in the platform data directory:
//! - Linux: `~/.local/share/rotation/library.json`
//! - macOS: `~/Library/Application Support/rotation/library.json`

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Subdirectory name under the platform config and data dirs.
pub const APP_DIR: &str = "rotation";

/// Playlist size used when the configured value is zero.
pub const DEFAULT_PLAYLIST_SIZE: usize = 25;

/// Returns the platform data directory for Rotation, creating it if needed.
///
/// # Errors
///
/// Returns an error if the system data directory is unknown or the
/// subdirectory cannot be created.
pub fn get_data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir().ok_or_else(|| {
        anyhow::anyhow!("Could not determine system data directory. Pass --cache to choose a location.")
    })?;

    let dir = data_dir.join(APP_DIR);
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create data directory at {}", dir.display()))?;
    Ok(dir)
}

/// Returns the platform config directory for Rotation, creating it if needed.
///
/// # Errors
///
/// Same conditions as [`get_data_dir`].
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir().ok_or_else(|| {
        anyhow::anyhow!("Could not determine system config directory. Pass --config to choose a file.")
    })?;

    let dir = config_dir.join(APP_DIR);
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create config directory at {}", dir.display()))?;
    Ok(dir)
}

/// `<config dir>/rotation/config.json`
pub fn default_config_path() -> Result<PathBuf> {
    Ok(get_config_dir()?.join("config.json"))
}

/// `<data dir>/rotation/library.json`
pub fn default_cache_path() -> Result<PathBuf> {
    Ok(get_data_dir()?.join("library.json"))
}

fn default_music_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join("Music"))
        .unwrap_or_else(|| PathBuf::from("Music"))
}

fn default_max_playlist_size() -> usize {
    DEFAULT_PLAYLIST_SIZE
}

fn default_min_track_secs() -> u64 {
    90
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/tmp/rotation.sock")
}

fn default_player_command() -> Vec<String> {
    ["ffplay", "-nodisp", "-autoexit", "-loglevel", "quiet"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_tick_ms() -> u64 {
    250
}

/// User-editable settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_music_dir")]
    pub music_dir: PathBuf,
    /// Zero means [`DEFAULT_PLAYLIST_SIZE`].
    #[serde(default = "default_max_playlist_size")]
    pub max_playlist_size: usize,
    #[serde(default = "default_min_track_secs")]
    pub min_track_secs: u64,
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    /// Program and leading arguments; the track path is appended.
    #[serde(default = "default_player_command")]
    pub player_command: Vec<String>,
    /// How often the now-playing snapshot is refreshed.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            music_dir: default_music_dir(),
            max_playlist_size: default_max_playlist_size(),
            min_track_secs: default_min_track_secs(),
            socket_path: default_socket_path(),
            player_command: default_player_command(),
            tick_ms: default_tick_ms(),
        }
    }
}

impl Config {
    /// Read the config at `path`, writing the defaults there if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed, or
    /// if the defaults cannot be written.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(text) => {
                let config: Config = serde_json::from_str(&text)
                    .with_context(|| format!("Malformed config file {}", path.display()))?;
                log::debug!("Loaded config from {}", path.display());
                Ok(config)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                let config = Config::default();
                config.write_to(path)?;
                log::info!("Wrote default config to {}", path.display());
                Ok(config)
            }
            Err(e) => Err(e).with_context(|| format!("Failed to read config file {}", path.display())),
        }
    }

    /// Write this config as pretty JSON, creating parent directories.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }

        let text = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, text).with_context(|| format!("Failed to write config file {}", path.display()))
    }

    /// Effective playlist capacity.
    #[must_use]
    pub fn playlist_capacity(&self) -> usize {
        if self.max_playlist_size == 0 {
            DEFAULT_PLAYLIST_SIZE
        } else {
            self.max_playlist_size
        }
    }

    #[must_use]
    pub fn min_track_duration(&self) -> Duration {
        Duration::from_secs(self.min_track_secs)
    }

    /// Snapshot refresh interval, never below 10ms.
    #[must_use]
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(10))
    }
}

/// File locations chosen for this run, after command-line overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub config_path: PathBuf,
    pub cache_path: PathBuf,
    /// Overrides [`Config::socket_path`] when set.
    pub socket_path: Option<PathBuf>,
}

impl RuntimeConfig {
    /// Fill unset paths with the platform defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a default is needed but the platform directory
    /// cannot be determined or created.
    pub fn resolve(config_path: Option<PathBuf>, cache_path: Option<PathBuf>, socket_path: Option<PathBuf>) -> Result<Self> {
        let config_path = match config_path {
            Some(path) => path,
            None => default_config_path()?,
        };
        let cache_path = match cache_path {
            Some(path) => path,
            None => default_cache_path()?,
        };

        Ok(Self {
            config_path,
            cache_path,
            socket_path,
        })
    }

    /// The socket to coordinate on.
    #[must_use]
    pub fn socket_for(&self, config: &Config) -> PathBuf {
        self.socket_path
            .clone()
            .unwrap_or_else(|| config.socket_path.clone())
    }
}
