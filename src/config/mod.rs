//! Configuration management for DroidMirror
//!
//! This module handles client configuration including:
//! - Device server launch options (size, bitrate, fps, encoder)
//! - Connection options (timeouts, buffers, ADB server address)
//! - Loading and saving the TOML configuration file
//! - Configuration validation

use crate::error::{ConfigError, ConfigResult};
use crate::logging::LogLevel;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE_NAME: &str = "config.toml";

const DEFAULT_SERVER_PATH: &str = "scrcpy-server.jar";
const DEFAULT_SERVER_LOG_LEVEL: &str = "info";
const DEFAULT_BITRATE: u32 = 8_000_000;
const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 3000;
const DEFAULT_RECEIVE_BUFFER_SIZE: usize = 0x10000;
const DEFAULT_ADB_HOST: &str = "127.0.0.1";
const DEFAULT_ADB_PORT: u16 = 5037;
const DEFAULT_SOCKET_NAME: &str = "scrcpy";

const MIN_RECEIVE_BUFFER_SIZE: usize = 1024;
const MAX_FPS: u16 = 240;

/// Lock screen orientation: follow the device
pub const LOCK_SCREEN_ORIENTATION_UNLOCKED: i32 = -1;
/// Lock screen orientation: natural orientation
pub const LOCK_SCREEN_ORIENTATION_0: i32 = 0;
/// Lock screen orientation: 90° counterclockwise
pub const LOCK_SCREEN_ORIENTATION_1: i32 = 1;
/// Lock screen orientation: 180°
pub const LOCK_SCREEN_ORIENTATION_2: i32 = 2;
/// Lock screen orientation: 90° clockwise
pub const LOCK_SCREEN_ORIENTATION_3: i32 = 3;

/// Encoders the device server is known to accept by name
pub const KNOWN_ENCODERS: &[&str] = &[
    "OMX.google.h264.encoder",
    "OMX.qcom.video.encoder.avc",
    "c2.qti.avc.encoder",
    "c2.android.avc.encoder",
];

/// Application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Device server launch options
    pub server: ServerConfig,

    /// Connection options
    pub connection: ConnectionConfig,

    /// Device selection
    #[serde(default)]
    pub device: DeviceConfig,
}

/// Options passed to the device server on launch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Local path of the server jar pushed to the device
    pub server_path: PathBuf,

    /// Server log level (info, verbose, debug, warn, error)
    pub log_level: String,

    /// Maximum size of the long side of the video (0 = unlimited)
    pub max_size: u16,

    /// Video bitrate in bits per second
    pub bitrate: u32,

    /// Maximum frames per second (0 = unlimited, Android 10+)
    pub max_fps: u16,

    /// One of the `LOCK_SCREEN_ORIENTATION_*` values
    pub lock_screen_orientation: i32,

    /// Crop rectangle `width:height:x:y`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crop: Option<String>,

    /// Whether the control channel is enabled on the device
    pub control: bool,

    /// Display to mirror
    pub display_id: u32,

    /// Keep the device awake while plugged in
    pub stay_awake: bool,

    /// Encoder options `key=value,...`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codec_options: Option<String>,

    /// Encoder name (None = let the device pick)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoder_name: Option<String>,

    /// Turn the device screen off when the server exits
    pub power_off_on_close: bool,
}

/// Connection-related configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// How long to keep retrying the video connection, in milliseconds
    pub connection_timeout_ms: u64,

    /// Read buffer used for the video connection
    pub receive_buffer_size: usize,

    /// ADB server host
    pub adb_host: String,

    /// ADB server port
    pub adb_port: u16,

    /// Abstract socket name the device server listens on
    pub socket_name: String,
}

/// Device selection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device serial (None = first attached device)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_path: PathBuf::from(DEFAULT_SERVER_PATH),
            log_level: DEFAULT_SERVER_LOG_LEVEL.to_string(),
            max_size: 0,
            bitrate: DEFAULT_BITRATE,
            max_fps: 0,
            lock_screen_orientation: LOCK_SCREEN_ORIENTATION_UNLOCKED,
            crop: None,
            control: true,
            display_id: 0,
            stay_awake: false,
            codec_options: None,
            encoder_name: None,
            power_off_on_close: false,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connection_timeout_ms: DEFAULT_CONNECTION_TIMEOUT_MS,
            receive_buffer_size: DEFAULT_RECEIVE_BUFFER_SIZE,
            adb_host: DEFAULT_ADB_HOST.to_string(),
            adb_port: DEFAULT_ADB_PORT,
            socket_name: DEFAULT_SOCKET_NAME.to_string(),
        }
    }
}

impl ServerConfig {
    /// Validates server launch options
    pub fn validate(&self) -> ConfigResult<()> {
        if !(LOCK_SCREEN_ORIENTATION_UNLOCKED..=LOCK_SCREEN_ORIENTATION_3)
            .contains(&self.lock_screen_orientation)
        {
            return Err(ConfigError::InvalidValue(format!(
                "lock_screen_orientation must be between {} and {}",
                LOCK_SCREEN_ORIENTATION_UNLOCKED, LOCK_SCREEN_ORIENTATION_3
            )));
        }

        if self.max_fps > MAX_FPS {
            return Err(ConfigError::InvalidValue(format!(
                "max_fps must be between 0 and {}",
                MAX_FPS
            )));
        }

        if let Some(name) = &self.encoder_name {
            if !KNOWN_ENCODERS.contains(&name.as_str()) {
                return Err(ConfigError::InvalidValue(format!(
                    "Unknown encoder name: {}",
                    name
                )));
            }
        }

        if LogLevel::from_server_level(&self.log_level).is_none() {
            return Err(ConfigError::InvalidValue(format!(
                "Unknown server log level: {}",
                self.log_level
            )));
        }

        Ok(())
    }
}

impl ConnectionConfig {
    /// Returns the handshake retry window
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// Returns the ADB server address as `host:port`
    pub fn adb_address(&self) -> String {
        format!("{}:{}", self.adb_host, self.adb_port)
    }

    /// Validates connection options
    pub fn validate(&self) -> ConfigResult<()> {
        if self.connection_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "connection_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.receive_buffer_size < MIN_RECEIVE_BUFFER_SIZE {
            return Err(ConfigError::InvalidValue(format!(
                "receive_buffer_size must be at least {} bytes",
                MIN_RECEIVE_BUFFER_SIZE
            )));
        }

        if self.socket_name.is_empty() {
            return Err(ConfigError::InvalidValue(
                "socket_name must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

impl Config {
    /// Validates every section
    pub fn validate(&self) -> ConfigResult<()> {
        self.server.validate()?;
        self.connection.validate()
    }
}

/// Formats a bitrate in bits per second for display
pub fn format_bitrate(bitrate: u64) -> String {
    const KIB: u64 = 1 << 10;
    const MIB: u64 = 1 << 20;
    const GIB: u64 = 1 << 30;

    if bitrate < KIB {
        format!("{} bps", bitrate)
    } else if bitrate < MIB {
        format!("{:.2} Kbps", bitrate as f64 / KIB as f64)
    } else if bitrate < GIB {
        format!("{:.2} Mbps", bitrate as f64 / MIB as f64)
    } else {
        format!("{:.2} Gbps", bitrate as f64 / GIB as f64)
    }
}

/// Configuration manager
pub struct ConfigManager {
    config_dir: PathBuf,
    config_file: PathBuf,
}

impl ConfigManager {
    /// Creates a ConfigManager rooted at the platform config directory
    ///
    /// # Errors
    ///
    /// Returns error if project directory cannot be determined
    pub fn new() -> ConfigResult<Self> {
        let config_dir = Self::get_config_directory()?;
        Ok(Self::with_directory(config_dir))
    }

    /// Creates a ConfigManager rooted at an explicit directory
    pub fn with_directory(config_dir: impl Into<PathBuf>) -> Self {
        let config_dir = config_dir.into();
        let config_file = config_dir.join(CONFIG_FILE_NAME);
        Self {
            config_dir,
            config_file,
        }
    }

    fn get_config_directory() -> ConfigResult<PathBuf> {
        ProjectDirs::from("com", "droidmirror", "DroidMirror")
            .map(|dirs| dirs.config_dir().to_path_buf())
            .ok_or_else(|| {
                ConfigError::DirectoryNotFound(
                    "Could not determine configuration directory".to_string(),
                )
            })
    }

    fn ensure_config_directory(&self) -> ConfigResult<()> {
        if !self.config_dir.exists() {
            fs::create_dir_all(&self.config_dir).map_err(|e| {
                ConfigError::DirectoryCreationFailed(format!(
                    "Failed to create config directory at {:?}: {}",
                    self.config_dir, e
                ))
            })?;
        }
        Ok(())
    }

    /// Loads configuration from file, or creates default if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns error if configuration cannot be loaded or created
    pub fn load_or_create_default(&self) -> ConfigResult<Config> {
        self.ensure_config_directory()?;

        if self.config_file.exists() {
            self.load()
        } else {
            let config = Config::default();
            self.save(&config)?;
            Ok(config)
        }
    }

    /// Loads configuration from file
    pub fn load(&self) -> ConfigResult<Config> {
        let content = fs::read_to_string(&self.config_file).map_err(|e| {
            ConfigError::LoadFailed(format!("Failed to read config file: {}", e))
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| {
            ConfigError::LoadFailed(format!("Failed to parse config file: {}", e))
        })?;

        config.validate()?;

        Ok(config)
    }

    /// Saves configuration to file
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid or cannot be written
    pub fn save(&self, config: &Config) -> ConfigResult<()> {
        self.ensure_config_directory()?;
        config.validate()?;

        let content = toml::to_string_pretty(config).map_err(|e| {
            ConfigError::SaveFailed(format!("Failed to serialize config: {}", e))
        })?;

        fs::write(&self.config_file, content).map_err(|e| {
            ConfigError::SaveFailed(format!("Failed to write config file: {}", e))
        })?;

        Ok(())
    }

    /// Gets the configuration file path
    pub fn config_file(&self) -> &Path {
        &self.config_file
    }

    /// Gets the configuration directory path
    pub fn config_directory(&self) -> &Path {
        &self.config_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.bitrate, 8_000_000);
        assert_eq!(config.server.lock_screen_orientation, -1);
        assert_eq!(config.connection.connection_timeout_ms, 3000);
        assert_eq!(config.connection.receive_buffer_size, 0x10000);
        assert_eq!(config.connection.adb_address(), "127.0.0.1:5037");
        assert!(config.device.serial.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.server.lock_screen_orientation = 4;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.server.encoder_name = Some("made.up.encoder".to_string());
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.server.encoder_name = Some("c2.android.avc.encoder".to_string());
        assert!(config.validate().is_ok());

        let mut config = Config::default();
        config.connection.connection_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.connection.receive_buffer_size = 16;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.server.log_level = "trace".to_string();
        assert!(config.validate().is_err());
        config.server.log_level = "verbose".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let mut config = Config::default();
        config.server.encoder_name = Some("OMX.google.h264.encoder".to_string());
        config.device.serial = Some("emulator-5554".to_string());

        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: Config = toml::from_str(&toml_str).unwrap();

        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_load_or_create_default() {
        let dir = TempDir::new().unwrap();
        let manager = ConfigManager::with_directory(dir.path().join("nested"));

        let created = manager.load_or_create_default().unwrap();
        assert!(manager.config_file().exists());

        let mut changed = created.clone();
        changed.server.max_fps = 60;
        manager.save(&changed).unwrap();

        let loaded = manager.load_or_create_default().unwrap();
        assert_eq!(loaded.server.max_fps, 60);
    }

    #[test]
    fn test_save_rejects_invalid() {
        let dir = TempDir::new().unwrap();
        let manager = ConfigManager::with_directory(dir.path());

        let mut config = Config::default();
        config.server.max_fps = 1000;
        assert!(manager.save(&config).is_err());
        assert!(!manager.config_file().exists());
    }

    #[test]
    fn test_format_bitrate() {
        assert_eq!(format_bitrate(512), "512 bps");
        assert_eq!(format_bitrate(2048), "2.00 Kbps");
        assert_eq!(format_bitrate(8 * 1024 * 1024), "8.00 Mbps");
        assert_eq!(format_bitrate(3 << 30), "3.00 Gbps");
    }
}
