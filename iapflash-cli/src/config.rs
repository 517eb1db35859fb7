//! Configuration file support for iapflash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (IAPFLASH_*)
//! 3. Local config file (./iapflash.toml)
//! 4. Global config file (~/.config/iapflash/config.toml)
//!
//! ```toml
//! [port]
//! serial = "/dev/ttyUSB0"
//! baud = 115200
//! parity = "none"
//! stop_bits = "1"
//! data_bits = 8
//! flow_control = "none"
//!
//! [transfer]
//! chunk_size = 1024
//! header_timeout_ms = 5000
//! ack_timeout_ms = 100
//! lenient = false
//! ```

use directories::ProjectDirs;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the local config file.
pub const LOCAL_CONFIG_FILE: &str = "iapflash.toml";

/// Serial port configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortConfig {
    /// Preferred serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub serial: Option<String>,
    /// Baud rate.
    pub baud: Option<u32>,
    /// Parity: "none", "even" or "odd".
    pub parity: Option<String>,
    /// Stop bits: "1" or "2".
    pub stop_bits: Option<String>,
    /// Data bits: 5 to 8.
    pub data_bits: Option<u8>,
    /// Flow control: "none", "software" or "hardware".
    pub flow_control: Option<String>,
}

/// Transfer configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferConfig {
    /// Data bytes per packet.
    pub chunk_size: Option<usize>,
    /// Header ACK deadline in milliseconds, 0 disables it.
    pub header_timeout_ms: Option<u64>,
    /// Packet ACK deadline in milliseconds, 0 disables it.
    pub ack_timeout_ms: Option<u64>,
    /// Ignore unexpected bytes from the target.
    #[serde(default)]
    pub lenient: bool,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    /// Port configuration.
    #[serde(default)]
    pub port: PortConfig,
    /// Transfer configuration.
    #[serde(default)]
    pub transfer: TransferConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load global config
        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Load local config (overrides global)
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG_FILE)) {
            debug!("Loaded local config from {LOCAL_CONFIG_FILE}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "iapflash").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        let port = other.port;
        if port.serial.is_some() {
            self.port.serial = port.serial;
        }
        if port.baud.is_some() {
            self.port.baud = port.baud;
        }
        if port.parity.is_some() {
            self.port.parity = port.parity;
        }
        if port.stop_bits.is_some() {
            self.port.stop_bits = port.stop_bits;
        }
        if port.data_bits.is_some() {
            self.port.data_bits = port.data_bits;
        }
        if port.flow_control.is_some() {
            self.port.flow_control = port.flow_control;
        }

        let transfer = other.transfer;
        if transfer.chunk_size.is_some() {
            self.transfer.chunk_size = transfer.chunk_size;
        }
        if transfer.header_timeout_ms.is_some() {
            self.transfer.header_timeout_ms = transfer.header_timeout_ms;
        }
        if transfer.ack_timeout_ms.is_some() {
            self.transfer.ack_timeout_ms = transfer.ack_timeout_ms;
        }
        if transfer.lenient {
            self.transfer.lenient = true;
        }
    }

    /// Remember the serial port in the local config file, or the global one
    /// when there is no local file.
    pub fn remember_port(&mut self, serial: &str) -> anyhow::Result<PathBuf> {
        let local = Path::new(LOCAL_CONFIG_FILE);
        let path = if local.exists() {
            local.to_path_buf()
        } else if let Some(global_dir) = Self::global_config_dir() {
            fs::create_dir_all(&global_dir)?;
            global_dir.join("config.toml")
        } else {
            local.to_path_buf()
        };

        self.port.serial = Some(serial.to_string());
        self.save_port_to(&path)?;
        Ok(path)
    }

    /// Write `serial` into the `[port]` section of `path`, keeping the rest
    /// of the file.
    fn save_port_to(&self, path: &Path) -> anyhow::Result<()> {
        let mut on_disk = Self::load_from_file(path).unwrap_or_default();
        on_disk.port.serial.clone_from(&self.port.serial);

        let content = toml::to_string_pretty(&on_disk)?;
        fs::write(path, content)?;
        info!("Saved port configuration to {}", path.display());
        Ok(())
    }
}
