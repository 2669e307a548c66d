//! Server configuration
//!
//! Loaded from a TOML file; every field has a default so an empty file
//! (or no file at all) yields a working development configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// SFTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address to bind the listener to.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// TCP port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Directory clients are jailed to.
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,

    /// Largest inbound frame accepted, in bytes. Oversized frames tear
    /// the connection down.
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: u32,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    2222
}

fn default_root_dir() -> PathBuf {
    PathBuf::from("/srv/sftp")
}

fn default_max_packet_size() -> u32 {
    0x40000 // 256 KiB
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind_address: default_bind_address(),
            port: default_port(),
            root_dir: default_root_dir(),
            max_packet_size: default_max_packet_size(),
        }
    }
}

impl Config {
    /// Loads configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Config> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: Config = toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("cannot parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Sanity checks on loaded values.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(Error::Config("port must be nonzero".to_string()));
        }
        // Smallest meaningful frame: type byte plus a u32 field.
        if self.max_packet_size < 5 {
            return Err(Error::Config(
                "max_packet_size must be at least 5 bytes".to_string(),
            ));
        }
        Ok(())
    }

    /// Listener address string.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.bind_address, "0.0.0.0");
        assert_eq!(config.port, 2222);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str("port = 2022\nroot_dir = \"/tmp/jail\"").unwrap();
        assert_eq!(config.port, 2022);
        assert_eq!(config.root_dir, PathBuf::from("/tmp/jail"));
        assert_eq!(config.max_packet_size, 0x40000);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let config = Config {
            port: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = Config {
            max_packet_size: 4,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
