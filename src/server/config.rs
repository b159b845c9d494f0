//! Server configuration, loaded from a TOML file.
//!
//! ```toml
//! [listener]
//! address = "0.0.0.0:20001"
//!
//! [wsfs]
//! uid = 1000
//! gid = 1000
//! other_uid = 1001
//! other_gid = 1001
//!
//! [anonymous]
//! enable = true
//! storage = "pub"
//!
//! [[storages]]
//! id = "pub"
//! path = "/srv/share"
//! read_only = false
//!
//! [[users]]
//! name = "alice"
//! secret_hash = "$2a$10$..."
//! storage = "pub"
//! ```

use std::io;
use std::path::Path;

use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listener: Listener,
    pub wsfs: WsfsConfig,
    pub anonymous: AnonymousConfig,
    pub users: Vec<UserConfig>,
    pub storages: Vec<StorageConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Listener {
    pub address: String,
}

impl Default for Listener {
    fn default() -> Self {
        Self { address: "0.0.0.0:20001".to_owned() }
    }
}

/// Principal ids used for the owner-bit encoding. `-1` matches nothing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WsfsConfig {
    pub uid: i64,
    pub gid: i64,
    pub other_uid: i64,
    pub other_gid: i64,
}

impl Default for WsfsConfig {
    fn default() -> Self {
        Self { uid: -1, gid: -1, other_uid: -1, other_gid: -1 }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AnonymousConfig {
    pub enable: bool,
    pub storage: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    pub name: String,
    pub secret_hash: String,
    pub storage: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub id: String,
    pub path: String,
    pub read_only: bool,
}

#[derive(Debug)]
pub enum ConfigError {
    Read(io::Error),
    Parse(toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read(err) => write!(f, "cannot read configuration: {err}"),
            ConfigError::Parse(err) => write!(f, "cannot parse configuration: {err}"),
            ConfigError::Invalid(reason) => write!(f, "invalid configuration: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}

pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(ConfigError::Read)?;
    toml::from_str(&text).map_err(ConfigError::Parse)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_missing_sections() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.listener.address, "0.0.0.0:20001");
        assert_eq!(config.wsfs.uid, -1);
        assert!(!config.anonymous.enable);
        assert!(config.users.is_empty());
        assert!(config.storages.is_empty());
    }

    #[test]
    fn full_config_parses() {
        let text = r#"
            [listener]
            address = "127.0.0.1:9000"

            [wsfs]
            uid = 1000
            gid = 1000

            [anonymous]
            enable = true
            storage = "pub"
            read_only = true

            [[storages]]
            id = "pub"
            path = "/srv/share"

            [[users]]
            name = "alice"
            secret_hash = "$2a$10$hash"
            storage = "pub"
        "#;
        let config: Config = toml::from_str(text).unwrap();
        assert_eq!(config.listener.address, "127.0.0.1:9000");
        assert_eq!(config.wsfs.uid, 1000);
        assert_eq!(config.wsfs.other_uid, -1);
        assert!(config.anonymous.enable);
        assert_eq!(config.storages.len(), 1);
        assert_eq!(config.users[0].name, "alice");
        assert!(!config.users[0].read_only);
    }
}
