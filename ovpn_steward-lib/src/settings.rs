use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_PATH: &str = "/etc/ovpn_steward/config.toml";
pub const ENV_VAR: &str = "OVPN_STEWARD_CONFIG_PATH";

const DEFAULT_DATA_PATH: &str = "/var/lib/ovpn_steward";
const DEFAULT_DH_PARAM_BITS: u16 = 1536;
const DEFAULT_OPENVPN_BIN: &str = "openvpn";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Root of the service state: server working directories, organization
    /// store, audit log.
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,
    #[serde(default = "default_dh_param_bits")]
    pub dh_param_bits: u16,
    /// Daemon binary; resolved through PATH when not absolute.
    #[serde(default = "default_openvpn_bin")]
    pub openvpn_bin: PathBuf,
}

fn default_data_path() -> PathBuf {
    PathBuf::from(DEFAULT_DATA_PATH)
}

fn default_dh_param_bits() -> u16 {
    DEFAULT_DH_PARAM_BITS
}

fn default_openvpn_bin() -> PathBuf {
    PathBuf::from(DEFAULT_OPENVPN_BIN)
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            data_path: default_data_path(),
            dh_param_bits: default_dh_param_bits(),
            openvpn_bin: default_openvpn_bin(),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Settings file not found")]
    NoFile,
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("Deserialization error: {0}")]
    TomlDeserialization(#[from] toml::de::Error),
}

pub fn read(path: &Path) -> Result<Settings, Error> {
    let content = fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::NoFile
        } else {
            Error::IO(e)
        }
    })?;
    Ok(toml::from_str(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_its_own_error() {
        let res = read(Path::new("/nonexistent/ovpn_steward.toml"));
        assert!(matches!(res, Err(Error::NoFile)));
    }

    #[test]
    fn partial_file_falls_back_to_defaults() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("config.toml");
        fs::write(&path, "data_path = \"/srv/vpn\"\n")?;

        let settings = read(&path)?;
        assert_eq!(settings.data_path, PathBuf::from("/srv/vpn"));
        assert_eq!(settings.dh_param_bits, DEFAULT_DH_PARAM_BITS);
        assert_eq!(settings.openvpn_bin, PathBuf::from(DEFAULT_OPENVPN_BIN));
        Ok(())
    }
}
