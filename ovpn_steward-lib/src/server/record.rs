//! The persisted server record and its working-directory layout.

use serde::{Deserialize, Serialize};

use std::fmt::{self, Display};
use std::fs;
use std::path::{Path, PathBuf};

use super::Error;

pub const SERVERS_DIR: &str = "servers";
pub const TEMP_DIR: &str = "temp";

const SERVER_CONF_NAME: &str = "server.conf";
const OVPN_CONF_NAME: &str = "openvpn.conf";
const DH_PARAM_NAME: &str = "dh_param.pem";
const IFC_POOL_NAME: &str = "ifc_pool";
const CA_BUNDLE_NAME: &str = "ca.pem";
const TLS_VERIFY_NAME: &str = "tls_verify.py";
const USER_PASS_VERIFY_NAME: &str = "user_pass_verify.py";
const STATUS_NAME: &str = "status";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Udp,
    Tcp,
}

impl Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Udp => write!(f, "udp"),
            Protocol::Tcp => write!(f, "tcp"),
        }
    }
}

/// Declarative configuration of one server. Immutable on disk between
/// commits; the id is the directory name and is re-attached on load.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServerRecord {
    #[serde(skip)]
    pub id: String,
    pub name: String,
    /// The VPN's virtual subnet, CIDR notation.
    pub network: String,
    /// Virtual device name handed to the daemon.
    pub interface: String,
    pub port: u16,
    pub protocol: Protocol,
    /// Networks pushed to clients; empty means default-gateway push.
    #[serde(default)]
    pub local_networks: Vec<String>,
    pub public_address: String,
    #[serde(default)]
    pub otp_auth: bool,
    #[serde(default)]
    pub lzo_compression: bool,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub organizations: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_organization: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_user: Option<String>,
}

impl ServerRecord {
    pub fn load(paths: &ServerPaths) -> Result<Self, Error> {
        let content = fs::read_to_string(paths.record()).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NoRecord
            } else {
                Error::IO(e)
            }
        })?;
        let mut record: ServerRecord = toml::from_str(&content)?;
        record.id = paths.id().to_string();
        Ok(record)
    }

    pub fn save(&self, paths: &ServerPaths) -> Result<(), Error> {
        fs::write(paths.record(), toml::to_string(self)?)?;
        Ok(())
    }
}

/// Filesystem layout of one server working directory under
/// `<data>/servers/<id>/`.
#[derive(Clone, Debug)]
pub struct ServerPaths {
    id: String,
    root: PathBuf,
}

impl ServerPaths {
    pub fn new(data_path: &Path, id: &str) -> Self {
        ServerPaths {
            id: id.to_string(),
            root: data_path.join(SERVERS_DIR).join(id),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn temp(&self) -> PathBuf {
        self.root.join(TEMP_DIR)
    }

    pub fn record(&self) -> PathBuf {
        self.root.join(SERVER_CONF_NAME)
    }

    pub fn dh_param(&self) -> PathBuf {
        self.root.join(DH_PARAM_NAME)
    }

    /// Interface assignment pool, managed by the daemon itself.
    pub fn ifc_pool(&self) -> PathBuf {
        self.root.join(IFC_POOL_NAME)
    }

    pub fn ovpn_conf(&self) -> PathBuf {
        self.temp().join(OVPN_CONF_NAME)
    }

    pub fn ca_bundle(&self) -> PathBuf {
        self.temp().join(CA_BUNDLE_NAME)
    }

    pub fn tls_verify(&self) -> PathBuf {
        self.temp().join(TLS_VERIFY_NAME)
    }

    pub fn user_pass_verify(&self) -> PathBuf {
        self.temp().join(USER_PASS_VERIFY_NAME)
    }

    pub fn status_file(&self) -> PathBuf {
        self.temp().join(STATUS_NAME)
    }
}
