use serde::{Deserialize, Serialize};
use std::str::FromStr;

pub mod version;

pub use version::VersionInfo;

// --- Enums ---

/// Lifecycle state reported to the autoscaler host for each instance.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Creating, // Requested, booting or still off after creation
    Running,  // Powered on and usable
    Deleting, // Stopping or being removed
    Timeout,  // Host gave up waiting on it
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Creating => "creating",
            InstanceState::Running => "running",
            InstanceState::Deleting => "deleting",
            InstanceState::Timeout => "timeout",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Ssh,
    Winrm,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Ssh => "ssh",
            Protocol::Winrm => "winrm",
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown connector protocol: {0}")]
pub struct UnknownProtocol(pub String);

impl FromStr for Protocol {
    type Err = UnknownProtocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ssh" => Ok(Protocol::Ssh),
            "winrm" => Ok(Protocol::Winrm),
            other => Err(UnknownProtocol(other.to_string())),
        }
    }
}

// --- Plugin-facing values ---

/// How the host connects to instances. Filled with defaults during config
/// validation when the host leaves fields empty.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct ConnectorSettings {
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub protocol: Option<Protocol>,
    #[serde(default)]
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Private key material (PEM) when static credentials are used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default)]
    pub use_static_credentials: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ProviderInfo {
    pub id: String,
    pub max_size: usize,
    pub version: String,
    pub build_info: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct ConnectInfo {
    #[serde(flatten)]
    pub connector: ConnectorSettings,
    pub id: String,
    pub external_addr: Option<String>,
    pub internal_addr: Option<String>,
}
