use serde::Serialize;
use std::net::IpAddr;

// --- States ---

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Starting,
    Running,
    Stopping,
    Stopped,
    StoppedInPlace,
    Locked,
    Unknown(String),
}

impl ServerState {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "starting" => ServerState::Starting,
            "running" => ServerState::Running,
            "stopping" => ServerState::Stopping,
            "stopped" => ServerState::Stopped,
            "stopped in place" | "stopped_in_place" => ServerState::StoppedInPlace,
            "locked" => ServerState::Locked,
            other => ServerState::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ServerState::Starting => "starting",
            ServerState::Running => "running",
            ServerState::Stopping => "stopping",
            ServerState::Stopped => "stopped",
            ServerState::StoppedInPlace => "stopped in place",
            ServerState::Locked => "locked",
            ServerState::Unknown(s) => s,
        }
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, ServerState::Stopped | ServerState::StoppedInPlace)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeStatus {
    Creating,
    Available,
    InUse,
    Deleting,
    Error,
    Unknown(String),
}

impl VolumeStatus {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "creating" => VolumeStatus::Creating,
            "available" => VolumeStatus::Available,
            "in_use" => VolumeStatus::InUse,
            "deleting" => VolumeStatus::Deleting,
            "error" => VolumeStatus::Error,
            other => VolumeStatus::Unknown(other.to_string()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    /// Routed IP type name used by the instance API.
    pub fn as_ip_type(&self) -> &'static str {
        match self {
            IpFamily::V4 => "routed_ipv4",
            IpFamily::V6 => "routed_ipv6",
        }
    }

    pub fn from_ip_type(s: &str) -> Option<Self> {
        match s {
            "routed_ipv4" | "nat" => Some(IpFamily::V4),
            "routed_ipv6" => Some(IpFamily::V6),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerAction {
    PowerOn,
    PowerOff,
}

impl ServerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerAction::PowerOn => "poweron",
            ServerAction::PowerOff => "poweroff",
        }
    }
}

// --- Resources ---

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ServerType {
    pub name: String,
    pub arch: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Image {
    pub id: String,
    pub name: String,
    pub arch: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PublicIp {
    pub id: String,
    pub address: Option<IpAddr>,
    pub family: IpFamily,
    pub tags: Vec<String>,
    pub server_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ServerVolume {
    pub id: String,
    pub boot: bool,
    pub volume_type: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Server {
    pub id: String,
    pub name: String,
    pub zone: String,
    pub commercial_type: String,
    pub arch: String,
    pub state: ServerState,
    pub image: Option<Image>,
    pub tags: Vec<String>,
    pub public_ips: Vec<PublicIp>,
    pub private_ip: Option<String>,
    pub volumes: Vec<ServerVolume>,
}

impl Server {
    pub fn public_address(&self, family: IpFamily) -> Option<IpAddr> {
        self.public_ips
            .iter()
            .filter(|ip| ip.family == family)
            .find_map(|ip| ip.address)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Volume {
    pub id: String,
    pub name: String,
    pub size_bytes: u64,
    pub status: VolumeStatus,
    pub tags: Vec<String>,
    pub server_id: Option<String>,
}

// --- Requests ---

pub const SBS_VOLUME_TYPE: &str = "sbs_volume";

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VolumeTemplate {
    pub size_bytes: u64,
    pub volume_type: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CreateServerRequest {
    pub name: String,
    pub commercial_type: String,
    pub image: String,
    pub tags: Vec<String>,
    /// Ids of IPs allocated beforehand and attached at creation.
    pub public_ips: Vec<String>,
    pub dynamic_ip_required: bool,
    pub root_volume: Option<VolumeTemplate>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct UpdateVolumeRequest {
    pub name: Option<String>,
    pub tags: Option<Vec<String>>,
    pub perf_iops: Option<u32>,
}

/// True when `tags` carries every tag in `wanted` (provider list semantics).
pub fn has_all_tags(tags: &[String], wanted: &[String]) -> bool {
    wanted.iter().all(|w| tags.iter().any(|t| t == w))
}
