use fleeting_providers::wait::WaitOptions;
use fleeting_providers::{IpFamily, ProviderApi};
use std::sync::Arc;
use std::time::Duration;

pub const GROUP_TAG_KEY: &str = "instance-group";
pub const INSTANCE_TAG_KEY: &str = "instance";
pub const USER_DATA_KEY: &str = "cloud-init";

pub const DEFAULT_VOLUME_SIZE_GB: u64 = 20;
const GB: u64 = 1_000_000_000;

/// Settings of one instance group, validated by [`crate::InstanceGroup::init`].
#[derive(Debug, Clone)]
pub struct GroupConfig {
    pub zone: String,
    /// Candidate server types, tried in order when the preferred one is out of stock.
    pub server_types: Vec<String>,
    pub image: String,
    /// Extra tags applied to every resource of the group.
    pub tags: Vec<String>,
    pub user_data: String,
    /// Root volume size in GB. `0` selects the default.
    pub volume_size_gb: u64,
    pub volume_iops: Option<u32>,
    pub public_ipv4_disabled: bool,
    pub public_ipv6_disabled: bool,
    /// Defaults to the group name.
    pub server_name_prefix: String,

    pub wait: WaitOptions,
    /// Instances handled concurrently within one stage.
    pub parallelism: usize,
    /// Budget for rolling back failed instances once the caller's context is done.
    pub cleanup_grace: Duration,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            zone: String::new(),
            server_types: Vec::new(),
            image: String::new(),
            tags: Vec::new(),
            user_data: String::new(),
            volume_size_gb: 0,
            volume_iops: None,
            public_ipv4_disabled: false,
            public_ipv6_disabled: false,
            server_name_prefix: String::new(),
            wait: WaitOptions::default(),
            parallelism: 10,
            cleanup_grace: Duration::from_secs(10 * 60),
        }
    }
}

/// Frozen, validated view of a group shared read-only by every stage.
pub struct Group {
    pub name: String,
    pub zone: String,
    pub server_types: Vec<String>,
    pub image: String,
    /// Config tags plus `instance-group=<name>`. Listing by these finds the group's servers.
    pub tags: Vec<String>,
    pub config: GroupConfig,
    api: Arc<dyn ProviderApi>,
}

impl Group {
    pub(crate) fn new(
        name: String,
        config: GroupConfig,
        api: Arc<dyn ProviderApi>,
    ) -> Self {
        let mut tags = config.tags.clone();
        tags.push(format!("{}={}", GROUP_TAG_KEY, name));
        Self {
            zone: config.zone.clone(),
            server_types: config.server_types.clone(),
            image: config.image.clone(),
            name,
            tags,
            config,
            api,
        }
    }

    pub fn api(&self) -> &Arc<dyn ProviderApi> {
        &self.api
    }

    pub fn instance_tag(instance_name: &str) -> String {
        format!("{}={}", INSTANCE_TAG_KEY, instance_name)
    }

    /// Instance name carried by an `instance=<name>` tag, if any.
    pub fn instance_from_tags(tags: &[String]) -> Option<&str> {
        let prefix = format!("{}=", INSTANCE_TAG_KEY);
        tags.iter().find_map(|t| t.strip_prefix(prefix.as_str()))
    }

    /// Group tags plus the instance tag: every sub-resource of an instance carries these.
    pub fn instance_tags(&self, instance_name: &str) -> Vec<String> {
        let mut tags = self.tags.clone();
        tags.push(Self::instance_tag(instance_name));
        tags
    }

    pub fn ip_families(&self) -> Vec<IpFamily> {
        let mut families = Vec::with_capacity(2);
        if !self.config.public_ipv4_disabled {
            families.push(IpFamily::V4);
        }
        if !self.config.public_ipv6_disabled {
            families.push(IpFamily::V6);
        }
        families
    }

    pub fn volume_size_bytes(&self) -> u64 {
        let gb = match self.config.volume_size_gb {
            0 => DEFAULT_VOLUME_SIZE_GB,
            n => n,
        };
        gb * GB
    }

    pub fn name_prefix(&self) -> &str {
        if self.config.server_name_prefix.is_empty() {
            &self.name
        } else {
            &self.config.server_name_prefix
        }
    }
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("name", &self.name)
            .field("zone", &self.zone)
            .field("server_types", &self.server_types)
            .field("image", &self.image)
            .field("tags", &self.tags)
            .field("provider", &self.api.code())
            .finish()
    }
}
