use fleeting_common::{ConnectInfo, ConnectorSettings, InstanceState, ProviderInfo, VersionInfo};
use fleeting_providers::{CallContext, IpFamily, ProviderApi, ProviderError, ServerState};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, PluginConfig};
use crate::errors::{GroupError, MultiError};
use crate::instance_group::InstanceGroup;
use crate::naming::NameGenerator;

#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Group(#[from] GroupError),

    #[error(transparent)]
    Batch(#[from] MultiError),

    #[error("plugin is not initialized")]
    NotInitialized,
}

struct State {
    group: InstanceGroup,
    size: usize,
}

/// Autoscaler-facing adapter around an [`InstanceGroup`]: maps provider
/// server states onto host instance states and keeps the size bookkeeping.
///
/// Every group call runs under one lock, so at most one increase or
/// decrease is in flight.
pub struct FleetingGroup {
    config: PluginConfig,
    settings: ConnectorSettings,
    names: Option<Arc<dyn NameGenerator>>,
    state: Mutex<Option<State>>,
}

/// Host state for a provider server state. `None` for states the host has
/// no use for.
pub fn instance_state(state: &ServerState) -> Option<InstanceState> {
    match state {
        // Servers are created powered off and never shut down afterwards,
        // so a stopped server is still being created.
        ServerState::Starting | ServerState::Stopped => Some(InstanceState::Creating),
        ServerState::Running => Some(InstanceState::Running),
        ServerState::Stopping | ServerState::StoppedInPlace => Some(InstanceState::Deleting),
        ServerState::Locked | ServerState::Unknown(_) => None,
    }
}

fn connector_arch(arch: &str) -> Option<&'static str> {
    match arch {
        "x86_64" | "amd64" => Some("amd64"),
        "arm64" | "aarch64" => Some("arm64"),
        _ => None,
    }
}

impl FleetingGroup {
    pub fn new(config: PluginConfig) -> Self {
        Self {
            config,
            settings: ConnectorSettings::default(),
            names: None,
            state: Mutex::new(None),
        }
    }

    pub fn with_name_generator(mut self, names: Arc<dyn NameGenerator>) -> Self {
        self.names = Some(names);
        self
    }

    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    pub fn settings(&self) -> &ConnectorSettings {
        &self.settings
    }

    /// Validates the configuration, builds the Scaleway client and initializes the group.
    #[cfg(feature = "provider-scaleway")]
    pub async fn init(
        &mut self,
        ctx: &CallContext,
        settings: ConnectorSettings,
    ) -> Result<ProviderInfo, PluginError> {
        self.prepare(settings)?;
        let endpoint = Some(self.config.endpoint.as_str()).filter(|s| !s.is_empty());
        let api = fleeting_providers::scaleway::ScalewayProvider::new(
            &self.config.project,
            &self.config.secret_key,
            endpoint,
        )?;
        self.init_group(ctx, Arc::new(api)).await
    }

    /// Same as `init` with a caller-provided provider.
    pub async fn init_with_provider(
        &mut self,
        ctx: &CallContext,
        settings: ConnectorSettings,
        api: Arc<dyn ProviderApi>,
    ) -> Result<ProviderInfo, PluginError> {
        self.prepare(settings)?;
        self.init_group(ctx, api).await
    }

    fn prepare(&mut self, settings: ConnectorSettings) -> Result<(), PluginError> {
        self.settings = settings;
        self.config.validate(&mut self.settings)?;
        self.config.populate()?;
        Ok(())
    }

    async fn init_group(
        &mut self,
        ctx: &CallContext,
        api: Arc<dyn ProviderApi>,
    ) -> Result<ProviderInfo, PluginError> {
        let provider = api.code();
        let mut group = InstanceGroup::new(api, self.config.name.clone(), self.config.group_config());
        if let Some(names) = &self.names {
            group = group.with_name_generator(Arc::clone(names));
        }
        group.init(ctx).await?;
        *self.state.get_mut() = Some(State { group, size: 0 });

        let version = VersionInfo::current();
        info!(name = %self.config.name, zone = %self.config.zone, version = %version, "plugin initialized");
        Ok(ProviderInfo {
            id: format!("{}/{}/{}", provider, self.config.zone, self.config.name),
            max_size: usize::MAX,
            version: version.to_string(),
            build_info: version.build_info(),
        })
    }

    /// Reports every instance of the group with its host state.
    pub async fn update<F>(&self, ctx: &CallContext, mut update: F) -> Result<(), PluginError>
    where
        F: FnMut(&str, InstanceState),
    {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or(PluginError::NotInitialized)?;
        let instances = state.group.list(ctx).await?;
        state.size = instances.len();

        for instance in instances {
            let iid = instance.iid().to_string();
            let Some(server) = &instance.server else {
                continue;
            };
            match instance_state(&server.state) {
                Some(s) => update(&iid, s),
                None if server.state == ServerState::Locked => {
                    error!(instance = %iid, "instance is locked");
                }
                None => debug!(instance = %iid, state = server.state.as_str(), "unhandled instance state"),
            }
        }
        Ok(())
    }

    /// Returns how many instances were created.
    pub async fn increase(&self, ctx: &CallContext, delta: usize) -> (usize, Result<(), PluginError>) {
        let mut guard = self.state.lock().await;
        let Some(state) = guard.as_mut() else {
            return (0, Err(PluginError::NotInitialized));
        };
        let (created, res) = state.group.increase(ctx, delta).await;
        state.size += created.len();
        (created.len(), res.map_err(PluginError::from))
    }

    /// Returns the identifiers of the instances removed.
    pub async fn decrease(&self, ctx: &CallContext, iids: &[String]) -> (Vec<String>, Result<(), PluginError>) {
        if iids.is_empty() {
            return (Vec::new(), Ok(()));
        }
        let mut guard = self.state.lock().await;
        let Some(state) = guard.as_mut() else {
            return (Vec::new(), Err(PluginError::NotInitialized));
        };
        let (deleted, res) = state.group.decrease(ctx, iids).await;
        state.size = state.size.saturating_sub(deleted.len());
        (deleted, res.map_err(PluginError::from))
    }

    /// How the host reaches an instance: OS and arch from the server, IPv4
    /// preferred over IPv6 for the external address.
    pub async fn connect_info(&self, ctx: &CallContext, iid: &str) -> Result<ConnectInfo, PluginError> {
        let guard = self.state.lock().await;
        let state = guard.as_ref().ok_or(PluginError::NotInitialized)?;
        let instance = state.group.get(ctx, iid).await?;

        let mut info = ConnectInfo {
            connector: self.settings.clone(),
            id: iid.to_string(),
            ..Default::default()
        };
        let Some(server) = instance.server else {
            return Ok(info);
        };

        if info.connector.os.is_empty() {
            if let Some(image) = &server.image {
                info.connector.os = image
                    .name
                    .split_whitespace()
                    .next()
                    .unwrap_or_default()
                    .to_ascii_lowercase();
            }
        }
        match connector_arch(&server.arch) {
            Some(arch) => info.connector.arch = arch.to_string(),
            None => warn!(instance = %iid, arch = %server.arch, "unsupported architecture"),
        }
        info.external_addr = server
            .public_address(IpFamily::V4)
            .or_else(|| server.public_address(IpFamily::V6))
            .map(|addr| addr.to_string());
        info.internal_addr = server.private_ip.clone();
        Ok(info)
    }

    /// Runs the group's consistency checks; findings end up in the logs.
    pub async fn sanity(&self, ctx: &CallContext) -> Result<(), PluginError> {
        let guard = self.state.lock().await;
        let state = guard.as_ref().ok_or(PluginError::NotInitialized)?;
        state.group.sanity(ctx).await?;
        Ok(())
    }

    /// Instance count as of the last update, adjusted by increases and decreases since.
    pub async fn size(&self) -> usize {
        self.state.lock().await.as_ref().map_or(0, |s| s.size)
    }

    pub async fn list_iids(&self, ctx: &CallContext) -> Result<Vec<String>, PluginError> {
        let guard = self.state.lock().await;
        let state = guard.as_ref().ok_or(PluginError::NotInitialized)?;
        let instances = state.group.list(ctx).await?;
        Ok(instances.iter().map(|i| i.iid().to_string()).collect())
    }
}
