use async_trait::async_trait;

pub mod context;
pub mod error;
pub mod resources;
pub mod wait;

pub use context::{CallContext, CancelHandle};
pub use error::ProviderError;
pub use resources::{
    CreateServerRequest, Image, IpFamily, PublicIp, Server, ServerAction, ServerState, ServerType,
    ServerVolume, UpdateVolumeRequest, Volume, VolumeStatus, VolumeTemplate,
};

pub type Result<T> = std::result::Result<T, ProviderError>;

/// Everything the orchestrator needs from a cloud provider, scoped to one zone
/// per call. Implementations must classify failures into [`ProviderError`]
/// variants; the type fallback logic depends on `OutOfStock` being distinct.
#[async_trait]
pub trait ProviderApi: Send + Sync {
    /// Short provider code, used in plugin ids ("scaleway", "mock").
    fn code(&self) -> &'static str;

    // Reference validation (used once at group init)
    fn zone_exists(&self, zone: &str) -> bool;
    async fn get_server_type(&self, ctx: &CallContext, zone: &str, name: &str)
        -> Result<ServerType>;
    async fn get_image(&self, ctx: &CallContext, zone: &str, image_id: &str) -> Result<Image>;

    // Public addresses
    async fn create_ip(
        &self,
        ctx: &CallContext,
        zone: &str,
        family: IpFamily,
        tags: &[String],
    ) -> Result<PublicIp>;
    async fn list_ips(&self, ctx: &CallContext, zone: &str, tags: &[String])
        -> Result<Vec<PublicIp>>;
    async fn delete_ip(&self, ctx: &CallContext, zone: &str, ip_id: &str) -> Result<()>;

    // Servers
    async fn create_server(
        &self,
        ctx: &CallContext,
        zone: &str,
        req: &CreateServerRequest,
    ) -> Result<Server>;
    async fn get_server(&self, ctx: &CallContext, zone: &str, server_id: &str) -> Result<Server>;
    async fn list_servers(&self, ctx: &CallContext, zone: &str, tags: &[String])
        -> Result<Vec<Server>>;
    async fn delete_server(&self, ctx: &CallContext, zone: &str, server_id: &str) -> Result<()>;
    async fn server_action(
        &self,
        ctx: &CallContext,
        zone: &str,
        server_id: &str,
        action: ServerAction,
    ) -> Result<()>;
    /// Sets one user-data key (e.g. "cloud-init") on a server.
    async fn set_user_data(
        &self,
        ctx: &CallContext,
        zone: &str,
        server_id: &str,
        key: &str,
        content: &str,
    ) -> Result<()>;

    // Block volumes. Volumes are created by the server template and attached by the provider.
    async fn get_volume(&self, ctx: &CallContext, zone: &str, volume_id: &str) -> Result<Volume>;
    async fn update_volume(
        &self,
        ctx: &CallContext,
        zone: &str,
        volume_id: &str,
        req: &UpdateVolumeRequest,
    ) -> Result<Volume>;
    async fn list_volumes(&self, ctx: &CallContext, zone: &str, tags: &[String])
        -> Result<Vec<Volume>>;
    async fn detach_volume(
        &self,
        ctx: &CallContext,
        zone: &str,
        server_id: &str,
        volume_id: &str,
    ) -> Result<()>;
    async fn delete_volume(&self, ctx: &CallContext, zone: &str, volume_id: &str) -> Result<()>;
}

#[cfg(feature = "mock")]
pub mod mock;

#[cfg(feature = "scaleway")]
pub mod scaleway;
