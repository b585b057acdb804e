use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Mutex, MutexGuard};

use crate::resources::{has_all_tags, SBS_VOLUME_TYPE};
use crate::{
    CallContext, CreateServerRequest, Image, IpFamily, ProviderApi, ProviderError, PublicIp,
    Result, Server, ServerAction, ServerState, ServerType, ServerVolume, UpdateVolumeRequest,
    Volume, VolumeStatus,
};

/// Provider operations, used to record calls and to target injected failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MockOp {
    GetServerType,
    GetImage,
    CreateIp,
    ListIps,
    DeleteIp,
    CreateServer,
    GetServer,
    ListServers,
    DeleteServer,
    ServerAction,
    SetUserData,
    GetVolume,
    UpdateVolume,
    ListVolumes,
    DetachVolume,
    DeleteVolume,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MockCall {
    pub op: MockOp,
    /// Resource the call addressed: an id, a server name, a server type, or a tag list.
    pub target: String,
}

struct InjectedFailure {
    op: MockOp,
    target: Option<String>,
    error: ProviderError,
}

#[derive(Default)]
struct MockState {
    server_types: HashMap<String, ServerType>,
    images: HashMap<String, Image>,
    out_of_stock: HashSet<String>,

    servers: BTreeMap<String, Server>,
    ips: BTreeMap<String, PublicIp>,
    volumes: BTreeMap<String, Volume>,
    user_data: HashMap<(String, String), String>,
    ip_seq: u32,

    failures: Vec<InjectedFailure>,
    calls: Vec<MockCall>,
}

/// In-memory single-zone provider. State transitions are immediate (power on
/// ⇒ running, delete ⇒ gone) and every call is recorded for assertions.
pub struct MockProvider {
    zone: String,
    state: Mutex<MockState>,
}

fn not_found(kind: &str, id: &str) -> ProviderError {
    ProviderError::NotFound(format!("{} {}", kind, id))
}

fn new_id() -> String {
    format!("mock-{}", uuid::Uuid::new_v4())
}

impl MockProvider {
    pub fn new(zone: &str) -> Self {
        Self {
            zone: zone.to_string(),
            state: Mutex::new(MockState::default()),
        }
    }

    pub fn with_server_types<I, S>(self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        {
            let mut st = self.lock();
            for name in names {
                let name = name.into();
                st.server_types.insert(
                    name.clone(),
                    ServerType {
                        name,
                        arch: "x86_64".to_string(),
                    },
                );
            }
        }
        self
    }

    pub fn with_images<I, S>(self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        {
            let mut st = self.lock();
            for id in ids {
                let id = id.into();
                st.images.insert(
                    id.clone(),
                    Image {
                        name: format!("image {}", id),
                        id,
                        arch: "x86_64".to_string(),
                    },
                );
            }
        }
        self
    }

    /// Every create request for `server_type` answers out of stock.
    pub fn set_out_of_stock(&self, server_type: &str) {
        self.lock().out_of_stock.insert(server_type.to_string());
    }

    /// The next call to `op` fails with `error`.
    pub fn fail_next(&self, op: MockOp, error: ProviderError) {
        self.lock().failures.push(InjectedFailure {
            op,
            target: None,
            error,
        });
    }

    /// The next call to `op` addressing `target` fails with `error`.
    pub fn fail_on(&self, op: MockOp, target: &str, error: ProviderError) {
        self.lock().failures.push(InjectedFailure {
            op,
            target: Some(target.to_string()),
            error,
        });
    }

    /// Adds a running server directly, bypassing the API (e.g. another group's server).
    pub fn seed_server(&self, name: &str, tags: &[String]) -> Server {
        let server = Server {
            id: new_id(),
            name: name.to_string(),
            zone: self.zone.clone(),
            commercial_type: "PRO2-XS".to_string(),
            arch: "x86_64".to_string(),
            state: ServerState::Running,
            image: None,
            tags: tags.to_vec(),
            public_ips: Vec::new(),
            private_ip: None,
            volumes: Vec::new(),
        };
        self.lock().servers.insert(server.id.clone(), server.clone());
        server
    }

    /// Adds an unattached IP directly, bypassing the API.
    pub fn seed_ip(&self, family: IpFamily, tags: &[String]) -> PublicIp {
        let mut st = self.lock();
        let ip = Self::allocate_ip(&mut st, family, tags);
        st.ips.insert(ip.id.clone(), ip.clone());
        ip
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    /// Targets of every recorded call to `op`, in call order.
    pub fn calls_for(&self, op: MockOp) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.op == op)
            .map(|c| c.target.clone())
            .collect()
    }

    pub fn servers(&self) -> Vec<Server> {
        self.lock().servers.values().cloned().collect()
    }

    pub fn ips(&self) -> Vec<PublicIp> {
        self.lock().ips.values().cloned().collect()
    }

    pub fn volumes(&self) -> Vec<Volume> {
        self.lock().volumes.values().cloned().collect()
    }

    pub fn user_data(&self, server_id: &str, key: &str) -> Option<String> {
        self.lock()
            .user_data
            .get(&(server_id.to_string(), key.to_string()))
            .cloned()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Records the call, honours the context and pops a matching injected failure.
    fn enter(&self, ctx: &CallContext, op: MockOp, target: &str) -> Result<MutexGuard<'_, MockState>> {
        let mut st = self.lock();
        st.calls.push(MockCall {
            op,
            target: target.to_string(),
        });
        if ctx.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        if ctx.is_done() {
            return Err(ProviderError::DeadlineExceeded);
        }
        let hit = st.failures.iter().position(|f| {
            f.op == op && f.target.as_deref().map_or(true, |t| t == target)
        });
        if let Some(idx) = hit {
            return Err(st.failures.remove(idx).error);
        }
        Ok(st)
    }

    fn check_zone(&self, zone: &str) -> Result<()> {
        if zone != self.zone {
            return Err(ProviderError::Api {
                status: 400,
                message: format!("unknown zone {}", zone),
            });
        }
        Ok(())
    }

    fn allocate_ip(st: &mut MockState, family: IpFamily, tags: &[String]) -> PublicIp {
        st.ip_seq += 1;
        let n = st.ip_seq;
        let address = match family {
            IpFamily::V4 => IpAddr::V4(Ipv4Addr::new(203, 0, 113, (n % 250) as u8 + 1)),
            IpFamily::V6 => IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, n as u16)),
        };
        PublicIp {
            id: new_id(),
            address: Some(address),
            family,
            tags: tags.to_vec(),
            server_id: None,
        }
    }
}

fn tag_target(tags: &[String]) -> String {
    tags.join(",")
}

#[async_trait]
impl ProviderApi for MockProvider {
    fn code(&self) -> &'static str {
        "mock"
    }

    fn zone_exists(&self, zone: &str) -> bool {
        zone == self.zone
    }

    async fn get_server_type(&self, ctx: &CallContext, zone: &str, name: &str) -> Result<ServerType> {
        let st = self.enter(ctx, MockOp::GetServerType, name)?;
        self.check_zone(zone)?;
        st.server_types
            .get(name)
            .cloned()
            .ok_or_else(|| not_found("server type", name))
    }

    async fn get_image(&self, ctx: &CallContext, zone: &str, image_id: &str) -> Result<Image> {
        let st = self.enter(ctx, MockOp::GetImage, image_id)?;
        self.check_zone(zone)?;
        st.images
            .get(image_id)
            .cloned()
            .ok_or_else(|| not_found("image", image_id))
    }

    async fn create_ip(
        &self,
        ctx: &CallContext,
        zone: &str,
        family: IpFamily,
        tags: &[String],
    ) -> Result<PublicIp> {
        let mut st = self.enter(ctx, MockOp::CreateIp, family.as_ip_type())?;
        self.check_zone(zone)?;
        let ip = Self::allocate_ip(&mut st, family, tags);
        st.ips.insert(ip.id.clone(), ip.clone());
        Ok(ip)
    }

    async fn list_ips(&self, ctx: &CallContext, zone: &str, tags: &[String]) -> Result<Vec<PublicIp>> {
        let st = self.enter(ctx, MockOp::ListIps, &tag_target(tags))?;
        self.check_zone(zone)?;
        Ok(st
            .ips
            .values()
            .filter(|ip| has_all_tags(&ip.tags, tags))
            .cloned()
            .collect())
    }

    async fn delete_ip(&self, ctx: &CallContext, zone: &str, ip_id: &str) -> Result<()> {
        let mut st = self.enter(ctx, MockOp::DeleteIp, ip_id)?;
        self.check_zone(zone)?;
        st.ips.remove(ip_id).ok_or_else(|| not_found("ip", ip_id))?;
        for server in st.servers.values_mut() {
            server.public_ips.retain(|ip| ip.id != ip_id);
        }
        Ok(())
    }

    async fn create_server(
        &self,
        ctx: &CallContext,
        zone: &str,
        req: &CreateServerRequest,
    ) -> Result<Server> {
        let mut st = self.enter(ctx, MockOp::CreateServer, &req.name)?;
        self.check_zone(zone)?;

        let server_type = st
            .server_types
            .get(&req.commercial_type)
            .cloned()
            .ok_or_else(|| ProviderError::Api {
                status: 400,
                message: format!("unknown commercial type {}", req.commercial_type),
            })?;
        if st.out_of_stock.contains(&req.commercial_type) {
            return Err(ProviderError::OutOfStock(req.commercial_type.clone()));
        }
        let image = st
            .images
            .get(&req.image)
            .cloned()
            .ok_or_else(|| not_found("image", &req.image))?;
        for ip_id in &req.public_ips {
            if !st.ips.contains_key(ip_id) {
                return Err(not_found("ip", ip_id));
            }
        }

        let server_id = new_id();
        let mut public_ips = Vec::new();
        for ip_id in &req.public_ips {
            if let Some(ip) = st.ips.get_mut(ip_id) {
                ip.server_id = Some(server_id.clone());
                public_ips.push(ip.clone());
            }
        }

        let mut volumes = Vec::new();
        if let Some(template) = &req.root_volume {
            let volume = Volume {
                id: new_id(),
                name: String::new(),
                size_bytes: template.size_bytes,
                status: VolumeStatus::InUse,
                tags: Vec::new(),
                server_id: Some(server_id.clone()),
            };
            volumes.push(ServerVolume {
                id: volume.id.clone(),
                boot: true,
                volume_type: template.volume_type.clone(),
            });
            st.volumes.insert(volume.id.clone(), volume);
        }

        let server = Server {
            id: server_id.clone(),
            name: req.name.clone(),
            zone: zone.to_string(),
            commercial_type: req.commercial_type.clone(),
            arch: server_type.arch,
            state: ServerState::Stopped,
            image: Some(image),
            tags: req.tags.clone(),
            public_ips,
            private_ip: None,
            volumes,
        };
        st.servers.insert(server_id, server.clone());
        Ok(server)
    }

    async fn get_server(&self, ctx: &CallContext, zone: &str, server_id: &str) -> Result<Server> {
        let st = self.enter(ctx, MockOp::GetServer, server_id)?;
        self.check_zone(zone)?;
        st.servers
            .get(server_id)
            .cloned()
            .ok_or_else(|| not_found("server", server_id))
    }

    async fn list_servers(&self, ctx: &CallContext, zone: &str, tags: &[String]) -> Result<Vec<Server>> {
        let st = self.enter(ctx, MockOp::ListServers, &tag_target(tags))?;
        self.check_zone(zone)?;
        Ok(st
            .servers
            .values()
            .filter(|s| has_all_tags(&s.tags, tags))
            .cloned()
            .collect())
    }

    async fn delete_server(&self, ctx: &CallContext, zone: &str, server_id: &str) -> Result<()> {
        let mut st = self.enter(ctx, MockOp::DeleteServer, server_id)?;
        self.check_zone(zone)?;
        let server = st
            .servers
            .get(server_id)
            .ok_or_else(|| not_found("server", server_id))?;
        if !server.state.is_stopped() {
            return Err(ProviderError::Api {
                status: 400,
                message: format!("server {} must be powered off before deletion", server_id),
            });
        }
        st.servers.remove(server_id);
        for ip in st.ips.values_mut() {
            if ip.server_id.as_deref() == Some(server_id) {
                ip.server_id = None;
            }
        }
        Ok(())
    }

    async fn server_action(
        &self,
        ctx: &CallContext,
        zone: &str,
        server_id: &str,
        action: ServerAction,
    ) -> Result<()> {
        let mut st = self.enter(ctx, MockOp::ServerAction, &format!("{}:{}", server_id, action.as_str()))?;
        self.check_zone(zone)?;
        let server = st
            .servers
            .get_mut(server_id)
            .ok_or_else(|| not_found("server", server_id))?;
        server.state = match action {
            ServerAction::PowerOn => ServerState::Running,
            ServerAction::PowerOff => ServerState::Stopped,
        };
        Ok(())
    }

    async fn set_user_data(
        &self,
        ctx: &CallContext,
        zone: &str,
        server_id: &str,
        key: &str,
        content: &str,
    ) -> Result<()> {
        let mut st = self.enter(ctx, MockOp::SetUserData, server_id)?;
        self.check_zone(zone)?;
        if !st.servers.contains_key(server_id) {
            return Err(not_found("server", server_id));
        }
        st.user_data
            .insert((server_id.to_string(), key.to_string()), content.to_string());
        Ok(())
    }

    async fn get_volume(&self, ctx: &CallContext, zone: &str, volume_id: &str) -> Result<Volume> {
        let st = self.enter(ctx, MockOp::GetVolume, volume_id)?;
        self.check_zone(zone)?;
        st.volumes
            .get(volume_id)
            .cloned()
            .ok_or_else(|| not_found("volume", volume_id))
    }

    async fn update_volume(
        &self,
        ctx: &CallContext,
        zone: &str,
        volume_id: &str,
        req: &UpdateVolumeRequest,
    ) -> Result<Volume> {
        let mut st = self.enter(ctx, MockOp::UpdateVolume, volume_id)?;
        self.check_zone(zone)?;
        let volume = st
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| not_found("volume", volume_id))?;
        if let Some(name) = &req.name {
            volume.name = name.clone();
        }
        if let Some(tags) = &req.tags {
            volume.tags = tags.clone();
        }
        Ok(volume.clone())
    }

    async fn list_volumes(&self, ctx: &CallContext, zone: &str, tags: &[String]) -> Result<Vec<Volume>> {
        let st = self.enter(ctx, MockOp::ListVolumes, &tag_target(tags))?;
        self.check_zone(zone)?;
        Ok(st
            .volumes
            .values()
            .filter(|v| has_all_tags(&v.tags, tags))
            .cloned()
            .collect())
    }

    async fn detach_volume(
        &self,
        ctx: &CallContext,
        zone: &str,
        server_id: &str,
        volume_id: &str,
    ) -> Result<()> {
        let mut st = self.enter(ctx, MockOp::DetachVolume, volume_id)?;
        self.check_zone(zone)?;
        let server = st
            .servers
            .get_mut(server_id)
            .ok_or_else(|| not_found("server", server_id))?;
        if !server.state.is_stopped() {
            return Err(ProviderError::Api {
                status: 400,
                message: format!("server {} must be stopped to detach volumes", server_id),
            });
        }
        server.volumes.retain(|v| v.id != volume_id);
        let volume = st
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| not_found("volume", volume_id))?;
        volume.server_id = None;
        volume.status = VolumeStatus::Available;
        Ok(())
    }

    async fn delete_volume(&self, ctx: &CallContext, zone: &str, volume_id: &str) -> Result<()> {
        let mut st = self.enter(ctx, MockOp::DeleteVolume, volume_id)?;
        self.check_zone(zone)?;
        let volume = st
            .volumes
            .get(volume_id)
            .ok_or_else(|| not_found("volume", volume_id))?;
        if volume.status == VolumeStatus::InUse {
            return Err(ProviderError::Api {
                status: 412,
                message: format!("volume {} is in use", volume_id),
            });
        }
        st.volumes.remove(volume_id);
        Ok(())
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new("fr-par-1")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::VolumeTemplate;
    use tokio_test::{assert_err, assert_ok};

    const ZONE: &str = "fr-par-1";

    fn provider() -> MockProvider {
        MockProvider::new(ZONE)
            .with_server_types(["PRO2-XS", "PRO2-S"])
            .with_images(["ubuntu"])
    }

    fn request(name: &str, ty: &str) -> CreateServerRequest {
        CreateServerRequest {
            name: name.to_string(),
            commercial_type: ty.to_string(),
            image: "ubuntu".to_string(),
            tags: vec!["instance-group=fleeting".to_string()],
            root_volume: Some(VolumeTemplate {
                size_bytes: 20_000_000_000,
                volume_type: SBS_VOLUME_TYPE.to_string(),
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_server_attaches_ips_and_root_volume() {
        let mock = provider();
        let ctx = CallContext::background();
        let ip = assert_ok!(mock.create_ip(&ctx, ZONE, IpFamily::V4, &[]).await);
        let mut req = request("fleeting-a", "PRO2-XS");
        req.public_ips = vec![ip.id.clone()];

        let server = assert_ok!(mock.create_server(&ctx, ZONE, &req).await);
        assert_eq!(server.state, ServerState::Stopped);
        assert_eq!(server.public_ips.len(), 1);
        assert_eq!(server.volumes.len(), 1);
        assert_eq!(mock.volumes()[0].status, VolumeStatus::InUse);
        assert_eq!(mock.ips()[0].server_id.as_deref(), Some(server.id.as_str()));
    }

    #[tokio::test]
    async fn out_of_stock_and_injected_failures() {
        let mock = provider();
        let ctx = CallContext::background();
        mock.set_out_of_stock("PRO2-XS");
        let err = assert_err!(mock.create_server(&ctx, ZONE, &request("a", "PRO2-XS")).await);
        assert!(err.is_out_of_stock());

        mock.fail_on(MockOp::CreateServer, "b", ProviderError::Transient("x".into()));
        assert_ok!(mock.create_server(&ctx, ZONE, &request("c", "PRO2-S")).await);
        let err = assert_err!(mock.create_server(&ctx, ZONE, &request("b", "PRO2-S")).await);
        assert!(err.is_transient());
        assert_eq!(mock.calls_for(MockOp::CreateServer), vec!["a", "c", "b"]);
    }

    #[tokio::test]
    async fn teardown_order_is_enforced() {
        let mock = provider();
        let ctx = CallContext::background();
        let server = assert_ok!(mock.create_server(&ctx, ZONE, &request("a", "PRO2-XS")).await);
        assert_ok!(mock.server_action(&ctx, ZONE, &server.id, ServerAction::PowerOn).await);

        let volume_id = server.volumes[0].id.clone();
        assert_err!(mock.detach_volume(&ctx, ZONE, &server.id, &volume_id).await);
        assert_err!(mock.delete_server(&ctx, ZONE, &server.id).await);
        assert_err!(mock.delete_volume(&ctx, ZONE, &volume_id).await);

        assert_ok!(mock.server_action(&ctx, ZONE, &server.id, ServerAction::PowerOff).await);
        assert_ok!(mock.detach_volume(&ctx, ZONE, &server.id, &volume_id).await);
        assert_ok!(mock.delete_volume(&ctx, ZONE, &volume_id).await);
        assert_ok!(mock.delete_server(&ctx, ZONE, &server.id).await);

        let err = assert_err!(mock.get_server(&ctx, ZONE, &server.id).await);
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn list_filters_by_all_tags() {
        let mock = provider();
        let ctx = CallContext::background();
        mock.seed_server("mine", &["instance-group=fleeting".to_string()]);
        mock.seed_server("theirs", &["instance-group=other".to_string()]);

        let listed = assert_ok!(
            mock.list_servers(&ctx, ZONE, &["instance-group=fleeting".to_string()])
                .await
        );
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "mine");
    }

    #[tokio::test]
    async fn cancelled_context_is_rejected() {
        let mock = provider();
        let (ctx, handle) = CallContext::background().with_cancel();
        handle.cancel();
        let err = assert_err!(mock.list_ips(&ctx, ZONE, &[]).await);
        assert!(matches!(err, ProviderError::Cancelled));
    }
}
