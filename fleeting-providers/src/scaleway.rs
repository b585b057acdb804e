use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, info};

use crate::resources::SBS_VOLUME_TYPE;
use crate::{
    CallContext, CreateServerRequest, Image, IpFamily, ProviderApi, ProviderError, PublicIp,
    Result, Server, ServerAction, ServerState, ServerType, ServerVolume, UpdateVolumeRequest,
    Volume, VolumeStatus,
};

pub const DEFAULT_API_URL: &str = "https://api.scaleway.com";

/// Zones served by the instance and block APIs.
pub const KNOWN_ZONES: &[&str] = &[
    "fr-par-1", "fr-par-2", "fr-par-3", "nl-ams-1", "nl-ams-2", "nl-ams-3", "pl-waw-1",
    "pl-waw-2", "pl-waw-3",
];

const PER_PAGE: usize = 100;

pub struct ScalewayProvider {
    client: Client,
    base_url: String,
    project_id: String,
    auth_token: HeaderValue,
}

impl ScalewayProvider {
    pub fn new(project_id: &str, secret_key: &str, api_url: Option<&str>) -> Result<Self> {
        // Default reqwest client has no overall timeout. If Scaleway stalls, a call can hang forever.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(20))
            .build()
            .map_err(|e| ProviderError::Config(format!("could not build http client: {}", e)))?;
        let auth_token = HeaderValue::from_str(secret_key.trim())
            .map_err(|_| ProviderError::Config("secret key is not a valid header value".into()))?;
        let base_url = api_url
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_API_URL)
            .trim_end_matches('/')
            .to_string();
        Ok(Self {
            client,
            base_url,
            project_id: project_id.trim().to_string(),
            auth_token,
        })
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("X-Auth-Token", self.auth_token.clone());
        headers
    }

    fn instance_url(&self, zone: &str, path: &str) -> String {
        format!("{}/instance/v1/zones/{}/{}", self.base_url, zone, path)
    }

    fn block_url(&self, zone: &str, path: &str) -> String {
        format!("{}/block/v1/zones/{}/{}", self.base_url, zone, path)
    }

    /// Sends the request under `ctx` and returns the raw body of a 2xx response.
    async fn execute(&self, ctx: &CallContext, req: RequestBuilder, what: &str) -> Result<String> {
        ctx.run(send_checked(req.headers(self.headers()), what)).await
    }

    async fn call<T: DeserializeOwned>(
        &self,
        ctx: &CallContext,
        req: RequestBuilder,
        what: &str,
    ) -> Result<T> {
        let body = self.execute(ctx, req, what).await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Fetches every page of a list endpoint. `size_param` differs between
    /// the instance (`per_page`) and block (`page_size`) APIs.
    async fn paginate<W, T>(
        &self,
        ctx: &CallContext,
        url: &str,
        query: &[(&str, String)],
        size_param: &str,
        what: &str,
        items: fn(W) -> Vec<T>,
    ) -> Result<Vec<T>>
    where
        W: DeserializeOwned,
    {
        let mut out = Vec::new();
        for page in 1u32.. {
            let req = self
                .client
                .get(url)
                .query(query)
                .query(&[("page", page.to_string()), (size_param, PER_PAGE.to_string())]);
            let batch = items(self.call::<W>(ctx, req, what).await?);
            let n = batch.len();
            out.extend(batch);
            if n < PER_PAGE {
                break;
            }
        }
        Ok(out)
    }

    fn instance_list_query(&self, tags: &[String]) -> Vec<(&'static str, String)> {
        let mut query = vec![("project", self.project_id.clone())];
        if !tags.is_empty() {
            query.push(("tags", tags.join(",")));
        }
        query
    }
}

async fn send_checked(req: RequestBuilder, what: &str) -> Result<String> {
    let resp = req.send().await?;
    let status = resp.status();
    let body = resp.text().await?;
    if status.is_success() {
        return Ok(body);
    }
    let err = classify_error(status.as_u16(), &body);
    debug!(status = status.as_u16(), error = %err, "scaleway {} failed", what);
    Err(err)
}

/// Maps a non-2xx response onto the error classes callers branch on.
pub fn classify_error(status: u16, body: &str) -> ProviderError {
    let parsed: Option<WireError> = serde_json::from_str(body).ok();
    let (kind, message) = match parsed {
        Some(e) => (e.kind, e.message),
        None => (String::new(), body.trim().to_string()),
    };
    let message = if message.is_empty() {
        format!("status {}", status)
    } else {
        message
    };

    match (status, kind.as_str()) {
        (_, "out_of_stock") => ProviderError::OutOfStock(message),
        (404, _) | (_, "not_found") => ProviderError::NotFound(message),
        (409, _) | (429, _) | (_, "transient_state") => ProviderError::Transient(message),
        (s, _) if s >= 500 => ProviderError::Transient(message),
        _ => ProviderError::Api { status, message },
    }
}

// --- Wire types ---

#[derive(Debug, Deserialize)]
struct WireError {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct WireRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct WireIp {
    id: String,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    prefix: Option<String>,
    #[serde(rename = "type", default)]
    ip_type: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    server: Option<WireRef>,
}

impl From<WireIp> for PublicIp {
    fn from(w: WireIp) -> Self {
        // Routed IPv6 carries a prefix instead of an address.
        let address: Option<IpAddr> = w
            .address
            .as_deref()
            .or(w.prefix.as_deref())
            .and_then(|s| s.split('/').next())
            .and_then(|s| s.parse().ok());
        let family = IpFamily::from_ip_type(&w.ip_type).unwrap_or(match address {
            Some(IpAddr::V6(_)) => IpFamily::V6,
            _ => IpFamily::V4,
        });
        PublicIp {
            id: w.id,
            address,
            family,
            tags: w.tags,
            server_id: w.server.map(|s| s.id),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireImage {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    arch: String,
}

impl From<WireImage> for Image {
    fn from(w: WireImage) -> Self {
        Image {
            id: w.id,
            name: w.name,
            arch: w.arch,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireServerVolume {
    id: String,
    #[serde(default)]
    volume_type: String,
    #[serde(default)]
    boot: bool,
}

#[derive(Debug, Deserialize)]
struct WireServer {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    zone: String,
    #[serde(default)]
    commercial_type: String,
    #[serde(default)]
    arch: String,
    state: String,
    #[serde(default)]
    image: Option<WireImage>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    public_ips: Vec<WireIp>,
    #[serde(default)]
    private_ip: Option<String>,
    #[serde(default)]
    volumes: BTreeMap<String, WireServerVolume>,
}

impl From<WireServer> for Server {
    fn from(w: WireServer) -> Self {
        let volumes = w
            .volumes
            .into_iter()
            .map(|(slot, v)| ServerVolume {
                boot: v.boot || slot == "0",
                id: v.id,
                volume_type: v.volume_type,
            })
            .collect();
        Server {
            id: w.id,
            name: w.name,
            zone: w.zone,
            commercial_type: w.commercial_type,
            arch: w.arch,
            state: ServerState::parse(&w.state),
            image: w.image.map(Image::from),
            tags: w.tags,
            public_ips: w.public_ips.into_iter().map(PublicIp::from).collect(),
            private_ip: w.private_ip,
            volumes,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireVolumeReference {
    #[serde(default)]
    product_resource_id: String,
    #[serde(default)]
    product_resource_type: String,
}

#[derive(Debug, Deserialize)]
struct WireVolume {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    size: u64,
    status: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    references: Vec<WireVolumeReference>,
}

impl From<WireVolume> for Volume {
    fn from(w: WireVolume) -> Self {
        let server_id = w
            .references
            .into_iter()
            .find(|r| r.product_resource_type == "instance_server")
            .map(|r| r.product_resource_id);
        Volume {
            id: w.id,
            name: w.name,
            size_bytes: w.size,
            status: VolumeStatus::parse(&w.status),
            tags: w.tags,
            server_id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireServerTypeInfo {
    #[serde(default)]
    arch: String,
}

#[derive(Debug, Deserialize)]
struct ServerTypesPage {
    #[serde(default)]
    servers: HashMap<String, WireServerTypeInfo>,
}

#[derive(Debug, Deserialize)]
struct ImageEnvelope {
    image: WireImage,
}

#[derive(Debug, Deserialize)]
struct IpEnvelope {
    ip: WireIp,
}

#[derive(Debug, Deserialize)]
struct IpsPage {
    #[serde(default)]
    ips: Vec<WireIp>,
}

#[derive(Debug, Deserialize)]
struct ServerEnvelope {
    server: WireServer,
}

#[derive(Debug, Deserialize)]
struct ServersPage {
    #[serde(default)]
    servers: Vec<WireServer>,
}

#[derive(Debug, Deserialize)]
struct VolumesPage {
    #[serde(default)]
    volumes: Vec<WireVolume>,
}

#[async_trait]
impl ProviderApi for ScalewayProvider {
    fn code(&self) -> &'static str {
        "scaleway"
    }

    fn zone_exists(&self, zone: &str) -> bool {
        KNOWN_ZONES.contains(&zone)
    }

    async fn get_server_type(&self, ctx: &CallContext, zone: &str, name: &str) -> Result<ServerType> {
        let url = self.instance_url(zone, "products/servers");
        for page in 1u32.. {
            let req = self
                .client
                .get(&url)
                .query(&[("page", page.to_string()), ("per_page", PER_PAGE.to_string())]);
            let mut res: ServerTypesPage = self.call(ctx, req, "list server types").await?;
            if let Some(info) = res.servers.remove(name) {
                return Ok(ServerType {
                    name: name.to_string(),
                    arch: info.arch,
                });
            }
            if res.servers.len() < PER_PAGE {
                break;
            }
        }
        Err(ProviderError::NotFound(format!("server type {}", name)))
    }

    async fn get_image(&self, ctx: &CallContext, zone: &str, image_id: &str) -> Result<Image> {
        let req = self.client.get(self.instance_url(zone, &format!("images/{}", image_id)));
        let res: ImageEnvelope = self.call(ctx, req, "get image").await?;
        Ok(res.image.into())
    }

    async fn create_ip(
        &self,
        ctx: &CallContext,
        zone: &str,
        family: IpFamily,
        tags: &[String],
    ) -> Result<PublicIp> {
        let body = json!({
            "project": self.project_id,
            "type": family.as_ip_type(),
            "tags": tags,
        });
        let req = self.client.post(self.instance_url(zone, "ips")).json(&body);
        let res: IpEnvelope = self.call(ctx, req, "create ip").await?;
        let ip = PublicIp::from(res.ip);
        debug!(ip_id = %ip.id, zone, "scaleway ip created");
        Ok(ip)
    }

    async fn list_ips(&self, ctx: &CallContext, zone: &str, tags: &[String]) -> Result<Vec<PublicIp>> {
        let url = self.instance_url(zone, "ips");
        let query = self.instance_list_query(tags);
        self.paginate(ctx, &url, &query, "per_page", "list ips", |p: IpsPage| {
            p.ips.into_iter().map(PublicIp::from).collect()
        })
        .await
    }

    async fn delete_ip(&self, ctx: &CallContext, zone: &str, ip_id: &str) -> Result<()> {
        let req = self.client.delete(self.instance_url(zone, &format!("ips/{}", ip_id)));
        self.execute(ctx, req, "delete ip").await?;
        debug!(ip_id, zone, "scaleway ip deleted");
        Ok(())
    }

    async fn create_server(
        &self,
        ctx: &CallContext,
        zone: &str,
        req: &CreateServerRequest,
    ) -> Result<Server> {
        let mut body = json!({
            "name": req.name,
            "commercial_type": req.commercial_type,
            "image": req.image,
            "project": self.project_id,
            "tags": req.tags,
            "public_ips": req.public_ips,
            "dynamic_ip_required": req.dynamic_ip_required,
        });
        if let Some(root) = &req.root_volume {
            let volume_type = if root.volume_type.is_empty() {
                SBS_VOLUME_TYPE
            } else {
                root.volume_type.as_str()
            };
            body["volumes"] = json!({
                "0": { "size": root.size_bytes, "volume_type": volume_type }
            });
        }
        let http = self.client.post(self.instance_url(zone, "servers")).json(&body);
        let res: ServerEnvelope = self.call(ctx, http, "create server").await?;
        let server = Server::from(res.server);
        info!(
            server_id = %server.id,
            server_type = %req.commercial_type,
            zone,
            "scaleway server created"
        );
        Ok(server)
    }

    async fn get_server(&self, ctx: &CallContext, zone: &str, server_id: &str) -> Result<Server> {
        let req = self.client.get(self.instance_url(zone, &format!("servers/{}", server_id)));
        let res: ServerEnvelope = self.call(ctx, req, "get server").await?;
        Ok(res.server.into())
    }

    async fn list_servers(&self, ctx: &CallContext, zone: &str, tags: &[String]) -> Result<Vec<Server>> {
        let url = self.instance_url(zone, "servers");
        let query = self.instance_list_query(tags);
        self.paginate(ctx, &url, &query, "per_page", "list servers", |p: ServersPage| {
            p.servers.into_iter().map(Server::from).collect()
        })
        .await
    }

    async fn delete_server(&self, ctx: &CallContext, zone: &str, server_id: &str) -> Result<()> {
        let req = self.client.delete(self.instance_url(zone, &format!("servers/{}", server_id)));
        self.execute(ctx, req, "delete server").await?;
        info!(server_id, zone, "scaleway server deletion requested");
        Ok(())
    }

    async fn server_action(
        &self,
        ctx: &CallContext,
        zone: &str,
        server_id: &str,
        action: ServerAction,
    ) -> Result<()> {
        let req = self
            .client
            .post(self.instance_url(zone, &format!("servers/{}/action", server_id)))
            .json(&json!({ "action": action.as_str() }));
        self.execute(ctx, req, action.as_str()).await?;
        debug!(server_id, action = action.as_str(), "scaleway server action accepted");
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
        let req = self
            .client
            .patch(self.instance_url(zone, &format!("servers/{}/user_data/{}", server_id, key)))
            .header(CONTENT_TYPE, "text/plain")
            .body(content.to_string());
        self.execute(ctx, req, "set user data").await?;
        Ok(())
    }

    async fn get_volume(&self, ctx: &CallContext, zone: &str, volume_id: &str) -> Result<Volume> {
        let req = self.client.get(self.block_url(zone, &format!("volumes/{}", volume_id)));
        let res: WireVolume = self.call(ctx, req, "get volume").await?;
        Ok(res.into())
    }

    async fn update_volume(
        &self,
        ctx: &CallContext,
        zone: &str,
        volume_id: &str,
        req: &UpdateVolumeRequest,
    ) -> Result<Volume> {
        let mut body = json!({});
        if let Some(name) = &req.name {
            body["name"] = json!(name);
        }
        if let Some(tags) = &req.tags {
            body["tags"] = json!(tags);
        }
        if let Some(iops) = req.perf_iops {
            body["perf_iops"] = json!(iops);
        }
        let http = self
            .client
            .patch(self.block_url(zone, &format!("volumes/{}", volume_id)))
            .json(&body);
        let res: WireVolume = self.call(ctx, http, "update volume").await?;
        Ok(res.into())
    }

    async fn list_volumes(&self, ctx: &CallContext, zone: &str, tags: &[String]) -> Result<Vec<Volume>> {
        let url = self.block_url(zone, "volumes");
        let mut query = vec![("project_id", self.project_id.clone())];
        query.extend(tags.iter().map(|t| ("tags", t.clone())));
        self.paginate(ctx, &url, &query, "page_size", "list volumes", |p: VolumesPage| {
            p.volumes.into_iter().map(Volume::from).collect()
        })
        .await
    }

    async fn detach_volume(
        &self,
        ctx: &CallContext,
        zone: &str,
        server_id: &str,
        volume_id: &str,
    ) -> Result<()> {
        let req = self
            .client
            .post(self.instance_url(zone, &format!("servers/{}/detach-volume", server_id)))
            .json(&json!({ "volume_id": volume_id }));
        self.execute(ctx, req, "detach volume").await?;
        debug!(server_id, volume_id, "scaleway volume detached");
        Ok(())
    }

    async fn delete_volume(&self, ctx: &CallContext, zone: &str, volume_id: &str) -> Result<()> {
        let req = self.client.delete(self.block_url(zone, &format!("volumes/{}", volume_id)));
        self.execute(ctx, req, "delete volume").await?;
        debug!(volume_id, zone, "scaleway volume deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_provider_errors() {
        let oos = classify_error(
            412,
            r#"{"type":"out_of_stock","message":"server type PRO2-XS is out of stock"}"#,
        );
        assert!(oos.is_out_of_stock());

        // Other precondition failures are final, not a capacity problem.
        match classify_error(
            412,
            r#"{"type":"precondition_failed","message":"resource is still in use"}"#,
        ) {
            ProviderError::Api { status, message } => {
                assert_eq!(status, 412);
                assert_eq!(message, "resource is still in use");
            }
            other => panic!("unexpected {:?}", other),
        }

        let nf = classify_error(404, r#"{"type":"unknown_resource","message":"server not found"}"#);
        assert!(nf.is_not_found());

        assert!(classify_error(409, r#"{"type":"transient_state","message":"busy"}"#).is_transient());
        assert!(classify_error(429, "").is_transient());
        assert!(classify_error(503, "<html>bad gateway</html>").is_transient());

        match classify_error(400, r#"{"type":"invalid_arguments","message":"bad image"}"#) {
            ProviderError::Api { status, message } => {
                assert_eq!(status, 400);
                assert_eq!(message, "bad image");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn decodes_server_payload() {
        let raw = r#"{
            "server": {
                "id": "11111111-2222-3333-4444-555555555555",
                "name": "fleeting-abc",
                "zone": "fr-par-1",
                "commercial_type": "PRO2-XS",
                "arch": "x86_64",
                "state": "stopped in place",
                "image": {"id": "img-1", "name": "Ubuntu 24.04", "arch": "x86_64"},
                "tags": ["instance-group=fleeting"],
                "public_ips": [
                    {"id": "ip-4", "address": "51.15.0.1", "type": "routed_ipv4"},
                    {"id": "ip-6", "prefix": "2001:bc8::/64", "type": "routed_ipv6"}
                ],
                "private_ip": null,
                "volumes": {"0": {"id": "vol-1", "volume_type": "sbs_volume"}}
            }
        }"#;
        let env: ServerEnvelope = serde_json::from_str(raw).unwrap();
        let server = Server::from(env.server);
        assert_eq!(server.state, ServerState::StoppedInPlace);
        assert_eq!(server.image.as_ref().map(|i| i.name.as_str()), Some("Ubuntu 24.04"));
        assert_eq!(
            server.public_address(IpFamily::V4),
            Some("51.15.0.1".parse().unwrap())
        );
        assert_eq!(
            server.public_address(IpFamily::V6),
            Some("2001:bc8::".parse().unwrap())
        );
        assert_eq!(server.volumes.len(), 1);
        assert!(server.volumes[0].boot);
    }

    #[test]
    fn decodes_block_volume_references() {
        let raw = r#"{
            "id": "vol-1",
            "name": "fleeting-abc",
            "size": 20000000000,
            "status": "in_use",
            "tags": ["instance=fleeting-abc"],
            "references": [
                {"product_resource_id": "srv-1", "product_resource_type": "instance_server"}
            ]
        }"#;
        let volume = Volume::from(serde_json::from_str::<WireVolume>(raw).unwrap());
        assert_eq!(volume.status, VolumeStatus::InUse);
        assert_eq!(volume.server_id.as_deref(), Some("srv-1"));
    }

    #[test]
    fn builds_zone_scoped_urls() {
        let p = ScalewayProvider::new("proj", "secret", Some("http://localhost:8080/")).unwrap();
        assert_eq!(
            p.instance_url("fr-par-2", "servers/abc/action"),
            "http://localhost:8080/instance/v1/zones/fr-par-2/servers/abc/action"
        );
        assert_eq!(
            p.block_url("nl-ams-1", "volumes"),
            "http://localhost:8080/block/v1/zones/nl-ams-1/volumes"
        );
        assert!(p.zone_exists("pl-waw-3"));
        assert!(!p.zone_exists("us-east-1"));
    }

    #[test]
    fn rejects_unusable_secret() {
        assert!(matches!(
            ScalewayProvider::new("proj", "bad\nkey", None),
            Err(ProviderError::Config(_))
        ));
    }
}
