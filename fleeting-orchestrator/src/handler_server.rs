use async_trait::async_trait;
use fleeting_providers::wait::{
    server_action_and_wait, wait_for_server_running, wait_for_server_stopped,
    wait_for_server_terminated, wait_for_volume_status,
};
use fleeting_providers::{
    CallContext, CreateServerRequest, ProviderError, Server, ServerAction, ServerState,
    UpdateVolumeRequest, VolumeStatus,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::errors::{GroupError, MultiError};
use crate::group::{Group, USER_DATA_KEY};
use crate::handler::{CleanupHandler, CreateHandler, Handler, SanityHandler};
use crate::instance::{Instance, PendingOperation};

/// Creates and deletes the server of an instance together with its public
/// IPs and root volume.
#[derive(Debug, Default, Clone, Copy)]
pub struct ServerHandler;

impl Handler for ServerHandler {
    fn name(&self) -> &'static str {
        "server"
    }

    fn as_create(&self) -> Option<&dyn CreateHandler> {
        Some(self)
    }

    fn as_cleanup(&self) -> Option<&dyn CleanupHandler> {
        Some(self)
    }

    fn as_sanity(&self) -> Option<&dyn SanityHandler> {
        Some(self)
    }
}

/// NotFound means the resource is already gone, which is what cleanup wants.
fn ignore_not_found(res: Result<(), ProviderError>) -> Result<(), ProviderError> {
    match res {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

impl ServerHandler {
    /// Tries each candidate type in order. Out of stock moves on to the next
    /// candidate, any other failure is final.
    async fn request_server(
        &self,
        ctx: &CallContext,
        group: &Group,
        instance_name: &str,
        opts: &mut CreateServerRequest,
    ) -> Result<Server, GroupError> {
        let api = group.api();
        for server_type in &group.server_types {
            opts.commercial_type = server_type.clone();
            match api.create_server(ctx, &group.zone, opts).await {
                Ok(server) => return Ok(server),
                Err(e) if e.is_out_of_stock() => {
                    warn!(
                        group = %group.name,
                        instance = %instance_name,
                        server_type = %server_type,
                        error = %e,
                        "server type not available"
                    );
                }
                Err(e) => return Err(GroupError::provider("request server creation", e)),
            }
        }
        Err(GroupError::CapacityExhausted {
            types: group.server_types.clone(),
        })
    }
}

#[async_trait]
impl CreateHandler for ServerHandler {
    async fn create(
        &self,
        ctx: &CallContext,
        group: &Group,
        instance: &mut Instance,
    ) -> Result<(), GroupError> {
        let api = group.api();
        let zone = group.zone.as_str();
        let tags = group.instance_tags(&instance.name);

        let mut opts = instance.opts.take().unwrap_or_default();
        opts.name = instance.name.clone();
        opts.tags = tags.clone();
        if opts.image.is_empty() {
            opts.image = group.image.clone();
        }

        // Addresses are allocated up front and attached at creation. They carry
        // the instance tag, so cleanup finds them even if the server never exists.
        opts.public_ips.clear();
        for family in group.ip_families() {
            let ip = api
                .create_ip(ctx, zone, family, &tags)
                .await
                .map_err(|e| GroupError::provider(format!("create {}", family.as_ip_type()), e))?;
            opts.public_ips.push(ip.id);
        }

        let requested = self.request_server(ctx, group, &instance.name, &mut opts).await;
        instance.opts = Some(opts);
        let server = requested?;
        instance.id = server.id.clone();
        info!(
            group = %group.name,
            instance = %instance.name,
            server_id = %server.id,
            server_type = %server.commercial_type,
            "server requested"
        );

        api.set_user_data(ctx, zone, &server.id, USER_DATA_KEY, &group.config.user_data)
            .await
            .map_err(|e| GroupError::provider("set server user data", e))?;

        match server.volumes.iter().find(|v| v.boot).or(server.volumes.first()) {
            Some(root) => {
                let update = UpdateVolumeRequest {
                    name: Some(instance.name.clone()),
                    tags: Some(tags.clone()),
                    perf_iops: group.config.volume_iops,
                };
                api.update_volume(ctx, zone, &root.id, &update)
                    .await
                    .map_err(|e| GroupError::provider("update root volume", e))?;
            }
            None => debug!(server_id = %server.id, "server has no root volume to tag"),
        }

        api.server_action(ctx, zone, &server.id, ServerAction::PowerOn)
            .await
            .map_err(|e| GroupError::provider("power on server", e))?;

        let api = Arc::clone(api);
        let wait_ctx = ctx.clone();
        let zone = zone.to_string();
        let server_id = server.id.clone();
        let opts = group.config.wait;
        instance.set_pending(PendingOperation::new(
            format!("server {} running", server.id),
            async move {
                wait_for_server_running(api.as_ref(), &wait_ctx, &zone, &server_id, opts)
                    .await
                    .map(|_| ())
            },
        ));
        instance.server = Some(server);
        Ok(())
    }
}

#[async_trait]
impl CleanupHandler for ServerHandler {
    async fn cleanup(
        &self,
        ctx: &CallContext,
        group: &Group,
        instance: &mut Instance,
    ) -> Result<(), GroupError> {
        if instance.name.is_empty() && instance.id.is_empty() {
            return Ok(());
        }
        let api = group.api();
        let zone = group.zone.as_str();
        let wait = group.config.wait;

        let mut servers = Vec::new();
        if !instance.id.is_empty() {
            match api.get_server(ctx, zone, &instance.id).await {
                Ok(s) => servers.push(s),
                Err(e) if e.is_not_found() => {
                    debug!(instance = %instance.name, server_id = %instance.id, "server already gone");
                }
                Err(e) => return Err(GroupError::provider("get server", e)),
            }
        } else {
            // A create request cut short may still have produced a tagged server.
            servers = api
                .list_servers(ctx, zone, &group.instance_tags(&instance.name))
                .await
                .map_err(|e| GroupError::provider("list servers", e))?;
            if !servers.is_empty() {
                warn!(
                    group = %group.name,
                    instance = %instance.name,
                    count = servers.len(),
                    "found untracked servers by instance tag"
                );
            }
        }
        if instance.name.is_empty() {
            if let Some(s) = servers.first() {
                instance.name = s.name.clone();
            }
        }
        let tags = (!instance.name.is_empty()).then(|| group.instance_tags(&instance.name));

        // Public IPs
        if let Some(tags) = &tags {
            let ips = api
                .list_ips(ctx, zone, tags)
                .await
                .map_err(|e| GroupError::provider("list ips", e))?;
            for ip in ips {
                ignore_not_found(api.delete_ip(ctx, zone, &ip.id).await)
                    .map_err(|e| GroupError::provider(format!("delete ip {}", ip.id), e))?;
            }
        }

        // Power off
        for s in &servers {
            match s.state {
                ServerState::Stopped | ServerState::StoppedInPlace => {}
                ServerState::Stopping => {
                    wait_for_server_stopped(api.as_ref(), ctx, zone, &s.id, wait)
                        .await
                        .map_err(|e| GroupError::provider("wait for server to stop", e))?;
                }
                _ => {
                    server_action_and_wait(api.as_ref(), ctx, zone, &s.id, ServerAction::PowerOff, wait)
                        .await
                        .map_err(|e| GroupError::provider("power off server", e))?;
                }
            }
        }

        // Volumes: the ones attached to the servers plus the ones tagged for the instance.
        let mut volume_ids: Vec<String> = Vec::new();
        for s in &servers {
            for v in &s.volumes {
                ignore_not_found(api.detach_volume(ctx, zone, &s.id, &v.id).await)
                    .map_err(|e| GroupError::provider(format!("detach volume {}", v.id), e))?;
                volume_ids.push(v.id.clone());
            }
        }
        if let Some(tags) = &tags {
            let volumes = api
                .list_volumes(ctx, zone, tags)
                .await
                .map_err(|e| GroupError::provider("list volumes", e))?;
            for v in volumes {
                if !volume_ids.contains(&v.id) {
                    volume_ids.push(v.id);
                }
            }
        }
        for volume_id in &volume_ids {
            match wait_for_volume_status(api.as_ref(), ctx, zone, volume_id, &[VolumeStatus::Available], wait)
                .await
            {
                Ok(_) => {}
                Err(e) if e.is_not_found() => continue,
                Err(e) => {
                    return Err(GroupError::provider(
                        format!("wait for volume {} to be available", volume_id),
                        e,
                    ))
                }
            }
            ignore_not_found(api.delete_volume(ctx, zone, volume_id).await)
                .map_err(|e| GroupError::provider(format!("delete volume {}", volume_id), e))?;
        }

        // Servers
        let server_ids: Vec<String> = servers.into_iter().map(|s| s.id).collect();
        for server_id in &server_ids {
            ignore_not_found(api.delete_server(ctx, zone, server_id).await)
                .map_err(|e| GroupError::provider("request server deletion", e))?;
            info!(group = %group.name, instance = %instance.name, server_id = %server_id, "server deletion requested");
        }
        if !server_ids.is_empty() {
            let api = Arc::clone(api);
            let wait_ctx = ctx.clone();
            let zone = zone.to_string();
            instance.set_pending(PendingOperation::new(
                format!("server {} terminated", server_ids.join(", ")),
                async move {
                    for server_id in &server_ids {
                        wait_for_server_terminated(api.as_ref(), &wait_ctx, &zone, server_id, wait).await?;
                    }
                    Ok::<(), ProviderError>(())
                },
            ));
        }
        instance.server = None;
        Ok(())
    }
}

#[async_trait]
impl SanityHandler for ServerHandler {
    /// Reports IPs and volumes tagged for an instance of this group whose
    /// server does not exist.
    async fn sanity(&self, ctx: &CallContext, group: &Group) -> Result<(), MultiError> {
        let api = group.api();
        let zone = group.zone.as_str();
        let mut errs = MultiError::new();

        let servers = api
            .list_servers(ctx, zone, &group.tags)
            .await
            .map_err(|e| GroupError::provider("list servers", e))?;
        let live: HashSet<String> = servers.into_iter().map(|s| s.name).collect();

        match api.list_ips(ctx, zone, &group.tags).await {
            Ok(ips) => {
                for ip in ips {
                    if ip.server_id.is_some() {
                        continue;
                    }
                    if let Some(name) = Group::instance_from_tags(&ip.tags) {
                        if !live.contains(name) {
                            errs.push(GroupError::Orphaned {
                                resource: "ip",
                                id: ip.id.clone(),
                                instance: name.to_string(),
                            });
                        }
                    }
                }
            }
            Err(e) => errs.push(GroupError::provider("list ips", e)),
        }

        match api.list_volumes(ctx, zone, &group.tags).await {
            Ok(volumes) => {
                for volume in volumes {
                    if let Some(name) = Group::instance_from_tags(&volume.tags) {
                        if !live.contains(name) {
                            errs.push(GroupError::Orphaned {
                                resource: "volume",
                                id: volume.id.clone(),
                                instance: name.to_string(),
                            });
                        }
                    }
                }
            }
            Err(e) => errs.push(GroupError::provider("list volumes", e)),
        }

        errs.into_result()
    }
}
