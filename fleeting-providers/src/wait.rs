use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::{CallContext, ProviderApi, ProviderError, Result, Server, ServerAction, ServerState};
use crate::{Volume, VolumeStatus};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

/// Polling bounds for long-running provider operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WaitOptions {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            interval: DEFAULT_INTERVAL,
        }
    }
}

/// Calls `check` until it yields a value, fails, or `opts.timeout` elapses.
/// Transient errors are retried.
async fn poll<T, F, Fut>(ctx: &CallContext, opts: WaitOptions, what: &str, mut check: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let started = Instant::now();
    loop {
        match check().await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {}
            Err(e) if e.is_transient() => debug!(error = %e, "retrying {}", what),
            Err(e) => return Err(e),
        }
        if started.elapsed() >= opts.timeout {
            return Err(ProviderError::Timeout(opts.timeout, what.to_string()));
        }
        ctx.sleep(opts.interval).await?;
    }
}

/// Waits until the server is running. A locked server is a terminal failure.
pub async fn wait_for_server_running(
    api: &dyn ProviderApi,
    ctx: &CallContext,
    zone: &str,
    server_id: &str,
    opts: WaitOptions,
) -> Result<Server> {
    let what = format!("server {} to be running", server_id);
    poll(ctx, opts, &what, || async move {
        let server = api.get_server(ctx, zone, server_id).await?;
        match server.state {
            ServerState::Running => Ok(Some(server)),
            ServerState::Locked => Err(ProviderError::UnexpectedState(format!(
                "server {} is locked",
                server_id
            ))),
            _ => Ok(None),
        }
    })
    .await
}

pub async fn wait_for_server_stopped(
    api: &dyn ProviderApi,
    ctx: &CallContext,
    zone: &str,
    server_id: &str,
    opts: WaitOptions,
) -> Result<Server> {
    let what = format!("server {} to be stopped", server_id);
    poll(ctx, opts, &what, || async move {
        let server = api.get_server(ctx, zone, server_id).await?;
        Ok(server.state.is_stopped().then_some(server))
    })
    .await
}

/// Waits until the provider no longer knows the server.
pub async fn wait_for_server_terminated(
    api: &dyn ProviderApi,
    ctx: &CallContext,
    zone: &str,
    server_id: &str,
    opts: WaitOptions,
) -> Result<()> {
    let what = format!("server {} to be terminated", server_id);
    poll(ctx, opts, &what, || async move {
        match api.get_server(ctx, zone, server_id).await {
            Ok(_) => Ok(None),
            Err(e) if e.is_not_found() => Ok(Some(())),
            Err(e) => Err(e),
        }
    })
    .await
}

/// Waits until the volume reaches one of `statuses`, e.g. `available` after a detach.
pub async fn wait_for_volume_status(
    api: &dyn ProviderApi,
    ctx: &CallContext,
    zone: &str,
    volume_id: &str,
    statuses: &[VolumeStatus],
    opts: WaitOptions,
) -> Result<Volume> {
    let what = format!("volume {} to reach {:?}", volume_id, statuses);
    poll(ctx, opts, &what, || async move {
        let volume = api.get_volume(ctx, zone, volume_id).await?;
        Ok(statuses.contains(&volume.status).then_some(volume))
    })
    .await
}

/// Issues a power action and waits for the matching state.
pub async fn server_action_and_wait(
    api: &dyn ProviderApi,
    ctx: &CallContext,
    zone: &str,
    server_id: &str,
    action: ServerAction,
    opts: WaitOptions,
) -> Result<Server> {
    api.server_action(ctx, zone, server_id, action).await?;
    match action {
        ServerAction::PowerOn => wait_for_server_running(api, ctx, zone, server_id, opts).await,
        ServerAction::PowerOff => wait_for_server_stopped(api, ctx, zone, server_id, opts).await,
    }
}
