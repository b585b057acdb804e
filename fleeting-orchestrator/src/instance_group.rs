use fleeting_providers::{CallContext, ProviderApi};
use futures_util::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::errors::{GroupError, MultiError};
use crate::group::{Group, GroupConfig};
use crate::handler::Handler;
use crate::handler_base::BaseHandler;
use crate::handler_server::ServerHandler;
use crate::instance::Instance;
use crate::naming::{NameGenerator, RandomNameGenerator};

/// Partial success of a batch: identifiers of the instances that made it,
/// plus every error observed along the way.
pub type BatchResult = (Vec<String>, Result<(), MultiError>);

/// Scales one named group of servers up and down through a pipeline of
/// handlers.
///
/// Callers must not run two `increase`/`decrease` calls on the same group
/// concurrently; [`crate::FleetingGroup`] serializes them.
pub struct InstanceGroup {
    name: String,
    config: GroupConfig,
    api: Arc<dyn ProviderApi>,
    names: Arc<dyn NameGenerator>,
    pipeline: Vec<Arc<dyn Handler>>,
    group: Option<Group>,
}

/// Moves failed instances out of `instances`, recording their errors.
/// `results` is aligned with `instances`.
fn partition(
    instances: Vec<Instance>,
    results: Vec<Result<(), GroupError>>,
    failed: Option<&mut Vec<Instance>>,
    errs: &mut MultiError,
) -> Vec<Instance> {
    let mut ok = Vec::with_capacity(instances.len());
    let mut dropped = Vec::new();
    for (instance, res) in instances.into_iter().zip(results) {
        match res {
            Ok(()) => ok.push(instance),
            Err(e) => {
                warn!(instance = %instance.name, error = %e, "instance failed");
                errs.push(e);
                dropped.push(instance);
            }
        }
    }
    if let Some(failed) = failed {
        failed.extend(dropped);
    }
    ok
}

impl InstanceGroup {
    pub fn new(api: Arc<dyn ProviderApi>, name: impl Into<String>, config: GroupConfig) -> Self {
        Self {
            name: name.into(),
            config,
            api,
            names: Arc::new(RandomNameGenerator),
            pipeline: vec![Arc::new(BaseHandler), Arc::new(ServerHandler)],
            group: None,
        }
    }

    pub fn with_name_generator(mut self, names: Arc<dyn NameGenerator>) -> Self {
        self.names = names;
        self
    }

    /// Replaces the default `[base, server]` pipeline. Create phases run the
    /// stages in order, cleanup phases in reverse.
    pub fn with_pipeline(mut self, pipeline: Vec<Arc<dyn Handler>>) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group(&self) -> Result<&Group, GroupError> {
        self.group.as_ref().ok_or(GroupError::NotInitialized)
    }

    fn parallelism(&self) -> usize {
        self.config.parallelism.max(1)
    }

    /// Validates zone, server types and image once, then freezes the group.
    pub async fn init(&mut self, ctx: &CallContext) -> Result<(), GroupError> {
        if self.name.is_empty() {
            return Err(GroupError::Config("missing group name".into()));
        }
        if self.config.server_types.is_empty() {
            return Err(GroupError::Config("no server type configured".into()));
        }
        if self.config.image.is_empty() {
            return Err(GroupError::Config("no image configured".into()));
        }
        if !self.api.zone_exists(&self.config.zone) {
            return Err(GroupError::Config(format!("zone not found: {}", self.config.zone)));
        }

        for server_type in &self.config.server_types {
            self.api
                .get_server_type(ctx, &self.config.zone, server_type)
                .await
                .map_err(|e| GroupError::provider(format!("find server type {}", server_type), e))?;
        }
        self.api
            .get_image(ctx, &self.config.zone, &self.config.image)
            .await
            .map_err(|e| GroupError::provider(format!("find image {}", self.config.image), e))?;

        let mut config = self.config.clone();
        if config.server_name_prefix.is_empty() {
            config.server_name_prefix = self.name.clone();
        }
        let group = Group::new(self.name.clone(), config, Arc::clone(&self.api));
        info!(group = %group.name, zone = %group.zone, server_types = ?group.server_types, "instance group initialized");
        self.group = Some(group);
        Ok(())
    }

    /// Creates up to `delta` instances. Returns the identifiers of those that
    /// are fully running; every failed instance is rolled back.
    pub async fn increase(&self, ctx: &CallContext, delta: usize) -> BatchResult {
        let group = match self.group() {
            Ok(g) => g,
            Err(e) => return (Vec::new(), Err(e.into())),
        };
        if delta == 0 {
            return (Vec::new(), Ok(()));
        }

        for handler in &self.pipeline {
            let Some(stage) = handler.as_pre_increase() else {
                continue;
            };
            if let Err(e) = stage.pre_increase(ctx, group).await {
                return (Vec::new(), Err(e.into()));
            }
        }

        let par = self.parallelism();
        let mut errs = MultiError::new();
        let mut failed: Vec<Instance> = Vec::new();
        let mut alive: Vec<Instance> = (0..delta)
            .map(|_| Instance::new(self.names.generate(group.name_prefix())))
            .collect();

        for handler in &self.pipeline {
            let Some(stage) = handler.as_create() else {
                continue;
            };
            debug!(group = %group.name, handler = handler.name(), count = alive.len(), "running create stage");

            let results: Vec<_> = stream::iter(alive.iter_mut().map(|i| stage.create(ctx, group, i)))
                .buffered(par)
                .collect()
                .await;
            alive = partition(alive, results, Some(&mut failed), &mut errs);

            let results: Vec<_> = stream::iter(alive.iter_mut().map(|i| i.wait()))
                .buffered(par)
                .collect()
                .await;
            alive = partition(alive, results, Some(&mut failed), &mut errs);
        }

        if !failed.is_empty() {
            warn!(group = %group.name, failed = failed.len(), "rolling back failed instances");
            // The caller's context may be what failed them; rollback gets its own budget.
            let cleanup_ctx = ctx.detached(self.config.cleanup_grace);
            errs.extend(self.rollback(&cleanup_ctx, group, &mut failed).await);
        }

        let created: Vec<String> = alive.iter().map(|i| i.iid().to_string()).collect();
        info!(group = %group.name, requested = delta, created = created.len(), "increase finished");
        (created, errs.into_result())
    }

    /// Runs every cleanup stage, last stage first, on each instance. Errors
    /// are collected and never stop the rollback.
    async fn rollback(&self, ctx: &CallContext, group: &Group, instances: &mut [Instance]) -> MultiError {
        let par = self.parallelism();
        let mut errs = MultiError::new();
        for handler in self.pipeline.iter().rev() {
            let Some(stage) = handler.as_cleanup() else {
                continue;
            };
            let results: Vec<_> = stream::iter(instances.iter_mut().map(|i| stage.cleanup(ctx, group, i)))
                .buffered(par)
                .collect()
                .await;
            for e in results.into_iter().filter_map(Result::err) {
                error!(group = %group.name, handler = handler.name(), error = %e, "rollback failed");
                errs.push(e);
            }

            let results: Vec<_> = stream::iter(instances.iter_mut().map(|i| i.wait()))
                .buffered(par)
                .collect()
                .await;
            for e in results.into_iter().filter_map(Result::err) {
                error!(group = %group.name, handler = handler.name(), error = %e, "rollback wait failed");
                errs.push(e);
            }
        }
        errs
    }

    /// Tears down the given instances. Returns the identifiers of those fully
    /// removed; a server that is already gone counts as removed.
    pub async fn decrease(&self, ctx: &CallContext, iids: &[String]) -> BatchResult {
        let group = match self.group() {
            Ok(g) => g,
            Err(e) => return (Vec::new(), Err(e.into())),
        };
        if iids.is_empty() {
            return (Vec::new(), Ok(()));
        }

        for handler in &self.pipeline {
            let Some(stage) = handler.as_pre_decrease() else {
                continue;
            };
            if let Err(e) = stage.pre_decrease(ctx, group).await {
                return (Vec::new(), Err(e.into()));
            }
        }

        let par = self.parallelism();
        let mut errs = MultiError::new();
        let mut alive = Vec::with_capacity(iids.len());
        for iid in iids {
            match Instance::from_iid(iid) {
                Ok(instance) => alive.push(instance),
                Err(e) => errs.push(e),
            }
        }

        for handler in self.pipeline.iter().rev() {
            let Some(stage) = handler.as_cleanup() else {
                continue;
            };
            let results: Vec<_> = stream::iter(alive.iter_mut().map(|i| stage.cleanup(ctx, group, i)))
                .buffered(par)
                .collect()
                .await;
            alive = partition(alive, results, None, &mut errs);

            let results: Vec<_> = stream::iter(alive.iter_mut().map(|i| i.wait()))
                .buffered(par)
                .collect()
                .await;
            alive = partition(alive, results, None, &mut errs);
        }

        let deleted: Vec<String> = alive.iter().map(|i| i.iid().to_string()).collect();
        info!(group = %group.name, requested = iids.len(), deleted = deleted.len(), "decrease finished");
        (deleted, errs.into_result())
    }

    /// Servers carrying every group tag.
    pub async fn list(&self, ctx: &CallContext) -> Result<Vec<Instance>, GroupError> {
        let group = self.group()?;
        let servers = group
            .api()
            .list_servers(ctx, &group.zone, &group.tags)
            .await
            .map_err(|e| GroupError::provider("list instances", e))?;
        Ok(servers.into_iter().map(Instance::from_server).collect())
    }

    pub async fn get(&self, ctx: &CallContext, iid: &str) -> Result<Instance, GroupError> {
        let group = self.group()?;
        let instance = Instance::from_iid(iid)?;
        let server = group
            .api()
            .get_server(ctx, &group.zone, &instance.id)
            .await
            .map_err(|e| GroupError::provider(format!("get instance {}", iid), e))?;
        Ok(Instance::from_server(server))
    }

    /// Runs every sanity stage. Findings are logged, never returned.
    pub async fn sanity(&self, ctx: &CallContext) -> Result<(), GroupError> {
        let group = self.group()?;
        for handler in &self.pipeline {
            let Some(stage) = handler.as_sanity() else {
                continue;
            };
            if let Err(errs) = stage.sanity(ctx, group).await {
                for e in errs.iter() {
                    error!(group = %group.name, handler = handler.name(), error = %e, "sanity check failed");
                }
            }
        }
        Ok(())
    }
}
