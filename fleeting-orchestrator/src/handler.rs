use async_trait::async_trait;
use fleeting_providers::CallContext;

use crate::errors::{GroupError, MultiError};
use crate::group::Group;
use crate::instance::Instance;

/// One stage of the provisioning pipeline.
///
/// A stage advertises what it can do through the `as_*` accessors; the
/// orchestrator skips stages that return `None` for the phase it is running.
pub trait Handler: Send + Sync {
    fn name(&self) -> &'static str;

    fn as_create(&self) -> Option<&dyn CreateHandler> {
        None
    }

    fn as_cleanup(&self) -> Option<&dyn CleanupHandler> {
        None
    }

    fn as_pre_increase(&self) -> Option<&dyn PreIncreaseHandler> {
        None
    }

    fn as_pre_decrease(&self) -> Option<&dyn PreDecreaseHandler> {
        None
    }

    fn as_sanity(&self) -> Option<&dyn SanityHandler> {
        None
    }
}

/// Starts this stage's work for one instance. Long waits belong in a
/// [`crate::PendingOperation`] registered on the instance, not inline.
#[async_trait]
pub trait CreateHandler: Send + Sync {
    async fn create(
        &self,
        ctx: &CallContext,
        group: &Group,
        instance: &mut Instance,
    ) -> Result<(), GroupError>;
}

/// Tears down whatever this stage may have created. Must tolerate partially
/// created instances and resources that are already gone.
#[async_trait]
pub trait CleanupHandler: Send + Sync {
    async fn cleanup(
        &self,
        ctx: &CallContext,
        group: &Group,
        instance: &mut Instance,
    ) -> Result<(), GroupError>;
}

/// Runs once before any instance of an increase is touched.
#[async_trait]
pub trait PreIncreaseHandler: Send + Sync {
    async fn pre_increase(&self, ctx: &CallContext, group: &Group) -> Result<(), GroupError>;
}

#[async_trait]
pub trait PreDecreaseHandler: Send + Sync {
    async fn pre_decrease(&self, ctx: &CallContext, group: &Group) -> Result<(), GroupError>;
}

/// Consistency check over the whole group. Findings are logged, never returned
/// to the host.
#[async_trait]
pub trait SanityHandler: Send + Sync {
    async fn sanity(&self, ctx: &CallContext, group: &Group) -> Result<(), MultiError>;
}
