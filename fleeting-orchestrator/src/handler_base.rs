use async_trait::async_trait;
use fleeting_providers::resources::SBS_VOLUME_TYPE;
use fleeting_providers::{CallContext, CreateServerRequest, VolumeTemplate};

use crate::errors::GroupError;
use crate::group::Group;
use crate::handler::{CreateHandler, Handler};
use crate::instance::Instance;

/// Seeds the server creation request from the group configuration.
#[derive(Debug, Default, Clone, Copy)]
pub struct BaseHandler;

impl Handler for BaseHandler {
    fn name(&self) -> &'static str {
        "base"
    }

    fn as_create(&self) -> Option<&dyn CreateHandler> {
        Some(self)
    }
}

#[async_trait]
impl CreateHandler for BaseHandler {
    async fn create(
        &self,
        _ctx: &CallContext,
        group: &Group,
        instance: &mut Instance,
    ) -> Result<(), GroupError> {
        instance.opts = Some(CreateServerRequest {
            name: instance.name.clone(),
            image: group.image.clone(),
            dynamic_ip_required: false,
            root_volume: Some(VolumeTemplate {
                size_bytes: group.volume_size_bytes(),
                volume_type: SBS_VOLUME_TYPE.to_string(),
            }),
            ..Default::default()
        });
        Ok(())
    }
}
