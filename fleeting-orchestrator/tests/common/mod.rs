// Common test utilities and fixtures
#![allow(dead_code)]

use fleeting_orchestrator::{GroupConfig, InstanceGroup, PluginConfig, SequentialNameGenerator};
use fleeting_providers::mock::MockProvider;
use fleeting_providers::CallContext;
use std::sync::Arc;

pub const ZONE: &str = "fr-par-1";
pub const IMAGE: &str = "ubuntu";

/// Mock zone with two server types and one image.
pub fn mock_provider() -> Arc<MockProvider> {
    Arc::new(
        MockProvider::new(ZONE)
            .with_server_types(["PRO2-XS", "PRO2-S"])
            .with_images([IMAGE]),
    )
}

pub fn group_config(types: &[&str]) -> GroupConfig {
    GroupConfig {
        zone: ZONE.into(),
        server_types: types.iter().map(|t| t.to_string()).collect(),
        image: IMAGE.into(),
        user_data: "#cloud-config\n".into(),
        server_name_prefix: "runner".into(),
        ..Default::default()
    }
}

/// Initialized group named "ci" whose instances are runner-a, runner-b, ...
pub async fn ready_group(mock: &Arc<MockProvider>, types: &[&str]) -> InstanceGroup {
    let mut group = InstanceGroup::new(mock.clone(), "ci", group_config(types))
        .with_name_generator(Arc::new(SequentialNameGenerator::new()));
    group
        .init(&CallContext::background())
        .await
        .expect("Failed to initialize instance group");
    group
}

/// Plugin config accepted by validation without any environment.
pub fn plugin_config() -> PluginConfig {
    PluginConfig {
        name: "ci".into(),
        access_key: "SCWXXXXXXXXXXXXXXXXX".into(),
        secret_key: "11111111-1111-1111-1111-111111111111".into(),
        organization: "org".into(),
        project: "proj".into(),
        zone: ZONE.into(),
        server_types: vec!["PRO2-XS".into(), "PRO2-S".into()],
        image: IMAGE.into(),
        server_name_prefix: "runner".into(),
        tags: vec!["team=ci".into()],
        ..Default::default()
    }
}
