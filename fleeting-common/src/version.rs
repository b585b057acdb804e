use serde::{Deserialize, Serialize};

pub const PLUGIN_NAME: &str = "fleeting-plugin-scaleway";

/// Build identification reported to the autoscaler host.
///
/// Revision and reference are injected at build time through the
/// `FLEETING_REVISION` / `FLEETING_REFERENCE` / `FLEETING_BUILT` environment
/// variables and fall back to `HEAD` / `now` for local builds.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    pub name: String,
    pub version: String,
    pub revision: String,
    pub reference: String,
    pub built_at: String,
}

impl VersionInfo {
    pub fn current() -> Self {
        Self {
            name: PLUGIN_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            revision: option_env!("FLEETING_REVISION").unwrap_or("HEAD").to_string(),
            reference: option_env!("FLEETING_REFERENCE").unwrap_or("HEAD").to_string(),
            built_at: option_env!("FLEETING_BUILT").unwrap_or("now").to_string(),
        }
    }

    pub fn build_info(&self) -> String {
        format!(
            "sha={}; ref={}; built_at={}",
            self.revision, self.reference, self.built_at
        )
    }
}

impl std::fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.version, self.revision)
    }
}
