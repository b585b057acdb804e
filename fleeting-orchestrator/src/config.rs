use fleeting_common::version::PLUGIN_NAME;
use fleeting_common::{ConnectorSettings, Protocol};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::group::GroupConfig;

/// Tag marking every resource this plugin created.
pub const MANAGED_BY_TAG_KEY: &str = "managed-by";

/// Plugin configuration as provided by the autoscaler host (JSON).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    pub name: String,

    pub access_key: String,
    pub secret_key: String,
    pub organization: String,
    pub project: String,
    /// API base URL override.
    pub endpoint: String,

    pub zone: String,
    /// Single server type. Ignored when `server_types` is set.
    pub server_type: String,
    /// Candidate server types in preference order.
    pub server_types: Vec<String>,
    pub image: String,
    /// Root volume size in GB.
    pub volume_size: u64,
    pub volume_iops: Option<u32>,
    pub public_ipv4_disabled: bool,
    pub public_ipv6_disabled: bool,
    pub user_data: String,
    pub user_data_file: String,
    pub tags: Vec<String>,
    pub server_name_prefix: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Every validation problem found, one per line.
    #[error("{}", .0.join("\n"))]
    Invalid(Vec<String>),

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Reads `key`, preferring the file named by `<key>_FILE` (secret mounts).
fn lookup_env_with_file<F>(lookup: &F, key: &str) -> Result<Option<String>, String>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = lookup(&format!("{}_FILE", key)).filter(|p| !p.trim().is_empty()) {
        return fs::read_to_string(path.trim())
            .map(|s| Some(s.trim().to_string()))
            .map_err(|e| format!("failed to read {}_FILE ({}): {}", key, path.trim(), e));
    }
    Ok(lookup(key)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty()))
}

impl PluginConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Applies defaults and environment overrides, then checks the result.
    pub fn validate(&mut self, settings: &mut ConnectorSettings) -> Result<(), ConfigError> {
        self.validate_with(settings, |key| std::env::var(key).ok())
    }

    /// [`PluginConfig::validate`] with an injectable environment.
    pub fn validate_with<F>(&mut self, settings: &mut ConnectorSettings, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut errs = Vec::new();

        // Defaults
        if settings.protocol.is_none() {
            settings.protocol = Some(Protocol::Ssh);
        }
        if settings.username.is_empty() {
            settings.username = "root".to_string();
        }

        // Environment
        let overrides: [(&str, &mut String); 6] = [
            ("SCW_ACCESS_KEY", &mut self.access_key),
            ("SCW_SECRET_KEY", &mut self.secret_key),
            ("SCW_ORGANIZATION_ID", &mut self.organization),
            ("SCW_PROJECT_ID", &mut self.project),
            ("SCW_DEFAULT_ZONE", &mut self.zone),
            ("SCW_API_URL", &mut self.endpoint),
        ];
        for (key, field) in overrides {
            match lookup_env_with_file(&lookup, key) {
                Ok(Some(value)) => *field = value,
                Ok(None) => {}
                Err(e) => errs.push(e),
            }
        }

        // Checks
        let required = [
            ("name", &self.name),
            ("access_key", &self.access_key),
            ("secret_key", &self.secret_key),
            ("organization", &self.organization),
            ("project", &self.project),
            ("zone", &self.zone),
            ("image", &self.image),
        ];
        for (field, value) in required {
            if value.is_empty() {
                errs.push(format!("missing required plugin config: {}", field));
            }
        }
        if self.server_type_candidates().is_empty() {
            errs.push("missing required plugin config: server_type or server_types".to_string());
        }
        if self.volume_size != 0 && self.volume_size < 10 {
            errs.push("invalid plugin config value: volume_size must be >= 10".to_string());
        }
        if !self.user_data.is_empty() && !self.user_data_file.is_empty() {
            errs.push("mutually exclusive plugin config provided: user_data, user_data_file".to_string());
        }
        if settings.protocol == Some(Protocol::Winrm) {
            errs.push(format!(
                "unsupported connector config protocol: {}",
                Protocol::Winrm.as_str()
            ));
        }

        if errs.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errs))
        }
    }

    /// Loads file-backed values.
    pub fn populate(&mut self) -> Result<(), ConfigError> {
        if !self.user_data_file.is_empty() {
            let path = PathBuf::from(&self.user_data_file);
            self.user_data = fs::read_to_string(&path).map_err(|source| ConfigError::Read { path, source })?;
        }
        Ok(())
    }

    pub fn server_type_candidates(&self) -> Vec<String> {
        if !self.server_types.is_empty() {
            return self.server_types.clone();
        }
        if self.server_type.is_empty() {
            Vec::new()
        } else {
            vec![self.server_type.clone()]
        }
    }

    /// Group settings. Tags are the configured ones plus `managed-by=<plugin>`.
    pub fn group_config(&self) -> GroupConfig {
        let managed_by = format!("{}={}", MANAGED_BY_TAG_KEY, PLUGIN_NAME);
        let mut tags = self.tags.clone();
        if !tags.contains(&managed_by) {
            tags.push(managed_by);
        }
        GroupConfig {
            zone: self.zone.clone(),
            server_types: self.server_type_candidates(),
            image: self.image.clone(),
            tags,
            user_data: self.user_data.clone(),
            volume_size_gb: self.volume_size,
            volume_iops: self.volume_iops,
            public_ipv4_disabled: self.public_ipv4_disabled,
            public_ipv6_disabled: self.public_ipv6_disabled,
            server_name_prefix: self.server_name_prefix.clone(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn valid() -> PluginConfig {
        PluginConfig {
            name: "fleeting".into(),
            access_key: "SCWXXXXXXXXXXXXXXXXX".into(),
            secret_key: "11111111-1111-1111-1111-111111111111".into(),
            organization: "org".into(),
            project: "proj".into(),
            zone: "fr-par-1".into(),
            server_type: "PRO2-XS".into(),
            image: "ubuntu_noble".into(),
            ..Default::default()
        }
    }

    fn temp_file(contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("fleeting-config-{}", uuid::Uuid::new_v4()));
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn valid_config_gets_connector_defaults() {
        let mut config = valid();
        let mut settings = ConnectorSettings::default();
        config.validate_with(&mut settings, no_env).unwrap();
        assert_eq!(settings.protocol, Some(Protocol::Ssh));
        assert_eq!(settings.username, "root");
    }

    #[test]
    fn every_problem_is_reported() {
        let mut config = PluginConfig {
            volume_size: 5,
            user_data: "#cloud-config".into(),
            user_data_file: "/tmp/user-data".into(),
            ..Default::default()
        };
        let mut settings = ConnectorSettings {
            protocol: Some(Protocol::Winrm),
            ..Default::default()
        };
        let err = config.validate_with(&mut settings, no_env).unwrap_err();
        let ConfigError::Invalid(errs) = err else {
            panic!("unexpected error kind");
        };
        for expected in [
            "missing required plugin config: name",
            "missing required plugin config: access_key",
            "missing required plugin config: secret_key",
            "missing required plugin config: organization",
            "missing required plugin config: project",
            "missing required plugin config: zone",
            "missing required plugin config: image",
            "missing required plugin config: server_type or server_types",
            "invalid plugin config value: volume_size must be >= 10",
            "mutually exclusive plugin config provided: user_data, user_data_file",
            "unsupported connector config protocol: winrm",
        ] {
            assert!(errs.iter().any(|e| e == expected), "missing {:?} in {:?}", expected, errs);
        }
    }

    #[test]
    fn environment_overrides_config() {
        let secret = temp_file("from-file-secret\n");
        let env: HashMap<String, String> = [
            ("SCW_ACCESS_KEY", "SCWENVENVENVENVENVENV".to_string()),
            ("SCW_SECRET_KEY", "from-env-secret".to_string()),
            ("SCW_SECRET_KEY_FILE", secret.display().to_string()),
            ("SCW_DEFAULT_ZONE", "nl-ams-1".to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        let mut config = valid();
        let mut settings = ConnectorSettings::default();
        config
            .validate_with(&mut settings, |k| env.get(k).cloned())
            .unwrap();
        assert_eq!(config.access_key, "SCWENVENVENVENVENVENV");
        assert_eq!(config.secret_key, "from-file-secret");
        assert_eq!(config.zone, "nl-ams-1");
        assert_eq!(config.project, "proj");
        fs::remove_file(secret).ok();
    }

    #[test]
    fn unreadable_secret_file_is_an_error() {
        let mut config = valid();
        let mut settings = ConnectorSettings::default();
        let err = config
            .validate_with(&mut settings, |k| {
                (k == "SCW_SECRET_KEY_FILE").then(|| "/nonexistent/fleeting-secret".to_string())
            })
            .unwrap_err();
        assert!(err.to_string().contains("SCW_SECRET_KEY_FILE"));
    }

    #[test]
    fn populate_reads_user_data_file() {
        let path = temp_file("#cloud-config\npackages: [git]\n");
        let mut config = PluginConfig {
            user_data_file: path.display().to_string(),
            ..valid()
        };
        config.populate().unwrap();
        assert!(config.user_data.starts_with("#cloud-config"));
        fs::remove_file(path).ok();
    }

    #[test]
    fn load_parses_json_and_maps_group_config() {
        let path = temp_file(
            r#"{
                "name": "ci",
                "zone": "fr-par-2",
                "server_types": ["PRO2-XS", "PRO2-S"],
                "image": "ubuntu_noble",
                "volume_size": 40,
                "volume_iops": 15000,
                "public_ipv6_disabled": true,
                "tags": ["team=ci"]
            }"#,
        );
        let config = PluginConfig::load(&path).unwrap();
        let group = config.group_config();
        assert_eq!(group.server_types, vec!["PRO2-XS", "PRO2-S"]);
        assert_eq!(group.volume_size_gb, 40);
        assert_eq!(group.volume_iops, Some(15000));
        assert!(group.public_ipv6_disabled);
        assert_eq!(group.tags, vec!["team=ci", "managed-by=fleeting-plugin-scaleway"]);
        fs::remove_file(path).ok();

        assert!(matches!(
            PluginConfig::load("/nonexistent/config.json"),
            Err(ConfigError::Read { .. })
        ));
    }
}
