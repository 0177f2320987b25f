//! Configuration snapshot: the validated input the Registry is built from.
//!
//! This is deliberately the thin, concrete loader carved out for this crate
//! (macro expansion, environment templating, and file-watch-driven reload are
//! the excluded config collaborator's job); it only parses YAML into the
//! shapes the core needs and enforces the invariants the core depends on.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;

fn default_health_check_timeout() -> u64 {
    15
}

fn default_graceful_stop_timeout() -> u64 {
    10
}

fn default_body_cap_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_multipart_memory_cap_bytes() -> usize {
    32 * 1024 * 1024
}

/// Minimum `healthCheckTimeout`, per §6: low values are rewritten up, not
/// rejected, to preserve behavior for older configuration files.
pub const MIN_HEALTH_CHECK_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSnapshot {
    #[serde(default = "default_health_check_timeout")]
    pub health_check_timeout_secs: u64,
    #[serde(default = "default_graceful_stop_timeout")]
    pub graceful_stop_timeout_secs: u64,
    pub start_port: u16,
    pub port_range: u16,
    #[serde(default = "default_body_cap_bytes")]
    pub body_cap_bytes: usize,
    #[serde(default = "default_multipart_memory_cap_bytes")]
    pub multipart_memory_cap_bytes: usize,
    pub models: HashMap<String, ModelConfig>,
    pub groups: HashMap<String, GroupConfig>,
    #[serde(default)]
    pub required_api_keys: Vec<String>,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    #[serde(default)]
    pub sensitive_headers: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    pub cmd: Vec<String>,
    #[serde(default)]
    pub cmd_stop: Option<Vec<String>>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    pub proxy: String,
    pub health_check_url: String,
    #[serde(default, rename = "ttl")]
    pub ttl_secs: u64,
    #[serde(default)]
    pub use_model_name: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub concurrency_limit: Option<u32>,
    #[serde(default)]
    pub unlisted: bool,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupConfig {
    pub members: Vec<String>,
    #[serde(default)]
    pub swap: bool,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub persistent: bool,
    #[serde(default)]
    pub resource_tag: Option<String>,
}

impl ConfigSnapshot {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut snapshot: ConfigSnapshot = serde_yaml::from_str(&text)?;
        snapshot.normalize_and_validate()?;
        Ok(snapshot)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let mut snapshot: ConfigSnapshot = serde_yaml::from_str(text)?;
        snapshot.normalize_and_validate()?;
        Ok(snapshot)
    }

    /// Rewrites out-of-range fields in place (the `healthCheckTimeout` floor)
    /// and rejects structurally invalid configuration.
    fn normalize_and_validate(&mut self) -> Result<(), ConfigError> {
        if self.health_check_timeout_secs < MIN_HEALTH_CHECK_TIMEOUT_SECS {
            self.health_check_timeout_secs = MIN_HEALTH_CHECK_TIMEOUT_SECS;
        }
        if self.start_port < 1 {
            return Err(ConfigError::Invalid("startPort must be >= 1".into()));
        }

        let mut model_owner: HashMap<String, String> = HashMap::new();
        let mut seen_names: HashSet<String> = HashSet::new();
        for (model_id, model) in &self.models {
            if !seen_names.insert(model_id.clone()) {
                return Err(ConfigError::Invalid(format!("duplicate model id '{model_id}'")));
            }
            for alias in &model.aliases {
                if !seen_names.insert(alias.clone()) {
                    return Err(ConfigError::Invalid(format!(
                        "alias '{alias}' collides with another model id or alias"
                    )));
                }
            }
        }

        for (group_id, group) in &self.groups {
            for member in &group.members {
                if !self.models.contains_key(member) {
                    return Err(ConfigError::Invalid(format!(
                        "group '{group_id}' references undeclared model '{member}'"
                    )));
                }
                if let Some(existing) = model_owner.insert(member.clone(), group_id.clone()) {
                    if existing != *group_id {
                        return Err(ConfigError::Invalid(format!(
                            "model '{member}' belongs to both '{existing}' and '{group_id}'"
                        )));
                    }
                }
            }
        }

        for model_id in self.models.keys() {
            if !model_owner.contains_key(model_id) {
                return Err(ConfigError::Invalid(format!(
                    "model '{model_id}' is not a member of any group"
                )));
            }
        }

        Ok(())
    }
}
