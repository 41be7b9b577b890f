use std::collections::HashSet;

use oncall_contracts::TeamMentionConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
    #[error("invalid teams: {0}")]
    InvalidTeams(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: Server,
    pub opsgenie: Opsgenie,
    #[serde(default)]
    pub identity: Identity,
    pub cache: Cache,
    pub store: Store,
    #[serde(default)]
    pub teams: Vec<TeamMentionConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opsgenie {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: usize,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Opsgenie {
    /// Inline `api_key` wins over `api_key_env`.
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| {
                self.api_key_env
                    .as_deref()
                    .and_then(|name| std::env::var(name).ok())
            })
            .filter(|v| !v.trim().is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    #[serde(default = "default_identity_mode")]
    pub mode: String,
    #[serde(default = "default_identity_attribute")]
    pub attribute: String,
}

impl Default for Identity {
    fn default() -> Self {
        Self {
            mode: default_identity_mode(),
            attribute: default_identity_attribute(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cache {
    pub ttl_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    #[serde(rename = "type")]
    pub kind: String,
    pub sqlite_path: Option<String>,
    #[serde(default)]
    pub retention_secs: i64,
}

fn default_api_url() -> String {
    "https://api.opsgenie.com".to_string()
}

fn default_timeout_ms() -> u64 {
    5_000
}

fn default_retry_max_attempts() -> usize {
    1
}

fn default_retry_backoff_ms() -> u64 {
    0
}

fn default_identity_mode() -> String {
    "opsgenie".to_string()
}

fn default_identity_attribute() -> String {
    "mattermost_username".to_string()
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema_path = [
        std::path::PathBuf::from("config/config.schema.json"),
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("config/config.schema.json"),
    ]
    .into_iter()
    .find(|p| p.exists())
    .ok_or_else(|| {
        ConfigError::SchemaLoad(
            "config schema not found at config/config.schema.json or workspace config path"
                .to_string(),
        )
    })?;

    let schema_text =
        std::fs::read_to_string(schema_path).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    let schema: serde_json::Value =
        serde_json::from_str(&schema_text).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

/// Upper bound for `store.retention_secs` (one hundred years).
pub const MAX_RETENTION_SECS: i64 = 3_153_600_000;

fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.store.kind != "memory" && cfg.store.kind != "sqlite" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "store.type={} is not implemented; supported: memory, sqlite",
            cfg.store.kind
        )));
    }
    if cfg.store.kind == "memory" && cfg.store.sqlite_path.is_some() {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is not supported when store.type=memory".to_string(),
        ));
    }
    if cfg.store.kind == "sqlite"
        && cfg
            .store
            .sqlite_path
            .as_ref()
            .map(|v| v.trim().is_empty())
            .unwrap_or(true)
    {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is required when store.type=sqlite".to_string(),
        ));
    }
    if !(0..=MAX_RETENTION_SECS).contains(&cfg.store.retention_secs) {
        return Err(ConfigError::UnsupportedConfig(format!(
            "store.retention_secs must be between 0 and {MAX_RETENTION_SECS}"
        )));
    }
    if cfg.identity.mode != "opsgenie" && cfg.identity.mode != "passthrough" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "identity.mode={} is not implemented; supported: opsgenie, passthrough",
            cfg.identity.mode
        )));
    }
    if cfg.identity.mode == "opsgenie" && cfg.identity.attribute.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "identity.attribute is required when identity.mode=opsgenie".to_string(),
        ));
    }
    if cfg.opsgenie.resolved_api_key().is_none() {
        return Err(ConfigError::UnsupportedConfig(
            "opsgenie.api_key or a set opsgenie.api_key_env is required".to_string(),
        ));
    }
    if cfg.opsgenie.timeout_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "opsgenie.timeout_ms must be >= 1".to_string(),
        ));
    }
    if cfg.opsgenie.retry_max_attempts == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "opsgenie.retry_max_attempts must be >= 1".to_string(),
        ));
    }
    if cfg.cache.ttl_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "cache.ttl_ms must be >= 1".to_string(),
        ));
    }
    validate_teams(&cfg.teams)
}

/// Checks a team set before it is installed, at load time or on replacement.
pub fn validate_teams(teams: &[TeamMentionConfig]) -> Result<(), ConfigError> {
    let mut mentions = HashSet::new();
    for team in teams {
        let token = team.mention_token.as_str();
        if token.is_empty() {
            return Err(ConfigError::InvalidTeams("mention must not be empty".to_string()));
        }
        if token.starts_with('@') || token.chars().any(char::is_whitespace) {
            return Err(ConfigError::InvalidTeams(format!(
                "mention {token:?} must not contain '@' prefix or whitespace"
            )));
        }
        if !mentions.insert(token) {
            return Err(ConfigError::InvalidTeams(format!(
                "mention {token:?} is configured more than once"
            )));
        }
        if team.schedule_names.iter().any(|s| s.trim().is_empty()) {
            return Err(ConfigError::InvalidTeams(format!(
                "mention {token:?} has an empty schedule name"
            )));
        }
        if team.escalation_identity.trim().is_empty() {
            return Err(ConfigError::InvalidTeams(format!(
                "mention {token:?} needs an escalation_manager"
            )));
        }
    }
    Ok(())
}
