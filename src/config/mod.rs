use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::pool::ConnectionSettings;
use crate::target::ConnectionTarget;

/// Infobase connection profile
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetProfile {
    /// Infobase path
    pub address: String,

    /// User name
    pub principal: String,

    /// Optional password
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,

    /// Overrides the broker-wide initialization timeout (seconds)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initialize_timeout_secs: Option<u64>,
}

impl TargetProfile {
    /// Validate this profile into a connection target
    pub fn to_target(&self) -> crate::Result<ConnectionTarget> {
        let target = ConnectionTarget::new(&self.address, &self.principal, self.credential.clone())?;
        Ok(match self.initialize_timeout_secs {
            Some(secs) => target.with_initialize_timeout(Duration::from_secs(secs)),
            None => target,
        })
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Registered identifier of the automation server
    #[serde(default = "default_component_id")]
    pub component_id: String,

    /// Initialization timeout in seconds
    #[serde(default = "default_initialize_timeout_secs")]
    pub initialize_timeout_secs: u64,

    /// Idle grace period before teardown, in milliseconds
    #[serde(default = "default_dispose_grace_millis")]
    pub dispose_grace_millis: u64,

    /// Failures tolerated per connection
    #[serde(default = "default_max_errors")]
    pub max_errors: u32,

    /// Named infobase targets
    #[serde(default)]
    pub targets: HashMap<String, TargetProfile>,

    /// Target used when none is named
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_target: Option<String>,
}

fn default_component_id() -> String {
    "V77.Application".to_string()
}

fn default_initialize_timeout_secs() -> u64 {
    30
}

fn default_dispose_grace_millis() -> u64 {
    5000
}

fn default_max_errors() -> u32 {
    3
}

impl BrokerConfig {
    /// Create a configuration with no targets
    pub fn new() -> Self {
        Self {
            component_id: default_component_id(),
            initialize_timeout_secs: default_initialize_timeout_secs(),
            dispose_grace_millis: default_dispose_grace_millis(),
            max_errors: default_max_errors(),
            targets: HashMap::new(),
            default_target: None,
        }
    }

    /// Runtime settings for connections
    pub fn settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            component_id: self.component_id.clone(),
            initialize_timeout: Duration::from_secs(self.initialize_timeout_secs),
            dispose_grace: Duration::from_millis(self.dispose_grace_millis),
            max_errors: self.max_errors,
        }
    }

    /// Get a profile by name, or the default profile if not specified
    pub fn get_profile(&self, name: Option<&str>) -> Option<&TargetProfile> {
        if let Some(name) = name {
            self.targets.get(name)
        } else if let Some(default) = &self.default_target {
            self.targets.get(default)
        } else {
            self.targets.values().next()
        }
    }

    /// Resolve a named (or the default) profile into a validated target
    pub fn target(&self, name: Option<&str>) -> Result<ConnectionTarget> {
        let profile = match self.get_profile(name) {
            Some(profile) => profile,
            None => match name {
                Some(name) => anyhow::bail!("Target '{}' not found in configuration", name),
                None => anyhow::bail!("No targets configured"),
            },
        };

        profile
            .to_target()
            .context(format!("Invalid target profile for '{}'", profile.address))
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<BrokerConfig> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: BrokerConfig = serde_yaml::from_str(&content)
        .context("Failed to parse YAML configuration")?;

    Ok(config)
}

/// Load configuration from environment variables
///
/// - V77_INFOBASE_PATH: infobase path
/// - V77_USERNAME: user name
/// - V77_PASSWORD (optional)
/// - V77_INITIALIZE_TIMEOUT (optional, seconds)
/// - V77_DISPOSE_GRACE_MILLIS (optional)
/// - V77_MAX_ERRORS (optional)
/// - V77_COMPONENT_ID (optional)
pub fn load_from_env() -> Result<BrokerConfig> {
    // Pick up a .env file if there is one
    let _ = dotenvy::dotenv();

    let mut config = BrokerConfig::new();

    let address = std::env::var("V77_INFOBASE_PATH")
        .context("V77_INFOBASE_PATH environment variable not set")?;
    if address.trim().is_empty() {
        anyhow::bail!("V77_INFOBASE_PATH is empty");
    }

    let principal = std::env::var("V77_USERNAME")
        .context("V77_USERNAME environment variable not set")?;

    let credential = std::env::var("V77_PASSWORD").ok();

    let profile = TargetProfile {
        address,
        principal,
        credential,
        initialize_timeout_secs: None,
    };

    config.targets.insert("default".to_string(), profile);
    config.default_target = Some("default".to_string());

    if let Ok(component_id) = std::env::var("V77_COMPONENT_ID") {
        config.component_id = component_id;
    }

    if let Ok(timeout) = std::env::var("V77_INITIALIZE_TIMEOUT") {
        config.initialize_timeout_secs = timeout
            .parse()
            .context(format!("Invalid V77_INITIALIZE_TIMEOUT: {}", timeout))?;
    }

    if let Ok(grace) = std::env::var("V77_DISPOSE_GRACE_MILLIS") {
        config.dispose_grace_millis = grace
            .parse()
            .context(format!("Invalid V77_DISPOSE_GRACE_MILLIS: {}", grace))?;
    }

    if let Ok(max_errors) = std::env::var("V77_MAX_ERRORS") {
        config.max_errors = max_errors
            .parse()
            .context(format!("Invalid V77_MAX_ERRORS: {}", max_errors))?;
    }

    Ok(config)
}

/// Load configuration from file or environment
///
/// # Arguments
/// * `config_path` - Optional path to YAML config file
/// * `target_name` - Optional target to make the default (YAML only)
pub fn load_config(config_path: Option<&str>, target_name: Option<&str>) -> Result<BrokerConfig> {
    if let Some(path) = config_path {
        let mut config = load_from_yaml(path)?;

        if let Some(name) = target_name {
            if !config.targets.contains_key(name) {
                anyhow::bail!("Target '{}' not found in config file", name);
            }
            config.default_target = Some(name.to_string());
        }

        Ok(config)
    } else {
        load_from_env()
    }
}
