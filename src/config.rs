//! Configuration management for Tierguard.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Result, TierguardError};
use crate::escalation::{ActionPolicy, Rulebook, RulebookConfig, TierConfig};

/// Prefix for environment overrides, e.g. `TIERGUARD__ENGINE__MAX_CAS_ATTEMPTS=32`.
pub const ENV_PREFIX: &str = "TIERGUARD";

/// Main configuration for Tierguard.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TierguardConfig {
    /// Where the rulebook comes from
    #[serde(default)]
    pub rulebook: RulebookSection,

    /// Engine tuning
    #[serde(default)]
    pub engine: EngineConfig,

    /// Named action policies (names are case-insensitive)
    #[serde(default)]
    pub policies: HashMap<String, ActionPolicy>,
}

/// Rulebook source: a separate YAML file, or tiers written inline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulebookSection {
    /// Path to a rulebook YAML file; takes precedence over inline tiers
    #[serde(default)]
    pub path: Option<String>,

    #[serde(default)]
    pub event_types: HashMap<String, u32>,

    #[serde(default)]
    pub tiers: Vec<TierConfig>,
}

impl RulebookSection {
    /// Load and compile the rulebook this section points at.
    pub fn load(&self) -> Result<Rulebook> {
        match &self.path {
            Some(path) => Rulebook::from_file(path),
            None => Rulebook::from_config(RulebookConfig {
                event_types: self.event_types.clone(),
                tiers: self.tiers.clone(),
            }),
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Compare-and-swap attempts per event before giving up
    #[serde(default = "default_max_cas_attempts")]
    pub max_cas_attempts: u32,

    /// Retry-after reported when the gateway cannot read its store
    #[serde(default = "default_fail_closed_retry")]
    pub fail_closed_retry_secs: u64,

    /// IPv6 addresses are tracked per network of this prefix length
    #[serde(default = "default_ipv6_prefix_len")]
    pub ipv6_prefix_len: u8,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_cas_attempts: default_max_cas_attempts(),
            fail_closed_retry_secs: default_fail_closed_retry(),
            ipv6_prefix_len: default_ipv6_prefix_len(),
        }
    }
}

fn default_max_cas_attempts() -> u32 {
    16
}

fn default_fail_closed_retry() -> u64 {
    60
}

fn default_ipv6_prefix_len() -> u8 {
    64
}

impl TierguardConfig {
    /// Load configuration from a YAML file, with environment overrides.
    pub fn from_file(path: &str) -> Result<Self> {
        config::Config::builder()
            .add_source(config::File::new(path, config::FileFormat::Yaml))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| TierguardError::Config(e.to_string()))
            .and_then(Self::validated)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| TierguardError::Config(e.to_string()))
            .and_then(Self::validated)
    }

    /// Look up a policy by name, ignoring case.
    pub fn policy(&self, name: &str) -> Option<&ActionPolicy> {
        self.policies
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, policy)| policy)
    }

    fn validated(self) -> Result<Self> {
        if self.engine.ipv6_prefix_len > 128 {
            return Err(TierguardError::Config(format!(
                "ipv6_prefix_len must be at most 128, got {}",
                self.engine.ipv6_prefix_len
            )));
        }
        Ok(self)
    }
}
