//! Escalation rulebook configuration and tier lookup.
//!
//! A rulebook is an ordered set of tiers per (category, event type). Each tier
//! says how much a new event extends the sequence TTL and whether it triggers a
//! penalty, once the sequence count has reached the tier's threshold.
//!
//! The rulebook is loaded once into an immutable snapshot. Admin edits go
//! through [`RulebookHandle::reload`], which swaps the snapshot atomically.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use super::key::Category;
use crate::error::{Result, TierguardError};

/// Reference to an event type, either by numeric id or by rulebook name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventRef {
    Id(u32),
    Name(String),
}

impl From<u32> for EventRef {
    fn from(id: u32) -> Self {
        EventRef::Id(id)
    }
}

impl From<&str> for EventRef {
    fn from(name: &str) -> Self {
        EventRef::Name(name.to_string())
    }
}

impl std::fmt::Display for EventRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventRef::Id(id) => write!(f, "{}", id),
            EventRef::Name(name) => f.write_str(name),
        }
    }
}

/// On-disk rulebook format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulebookConfig {
    /// Human-readable names for event type ids
    #[serde(default)]
    pub event_types: HashMap<String, u32>,
    /// Tier rows, keyed by (category, event_type, sequence_number)
    #[serde(default)]
    pub tiers: Vec<TierConfig>,
}

/// One tier row as written in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    pub category: Category,
    pub event_type: EventRef,
    pub sequence_number: u64,
    /// Seconds added to the sequence expiry while this tier is active
    #[serde(default)]
    pub add_ttl: u64,
    /// Seconds of penalty applied by an event at this tier (0 = none)
    #[serde(default)]
    pub blacklist_for: u64,
    #[serde(default)]
    pub meta: Option<serde_json::Value>,
}

/// One escalation step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RulebookTier {
    pub category: Category,
    pub event_type: u32,
    pub sequence_number: u64,
    pub add_ttl: u64,
    pub blacklist_for: u64,
    pub meta: Option<serde_json::Value>,
}

impl RulebookTier {
    /// Whether an event at this tier carries a penalty.
    pub fn penalizes(&self) -> bool {
        self.blacklist_for > 0
    }
}

/// An immutable, compiled rulebook.
#[derive(Debug, Clone, Default)]
pub struct Rulebook {
    names: HashMap<String, u32>,
    /// Tiers per (category, event type), sorted by `sequence_number`
    tiers: BTreeMap<(Category, u32), Vec<RulebookTier>>,
}

impl Rulebook {
    /// Create an empty rulebook.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a rulebook from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rulebook");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a rulebook from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: RulebookConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TierguardError::Config(format!("Failed to parse rulebook: {}", e)))?;
        Self::from_config(config)
    }

    /// Compile a rulebook from its configuration rows.
    ///
    /// Duplicate (category, event type, sequence number) rows are rejected.
    pub fn from_config(config: RulebookConfig) -> Result<Self> {
        let mut rulebook = Rulebook::new();
        for (name, id) in config.event_types {
            if rulebook.names.insert(normalize(&name), id).is_some() {
                return Err(TierguardError::Config(format!("Duplicate event type name: {}", name)));
            }
        }

        for row in config.tiers {
            let event_type = rulebook.resolve_event(&row.event_type).map_err(|_| {
                TierguardError::Config(format!("Unknown event type in tier: {}", row.event_type))
            })?;

            let tiers = rulebook.tiers.entry((row.category, event_type)).or_default();
            if tiers.iter().any(|t| t.sequence_number == row.sequence_number) {
                return Err(TierguardError::Config(format!(
                    "Duplicate tier {}/{}/{}",
                    row.category, event_type, row.sequence_number
                )));
            }
            tiers.push(RulebookTier {
                category: row.category,
                event_type,
                sequence_number: row.sequence_number,
                add_ttl: row.add_ttl,
                blacklist_for: row.blacklist_for,
                meta: row.meta,
            });
        }

        for tiers in rulebook.tiers.values_mut() {
            tiers.sort_by_key(|t| t.sequence_number);
        }

        for issue in rulebook.validate() {
            warn!(issue = %issue, "Rulebook validation issue");
        }

        Ok(rulebook)
    }

    /// Resolve an event reference to its numeric id.
    ///
    /// Names that parse as integers are treated as ids. Names match
    /// regardless of case.
    pub fn resolve_event(&self, event: &EventRef) -> Result<u32> {
        match event {
            EventRef::Id(id) => Ok(*id),
            EventRef::Name(name) => {
                if let Ok(id) = name.trim().parse::<u32>() {
                    return Ok(id);
                }
                self.names
                    .get(&normalize(name))
                    .copied()
                    .ok_or_else(|| TierguardError::InvalidSpec(format!("Unknown event type: {}", name)))
            }
        }
    }

    /// Find the tier with the greatest `sequence_number <= count`.
    pub fn lookup_tier(&self, category: Category, event_type: u32, count: u64) -> Option<&RulebookTier> {
        let tiers = self.tiers.get(&(category, event_type))?;
        let idx = tiers.partition_point(|t| t.sequence_number <= count);
        if idx == 0 {
            None
        } else {
            Some(&tiers[idx - 1])
        }
    }

    /// All tiers for a (category, event type) pair, in threshold order.
    pub fn tiers(&self, category: Category, event_type: u32) -> &[RulebookTier] {
        self.tiers
            .get(&(category, event_type))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Number of configured (category, event type) pairs.
    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    /// Report pairs that can never start a sequence.
    pub fn validate(&self) -> Vec<String> {
        self.tiers
            .iter()
            .filter(|(_, tiers)| tiers.first().map_or(true, |t| t.sequence_number != 0))
            .map(|((category, event_type), _)| {
                format!("{}/{} has no tier at sequence number 0", category, event_type)
            })
            .collect()
    }
}

/// Event type names are case-insensitive.
fn normalize(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

/// Shared, reloadable access to the current rulebook snapshot.
#[derive(Debug, Default)]
pub struct RulebookHandle {
    current: RwLock<Arc<Rulebook>>,
}

impl RulebookHandle {
    pub fn new(rulebook: Rulebook) -> Self {
        Self {
            current: RwLock::new(Arc::new(rulebook)),
        }
    }

    /// The snapshot in effect right now. Callers keep it for one operation.
    pub fn snapshot(&self) -> Arc<Rulebook> {
        self.current.read().clone()
    }

    /// Replace the snapshot. In-flight operations finish on the old one.
    pub fn reload(&self, rulebook: Rulebook) {
        info!(pairs = rulebook.len(), "Rulebook reloaded");
        *self.current.write() = Arc::new(rulebook);
    }
}
