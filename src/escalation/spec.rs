//! Check and commit specifications, and how they resolve against a request.
//!
//! Specs are plain serde types so an authorization layer can keep them in
//! configuration next to the endpoint they protect.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use super::key::{Category, Identifier};
use super::penalty::PenaltyFlags;
use super::rulebook::EventRef;
use super::throttle::ActionKey;
use crate::error::{Result, TierguardError};

/// Identifiers known for the current request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestContext {
    pub ip: Option<IpAddr>,
    pub user_id: Option<i64>,
    /// The IP came from an unverified forwarding header
    pub untrusted_ip: bool,
}

impl RequestContext {
    pub fn new(ip: Option<IpAddr>, user_id: Option<i64>) -> Self {
        Self {
            ip,
            user_id,
            untrusted_ip: false,
        }
    }

    /// Resolve the identifier for a category, preferring an explicit override.
    ///
    /// Returns `Ok(None)` when neither the override nor the request has one.
    pub fn identifier(&self, category: Category, overridden: Option<&str>) -> Result<Option<Identifier>> {
        match (category, overridden) {
            (Category::Ip, Some(raw)) => raw
                .trim()
                .parse()
                .map(|ip| Some(Identifier::Ip(ip)))
                .map_err(|_| TierguardError::InvalidSpec(format!("not an IP address: {}", raw))),
            (Category::User, Some(raw)) => raw
                .trim()
                .parse()
                .map(|id| Some(Identifier::User(id)))
                .map_err(|_| TierguardError::InvalidSpec(format!("not a user id: {}", raw))),
            (Category::Ip, None) => Ok(self.ip.map(Identifier::Ip)),
            (Category::User, None) => Ok(self.user_id.map(Identifier::User)),
        }
    }
}

/// A named action throttled to once per `interval_secs` per actor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionSpec {
    /// Numeric action id (a numeric string is accepted)
    pub action: EventRef,
    #[serde(default = "default_scope")]
    pub scope: Category,
    /// Minimum seconds between two performances (ignored on commit)
    #[serde(default)]
    pub interval_secs: u64,
    /// Throttle under this identifier instead of the request's
    #[serde(default)]
    pub identifier: Option<String>,
}

fn default_scope() -> Category {
    Category::Ip
}

impl ActionSpec {
    pub fn action_id(&self) -> Result<u32> {
        match &self.action {
            EventRef::Id(id) => Ok(*id),
            EventRef::Name(raw) => raw
                .trim()
                .parse()
                .map_err(|_| TierguardError::InvalidSpec(format!("action id is not an integer: {}", raw))),
        }
    }

    /// The throttle key for this request, or `None` if the actor is unknown.
    pub fn key(&self, ctx: &RequestContext) -> Result<Option<ActionKey>> {
        let action = self.action_id()?;
        let identifier = match &self.identifier {
            Some(raw) => Some(raw.clone()),
            None => ctx.identifier(self.scope, None)?.map(|id| id.to_string()),
        };
        Ok(identifier.map(|identifier| ActionKey::new(self.scope, identifier, action)))
    }
}

/// A read-only check of one event sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCheck {
    pub event: EventRef,
    #[serde(default)]
    pub identifier: Option<String>,
}

/// What the gateway looks at before a protected action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckSpec {
    pub action: Option<ActionSpec>,
    pub user_events: Vec<EventCheck>,
    pub ip_events: Vec<EventCheck>,
}

/// One event to record after a protected action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCommit {
    pub event: EventRef,
    #[serde(default = "default_weight")]
    pub weight: u64,
    #[serde(default)]
    pub penalties: PenaltyFlags,
    #[serde(default)]
    pub identifier: Option<String>,
}

fn default_weight() -> u64 {
    1
}

impl EventCommit {
    pub fn new(event: impl Into<EventRef>) -> Self {
        Self {
            event: event.into(),
            weight: default_weight(),
            penalties: PenaltyFlags::none(),
            identifier: None,
        }
    }

    pub fn with_penalties(mut self, penalties: PenaltyFlags) -> Self {
        self.penalties = penalties;
        self
    }
}

/// What the orchestrator records after a protected action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitSpec {
    pub action: Option<ActionSpec>,
    pub user_events: Vec<EventCommit>,
    pub ip_events: Vec<EventCommit>,
}

/// A protected operation: what to check before it, what to record after it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionPolicy {
    pub check: CheckSpec,
    /// Recorded when the action fails (e.g. a rejected login)
    pub on_failure: CommitSpec,
    /// Recorded when the action succeeds
    pub on_success: CommitSpec,
}
