//! Named-action throttle: "at most once per N seconds" per actor.
//!
//! This is independent of the escalation engine. The gateway reads it, the
//! orchestrator records the action once it has been performed.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

use super::key::Category;
use super::sequence::saturating_add;
use crate::error::Result;

/// Key of one throttled action for one actor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActionKey {
    pub category: Category,
    pub identifier: String,
    pub action: u32,
}

impl ActionKey {
    pub fn new(category: Category, identifier: impl Into<String>, action: u32) -> Self {
        Self {
            category,
            identifier: identifier.into(),
            action,
        }
    }
}

impl std::fmt::Display for ActionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}/action:{}", self.category, self.identifier, self.action)
    }
}

/// Remaining wait before an action performed at `last` may run again.
pub fn remaining_wait(last: DateTime<Utc>, interval: Duration, now: DateTime<Utc>) -> Option<Duration> {
    let next_allowed = saturating_add(last, interval);
    (next_allowed > now).then(|| next_allowed - now)
}

/// Record of when named actions were last performed.
#[async_trait]
pub trait ActionLog: Send + Sync {
    async fn last_performed(&self, key: &ActionKey) -> Result<Option<DateTime<Utc>>>;

    async fn record(&self, key: &ActionKey, at: DateTime<Utc>) -> Result<()>;
}

/// In-memory action log.
#[derive(Debug, Default)]
pub struct MemoryActionLog {
    performed: DashMap<ActionKey, DateTime<Utc>>,
}

impl MemoryActionLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ActionLog for MemoryActionLog {
    async fn last_performed(&self, key: &ActionKey) -> Result<Option<DateTime<Utc>>> {
        Ok(self.performed.get(key).map(|at| *at))
    }

    async fn record(&self, key: &ActionKey, at: DateTime<Utc>) -> Result<()> {
        self.performed
            .entry(key.clone())
            .and_modify(|last| *last = (*last).max(at))
            .or_insert(at);
        Ok(())
    }
}
