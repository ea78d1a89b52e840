//! Shared fixtures for escalation tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use super::clock::ManualClock;
use super::engine::EscalationEngine;
use super::key::{Identifier, SequenceKey};
use super::penalty::{MemoryPenaltySink, PenaltySink};
use super::rulebook::{Rulebook, RulebookHandle};
use super::sequence::EventSequence;
use super::store::{MemorySequenceStore, SequenceStore, Versioned};
use crate::config::EngineConfig;
use crate::error::{Result, TierguardError};

/// Five free failed logins per day, then an hour of blacklist per event.
pub const SCENARIO_RULEBOOK: &str = r#"
event_types:
  failed_login: 0
  mail_reset: 1
tiers:
  - { category: ip, event_type: failed_login, sequence_number: 0, add_ttl: 86400, blacklist_for: 0 }
  - { category: ip, event_type: failed_login, sequence_number: 5, add_ttl: 0, blacklist_for: 3600 }
  - { category: user, event_type: failed_login, sequence_number: 0, add_ttl: 3600 }
  - { category: user, event_type: failed_login, sequence_number: 3, add_ttl: 3600, blacklist_for: 900 }
  - { category: user, event_type: mail_reset, sequence_number: 0, add_ttl: 600, blacklist_for: 0 }
  - { category: user, event_type: mail_reset, sequence_number: 1, add_ttl: 600, blacklist_for: 600 }
"#;

pub type MemoryEngine = EscalationEngine<MemorySequenceStore, MemoryPenaltySink>;

pub fn ip(addr: &str) -> Identifier {
    Identifier::Ip(addr.parse().unwrap())
}

pub fn scenario_engine() -> (MemoryEngine, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let engine = EscalationEngine::new(
        Arc::new(MemorySequenceStore::new()),
        Arc::new(MemoryPenaltySink::new()),
        Arc::new(RulebookHandle::new(Rulebook::from_yaml(SCENARIO_RULEBOOK).unwrap())),
        clock.clone(),
        EngineConfig::default(),
    );
    (engine, clock)
}

/// Memory store that yields between read and write to provoke races.
#[derive(Default)]
pub struct YieldingStore {
    inner: MemorySequenceStore,
}

#[async_trait]
impl SequenceStore for YieldingStore {
    async fn load(&self, key: &SequenceKey) -> Result<Option<Versioned<EventSequence>>> {
        let loaded = self.inner.load(key).await;
        tokio::task::yield_now().await;
        loaded
    }

    async fn compare_and_swap(
        &self,
        key: &SequenceKey,
        expected: Option<u64>,
        next: EventSequence,
    ) -> Result<bool> {
        tokio::task::yield_now().await;
        self.inner.compare_and_swap(key, expected, next).await
    }
}

/// Store whose writes always lose the race.
pub struct ContendedStore;

#[async_trait]
impl SequenceStore for ContendedStore {
    async fn load(&self, _key: &SequenceKey) -> Result<Option<Versioned<EventSequence>>> {
        Ok(None)
    }

    async fn compare_and_swap(
        &self,
        _key: &SequenceKey,
        _expected: Option<u64>,
        _next: EventSequence,
    ) -> Result<bool> {
        Ok(false)
    }
}

/// Store that is always down.
pub struct FailingStore;

#[async_trait]
impl SequenceStore for FailingStore {
    async fn load(&self, _key: &SequenceKey) -> Result<Option<Versioned<EventSequence>>> {
        Err(TierguardError::StoreUnavailable("connection refused".to_string()))
    }

    async fn compare_and_swap(
        &self,
        _key: &SequenceKey,
        _expected: Option<u64>,
        _next: EventSequence,
    ) -> Result<bool> {
        Err(TierguardError::StoreUnavailable("connection refused".to_string()))
    }
}

/// Penalty sink that is always down.
pub struct FailingSink;

#[async_trait]
impl PenaltySink for FailingSink {
    async fn blacklist_ip(&self, _ip: &str, _reliable: bool, _until: DateTime<Utc>) -> Result<()> {
        Err(TierguardError::StoreUnavailable("blacklist unreachable".to_string()))
    }

    async fn mark_user_suspicious(&self, _user_id: i64, _until: DateTime<Utc>) -> Result<()> {
        Err(TierguardError::StoreUnavailable("users unreachable".to_string()))
    }

    async fn ban_user(&self, _user_id: i64, _until: DateTime<Utc>) -> Result<()> {
        Err(TierguardError::StoreUnavailable("users unreachable".to_string()))
    }

    async fn lock_user(&self, _user_id: i64, _until: DateTime<Utc>) -> Result<()> {
        Err(TierguardError::StoreUnavailable("users unreachable".to_string()))
    }
}
