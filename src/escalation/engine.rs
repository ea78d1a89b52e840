//! The escalation engine: records events into sequences and applies penalties.
//!
//! Each call is an exactly-once read-modify-write on one sequence key, built
//! as an optimistic compare-and-swap loop over the [`SequenceStore`]. Calls on
//! different keys never contend. Penalties are applied only after the sequence
//! write has landed.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, instrument, trace, warn};

use super::clock::Clock;
use super::key::{Identifier, SequenceKey};
use super::penalty::{PenaltyFlags, PenaltySink};
use super::rulebook::RulebookHandle;
use super::sequence::{saturating_add, seconds, EventSequence};
use super::store::SequenceStore;
use crate::config::EngineConfig;
use crate::error::{Result, TierguardError};

/// The escalation engine.
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct EscalationEngine<S: SequenceStore, P: PenaltySink> {
    store: Arc<S>,
    penalties: Arc<P>,
    rulebook: Arc<RulebookHandle>,
    clock: Arc<dyn Clock>,
    settings: EngineConfig,
}

impl<S: SequenceStore, P: PenaltySink> EscalationEngine<S, P> {
    pub fn new(
        store: Arc<S>,
        penalties: Arc<P>,
        rulebook: Arc<RulebookHandle>,
        clock: Arc<dyn Clock>,
        settings: EngineConfig,
    ) -> Self {
        Self {
            store,
            penalties,
            rulebook,
            clock,
            settings,
        }
    }

    pub fn rulebook(&self) -> &Arc<RulebookHandle> {
        &self.rulebook
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn penalties(&self) -> &Arc<P> {
        &self.penalties
    }

    pub fn settings(&self) -> &EngineConfig {
        &self.settings
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Build the sequence key for an identifier under the engine's IP bucketing.
    pub fn key_for(&self, identifier: &Identifier, event_type: u32) -> SequenceKey {
        SequenceKey::new(identifier, event_type, self.settings.ipv6_prefix_len)
    }

    /// Record one event of `weight` for `identifier` and return the new sequence count.
    ///
    /// When the tier governing the prior count carries a penalty, the sequence
    /// is marked limited and the penalties selected by `penalties` are applied.
    #[instrument(skip(self, identifier, penalties), fields(identifier = %identifier))]
    pub async fn record_event(
        &self,
        identifier: &Identifier,
        event_type: u32,
        weight: u64,
        penalties: PenaltyFlags,
    ) -> Result<u64> {
        if weight == 0 {
            return Err(TierguardError::InvalidSpec("event weight must be at least 1".to_string()));
        }
        penalties.validate_for(identifier.category())?;

        let key = self.key_for(identifier, event_type);
        let seen = match identifier {
            Identifier::Ip(ip) if key.identifier != ip.to_string() => Some(ip.to_string()),
            _ => None,
        };

        let rulebook = self.rulebook.snapshot();
        let max_attempts = self.settings.max_cas_attempts.max(1);

        for attempt in 1..=max_attempts {
            let now = self.clock.now();
            let stored = self.store.load(&key).await?;
            let previous = stored.as_ref().map(|s| &s.value);
            let prior = EventSequence::prior_count(previous, now);

            let tier = rulebook
                .lookup_tier(key.category, key.event_type, prior)
                .ok_or_else(|| TierguardError::ConfigurationMissing {
                    category: key.category.to_string(),
                    event_type: key.event_type,
                })?;

            let next = EventSequence::advance(previous, tier, weight, now, seen.as_deref());
            let count = next.count;
            let expected = stored.as_ref().map(|s| s.version);

            if !self.store.compare_and_swap(&key, expected, next).await? {
                trace!(key = %key, attempt, "Concurrent update, retrying");
                tokio::task::yield_now().await;
                continue;
            }

            debug!(
                key = %key,
                prior = prior,
                count = count,
                tier = tier.sequence_number,
                "Event recorded"
            );

            if tier.penalizes() {
                let until = saturating_add(now, seconds(tier.blacklist_for));
                self.penalties.apply(&key, penalties, until).await?;
            }

            return Ok(count);
        }

        warn!(key = %key, attempts = max_attempts, "Giving up on contended sequence");
        Err(TierguardError::StoreContention {
            key: key.to_string(),
            attempts: max_attempts,
        })
    }

    /// The live sequence for a key, if any. Never mutates state.
    pub async fn current(&self, key: &SequenceKey) -> Result<Option<EventSequence>> {
        let now = self.clock.now();
        Ok(self
            .store
            .load(key)
            .await?
            .map(|stored| stored.value)
            .filter(|seq| seq.is_live(now)))
    }

    /// When the sequence's penalty ends, if it is penalized right now.
    ///
    /// The marker is honoured even after the burst itself has lapsed.
    pub async fn limited_until(&self, key: &SequenceKey) -> Result<Option<DateTime<Utc>>> {
        let now = self.clock.now();
        Ok(self
            .store
            .load(key)
            .await?
            .and_then(|stored| stored.value.limited_until)
            .filter(|until| *until > now))
    }
}
