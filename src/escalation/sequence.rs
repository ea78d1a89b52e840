//! Event sequence state and its transition rule.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::rulebook::RulebookTier;

/// Most concrete IPs remembered in a bucketed IP sequence.
pub const MAX_META_IPS: usize = 32;

/// Configured durations are clamped to this many seconds.
const MAX_SECONDS: u64 = i32::MAX as u64;

/// Convert configured seconds to a duration that cannot overflow a timestamp.
pub(crate) fn seconds(secs: u64) -> Duration {
    Duration::seconds(secs.min(MAX_SECONDS) as i64)
}

/// `at + by`, saturating at the latest instant chrono can represent.
pub(crate) fn saturating_add(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    at.checked_add_signed(by).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// The live state of one escalating burst.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSequence {
    pub start_time: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Cumulative weight of events in the current burst
    pub count: u64,
    /// This burst is penalized until this instant
    #[serde(default)]
    pub limited_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub meta: Value,
}

impl EventSequence {
    /// Whether the burst is still running at `now`.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    /// Whether the burst is penalized at `now`.
    pub fn is_limited(&self, now: DateTime<Utc>) -> bool {
        self.limited_until.is_some_and(|until| until > now)
    }

    /// The sequence count that governs the next event.
    pub fn prior_count(previous: Option<&EventSequence>, now: DateTime<Utc>) -> u64 {
        previous.filter(|s| s.is_live(now)).map_or(0, |s| s.count)
    }

    /// Compute the state after one more event.
    ///
    /// `tier` must be the tier governing `prior_count(previous, now)`.
    /// An expired `previous` starts a fresh burst; its `limited_until`
    /// is carried over so the marker outlives the burst.
    pub fn advance(
        previous: Option<&EventSequence>,
        tier: &RulebookTier,
        weight: u64,
        now: DateTime<Utc>,
        seen: Option<&str>,
    ) -> EventSequence {
        let live = previous.filter(|s| s.is_live(now));
        let add_ttl = seconds(tier.add_ttl);

        let mut next = match live {
            Some(current) => EventSequence {
                start_time: current.start_time,
                expires_at: saturating_add(current.expires_at, add_ttl),
                count: current.count.saturating_add(weight),
                limited_until: current.limited_until,
                meta: current.meta.clone(),
            },
            None => EventSequence {
                start_time: now,
                expires_at: saturating_add(now, add_ttl),
                count: weight,
                limited_until: previous.and_then(|s| s.limited_until),
                meta: Value::Null,
            },
        };

        if tier.penalizes() {
            let until = saturating_add(now, seconds(tier.blacklist_for));
            next.limited_until = Some(next.limited_until.map_or(until, |existing| existing.max(until)));
        }

        if let Some(seen) = seen {
            next.remember(seen);
        }

        next
    }

    /// Add a concrete identifier to the `ips` list in `meta`.
    fn remember(&mut self, seen: &str) {
        if !self.meta.is_object() {
            self.meta = json!({ "ips": [] });
        }
        let Some(ips) = self
            .meta
            .as_object_mut()
            .map(|m| m.entry("ips").or_insert_with(|| json!([])))
            .and_then(Value::as_array_mut)
        else {
            return;
        };
        if ips.len() < MAX_META_IPS && !ips.iter().any(|v| v.as_str() == Some(seen)) {
            ips.push(Value::String(seen.to_string()));
        }
    }

    /// Concrete identifiers recorded in `meta`.
    pub fn seen_ips(&self) -> Vec<String> {
        self.meta
            .get("ips")
            .and_then(Value::as_array)
            .map(|ips| ips.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default()
    }
}
