//! Sequence store trait and the in-memory backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

use super::key::SequenceKey;
use super::sequence::EventSequence;
use crate::error::Result;

/// A stored value together with the version it was written at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: T,
}

/// Persistence for event sequences.
///
/// Implementations only need per-key compare-and-swap. The engine builds
/// exactly-once read-modify-write on top of it, so writers on different keys
/// never wait on each other. A version must never repeat for a key, even
/// after its record has been removed.
#[async_trait]
pub trait SequenceStore: Send + Sync {
    /// Read the stored sequence for a key, live or not.
    async fn load(&self, key: &SequenceKey) -> Result<Option<Versioned<EventSequence>>>;

    /// Store `next` only if the current version equals `expected`
    /// (`None` meaning no record exists). Returns `false` on a version mismatch.
    async fn compare_and_swap(
        &self,
        key: &SequenceKey,
        expected: Option<u64>,
        next: EventSequence,
    ) -> Result<bool>;
}

/// Sequence store backed by a sharded concurrent map.
///
/// Versions come from one store-wide counter, so a key that is purged and
/// created again never reuses a version a stale writer may still hold.
#[derive(Debug, Default)]
pub struct MemorySequenceStore {
    sequences: DashMap<SequenceKey, Versioned<EventSequence>>,
    last_version: AtomicU64,
}

impl MemorySequenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of stored sequences.
    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    /// Drop records whose burst and limited marker have both lapsed.
    ///
    /// Returns the number of records removed.
    pub fn purge_lapsed(&self, now: DateTime<Utc>) -> usize {
        let before = self.sequences.len();
        self.sequences
            .retain(|_, stored| stored.value.is_live(now) || stored.value.is_limited(now));
        before - self.sequences.len()
    }

    fn next_version(&self) -> u64 {
        self.last_version.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[async_trait]
impl SequenceStore for MemorySequenceStore {
    async fn load(&self, key: &SequenceKey) -> Result<Option<Versioned<EventSequence>>> {
        Ok(self.sequences.get(key).map(|stored| stored.value().clone()))
    }

    async fn compare_and_swap(
        &self,
        key: &SequenceKey,
        expected: Option<u64>,
        next: EventSequence,
    ) -> Result<bool> {
        let swapped = match self.sequences.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                if expected == Some(entry.get().version) {
                    entry.insert(Versioned {
                        version: self.next_version(),
                        value: next,
                    });
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(entry) => {
                if expected.is_none() {
                    entry.insert(Versioned {
                        version: self.next_version(),
                        value: next,
                    });
                    true
                } else {
                    false
                }
            }
        };

        trace!(key = %key, expected = ?expected, swapped, "Sequence compare-and-swap");
        Ok(swapped)
    }
}
