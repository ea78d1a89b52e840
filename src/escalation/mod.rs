//! Escalating abuse detection: event sequences, tiers and penalties.

mod clock;
mod engine;
mod gateway;
mod key;
mod orchestrator;
mod penalty;
mod rulebook;
mod sequence;
mod spec;
mod store;
mod throttle;

#[cfg(test)]
mod testing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::EscalationEngine;
pub use gateway::{GatewayDecision, RateLimitGateway};
pub use key::{bucket_ip, Category, Identifier, SequenceKey};
pub use orchestrator::{ActionOrchestrator, CommitReport, RecordedEvent};
pub use penalty::{BlacklistEntry, MemoryPenaltySink, PenaltyFlags, PenaltyKind, PenaltySink, UserFlags};
pub use rulebook::{EventRef, Rulebook, RulebookConfig, RulebookHandle, RulebookTier, TierConfig};
pub use sequence::EventSequence;
pub use spec::{ActionPolicy, ActionSpec, CheckSpec, CommitSpec, EventCheck, EventCommit, RequestContext};
pub use store::{MemorySequenceStore, SequenceStore, Versioned};
pub use throttle::{ActionKey, ActionLog, MemoryActionLog};
