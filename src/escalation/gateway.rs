//! Read-only precheck run before a protected action.

use chrono::Duration;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::engine::EscalationEngine;
use super::key::{Category, SequenceKey};
use super::penalty::PenaltySink;
use super::sequence::seconds;
use super::spec::{CheckSpec, EventCheck, RequestContext};
use super::store::SequenceStore;
use super::throttle::{remaining_wait, ActionKey, ActionLog};
use crate::error::Result;

/// Outcome of a gateway check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayDecision {
    pub blocked: bool,
    /// Whole seconds until every blocking sub-check clears (0 when not blocked)
    pub retry_after_secs: u64,
}

impl GatewayDecision {
    pub fn clear() -> Self {
        Self {
            blocked: false,
            retry_after_secs: 0,
        }
    }

    /// A blocking decision for the longest of `waits`, rounded up to a whole second.
    fn from_waits(waits: impl IntoIterator<Item = Duration>) -> Self {
        match waits.into_iter().max() {
            None => Self::clear(),
            Some(wait) => {
                let millis = u64::try_from(wait.num_milliseconds()).unwrap_or(0);
                Self {
                    blocked: true,
                    retry_after_secs: millis.div_ceil(1000).max(1),
                }
            }
        }
    }
}

/// One resolved read.
enum Probe {
    Action(ActionKey, Duration),
    Sequence(SequenceKey),
}

/// The read-only rate limit gateway.
pub struct RateLimitGateway<S: SequenceStore, P: PenaltySink, A: ActionLog> {
    engine: Arc<EscalationEngine<S, P>>,
    actions: Arc<A>,
}

impl<S: SequenceStore, P: PenaltySink, A: ActionLog> RateLimitGateway<S, P, A> {
    pub fn new(engine: Arc<EscalationEngine<S, P>>, actions: Arc<A>) -> Self {
        Self { engine, actions }
    }

    /// Check whether the request is currently blocked.
    ///
    /// Sub-checks whose identifier is unavailable are skipped. A malformed
    /// spec is an error. A store failure blocks (fail closed).
    pub async fn check(&self, spec: &CheckSpec, ctx: &RequestContext) -> Result<GatewayDecision> {
        let probes = self.resolve(spec, ctx)?;
        if probes.is_empty() {
            return Ok(GatewayDecision::clear());
        }

        let now = self.engine.now();
        let fail_closed = seconds(self.engine.settings().fail_closed_retry_secs);

        let reads = probes.iter().map(|probe| async move {
            let wait = match probe {
                Probe::Action(key, interval) => self
                    .actions
                    .last_performed(key)
                    .await
                    .map(|last| last.and_then(|last| remaining_wait(last, *interval, now))),
                Probe::Sequence(key) => self
                    .engine
                    .limited_until(key)
                    .await
                    .map(|until| until.map(|until| until - now)),
            };
            wait.unwrap_or_else(|e| {
                warn!(error = %e, "Rate limit store unavailable, failing closed");
                Some(fail_closed)
            })
        });

        let decision = GatewayDecision::from_waits(join_all(reads).await.into_iter().flatten());
        if decision.blocked {
            debug!(retry_after = decision.retry_after_secs, "Request blocked");
        }
        Ok(decision)
    }

    fn resolve(&self, spec: &CheckSpec, ctx: &RequestContext) -> Result<Vec<Probe>> {
        let rulebook = self.engine.rulebook().snapshot();
        let mut probes = Vec::new();

        if let Some(action) = &spec.action {
            match action.key(ctx)? {
                Some(key) => {
                    probes.push(Probe::Action(key, seconds(action.interval_secs)));
                }
                None => trace!("No identifier for action check, skipping"),
            }
        }

        let events = spec
            .user_events
            .iter()
            .map(|check| (Category::User, check))
            .chain(spec.ip_events.iter().map(|check| (Category::Ip, check)));

        for (category, EventCheck { event, identifier }) in events {
            let event_type = rulebook.resolve_event(event)?;
            match ctx.identifier(category, identifier.as_deref())? {
                Some(id) => probes.push(Probe::Sequence(self.engine.key_for(&id, event_type))),
                None => trace!(category = %category, event = %event, "No identifier for event check, skipping"),
            }
        }

        Ok(probes)
    }
}
