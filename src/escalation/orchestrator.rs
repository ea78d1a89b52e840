//! Records the outcome of a protected action across several sequences.
//!
//! The whole spec is resolved before anything is written, so a malformed spec
//! records nothing. After that, events are recorded in order (action, user
//! events, IP events) and the first failure stops the batch. Events already
//! recorded stay recorded.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, trace};

use super::engine::EscalationEngine;
use super::key::{Category, Identifier};
use super::penalty::{PenaltyFlags, PenaltySink};
use super::spec::{CommitSpec, EventCommit, RequestContext};
use super::store::SequenceStore;
use super::throttle::{ActionKey, ActionLog};
use crate::error::{Result, TierguardError};

/// One event recorded by a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedEvent {
    pub key: String,
    pub count: u64,
}

/// Summary of a successful commit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitReport {
    pub action: Option<String>,
    pub recorded: Vec<RecordedEvent>,
    /// Events skipped because their identifier was unavailable
    pub skipped: usize,
}

/// A resolved event ready to record.
struct PlannedEvent {
    identifier: Identifier,
    event_type: u32,
    weight: u64,
    penalties: PenaltyFlags,
}

/// The write-path orchestrator.
pub struct ActionOrchestrator<S: SequenceStore, P: PenaltySink, A: ActionLog> {
    engine: Arc<EscalationEngine<S, P>>,
    actions: Arc<A>,
}

impl<S: SequenceStore, P: PenaltySink, A: ActionLog> ActionOrchestrator<S, P, A> {
    pub fn new(engine: Arc<EscalationEngine<S, P>>, actions: Arc<A>) -> Self {
        Self { engine, actions }
    }

    /// Record everything `spec` names for this request.
    pub async fn commit(&self, spec: &CommitSpec, ctx: &RequestContext) -> Result<CommitReport> {
        let (action, events, skipped) = self.plan(spec, ctx)?;
        let mut report = CommitReport {
            skipped,
            ..CommitReport::default()
        };

        if let Some(key) = action {
            self.actions
                .record(&key, self.engine.now())
                .await
                .map_err(|e| failed(key.to_string(), e))?;
            report.action = Some(key.to_string());
        }

        for planned in events {
            let label = self.engine.key_for(&planned.identifier, planned.event_type).to_string();
            let count = self
                .engine
                .record_event(&planned.identifier, planned.event_type, planned.weight, planned.penalties)
                .await
                .map_err(|e| failed(label.clone(), e))?;
            report.recorded.push(RecordedEvent { key: label, count });
        }

        debug!(
            recorded = report.recorded.len(),
            skipped = report.skipped,
            "Commit complete"
        );
        Ok(report)
    }

    fn plan(&self, spec: &CommitSpec, ctx: &RequestContext) -> Result<(Option<ActionKey>, Vec<PlannedEvent>, usize)> {
        let rulebook = self.engine.rulebook().snapshot();
        let mut skipped = 0;

        let action = match &spec.action {
            Some(action) => {
                let key = action.key(ctx)?;
                if key.is_none() {
                    trace!("No identifier for action commit, skipping");
                    skipped += 1;
                }
                key
            }
            None => None,
        };

        let commits = spec
            .user_events
            .iter()
            .map(|commit| (Category::User, commit))
            .chain(spec.ip_events.iter().map(|commit| (Category::Ip, commit)));

        let mut events = Vec::new();
        for (category, commit) in commits {
            let EventCommit {
                event,
                weight,
                penalties,
                identifier,
            } = commit;

            let event_type = rulebook.resolve_event(event)?;
            penalties.validate_for(category)?;
            if *weight == 0 {
                return Err(TierguardError::InvalidSpec(format!("event {} has weight 0", event)));
            }

            let Some(identifier) = ctx.identifier(category, identifier.as_deref())? else {
                trace!(category = %category, event = %event, "No identifier for event commit, skipping");
                skipped += 1;
                continue;
            };

            let mut penalties = *penalties;
            penalties.untrusted_ip |= category == Category::Ip && ctx.untrusted_ip;
            events.push(PlannedEvent {
                identifier,
                event_type,
                weight: *weight,
                penalties,
            });
        }

        Ok((action, events, skipped))
    }
}

fn failed(event: String, source: TierguardError) -> TierguardError {
    error!(event = %event, error = %source, "Commit aborted");
    TierguardError::CommitFailed {
        event,
        source: Box::new(source),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::escalation::clock::ManualClock;
    use crate::escalation::gateway::RateLimitGateway;
    use crate::escalation::penalty::MemoryPenaltySink;
    use crate::escalation::rulebook::{EventRef, Rulebook, RulebookHandle};
    use crate::escalation::spec::{ActionSpec, CheckSpec, EventCheck};
    use crate::escalation::store::MemorySequenceStore;
    use crate::escalation::testing::{scenario_engine, FailingStore, MemoryEngine, SCENARIO_RULEBOOK};
    use crate::escalation::throttle::MemoryActionLog;
    use chrono::Utc;

    fn login_failure() -> CommitSpec {
        CommitSpec {
            action: None,
            user_events: vec![EventCommit::new("failed_login").with_penalties(PenaltyFlags {
                suspicious: true,
                ..PenaltyFlags::none()
            })],
            ip_events: vec![EventCommit::new("failed_login").with_penalties(PenaltyFlags::blacklist())],
        }
    }

    fn orchestrator(engine: MemoryEngine) -> (Arc<MemoryEngine>, ActionOrchestrator<MemorySequenceStore, MemoryPenaltySink, MemoryActionLog>) {
        let engine = Arc::new(engine);
        let orchestrator = ActionOrchestrator::new(engine.clone(), Arc::new(MemoryActionLog::new()));
        (engine, orchestrator)
    }

    #[tokio::test]
    async fn test_commit_records_user_and_ip_events() {
        let (engine, orchestrator) = orchestrator(scenario_engine().0);
        let ctx = RequestContext::new(Some("1.2.3.4".parse().unwrap()), Some(11));

        let report = orchestrator.commit(&login_failure(), &ctx).await.unwrap();
        assert_eq!(
            report.recorded,
            vec![
                RecordedEvent { key: "user:11/event:0".to_string(), count: 1 },
                RecordedEvent { key: "ip:1.2.3.4/event:0".to_string(), count: 1 },
            ]
        );
        assert_eq!(report.skipped, 0);
        assert_eq!(engine.store().len(), 2);
    }

    #[tokio::test]
    async fn test_commit_skips_unavailable_identifiers() {
        let (engine, orchestrator) = orchestrator(scenario_engine().0);
        let ctx = RequestContext::new(Some("1.2.3.4".parse().unwrap()), None);

        let report = orchestrator.commit(&login_failure(), &ctx).await.unwrap();
        assert_eq!(report.recorded.len(), 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(engine.store().len(), 1);
    }

    #[tokio::test]
    async fn test_user_penalty_flags_applied() {
        let (engine, orchestrator) = orchestrator(scenario_engine().0);
        let ctx = RequestContext::new(None, Some(11));

        for _ in 0..4 {
            orchestrator.commit(&login_failure(), &ctx).await.unwrap();
        }

        let flags = engine.penalties().user_flags(11).unwrap();
        assert_eq!(flags.suspicious_until, Some(engine.now() + chrono::Duration::seconds(900)));
        assert_eq!(flags.banned_until, None);
        assert_eq!(flags.locked_until, None);
    }

    #[tokio::test]
    async fn test_untrusted_ip_blacklisted_as_unreliable() {
        let (engine, orchestrator) = orchestrator(scenario_engine().0);
        let ctx = RequestContext {
            untrusted_ip: true,
            ..RequestContext::new(Some("6.6.6.6".parse().unwrap()), None)
        };

        for _ in 0..6 {
            orchestrator.commit(&login_failure(), &ctx).await.unwrap();
        }
        assert!(!engine.penalties().blacklist_entry("6.6.6.6").unwrap().reliable);
    }

    #[tokio::test]
    async fn test_invalid_spec_records_nothing() {
        let (engine, orchestrator) = orchestrator(scenario_engine().0);
        let ctx = RequestContext::new(Some("1.2.3.4".parse().unwrap()), Some(11));

        let mut spec = login_failure();
        spec.ip_events.push(EventCommit::new("no_such_event"));
        assert!(matches!(
            orchestrator.commit(&spec, &ctx).await,
            Err(TierguardError::InvalidSpec(_))
        ));

        let mut spec = login_failure();
        spec.ip_events[0].penalties.ban = true;
        assert!(orchestrator.commit(&spec, &ctx).await.is_err());

        assert!(engine.store().is_empty());
    }

    #[tokio::test]
    async fn test_first_failure_aborts_batch() {
        let yaml = "tiers:\n  - { category: user, event_type: 0, sequence_number: 0, add_ttl: 60 }\n";
        let engine = EscalationEngine::new(
            Arc::new(MemorySequenceStore::new()),
            Arc::new(MemoryPenaltySink::new()),
            Arc::new(RulebookHandle::new(Rulebook::from_yaml(yaml).unwrap())),
            Arc::new(ManualClock::new(Utc::now())),
            EngineConfig::default(),
        );
        let (engine, orchestrator) = orchestrator(engine);
        let ctx = RequestContext::new(Some("1.2.3.4".parse().unwrap()), Some(11));
        let spec = CommitSpec {
            ip_events: vec![EventCommit::new(EventRef::Id(0)), EventCommit::new(EventRef::Id(0))],
            user_events: vec![EventCommit::new(EventRef::Id(0))],
            ..CommitSpec::default()
        };

        let err = orchestrator.commit(&spec, &ctx).await.unwrap_err();
        match err {
            TierguardError::CommitFailed { event, source } => {
                assert_eq!(event, "ip:1.2.3.4/event:0");
                assert!(matches!(*source, TierguardError::ConfigurationMissing { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }

        // The user event before the failure stays recorded
        assert_eq!(engine.store().len(), 1);
    }

    #[tokio::test]
    async fn test_store_outage_fails_commit() {
        let engine = EscalationEngine::new(
            Arc::new(FailingStore),
            Arc::new(MemoryPenaltySink::new()),
            Arc::new(RulebookHandle::new(Rulebook::from_yaml(SCENARIO_RULEBOOK).unwrap())),
            Arc::new(ManualClock::new(Utc::now())),
            EngineConfig::default(),
        );
        let orchestrator = ActionOrchestrator::new(Arc::new(engine), Arc::new(MemoryActionLog::new()));
        let ctx = RequestContext::new(Some("1.2.3.4".parse().unwrap()), Some(11));

        let err = tokio_test::assert_err!(orchestrator.commit(&login_failure(), &ctx).await);
        assert_eq!(err.code(), "store_unavailable");
    }

    #[tokio::test]
    async fn test_commit_then_check_round_trip() {
        let (engine, clock) = scenario_engine();
        let engine = Arc::new(engine);
        let actions = Arc::new(MemoryActionLog::new());
        let orchestrator = ActionOrchestrator::new(engine.clone(), actions.clone());
        let gateway = RateLimitGateway::new(engine.clone(), actions);
        let ctx = RequestContext::new(Some("3.3.3.3".parse().unwrap()), Some(21));

        let mail = ActionSpec {
            action: EventRef::Id(4),
            scope: Category::User,
            interval_secs: 120,
            identifier: None,
        };
        let commit = CommitSpec {
            action: Some(mail.clone()),
            ..CommitSpec::default()
        };
        let check = CheckSpec {
            action: Some(mail),
            ip_events: vec![EventCheck { event: "failed_login".into(), identifier: None }],
            ..CheckSpec::default()
        };

        assert!(!gateway.check(&check, &ctx).await.unwrap().blocked);
        let report = orchestrator.commit(&commit, &ctx).await.unwrap();
        assert_eq!(report.action.as_deref(), Some("user:21/action:4"));

        clock.advance(chrono::Duration::seconds(20));
        let decision = gateway.check(&check, &ctx).await.unwrap();
        assert!(decision.blocked);
        assert_eq!(decision.retry_after_secs, 100);
    }
}
