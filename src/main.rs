use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tierguard::config::TierguardConfig;
use tierguard::escalation::{
    ActionOrchestrator, CommitReport, EscalationEngine, GatewayDecision, ManualClock, MemoryActionLog,
    MemoryPenaltySink, MemorySequenceStore, RateLimitGateway, RequestContext, RulebookHandle,
};

#[derive(Debug, Parser)]
#[command(name = "tierguard", version, about = "Escalating abuse detection toolkit")]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check a configuration file and its rulebook
    Validate {
        #[arg(short, long)]
        config: String,
    },
    /// Replay a JSON-lines request log through the gateway and orchestrator
    Replay {
        #[arg(short, long)]
        config: String,
        #[arg(short, long)]
        events: PathBuf,
    },
}

/// One line of a replay log.
#[derive(Debug, Deserialize)]
struct ReplayRecord {
    policy: String,
    #[serde(default)]
    at: Option<DateTime<Utc>>,
    #[serde(default)]
    ip: Option<IpAddr>,
    #[serde(default)]
    user_id: Option<i64>,
    #[serde(default)]
    untrusted_ip: bool,
    outcome: Outcome,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
enum Outcome {
    Success,
    Failure,
}

/// One line of replay output.
#[derive(Debug, Serialize)]
struct ReplayDecision {
    line: usize,
    policy: String,
    decision: Option<GatewayDecision>,
    committed: Option<CommitReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Validate { config } => validate(&config),
        Command::Replay { config, events } => replay(&config, &events).await,
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn validate(path: &str) -> anyhow::Result<()> {
    let config = TierguardConfig::from_file(path).context("loading configuration")?;
    let rulebook = config.rulebook.load().context("loading rulebook")?;

    let mut issues = rulebook.validate();
    for (name, policy) in &config.policies {
        let events = policy
            .check
            .user_events
            .iter()
            .chain(&policy.check.ip_events)
            .map(|check| &check.event)
            .chain(
                [&policy.on_failure, &policy.on_success]
                    .into_iter()
                    .flat_map(|spec| spec.user_events.iter().chain(&spec.ip_events))
                    .map(|commit| &commit.event),
            );
        for event in events {
            if let Err(e) = rulebook.resolve_event(event) {
                issues.push(format!("policy {}: {}", name, e));
            }
        }
    }

    if issues.is_empty() {
        info!(pairs = rulebook.len(), policies = config.policies.len(), "Configuration is valid");
        return Ok(());
    }
    for issue in &issues {
        warn!(issue = %issue, "Validation issue");
    }
    bail!("{} validation issue(s)", issues.len())
}

async fn replay(config_path: &str, events: &Path) -> anyhow::Result<()> {
    let config = TierguardConfig::from_file(config_path).context("loading configuration")?;
    let rulebook = Arc::new(RulebookHandle::new(config.rulebook.load().context("loading rulebook")?));

    let clock = Arc::new(ManualClock::new(Utc::now()));
    let engine = Arc::new(EscalationEngine::new(
        Arc::new(MemorySequenceStore::new()),
        Arc::new(MemoryPenaltySink::new()),
        rulebook,
        clock.clone(),
        config.engine.clone(),
    ));
    let actions = Arc::new(MemoryActionLog::new());
    let gateway = RateLimitGateway::new(engine.clone(), actions.clone());
    let orchestrator = ActionOrchestrator::new(engine.clone(), actions);

    let file = tokio::fs::File::open(events)
        .await
        .with_context(|| format!("opening {}", events.display()))?;
    let mut lines = BufReader::new(file).lines();
    let mut line_no = 0;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let record: ReplayRecord =
            serde_json::from_str(&line).with_context(|| format!("parsing line {}", line_no))?;
        if let Some(at) = record.at {
            clock.set(at);
        }

        let mut output = ReplayDecision {
            line: line_no,
            policy: record.policy.clone(),
            decision: None,
            committed: None,
            error: None,
        };

        let Some(policy) = config.policy(&record.policy) else {
            output.error = Some(format!("unknown policy {}", record.policy));
            println!("{}", serde_json::to_string(&output)?);
            continue;
        };

        let ctx = RequestContext {
            ip: record.ip,
            user_id: record.user_id,
            untrusted_ip: record.untrusted_ip,
        };

        match gateway.check(&policy.check, &ctx).await {
            Ok(decision) => {
                output.decision = Some(decision);
                if !decision.blocked {
                    let spec = match record.outcome {
                        Outcome::Success => &policy.on_success,
                        Outcome::Failure => &policy.on_failure,
                    };
                    match orchestrator.commit(spec, &ctx).await {
                        Ok(report) => output.committed = Some(report),
                        Err(e) => output.error = Some(e.to_string()),
                    }
                }
            }
            Err(e) => output.error = Some(e.to_string()),
        }

        println!("{}", serde_json::to_string(&output)?);
    }

    info!(lines = line_no, sequences = engine.store().len(), "Replay finished");
    Ok(())
}
