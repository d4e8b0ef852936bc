use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use bouncer_audit::{AuditLog, FileAuditLog};
use bouncer_classify::{
    check_compliance, classify, parse_and_normalize, score_fail_closed, ClassifierConfig,
    ComplianceRuleSet, RiskRuleSet,
};
use bouncer_dispatcher::{Callback, CallbackKind, Dispatcher, DispatchOutcome};
use bouncer_grant::{request_grant, GrantRequest};
use bouncer_model::ActionPayload;
use bouncer_pipeline::{AdmissionConfig, Decision, ExecutionOutcome, SubmitRequest};
use bouncer_store::{
    FakeExecutor, InMemoryApprovalStore, InMemoryGrantStore, InMemoryPageStore,
    InMemoryRateLimitStore, InMemoryTrustStore, RecordingNotifier,
};
use chrono::Utc;

#[derive(Debug, Error)]
enum CliError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("model error: {0}")]
    Model(#[from] bouncer_model::ModelError),
    #[error("pipeline error: {0}")]
    Pipeline(#[from] bouncer_pipeline::PipelineError),
    #[error("dispatch error: {0}")]
    Dispatch(#[from] bouncer_dispatcher::DispatchError),
    #[error("grant error: {0}")]
    Grant(#[from] bouncer_grant::GrantError),
    #[error("grant store error: {0}")]
    GrantStore(#[from] bouncer_store::GrantStoreError),
    #[error("approval store error: {0}")]
    Store(#[from] bouncer_store::StoreError),
    #[error("parse error: {0}")]
    Parse(#[from] bouncer_classify::ParseError),
    #[error("audit error: {0}")]
    Audit(#[from] bouncer_audit::AuditError),
}

#[derive(Parser)]
#[command(name = "bouncer-control", version, about = "Bouncer approval-gateway control-plane utilities")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a scenario (a sequence of submissions and approver callbacks)
    /// against a fresh, in-memory gateway instance and print one JSON
    /// result line per step.
    RunScenario {
        #[arg(long)]
        scenario_json: PathBuf,

        /// JSONL file the hash-chained audit trail is appended to.
        #[arg(long)]
        audit_log: PathBuf,
    },

    /// Verify a hash-chained audit log and print the final hash.
    VerifyAudit {
        #[arg(long)]
        audit_log: PathBuf,
    },

    /// Classify a single command string without touching any store --
    /// useful for previewing how the pipeline would treat it.
    Classify {
        command: String,
    },
}

/// Top-level scenario file: an approver whitelist, the trust/grant knobs
/// the dispatcher needs, and the ordered steps to replay.
#[derive(Debug, Deserialize)]
struct Scenario {
    #[serde(default)]
    approvers: Vec<String>,
    #[serde(default = "default_trust_ttl_minutes")]
    trust_ttl_minutes: i64,
    #[serde(default = "default_trust_max_commands")]
    trust_max_commands: u64,
    #[serde(default)]
    trust_max_uploads: u64,
    #[serde(default)]
    trust_max_bytes: u64,
    #[serde(default = "default_grant_max_executions")]
    grant_default_max_executions: u32,
    #[serde(default = "default_grant_ttl_max_minutes")]
    grant_ttl_max_minutes: u32,
    steps: Vec<ScenarioStep>,
}

fn default_trust_ttl_minutes() -> i64 {
    10
}
fn default_trust_max_commands() -> u64 {
    20
}
fn default_grant_max_executions() -> u32 {
    50
}
fn default_grant_ttl_max_minutes() -> u32 {
    60
}
fn default_list_limit() -> usize {
    50
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ScenarioStep {
    Submit {
        #[serde(default)]
        idempotency_key: Option<String>,
        payload: ActionPayload,
        display_summary: String,
        source: String,
        #[serde(default)]
        trust_scope: Option<String>,
        account_id: String,
        reason: String,
        #[serde(default)]
        template_payload: Option<String>,
    },
    Callback {
        kind: CallbackKind,
        target_id: String,
        approver_id: String,
    },
    GrantRequest {
        commands: Vec<String>,
        reason: String,
        source: String,
        #[serde(default)]
        trust_scope: Option<String>,
        account_id: String,
        ttl_minutes: u32,
        #[serde(default)]
        allow_repeat: bool,
    },
    ListPending {
        #[serde(default)]
        source: Option<String>,
        #[serde(default = "default_list_limit")]
        limit: usize,
    },
    /// Retrieve an overflow result page stashed by a prior submit/callback
    /// step (§4.12).
    GetPage {
        page_id: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = run().await {
        eprintln!("ERROR: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    let args = Args::parse();
    match args.cmd {
        Command::VerifyAudit { audit_log } => {
            let last = bouncer_audit::verify_log(audit_log)?;
            println!("{last}");
            Ok(())
        }
        Command::Classify { command } => run_classify(&command),
        Command::RunScenario {
            scenario_json,
            audit_log,
        } => run_scenario(scenario_json, audit_log).await,
    }
}

fn run_classify(command: &str) -> Result<(), CliError> {
    let argv = parse_and_normalize(command)?;
    let classification = classify(&argv, &ClassifierConfig::default());
    let compliance = check_compliance(&argv, None, &ComplianceRuleSet::default());
    let risk = score_fail_closed(&argv, &RiskRuleSet::default());

    println!(
        "{}",
        serde_json::to_string(&json!({
            "argv": argv,
            "classification": format!("{:?}", classification.classification),
            "reason": classification.reason,
            "suggestion": classification.suggestion,
            "compliance_findings": compliance.findings.iter().map(|f| json!({
                "rule_id": f.rule_id,
                "severity": format!("{:?}", f.severity),
                "reason": f.reason,
            })).collect::<Vec<_>>(),
            "risk_score": risk.score,
            "risk_hits": risk.hits,
        }))?
    );
    Ok(())
}

async fn run_scenario(scenario_json: PathBuf, audit_log: PathBuf) -> Result<(), CliError> {
    let bytes = fs::read(&scenario_json)?;
    let scenario: Scenario = serde_json::from_slice(&bytes)?;

    let config = AdmissionConfig::default();
    let approval_store = Arc::new(InMemoryApprovalStore::new());
    let rate_store = Arc::new(InMemoryRateLimitStore::new());
    let trust_store = Arc::new(InMemoryTrustStore::new());
    let grant_store = Arc::new(InMemoryGrantStore::new());
    let page_store = Arc::new(InMemoryPageStore::new());
    let executor = Arc::new(FakeExecutor::ok(""));
    let notifier = Arc::new(RecordingNotifier::new());
    let audit: Arc<dyn AuditLog> = Arc::new(FileAuditLog::open(&audit_log)?);

    let pipeline = bouncer_pipeline::AdmissionPipeline::new(
        config.clone(),
        approval_store.clone(),
        rate_store,
        trust_store.clone(),
        grant_store.clone(),
        executor.clone(),
        notifier.clone(),
        audit.clone(),
    );

    let approvers: HashSet<String> = scenario.approvers.iter().cloned().collect();
    let dispatcher = Dispatcher::new(
        config.clone(),
        approvers,
        scenario.trust_ttl_minutes,
        scenario.trust_max_commands,
        scenario.trust_max_uploads,
        scenario.trust_max_bytes,
        scenario.grant_default_max_executions,
        approval_store.clone(),
        grant_store.clone(),
        page_store,
        trust_store,
        executor,
        notifier,
        audit,
    );

    for (index, step) in scenario.steps.into_iter().enumerate() {
        let now = Utc::now();
        let outcome = match step {
            ScenarioStep::Submit {
                idempotency_key,
                payload,
                display_summary,
                source,
                trust_scope,
                account_id,
                reason,
                template_payload,
            } => {
                let decision = pipeline
                    .admit(
                        SubmitRequest {
                            idempotency_key,
                            payload,
                            display_summary,
                            source,
                            trust_scope,
                            account_id,
                            reason,
                            template_payload,
                        },
                        now,
                    )
                    .await?;
                json!({"step": index, "type": "submit", "decision": decision_to_json(&decision)})
            }
            ScenarioStep::Callback {
                kind,
                target_id,
                approver_id,
            } => {
                let result = dispatcher
                    .handle(
                        Callback {
                            kind,
                            target_id,
                            approver_id,
                        },
                        now,
                    )
                    .await?;
                json!({"step": index, "type": "callback", "outcome": outcome_to_json(&result)})
            }
            ScenarioStep::GrantRequest {
                commands,
                reason,
                source,
                trust_scope,
                account_id,
                ttl_minutes,
                allow_repeat,
            } => {
                let session = request_grant(
                    GrantRequest {
                        commands,
                        reason,
                        source,
                        trust_scope,
                        account_id,
                        ttl_minutes,
                        allow_repeat,
                    },
                    now,
                    scenario.grant_ttl_max_minutes,
                    &config.classifier,
                    &config.compliance,
                )?;
                let grant_id = session.grant_id.clone();
                let status = format!("{:?}", session.status);
                let requires_individual = session.requires_individual.clone();
                grant_store.put(session).await?;
                json!({
                    "step": index,
                    "type": "grant_request",
                    "grant_id": grant_id,
                    "status": status,
                    "requires_individual": requires_individual,
                })
            }
            ScenarioStep::GetPage { page_id } => {
                let page = dispatcher.get_page(&page_id, now).await?;
                json!({"step": index, "type": "get_page", "page_id": page_id, "page": page})
            }
            ScenarioStep::ListPending { source, limit } => {
                let pending = approval_store.list_pending(source.as_deref(), limit).await?;
                json!({
                    "step": index,
                    "type": "list_pending",
                    "requests": pending.iter().map(|r| json!({
                        "request_id": r.request_id,
                        "display_summary": r.display_summary,
                        "source": r.source,
                        "account_id": r.account_id,
                        "created_at": r.created_at,
                        "expires_at": r.expires_at,
                    })).collect::<Vec<_>>(),
                })
            }
        };
        println!("{}", serde_json::to_string(&outcome)?);
    }

    Ok(())
}

fn decision_to_json(decision: &Decision) -> serde_json::Value {
    match decision {
        Decision::AutoApproved { request_id, outcome } => {
            json!({"kind": "auto_approved", "request_id": request_id, "outcome": outcome_exec_to_json(outcome)})
        }
        Decision::TrustAutoApproved { request_id, outcome } => {
            json!({"kind": "trust_auto_approved", "request_id": request_id, "outcome": outcome_exec_to_json(outcome)})
        }
        Decision::GrantAutoApproved { request_id, outcome } => {
            json!({"kind": "grant_auto_approved", "request_id": request_id, "outcome": outcome_exec_to_json(outcome)})
        }
        Decision::Blocked { block_reason, suggestion } => {
            json!({"kind": "blocked", "reason": block_reason, "suggestion": suggestion})
        }
        Decision::ComplianceRejected { rule_id, reason } => {
            json!({"kind": "compliance_rejected", "rule_id": rule_id, "reason": reason})
        }
        Decision::RateLimited => json!({"kind": "rate_limited"}),
        Decision::Pending { request_id, expires_at } => {
            json!({"kind": "pending", "request_id": request_id, "expires_at": expires_at})
        }
    }
}

fn outcome_exec_to_json(outcome: &ExecutionOutcome) -> serde_json::Value {
    json!({
        "stdout": outcome.stdout,
        "exit_code": outcome.exit_code,
        "execution_time_ms": outcome.execution_time_ms,
    })
}

fn outcome_to_json(outcome: &DispatchOutcome) -> serde_json::Value {
    match outcome {
        DispatchOutcome::NotAuthorized => json!({"kind": "not_authorized"}),
        DispatchOutcome::AlreadyHandled => json!({"kind": "already_handled"}),
        DispatchOutcome::Expired => json!({"kind": "expired"}),
        DispatchOutcome::NotFound => json!({"kind": "not_found"}),
        DispatchOutcome::Approved { request_id, outcome } => {
            json!({"kind": "approved", "request_id": request_id, "outcome": outcome_exec_to_json(outcome)})
        }
        DispatchOutcome::Denied { request_id } => json!({"kind": "denied", "request_id": request_id}),
        DispatchOutcome::TrustOpened { trust_id, drained } => {
            json!({"kind": "trust_opened", "trust_id": trust_id, "drained": drained})
        }
        DispatchOutcome::GrantApproved { grant_id } => json!({"kind": "grant_approved", "grant_id": grant_id}),
        DispatchOutcome::GrantDenied { grant_id } => json!({"kind": "grant_denied", "grant_id": grant_id}),
        DispatchOutcome::TrustRevoked => json!({"kind": "trust_revoked"}),
        DispatchOutcome::GrantRevoked => json!({"kind": "grant_revoked"}),
    }
}
