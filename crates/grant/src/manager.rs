//! Grant Session Manager (§4.6).
//!
//! A grant is a pre-approved bundle of specific commands. `Request` builds
//! a pending session from a caller-supplied command list, carving out
//! DANGEROUS commands into `requires_individual` and rejecting outright if
//! any command is BLOCKED or triggers CRITICAL compliance. An approver
//! then acts (`ApproveAll` / `ApproveSafeOnly` / `Deny`); `Execute` matches
//! a command against the authorized set and consumes budget.

use crate::pattern::{compile_pattern, PatternError};
use bouncer_classify::classifier::{classify, Classification, ClassifierConfig};
use bouncer_classify::compliance::{check_compliance, ComplianceRuleSet};
use bouncer_classify::{normalize_argv, parse_argv};
use bouncer_common::opaque_id;
use bouncer_model::{AuthorizedCommand, GrantSession, GrantStatus};
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

pub const GRANT_ID_ENTROPY_BYTES: usize = 24;

#[derive(Debug, Error)]
pub enum GrantError {
    #[error("grant ttl_minutes {requested} exceeds the maximum of {max}")]
    TtlExceedsMax { requested: u32, max: u32 },
    #[error("grant contains a BLOCKED command: {command} ({reason})")]
    ContainsBlocked { command: String, reason: String },
    #[error("grant contains a CRITICAL-compliance command: {command} ({reason})")]
    ContainsCriticalCompliance { command: String, reason: String },
    #[error("command failed to parse: {0}")]
    Parse(#[from] bouncer_classify::ParseError),
    #[error("grant is not in a usable state")]
    NotUsable,
    #[error("command is not in the authorized set")]
    NotAuthorized,
    #[error("grant execution budget exhausted")]
    BudgetExhausted,
    #[error("authorized entry already consumed and allow_repeat is false")]
    AlreadyConsumed,
    #[error("invalid grant pattern: {0}")]
    Pattern(#[from] PatternError),
}

#[derive(Debug, Clone)]
pub struct GrantRequest {
    pub commands: Vec<String>,
    pub reason: String,
    pub source: String,
    pub trust_scope: Option<String>,
    pub account_id: String,
    pub ttl_minutes: u32,
    pub allow_repeat: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApproverAction {
    ApproveAll,
    ApproveSafeOnly,
    Deny,
}

pub fn request_grant(
    req: GrantRequest,
    now: DateTime<Utc>,
    grant_ttl_max_minutes: u32,
    classifier_cfg: &ClassifierConfig,
    compliance_rules: &ComplianceRuleSet,
) -> Result<GrantSession, GrantError> {
    if req.ttl_minutes > grant_ttl_max_minutes {
        return Err(GrantError::TtlExceedsMax {
            requested: req.ttl_minutes,
            max: grant_ttl_max_minutes,
        });
    }

    let mut authorized = Vec::new();
    let mut requires_individual = Vec::new();

    for raw in &req.commands {
        let argv = parse_argv(raw)?;
        let normalized = normalize_argv(&argv);
        let classification = classify(&normalized, classifier_cfg);
        if classification.classification == Classification::Blocked {
            return Err(GrantError::ContainsBlocked {
                command: raw.clone(),
                reason: classification.reason,
            });
        }
        let compliance = check_compliance(&normalized, None, compliance_rules);
        if compliance.has_critical() {
            tracing::warn!(source = %req.source, command = %raw, "grant request contains a CRITICAL-compliance command");
            return Err(GrantError::ContainsCriticalCompliance {
                command: raw.clone(),
                reason: compliance
                    .findings
                    .first()
                    .map(|f| f.reason.clone())
                    .unwrap_or_default(),
            });
        }
        let normalized_joined = normalized.join(" ");
        if classification.classification == Classification::Dangerous {
            requires_individual.push(normalized_joined);
        } else {
            authorized.push(AuthorizedCommand {
                raw: normalized_joined,
                is_pattern: false,
                consumed: false,
            });
        }
    }

    Ok(GrantSession {
        grant_id: opaque_id("grant", GRANT_ID_ENTROPY_BYTES),
        source: req.source,
        trust_scope: req.trust_scope,
        account_id: req.account_id,
        authorized,
        requires_individual,
        reason: req.reason,
        allow_repeat: req.allow_repeat,
        ttl_minutes: req.ttl_minutes,
        max_executions: 0, // set by caller via with_max_executions, default unset
        executions_used: 0,
        status: GrantStatus::Pending,
        created_at: now,
        approved_at: None,
        expires_at: None,
    })
}

/// Apply an approver's decision. TTL starts counting from approval time
/// (§3). `ApproveSafeOnly` drops the dangerous carve-outs entirely rather
/// than granting them individually later -- the caller must request those
/// separately.
pub fn apply_approval(
    session: &mut GrantSession,
    action: ApproverAction,
    now: DateTime<Utc>,
    max_executions: u32,
) -> Result<(), GrantError> {
    if session.status != GrantStatus::Pending {
        return Err(GrantError::NotUsable);
    }
    match action {
        ApproverAction::ApproveAll => {
            session.status = GrantStatus::Approved;
            session.approved_at = Some(now);
            session.expires_at = Some(now + Duration::minutes(session.ttl_minutes as i64));
            session.max_executions = max_executions;
        }
        ApproverAction::ApproveSafeOnly => {
            session.status = GrantStatus::Approved;
            session.approved_at = Some(now);
            session.expires_at = Some(now + Duration::minutes(session.ttl_minutes as i64));
            session.max_executions = max_executions;
            session.requires_individual.clear();
        }
        ApproverAction::Deny => {
            session.status = GrantStatus::Denied;
        }
    }
    Ok(())
}

/// Match `command` (already normalized) against the authorized set: exact
/// normalized-string match, or pattern match if the stored entry was
/// recorded as a pattern. Matches regardless of `consumed` so the caller
/// can tell "never authorized" apart from "already consumed".
fn find_authorized_index(session: &GrantSession, normalized_command: &str) -> Option<usize> {
    session.authorized.iter().position(|entry| {
        if entry.is_pattern {
            compile_pattern(&entry.raw)
                .map(|p| p.is_match(normalized_command))
                .unwrap_or(false)
        } else {
            entry.raw == normalized_command
        }
    })
}

/// Execute a command against a grant: normalize, match, verify budget,
/// then consume. Returns the normalized command for the executor.
pub fn execute(
    session: &mut GrantSession,
    raw_command: &str,
    now: DateTime<Utc>,
) -> Result<String, GrantError> {
    if !session.is_usable_at(now) {
        return Err(GrantError::NotUsable);
    }
    let argv = parse_argv(raw_command)?;
    let normalized = normalize_argv(&argv).join(" ");

    let idx = find_authorized_index(session, &normalized).ok_or(GrantError::NotAuthorized)?;

    if session.authorized[idx].consumed {
        return Err(GrantError::AlreadyConsumed);
    }
    if session.executions_used >= session.max_executions {
        tracing::warn!(grant_id = %session.grant_id, "grant execution budget exhausted");
        return Err(GrantError::BudgetExhausted);
    }

    session.executions_used += 1;
    if !session.allow_repeat {
        session.authorized[idx].consumed = true;
    }

    Ok(normalized)
}
