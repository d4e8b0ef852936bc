//! bouncer_model
//!
//! The persisted record types that the rest of the gateway operates on:
//! `ApprovalRequest`, `TrustSession`, `GrantSession`, `RateCounter`,
//! `Account`, and `AuditEntry`. Nothing here talks to a store -- these are
//! plain data plus the invariants the store and pipeline must preserve.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DISPLAY_SUMMARY_MAX_CHARS: usize = 100;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("display_summary must be non-empty and at most {max} chars, got {len}")]
    DisplaySummaryInvalid { len: usize, max: usize },
    #[error("expires_at ({expires_at}) must be after created_at ({created_at})")]
    ExpiryNotAfterCreation {
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    },
}

/// One of the seven action kinds an agent may submit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Execute,
    Upload,
    UploadBatch,
    AddAccount,
    RemoveAccount,
    Deploy,
    Grant,
    PresignedAudit,
}

/// Per-kind payload. Immutable once a record is created (§3 invariant b).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionPayload {
    Execute {
        command: String,
    },
    Upload {
        filename: String,
        content_type: String,
    },
    UploadBatch {
        files: Vec<UploadFileSpec>,
    },
    AddAccount {
        account_spec: AccountSpec,
    },
    RemoveAccount {
        account_id: String,
    },
    Deploy {
        project_id: String,
        branch: Option<String>,
    },
    Grant {
        commands: Vec<String>,
    },
    PresignedAudit {
        s3_key: String,
    },
}

impl ActionPayload {
    pub fn kind(&self) -> ActionKind {
        match self {
            ActionPayload::Execute { .. } => ActionKind::Execute,
            ActionPayload::Upload { .. } => ActionKind::Upload,
            ActionPayload::UploadBatch { .. } => ActionKind::UploadBatch,
            ActionPayload::AddAccount { .. } => ActionKind::AddAccount,
            ActionPayload::RemoveAccount { .. } => ActionKind::RemoveAccount,
            ActionPayload::Deploy { .. } => ActionKind::Deploy,
            ActionPayload::Grant { .. } => ActionKind::Grant,
            ActionPayload::PresignedAudit { .. } => ActionKind::PresignedAudit,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadFileSpec {
    pub filename: String,
    pub content_type: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSpec {
    pub account_id: String,
    pub display_name: String,
    pub assume_role: Option<String>,
}

/// Terminal and non-terminal lifecycle states. Once a record leaves
/// `Pending` it never returns (§3 invariant a, §8 property 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Approved,
    Denied,
    AutoApproved,
    TrustAutoApproved,
    GrantAutoApproved,
    Blocked,
    ComplianceRejected,
    RateLimited,
    Expired,
    ExecutedOk,
    ExecutedError,
}

impl RequestStatus {
    /// True once the record can no longer be mutated by a callback.
    pub fn is_terminal(self) -> bool {
        !matches!(self, RequestStatus::Pending)
    }
}

/// How a decision was reached; distinct from `status`, which is the
/// resulting record state. Carried on the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionType {
    SafelistAuto,
    TrustAuto,
    GrantAuto,
    ManualApprove,
    ManualApproveTrust,
    ManualDeny,
    Expired,
}

/// The central record. See module docs for the invariants this type must
/// uphold; the store is the only component permitted to mutate one after
/// creation (via `Transition`), and the pipeline is the only creator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub request_id: String,
    pub payload: ActionPayload,
    pub display_summary: String,
    pub source: String,
    pub trust_scope: Option<String>,
    pub account_id: String,
    pub reason: String,

    pub status: RequestStatus,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub ttl_seconds: i64,

    pub result: Option<String>,
    pub exit_code: Option<i32>,
    pub execution_time_ms: Option<u64>,

    pub message_id: Option<String>,

    pub decision_type: Option<DecisionType>,
    pub approver_id: Option<String>,
    pub latency_ms: Option<u64>,

    pub compliance_findings: Vec<String>,
    pub risk_score: Option<u8>,
    pub risk_hits: Vec<String>,
}

#[allow(clippy::too_many_arguments)]
impl ApprovalRequest {
    /// Construct a new pending record, enforcing the data-model invariants
    /// that must hold for every kind (§8 property 6, §3 invariant c/d).
    pub fn new(
        request_id: String,
        payload: ActionPayload,
        display_summary: String,
        source: String,
        trust_scope: Option<String>,
        account_id: String,
        reason: String,
        created_at: DateTime<Utc>,
        ttl_seconds: i64,
    ) -> Result<Self, ModelError> {
        if display_summary.is_empty() || display_summary.chars().count() > DISPLAY_SUMMARY_MAX_CHARS
        {
            return Err(ModelError::DisplaySummaryInvalid {
                len: display_summary.chars().count(),
                max: DISPLAY_SUMMARY_MAX_CHARS,
            });
        }
        let expires_at = created_at + chrono::Duration::seconds(ttl_seconds);
        if expires_at <= created_at {
            return Err(ModelError::ExpiryNotAfterCreation {
                created_at,
                expires_at,
            });
        }
        Ok(Self {
            request_id,
            payload,
            display_summary,
            source,
            trust_scope,
            account_id,
            reason,
            status: RequestStatus::Pending,
            created_at,
            updated_at: created_at,
            expires_at,
            ttl_seconds,
            result: None,
            exit_code: None,
            execution_time_ms: None,
            message_id: None,
            decision_type: None,
            approver_id: None,
            latency_ms: None,
            compliance_findings: Vec::new(),
            risk_score: None,
            risk_hits: Vec::new(),
        })
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn kind(&self) -> ActionKind {
        self.payload.kind()
    }
}

// ---------------------------------------------------------------------
// Trust sessions
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustSessionStatus {
    Active,
    Expired,
    Revoked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustBudgetKind {
    Commands,
    Uploads,
    Bytes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustSession {
    pub trust_id: String,
    pub trust_scope: String,
    pub account_id: String,
    pub status: TrustSessionStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub commands_used: u64,
    pub commands_max: u64,
    pub uploads_used: u64,
    pub uploads_max: u64,
    pub bytes_used: u64,
    pub bytes_max: u64,
}

impl TrustSession {
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        self.status == TrustSessionStatus::Active && now <= self.expires_at
    }

    /// Remaining budget for `kind`, or 0 if already exhausted.
    pub fn remaining(&self, kind: TrustBudgetKind) -> u64 {
        match kind {
            TrustBudgetKind::Commands => self.commands_max.saturating_sub(self.commands_used),
            TrustBudgetKind::Uploads => self.uploads_max.saturating_sub(self.uploads_used),
            TrustBudgetKind::Bytes => self.bytes_max.saturating_sub(self.bytes_used),
        }
    }

    /// Would consuming `amount` of `kind` stay within budget? Pure check;
    /// the store performs the actual atomic increment.
    pub fn can_consume(&self, kind: TrustBudgetKind, amount: u64) -> bool {
        self.remaining(kind) >= amount
    }
}

// ---------------------------------------------------------------------
// Grant sessions
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantStatus {
    Pending,
    Approved,
    Denied,
    Expired,
    Revoked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizedCommand {
    /// Normalized command string, or a pattern if `is_pattern`.
    pub raw: String,
    pub is_pattern: bool,
    pub consumed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrantSession {
    pub grant_id: String,
    pub source: String,
    pub trust_scope: Option<String>,
    pub account_id: String,
    pub authorized: Vec<AuthorizedCommand>,
    /// DANGEROUS-classified commands from the request that were carved out
    /// and must be approved individually (§4.6).
    pub requires_individual: Vec<String>,
    pub reason: String,
    pub allow_repeat: bool,
    pub ttl_minutes: u32,
    pub max_executions: u32,
    pub executions_used: u32,
    pub status: GrantStatus,
    pub created_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl GrantSession {
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        self.status == GrantStatus::Approved
            && self
                .expires_at
                .map(|exp| now <= exp)
                .unwrap_or(false)
            && self.executions_used < self.max_executions
    }
}

// ---------------------------------------------------------------------
// Rate limiting
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateCounter {
    pub source: String,
    pub window_start: DateTime<Utc>,
    pub count: u64,
}

// ---------------------------------------------------------------------
// Accounts
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensitivityTag {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub account_id: String,
    pub display_name: String,
    pub assume_role: Option<String>,
    pub upload_bucket: Option<String>,
    pub sensitivity: SensitivityTag,
}

// ---------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub request_id: Option<String>,
    pub kind: Option<ActionKind>,
    pub decision_type: Option<DecisionType>,
    pub source: String,
    pub trust_scope: Option<String>,
    pub account_id: Option<String>,
    pub score: Option<u8>,
    pub reasons: Vec<String>,
    pub latency_ms: u64,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn rejects_empty_display_summary() {
        let err = ApprovalRequest::new(
            "r1".into(),
            ActionPayload::Execute {
                command: "aws s3 ls".into(),
            },
            "".into(),
            "bot-a".into(),
            Some("bot-a".into()),
            "acct".into(),
            "because".into(),
            t(0),
            300,
        )
        .unwrap_err();
        assert!(matches!(err, ModelError::DisplaySummaryInvalid { .. }));
    }

    #[test]
    fn rejects_oversized_display_summary() {
        let summary = "x".repeat(DISPLAY_SUMMARY_MAX_CHARS + 1);
        let err = ApprovalRequest::new(
            "r1".into(),
            ActionPayload::Execute {
                command: "aws s3 ls".into(),
            },
            summary,
            "bot-a".into(),
            None,
            "acct".into(),
            "because".into(),
            t(0),
            300,
        )
        .unwrap_err();
        assert!(matches!(err, ModelError::DisplaySummaryInvalid { .. }));
    }

    #[test]
    fn expires_after_created() {
        let req = ApprovalRequest::new(
            "r1".into(),
            ActionPayload::Execute {
                command: "aws s3 ls".into(),
            },
            "aws s3 ls".into(),
            "bot-a".into(),
            None,
            "acct".into(),
            "because".into(),
            t(0),
            300,
        )
        .unwrap();
        assert!(req.expires_at > req.created_at);
        assert_eq!(req.status, RequestStatus::Pending);
    }

    #[test]
    fn trust_budget_consumption_respects_max() {
        let session = TrustSession {
            trust_id: "t1".into(),
            trust_scope: "bot-a".into(),
            account_id: "acct".into(),
            status: TrustSessionStatus::Active,
            created_at: t(0),
            expires_at: t(600),
            commands_used: 20,
            commands_max: 20,
            uploads_used: 0,
            uploads_max: 5,
            bytes_used: 0,
            bytes_max: 100,
        };
        assert!(!session.can_consume(TrustBudgetKind::Commands, 1));
        assert!(session.can_consume(TrustBudgetKind::Uploads, 1));
    }
}
