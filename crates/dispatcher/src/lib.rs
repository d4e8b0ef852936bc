//! bouncer_dispatcher
//!
//! Webhook Dispatcher (§4.9) and the auto-drain procedure that runs when a
//! trust session opens (§4.10). The dispatcher is the only mutator of an
//! `ApprovalRequest` once it exists (§3 "Ownership"): every approver action
//! goes through `Transition`, so at most one callback ever wins a race on a
//! given record (§8 property 1).

use bouncer_audit::{AuditLog, AuditRecord};
use bouncer_classify::{check_compliance, classify, parse_and_normalize};
use bouncer_grant::{apply_approval, ApproverAction};
use bouncer_model::{
    ActionPayload, ApprovalRequest, AuditEntry, DecisionType, GrantSession, GrantStatus,
    RequestStatus, TrustSessionStatus,
};
use bouncer_pipeline::config::AdmissionConfig;
use bouncer_pipeline::paging::{page_id, paginate};
use bouncer_pipeline::ExecutionOutcome;
use bouncer_store::{
    ApprovalStore, ExecError, Executor, ExecutionRequest, GrantStore, GrantStoreError, Notifier,
    OutgoingMessage, PageStore, PageStoreError, RequestPatch, StoreError, TransitionOutcome,
    TrustStore, TrustStoreError,
};
use bouncer_trust::TrustManager;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

/// Auto-drain processes at most this many pending records per trust open
/// (§4.10).
pub const AUTO_DRAIN_BATCH: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackKind {
    CmdApprove,
    CmdApproveTrust,
    CmdDeny,
    DangerousConfirm,
    GrantApproveAll,
    GrantApproveSafe,
    GrantDeny,
    TrustRevoke,
    GrantRevoke,
    AccountAddApprove,
    AccountAddDeny,
    AccountRemoveApprove,
    AccountRemoveDeny,
    DeployApprove,
    DeployDeny,
    UploadApprove,
    UploadApproveTrust,
    UploadDeny,
    UploadBatchApprove,
    UploadBatchApproveTrust,
    UploadBatchDeny,
}

impl CallbackKind {
    fn is_approve_with_trust(self) -> bool {
        matches!(
            self,
            CallbackKind::CmdApproveTrust
                | CallbackKind::UploadApproveTrust
                | CallbackKind::UploadBatchApproveTrust
        )
    }

    fn is_denial(self) -> bool {
        matches!(
            self,
            CallbackKind::CmdDeny
                | CallbackKind::GrantDeny
                | CallbackKind::AccountAddDeny
                | CallbackKind::AccountRemoveDeny
                | CallbackKind::DeployDeny
                | CallbackKind::UploadDeny
                | CallbackKind::UploadBatchDeny
        )
    }
}

/// A parsed callback event (§4.9). `target_id` is a `request_id` for every
/// kind except `grant_*`/`trust_revoke`, which carry a `grant_id`/`trust_id`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Callback {
    pub kind: CallbackKind,
    pub target_id: String,
    pub approver_id: String,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("approval store error: {0}")]
    Store(#[from] StoreError),
    #[error("trust store error: {0}")]
    Trust(#[from] TrustStoreError),
    #[error("grant store error: {0}")]
    Grant(#[from] GrantStoreError),
    #[error("page store error: {0}")]
    Page(#[from] PageStoreError),
}

#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    /// Approver not in the whitelist; no state change (§4.9 rule 1).
    NotAuthorized,
    /// Record already left `pending`; original message is left untouched
    /// (§4.9 rule 2, §8 round-trip property).
    AlreadyHandled,
    /// Record's `expires_at` had already passed; transitioned to `expired`.
    Expired,
    /// Target id did not resolve to a known record/session.
    NotFound,
    Approved {
        request_id: String,
        outcome: ExecutionOutcome,
    },
    Denied {
        request_id: String,
    },
    TrustOpened {
        trust_id: String,
        drained: usize,
    },
    GrantApproved {
        grant_id: String,
    },
    GrantDenied {
        grant_id: String,
    },
    TrustRevoked,
    GrantRevoked,
}

pub struct Dispatcher {
    pub config: AdmissionConfig,
    pub approver_whitelist: HashSet<String>,
    pub trust_ttl_minutes: i64,
    pub trust_max_commands: u64,
    pub trust_max_uploads: u64,
    pub trust_max_bytes: u64,
    pub grant_default_max_executions: u32,
    pub approval_store: Arc<dyn ApprovalStore>,
    pub grant_store: Arc<dyn GrantStore>,
    pub page_store: Arc<dyn PageStore>,
    pub trust: TrustManager<Arc<dyn TrustStore>>,
    pub executor: Arc<dyn Executor>,
    pub notifier: Arc<dyn Notifier>,
    pub audit_log: Arc<dyn AuditLog>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: AdmissionConfig,
        approver_whitelist: HashSet<String>,
        trust_ttl_minutes: i64,
        trust_max_commands: u64,
        trust_max_uploads: u64,
        trust_max_bytes: u64,
        grant_default_max_executions: u32,
        approval_store: Arc<dyn ApprovalStore>,
        grant_store: Arc<dyn GrantStore>,
        page_store: Arc<dyn PageStore>,
        trust_store: Arc<dyn TrustStore>,
        executor: Arc<dyn Executor>,
        notifier: Arc<dyn Notifier>,
        audit_log: Arc<dyn AuditLog>,
    ) -> Self {
        Self {
            config,
            approver_whitelist,
            trust_ttl_minutes,
            trust_max_commands,
            trust_max_uploads,
            trust_max_bytes,
            grant_default_max_executions,
            approval_store,
            grant_store,
            page_store,
            trust: TrustManager::new(trust_store),
            executor,
            notifier,
            audit_log,
        }
    }

    /// Retrieve an overflow result page stashed by `edit_result` (§4.12).
    /// `None` covers both an unknown id and one that has aged past its TTL.
    pub async fn get_page(&self, page_id: &str, now: DateTime<Utc>) -> Result<Option<String>, DispatchError> {
        Ok(self.page_store.get(page_id, now).await?)
    }

    pub async fn handle(
        &self,
        callback: Callback,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, DispatchError> {
        if !self.approver_whitelist.contains(&callback.approver_id) {
            tracing::warn!(approver_id = %callback.approver_id, target_id = %callback.target_id, "callback from unauthorized approver");
            return Ok(DispatchOutcome::NotAuthorized);
        }

        match callback.kind {
            CallbackKind::GrantApproveAll
            | CallbackKind::GrantApproveSafe
            | CallbackKind::GrantDeny => self.handle_grant_decision(callback, now).await,
            CallbackKind::GrantRevoke => {
                self.handle_grant_revoke(&callback.target_id, now).await
            }
            CallbackKind::TrustRevoke => {
                self.handle_trust_revoke(&callback.target_id, now).await
            }
            _ => self.handle_request_callback(callback, now).await,
        }
    }

    async fn handle_request_callback(
        &self,
        callback: Callback,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, DispatchError> {
        let record = match self.approval_store.get(&callback.target_id).await? {
            Some(r) => r,
            None => return Ok(DispatchOutcome::NotFound),
        };

        if record.status != RequestStatus::Pending {
            tracing::debug!(request_id = %record.request_id, status = ?record.status, "callback arrived after record already left pending");
            self.toast_already_handled(&record, &callback).await;
            return Ok(DispatchOutcome::AlreadyHandled);
        }

        if record.is_expired_at(now) {
            let (outcome, _) = self
                .approval_store
                .transition(
                    &record.request_id,
                    RequestStatus::Pending,
                    now,
                    RequestPatch {
                        status: Some(RequestStatus::Expired),
                        ..Default::default()
                    },
                )
                .await?;
            if outcome == TransitionOutcome::Applied {
                tracing::debug!(request_id = %record.request_id, "request expired before a callback resolved it");
                self.audit(&record, Some(DecisionType::Expired), "expired", now).await;
            }
            return Ok(DispatchOutcome::Expired);
        }

        if callback.kind.is_denial() {
            let (outcome, _) = self
                .approval_store
                .transition(
                    &record.request_id,
                    RequestStatus::Pending,
                    now,
                    RequestPatch {
                        status: Some(RequestStatus::Denied),
                        decision_type: Some(DecisionType::ManualDeny),
                        approver_id: Some(callback.approver_id.clone()),
                        ..Default::default()
                    },
                )
                .await?;
            if outcome == TransitionOutcome::Conflict {
                return Ok(DispatchOutcome::AlreadyHandled);
            }
            tracing::debug!(request_id = %record.request_id, approver_id = %callback.approver_id, "request denied");
            self.audit(&record, Some(DecisionType::ManualDeny), "denied", now)
                .await;
            self.edit_denied(&record).await;
            return Ok(DispatchOutcome::Denied {
                request_id: record.request_id,
            });
        }

        let target_status = if callback.kind.is_approve_with_trust() {
            RequestStatus::TrustAutoApproved
        } else {
            RequestStatus::Approved
        };
        let decision_type = if callback.kind.is_approve_with_trust() {
            DecisionType::ManualApproveTrust
        } else {
            DecisionType::ManualApprove
        };

        let (outcome, _) = self
            .approval_store
            .transition(
                &record.request_id,
                RequestStatus::Pending,
                now,
                RequestPatch {
                    status: Some(target_status),
                    decision_type: Some(decision_type),
                    approver_id: Some(callback.approver_id.clone()),
                    ..Default::default()
                },
            )
            .await?;
        if outcome == TransitionOutcome::Conflict {
            return Ok(DispatchOutcome::AlreadyHandled);
        }

        let exec_outcome = self.execute_record(&record).await;
        self.finish_execution(&record, target_status, &exec_outcome, now)
            .await?;
        tracing::debug!(request_id = %record.request_id, approver_id = %callback.approver_id, "request approved");
        self.audit(&record, Some(decision_type), "approved", now).await;

        if callback.kind.is_approve_with_trust() {
            if let Some(trust_scope) = &record.trust_scope {
                let session = self
                    .trust
                    .begin(
                        trust_scope.clone(),
                        record.account_id.clone(),
                        now,
                        Duration::minutes(self.trust_ttl_minutes),
                        self.trust_max_commands,
                        self.trust_max_uploads,
                        self.trust_max_bytes,
                    )
                    .await
                    .map_err(|e| StoreError::Io(e.to_string()))?;
                let drained = self
                    .auto_drain(trust_scope, &record.account_id, &session.trust_id, now)
                    .await?;
                tracing::debug!(trust_id = %session.trust_id, trust_scope = %trust_scope, drained, "trust session opened, auto-drain complete");
                return Ok(DispatchOutcome::TrustOpened {
                    trust_id: session.trust_id,
                    drained,
                });
            }
        }

        Ok(DispatchOutcome::Approved {
            request_id: record.request_id,
            outcome: exec_outcome,
        })
    }

    /// Auto-drain (§4.10): after a trust session opens, sweep pending
    /// records scoped to the same `(trust_scope, account_id)`, oldest
    /// first, up to `AUTO_DRAIN_BATCH`. Each record is independently
    /// atomic; a failure at any check simply leaves it pending.
    async fn auto_drain(
        &self,
        trust_scope: &str,
        account_id: &str,
        trust_id: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, DispatchError> {
        let candidates = self.approval_store.list_pending(None, 10_000).await?;
        let mut drained = 0usize;
        for record in candidates
            .into_iter()
            .filter(|r| r.trust_scope.as_deref() == Some(trust_scope))
            .filter(|r| r.account_id == account_id)
            .take(AUTO_DRAIN_BATCH)
        {
            let command = match &record.payload {
                ActionPayload::Execute { command } => command.clone(),
                _ => continue,
            };

            let argv = match parse_and_normalize(&command) {
                Ok(argv) => argv,
                Err(_) => {
                    let _ = self
                        .approval_store
                        .transition(
                            &record.request_id,
                            RequestStatus::Pending,
                            now,
                            RequestPatch {
                                status: Some(RequestStatus::ComplianceRejected),
                                ..Default::default()
                            },
                        )
                        .await;
                    continue;
                }
            };
            let classification = classify(&argv, &self.config.classifier);
            let compliance = check_compliance(&argv, None, &self.config.compliance);
            if compliance.has_critical() {
                let _ = self
                    .approval_store
                    .transition(
                        &record.request_id,
                        RequestStatus::Pending,
                        now,
                        RequestPatch {
                            status: Some(RequestStatus::ComplianceRejected),
                            compliance_findings: Some(
                                compliance.findings.iter().map(|f| f.rule_id.clone()).collect(),
                            ),
                            ..Default::default()
                        },
                    )
                    .await;
                continue;
            }
            if compliance.forces_manual() {
                continue;
            }

            let consumed = self
                .trust
                .try_auto_approve(
                    trust_id,
                    classification.classification,
                    &classification.service,
                    &compliance,
                    now,
                )
                .await
                .map_err(|e| StoreError::Io(e.to_string()))?;
            if !consumed {
                continue;
            }

            let outcome = self.run_executor(&record, &command).await;
            let (transition, _) = self
                .approval_store
                .transition(
                    &record.request_id,
                    RequestStatus::Pending,
                    now,
                    RequestPatch {
                        status: Some(RequestStatus::TrustAutoApproved),
                        decision_type: Some(DecisionType::TrustAuto),
                        result: Some(truncate(&outcome.stdout, self.config.result_truncate_chars)),
                        exit_code: Some(outcome.exit_code),
                        execution_time_ms: Some(outcome.execution_time_ms),
                        ..Default::default()
                    },
                )
                .await?;
            if transition == TransitionOutcome::Applied {
                drained += 1;
                self.edit_result(&record, &outcome, now).await;
            }
        }
        tracing::debug!(trust_scope = %trust_scope, account_id = %account_id, drained, "auto-drain swept pending requests");
        Ok(drained)
    }

    async fn handle_grant_decision(
        &self,
        callback: Callback,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, DispatchError> {
        let grant_id = callback.target_id.clone();
        let action = match callback.kind {
            CallbackKind::GrantApproveAll => ApproverAction::ApproveAll,
            CallbackKind::GrantApproveSafe => ApproverAction::ApproveSafeOnly,
            CallbackKind::GrantDeny => ApproverAction::Deny,
            _ => unreachable!(),
        };
        let Some(existing) = self.grant_store.get(&grant_id).await? else {
            return Ok(DispatchOutcome::NotFound);
        };
        if existing.status != GrantStatus::Pending {
            return Ok(DispatchOutcome::AlreadyHandled);
        }

        let max_executions = self.grant_default_max_executions;
        let result = self
            .grant_store
            .update(
                &grant_id,
                Box::new(move |session: &mut GrantSession| {
                    apply_approval(session, action, now, max_executions)
                        .map_err(|e| GrantStoreError::Io(e.to_string()))
                }),
            )
            .await?;

        self.audit_raw(
            &result.source,
            Some(&result.account_id),
            result.trust_scope.as_deref(),
            "grant_decision",
            now,
        );
        match result.status {
            GrantStatus::Denied => {
                tracing::debug!(grant_id = %grant_id, "grant denied");
                Ok(DispatchOutcome::GrantDenied { grant_id })
            }
            _ => {
                tracing::debug!(grant_id = %grant_id, "grant approved");
                Ok(DispatchOutcome::GrantApproved { grant_id })
            }
        }
    }

    async fn handle_grant_revoke(
        &self,
        grant_id: &str,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, DispatchError> {
        let grant_id = grant_id.to_string();
        let result = self
            .grant_store
            .update(
                &grant_id,
                Box::new(|session: &mut GrantSession| {
                    session.status = GrantStatus::Revoked;
                    Ok(())
                }),
            )
            .await;
        match result {
            Ok(session) => {
                self.audit_raw(
                    &session.source,
                    Some(&session.account_id),
                    session.trust_scope.as_deref(),
                    "grant_revoked",
                    now,
                );
                tracing::debug!(grant_id = %grant_id, "grant revoked");
                Ok(DispatchOutcome::GrantRevoked)
            }
            Err(GrantStoreError::NotFound) => Ok(DispatchOutcome::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    async fn handle_trust_revoke(
        &self,
        trust_id: &str,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, DispatchError> {
        let session_before = match self.trust.get(trust_id).await {
            Ok(session) => session,
            Err(bouncer_trust::TrustError::Store(e)) => return Err(e.into()),
        };
        match self.trust.revoke(trust_id).await {
            Ok(()) => {
                if let Some(session) = session_before {
                    self.audit_raw(
                        &session.trust_scope,
                        Some(&session.account_id),
                        None,
                        "trust_revoked",
                        now,
                    );
                }
                tracing::debug!(trust_id = %trust_id, "trust session revoked");
                Ok(DispatchOutcome::TrustRevoked)
            }
            Err(bouncer_trust::TrustError::Store(TrustStoreError::NotFound)) => {
                Ok(DispatchOutcome::NotFound)
            }
            Err(bouncer_trust::TrustError::Store(e)) => Err(e.into()),
        }
    }

    /// Execute the command carried by an `ApprovalRequest`; non-`execute`
    /// kinds have no generic executor contract (upload/deploy/account
    /// actions are fulfilled by the external collaborators named in §1) and
    /// simply produce an empty, successful outcome.
    async fn execute_record(&self, record: &ApprovalRequest) -> ExecutionOutcome {
        match &record.payload {
            ActionPayload::Execute { command } => self.run_executor(record, command).await,
            _ => ExecutionOutcome {
                stdout: String::new(),
                exit_code: 0,
                execution_time_ms: 0,
            },
        }
    }

    async fn run_executor(&self, record: &ApprovalRequest, command: &str) -> ExecutionOutcome {
        let result = self
            .executor
            .execute(ExecutionRequest {
                command: command.to_string(),
                account_id: record.account_id.clone(),
            })
            .await;
        match result {
            Ok(r) => ExecutionOutcome {
                stdout: r.stdout,
                exit_code: r.exit_code,
                execution_time_ms: r.execution_time_ms,
            },
            Err(ExecError::Transport(msg)) => ExecutionOutcome {
                stdout: msg,
                exit_code: -1,
                execution_time_ms: 0,
            },
        }
    }

    /// Record the executor's result against the status the approve branch
    /// just transitioned the record to (`from_status`), so this second
    /// transition lands on the correct edge of the state machine instead of
    /// the pre-approval `pending` the in-memory `record` snapshot still
    /// carries.
    async fn finish_execution(
        &self,
        record: &ApprovalRequest,
        from_status: RequestStatus,
        outcome: &ExecutionOutcome,
        now: DateTime<Utc>,
    ) -> Result<(), DispatchError> {
        let status = if outcome.exit_code == 0 {
            RequestStatus::ExecutedOk
        } else {
            RequestStatus::ExecutedError
        };
        self.approval_store
            .transition(
                &record.request_id,
                from_status,
                now,
                RequestPatch {
                    status: Some(status),
                    result: Some(truncate(&outcome.stdout, self.config.result_truncate_chars)),
                    exit_code: Some(outcome.exit_code),
                    execution_time_ms: Some(outcome.execution_time_ms),
                    ..Default::default()
                },
            )
            .await?;
        self.edit_result(record, outcome, now).await;
        Ok(())
    }

    /// Edit the approval card in place with the (possibly truncated) first
    /// page of output. Pages beyond the first are stashed in `page_store`
    /// under `page_id(request_id, k)`, retrievable via `GetPage` until they
    /// age past `config.page_ttl` (§4.12).
    async fn edit_result(&self, record: &ApprovalRequest, outcome: &ExecutionOutcome, now: DateTime<Utc>) {
        let paged = paginate(&record.request_id, &outcome.stdout, self.config.page_size_chars);
        if paged.next_page_id.is_some() {
            let expires_at = now + self.config.page_ttl;
            for (offset, page) in paged.pages.iter().enumerate().skip(1) {
                let id = page_id(&record.request_id, offset + 1);
                if let Err(e) = self.page_store.put(id, page.clone(), expires_at).await {
                    tracing::warn!(request_id = %record.request_id, error = %e, "failed to stash overflow result page");
                }
            }
        }

        let Some(message_id) = &record.message_id else {
            return;
        };
        let text = format!(
            "{}\n\nexit_code={}\n{}",
            bouncer_common::escape_markup_text(&record.display_summary),
            outcome.exit_code,
            paged.first_page,
        );
        let message = OutgoingMessage {
            channel: record.source.clone(),
            text,
            buttons: Vec::new(),
        };
        let _ = self.notifier.edit(message_id, message).await;
    }

    async fn edit_denied(&self, record: &ApprovalRequest) {
        let Some(message_id) = &record.message_id else {
            return;
        };
        let message = OutgoingMessage {
            channel: record.source.clone(),
            text: format!(
                "{}\n\ndenied",
                bouncer_common::escape_markup_text(&record.display_summary)
            ),
            buttons: Vec::new(),
        };
        let _ = self.notifier.edit(message_id, message).await;
    }

    async fn toast_already_handled(&self, _record: &ApprovalRequest, _callback: &Callback) {
        // The original message is left intact (§4.9 rule 2); only a toast
        // would be sent on a real chat transport, which is out of scope
        // here (the `Notifier` contract has no toast primitive).
    }

    async fn audit(
        &self,
        record: &ApprovalRequest,
        decision_type: Option<DecisionType>,
        reason: &str,
        now: DateTime<Utc>,
    ) {
        let entry = AuditEntry {
            request_id: Some(record.request_id.clone()),
            kind: Some(record.kind()),
            decision_type,
            source: record.source.clone(),
            trust_scope: record.trust_scope.clone(),
            account_id: Some(record.account_id.clone()),
            score: record.risk_score,
            reasons: vec![reason.to_string()],
            latency_ms: 0,
            at: now,
        };
        let _: Result<AuditRecord, _> = self.audit_log.record(entry);
    }

    /// Audit an approver action that has no `ApprovalRequest` of its own
    /// (grant/trust session decisions).
    fn audit_raw(
        &self,
        source: &str,
        account_id: Option<&str>,
        trust_scope: Option<&str>,
        reason: &str,
        now: DateTime<Utc>,
    ) {
        let entry = AuditEntry {
            request_id: None,
            kind: None,
            decision_type: None,
            source: source.to_string(),
            trust_scope: trust_scope.map(String::from),
            account_id: account_id.map(String::from),
            score: None,
            reasons: vec![reason.to_string()],
            latency_ms: 0,
            at: now,
        };
        let _: Result<AuditRecord, _> = self.audit_log.record(entry);
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    bouncer_common::truncate_chars(text, max_chars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bouncer_audit::MemoryAuditLog;
    use bouncer_store::{
        FakeExecutor, InMemoryApprovalStore, InMemoryGrantStore, InMemoryPageStore,
        InMemoryTrustStore, RecordingNotifier,
    };

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn dispatcher() -> Dispatcher {
        let mut whitelist = HashSet::new();
        whitelist.insert("alice".to_string());
        Dispatcher::new(
            AdmissionConfig::default(),
            whitelist,
            10,
            20,
            5,
            20 * 1024 * 1024,
            50,
            Arc::new(InMemoryApprovalStore::new()),
            Arc::new(InMemoryGrantStore::new()),
            Arc::new(InMemoryPageStore::new()),
            Arc::new(InMemoryTrustStore::new()),
            Arc::new(FakeExecutor::ok("ok")),
            Arc::new(RecordingNotifier::new()),
            Arc::new(MemoryAuditLog::new()),
        )
    }

    async fn pending_record(
        dispatcher: &Dispatcher,
        command: &str,
        trust_scope: Option<&str>,
    ) -> ApprovalRequest {
        let record = ApprovalRequest::new(
            bouncer_common::opaque_id("req", 18),
            ActionPayload::Execute { command: command.to_string() },
            command.to_string(),
            "bot-a".into(),
            trust_scope.map(String::from),
            "acct".into(),
            "because".into(),
            t(0),
            300,
        )
        .unwrap();
        dispatcher.approval_store.put(record.clone()).await.unwrap();
        record
    }

    #[tokio::test]
    async fn unauthorized_approver_makes_no_change() {
        let d = dispatcher();
        let record = pending_record(&d, "aws ec2 start-instances --instance-ids i-1", Some("bot-a")).await;
        let outcome = d
            .handle(
                Callback {
                    kind: CallbackKind::CmdApprove,
                    target_id: record.request_id.clone(),
                    approver_id: "mallory".into(),
                },
                t(1),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::NotAuthorized));
        let stored = d.approval_store.get(&record.request_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RequestStatus::Pending);
    }

    #[tokio::test]
    async fn approve_executes_and_replay_is_already_handled() {
        let d = dispatcher();
        let record = pending_record(&d, "aws ec2 start-instances --instance-ids i-1", None).await;
        let cb = Callback {
            kind: CallbackKind::CmdApprove,
            target_id: record.request_id.clone(),
            approver_id: "alice".into(),
        };
        let outcome = d.handle(cb.clone(), t(1)).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Approved { .. }));

        let replay = d.handle(cb, t(2)).await.unwrap();
        assert!(matches!(replay, DispatchOutcome::AlreadyHandled));
    }

    #[tokio::test]
    async fn deny_then_approve_stays_denied() {
        let d = dispatcher();
        let record = pending_record(&d, "aws ec2 start-instances --instance-ids i-1", None).await;
        d.handle(
            Callback {
                kind: CallbackKind::CmdDeny,
                target_id: record.request_id.clone(),
                approver_id: "alice".into(),
            },
            t(1),
        )
        .await
        .unwrap();

        let outcome = d
            .handle(
                Callback {
                    kind: CallbackKind::CmdApprove,
                    target_id: record.request_id.clone(),
                    approver_id: "alice".into(),
                },
                t(2),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::AlreadyHandled));
        let stored = d.approval_store.get(&record.request_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RequestStatus::Denied);
    }

    #[tokio::test]
    async fn expired_record_transitions_to_expired() {
        let d = dispatcher();
        let record = pending_record(&d, "aws ec2 start-instances --instance-ids i-1", None).await;
        let outcome = d
            .handle(
                Callback {
                    kind: CallbackKind::CmdApprove,
                    target_id: record.request_id.clone(),
                    approver_id: "alice".into(),
                },
                t(10_000),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Expired));
    }

    #[tokio::test]
    async fn approve_trust_opens_session_and_drains_pending() {
        let d = dispatcher();
        let r1 = pending_record(&d, "aws ec2 start-instances --instance-ids i-1", Some("bot-a")).await;
        let r2 = pending_record(&d, "aws ec2 start-instances --instance-ids i-2", Some("bot-a")).await;

        let outcome = d
            .handle(
                Callback {
                    kind: CallbackKind::CmdApproveTrust,
                    target_id: r1.request_id.clone(),
                    approver_id: "alice".into(),
                },
                t(1),
            )
            .await
            .unwrap();
        let trust_id = match outcome {
            DispatchOutcome::TrustOpened { trust_id, drained } => {
                assert_eq!(drained, 1);
                trust_id
            }
            other => panic!("expected TrustOpened, got {other:?}"),
        };

        let r2_after = d.approval_store.get(&r2.request_id).await.unwrap().unwrap();
        assert_eq!(r2_after.status, RequestStatus::TrustAutoApproved);
        assert_eq!(r2_after.decision_type, Some(DecisionType::TrustAuto));

        let session = d.trust.get(&trust_id).await.unwrap().unwrap();
        assert_eq!(session.commands_used, 1);
        assert_eq!(session.status, TrustSessionStatus::Active);
    }

    #[tokio::test]
    async fn grant_approve_then_revoke() {
        let d = dispatcher();
        let session = bouncer_grant::request_grant(
            bouncer_grant::GrantRequest {
                commands: vec!["aws s3 ls s3://x".into()],
                reason: "batch".into(),
                source: "bot-a".into(),
                trust_scope: None,
                account_id: "acct".into(),
                ttl_minutes: 30,
                allow_repeat: true,
            },
            t(0),
            60,
            &d.config.classifier,
            &d.config.compliance,
        )
        .unwrap();
        d.grant_store.put(session.clone()).await.unwrap();

        let outcome = d
            .handle(
                Callback {
                    kind: CallbackKind::GrantApproveAll,
                    target_id: session.grant_id.clone(),
                    approver_id: "alice".into(),
                },
                t(1),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::GrantApproved { .. }));

        let revoked = d
            .handle(
                Callback {
                    kind: CallbackKind::GrantRevoke,
                    target_id: session.grant_id.clone(),
                    approver_id: "alice".into(),
                },
                t(2),
            )
            .await
            .unwrap();
        assert!(matches!(revoked, DispatchOutcome::GrantRevoked));
        let stored = d.grant_store.get(&session.grant_id).await.unwrap().unwrap();
        assert_eq!(stored.status, GrantStatus::Revoked);
    }

    #[tokio::test]
    async fn grant_approve_safe_only_drops_dangerous_carveouts() {
        let d = dispatcher();
        let session = bouncer_grant::request_grant(
            bouncer_grant::GrantRequest {
                commands: vec![
                    "aws s3 ls s3://x".into(),
                    "aws ec2 terminate-instances --instance-ids i-1".into(),
                ],
                reason: "batch".into(),
                source: "bot-a".into(),
                trust_scope: None,
                account_id: "acct".into(),
                ttl_minutes: 30,
                allow_repeat: true,
            },
            t(0),
            60,
            &d.config.classifier,
            &d.config.compliance,
        )
        .unwrap();
        assert_eq!(session.requires_individual.len(), 1);
        d.grant_store.put(session.clone()).await.unwrap();

        d.handle(
            Callback {
                kind: CallbackKind::GrantApproveSafe,
                target_id: session.grant_id.clone(),
                approver_id: "alice".into(),
            },
            t(1),
        )
        .await
        .unwrap();

        let stored = d.grant_store.get(&session.grant_id).await.unwrap().unwrap();
        assert_eq!(stored.status, GrantStatus::Approved);
        assert!(stored.requires_individual.is_empty());
    }

    #[tokio::test]
    async fn oversized_result_overflow_pages_are_retrievable() {
        let mut config = AdmissionConfig::default();
        config.page_size_chars = 10;
        let mut whitelist = HashSet::new();
        whitelist.insert("alice".to_string());
        let d = Dispatcher::new(
            config,
            whitelist,
            10,
            20,
            5,
            20 * 1024 * 1024,
            50,
            Arc::new(InMemoryApprovalStore::new()),
            Arc::new(InMemoryGrantStore::new()),
            Arc::new(InMemoryPageStore::new()),
            Arc::new(InMemoryTrustStore::new()),
            Arc::new(FakeExecutor::ok("aaaaaaaaaa\nbbbbbbbbbb\ncccccccccc\n")),
            Arc::new(RecordingNotifier::new()),
            Arc::new(MemoryAuditLog::new()),
        );
        let record = pending_record(&d, "aws s3 ls s3://x", None).await;
        let outcome = d
            .handle(
                Callback {
                    kind: CallbackKind::CmdApprove,
                    target_id: record.request_id.clone(),
                    approver_id: "alice".into(),
                },
                t(1),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Approved { .. }));

        let page_id = bouncer_pipeline::paging::page_id(&record.request_id, 2);
        let page = d.get_page(&page_id, t(2)).await.unwrap();
        assert_eq!(page, Some("bbbbbbbbbb\n".to_string()));
    }
}
