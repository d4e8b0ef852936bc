//! Approval Request Store (§4.8).
//!
//! The store exclusively owns `ApprovalRequest` records. `Put` creates
//! only; `Transition` is the single conditional-update primitive that
//! guarantees at most one approver transition ever succeeds for a given
//! request (§5, §8 property 1). `Scan` is deliberately absent from this
//! trait -- full scans are confined to offline statistics, never the hot
//! path (§4.8).

use async_trait::async_trait;
use bouncer_model::{ApprovalRequest, DecisionType, RequestStatus};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request_id already exists")]
    AlreadyExists,
    #[error("request_id not found")]
    NotFound,
    #[error("store io error: {0}")]
    Io(String),
}

/// Fields a `Transition` may update. `status` is mandatory; everything
/// else is set only when `Some`.
#[derive(Debug, Clone, Default)]
pub struct RequestPatch {
    pub status: Option<RequestStatus>,
    pub result: Option<String>,
    pub exit_code: Option<i32>,
    pub execution_time_ms: Option<u64>,
    pub message_id: Option<String>,
    pub decision_type: Option<DecisionType>,
    pub approver_id: Option<String>,
    pub latency_ms: Option<u64>,
    pub compliance_findings: Option<Vec<String>>,
    pub risk_score: Option<u8>,
    pub risk_hits: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    /// The record had already left `from_status` -- another actor won the
    /// race. Treat as idempotent "already handled" (§4.9 rule 2/4).
    Conflict,
}

#[async_trait]
pub trait ApprovalStore: Send + Sync {
    async fn put(&self, record: ApprovalRequest) -> Result<(), StoreError>;
    async fn get(&self, request_id: &str) -> Result<Option<ApprovalRequest>, StoreError>;
    async fn transition(
        &self,
        request_id: &str,
        from_status: RequestStatus,
        now: DateTime<Utc>,
        patch: RequestPatch,
    ) -> Result<(TransitionOutcome, Option<ApprovalRequest>), StoreError>;
    async fn list_pending(
        &self,
        source: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ApprovalRequest>, StoreError>;
}

#[async_trait]
impl ApprovalStore for std::sync::Arc<dyn ApprovalStore> {
    async fn put(&self, record: ApprovalRequest) -> Result<(), StoreError> {
        self.as_ref().put(record).await
    }
    async fn get(&self, request_id: &str) -> Result<Option<ApprovalRequest>, StoreError> {
        self.as_ref().get(request_id).await
    }
    async fn transition(
        &self,
        request_id: &str,
        from_status: RequestStatus,
        now: DateTime<Utc>,
        patch: RequestPatch,
    ) -> Result<(TransitionOutcome, Option<ApprovalRequest>), StoreError> {
        self.as_ref().transition(request_id, from_status, now, patch).await
    }
    async fn list_pending(
        &self,
        source: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ApprovalRequest>, StoreError> {
        self.as_ref().list_pending(source, limit).await
    }
}

#[derive(Default)]
pub struct InMemoryApprovalStore {
    records: Mutex<HashMap<String, ApprovalRequest>>,
}

impl InMemoryApprovalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ApprovalStore for InMemoryApprovalStore {
    async fn put(&self, record: ApprovalRequest) -> Result<(), StoreError> {
        let mut guard = self.records.lock().unwrap();
        if guard.contains_key(&record.request_id) {
            return Err(StoreError::AlreadyExists);
        }
        guard.insert(record.request_id.clone(), record);
        Ok(())
    }

    async fn get(&self, request_id: &str) -> Result<Option<ApprovalRequest>, StoreError> {
        Ok(self.records.lock().unwrap().get(request_id).cloned())
    }

    async fn transition(
        &self,
        request_id: &str,
        from_status: RequestStatus,
        now: DateTime<Utc>,
        patch: RequestPatch,
    ) -> Result<(TransitionOutcome, Option<ApprovalRequest>), StoreError> {
        let mut guard = self.records.lock().unwrap();
        let record = guard.get_mut(request_id).ok_or(StoreError::NotFound)?;
        if record.status != from_status {
            tracing::debug!(request_id = %request_id, expected = ?from_status, actual = ?record.status, "transition lost the race");
            return Ok((TransitionOutcome::Conflict, Some(record.clone())));
        }
        if let Some(status) = patch.status {
            record.status = status;
        }
        if patch.result.is_some() {
            record.result = patch.result;
        }
        if patch.exit_code.is_some() {
            record.exit_code = patch.exit_code;
        }
        if patch.execution_time_ms.is_some() {
            record.execution_time_ms = patch.execution_time_ms;
        }
        if patch.message_id.is_some() {
            record.message_id = patch.message_id;
        }
        if patch.decision_type.is_some() {
            record.decision_type = patch.decision_type;
        }
        if patch.approver_id.is_some() {
            record.approver_id = patch.approver_id;
        }
        if patch.latency_ms.is_some() {
            record.latency_ms = patch.latency_ms;
        }
        if let Some(findings) = patch.compliance_findings {
            record.compliance_findings = findings;
        }
        if patch.risk_score.is_some() {
            record.risk_score = patch.risk_score;
        }
        if let Some(hits) = patch.risk_hits {
            record.risk_hits = hits;
        }
        record.updated_at = now;
        Ok((TransitionOutcome::Applied, Some(record.clone())))
    }

    async fn list_pending(
        &self,
        source: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ApprovalRequest>, StoreError> {
        let guard = self.records.lock().unwrap();
        let mut pending: Vec<ApprovalRequest> = guard
            .values()
            .filter(|r| r.status == RequestStatus::Pending)
            .filter(|r| source.map(|s| s == r.source).unwrap_or(true))
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.created_at);
        pending.truncate(limit);
        Ok(pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bouncer_model::ActionPayload;

    fn sample(now: DateTime<Utc>) -> ApprovalRequest {
        ApprovalRequest::new(
            "r1".into(),
            ActionPayload::Execute {
                command: "aws s3 ls".into(),
            },
            "aws s3 ls".into(),
            "bot-a".into(),
            Some("bot-a".into()),
            "acct".into(),
            "because".into(),
            now,
            300,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn put_fails_on_duplicate() {
        let store = InMemoryApprovalStore::new();
        let now = Utc::now();
        store.put(sample(now)).await.unwrap();
        let err = store.put(sample(now)).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists));
    }

    #[tokio::test]
    async fn transition_is_conflict_once_left_pending() {
        let store = InMemoryApprovalStore::new();
        let now = Utc::now();
        store.put(sample(now)).await.unwrap();

        let (outcome, _) = store
            .transition(
                "r1",
                RequestStatus::Pending,
                now,
                RequestPatch {
                    status: Some(RequestStatus::Approved),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome, TransitionOutcome::Applied);

        let (outcome2, record) = store
            .transition(
                "r1",
                RequestStatus::Pending,
                now,
                RequestPatch {
                    status: Some(RequestStatus::Denied),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome2, TransitionOutcome::Conflict);
        assert_eq!(record.unwrap().status, RequestStatus::Approved);
    }

    #[tokio::test]
    async fn list_pending_is_ordered_by_created_at() {
        let store = InMemoryApprovalStore::new();
        let t0 = Utc::now();
        let mut r1 = sample(t0);
        r1.request_id = "r1".into();
        let mut r2 = sample(t0 + chrono::Duration::seconds(1));
        r2.request_id = "r2".into();
        store.put(r2).await.unwrap();
        store.put(r1).await.unwrap();
        let pending = store.list_pending(None, 10).await.unwrap();
        assert_eq!(pending[0].request_id, "r1");
        assert_eq!(pending[1].request_id, "r2");
    }
}
