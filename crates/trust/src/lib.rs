//! bouncer_trust
//!
//! Trust Session Manager (§4.5): a bounded auto-approval budget a source
//! can spend against without a human in the loop, as long as the command
//! itself stays inside the trust-eligible set. The manager never
//! auto-approves on its own authority -- `check_and_consume` only tells
//! the pipeline whether budget allowed it; classification/compliance
//! still gate eligibility up front.

use bouncer_classify::compliance::ComplianceOutcome;
use bouncer_classify::Classification;
use bouncer_common::opaque_id;
use bouncer_model::{TrustBudgetKind, TrustSession, TrustSessionStatus};
use bouncer_store::{TrustStore, TrustStoreError};
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

pub const TRUST_ID_ENTROPY_BYTES: usize = 24;

/// Services that can never be covered by a trust session, independent of
/// per-command classification -- these carry their own BLOCKED rules in
/// the classifier, but a trust session predates any single command so
/// the exclusion is re-checked here defensively (§4.5, §9).
const TRUST_EXCLUDED_SERVICES: &[&str] = &[
    "iam",
    "secretsmanager",
    "kms",
    "organizations",
    "cloudtrail",
    "cloudformation",
];

#[derive(Debug, Error)]
pub enum TrustError {
    #[error(transparent)]
    Store(#[from] TrustStoreError),
}

/// Whether a single already-classified command is eligible to be
/// auto-approved under a trust session at all, before budget is even
/// checked. DANGEROUS commands, excluded services, and anything that
/// forces a manual compliance review are never trust-eligible.
pub fn is_trust_eligible(
    classification: Classification,
    service: &str,
    compliance: &ComplianceOutcome,
) -> bool {
    if classification != Classification::Safelist && classification != Classification::Approval {
        return false;
    }
    if TRUST_EXCLUDED_SERVICES.contains(&service) {
        return false;
    }
    !compliance.forces_manual()
}

pub struct TrustManager<S: TrustStore> {
    store: S,
}

impl<S: TrustStore> TrustManager<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub async fn begin(
        &self,
        trust_scope: String,
        account_id: String,
        now: DateTime<Utc>,
        ttl: Duration,
        commands_max: u64,
        uploads_max: u64,
        bytes_max: u64,
    ) -> Result<TrustSession, TrustError> {
        if let Some(existing) = self.store.find_active(&trust_scope, &account_id).await? {
            tracing::debug!(trust_id = %existing.trust_id, trust_scope = %trust_scope, "reusing active trust session");
            return Ok(existing);
        }

        let session = TrustSession {
            trust_id: opaque_id("trust", TRUST_ID_ENTROPY_BYTES),
            trust_scope,
            account_id,
            status: TrustSessionStatus::Active,
            created_at: now,
            expires_at: now + ttl,
            commands_used: 0,
            commands_max,
            uploads_used: 0,
            uploads_max,
            bytes_used: 0,
            bytes_max,
        };
        self.store.begin(session.clone()).await?;
        tracing::debug!(trust_id = %session.trust_id, trust_scope = %session.trust_scope, "trust session begun");
        Ok(session)
    }

    /// Eligibility-then-budget check for one command against a trust
    /// session. Returns `true` only if the command is trust-eligible AND
    /// the atomic store consumption succeeded.
    pub async fn try_auto_approve(
        &self,
        trust_id: &str,
        classification: Classification,
        service: &str,
        compliance: &ComplianceOutcome,
        now: DateTime<Utc>,
    ) -> Result<bool, TrustError> {
        if !is_trust_eligible(classification, service, compliance) {
            return Ok(false);
        }
        let consumed = self
            .store
            .check_and_consume(trust_id, TrustBudgetKind::Commands, 1, now)
            .await?;
        Ok(consumed)
    }

    pub async fn try_consume_upload(
        &self,
        trust_id: &str,
        bytes: u64,
        now: DateTime<Utc>,
    ) -> Result<bool, TrustError> {
        let uploads_ok = self
            .store
            .check_and_consume(trust_id, TrustBudgetKind::Uploads, 1, now)
            .await?;
        if !uploads_ok {
            return Ok(false);
        }
        let bytes_ok = self
            .store
            .check_and_consume(trust_id, TrustBudgetKind::Bytes, bytes, now)
            .await?;
        Ok(bytes_ok)
    }

    pub async fn revoke(&self, trust_id: &str) -> Result<(), TrustError> {
        tracing::debug!(trust_id = %trust_id, "revoking trust session");
        self.store.revoke(trust_id).await.map_err(TrustError::from)
    }

    pub async fn get(&self, trust_id: &str) -> Result<Option<TrustSession>, TrustError> {
        Ok(self.store.get(trust_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bouncer_classify::compliance::{check_compliance, ComplianceRuleSet};
    use bouncer_store::InMemoryTrustStore;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn excluded_service_is_never_trust_eligible() {
        let argv: Vec<String> = "aws iam list-users".split_whitespace().map(String::from).collect();
        let compliance = check_compliance(&argv, None, &ComplianceRuleSet::default());
        assert!(!is_trust_eligible(Classification::Safelist, "iam", &compliance));
    }

    #[test]
    fn dangerous_classification_is_never_trust_eligible() {
        let argv: Vec<String> = "aws ec2 terminate-instances --instance-ids i-1"
            .split_whitespace()
            .map(String::from)
            .collect();
        let compliance = check_compliance(&argv, None, &ComplianceRuleSet::default());
        assert!(!is_trust_eligible(Classification::Dangerous, "ec2", &compliance));
    }

    #[tokio::test]
    async fn begin_then_auto_approve_consumes_budget() {
        let manager = TrustManager::new(InMemoryTrustStore::new());
        let session = manager
            .begin("bot-a".into(), "acct".into(), t(0), Duration::minutes(10), 2, 0, 0)
            .await
            .unwrap();

        let argv: Vec<String> = "aws s3 ls".split_whitespace().map(String::from).collect();
        let compliance = check_compliance(&argv, None, &ComplianceRuleSet::default());

        assert!(manager
            .try_auto_approve(&session.trust_id, Classification::Safelist, "s3", &compliance, t(1))
            .await
            .unwrap());
        assert!(manager
            .try_auto_approve(&session.trust_id, Classification::Safelist, "s3", &compliance, t(2))
            .await
            .unwrap());
        assert!(!manager
            .try_auto_approve(&session.trust_id, Classification::Safelist, "s3", &compliance, t(3))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn revoked_session_never_auto_approves() {
        let manager = TrustManager::new(InMemoryTrustStore::new());
        let session = manager
            .begin("bot-a".into(), "acct".into(), t(0), Duration::minutes(10), 5, 0, 0)
            .await
            .unwrap();
        manager.revoke(&session.trust_id).await.unwrap();

        let argv: Vec<String> = "aws s3 ls".split_whitespace().map(String::from).collect();
        let compliance = check_compliance(&argv, None, &ComplianceRuleSet::default());
        assert!(!manager
            .try_auto_approve(&session.trust_id, Classification::Safelist, "s3", &compliance, t(1))
            .await
            .unwrap());
    }
}
