//! Trust Session Store (§4.5).
//!
//! `check_and_consume` is the one operation that must be atomic: it reads
//! remaining budget and debits it in the same critical section, so two
//! concurrent commands against the same trust session can never both pass
//! a budget check that only one of them should have passed (§8 property 2).

use async_trait::async_trait;
use bouncer_model::{TrustBudgetKind, TrustSession, TrustSessionStatus};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrustStoreError {
    #[error("trust session not found")]
    NotFound,
    #[error("trust session is not active")]
    NotActive,
    #[error("store io error: {0}")]
    Io(String),
}

#[async_trait]
pub trait TrustStore: Send + Sync {
    async fn begin(&self, session: TrustSession) -> Result<(), TrustStoreError>;
    async fn get(&self, trust_id: &str) -> Result<Option<TrustSession>, TrustStoreError>;
    /// The active session for `(trust_scope, account_id)`, if any (§3:
    /// at most one active session per pair, §8 property 2).
    async fn find_active(
        &self,
        trust_scope: &str,
        account_id: &str,
    ) -> Result<Option<TrustSession>, TrustStoreError>;
    /// Atomically check that `amount` of `kind` remains, and if so, debit
    /// it. Returns `true` iff the consumption happened.
    async fn check_and_consume(
        &self,
        trust_id: &str,
        kind: TrustBudgetKind,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<bool, TrustStoreError>;
    async fn revoke(&self, trust_id: &str) -> Result<(), TrustStoreError>;
}

#[async_trait]
impl TrustStore for std::sync::Arc<dyn TrustStore> {
    async fn begin(&self, session: TrustSession) -> Result<(), TrustStoreError> {
        self.as_ref().begin(session).await
    }
    async fn get(&self, trust_id: &str) -> Result<Option<TrustSession>, TrustStoreError> {
        self.as_ref().get(trust_id).await
    }
    async fn find_active(
        &self,
        trust_scope: &str,
        account_id: &str,
    ) -> Result<Option<TrustSession>, TrustStoreError> {
        self.as_ref().find_active(trust_scope, account_id).await
    }
    async fn check_and_consume(
        &self,
        trust_id: &str,
        kind: TrustBudgetKind,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<bool, TrustStoreError> {
        self.as_ref().check_and_consume(trust_id, kind, amount, now).await
    }
    async fn revoke(&self, trust_id: &str) -> Result<(), TrustStoreError> {
        self.as_ref().revoke(trust_id).await
    }
}

#[derive(Default)]
pub struct InMemoryTrustStore {
    sessions: Mutex<HashMap<String, TrustSession>>,
}

impl InMemoryTrustStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TrustStore for InMemoryTrustStore {
    async fn begin(&self, session: TrustSession) -> Result<(), TrustStoreError> {
        self.sessions
            .lock()
            .unwrap()
            .insert(session.trust_id.clone(), session);
        Ok(())
    }

    async fn get(&self, trust_id: &str) -> Result<Option<TrustSession>, TrustStoreError> {
        Ok(self.sessions.lock().unwrap().get(trust_id).cloned())
    }

    async fn find_active(
        &self,
        trust_scope: &str,
        account_id: &str,
    ) -> Result<Option<TrustSession>, TrustStoreError> {
        Ok(self
            .sessions
            .lock()
            .unwrap()
            .values()
            .find(|s| {
                s.trust_scope == trust_scope
                    && s.account_id == account_id
                    && s.status == TrustSessionStatus::Active
            })
            .cloned())
    }

    async fn check_and_consume(
        &self,
        trust_id: &str,
        kind: TrustBudgetKind,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<bool, TrustStoreError> {
        let mut guard = self.sessions.lock().unwrap();
        let session = guard.get_mut(trust_id).ok_or(TrustStoreError::NotFound)?;
        if !session.is_usable_at(now) {
            if session.status == TrustSessionStatus::Active && now > session.expires_at {
                session.status = TrustSessionStatus::Expired;
                tracing::debug!(trust_id = %trust_id, "trust session expired on budget check");
            }
            return Ok(false);
        }
        if !session.can_consume(kind, amount) {
            tracing::debug!(trust_id = %trust_id, kind = ?kind, amount, "trust budget exhausted");
            return Ok(false);
        }
        match kind {
            TrustBudgetKind::Commands => session.commands_used += amount,
            TrustBudgetKind::Uploads => session.uploads_used += amount,
            TrustBudgetKind::Bytes => session.bytes_used += amount,
        }
        Ok(true)
    }

    async fn revoke(&self, trust_id: &str) -> Result<(), TrustStoreError> {
        let mut guard = self.sessions.lock().unwrap();
        let session = guard.get_mut(trust_id).ok_or(TrustStoreError::NotFound)?;
        session.status = TrustSessionStatus::Revoked;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn session() -> TrustSession {
        TrustSession {
            trust_id: "t1".into(),
            trust_scope: "bot-a".into(),
            account_id: "acct".into(),
            status: TrustSessionStatus::Active,
            created_at: t(0),
            expires_at: t(600),
            commands_used: 0,
            commands_max: 2,
            uploads_used: 0,
            uploads_max: 0,
            bytes_used: 0,
            bytes_max: 0,
        }
    }

    #[tokio::test]
    async fn consumption_stops_at_budget() {
        let store = InMemoryTrustStore::new();
        store.begin(session()).await.unwrap();
        assert!(store
            .check_and_consume("t1", TrustBudgetKind::Commands, 1, t(1))
            .await
            .unwrap());
        assert!(store
            .check_and_consume("t1", TrustBudgetKind::Commands, 1, t(2))
            .await
            .unwrap());
        assert!(!store
            .check_and_consume("t1", TrustBudgetKind::Commands, 1, t(3))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn expired_session_refuses_consumption() {
        let store = InMemoryTrustStore::new();
        store.begin(session()).await.unwrap();
        assert!(!store
            .check_and_consume("t1", TrustBudgetKind::Commands, 1, t(1000))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn revoked_session_refuses_consumption() {
        let store = InMemoryTrustStore::new();
        store.begin(session()).await.unwrap();
        store.revoke("t1").await.unwrap();
        assert!(!store
            .check_and_consume("t1", TrustBudgetKind::Commands, 1, t(1))
            .await
            .unwrap());
    }
}
