//! Grant Session Store (§4.6).
//!
//! Pure mutation logic for a `GrantSession` lives in `bouncer_grant`; this
//! store is just persistence plus the same atomic compare-and-set shape
//! used by `ApprovalStore::transition`, since grant execution consumes
//! budget and must not double-spend under concurrent callers.

use async_trait::async_trait;
use bouncer_model::GrantSession;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GrantStoreError {
    #[error("grant_id already exists")]
    AlreadyExists,
    #[error("grant_id not found")]
    NotFound,
    #[error("store io error: {0}")]
    Io(String),
}

/// Outcome of a boxed in-place mutation passed to `GrantStore::update`.
/// Kept as a plain closure return rather than a generic trait method so
/// `dyn GrantStore` stays object-safe (the pipeline and dispatcher hold
/// stores behind `Arc<dyn ...>`).
pub type GrantMutation<'a> =
    Box<dyn FnOnce(&mut GrantSession) -> Result<(), GrantStoreError> + Send + 'a>;

#[async_trait]
pub trait GrantStore: Send + Sync {
    async fn put(&self, session: GrantSession) -> Result<(), GrantStoreError>;
    async fn get(&self, grant_id: &str) -> Result<Option<GrantSession>, GrantStoreError>;
    /// Apply `mutate` to the stored session under the store's lock, so
    /// concurrent execute/approve calls serialize against each other.
    async fn update(
        &self,
        grant_id: &str,
        mutate: GrantMutation<'_>,
    ) -> Result<GrantSession, GrantStoreError>;
    /// Approved, unexpired grants scoped to `(source, account_id)` -- the
    /// pipeline's Grant stage matches a command against each in turn.
    async fn list_approved_for_scope(
        &self,
        source: &str,
        account_id: &str,
    ) -> Result<Vec<GrantSession>, GrantStoreError>;
}

#[async_trait]
impl GrantStore for std::sync::Arc<dyn GrantStore> {
    async fn put(&self, session: GrantSession) -> Result<(), GrantStoreError> {
        self.as_ref().put(session).await
    }
    async fn get(&self, grant_id: &str) -> Result<Option<GrantSession>, GrantStoreError> {
        self.as_ref().get(grant_id).await
    }
    async fn update(
        &self,
        grant_id: &str,
        mutate: GrantMutation<'_>,
    ) -> Result<GrantSession, GrantStoreError> {
        self.as_ref().update(grant_id, mutate).await
    }
    async fn list_approved_for_scope(
        &self,
        source: &str,
        account_id: &str,
    ) -> Result<Vec<GrantSession>, GrantStoreError> {
        self.as_ref().list_approved_for_scope(source, account_id).await
    }
}

#[derive(Default)]
pub struct InMemoryGrantStore {
    sessions: Mutex<HashMap<String, GrantSession>>,
}

impl InMemoryGrantStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GrantStore for InMemoryGrantStore {
    async fn put(&self, session: GrantSession) -> Result<(), GrantStoreError> {
        let mut guard = self.sessions.lock().unwrap();
        if guard.contains_key(&session.grant_id) {
            return Err(GrantStoreError::AlreadyExists);
        }
        guard.insert(session.grant_id.clone(), session);
        Ok(())
    }

    async fn get(&self, grant_id: &str) -> Result<Option<GrantSession>, GrantStoreError> {
        Ok(self.sessions.lock().unwrap().get(grant_id).cloned())
    }

    async fn update(
        &self,
        grant_id: &str,
        mutate: GrantMutation<'_>,
    ) -> Result<GrantSession, GrantStoreError> {
        let mut guard = self.sessions.lock().unwrap();
        let session = guard.get_mut(grant_id).ok_or(GrantStoreError::NotFound)?;
        mutate(session)?;
        Ok(session.clone())
    }

    async fn list_approved_for_scope(
        &self,
        source: &str,
        account_id: &str,
    ) -> Result<Vec<GrantSession>, GrantStoreError> {
        use bouncer_model::GrantStatus;
        Ok(self
            .sessions
            .lock()
            .unwrap()
            .values()
            .filter(|s| {
                s.source == source && s.account_id == account_id && s.status == GrantStatus::Approved
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bouncer_model::GrantStatus;
    use chrono::{DateTime, Utc};

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn session() -> GrantSession {
        GrantSession {
            grant_id: "g1".into(),
            source: "bot-a".into(),
            trust_scope: None,
            account_id: "acct".into(),
            authorized: vec![],
            requires_individual: vec![],
            reason: "batch".into(),
            allow_repeat: true,
            ttl_minutes: 30,
            max_executions: 5,
            executions_used: 0,
            status: GrantStatus::Pending,
            created_at: t(0),
            approved_at: None,
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn update_mutates_in_place() {
        let store = InMemoryGrantStore::new();
        store.put(session()).await.unwrap();
        let updated = store
            .update(
                "g1",
                Box::new(|s| {
                    s.status = GrantStatus::Approved;
                    s.executions_used += 1;
                    Ok(())
                }),
            )
            .await
            .unwrap();
        assert_eq!(updated.status, GrantStatus::Approved);
        assert_eq!(updated.executions_used, 1);
    }

    #[tokio::test]
    async fn put_fails_on_duplicate_grant_id() {
        let store = InMemoryGrantStore::new();
        store.put(session()).await.unwrap();
        let err = store.put(session()).await.unwrap_err();
        assert!(matches!(err, GrantStoreError::AlreadyExists));
    }
}
