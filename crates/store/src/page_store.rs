//! Page Store (§4.12). Holds command-result pages beyond the first, which
//! are already inlined into the approval card. `GetPage` is the only way
//! to retrieve them; entries past their TTL are treated as gone.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PageStoreError {
    #[error("store io error: {0}")]
    Io(String),
}

#[async_trait]
pub trait PageStore: Send + Sync {
    /// Store `text` under `page_id`, expiring at `expires_at`.
    async fn put(&self, page_id: String, text: String, expires_at: DateTime<Utc>) -> Result<(), PageStoreError>;
    /// Retrieve `page_id` if present and not yet expired as of `now`.
    async fn get(&self, page_id: &str, now: DateTime<Utc>) -> Result<Option<String>, PageStoreError>;
}

#[async_trait]
impl PageStore for std::sync::Arc<dyn PageStore> {
    async fn put(&self, page_id: String, text: String, expires_at: DateTime<Utc>) -> Result<(), PageStoreError> {
        self.as_ref().put(page_id, text, expires_at).await
    }

    async fn get(&self, page_id: &str, now: DateTime<Utc>) -> Result<Option<String>, PageStoreError> {
        self.as_ref().get(page_id, now).await
    }
}

struct StoredPage {
    text: String,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct InMemoryPageStore {
    pages: Mutex<HashMap<String, StoredPage>>,
}

impl InMemoryPageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PageStore for InMemoryPageStore {
    async fn put(&self, page_id: String, text: String, expires_at: DateTime<Utc>) -> Result<(), PageStoreError> {
        self.pages.lock().unwrap().insert(page_id, StoredPage { text, expires_at });
        Ok(())
    }

    async fn get(&self, page_id: &str, now: DateTime<Utc>) -> Result<Option<String>, PageStoreError> {
        let guard = self.pages.lock().unwrap();
        Ok(guard.get(page_id).filter(|p| p.expires_at > now).map(|p| p.text.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[tokio::test]
    async fn stored_page_round_trips_before_expiry() {
        let store = InMemoryPageStore::new();
        store
            .put("req-1:page:2".into(), "rest of the output".into(), t(60))
            .await
            .unwrap();
        assert_eq!(
            store.get("req-1:page:2", t(30)).await.unwrap(),
            Some("rest of the output".into())
        );
    }

    #[tokio::test]
    async fn expired_page_is_gone() {
        let store = InMemoryPageStore::new();
        store.put("req-1:page:2".into(), "late".into(), t(60)).await.unwrap();
        assert_eq!(store.get("req-1:page:2", t(61)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn unknown_page_id_is_none() {
        let store = InMemoryPageStore::new();
        assert_eq!(store.get("req-1:page:9", t(0)).await.unwrap(), None);
    }
}
