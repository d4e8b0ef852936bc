//! Notifier: the narrow interface between the pipeline/dispatcher and
//! whatever chat surface renders approval cards (§9). Keeping this a
//! trait lets the dispatcher stay ignorant of the concrete chat
//! backend.

use async_trait::async_trait;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notifier transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub channel: String,
    pub text: String,
    pub buttons: Vec<String>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Post a new approval card, returning an opaque message id the
    /// dispatcher stores on the record for later edits.
    async fn send(&self, message: OutgoingMessage) -> Result<String, NotifyError>;
    /// Edit a previously sent card in place (e.g. to show the resolved
    /// status, per §4.9's "already handled" replay rule).
    async fn edit(&self, message_id: &str, message: OutgoingMessage) -> Result<(), NotifyError>;
}

/// Test double that records every call instead of talking to a transport.
#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<OutgoingMessage>>,
    pub edits: Mutex<Vec<(String, OutgoingMessage)>>,
    next_id: Mutex<u64>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, message: OutgoingMessage) -> Result<String, NotifyError> {
        let mut next_id = self.next_id.lock().unwrap();
        *next_id += 1;
        let id = format!("msg-{next_id}");
        self.sent.lock().unwrap().push(message);
        Ok(id)
    }

    async fn edit(&self, message_id: &str, message: OutgoingMessage) -> Result<(), NotifyError> {
        self.edits
            .lock()
            .unwrap()
            .push((message_id.to_string(), message));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_send_and_edit() {
        let notifier = RecordingNotifier::new();
        let id = notifier
            .send(OutgoingMessage {
                channel: "c1".into(),
                text: "approve?".into(),
                buttons: vec!["approve".into(), "deny".into()],
            })
            .await
            .unwrap();
        notifier
            .edit(
                &id,
                OutgoingMessage {
                    channel: "c1".into(),
                    text: "approved".into(),
                    buttons: vec![],
                },
            )
            .await
            .unwrap();
        assert_eq!(notifier.sent.lock().unwrap().len(), 1);
        assert_eq!(notifier.edits.lock().unwrap().len(), 1);
    }
}
