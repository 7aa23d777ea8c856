use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use chrono::Utc;
use shared::{
    domain::{ConversationId, UserId},
    protocol::{CreateMessageRequest, MessageRecord},
};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::warn;

use crate::{
    backend::{DisplayResolver, MessageBackend},
    store::MessageStore,
    SessionEvent,
};

#[derive(Debug, Error)]
pub enum SendError {
    #[error("message content must not be empty")]
    EmptyContent,
    #[error("conversation session is closed")]
    SessionClosed,
    /// The backend rejected the write or the network failed. The typed text
    /// is returned so the caller can offer a retry without losing it.
    #[error("failed to deliver message: {source}")]
    Delivery {
        content: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Optimistic send path: the message appears in the timeline immediately and
/// is confirmed or withdrawn once the backend answers. Retrying is always a
/// user decision; the create call is not idempotent, so blind retries could
/// duplicate the message.
pub struct MessageSender {
    conversation_id: ConversationId,
    self_id: UserId,
    backend: Arc<dyn MessageBackend>,
    store: Arc<Mutex<MessageStore>>,
    resolver: Arc<DisplayResolver>,
    events: broadcast::Sender<SessionEvent>,
    closed: Arc<AtomicBool>,
}

impl MessageSender {
    pub fn new(
        conversation_id: ConversationId,
        self_id: UserId,
        backend: Arc<dyn MessageBackend>,
        store: Arc<Mutex<MessageStore>>,
        resolver: Arc<DisplayResolver>,
        events: broadcast::Sender<SessionEvent>,
        closed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            conversation_id,
            self_id,
            backend,
            store,
            resolver,
            events,
            closed,
        }
    }

    pub async fn send(&self, content: &str) -> Result<(), SendError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(SendError::EmptyContent);
        }

        let display = self.resolver.resolve(&self.self_id).await;
        let provisional_id = {
            let mut store = self.store.lock().await;
            store
                .insert_provisional(
                    self.self_id.clone(),
                    content.to_string(),
                    Utc::now(),
                    display.clone(),
                )
                .map_err(|_| SendError::EmptyContent)?
        };
        let _ = self.events.send(SessionEvent::TimelineUpdated);

        let result = self
            .backend
            .create_message(CreateMessageRequest {
                conversation_id: self.conversation_id.clone(),
                sender_id: self.self_id.clone(),
                content: content.to_string(),
            })
            .await;

        // The message was already dispatched; if the view has been torn down
        // in the meantime the outcome is discarded, not applied.
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }

        match result {
            Ok(response) => {
                let record = MessageRecord {
                    id: response.id,
                    conversation_id: self.conversation_id.clone(),
                    sender_id: self.self_id.clone(),
                    content: content.to_string(),
                    created_at: response.created_at,
                };
                let confirm = self
                    .store
                    .lock()
                    .await
                    .confirm(&provisional_id, record, display);
                if let Err(rejection) = confirm {
                    warn!(
                        conversation_id = %self.conversation_id,
                        "send: confirmation rejected by store: {rejection}"
                    );
                }
                let _ = self.events.send(SessionEvent::TimelineUpdated);
                Ok(())
            }
            Err(source) => {
                self.store.lock().await.withdraw(&provisional_id);
                warn!(
                    conversation_id = %self.conversation_id,
                    "send: backend write failed, provisional entry withdrawn: {source}"
                );
                let _ = self.events.send(SessionEvent::TimelineUpdated);
                let _ = self.events.send(SessionEvent::SendFailed {
                    content: content.to_string(),
                });
                Err(SendError::Delivery {
                    content: content.to_string(),
                    source,
                })
            }
        }
    }
}
