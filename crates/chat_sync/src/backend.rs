use std::{collections::HashMap, sync::Arc};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, UserId},
    protocol::{CreateMessageRequest, CreateMessageResponse, FeedEvent, FeedStatus, MessageRecord, SenderDisplay},
};
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

/// Write/read path to the message persistence service. The sender writes
/// through the same service the poller reads from, so confirmations and poll
/// batches deduplicate naturally in the store.
#[async_trait]
pub trait MessageBackend: Send + Sync {
    async fn create_message(&self, request: CreateMessageRequest) -> Result<CreateMessageResponse>;

    /// Messages with `created_at > since`, ordered by `created_at` ascending.
    async fn list_messages(
        &self,
        conversation_id: &ConversationId,
        since: DateTime<Utc>,
    ) -> Result<Vec<MessageRecord>>;
}

pub struct MissingBackend;

#[async_trait]
impl MessageBackend for MissingBackend {
    async fn create_message(
        &self,
        request: CreateMessageRequest,
    ) -> Result<CreateMessageResponse> {
        Err(anyhow!(
            "message backend unavailable for conversation {}",
            request.conversation_id
        ))
    }

    async fn list_messages(
        &self,
        conversation_id: &ConversationId,
        _since: DateTime<Utc>,
    ) -> Result<Vec<MessageRecord>> {
        Err(anyhow!(
            "message backend unavailable for conversation {conversation_id}"
        ))
    }
}

/// One signal on an active push feed: either a conversation event or a
/// provider-reported health status.
#[derive(Debug, Clone)]
pub enum FeedSignal {
    Event(FeedEvent),
    Status(FeedStatus),
}

/// Handle to an established subscription; closing it must stop the signal
/// stream and release the underlying transport.
pub trait FeedSubscription: Send {
    fn close(self: Box<Self>);
}

pub struct PushFeed {
    pub signals: mpsc::Receiver<FeedSignal>,
    pub subscription: Box<dyn FeedSubscription>,
}

#[async_trait]
pub trait PushFeedProvider: Send + Sync {
    async fn subscribe(&self, conversation_id: &ConversationId) -> Result<PushFeed>;
}

pub struct MissingPushFeed;

#[async_trait]
impl PushFeedProvider for MissingPushFeed {
    async fn subscribe(&self, conversation_id: &ConversationId) -> Result<PushFeed> {
        Err(anyhow!(
            "push feed provider unavailable for conversation {conversation_id}"
        ))
    }
}

/// Participant profile lookup used to decorate raw records for rendering.
#[async_trait]
pub trait ProfileDirectory: Send + Sync {
    async fn resolve_sender_display(&self, user_id: &UserId) -> Result<SenderDisplay>;
}

pub struct MissingProfileDirectory;

#[async_trait]
impl ProfileDirectory for MissingProfileDirectory {
    async fn resolve_sender_display(&self, user_id: &UserId) -> Result<SenderDisplay> {
        Err(anyhow!("profile directory unavailable for user {user_id}"))
    }
}

/// Caching wrapper around the profile directory. Lookup failures degrade to a
/// placeholder and are not cached, so a recovered directory backfills names
/// on the next resolution.
pub struct DisplayResolver {
    profiles: Arc<dyn ProfileDirectory>,
    cache: Mutex<HashMap<UserId, SenderDisplay>>,
}

impl DisplayResolver {
    pub fn new(profiles: Arc<dyn ProfileDirectory>) -> Self {
        Self {
            profiles,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn resolve(&self, user_id: &UserId) -> SenderDisplay {
        if let Some(hit) = self.cache.lock().await.get(user_id) {
            return hit.clone();
        }
        match self.profiles.resolve_sender_display(user_id).await {
            Ok(display) => {
                self.cache
                    .lock()
                    .await
                    .insert(user_id.clone(), display.clone());
                display
            }
            Err(err) => {
                warn!(user_id = %user_id, "profile lookup failed, using placeholder: {err}");
                SenderDisplay::placeholder()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    struct FlakyDirectory {
        calls: AtomicUsize,
        fail_first: usize,
    }

    #[async_trait]
    impl ProfileDirectory for FlakyDirectory {
        async fn resolve_sender_display(&self, user_id: &UserId) -> Result<SenderDisplay> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(anyhow!("directory offline"));
            }
            Ok(SenderDisplay {
                name: format!("user {user_id}"),
                avatar_url: None,
            })
        }
    }

    #[tokio::test]
    async fn resolver_degrades_to_placeholder_and_recovers() {
        let directory = Arc::new(FlakyDirectory {
            calls: AtomicUsize::new(0),
            fail_first: 1,
        });
        let resolver = DisplayResolver::new(directory.clone());
        let user = UserId::new("u1");

        assert_eq!(resolver.resolve(&user).await, SenderDisplay::placeholder());
        // Failure was not cached; the next lookup hits the directory again.
        assert_eq!(resolver.resolve(&user).await.name, "user u1");
        // And the success is cached.
        resolver.resolve(&user).await;
        assert_eq!(directory.calls.load(Ordering::SeqCst), 2);
    }
}
