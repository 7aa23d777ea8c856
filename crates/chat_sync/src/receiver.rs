use std::sync::Arc;

use shared::{domain::ConversationId, protocol::FeedEvent};
use tokio::sync::{broadcast, Mutex};
use tracing::{trace, warn};

use crate::{
    backend::DisplayResolver,
    store::{Message, MergeOutcome, MessageStore},
    SessionEvent,
};

/// Applies push-feed events to the store.
///
/// Events from the session's own user are applied like any other: the store's
/// merge rule recognizes the echo of an outstanding provisional entry, which
/// stays correct even when the same user is active on several devices.
pub struct PushReceiver {
    conversation_id: ConversationId,
    store: Arc<Mutex<MessageStore>>,
    resolver: Arc<DisplayResolver>,
    events: broadcast::Sender<SessionEvent>,
}

impl PushReceiver {
    pub fn new(
        conversation_id: ConversationId,
        store: Arc<Mutex<MessageStore>>,
        resolver: Arc<DisplayResolver>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            conversation_id,
            store,
            resolver,
            events,
        }
    }

    pub async fn on_event(&self, event: FeedEvent) {
        match event {
            FeedEvent::MessageCreated { message } => {
                if message.conversation_id != self.conversation_id {
                    trace!(
                        conversation_id = %self.conversation_id,
                        event_conversation_id = %message.conversation_id,
                        "push: ignoring event for another conversation"
                    );
                    return;
                }

                let display = self.resolver.resolve(&message.sender_id).await;
                let outcome = self
                    .store
                    .lock()
                    .await
                    .apply(Message::from_record(message, display));
                match outcome {
                    Ok(MergeOutcome::Duplicate) => {
                        trace!(conversation_id = %self.conversation_id, "push: duplicate event suppressed");
                    }
                    Ok(_) => {
                        let _ = self.events.send(SessionEvent::TimelineUpdated);
                    }
                    Err(rejection) => {
                        warn!(
                            conversation_id = %self.conversation_id,
                            "push: dropped malformed message record: {rejection}"
                        );
                    }
                }
            }
        }
    }
}
