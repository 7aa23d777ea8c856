use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::{bail, Result};
use shared::domain::{ConversationId, ProjectId, UserId};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::warn;

pub mod backend;
pub mod config;
pub mod poller;
pub mod receiver;
pub mod sender;
pub mod store;
pub mod supervisor;
pub mod transport;

pub use backend::{
    DisplayResolver, MessageBackend, MissingBackend, MissingProfileDirectory, MissingPushFeed,
    ProfileDirectory, PushFeedProvider,
};
pub use config::{load_settings, SyncSettings};
pub use sender::SendError;
pub use store::{Message, MergeOutcome, MessageStore, StoreRejection};
pub use supervisor::ConnectionState;
pub use transport::{HttpChatBackend, WebSocketPushFeed};

use poller::{FallbackPoller, PollerSwitch};
use receiver::PushReceiver;
use sender::MessageSender;
use supervisor::{ConnectionStateCell, ConnectionSupervisor};

/// Notifications for the conversation view. Transient infrastructure failures
/// are absorbed by the engine and never show up here; only the connection
/// indicator and send failures are the user's business.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    TimelineUpdated,
    ConnectionChanged(ConnectionState),
    SendFailed { content: String },
}

/// Read-mostly context for one project conversation: the project it belongs
/// to and its two participants.
#[derive(Debug, Clone)]
pub struct ConversationContext {
    pub project_id: ProjectId,
    pub participants: [UserId; 2],
}

impl ConversationContext {
    pub fn conversation_id(&self) -> ConversationId {
        ConversationId::from(&self.project_id)
    }
}

/// One live conversation view session.
///
/// Owns the timeline store, the push-feed supervisor and the fallback poller.
/// Exactly one session exists per open conversation; it is discarded on
/// navigation and a new one rebuilds the timeline from a full fetch.
pub struct ConversationSession {
    conversation_id: ConversationId,
    store: Arc<Mutex<MessageStore>>,
    sender: MessageSender,
    connection: Arc<ConnectionStateCell>,
    poller_switch: Arc<PollerSwitch>,
    supervisor_task: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<SessionEvent>,
    closed: Arc<AtomicBool>,
}

impl ConversationSession {
    pub async fn open(
        settings: &SyncSettings,
        context: ConversationContext,
        self_id: UserId,
        message_backend: Arc<dyn MessageBackend>,
        push_feed: Arc<dyn PushFeedProvider>,
        profiles: Arc<dyn ProfileDirectory>,
    ) -> Result<Arc<Self>> {
        if !context.participants.contains(&self_id) {
            bail!(
                "user {self_id} is not a participant of project {} conversation",
                context.project_id
            );
        }

        let conversation_id = context.conversation_id();
        let (events, _) = broadcast::channel(settings.event_buffer.max(16));
        let store = Arc::new(Mutex::new(MessageStore::new(conversation_id.clone())));
        let resolver = Arc::new(DisplayResolver::new(profiles));
        let closed = Arc::new(AtomicBool::new(false));

        // Warm both participants' display metadata; lookups degrade to
        // placeholders anyway, so this never blocks the open path.
        {
            let resolver = Arc::clone(&resolver);
            let participants = context.participants.clone();
            tokio::spawn(async move {
                for participant in &participants {
                    resolver.resolve(participant).await;
                }
            });
        }

        let sender = MessageSender::new(
            conversation_id.clone(),
            self_id,
            Arc::clone(&message_backend),
            Arc::clone(&store),
            Arc::clone(&resolver),
            events.clone(),
            Arc::clone(&closed),
        );
        let poller = Arc::new(FallbackPoller::new(
            conversation_id.clone(),
            message_backend,
            Arc::clone(&resolver),
            Arc::clone(&store),
            events.clone(),
        ));
        let poller_switch = Arc::new(PollerSwitch::new(
            poller,
            settings.poll_interval(),
            Arc::clone(&closed),
        ));
        let connection = Arc::new(ConnectionStateCell::new(events.clone()));

        // Rebuild the timeline from a full fetch; the store does not survive
        // navigation. A failure here is not fatal, live updates and the next
        // poll activation will catch the history up.
        if let Err(err) = poller_switch.poller().tick().await {
            warn!(
                conversation_id = %conversation_id,
                "initial timeline fetch failed: {err:#}"
            );
        }

        let session = Arc::new(Self {
            conversation_id: conversation_id.clone(),
            store: Arc::clone(&store),
            sender,
            connection: Arc::clone(&connection),
            poller_switch: Arc::clone(&poller_switch),
            supervisor_task: Mutex::new(None),
            events: events.clone(),
            closed,
        });

        let supervisor = ConnectionSupervisor::new(
            conversation_id.clone(),
            push_feed,
            PushReceiver::new(conversation_id, store, resolver, events),
            connection,
            poller_switch,
        );
        *session.supervisor_task.lock().await = Some(tokio::spawn(supervisor.run()));

        Ok(session)
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// Current ordered timeline.
    pub async fn snapshot(&self) -> Vec<Message> {
        self.store.lock().await.snapshot()
    }

    /// Optimistic send; on delivery failure the typed content comes back in
    /// the error so the caller can offer a retry.
    pub async fn send_message(&self, content: &str) -> Result<(), SendError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SendError::SessionClosed);
        }
        self.sender.send(content).await
    }

    /// For the optional "live / reconnecting" hint in the view.
    pub async fn connection_indicator(&self) -> ConnectionState {
        self.connection.get().await
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Tear the session down: cancel the subscription and the poll timer.
    /// In-flight sends complete against the backend, but their outcome is
    /// discarded.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.supervisor_task.lock().await.take() {
            task.abort();
        }
        self.poller_switch.deactivate().await;
        self.connection
            .set(ConnectionState::Disconnected, "conversation closed")
            .await;
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
