use std::sync::Arc;

use shared::{domain::ConversationId, protocol::FeedStatus};
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

use crate::{
    backend::{FeedSignal, PushFeedProvider},
    poller::PollerSwitch,
    receiver::PushReceiver,
    SessionEvent,
};

/// Push-feed health as seen by the rest of the engine. Written only by the
/// supervisor (and by session teardown); everyone else reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Subscribing,
    Healthy,
    Degraded,
    Resubscribing,
}

impl ConnectionState {
    /// Direct mapping from a provider status report.
    pub fn after_feed_status(status: FeedStatus) -> Self {
        match status {
            FeedStatus::Subscribed => Self::Healthy,
            FeedStatus::TimedOut | FeedStatus::Closed | FeedStatus::Error => Self::Degraded,
        }
    }
}

pub struct ConnectionStateCell {
    inner: Mutex<ConnectionState>,
    events: broadcast::Sender<SessionEvent>,
}

impl ConnectionStateCell {
    pub fn new(events: broadcast::Sender<SessionEvent>) -> Self {
        Self {
            inner: Mutex::new(ConnectionState::Disconnected),
            events,
        }
    }

    pub async fn get(&self) -> ConnectionState {
        *self.inner.lock().await
    }

    pub async fn set(&self, next: ConnectionState, reason: &str) {
        let mut state = self.inner.lock().await;
        if *state == next {
            return;
        }
        info!(from = ?*state, to = ?next, reason, "connection state changed");
        *state = next;
        let _ = self.events.send(SessionEvent::ConnectionChanged(next));
    }
}

/// Owns the push-feed lifecycle and decides when fallback polling runs.
///
/// One fresh subscription attempt is made after the first degradation; after
/// that the session stays on polling, which is a fully supported mode. There
/// is deliberately no tight reconnect loop.
pub struct ConnectionSupervisor {
    conversation_id: ConversationId,
    feed: Arc<dyn PushFeedProvider>,
    receiver: PushReceiver,
    state: Arc<ConnectionStateCell>,
    poller: Arc<PollerSwitch>,
}

const RESUBSCRIBE_ATTEMPTS: u8 = 1;

impl ConnectionSupervisor {
    pub fn new(
        conversation_id: ConversationId,
        feed: Arc<dyn PushFeedProvider>,
        receiver: PushReceiver,
        state: Arc<ConnectionStateCell>,
        poller: Arc<PollerSwitch>,
    ) -> Self {
        Self {
            conversation_id,
            feed,
            receiver,
            state,
            poller,
        }
    }

    pub async fn run(self) {
        self.state
            .set(ConnectionState::Subscribing, "conversation opened")
            .await;

        let mut resubscribes_left = RESUBSCRIBE_ATTEMPTS;
        loop {
            let degraded_reason = self.drive_subscription().await;
            self.state.set(ConnectionState::Degraded, degraded_reason).await;
            self.poller.activate().await;

            if resubscribes_left == 0 {
                info!(
                    conversation_id = %self.conversation_id,
                    "push feed unavailable, polling for the rest of this session"
                );
                return;
            }
            resubscribes_left -= 1;
            self.state
                .set(ConnectionState::Resubscribing, "attempting fresh subscription")
                .await;
        }
    }

    /// Drive one subscription until it fails; returns why it degraded.
    async fn drive_subscription(&self) -> &'static str {
        let mut feed = match self.feed.subscribe(&self.conversation_id).await {
            Ok(feed) => feed,
            Err(err) => {
                warn!(
                    conversation_id = %self.conversation_id,
                    "push subscription request failed: {err:#}"
                );
                return "subscription request failed";
            }
        };

        while let Some(signal) = feed.signals.recv().await {
            match signal {
                FeedSignal::Status(status) => {
                    match ConnectionState::after_feed_status(status) {
                        ConnectionState::Healthy => {
                            self.state
                                .set(ConnectionState::Healthy, "subscription acknowledged")
                                .await;
                            self.poller.deactivate().await;
                        }
                        _ => {
                            warn!(
                                conversation_id = %self.conversation_id,
                                ?status,
                                "push feed reported failure"
                            );
                            feed.subscription.close();
                            return "feed reported failure";
                        }
                    }
                }
                FeedSignal::Event(event) => self.receiver.on_event(event).await,
            }
        }

        feed.subscription.close();
        "feed signal channel closed"
    }
}
