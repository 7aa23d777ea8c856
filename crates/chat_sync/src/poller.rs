use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use shared::domain::ConversationId;
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::{
    backend::{DisplayResolver, MessageBackend},
    store::{Message, MessageStore},
    SessionEvent,
};

/// Pull-based catch-up path, active only while the push feed is unhealthy.
///
/// Each tick fetches records newer than the watermark and merges them through
/// the same store rule the push path uses, so a message delivered by both
/// paths appears exactly once.
pub struct FallbackPoller {
    conversation_id: ConversationId,
    backend: Arc<dyn MessageBackend>,
    resolver: Arc<DisplayResolver>,
    store: Arc<Mutex<MessageStore>>,
    watermark: Mutex<DateTime<Utc>>,
    events: broadcast::Sender<SessionEvent>,
}

impl FallbackPoller {
    pub fn new(
        conversation_id: ConversationId,
        backend: Arc<dyn MessageBackend>,
        resolver: Arc<DisplayResolver>,
        store: Arc<Mutex<MessageStore>>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            conversation_id,
            backend,
            resolver,
            store,
            watermark: Mutex::new(DateTime::<Utc>::UNIX_EPOCH),
            events,
        }
    }

    pub async fn watermark(&self) -> DateTime<Utc> {
        *self.watermark.lock().await
    }

    /// One poll cycle. Fetch errors are absorbed here; they only delay
    /// catch-up until the next tick.
    pub async fn tick(&self) -> Result<()> {
        let since = *self.watermark.lock().await;
        let records = self
            .backend
            .list_messages(&self.conversation_id, since)
            .await
            .with_context(|| {
                format!(
                    "failed to poll messages for conversation {}",
                    self.conversation_id
                )
            })?;

        if records.is_empty() {
            // An equal-timestamp message may still be committing server-side;
            // leaving the watermark untouched retries it next tick.
            return Ok(());
        }

        let latest = records
            .iter()
            .map(|record| record.created_at)
            .max()
            .unwrap_or(since);

        let mut batch = Vec::with_capacity(records.len());
        for record in records {
            let display = self.resolver.resolve(&record.sender_id).await;
            batch.push(Message::from_record(record, display));
        }

        let (report, rejections) = self.store.lock().await.apply_batch(batch);
        for rejection in rejections {
            warn!(
                conversation_id = %self.conversation_id,
                "poll: dropped malformed message record: {rejection}"
            );
        }
        debug!(
            conversation_id = %self.conversation_id,
            applied = report.applied,
            duplicates = report.duplicates,
            "poll cycle merged"
        );
        if report.applied > 0 {
            let _ = self.events.send(SessionEvent::TimelineUpdated);
        }

        let mut watermark = self.watermark.lock().await;
        if latest > *watermark {
            *watermark = latest;
        }
        Ok(())
    }

    async fn run(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = self.tick().await {
                warn!(conversation_id = %self.conversation_id, "poll tick failed: {err:#}");
            }
        }
    }
}

/// Owns the poll timer. Activation spawns the interval task; deactivation
/// aborts it outright so a healthy feed causes no residual fetch traffic.
pub struct PollerSwitch {
    poller: Arc<FallbackPoller>,
    interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
    closed: Arc<AtomicBool>,
}

impl PollerSwitch {
    pub fn new(poller: Arc<FallbackPoller>, interval: Duration, closed: Arc<AtomicBool>) -> Self {
        Self {
            poller,
            interval,
            task: Mutex::new(None),
            closed,
        }
    }

    pub fn poller(&self) -> &Arc<FallbackPoller> {
        &self.poller
    }

    pub async fn activate(&self) {
        let mut slot = self.task.lock().await;
        // Checked under the task lock so a teardown racing with activation
        // cannot leave a timer running.
        if slot.is_some() || self.closed.load(Ordering::SeqCst) {
            return;
        }
        debug!(
            conversation_id = %self.poller.conversation_id,
            interval_ms = self.interval.as_millis() as u64,
            "fallback polling activated"
        );
        let poller = Arc::clone(&self.poller);
        *slot = Some(tokio::spawn(poller.run(self.interval)));
    }

    pub async fn deactivate(&self) {
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
            debug!(
                conversation_id = %self.poller.conversation_id,
                "fallback polling torn down"
            );
        }
    }

    pub async fn is_active(&self) -> bool {
        self.task.lock().await.is_some()
    }
}
