use super::*;
use std::{
    collections::VecDeque,
    sync::atomic::{AtomicBool, AtomicU64},
    time::Duration,
};

use anyhow::anyhow;
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message as AxumWsMessage, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Duration as TimeDelta, Utc};
use shared::{
    error::{ApiError, ErrorCode},
    protocol::{
        CreateMessageRequest, CreateMessageResponse, FeedEvent, FeedStatus, MessageRecord,
        SenderDisplay,
    },
};
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot},
};

use crate::backend::{FeedSignal, FeedSubscription, PushFeed};
use crate::poller::FallbackPoller;

fn conversation() -> ConversationId {
    ConversationId::new("proj-1")
}

fn context() -> ConversationContext {
    ConversationContext {
        project_id: ProjectId::new("proj-1"),
        participants: [UserId::new("alice"), UserId::new("bob")],
    }
}

fn base_time() -> DateTime<Utc> {
    "2025-03-01T10:00:00Z".parse().expect("timestamp")
}

fn test_settings() -> SyncSettings {
    SyncSettings {
        server_url: "http://127.0.0.1:1".into(),
        poll_interval_ms: 50,
        request_timeout_ms: 2_000,
        event_buffer: 64,
    }
}

#[derive(Debug, Clone, Copy)]
enum FeedScript {
    /// Acknowledge the subscription and keep the feed live.
    Ack,
    /// Refuse the subscription request outright.
    Deny,
    /// Deliver a status report instead of an acknowledgment.
    Status(FeedStatus),
}

struct NoopSubscription;

impl FeedSubscription for NoopSubscription {
    fn close(self: Box<Self>) {}
}

/// In-memory stand-in for the persistence service, the profile service and
/// the push provider at once, so two sessions can talk through it like they
/// would through the real backend.
struct InMemoryChatService {
    records: Mutex<Vec<MessageRecord>>,
    next_id: AtomicU64,
    fail_create: AtomicBool,
    hold_create: Mutex<Option<oneshot::Receiver<()>>>,
    feed_script: Mutex<VecDeque<FeedScript>>,
    feed_senders: Mutex<Vec<mpsc::Sender<FeedSignal>>>,
}

impl InMemoryChatService {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            fail_create: AtomicBool::new(false),
            hold_create: Mutex::new(None),
            feed_script: Mutex::new(VecDeque::new()),
            feed_senders: Mutex::new(Vec::new()),
        })
    }

    fn next_record(&self, sender: &str, content: &str) -> MessageRecord {
        let seq = self.next_id.fetch_add(1, Ordering::SeqCst);
        MessageRecord {
            id: shared::domain::MessageId::new(format!("msg-{seq}")),
            conversation_id: conversation(),
            sender_id: UserId::new(sender),
            content: content.to_string(),
            created_at: base_time() + TimeDelta::seconds(seq as i64),
        }
    }

    /// Store a record without going through `create_message`; used to model
    /// writes that happened before the session opened or on another device.
    async fn seed(&self, sender: &str, content: &str) -> MessageRecord {
        let record = self.next_record(sender, content);
        self.records.lock().await.push(record.clone());
        record
    }

    async fn broadcast(&self, record: &MessageRecord) {
        let senders = self.feed_senders.lock().await.clone();
        for tx in senders {
            let _ = tx
                .send(FeedSignal::Event(FeedEvent::MessageCreated {
                    message: record.clone(),
                }))
                .await;
        }
    }

    async fn push_feed_script(&self, script: impl IntoIterator<Item = FeedScript>) {
        self.feed_script.lock().await.extend(script);
    }

    /// Report a failure on every live feed and forget them, as a collapsing
    /// push provider would.
    async fn fail_feeds(&self, status: FeedStatus) {
        let senders: Vec<_> = self.feed_senders.lock().await.drain(..).collect();
        for tx in senders {
            let _ = tx.send(FeedSignal::Status(status)).await;
        }
    }

    fn hold_next_create(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.hold_create.try_lock().expect("hold slot") = Some(rx);
        tx
    }
}

#[async_trait]
impl MessageBackend for InMemoryChatService {
    async fn create_message(&self, request: CreateMessageRequest) -> Result<CreateMessageResponse> {
        let gate = self.hold_create.lock().await.take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(anyhow!("backend rejected the write"));
        }
        let record = self.next_record(request.sender_id.as_str(), &request.content);
        self.records.lock().await.push(record.clone());
        self.broadcast(&record).await;
        Ok(CreateMessageResponse {
            id: record.id,
            created_at: record.created_at,
        })
    }

    async fn list_messages(
        &self,
        conversation_id: &ConversationId,
        since: DateTime<Utc>,
    ) -> Result<Vec<MessageRecord>> {
        let mut records: Vec<_> = self
            .records
            .lock()
            .await
            .iter()
            .filter(|record| {
                record.conversation_id == *conversation_id && record.created_at > since
            })
            .cloned()
            .collect();
        records.sort_by_key(|record| record.created_at);
        Ok(records)
    }
}

#[async_trait]
impl ProfileDirectory for InMemoryChatService {
    async fn resolve_sender_display(&self, user_id: &UserId) -> Result<SenderDisplay> {
        Ok(SenderDisplay {
            name: format!("{user_id} (profile)"),
            avatar_url: None,
        })
    }
}

#[async_trait]
impl PushFeedProvider for InMemoryChatService {
    async fn subscribe(&self, _conversation_id: &ConversationId) -> Result<PushFeed> {
        let behavior = self
            .feed_script
            .lock()
            .await
            .pop_front()
            .unwrap_or(FeedScript::Ack);
        match behavior {
            FeedScript::Deny => Err(anyhow!("subscription refused")),
            FeedScript::Ack => {
                let (tx, rx) = mpsc::channel(64);
                let _ = tx.send(FeedSignal::Status(FeedStatus::Subscribed)).await;
                self.feed_senders.lock().await.push(tx);
                Ok(PushFeed {
                    signals: rx,
                    subscription: Box::new(NoopSubscription),
                })
            }
            FeedScript::Status(status) => {
                let (tx, rx) = mpsc::channel(64);
                let _ = tx.send(FeedSignal::Status(status)).await;
                Ok(PushFeed {
                    signals: rx,
                    subscription: Box::new(NoopSubscription),
                })
            }
        }
    }
}

async fn open_session(
    service: &Arc<InMemoryChatService>,
    settings: &SyncSettings,
    self_id: &str,
) -> Arc<ConversationSession> {
    let backend: Arc<dyn MessageBackend> = service.clone();
    let push: Arc<dyn PushFeedProvider> = service.clone();
    let profiles: Arc<dyn ProfileDirectory> = service.clone();
    ConversationSession::open(settings, context(), UserId::new(self_id), backend, push, profiles)
        .await
        .expect("open session")
}

async fn wait_for_state(session: &ConversationSession, target: ConnectionState) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while session.connection_indicator().await != target {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {target:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_for_timeline_len(session: &ConversationSession, len: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while session.snapshot().await.len() != len {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {len} timeline entries"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn timeline_contents(snapshot: &[Message]) -> Vec<&str> {
    snapshot.iter().map(|m| m.content.as_str()).collect()
}

#[tokio::test]
async fn open_rebuilds_timeline_from_full_fetch() {
    let service = InMemoryChatService::new();
    service.seed("bob", "hi, saw your posting").await;
    service.seed("alice", "great, let's talk scope").await;

    let session = open_session(&service, &test_settings(), "alice").await;
    wait_for_state(&session, ConnectionState::Healthy).await;

    let snapshot = session.snapshot().await;
    assert_eq!(
        timeline_contents(&snapshot),
        vec!["hi, saw your posting", "great, let's talk scope"]
    );
    assert!(snapshot.iter().all(|m| !m.is_provisional));
    assert_eq!(snapshot[0].sender_display.name, "bob (profile)");
    session.close().await;
}

#[tokio::test]
async fn optimistic_send_is_visible_immediately_then_confirmed_in_place() {
    let service = InMemoryChatService::new();
    let release = service.hold_next_create();
    let session = open_session(&service, &test_settings(), "alice").await;
    wait_for_state(&session, ConnectionState::Healthy).await;

    let send_task = tokio::spawn({
        let session = Arc::clone(&session);
        async move { session.send_message("hello").await }
    });

    // Visible with zero latency, marked provisional while the write is held.
    wait_for_timeline_len(&session, 1).await;
    let snapshot = session.snapshot().await;
    assert!(snapshot[0].is_provisional);
    assert!(snapshot[0].id.is_provisional());
    assert_eq!(snapshot[0].content, "hello");

    release.send(()).expect("release gate");
    send_task.await.expect("join").expect("send");

    let snapshot = session.snapshot().await;
    assert_eq!(snapshot.len(), 1);
    assert!(!snapshot[0].is_provisional);
    assert!(!snapshot[0].id.is_provisional());
    session.close().await;
}

#[tokio::test]
async fn failed_send_withdraws_entry_and_returns_the_text() {
    let service = InMemoryChatService::new();
    service.fail_create.store(true, Ordering::SeqCst);
    let session = open_session(&service, &test_settings(), "alice").await;
    wait_for_state(&session, ConnectionState::Healthy).await;
    let mut events = session.subscribe_events();

    let err = session.send_message("hi").await.expect_err("must fail");
    match err {
        SendError::Delivery { content, .. } => assert_eq!(content, "hi"),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(session.snapshot().await.is_empty());

    let mut saw_send_failed = false;
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::SendFailed { content } = event {
            assert_eq!(content, "hi");
            saw_send_failed = true;
        }
    }
    assert!(saw_send_failed, "send failure must be surfaced");
    session.close().await;
}

#[tokio::test]
async fn push_echo_of_own_send_never_produces_a_second_copy() {
    let service = InMemoryChatService::new();
    let session = open_session(&service, &test_settings(), "alice").await;
    wait_for_state(&session, ConnectionState::Healthy).await;

    // The service broadcasts the committed record before the create call
    // even returns, so the echo and the sender's own confirmation race.
    // Whichever lands first, the timeline must converge on one copy.
    session.send_message("hello").await.expect("send");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let snapshot = session.snapshot().await;
    assert_eq!(snapshot.len(), 1);
    assert!(!snapshot[0].is_provisional);
    assert!(!snapshot[0].id.is_provisional());

    // A repeat delivery of the same record (push redelivery or a poll
    // overlap) is equally idempotent.
    let record = service.records.lock().await[0].clone();
    service.broadcast(&record).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(session.snapshot().await.len(), 1);
    session.close().await;
}

#[tokio::test]
async fn timed_out_feed_degrades_and_polling_takes_over() {
    let service = InMemoryChatService::new();
    service
        .push_feed_script([
            FeedScript::Status(FeedStatus::TimedOut),
            FeedScript::Deny,
        ])
        .await;

    let session = open_session(&service, &test_settings(), "alice").await;
    wait_for_state(&session, ConnectionState::Degraded).await;

    service.seed("bob", "are you still there?").await;
    wait_for_timeline_len(&session, 1).await;

    let snapshot = session.snapshot().await;
    assert_eq!(timeline_contents(&snapshot), vec!["are you still there?"]);
    assert_eq!(session.connection_indicator().await, ConnectionState::Degraded);
    session.close().await;
}

#[tokio::test]
async fn watermark_is_monotonic_and_ignores_empty_batches() {
    let service = InMemoryChatService::new();
    let backend: Arc<dyn MessageBackend> = service.clone();
    let profiles: Arc<dyn ProfileDirectory> = service.clone();
    let (events, _keepalive) = broadcast::channel(16);
    let store = Arc::new(Mutex::new(MessageStore::new(conversation())));
    let poller = FallbackPoller::new(
        conversation(),
        backend,
        Arc::new(DisplayResolver::new(profiles)),
        store,
        events,
    );

    assert_eq!(poller.watermark().await, DateTime::<Utc>::UNIX_EPOCH);
    poller.tick().await.expect("tick");
    assert_eq!(poller.watermark().await, DateTime::<Utc>::UNIX_EPOCH);

    service.seed("alice", "one").await;
    let second = service.seed("bob", "two").await;
    poller.tick().await.expect("tick");
    assert_eq!(poller.watermark().await, second.created_at);

    poller.tick().await.expect("tick");
    assert_eq!(poller.watermark().await, second.created_at);
}

#[tokio::test]
async fn two_participants_stay_in_sync_across_feed_degradation() {
    let service = InMemoryChatService::new();
    let settings = test_settings();
    let session_a = open_session(&service, &settings, "alice").await;
    let session_b = open_session(&service, &settings, "bob").await;
    wait_for_state(&session_a, ConnectionState::Healthy).await;
    wait_for_state(&session_b, ConnectionState::Healthy).await;

    session_a
        .send_message("Project looks great")
        .await
        .expect("send");
    wait_for_timeline_len(&session_b, 1).await;
    let snapshot = session_b.snapshot().await;
    assert!(!snapshot[0].is_provisional);

    // The push layer collapses; each session gets its single resubscribe
    // attempt refused and settles on polling.
    service
        .push_feed_script([FeedScript::Deny, FeedScript::Deny])
        .await;
    service.fail_feeds(FeedStatus::Closed).await;
    wait_for_state(&session_a, ConnectionState::Degraded).await;
    wait_for_state(&session_b, ConnectionState::Degraded).await;

    session_a
        .send_message("Can we hop on a call?")
        .await
        .expect("send");
    wait_for_timeline_len(&session_b, 2).await;

    let snapshot = session_b.snapshot().await;
    assert_eq!(
        timeline_contents(&snapshot),
        vec!["Project looks great", "Can we hop on a call?"]
    );
    assert!(snapshot.iter().all(|m| !m.is_provisional));

    session_a.close().await;
    session_b.close().await;
}

#[tokio::test]
async fn send_after_close_is_refused() {
    let service = InMemoryChatService::new();
    let session = open_session(&service, &test_settings(), "alice").await;
    session.close().await;

    assert!(matches!(
        session.send_message("too late").await,
        Err(SendError::SessionClosed)
    ));
    assert_eq!(
        session.connection_indicator().await,
        ConnectionState::Disconnected
    );
}

// --- HTTP and websocket transports against fake axum servers -------------

#[derive(Clone)]
struct HttpServerState {
    records: Arc<std::sync::Mutex<Vec<MessageRecord>>>,
}

async fn handle_create(
    Path(_conversation_id): Path<String>,
    State(state): State<HttpServerState>,
    Json(request): Json<CreateMessageRequest>,
) -> Json<CreateMessageResponse> {
    let created_at = base_time() + TimeDelta::seconds(1);
    let id = shared::domain::MessageId::new("msg-http-1");
    state.records.lock().expect("lock").push(MessageRecord {
        id: id.clone(),
        conversation_id: request.conversation_id,
        sender_id: request.sender_id,
        content: request.content,
        created_at,
    });
    Json(CreateMessageResponse { id, created_at })
}

async fn handle_list(State(state): State<HttpServerState>) -> Json<Vec<MessageRecord>> {
    Json(state.records.lock().expect("lock").clone())
}

async fn handle_profile(Path(user_id): Path<String>) -> Json<SenderDisplay> {
    Json(SenderDisplay {
        name: format!("{user_id} (verified)"),
        avatar_url: None,
    })
}

async fn spawn_http_server(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn http_backend_round_trips_against_a_real_server() {
    let state = HttpServerState {
        records: Arc::new(std::sync::Mutex::new(Vec::new())),
    };
    let app = Router::new()
        .route(
            "/conversations/:id/messages",
            post(handle_create).get(handle_list),
        )
        .route("/profiles/:id", get(handle_profile))
        .with_state(state);
    let server_url = spawn_http_server(app).await;

    let settings = SyncSettings {
        server_url,
        ..test_settings()
    };
    let backend = HttpChatBackend::new(&settings).expect("backend");

    let response = backend
        .create_message(CreateMessageRequest {
            conversation_id: conversation(),
            sender_id: UserId::new("alice"),
            content: "hello over http".to_string(),
        })
        .await
        .expect("create");
    assert_eq!(response.id.as_str(), "msg-http-1");

    let records = backend
        .list_messages(&conversation(), DateTime::<Utc>::UNIX_EPOCH)
        .await
        .expect("list");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].content, "hello over http");

    let display = backend
        .resolve_sender_display(&UserId::new("alice"))
        .await
        .expect("profile");
    assert_eq!(display.name, "alice (verified)");
}

async fn handle_create_rejection() -> impl IntoResponse {
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(ApiError::new(ErrorCode::Validation, "content too long")),
    )
}

#[tokio::test]
async fn create_rejection_surfaces_the_api_error_body() {
    let app = Router::new().route(
        "/conversations/:id/messages",
        post(handle_create_rejection),
    );
    let server_url = spawn_http_server(app).await;

    let settings = SyncSettings {
        server_url,
        ..test_settings()
    };
    let backend = HttpChatBackend::new(&settings).expect("backend");
    let err = backend
        .create_message(CreateMessageRequest {
            conversation_id: conversation(),
            sender_id: UserId::new("alice"),
            content: "x".repeat(10_000),
        })
        .await
        .expect_err("must fail");
    assert!(err.to_string().contains("content too long"), "got: {err}");
}

async fn handle_feed_ws(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(|mut socket| async move {
        let event = FeedEvent::MessageCreated {
            message: MessageRecord {
                id: shared::domain::MessageId::new("msg-ws-1"),
                conversation_id: conversation(),
                sender_id: UserId::new("bob"),
                content: "over the wire".to_string(),
                created_at: base_time(),
            },
        };
        let frame = serde_json::to_string(&event).expect("encode");
        let _ = socket.send(AxumWsMessage::Text(frame)).await;
        let _ = socket.send(AxumWsMessage::Text("not json".to_string())).await;
    })
}

#[tokio::test]
async fn websocket_feed_acks_delivers_events_and_reports_teardown() {
    let app = Router::new().route("/conversations/:id/feed", get(handle_feed_ws));
    let server_url = spawn_http_server(app).await;

    let settings = SyncSettings {
        server_url,
        ..test_settings()
    };
    let provider = WebSocketPushFeed::new(&settings).expect("provider");
    let mut feed = provider.subscribe(&conversation()).await.expect("subscribe");

    let first = feed.signals.recv().await.expect("ack");
    assert!(matches!(
        first,
        FeedSignal::Status(FeedStatus::Subscribed)
    ));

    let second = feed.signals.recv().await.expect("event");
    match second {
        FeedSignal::Event(FeedEvent::MessageCreated { message }) => {
            assert_eq!(message.content, "over the wire");
        }
        other => panic!("unexpected signal: {other:?}"),
    }

    // The malformed frame is dropped; the next signal is the teardown report
    // once the server side hangs up.
    let third = feed.signals.recv().await.expect("status");
    assert!(matches!(
        third,
        FeedSignal::Status(FeedStatus::Closed) | FeedSignal::Status(FeedStatus::Error)
    ));
    feed.subscription.close();
}
