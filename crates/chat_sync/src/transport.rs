use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use shared::{
    domain::{ConversationId, UserId},
    error::{ApiError, ApiException},
    protocol::{
        CreateMessageRequest, CreateMessageResponse, FeedEvent, FeedStatus, MessageRecord,
        SenderDisplay,
    },
};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::warn;

use crate::{
    backend::{FeedSignal, FeedSubscription, MessageBackend, ProfileDirectory, PushFeed, PushFeedProvider},
    config::SyncSettings,
};

/// reqwest-based client for the message persistence and profile services.
pub struct HttpChatBackend {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
struct ListMessagesQuery {
    since: DateTime<Utc>,
}

impl HttpChatBackend {
    pub fn new(settings: &SyncSettings) -> Result<Self> {
        let base_url = settings.normalized_server_url()?;
        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout())
            .build()
            .context("failed to build http client")?;
        Ok(Self { http, base_url })
    }

    async fn reject_with_body(response: reqwest::Response, action: &str) -> anyhow::Error {
        let status = response.status();
        match response.json::<ApiError>().await {
            Ok(body) => anyhow::Error::new(ApiException::from(body))
                .context(format!("{action} rejected ({status})")),
            Err(_) => anyhow!("{action} rejected with status {status}"),
        }
    }
}

#[async_trait]
impl MessageBackend for HttpChatBackend {
    async fn create_message(&self, request: CreateMessageRequest) -> Result<CreateMessageResponse> {
        let response = self
            .http
            .post(format!(
                "{}/conversations/{}/messages",
                self.base_url, request.conversation_id
            ))
            .json(&request)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::reject_with_body(response, "create message").await);
        }
        Ok(response.json().await?)
    }

    async fn list_messages(
        &self,
        conversation_id: &ConversationId,
        since: DateTime<Utc>,
    ) -> Result<Vec<MessageRecord>> {
        let records: Vec<MessageRecord> = self
            .http
            .get(format!(
                "{}/conversations/{conversation_id}/messages",
                self.base_url
            ))
            .query(&ListMessagesQuery { since })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(records)
    }
}

#[async_trait]
impl ProfileDirectory for HttpChatBackend {
    async fn resolve_sender_display(&self, user_id: &UserId) -> Result<SenderDisplay> {
        let display: SenderDisplay = self
            .http
            .get(format!("{}/profiles/{user_id}", self.base_url))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(display)
    }
}

/// Per-conversation websocket event feed. The completed handshake doubles as
/// the subscription acknowledgment.
pub struct WebSocketPushFeed {
    base_url: String,
    buffer: usize,
}

impl WebSocketPushFeed {
    pub fn new(settings: &SyncSettings) -> Result<Self> {
        Ok(Self {
            base_url: settings.normalized_server_url()?,
            buffer: settings.event_buffer.max(1),
        })
    }
}

fn websocket_url(base_url: &str, conversation_id: &ConversationId) -> Result<String> {
    let ws_base = if base_url.starts_with("https://") {
        base_url.replacen("https://", "wss://", 1)
    } else if base_url.starts_with("http://") {
        base_url.replacen("http://", "ws://", 1)
    } else {
        return Err(anyhow!("server url must start with http:// or https://"));
    };
    Ok(format!("{ws_base}/conversations/{conversation_id}/feed"))
}

struct WsSubscription {
    reader_task: JoinHandle<()>,
}

impl FeedSubscription for WsSubscription {
    fn close(self: Box<Self>) {}
}

impl Drop for WsSubscription {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

#[async_trait]
impl PushFeedProvider for WebSocketPushFeed {
    async fn subscribe(&self, conversation_id: &ConversationId) -> Result<PushFeed> {
        let ws_url = websocket_url(&self.base_url, conversation_id)?;
        let (ws_stream, _) = connect_async(&ws_url)
            .await
            .with_context(|| format!("failed to connect websocket: {ws_url}"))?;
        let (_, mut ws_reader) = ws_stream.split();

        let (tx, rx) = mpsc::channel(self.buffer);
        let conversation = conversation_id.clone();
        let reader_task = tokio::spawn(async move {
            if tx.send(FeedSignal::Status(FeedStatus::Subscribed)).await.is_err() {
                return;
            }
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => match serde_json::from_str::<FeedEvent>(&text) {
                        Ok(event) => {
                            if tx.send(FeedSignal::Event(event)).await.is_err() {
                                return;
                            }
                        }
                        Err(err) => {
                            warn!(
                                conversation_id = %conversation,
                                "push: dropping malformed feed frame: {err}"
                            );
                        }
                    },
                    Ok(WsMessage::Close(_)) => {
                        let _ = tx.send(FeedSignal::Status(FeedStatus::Closed)).await;
                        return;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(
                            conversation_id = %conversation,
                            "push: websocket receive failed: {err}"
                        );
                        let _ = tx.send(FeedSignal::Status(FeedStatus::Error)).await;
                        return;
                    }
                }
            }
            let _ = tx.send(FeedSignal::Status(FeedStatus::Closed)).await;
        });

        Ok(PushFeed {
            signals: rx,
            subscription: Box::new(WsSubscription { reader_task }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_url_swaps_scheme_and_appends_feed_path() {
        let conversation = ConversationId::new("proj-4");
        assert_eq!(
            websocket_url("https://chat.example.com", &conversation).expect("url"),
            "wss://chat.example.com/conversations/proj-4/feed"
        );
        assert_eq!(
            websocket_url("http://127.0.0.1:9000", &conversation).expect("url"),
            "ws://127.0.0.1:9000/conversations/proj-4/feed"
        );
        assert!(websocket_url("ftp://x", &conversation).is_err());
    }
}
