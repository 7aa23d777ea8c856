use std::sync::Arc;

use anyhow::Result;
use chat_sync::{
    load_settings, ConnectionState, ConversationContext, ConversationSession, HttpChatBackend,
    MessageBackend, ProfileDirectory, PushFeedProvider, SendError, SessionEvent, WebSocketPushFeed,
};
use clap::Parser;
use shared::domain::{ProjectId, UserId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

#[derive(Parser, Debug)]
struct Args {
    /// Base url of the chat backend, e.g. http://127.0.0.1:8080.
    /// Overrides chat.toml / CHAT_SERVER_URL when given.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    project_id: String,
    /// Your own user id.
    #[arg(long)]
    user_id: String,
    /// The other participant's user id.
    #[arg(long)]
    peer_id: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }

    let http = Arc::new(HttpChatBackend::new(&settings)?);
    let backend: Arc<dyn MessageBackend> = http.clone();
    let profiles: Arc<dyn ProfileDirectory> = http;
    let push: Arc<dyn PushFeedProvider> = Arc::new(WebSocketPushFeed::new(&settings)?);

    let context = ConversationContext {
        project_id: ProjectId::new(args.project_id),
        participants: [UserId::new(&args.user_id), UserId::new(args.peer_id)],
    };
    let session =
        ConversationSession::open(&settings, context, UserId::new(&args.user_id), backend, push, profiles)
            .await?;

    for message in session.snapshot().await {
        println!("[{}] {}: {}", message.created_at, message.sender_display.name, message.content);
    }

    let printer = tokio::spawn({
        let session = Arc::clone(&session);
        let mut events = session.subscribe_events();
        async move {
            while let Ok(event) = events.recv().await {
                match event {
                    SessionEvent::TimelineUpdated => {
                        if let Some(message) = session.snapshot().await.last() {
                            let marker = if message.is_provisional { "…" } else { " " };
                            println!(
                                "[{}]{marker}{}: {}",
                                message.created_at, message.sender_display.name, message.content
                            );
                        }
                    }
                    SessionEvent::ConnectionChanged(state) => {
                        let hint = match state {
                            ConnectionState::Healthy => "live",
                            ConnectionState::Degraded | ConnectionState::Resubscribing => {
                                "reconnecting"
                            }
                            ConnectionState::Subscribing => "connecting",
                            ConnectionState::Disconnected => "offline",
                        };
                        println!("-- connection: {hint}");
                    }
                    SessionEvent::SendFailed { content } => {
                        println!("-- message not sent, your text is kept: {content}");
                    }
                }
            }
        }
    });

    info!("type a message and press enter; ctrl-d to quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match session.send_message(&line).await {
            Ok(()) => {}
            Err(SendError::EmptyContent) => {}
            Err(SendError::SessionClosed) => break,
            Err(SendError::Delivery { content, source }) => {
                eprintln!("send failed ({source}); retry with: {content}");
            }
        }
    }

    session.close().await;
    printer.abort();
    Ok(())
}
