//! `alife-chat`: line-oriented client for one private conversation.
//!
//! Connects as a user to the conversation about one item with one
//! counterpart, prints messages as they arrive and sends every stdin line.
//! Configuration via CLI flags, environment variables, or config file
//! (`~/.config/alife-chat/config.toml`).
//!
//! ```bash
//! cargo run --bin alife-chat -- --broker-url ws://127.0.0.1:8080/ws \
//!     --api-url http://127.0.0.1:8080/api --access-token "$TOKEN" \
//!     --user-id u1 --item i1 --counterpart u2
//! ```
//!
//! Commands: `/reload` refetches history, `/read` marks the conversation as
//! read, `/connect` connects when reconnection is disabled, `/quit` exits.

use std::io;
use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_appender::non_blocking::WorkerGuard;

use alife_chat::backend::ChatBackend;
use alife_chat::backend::http::HttpBackend;
use alife_chat::backend::memory::InMemoryBackend;
use alife_chat::chat::{ChatTarget, ChatUpdate, PrivateChat};
use alife_chat::config::{CliArgs, ClientConfig, ConnectionConfig};
use alife_chat::session::{self, Session};
use alife_chat_proto::message::{ChatMessage, UserId};

#[tokio::main]
async fn main() -> io::Result<()> {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::default()
        }
    };

    // Logs go to a file; stdout belongs to the conversation.
    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!("alife-chat starting");

    let Some(connection) = config.to_connection_config() else {
        eprintln!("No broker configured: pass --broker-url or set [broker] url.");
        return Ok(());
    };
    let (Some(user), Some(item), Some(counterpart)) = (
        config.user_id.clone(),
        config.item_id.clone(),
        config.counterpart_id.clone(),
    ) else {
        eprintln!("--user-id, --item and --counterpart are required.");
        return Ok(());
    };

    let session = Session {
        access_token: config.access_token.clone(),
        user_id: Some(UserId::new(user)),
        is_loading: false,
    };
    let mut target = ChatTarget::new(item, counterpart);
    target.chat_id = config.chat_id.clone().map(Into::into);

    let result = match config.api_url.as_deref() {
        Some(api_url) => match HttpBackend::new(api_url) {
            Ok(backend) => run(&config, connection, Arc::new(backend), session, target).await,
            Err(e) => {
                eprintln!("Invalid API URL: {e}");
                Ok(())
            }
        },
        None => {
            println!("No API configured; history is unavailable.");
            let backend = Arc::new(InMemoryBackend::new());
            run(&config, connection, backend, session, target).await
        }
    };

    tracing::info!("alife-chat exiting");
    result
}

/// Initialize file-based logging.
///
/// Returns a [`WorkerGuard`] that must be held until shutdown to ensure all
/// buffered log entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("alife-chat.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

/// Conversation loop: stdin lines out, broker updates in.
async fn run<B: ChatBackend>(
    config: &ClientConfig,
    connection: ConnectionConfig,
    backend: Arc<B>,
    session: Session,
    target: ChatTarget,
) -> io::Result<()> {
    let (_session_tx, session_rx) = session::channel(session);
    let mut chat = PrivateChat::new(
        connection,
        config.resolver.clone(),
        config.history.clone(),
        backend,
        session_rx,
    );

    chat.open(target).await;
    print_timeline(&chat.messages());
    report_error(&chat);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match line.trim() {
                    "" => {}
                    "/quit" => break,
                    "/reload" => {
                        chat.load_chat_history().await;
                        print_timeline(&chat.messages());
                        report_error(&chat);
                    }
                    "/connect" => {
                        if let Err(e) = chat.connect().await {
                            println!("* error: {e}");
                        }
                    }
                    "/read" => {
                        if chat.mark_as_read().is_none() {
                            println!("* conversation not known yet");
                        }
                    }
                    text => {
                        let first = chat.chat_id().is_none();
                        if chat.send_message(text, first).is_none() {
                            report_error(&chat);
                        }
                    }
                }
            }
            update = chat.next_update() => {
                let Some(update) = update else { break };
                match update {
                    ChatUpdate::Connected => println!("* connected"),
                    ChatUpdate::Disconnected => println!("* disconnected"),
                    ChatUpdate::Message(msg) => print_message(&msg),
                    ChatUpdate::Error(e) => println!("* error: {e}"),
                    ChatUpdate::Reconnecting { attempt, delay } => {
                        println!("* reconnecting in {}ms (attempt {attempt})", delay.as_millis());
                    }
                    ChatUpdate::ReconnectExhausted => {
                        println!("* could not reconnect; restart to try again");
                    }
                    ChatUpdate::Ignored => {}
                }
            }
        }
    }

    chat.close();
    Ok(())
}

fn print_timeline(messages: &[ChatMessage]) {
    for msg in messages {
        print_message(msg);
    }
}

fn print_message(msg: &ChatMessage) {
    let who = msg.sender_name.as_deref().unwrap_or(msg.sender_id.as_str());
    println!(
        "[{}] {who}: {}",
        msg.timestamp.as_datetime().format("%H:%M"),
        msg.content
    );
}

fn report_error<B: ChatBackend>(chat: &PrivateChat<B>) {
    if let Some(e) = chat.error() {
        println!("* error: {e}");
    }
}
