//! Real-time synchronization core of a chat client.
//!
//! A [`ChatSync`] session keeps one authenticated gateway connection open,
//! routes pushed events to the conversation views that subscribed to them,
//! applies reaction toggles optimistically, and tracks unread counts and read
//! progress.
//!
//! ```rust,no_run
//! # use chatsync::{ChatSync, ChatSyncConfig, Conversation, Credential, UserId};
//! # async fn example() -> chatsync::Result<()> {
//! let config = ChatSyncConfig::from_env()?;
//! let session = ChatSync::start(config, UserId::from("u1"), Credential::new("token"))?;
//!
//! let mut view = session.open_conversation();
//! view.on_new_message(|message| println!("{}: {}", message.author_id, message.content));
//! view.switch_to(Conversation::channel("general"));
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::sync::{Mutex, OnceLock};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::EnvFilter, fmt::Layer, prelude::*, registry::Registry};

mod api;
pub mod chatsync;
mod error;
pub mod protocol;
pub mod types;

pub use crate::api::{HttpServerApi, ServerApi};
pub use crate::chatsync::{
    ChatSync, ChatSyncConfig, ConnectionState, ConversationView, EventKind, MutationOutcome, Notice,
    RoomEvent, RoomState, SyncServices, TrackedReactions, VisibleMessage,
};
pub use crate::error::{ChatSyncError, Result};
pub use crate::types::{
    Conversation, ConversationId, ConversationKind, Credential, Message, MessageDeletion, MessageId,
    ReactionGroup, UserId,
};

static TRACING_GUARDS: OnceLock<Mutex<Option<(WorkerGuard, WorkerGuard)>>> = OnceLock::new();
static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs stdout and daily-rolling file logging under `logs_dir`.
///
/// Only the first call has an effect. The filter comes from `RUST_LOG` and
/// defaults to `info`.
pub fn init_tracing(logs_dir: &Path) -> Result<()> {
    if TRACING_INIT.get().is_some() {
        return Ok(());
    }

    let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix("chatsync")
        .filename_suffix("log")
        .build(logs_dir)
        .map_err(|e| {
            ChatSyncError::LoggingSetup(format!("failed to create file appender: {}", e))
        })?;

    TRACING_INIT.get_or_init(|| {
        let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);
        let (non_blocking_stdout, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

        TRACING_GUARDS
            .set(Mutex::new(Some((file_guard, stdout_guard))))
            .ok();

        let stdout_layer = Layer::new()
            .with_writer(non_blocking_stdout)
            .with_ansi(true)
            .with_target(true);

        let file_layer = Layer::new()
            .with_writer(non_blocking_file)
            .with_ansi(false)
            .with_target(true);

        // A host application may already own the global subscriber.
        let _ = Registry::default()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(stdout_layer)
            .with(file_layer)
            .try_init();
    });
    Ok(())
}
