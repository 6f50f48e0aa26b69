//! Session-scoped synchronization state.
//!
//! [`ChatSync`] is created when a user logs in and dropped at logout. It owns
//! the single gateway connection, the shared unread and dedup stores, and the
//! loop that feeds inbound frames to the dispatcher. UI surfaces obtain
//! [`ConversationView`]s and [`TrackedReactions`] from it.

use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, Weak};

use dashmap::DashMap;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::api::{HttpServerApi, ServerApi};
use crate::error::{ChatSyncError, Result};
use crate::protocol::ClientCommand;
use crate::types::{Conversation, Credential, Message, MessageId, UserId};

pub mod config;
pub mod conversation_view;
pub mod dispatcher;
mod event_processor;
pub mod reactions;
pub mod read_progress;
pub mod retry;
pub mod rooms;
pub mod scheduler;
pub mod transport;
pub mod unread;
mod utils;

pub use config::ChatSyncConfig;
pub use conversation_view::ConversationView;
pub use dispatcher::{DispatchOutcome, EventDispatcher, EventKind, HandlerGuard, RoomEvent};
pub use reactions::{InFlight, MutationOutcome, Notice, ReactionCoordinator};
pub use read_progress::{ReadProgressReporter, ReadReceiptSink, VisibleMessage};
pub use rooms::{RoomRegistry, RoomState, RoomSubscriptionController};
pub use scheduler::{Scheduler, TimerHandle, TokioScheduler};
pub use transport::{
    CommandSink, ConnectionState, Connector, TransportConnection, WebSocketConnector,
};
pub use unread::{UnreadCounterStore, UnreadSnapshot};

use event_processor::EventProcessor;
use retry::{LinearRetryPolicy, retry_linear};
use utils::lock;

const NOTICE_CHANNEL_CAPACITY: usize = 32;

/// The pluggable edges of a session. [`ChatSync::start`] fills them with the
/// WebSocket gateway, the HTTP API and the tokio timer.
pub struct SyncServices {
    pub connector: Arc<dyn Connector>,
    pub api: Arc<dyn ServerApi>,
    pub scheduler: Arc<dyn Scheduler>,
}

pub struct ChatSync {
    pub config: ChatSyncConfig,
    user_id: UserId,
    credential: Credential,
    connection: TransportConnection,
    api: Arc<dyn ServerApi>,
    scheduler: Arc<dyn Scheduler>,
    unread: Arc<UnreadCounterStore>,
    dispatcher: EventDispatcher,
    rooms: Arc<RoomRegistry>,
    reactions: DashMap<MessageId, Weak<TrackedInner>>,
    notices: broadcast::Sender<Notice>,
    shutdown_sender: mpsc::Sender<()>,
    processor: Mutex<Option<JoinHandle<()>>>,
    runtime: Handle,
}

impl fmt::Debug for ChatSync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatSync")
            .field("config", &self.config)
            .field("user_id", &self.user_id)
            .field("credential", &"<REDACTED>")
            .field("connection", &self.connection)
            .field("api", &"<REDACTED>")
            .field("tracked_reactions", &self.reactions.len())
            .finish()
    }
}

impl ChatSync {
    /// Starts a session for `user_id` against the configured gateway and API.
    ///
    /// Sets up logging when `config.logs_dir` is set, opens the gateway
    /// connection and fetches the unread counts in the background.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an invalid config or when called
    /// outside a tokio runtime.
    pub fn start(config: ChatSyncConfig, user_id: UserId, credential: Credential) -> Result<Self> {
        if let Some(logs_dir) = &config.logs_dir {
            std::fs::create_dir_all(logs_dir)?;
            crate::init_tracing(logs_dir)?;
        }

        let services = SyncServices {
            connector: Arc::new(WebSocketConnector::new(config.gateway_url.clone())),
            api: Arc::new(HttpServerApi::new(&config.api_base_url, credential.clone())?),
            scheduler: Arc::new(TokioScheduler::from_current()?),
        };
        Self::start_with(config, user_id, credential, services)
    }

    /// Starts a session on explicit services.
    pub fn start_with(
        config: ChatSyncConfig,
        user_id: UserId,
        credential: Credential,
        services: SyncServices,
    ) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|e| {
            ChatSyncError::Configuration(format!("a session needs a tokio runtime: {}", e))
        })?;

        // Create event processing channels
        let (event_sender, event_receiver) = mpsc::channel(config.event_channel_capacity);
        let (shutdown_sender, shutdown_receiver) = mpsc::channel(1);

        let unread = Arc::new(UnreadCounterStore::new());
        for conversation in &config.muted_conversations {
            unread.mute(conversation);
        }
        let dispatcher = EventDispatcher::new(unread.clone(), config.delivered_cache_capacity);
        let rooms = Arc::new(RoomRegistry::new());
        let connection = TransportConnection::new(
            services.connector,
            config.reconnect.clone(),
            event_sender,
            runtime.clone(),
        );

        let processor = EventProcessor::new(dispatcher.clone(), rooms.clone()).spawn(
            event_receiver,
            connection.subscribe(),
            shutdown_receiver,
        );
        let (notices, _) = broadcast::channel(NOTICE_CHANNEL_CAPACITY);

        let chatsync = Self {
            config,
            user_id,
            credential,
            connection,
            api: services.api,
            scheduler: services.scheduler,
            unread,
            dispatcher,
            rooms,
            reactions: DashMap::new(),
            notices,
            shutdown_sender,
            processor: Mutex::new(Some(processor)),
            runtime,
        };

        tracing::info!(
            target: "chatsync::start",
            user_id = %chatsync.user_id,
            "Starting chat session"
        );
        chatsync.connection.connect(chatsync.credential.clone());
        chatsync.spawn_unread_refresh();
        Ok(chatsync)
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn subscribe_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe()
    }

    /// Manual reconnect, also the way out of [`ConnectionState::Error`].
    pub fn reconnect(&self) {
        self.connection.connect(self.credential.clone());
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    pub fn unread(&self) -> &Arc<UnreadCounterStore> {
        &self.unread
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    /// Transient notices such as rolled-back reactions.
    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    /// A new surface with its own room membership and read watermark.
    pub fn open_conversation(&self) -> ConversationView {
        let sink: Arc<dyn CommandSink> = Arc::new(self.connection.clone());
        let rooms = Arc::new(RoomSubscriptionController::new(
            sink,
            self.scheduler.clone(),
            self.config.join_retry.clone(),
        ));
        self.rooms.register(&rooms);

        let receipts = Arc::new(SessionReadSink {
            connection: self.connection.clone(),
            api: self.api.clone(),
            unread: self.unread.clone(),
            policy: self.config.best_effort_retry.clone(),
            runtime: self.runtime.clone(),
        });
        let reporter =
            ReadProgressReporter::new(receipts, self.scheduler.clone(), self.config.read_debounce);

        ConversationView::new(rooms, self.dispatcher.clone(), reporter)
    }

    /// Reaction state for `message`, kept in sync with remote updates while
    /// any returned handle is alive. Handles for the same message share one
    /// coordinator.
    pub fn track_reactions(&self, message: &Message) -> TrackedReactions {
        self.reactions.retain(|_, tracked| tracked.strong_count() > 0);

        let mut entry = self.reactions.entry(message.id.clone()).or_default();
        if let Some(inner) = entry.upgrade() {
            return TrackedReactions { inner };
        }

        let coordinator = ReactionCoordinator::new(
            message.id.clone(),
            message.reactions.clone(),
            self.user_id.clone(),
            self.api.clone(),
            self.notices.clone(),
            self.runtime.clone(),
        );
        let inner = Arc::new_cyclic(|weak: &Weak<TrackedInner>| {
            let weak = weak.clone();
            let guard = self
                .dispatcher
                .register_reaction_handler(&message.id, move |update| {
                    if let Some(tracked) = weak.upgrade() {
                        tracked.coordinator.apply_remote(update);
                    }
                });
            TrackedInner {
                coordinator,
                _guard: guard,
            }
        });
        *entry = Arc::downgrade(&inner);
        TrackedReactions { inner }
    }

    /// Toggles `emoji` on a tracked message. `None` when the message is not
    /// tracked or a toggle on it is still pending.
    pub fn toggle_reaction(&self, message_id: &MessageId, emoji: &str) -> Option<InFlight> {
        let tracked = self.reactions.get(message_id).and_then(|weak| weak.upgrade());
        match tracked {
            Some(tracked) => tracked.coordinator.toggle_reaction(emoji),
            None => {
                tracing::warn!(
                    target: "chatsync::toggle_reaction",
                    %message_id,
                    "Ignoring toggle for a message whose reactions are not tracked"
                );
                None
            }
        }
    }

    /// Re-fetches unread counts, keeping the local mute set. Returns false
    /// when every attempt failed.
    pub async fn refresh_unread_counts(&self) -> bool {
        refresh_unread(self.api.as_ref(), &self.unread, &self.config.best_effort_retry).await
    }

    fn spawn_unread_refresh(&self) {
        let api = self.api.clone();
        let unread = self.unread.clone();
        let policy = self.config.best_effort_retry.clone();
        self.runtime.spawn(async move {
            refresh_unread(api.as_ref(), &unread, &policy).await;
        });
    }

    /// Closes the connection and drains the event queue.
    pub async fn shutdown(&self) {
        self.connection.disconnect().await;
        // Expected to fail if the processor already shut down
        let _ = self.shutdown_sender.send(()).await;

        let processor = lock(&self.processor).take();
        if let Some(processor) = processor {
            if let Err(e) = processor.await {
                tracing::warn!(
                    target: "chatsync::shutdown",
                    "Event processor ended abnormally: {}",
                    e
                );
            }
        }
        tracing::info!(target: "chatsync::shutdown", "Chat session shut down");
    }
}

impl Drop for ChatSync {
    fn drop(&mut self) {
        self.connection.abort();
        if let Some(processor) = lock(&self.processor).take() {
            processor.abort();
        }
    }
}

async fn refresh_unread(
    api: &dyn ServerApi,
    unread: &UnreadCounterStore,
    policy: &LinearRetryPolicy,
) -> bool {
    match retry_linear(policy, "Unread count fetch", || api.unread_counts()).await {
        Some(counts) => {
            unread.hydrate_counts(counts);
            tracing::debug!(
                target: "chatsync::refresh_unread",
                total = unread.total(),
                "Hydrated unread counts"
            );
            true
        }
        None => false,
    }
}

struct TrackedInner {
    coordinator: ReactionCoordinator,
    _guard: HandlerGuard,
}

/// Shared handle on a message's [`ReactionCoordinator`].
#[derive(Clone)]
pub struct TrackedReactions {
    inner: Arc<TrackedInner>,
}

impl Deref for TrackedReactions {
    type Target = ReactionCoordinator;

    fn deref(&self) -> &ReactionCoordinator {
        &self.inner.coordinator
    }
}

impl fmt::Debug for TrackedReactions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TrackedReactions")
            .field(&self.inner.coordinator)
            .finish()
    }
}

/// Sends read watermarks for the session's views: over the gateway when it
/// is up, otherwise through the API with best-effort retry.
struct SessionReadSink {
    connection: TransportConnection,
    api: Arc<dyn ServerApi>,
    unread: Arc<UnreadCounterStore>,
    policy: LinearRetryPolicy,
    runtime: Handle,
}

impl ReadReceiptSink for SessionReadSink {
    fn report(&self, conversation: &Conversation, message_id: &MessageId) {
        self.unread.clear(&conversation.id);

        if self.connection.is_connected()
            && self
                .connection
                .send_command(ClientCommand::message_read(conversation, message_id.clone()))
        {
            return;
        }

        tracing::debug!(
            target: "chatsync::read_receipts::report",
            conversation = %conversation,
            "Gateway unavailable, marking read through the API"
        );
        let api = self.api.clone();
        let policy = self.policy.clone();
        let conversation = conversation.clone();
        self.runtime.spawn(async move {
            retry_linear(&policy, "Mark read", || api.mark_read(&conversation)).await;
        });
    }
}
