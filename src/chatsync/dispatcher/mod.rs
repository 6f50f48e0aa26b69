//! Routes decoded gateway events to the handlers registered for each room.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use dashmap::DashMap;

use crate::chatsync::unread::UnreadCounterStore;
use crate::chatsync::utils::lock;
use crate::protocol::{ServerEvent, decode_server_event};
use crate::types::{
    Conversation, ConversationRef, Message, MessageDeletion, MessageId, ReactionUpdate,
};

pub mod delivered;

pub use delivered::{DEFAULT_DELIVERED_CAPACITY, DeliveredIdCache};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    MessageCreated,
    MessageUpdated,
    MessageDeleted,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    Created(Message),
    Updated(Message),
    Deleted(MessageDeletion),
}

impl RoomEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            RoomEvent::Created(_) => EventKind::MessageCreated,
            RoomEvent::Updated(_) => EventKind::MessageUpdated,
            RoomEvent::Deleted(_) => EventKind::MessageDeleted,
        }
    }

    pub fn message_id(&self) -> &MessageId {
        match self {
            RoomEvent::Created(message) | RoomEvent::Updated(message) => &message.id,
            RoomEvent::Deleted(deletion) => &deletion.id,
        }
    }
}

pub type RoomHandler = Arc<dyn Fn(&RoomEvent) + Send + Sync>;
pub type ReactionHandler = Arc<dyn Fn(&ReactionUpdate) + Send + Sync>;

/// What happened to one inbound event. Returned for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered(usize),
    Duplicate,
    NotSubscribed,
    Malformed,
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum HandlerTarget {
    Room(Conversation),
    Reaction(MessageId),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandlerId {
    target: HandlerTarget,
    id: u64,
}

struct RoomRegistration {
    id: u64,
    kind: EventKind,
    handler: RoomHandler,
}

struct ReactionRegistration {
    id: u64,
    handler: ReactionHandler,
}

struct Inner {
    rooms: DashMap<Conversation, Vec<RoomRegistration>>,
    reactions: DashMap<MessageId, Vec<ReactionRegistration>>,
    delivered: Mutex<DeliveredIdCache>,
    unread: Arc<UnreadCounterStore>,
    next_id: AtomicU64,
}

impl Inner {
    fn unregister(&self, handler: &HandlerId) -> bool {
        match &handler.target {
            HandlerTarget::Room(room) => {
                let removed = match self.rooms.get_mut(room) {
                    Some(mut registrations) => {
                        let before = registrations.len();
                        registrations.retain(|r| r.id != handler.id);
                        before != registrations.len()
                    }
                    None => false,
                };
                self.rooms.remove_if(room, |_, registrations| registrations.is_empty());
                removed
            }
            HandlerTarget::Reaction(message_id) => {
                let removed = match self.reactions.get_mut(message_id) {
                    Some(mut registrations) => {
                        let before = registrations.len();
                        registrations.retain(|r| r.id != handler.id);
                        before != registrations.len()
                    }
                    None => false,
                };
                self.reactions
                    .remove_if(message_id, |_, registrations| registrations.is_empty());
                removed
            }
        }
    }
}

/// Unregisters its handler when dropped.
#[must_use = "dropping the guard unregisters the handler"]
pub struct HandlerGuard {
    dispatcher: Weak<Inner>,
    id: HandlerId,
}

impl HandlerGuard {
    pub fn id(&self) -> &HandlerId {
        &self.id
    }
}

impl Drop for HandlerGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.dispatcher.upgrade() {
            inner.unregister(&self.id);
        }
    }
}

impl fmt::Debug for HandlerGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerGuard").field("id", &self.id).finish()
    }
}

/// Observer registry for inbound events.
///
/// A room counts as subscribed while at least one handler is registered for
/// it. New messages are deduplicated through the shared [`DeliveredIdCache`].
#[derive(Clone)]
pub struct EventDispatcher {
    inner: Arc<Inner>,
}

impl EventDispatcher {
    pub fn new(unread: Arc<UnreadCounterStore>, delivered_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                rooms: DashMap::new(),
                reactions: DashMap::new(),
                delivered: Mutex::new(DeliveredIdCache::new(delivered_capacity)),
                unread,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn register(
        &self,
        room: &Conversation,
        kind: EventKind,
        handler: impl Fn(&RoomEvent) + Send + Sync + 'static,
    ) -> HandlerGuard {
        let id = self.next_id();
        self.inner
            .rooms
            .entry(room.clone())
            .or_default()
            .push(RoomRegistration {
                id,
                kind,
                handler: Arc::new(handler),
            });

        tracing::debug!(
            target: "chatsync::dispatcher::register",
            room = %room,
            ?kind,
            "Registered room handler"
        );

        self.guard(HandlerTarget::Room(room.clone()), id)
    }

    pub fn register_reaction_handler(
        &self,
        message_id: &MessageId,
        handler: impl Fn(&ReactionUpdate) + Send + Sync + 'static,
    ) -> HandlerGuard {
        let id = self.next_id();
        self.inner
            .reactions
            .entry(message_id.clone())
            .or_default()
            .push(ReactionRegistration {
                id,
                handler: Arc::new(handler),
            });
        self.guard(HandlerTarget::Reaction(message_id.clone()), id)
    }

    /// Explicit removal. Returns false if the handler was already gone.
    pub fn unregister(&self, handler: &HandlerId) -> bool {
        self.inner.unregister(handler)
    }

    pub fn is_subscribed(&self, room: &Conversation) -> bool {
        self.inner
            .rooms
            .get(room)
            .is_some_and(|registrations| !registrations.is_empty())
    }

    pub fn handler_count(&self, room: &Conversation) -> usize {
        self.inner.rooms.get(room).map_or(0, |r| r.len())
    }

    pub fn delivered_count(&self) -> usize {
        lock(&self.inner.delivered).len()
    }

    pub fn unread(&self) -> &Arc<UnreadCounterStore> {
        &self.inner.unread
    }

    /// Decodes a raw frame and dispatches it. Malformed frames are logged and dropped.
    pub fn dispatch_frame(&self, frame: &str) -> DispatchOutcome {
        match decode_server_event(frame) {
            Ok(Some(event)) => self.dispatch(event),
            Ok(None) => {
                tracing::trace!(
                    target: "chatsync::dispatcher::dispatch_frame",
                    "Ignoring unhandled event"
                );
                DispatchOutcome::Ignored
            }
            Err(e) => {
                tracing::warn!(
                    target: "chatsync::dispatcher::dispatch_frame",
                    "Dropping malformed frame: {}",
                    e
                );
                DispatchOutcome::Malformed
            }
        }
    }

    pub fn dispatch(&self, event: ServerEvent) -> DispatchOutcome {
        match event {
            ServerEvent::NewMessage(message) => self.dispatch_new_message(message),
            ServerEvent::MessageUpdated(message) => {
                let conversation = message.conversation.clone();
                self.dispatch_room_event(&conversation, RoomEvent::Updated(message))
            }
            ServerEvent::MessageDeleted(deletion) => {
                let conversation = deletion.conversation.clone();
                self.dispatch_room_event(&conversation, RoomEvent::Deleted(deletion))
            }
            ServerEvent::ReactionUpdated(update) => self.dispatch_reaction(update),
            ServerEvent::UnreadCountUpdate(update) => match update.conversation.resolve() {
                Some(conversation) => {
                    self.inner.unread.set(&conversation.id, update.unread_count);
                    DispatchOutcome::Delivered(1)
                }
                None => {
                    tracing::warn!(
                        target: "chatsync::dispatcher::dispatch",
                        "Dropping unread-count-update without a conversation reference"
                    );
                    DispatchOutcome::Malformed
                }
            },
        }
    }

    fn dispatch_new_message(&self, message: Message) -> DispatchOutcome {
        let Some(room) = self.subscribed_room(&message.conversation) else {
            return self.unroutable(&message.conversation);
        };

        // Check and insert happen under one lock so concurrent duplicates cannot both pass.
        if !lock(&self.inner.delivered).record(&message.id) {
            tracing::debug!(
                target: "chatsync::dispatcher::dispatch_new_message",
                message_id = %message.id,
                "Dropping duplicate delivery"
            );
            return DispatchOutcome::Duplicate;
        }

        self.invoke(&room, &RoomEvent::Created(message))
    }

    fn dispatch_room_event(
        &self,
        conversation: &ConversationRef,
        event: RoomEvent,
    ) -> DispatchOutcome {
        match self.subscribed_room(conversation) {
            Some(room) => self.invoke(&room, &event),
            None => self.unroutable(conversation),
        }
    }

    fn dispatch_reaction(&self, update: ReactionUpdate) -> DispatchOutcome {
        let handlers: Vec<ReactionHandler> = match self.inner.reactions.get(&update.message_id) {
            Some(registrations) => registrations.iter().map(|r| r.handler.clone()).collect(),
            None => return DispatchOutcome::NotSubscribed,
        };
        for handler in &handlers {
            handler(&update);
        }
        DispatchOutcome::Delivered(handlers.len())
    }

    fn subscribed_room(&self, conversation: &ConversationRef) -> Option<Conversation> {
        let room = conversation.resolve()?;
        self.is_subscribed(&room).then_some(room)
    }

    fn unroutable(&self, conversation: &ConversationRef) -> DispatchOutcome {
        if conversation.resolve().is_none() {
            tracing::warn!(
                target: "chatsync::dispatcher::dispatch",
                "Dropping event without a valid conversation reference"
            );
            DispatchOutcome::Malformed
        } else {
            tracing::trace!(
                target: "chatsync::dispatcher::dispatch",
                "Dropping event for a room that is not subscribed"
            );
            DispatchOutcome::NotSubscribed
        }
    }

    fn invoke(&self, room: &Conversation, event: &RoomEvent) -> DispatchOutcome {
        let kind = event.kind();
        // Handlers are cloned out so they may register or unregister while running.
        let handlers: Vec<RoomHandler> = match self.inner.rooms.get(room) {
            Some(registrations) => registrations
                .iter()
                .filter(|r| r.kind == kind)
                .map(|r| r.handler.clone())
                .collect(),
            None => Vec::new(),
        };

        for handler in &handlers {
            handler(event);
        }

        tracing::trace!(
            target: "chatsync::dispatcher::invoke",
            room = %room,
            ?kind,
            handlers = handlers.len(),
            "Dispatched room event"
        );
        DispatchOutcome::Delivered(handlers.len())
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn guard(&self, target: HandlerTarget, id: u64) -> HandlerGuard {
        HandlerGuard {
            dispatcher: Arc::downgrade(&self.inner),
            id: HandlerId { target, id },
        }
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("rooms", &self.inner.rooms.len())
            .field("reaction_targets", &self.inner.reactions.len())
            .finish()
    }
}
