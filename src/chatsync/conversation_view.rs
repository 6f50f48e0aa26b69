//! One open conversation surface: its room membership, its event handlers
//! and its read watermark, torn down together.

use std::fmt;
use std::sync::Arc;

use crate::chatsync::dispatcher::{EventDispatcher, EventKind, HandlerGuard, RoomEvent, RoomHandler};
use crate::chatsync::read_progress::{ReadProgressReporter, VisibleMessage};
use crate::chatsync::rooms::{RoomState, RoomSubscriptionController};
use crate::types::{Conversation, Message, MessageDeletion};

pub struct ConversationView {
    rooms: Arc<RoomSubscriptionController>,
    dispatcher: EventDispatcher,
    reporter: ReadProgressReporter,
    handlers: Vec<(EventKind, RoomHandler)>,
    guards: Vec<HandlerGuard>,
    conversation: Option<Conversation>,
}

impl ConversationView {
    pub(crate) fn new(
        rooms: Arc<RoomSubscriptionController>,
        dispatcher: EventDispatcher,
        reporter: ReadProgressReporter,
    ) -> Self {
        Self {
            rooms,
            dispatcher,
            reporter,
            handlers: Vec::new(),
            guards: Vec::new(),
            conversation: None,
        }
    }

    /// Registers `handler` for `kind` on whatever conversation the view shows,
    /// now and after every switch.
    pub fn on_event(
        &mut self,
        kind: EventKind,
        handler: impl Fn(&RoomEvent) + Send + Sync + 'static,
    ) {
        let handler: RoomHandler = Arc::new(handler);
        if let Some(conversation) = &self.conversation {
            self.guards.push(register(&self.dispatcher, conversation, kind, &handler));
        }
        self.handlers.push((kind, handler));
    }

    pub fn on_new_message(&mut self, handler: impl Fn(&Message) + Send + Sync + 'static) {
        self.on_event(EventKind::MessageCreated, move |event| {
            if let RoomEvent::Created(message) = event {
                handler(message);
            }
        });
    }

    pub fn on_message_updated(&mut self, handler: impl Fn(&Message) + Send + Sync + 'static) {
        self.on_event(EventKind::MessageUpdated, move |event| {
            if let RoomEvent::Updated(message) = event {
                handler(message);
            }
        });
    }

    pub fn on_message_deleted(
        &mut self,
        handler: impl Fn(&MessageDeletion) + Send + Sync + 'static,
    ) {
        self.on_event(EventKind::MessageDeleted, move |event| {
            if let RoomEvent::Deleted(deletion) = event {
                handler(deletion);
            }
        });
    }

    /// Shows `conversation`: flushes the old watermark, moves the handlers and
    /// the room membership, and starts read progress from scratch.
    pub fn switch_to(&mut self, conversation: Conversation) {
        if self.conversation.as_ref() == Some(&conversation) {
            self.rooms.join(&conversation);
            return;
        }

        self.reporter.flush();
        self.guards.clear();

        // Handlers go in before the join so nothing broadcast after it is missed.
        self.guards = self
            .handlers
            .iter()
            .map(|(kind, handler)| register(&self.dispatcher, &conversation, *kind, handler))
            .collect();
        self.rooms.join(&conversation);
        self.reporter.reset(Some(conversation.clone()));

        tracing::debug!(
            target: "chatsync::conversation_view::switch_to",
            conversation = %conversation,
            handlers = self.guards.len(),
            "Switched conversation"
        );
        self.conversation = Some(conversation);
    }

    pub fn observe_visible(&self, visible: &[VisibleMessage]) {
        self.reporter.observe(visible);
    }

    pub fn flush_read_progress(&self) {
        self.reporter.flush();
    }

    pub fn conversation(&self) -> Option<&Conversation> {
        self.conversation.as_ref()
    }

    pub fn room_state(&self) -> RoomState {
        match &self.conversation {
            Some(conversation) => self.rooms.state_of(conversation),
            None => RoomState::Unjoined,
        }
    }

    /// Flushes the watermark, leaves the room and drops every handler.
    pub fn close(&mut self) {
        let Some(conversation) = self.conversation.take() else {
            return;
        };
        self.reporter.flush();
        self.reporter.reset(None);
        self.guards.clear();
        self.rooms.teardown();
        tracing::debug!(
            target: "chatsync::conversation_view::close",
            conversation = %conversation,
            "Closed conversation view"
        );
    }
}

impl Drop for ConversationView {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for ConversationView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversationView")
            .field("conversation", &self.conversation)
            .field("room_state", &self.room_state())
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

fn register(
    dispatcher: &EventDispatcher,
    conversation: &Conversation,
    kind: EventKind,
    handler: &RoomHandler,
) -> HandlerGuard {
    let handler = handler.clone();
    dispatcher.register(conversation, kind, move |event| handler(event))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chatsync::read_progress::ReadReceiptSink;
    use crate::chatsync::retry::JoinRetryPolicy;
    use crate::chatsync::test_utils::{ManualScheduler, RecordingSink, message};
    use crate::chatsync::unread::UnreadCounterStore;
    use crate::protocol::{ClientCommand, ServerEvent};
    use crate::types::MessageId;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Receipts(Mutex<Vec<(Conversation, MessageId)>>);

    impl ReadReceiptSink for Receipts {
        fn report(&self, conversation: &Conversation, message_id: &MessageId) {
            self.0.lock().unwrap().push((conversation.clone(), message_id.clone()));
        }
    }

    struct Fixture {
        view: ConversationView,
        dispatcher: EventDispatcher,
        sink: Arc<RecordingSink>,
        scheduler: Arc<ManualScheduler>,
        receipts: Arc<Receipts>,
    }

    fn fixture() -> Fixture {
        let sink = Arc::new(RecordingSink::new(true));
        let scheduler = Arc::new(ManualScheduler::new());
        let receipts = Arc::new(Receipts::default());
        let dispatcher = EventDispatcher::new(Arc::new(UnreadCounterStore::new()), 100);
        let rooms = Arc::new(RoomSubscriptionController::new(
            sink.clone(),
            scheduler.clone(),
            JoinRetryPolicy::default(),
        ));
        let reporter = ReadProgressReporter::new(
            receipts.clone(),
            scheduler.clone(),
            Duration::from_millis(500),
        );
        Fixture {
            view: ConversationView::new(rooms, dispatcher.clone(), reporter),
            dispatcher,
            sink,
            scheduler,
            receipts,
        }
    }

    #[test]
    fn test_handlers_follow_the_shown_conversation() {
        let mut fixture = fixture();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        fixture
            .view
            .on_new_message(move |message| log.lock().unwrap().push(message.id.to_string()));

        fixture.view.switch_to(Conversation::channel("a"));
        fixture
            .dispatcher
            .dispatch(ServerEvent::NewMessage(message("m1", &Conversation::channel("a"))));
        fixture.view.switch_to(Conversation::channel("b"));
        fixture
            .dispatcher
            .dispatch(ServerEvent::NewMessage(message("m2", &Conversation::channel("a"))));
        fixture
            .dispatcher
            .dispatch(ServerEvent::NewMessage(message("m3", &Conversation::channel("b"))));

        assert_eq!(*seen.lock().unwrap(), vec!["m1", "m3"]);
        assert!(!fixture.dispatcher.is_subscribed(&Conversation::channel("a")));
        assert_eq!(
            fixture.sink.sent(),
            vec![
                ClientCommand::JoinChannel("a".into()),
                ClientCommand::LeaveChannel("a".into()),
                ClientCommand::JoinChannel("b".into()),
            ]
        );
    }

    #[test]
    fn test_handler_added_after_switch_is_registered() {
        let mut fixture = fixture();
        fixture.view.switch_to(Conversation::direct("d1"));
        assert!(!fixture.dispatcher.is_subscribed(&Conversation::direct("d1")));

        fixture.view.on_message_deleted(|_| {});
        assert_eq!(fixture.dispatcher.handler_count(&Conversation::direct("d1")), 1);
        assert_eq!(fixture.view.room_state(), RoomState::Joined);
    }

    #[test]
    fn test_switch_flushes_pending_watermark_and_resets() {
        let mut fixture = fixture();
        fixture.view.switch_to(Conversation::channel("a"));
        fixture.view.observe_visible(&[VisibleMessage::new("m9", 9)]);
        fixture.view.switch_to(Conversation::channel("b"));
        fixture.view.observe_visible(&[VisibleMessage::new("x1", 1)]);
        fixture.scheduler.advance(Duration::from_millis(500));

        let receipts = fixture.receipts.0.lock().unwrap().clone();
        assert_eq!(
            receipts,
            vec![
                (Conversation::channel("a"), MessageId::from("m9")),
                (Conversation::channel("b"), MessageId::from("x1")),
            ]
        );
    }

    #[test]
    fn test_drop_leaves_room_and_unregisters() {
        let fixture = fixture();
        let Fixture {
            mut view,
            dispatcher,
            sink,
            ..
        } = fixture;
        view.on_new_message(|_| {});
        view.switch_to(Conversation::channel("a"));
        drop(view);

        assert!(!dispatcher.is_subscribed(&Conversation::channel("a")));
        assert_eq!(sink.sent().last(), Some(&ClientCommand::LeaveChannel("a".into())));
    }
}
