use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::chatsync::dispatcher::{DispatchOutcome, EventDispatcher};
use crate::chatsync::rooms::RoomRegistry;
use crate::chatsync::transport::ConnectionState;

/// Drains inbound frames into the dispatcher and rejoins rooms whenever the
/// transport reaches `Connected`.
pub(crate) struct EventProcessor {
    dispatcher: EventDispatcher,
    rooms: Arc<RoomRegistry>,
}

impl EventProcessor {
    pub(crate) fn new(dispatcher: EventDispatcher, rooms: Arc<RoomRegistry>) -> Self {
        Self { dispatcher, rooms }
    }

    /// Start the event processing loop in a background task
    pub(crate) fn spawn(
        self,
        receiver: mpsc::Receiver<String>,
        connection: watch::Receiver<ConnectionState>,
        shutdown: mpsc::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.process_events(receiver, connection, shutdown).await;
        })
    }

    async fn process_events(
        self,
        mut receiver: mpsc::Receiver<String>,
        mut connection: watch::Receiver<ConnectionState>,
        mut shutdown: mpsc::Receiver<()>,
    ) {
        tracing::debug!(
            target: "chatsync::event_processor::process_events",
            "Starting event processing loop"
        );

        let mut shutting_down = false;

        loop {
            tokio::select! {
                Some(frame) = receiver.recv() => {
                    self.process_frame(&frame);
                }
                Ok(()) = connection.changed(), if !shutting_down => {
                    let state = *connection.borrow_and_update();
                    if state == ConnectionState::Connected {
                        self.rooms.rejoin_all();
                    }
                }
                Some(_) = shutdown.recv(), if !shutting_down => {
                    tracing::info!(
                        target: "chatsync::event_processor::process_events",
                        "Received shutdown signal, finishing current queue..."
                    );
                    shutting_down = true;
                    receiver.close();
                }
                else => {
                    if shutting_down {
                        tracing::debug!(
                            target: "chatsync::event_processor::process_events",
                            "Queue flushed, shutting down event processor"
                        );
                    } else {
                        tracing::debug!(
                            target: "chatsync::event_processor::process_events",
                            "All channels closed, exiting event processing loop"
                        );
                    }
                    break;
                }
            }
        }
    }

    fn process_frame(&self, frame: &str) {
        match self.dispatcher.dispatch_frame(frame) {
            DispatchOutcome::Delivered(handlers) => {
                tracing::trace!(
                    target: "chatsync::event_processor::process_frame",
                    handlers,
                    "Event delivered"
                );
            }
            DispatchOutcome::Duplicate => {
                tracing::debug!(
                    target: "chatsync::event_processor::process_frame",
                    "Dropped duplicate delivery"
                );
            }
            DispatchOutcome::Malformed => {
                tracing::debug!(
                    target: "chatsync::event_processor::process_frame",
                    "Dropped malformed frame"
                );
            }
            DispatchOutcome::NotSubscribed | DispatchOutcome::Ignored => {}
        }
    }
}
