//! Debounced read watermark reporting for one conversation view.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::chatsync::scheduler::{Scheduler, TimerHandle};
use crate::chatsync::utils::lock;
use crate::types::{Conversation, MessageId};

/// A message currently intersecting the viewport. Larger positions are further down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisibleMessage {
    pub id: MessageId,
    pub position: i64,
}

impl VisibleMessage {
    pub fn new(id: impl Into<MessageId>, position: i64) -> Self {
        Self {
            id: id.into(),
            position,
        }
    }
}

/// Receives the watermarks the reporter decides to send.
pub trait ReadReceiptSink: Send + Sync {
    fn report(&self, conversation: &Conversation, message_id: &MessageId);
}

#[derive(Default)]
struct ReporterState {
    conversation: Option<Conversation>,
    candidate: Option<VisibleMessage>,
    last_reported: Option<VisibleMessage>,
    timer: Option<TimerHandle>,
    generation: u64,
}

impl ReporterState {
    fn is_ahead(&self, message: &VisibleMessage) -> bool {
        self.last_reported
            .as_ref()
            .is_none_or(|last| message.position > last.position)
    }
}

struct ReporterInner {
    sink: Arc<dyn ReadReceiptSink>,
    scheduler: Arc<dyn Scheduler>,
    debounce: Duration,
    state: Mutex<ReporterState>,
}

impl ReporterInner {
    fn fire(&self, generation: Option<u64>) {
        let (conversation, message) = {
            let mut state = lock(&self.state);
            if generation.is_some_and(|g| g != state.generation) {
                return;
            }
            state.timer = None;
            let Some(candidate) = state.candidate.take() else {
                return;
            };
            let Some(conversation) = state.conversation.clone() else {
                return;
            };
            if !state.is_ahead(&candidate) {
                return;
            }
            state.last_reported = Some(candidate.clone());
            (conversation, candidate)
        };

        tracing::debug!(
            target: "chatsync::read_progress::fire",
            conversation = %conversation,
            message_id = %message.id,
            "Reporting read watermark"
        );
        self.sink.report(&conversation, &message.id);
    }
}

/// Collapses visibility changes into one trailing report of the bottom-most
/// visible message. Never reports a watermark behind the last one sent until
/// [`reset`](Self::reset).
pub struct ReadProgressReporter {
    inner: Arc<ReporterInner>,
}

impl ReadProgressReporter {
    pub fn new(
        sink: Arc<dyn ReadReceiptSink>,
        scheduler: Arc<dyn Scheduler>,
        debounce: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(ReporterInner {
                sink,
                scheduler,
                debounce,
                state: Mutex::new(ReporterState::default()),
            }),
        }
    }

    /// Updates the visible set and (re)arms the debounce timer.
    pub fn observe(&self, visible: &[VisibleMessage]) {
        let Some(bottom) = visible.iter().max_by_key(|m| m.position) else {
            return;
        };

        let mut state = lock(&self.inner.state);
        if state.conversation.is_none() || !state.is_ahead(bottom) {
            return;
        }
        if state
            .candidate
            .as_ref()
            .is_some_and(|candidate| candidate.position >= bottom.position)
        {
            return;
        }
        state.candidate = Some(bottom.clone());
        state.generation += 1;

        let generation = state.generation;
        let weak: Weak<ReporterInner> = Arc::downgrade(&self.inner);
        let timer = self.inner.scheduler.schedule(
            self.inner.debounce,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.fire(Some(generation));
                }
            }),
        );
        // Replacing the previous handle cancels its timer.
        let previous = state.timer.replace(timer);
        drop(state);
        drop(previous);
    }

    /// Sends the pending watermark now, if any.
    pub fn flush(&self) {
        self.inner.fire(None);
    }

    /// Clears all progress and points the reporter at `conversation`.
    pub fn reset(&self, conversation: Option<Conversation>) {
        let previous = {
            let mut state = lock(&self.inner.state);
            let generation = state.generation + 1;
            std::mem::replace(
                &mut *state,
                ReporterState {
                    conversation,
                    generation,
                    ..ReporterState::default()
                },
            )
        };
        drop(previous);
    }

    pub fn conversation(&self) -> Option<Conversation> {
        lock(&self.inner.state).conversation.clone()
    }

    pub fn last_reported(&self) -> Option<MessageId> {
        lock(&self.inner.state)
            .last_reported
            .as_ref()
            .map(|m| m.id.clone())
    }

    pub fn has_pending(&self) -> bool {
        lock(&self.inner.state).candidate.is_some()
    }
}

impl fmt::Debug for ReadProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("ReadProgressReporter")
            .field("conversation", &state.conversation)
            .field("candidate", &state.candidate)
            .field("last_reported", &state.last_reported)
            .finish()
    }
}
