//! Optimistic mutations with rollback.
//!
//! An [`OptimisticMutation`] is a command: it knows how to apply itself to
//! local state, how to submit itself to the server and how to fold the
//! server's answer back in. [`OptimisticCoordinator`] owns the state of one
//! target (one message for reactions), keeps the snapshot taken before the
//! command was applied and restores it if the server rejects the command.

use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::chatsync::utils::lock;
use crate::error::{ChatSyncError, Result};

pub mod reaction_toggle;

pub use reaction_toggle::{
    ReactionCoordinator, ReactionToggle, RemoteOutcome, apply_reaction, has_reacted,
};

/// Transient user-facing notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl Notice {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            created_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait OptimisticMutation: Send + Sync + 'static {
    type State: Clone + PartialEq + fmt::Debug + Send + Sync + 'static;
    type Confirmed: Send + 'static;

    /// The speculative local effect of the command.
    fn apply(&self, state: &Self::State) -> Self::State;

    async fn submit(&self) -> Result<Self::Confirmed>;

    /// State after the server accepted the command.
    fn reconcile(&self, state: &Self::State, confirmed: Self::Confirmed) -> Self::State;

    /// Whether an authoritative update arriving mid-flight touches what this
    /// command is changing. `before` is the state the command was applied to.
    fn conflicts_with(&self, _before: &Self::State, _incoming: &Self::State) -> bool {
        false
    }

    fn failure_notice(&self, error: &ChatSyncError) -> Notice;
}

#[derive(Debug)]
pub struct PendingMutation<M> {
    pub temp_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub mutation: Arc<M>,
}

impl<M> Clone for PendingMutation<M> {
    fn clone(&self) -> Self {
        Self {
            temp_id: self.temp_id,
            created_at: self.created_at,
            mutation: self.mutation.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome {
    Confirmed,
    RolledBack { reason: String },
}

/// What happened to an authoritative update handed to the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthoritativeOutcome {
    Applied,
    /// Applied underneath the pending command, which was re-applied on top.
    Rebased,
    /// Held back until the pending command settles.
    Deferred,
}

/// A submitted command whose server request is still running.
#[derive(Debug)]
pub struct InFlight {
    pub temp_id: Uuid,
    handle: JoinHandle<MutationOutcome>,
}

impl InFlight {
    pub async fn settled(self) -> MutationOutcome {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(e) => MutationOutcome::RolledBack {
                reason: format!("mutation task failed: {}", e),
            },
        }
    }
}

struct CoordinatorState<M: OptimisticMutation> {
    value: M::State,
    pending: Option<PendingMutation<M>>,
    /// Rollback target while a command is pending.
    checkpoint: Option<M::State>,
    deferred: Option<M::State>,
}

struct CoordinatorInner<M: OptimisticMutation> {
    label: String,
    state: Mutex<CoordinatorState<M>>,
    published: watch::Sender<M::State>,
    notices: broadcast::Sender<Notice>,
    runtime: Handle,
}

impl<M: OptimisticMutation> CoordinatorInner<M> {
    fn publish(&self, value: &M::State) {
        self.published.send_if_modified(|current| {
            if current == value {
                false
            } else {
                *current = value.clone();
                true
            }
        });
    }

    fn settle(&self, temp_id: Uuid, mutation: &M, result: Result<M::Confirmed>) -> MutationOutcome {
        let mut state = lock(&self.state);
        if state.pending.as_ref().map(|p| p.temp_id) != Some(temp_id) {
            tracing::warn!(
                target: "chatsync::reactions::settle",
                target_label = %self.label,
                %temp_id,
                "Settling a mutation that is no longer pending"
            );
        }

        let outcome = match result {
            Ok(confirmed) => {
                state.value = mutation.reconcile(&state.value, confirmed);
                if state.deferred.take().is_some() {
                    tracing::debug!(
                        target: "chatsync::reactions::settle",
                        target_label = %self.label,
                        "Discarding deferred update superseded by server response"
                    );
                }
                tracing::debug!(
                    target: "chatsync::reactions::settle",
                    target_label = %self.label,
                    %temp_id,
                    "Mutation confirmed"
                );
                MutationOutcome::Confirmed
            }
            Err(e) => {
                let restored = state
                    .deferred
                    .take()
                    .or_else(|| state.checkpoint.clone())
                    .unwrap_or_else(|| state.value.clone());
                state.value = restored;
                let notice = mutation.failure_notice(&e);
                tracing::warn!(
                    target: "chatsync::reactions::settle",
                    target_label = %self.label,
                    %temp_id,
                    "Mutation rejected, rolled back: {}",
                    e
                );
                // No receivers is fine: nobody is showing notices right now.
                let _ = self.notices.send(notice);
                MutationOutcome::RolledBack {
                    reason: e.to_string(),
                }
            }
        };

        state.pending = None;
        state.checkpoint = None;
        self.publish(&state.value);
        outcome
    }
}

/// Owns the state of one mutation target and serialises commands against it.
pub struct OptimisticCoordinator<M: OptimisticMutation> {
    inner: Arc<CoordinatorInner<M>>,
}

impl<M: OptimisticMutation> Clone for OptimisticCoordinator<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M: OptimisticMutation> OptimisticCoordinator<M> {
    /// Server requests run on `runtime`, so commands can be submitted from
    /// any thread.
    pub fn new(
        label: impl Into<String>,
        initial: M::State,
        notices: broadcast::Sender<Notice>,
        runtime: Handle,
    ) -> Self {
        let (published, _) = watch::channel(initial.clone());
        Self {
            inner: Arc::new(CoordinatorInner {
                label: label.into(),
                state: Mutex::new(CoordinatorState {
                    value: initial,
                    pending: None,
                    checkpoint: None,
                    deferred: None,
                }),
                published,
                notices,
                runtime,
            }),
        }
    }

    pub fn state(&self) -> M::State {
        lock(&self.inner.state).value.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<M::State> {
        self.inner.published.subscribe()
    }

    pub fn is_pending(&self) -> bool {
        lock(&self.inner.state).pending.is_some()
    }

    pub fn pending(&self) -> Option<PendingMutation<M>> {
        lock(&self.inner.state).pending.clone()
    }

    /// Builds a command from the current state, applies it and submits it.
    ///
    /// Returns `None` without side effects while another command is pending.
    pub fn submit_with(&self, build: impl FnOnce(&M::State) -> M) -> Option<InFlight> {
        let (mutation, temp_id) = {
            let mut state = lock(&self.inner.state);
            if let Some(pending) = &state.pending {
                tracing::debug!(
                    target: "chatsync::reactions::submit",
                    target_label = %self.inner.label,
                    pending = %pending.temp_id,
                    "Mutation already in flight, rejecting"
                );
                return None;
            }

            let mutation = Arc::new(build(&state.value));
            let snapshot = state.value.clone();
            state.value = mutation.apply(&snapshot);
            state.checkpoint = Some(snapshot);
            state.deferred = None;

            let temp_id = Uuid::new_v4();
            state.pending = Some(PendingMutation {
                temp_id,
                created_at: Utc::now(),
                mutation: mutation.clone(),
            });
            self.inner.publish(&state.value);
            (mutation, temp_id)
        };

        let inner = self.inner.clone();
        let handle = self.inner.runtime.spawn(async move {
            let result = mutation.submit().await;
            inner.settle(temp_id, &mutation, result)
        });

        Some(InFlight { temp_id, handle })
    }

    /// Folds in a server-authoritative state that did not originate here.
    pub fn apply_authoritative(&self, incoming: M::State) -> AuthoritativeOutcome {
        let mut state = lock(&self.inner.state);
        let Some(pending) = state.pending.clone() else {
            state.value = incoming;
            self.inner.publish(&state.value);
            return AuthoritativeOutcome::Applied;
        };

        let before = state
            .checkpoint
            .clone()
            .unwrap_or_else(|| state.value.clone());
        if pending.mutation.conflicts_with(&before, &incoming) {
            tracing::debug!(
                target: "chatsync::reactions::apply_authoritative",
                target_label = %self.inner.label,
                "Deferring update that touches the pending mutation"
            );
            state.deferred = Some(incoming);
            return AuthoritativeOutcome::Deferred;
        }

        state.value = pending.mutation.apply(&incoming);
        state.checkpoint = Some(incoming);
        self.inner.publish(&state.value);
        AuthoritativeOutcome::Rebased
    }
}

impl<M: OptimisticMutation> fmt::Debug for OptimisticCoordinator<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("OptimisticCoordinator")
            .field("label", &self.inner.label)
            .field("value", &state.value)
            .field("pending", &state.pending.as_ref().map(|p| p.temp_id))
            .finish()
    }
}
