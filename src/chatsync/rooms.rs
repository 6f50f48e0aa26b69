//! Room membership for one conversation surface.
//!
//! A surface shows one conversation at a time, so the controller tracks a
//! single room. Joins that find the transport offline are retried on a fixed
//! delay and silently abandoned once the attempt budget is spent.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use crate::chatsync::retry::JoinRetryPolicy;
use crate::chatsync::scheduler::{Scheduler, TimerHandle};
use crate::chatsync::transport::CommandSink;
use crate::chatsync::utils::lock;
use crate::protocol::ClientCommand;
use crate::types::Conversation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomState {
    Unjoined,
    Joining,
    Joined,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSubscription {
    pub room: Conversation,
    pub state: RoomState,
    /// Join attempts made in the current round.
    pub attempts: u32,
}

#[derive(Default)]
struct Slot {
    current: Option<RoomSubscription>,
    retry: Option<TimerHandle>,
    generation: u64,
}

struct ControllerInner {
    sink: Arc<dyn CommandSink>,
    scheduler: Arc<dyn Scheduler>,
    policy: JoinRetryPolicy,
    slot: Mutex<Slot>,
}

impl ControllerInner {
    /// One join attempt for the subscription tagged with `generation`.
    fn attempt(self: &Arc<Self>, generation: u64) {
        let mut slot = lock(&self.slot);
        if slot.generation != generation {
            return;
        }
        slot.retry = None;
        let Some(subscription) = slot.current.as_mut() else {
            return;
        };

        subscription.attempts += 1;
        subscription.state = RoomState::Joining;
        let attempt = subscription.attempts;
        let room = subscription.room.clone();

        if self.sink.is_connected() && self.sink.send_command(ClientCommand::join(&room)) {
            subscription.state = RoomState::Joined;
            tracing::debug!(
                target: "chatsync::rooms::attempt",
                room = %room,
                attempt,
                "Joined room"
            );
            return;
        }

        subscription.state = RoomState::Unjoined;
        if attempt >= self.policy.max_attempts() {
            tracing::debug!(
                target: "chatsync::rooms::attempt",
                room = %room,
                attempt,
                "Giving up on joining room"
            );
            return;
        }

        tracing::debug!(
            target: "chatsync::rooms::attempt",
            room = %room,
            attempt,
            "Transport not connected, retrying join in {:?}",
            self.policy.delay
        );
        let weak: Weak<ControllerInner> = Arc::downgrade(self);
        slot.retry = Some(self.scheduler.schedule(
            self.policy.delay,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.attempt(generation);
                }
            }),
        ));
    }
}

/// Tracks the single room a surface is interested in.
pub struct RoomSubscriptionController {
    inner: Arc<ControllerInner>,
}

impl RoomSubscriptionController {
    pub fn new(
        sink: Arc<dyn CommandSink>,
        scheduler: Arc<dyn Scheduler>,
        policy: JoinRetryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                sink,
                scheduler,
                policy,
                slot: Mutex::new(Slot::default()),
            }),
        }
    }

    /// Joins `room`, leaving the previous room of this surface first.
    ///
    /// No-op while the same room is joining, joined or waiting for a retry.
    pub fn join(&self, room: &Conversation) {
        let generation = {
            let mut slot = lock(&self.inner.slot);
            if let Some(current) = &slot.current {
                if &current.room == room
                    && (current.state != RoomState::Unjoined || slot.retry.is_some())
                {
                    return;
                }
            }
            if slot.current.as_ref().is_some_and(|current| &current.room != room) {
                Self::leave_locked(&self.inner, &mut slot);
            }
            slot.generation += 1;
            slot.retry = None;
            slot.current = Some(RoomSubscription {
                room: room.clone(),
                state: RoomState::Unjoined,
                attempts: 0,
            });
            slot.generation
        };
        self.inner.attempt(generation);
    }

    /// Leaves `room` if it is the room of this surface.
    pub fn leave(&self, room: &Conversation) {
        let mut slot = lock(&self.inner.slot);
        if slot.current.as_ref().is_some_and(|current| &current.room == room) {
            Self::leave_locked(&self.inner, &mut slot);
        }
    }

    /// Starts a fresh join round for the current room, e.g. after a reconnect.
    pub fn rejoin(&self) {
        let generation = {
            let mut slot = lock(&self.inner.slot);
            slot.generation += 1;
            slot.retry = None;
            match slot.current.as_mut() {
                Some(subscription) => {
                    subscription.state = RoomState::Unjoined;
                    subscription.attempts = 0;
                }
                None => return,
            }
            slot.generation
        };
        self.inner.attempt(generation);
    }

    /// Leaves whatever room is current.
    pub fn teardown(&self) {
        let mut slot = lock(&self.inner.slot);
        Self::leave_locked(&self.inner, &mut slot);
    }

    pub fn current(&self) -> Option<RoomSubscription> {
        lock(&self.inner.slot).current.clone()
    }

    pub fn state_of(&self, room: &Conversation) -> RoomState {
        lock(&self.inner.slot)
            .current
            .as_ref()
            .filter(|current| &current.room == room)
            .map_or(RoomState::Unjoined, |current| current.state)
    }

    pub fn retry_pending(&self) -> bool {
        lock(&self.inner.slot).retry.is_some()
    }

    fn leave_locked(inner: &ControllerInner, slot: &mut Slot) {
        slot.generation += 1;
        slot.retry = None;
        if let Some(previous) = slot.current.take() {
            if previous.state == RoomState::Joined {
                inner.sink.send_command(ClientCommand::leave(&previous.room));
            }
            tracing::debug!(
                target: "chatsync::rooms::leave",
                room = %previous.room,
                "Left room"
            );
        }
    }
}

impl Drop for RoomSubscriptionController {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl fmt::Debug for RoomSubscriptionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoomSubscriptionController")
            .field("current", &self.current())
            .field("policy", &self.inner.policy)
            .finish()
    }
}

/// Session-wide list of live room controllers, rejoined after every reconnect.
#[derive(Default)]
pub struct RoomRegistry {
    controllers: Mutex<Vec<Weak<RoomSubscriptionController>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, controller: &Arc<RoomSubscriptionController>) {
        let mut controllers = lock(&self.controllers);
        controllers.retain(|weak| weak.strong_count() > 0);
        controllers.push(Arc::downgrade(controller));
    }

    /// Starts a fresh join round on every live controller. Returns how many were live.
    pub fn rejoin_all(&self) -> usize {
        let live: Vec<Arc<RoomSubscriptionController>> = {
            let mut controllers = lock(&self.controllers);
            controllers.retain(|weak| weak.strong_count() > 0);
            controllers.iter().filter_map(Weak::upgrade).collect()
        };
        for controller in &live {
            controller.rejoin();
        }
        tracing::debug!(
            target: "chatsync::rooms::rejoin_all",
            controllers = live.len(),
            "Rejoined rooms after connect"
        );
        live.len()
    }

    pub fn len(&self) -> usize {
        lock(&self.controllers)
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for RoomRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoomRegistry").field("live", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chatsync::test_utils::{ManualScheduler, RecordingSink};
    use std::time::Duration;

    fn controller(
        connected: bool,
    ) -> (RoomSubscriptionController, Arc<RecordingSink>, Arc<ManualScheduler>) {
        let sink = Arc::new(RecordingSink::new(connected));
        let scheduler = Arc::new(ManualScheduler::new());
        let controller =
            RoomSubscriptionController::new(
                sink.clone(),
                scheduler.clone(),
                JoinRetryPolicy::default(),
            );
        (controller, sink, scheduler)
    }

    #[test]
    fn test_join_twice_emits_once() {
        let (controller, sink, _scheduler) = controller(true);
        let room = Conversation::channel("c1");

        controller.join(&room);
        controller.join(&room);

        assert_eq!(sink.sent(), vec![ClientCommand::JoinChannel("c1".into())]);
        assert_eq!(controller.state_of(&room), RoomState::Joined);
    }

    #[test]
    fn test_join_twice_while_offline_schedules_one_retry() {
        let (controller, sink, scheduler) = controller(false);
        let room = Conversation::channel("c1");

        controller.join(&room);
        controller.join(&room);

        assert_eq!(scheduler.pending(), 1);
        sink.set_connected(true);
        scheduler.advance(Duration::from_millis(200));
        assert_eq!(sink.sent(), vec![ClientCommand::JoinChannel("c1".into())]);
    }

    #[test]
    fn test_join_succeeds_on_third_attempt() {
        let (controller, sink, scheduler) = controller(false);
        let room = Conversation::direct("d1");

        controller.join(&room);
        assert_eq!(controller.state_of(&room), RoomState::Unjoined);
        scheduler.advance(Duration::from_millis(200));
        assert_eq!(controller.current().unwrap().attempts, 2);

        sink.set_connected(true);
        scheduler.advance(Duration::from_millis(200));

        let current = controller.current().unwrap();
        assert_eq!(current.state, RoomState::Joined);
        assert_eq!(current.attempts, 3);
        assert_eq!(sink.sent(), vec![ClientCommand::JoinDm("d1".into())]);
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_gives_up_after_retries_are_exhausted() {
        let (controller, sink, scheduler) = controller(false);
        let room = Conversation::channel("c1");

        controller.join(&room);
        for _ in 0..3 {
            scheduler.advance(Duration::from_millis(200));
        }

        let current = controller.current().unwrap();
        assert_eq!(current.state, RoomState::Unjoined);
        assert_eq!(current.attempts, 4);
        assert_eq!(scheduler.pending(), 0);

        sink.set_connected(true);
        scheduler.advance(Duration::from_secs(5));
        assert!(sink.sent().is_empty());
    }

    #[test]
    fn test_join_after_give_up_starts_new_round() {
        let (controller, sink, scheduler) = controller(false);
        let room = Conversation::channel("c1");

        controller.join(&room);
        scheduler.advance(Duration::from_secs(1));
        sink.set_connected(true);
        controller.join(&room);

        assert_eq!(controller.state_of(&room), RoomState::Joined);
    }

    #[test]
    fn test_leave_cancels_retry_without_leave_notification() {
        let (controller, sink, scheduler) = controller(false);
        let room = Conversation::channel("c1");

        controller.join(&room);
        controller.leave(&room);

        assert_eq!(scheduler.pending(), 0);
        assert!(controller.current().is_none());
        sink.set_connected(true);
        scheduler.advance(Duration::from_secs(1));
        assert!(sink.sent().is_empty());
    }

    #[test]
    fn test_leave_joined_room_emits_leave() {
        let (controller, sink, _scheduler) = controller(true);
        let room = Conversation::direct("d1");

        controller.join(&room);
        controller.leave(&room);

        assert_eq!(
            sink.sent(),
            vec![ClientCommand::JoinDm("d1".into()), ClientCommand::LeaveDm("d1".into())]
        );
        assert_eq!(controller.state_of(&room), RoomState::Unjoined);
    }

    #[test]
    fn test_switching_rooms_leaves_the_old_one() {
        let (controller, sink, _scheduler) = controller(true);

        controller.join(&Conversation::channel("a"));
        controller.join(&Conversation::channel("b"));

        assert_eq!(
            sink.sent(),
            vec![
                ClientCommand::JoinChannel("a".into()),
                ClientCommand::LeaveChannel("a".into()),
                ClientCommand::JoinChannel("b".into()),
            ]
        );
    }

    #[test]
    fn test_rejoin_sends_join_again() {
        let (controller, sink, _scheduler) = controller(true);
        let room = Conversation::channel("c1");

        controller.join(&room);
        controller.rejoin();

        assert_eq!(sink.sent().len(), 2);
        assert_eq!(controller.state_of(&room), RoomState::Joined);
    }

    #[test]
    fn test_drop_tears_down() {
        let (controller, sink, scheduler) = controller(true);
        controller.join(&Conversation::channel("c1"));
        drop(controller);

        assert_eq!(sink.sent().last(), Some(&ClientCommand::LeaveChannel("c1".into())));
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_registry_rejoins_live_controllers_only() {
        let sink = Arc::new(RecordingSink::new(true));
        let scheduler = Arc::new(ManualScheduler::new());
        let registry = RoomRegistry::new();

        let kept = Arc::new(RoomSubscriptionController::new(
            sink.clone(),
            scheduler.clone(),
            JoinRetryPolicy::default(),
        ));
        let dropped = Arc::new(RoomSubscriptionController::new(
            sink.clone(),
            scheduler.clone(),
            JoinRetryPolicy::default(),
        ));
        registry.register(&kept);
        registry.register(&dropped);
        kept.join(&Conversation::channel("a"));
        dropped.join(&Conversation::channel("b"));
        drop(dropped);

        assert_eq!(registry.rejoin_all(), 1);
        assert_eq!(sink.sent().last(), Some(&ClientCommand::JoinChannel("a".into())));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_rejoin_without_room_is_noop() {
        let (controller, sink, _scheduler) = controller(true);
        controller.rejoin();
        assert!(sink.sent().is_empty());
    }
}
