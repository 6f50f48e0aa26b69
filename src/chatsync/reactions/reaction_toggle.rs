use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};

use super::{AuthoritativeOutcome, InFlight, Notice, OptimisticCoordinator, OptimisticMutation};
use crate::api::ServerApi;
use crate::error::{ChatSyncError, Result};
use crate::types::{
    MessageId, ReactionAction, ReactionGroup, ReactionUpdate, UserId, normalize_reactions,
};

pub fn has_reacted(groups: &[ReactionGroup], emoji: &str, user_id: &UserId) -> bool {
    groups
        .iter()
        .any(|group| group.emoji == emoji && group.contains(user_id))
}

/// Applies one user's add/remove to a reaction list.
///
/// Groups are created on the first reaction and deleted when their last user
/// leaves; counts always match the user sets.
pub fn apply_reaction(
    groups: &[ReactionGroup],
    emoji: &str,
    user_id: &UserId,
    action: ReactionAction,
) -> Vec<ReactionGroup> {
    let mut next = groups.to_vec();
    match next.iter().position(|group| group.emoji == emoji) {
        Some(index) => {
            let group = &mut next[index];
            match action {
                ReactionAction::Add => {
                    group.user_ids.insert(user_id.clone());
                }
                ReactionAction::Remove => {
                    group.user_ids.remove(user_id);
                }
            }
            group.count = group.user_ids.len() as u32;
            if group.user_ids.is_empty() {
                next.remove(index);
            }
        }
        None => {
            if action == ReactionAction::Add {
                next.push(ReactionGroup::new(emoji, [user_id.clone()]));
            }
        }
    }
    next
}

fn users_of<'a>(groups: &'a [ReactionGroup], emoji: &str) -> Option<&'a BTreeSet<UserId>> {
    groups
        .iter()
        .find(|group| group.emoji == emoji)
        .map(|group| &group.user_ids)
}

/// The current user adding or removing one emoji on one message.
pub struct ReactionToggle {
    pub message_id: MessageId,
    pub emoji: String,
    pub action: ReactionAction,
    pub user_id: UserId,
    api: Arc<dyn ServerApi>,
}

impl fmt::Debug for ReactionToggle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactionToggle")
            .field("message_id", &self.message_id)
            .field("emoji", &self.emoji)
            .field("action", &self.action)
            .field("user_id", &self.user_id)
            .finish()
    }
}

#[async_trait]
impl OptimisticMutation for ReactionToggle {
    type State = Vec<ReactionGroup>;
    type Confirmed = Vec<ReactionGroup>;

    fn apply(&self, state: &Vec<ReactionGroup>) -> Vec<ReactionGroup> {
        apply_reaction(state, &self.emoji, &self.user_id, self.action)
    }

    async fn submit(&self) -> Result<Vec<ReactionGroup>> {
        self.api
            .toggle_reaction(&self.message_id, &self.emoji, &self.user_id)
            .await
    }

    fn reconcile(
        &self,
        _state: &Vec<ReactionGroup>,
        confirmed: Vec<ReactionGroup>,
    ) -> Vec<ReactionGroup> {
        normalize_reactions(confirmed)
    }

    fn conflicts_with(&self, before: &Vec<ReactionGroup>, incoming: &Vec<ReactionGroup>) -> bool {
        users_of(before, &self.emoji) != users_of(incoming, &self.emoji)
    }

    fn failure_notice(&self, error: &ChatSyncError) -> Notice {
        let verb = match self.action {
            ReactionAction::Add => "add",
            ReactionAction::Remove => "remove",
        };
        let reason = if error.is_permission_denied() {
            "permission denied".to_string()
        } else {
            "please try again".to_string()
        };
        Notice::new(format!("Could not {} reaction {}: {}", verb, self.emoji, reason))
    }
}

/// What a remote `reaction-updated` did to a tracked message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOutcome {
    OtherMessage,
    /// Broadcast of the current user's own toggle.
    EchoSuppressed,
    Applied(AuthoritativeOutcome),
}

/// Reaction state of one message, with at most one toggle in flight.
pub struct ReactionCoordinator {
    message_id: MessageId,
    current_user: UserId,
    api: Arc<dyn ServerApi>,
    coordinator: OptimisticCoordinator<ReactionToggle>,
}

impl ReactionCoordinator {
    pub fn new(
        message_id: MessageId,
        initial: Vec<ReactionGroup>,
        current_user: UserId,
        api: Arc<dyn ServerApi>,
        notices: broadcast::Sender<Notice>,
        runtime: Handle,
    ) -> Self {
        let coordinator = OptimisticCoordinator::new(
            format!("reactions:{}", message_id),
            normalize_reactions(initial),
            notices,
            runtime,
        );
        Self {
            message_id,
            current_user,
            api,
            coordinator,
        }
    }

    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }

    /// Adds the emoji if the current user has not used it on this message,
    /// removes it otherwise. `None` while a previous toggle is pending.
    pub fn toggle_reaction(&self, emoji: &str) -> Option<InFlight> {
        let in_flight = self.coordinator.submit_with(|groups| {
            let action = if has_reacted(groups, emoji, &self.current_user) {
                ReactionAction::Remove
            } else {
                ReactionAction::Add
            };
            ReactionToggle {
                message_id: self.message_id.clone(),
                emoji: emoji.to_string(),
                action,
                user_id: self.current_user.clone(),
                api: self.api.clone(),
            }
        });

        if in_flight.is_some() {
            tracing::debug!(
                target: "chatsync::reactions::toggle_reaction",
                message_id = %self.message_id,
                emoji,
                "Reaction toggle submitted"
            );
        }
        in_flight
    }

    pub fn apply_remote(&self, update: &ReactionUpdate) -> RemoteOutcome {
        if update.message_id != self.message_id {
            return RemoteOutcome::OtherMessage;
        }
        if update.user_id == self.current_user {
            tracing::trace!(
                target: "chatsync::reactions::apply_remote",
                message_id = %self.message_id,
                "Ignoring echo of own reaction"
            );
            return RemoteOutcome::EchoSuppressed;
        }
        let incoming = normalize_reactions(update.reactions.clone());
        RemoteOutcome::Applied(self.coordinator.apply_authoritative(incoming))
    }

    pub fn reactions(&self) -> Vec<ReactionGroup> {
        self.coordinator.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<ReactionGroup>> {
        self.coordinator.subscribe()
    }

    pub fn is_pending(&self) -> bool {
        self.coordinator.is_pending()
    }
}

impl fmt::Debug for ReactionCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactionCoordinator")
            .field("message_id", &self.message_id)
            .field("current_user", &self.current_user)
            .field("coordinator", &self.coordinator)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chatsync::reactions::MutationOutcome;
    use crate::chatsync::test_utils::{MockServerApi, ToggleOutcome};

    fn user(id: &str) -> UserId {
        UserId::from(id)
    }

    fn coordinator(
        initial: Vec<ReactionGroup>,
        api: Arc<MockServerApi>,
    ) -> (ReactionCoordinator, broadcast::Receiver<Notice>) {
        let (notices, rx) = broadcast::channel(8);
        (
            ReactionCoordinator::new(
                MessageId::from("M"),
                initial,
                user("me"),
                api,
                notices,
                Handle::current(),
            ),
            rx,
        )
    }

    #[test]
    fn test_apply_reaction_creates_and_deletes_groups() {
        let me = user("me");
        let added = apply_reaction(&[], "👍", &me, ReactionAction::Add);
        assert_eq!(added, vec![ReactionGroup::new("👍", [me.clone()])]);

        let removed = apply_reaction(&added, "👍", &me, ReactionAction::Remove);
        assert!(removed.is_empty());
    }

    #[test]
    fn test_apply_reaction_keeps_one_entry_per_user() {
        let me = user("me");
        let groups = vec![ReactionGroup::new("🎉", [user("a"), me.clone()])];
        let again = apply_reaction(&groups, "🎉", &me, ReactionAction::Add);
        assert_eq!(again[0].count, 2);

        let removed = apply_reaction(&groups, "🎉", &me, ReactionAction::Remove);
        assert_eq!(removed[0].count, 1);
        assert!(!has_reacted(&removed, "🎉", &me));
    }

    #[tokio::test]
    async fn test_offline_toggle_rolls_back_to_exact_snapshot() {
        let api = Arc::new(MockServerApi::new());
        api.script_toggle(ToggleOutcome::Fail(ChatSyncError::Transport("offline".to_string())));
        let initial = vec![ReactionGroup::new("❤️", [user("a")])];
        let (coordinator, mut notices) = coordinator(initial.clone(), api.clone());

        let in_flight = coordinator.toggle_reaction("👍").unwrap();
        assert!(has_reacted(&coordinator.reactions(), "👍", &user("me")));

        assert!(matches!(in_flight.settled().await, MutationOutcome::RolledBack { .. }));
        assert_eq!(coordinator.reactions(), initial);
        assert!(!coordinator.reactions().iter().any(|g| g.emoji == "👍"));
        assert!(notices.recv().await.unwrap().message.contains("👍"));
    }

    #[tokio::test]
    async fn test_success_takes_server_list_verbatim() {
        let api = Arc::new(MockServerApi::new());
        let server_list = vec![
            ReactionGroup::new("👍", [user("me"), user("b")]),
            ReactionGroup::new("🔥", [user("c")]),
        ];
        api.script_toggle(ToggleOutcome::Succeed(server_list.clone()));
        let (coordinator, _notices) = coordinator(vec![], api.clone());

        let outcome = coordinator.toggle_reaction("👍").unwrap().settled().await;

        assert_eq!(outcome, MutationOutcome::Confirmed);
        assert_eq!(coordinator.reactions(), server_list);
        assert!(!coordinator.is_pending());
    }

    #[tokio::test]
    async fn test_toggle_removes_existing_reaction() {
        let api = Arc::new(MockServerApi::new());
        api.script_toggle(ToggleOutcome::Succeed(vec![]));
        let (coordinator, _notices) =
            coordinator(vec![ReactionGroup::new("👍", [user("me")])], api.clone());

        let in_flight = coordinator.toggle_reaction("👍").unwrap();
        assert!(coordinator.reactions().is_empty());
        in_flight.settled().await;

        let calls = api.toggle_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, "👍");
    }

    #[tokio::test]
    async fn test_double_toggle_sends_one_request() {
        let api = Arc::new(MockServerApi::new());
        let gate = api.hold_toggles();
        api.script_toggle(ToggleOutcome::Succeed(vec![ReactionGroup::new("👍", [user("me")])]));
        let (coordinator, _notices) = coordinator(vec![], api.clone());

        let first = coordinator.toggle_reaction("👍").unwrap();
        assert!(coordinator.toggle_reaction("👍").is_none());
        assert!(has_reacted(&coordinator.reactions(), "👍", &user("me")));

        gate.release();
        first.settled().await;
        assert_eq!(api.toggle_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_own_echo_is_suppressed() {
        let api = Arc::new(MockServerApi::new());
        let (coordinator, _notices) = coordinator(vec![], api);

        let echo = ReactionUpdate {
            message_id: MessageId::from("M"),
            action: ReactionAction::Add,
            reactions: vec![ReactionGroup::new("👍", [user("me")])],
            user_id: user("me"),
        };

        assert_eq!(coordinator.apply_remote(&echo), RemoteOutcome::EchoSuppressed);
        assert!(coordinator.reactions().is_empty());
    }

    #[tokio::test]
    async fn test_other_users_update_applies_while_pending() {
        let api = Arc::new(MockServerApi::new());
        let gate = api.hold_toggles();
        api.script_toggle(ToggleOutcome::Fail(ChatSyncError::Transport("offline".to_string())));
        let (coordinator, _notices) = coordinator(vec![], api.clone());

        let in_flight = coordinator.toggle_reaction("👍").unwrap();
        let remote = ReactionUpdate {
            message_id: MessageId::from("M"),
            action: ReactionAction::Add,
            reactions: vec![ReactionGroup::new("🔥", [user("other")])],
            user_id: user("other"),
        };
        assert_eq!(
            coordinator.apply_remote(&remote),
            RemoteOutcome::Applied(AuthoritativeOutcome::Rebased)
        );
        let during = coordinator.reactions();
        assert!(has_reacted(&during, "🔥", &user("other")));
        assert!(has_reacted(&during, "👍", &user("me")));

        gate.release();
        in_flight.settled().await;
        // The rollback drops only the local change.
        assert_eq!(coordinator.reactions(), vec![ReactionGroup::new("🔥", [user("other")])]);
    }

    #[tokio::test]
    async fn test_update_on_contested_emoji_is_deferred() {
        let api = Arc::new(MockServerApi::new());
        let gate = api.hold_toggles();
        api.script_toggle(ToggleOutcome::Fail(ChatSyncError::Transport("offline".to_string())));
        let (coordinator, _notices) = coordinator(vec![], api.clone());

        let in_flight = coordinator.toggle_reaction("👍").unwrap();
        let remote = ReactionUpdate {
            message_id: MessageId::from("M"),
            action: ReactionAction::Add,
            reactions: vec![ReactionGroup::new("👍", [user("other")])],
            user_id: user("other"),
        };
        assert_eq!(
            coordinator.apply_remote(&remote),
            RemoteOutcome::Applied(AuthoritativeOutcome::Deferred)
        );
        assert_eq!(coordinator.reactions(), vec![ReactionGroup::new("👍", [user("me")])]);

        gate.release();
        in_flight.settled().await;
        assert_eq!(coordinator.reactions(), vec![ReactionGroup::new("👍", [user("other")])]);
    }

    #[tokio::test]
    async fn test_update_for_other_message_is_ignored() {
        let api = Arc::new(MockServerApi::new());
        let (coordinator, _notices) = coordinator(vec![], api);
        let update = ReactionUpdate {
            message_id: MessageId::from("N"),
            action: ReactionAction::Add,
            reactions: vec![ReactionGroup::new("👍", [user("x")])],
            user_id: user("x"),
        };
        assert_eq!(coordinator.apply_remote(&update), RemoteOutcome::OtherMessage);
    }
}
