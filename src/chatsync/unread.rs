//! Per-conversation unread counters and the aggregate badge.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::chatsync::utils::lock;
use crate::types::ConversationId;

/// Server snapshot used to (re)hydrate the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadSnapshot {
    pub counts: HashMap<ConversationId, u32>,
    #[serde(default)]
    pub muted: HashSet<ConversationId>,
}

impl From<HashMap<ConversationId, u32>> for UnreadSnapshot {
    fn from(counts: HashMap<ConversationId, u32>) -> Self {
        Self {
            counts,
            muted: HashSet::new(),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    counts: HashMap<ConversationId, u32>,
    muted: HashSet<ConversationId>,
}

impl Counters {
    fn load(&mut self, counts: HashMap<ConversationId, u32>) {
        self.counts = counts
            .into_iter()
            .filter(|(id, count)| *count > 0 && !self.muted.contains(id))
            .collect();
    }

    fn total(&self) -> u64 {
        self.counts
            .iter()
            .filter(|(id, _)| !self.muted.contains(*id))
            .map(|(_, count)| u64::from(*count))
            .sum()
    }
}

/// Unread bookkeeping shared by the dispatcher, the read reporter and the UI.
///
/// Muted conversations read as zero and ignore increments. Every mutating call
/// recomputes the aggregate and publishes it when it changed.
#[derive(Debug)]
pub struct UnreadCounterStore {
    counters: Mutex<Counters>,
    total: watch::Sender<u64>,
}

impl UnreadCounterStore {
    pub fn new() -> Self {
        let (total, _) = watch::channel(0);
        Self {
            counters: Mutex::new(Counters::default()),
            total,
        }
    }

    pub fn increment(&self, conversation: &ConversationId) {
        self.mutate(|counters| {
            if counters.muted.contains(conversation) {
                return;
            }
            *counters.counts.entry(conversation.clone()).or_insert(0) += 1;
        });
    }

    /// Floors at zero; an entry that reaches zero is removed.
    pub fn decrement(&self, conversation: &ConversationId) {
        self.mutate(|counters| {
            if let Some(count) = counters.counts.get_mut(conversation) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    counters.counts.remove(conversation);
                }
            }
        });
    }

    /// Ignored for muted conversations.
    pub fn set(&self, conversation: &ConversationId, count: u32) {
        self.mutate(|counters| {
            if counters.muted.contains(conversation) {
                return;
            }
            if count == 0 {
                counters.counts.remove(conversation);
            } else {
                counters.counts.insert(conversation.clone(), count);
            }
        });
    }

    pub fn clear(&self, conversation: &ConversationId) {
        self.mutate(|counters| {
            counters.counts.remove(conversation);
        });
    }

    pub fn mute(&self, conversation: &ConversationId) {
        self.mutate(|counters| {
            counters.muted.insert(conversation.clone());
        });
    }

    /// A count stored before muting becomes visible again.
    pub fn unmute(&self, conversation: &ConversationId) {
        self.mutate(|counters| {
            counters.muted.remove(conversation);
        });
    }

    /// Replaces both the counts and the mute set. Counts of muted
    /// conversations are dropped on load.
    pub fn hydrate(&self, snapshot: UnreadSnapshot) {
        let UnreadSnapshot { counts, muted } = snapshot;
        self.mutate(move |counters| {
            counters.muted = muted;
            counters.load(counts);
        });
        tracing::debug!(
            target: "chatsync::unread::hydrate",
            total = self.total(),
            "Unread counters hydrated"
        );
    }

    /// Replaces the counts and keeps the current mute set, in one critical
    /// section so a concurrent `mute` is never lost.
    pub fn hydrate_counts(&self, counts: HashMap<ConversationId, u32>) {
        self.mutate(move |counters| counters.load(counts));
        tracing::debug!(
            target: "chatsync::unread::hydrate_counts",
            total = self.total(),
            "Unread counts refreshed"
        );
    }

    pub fn get(&self, conversation: &ConversationId) -> u32 {
        let counters = lock(&self.counters);
        if counters.muted.contains(conversation) {
            return 0;
        }
        counters.counts.get(conversation).copied().unwrap_or(0)
    }

    pub fn is_muted(&self, conversation: &ConversationId) -> bool {
        lock(&self.counters).muted.contains(conversation)
    }

    pub fn muted(&self) -> HashSet<ConversationId> {
        lock(&self.counters).muted.clone()
    }

    pub fn total(&self) -> u64 {
        *self.total.borrow()
    }

    pub fn subscribe_total(&self) -> watch::Receiver<u64> {
        self.total.subscribe()
    }

    fn mutate(&self, change: impl FnOnce(&mut Counters)) {
        let total = {
            let mut counters = lock(&self.counters);
            change(&mut counters);
            counters.total()
        };
        self.total.send_if_modified(|current| {
            if *current == total {
                false
            } else {
                *current = total;
                true
            }
        });
    }
}

impl Default for UnreadCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(value: &str) -> ConversationId {
        ConversationId::from(value)
    }

    #[test]
    fn test_increment_and_total() {
        let store = UnreadCounterStore::new();
        store.increment(&id("a"));
        store.increment(&id("a"));
        store.increment(&id("b"));

        assert_eq!(store.get(&id("a")), 2);
        assert_eq!(store.total(), 3);
    }

    #[test]
    fn test_decrement_floors_at_zero() {
        let store = UnreadCounterStore::new();
        store.decrement(&id("a"));
        assert_eq!(store.get(&id("a")), 0);

        store.set(&id("a"), 1);
        store.decrement(&id("a"));
        store.decrement(&id("a"));
        assert_eq!(store.get(&id("a")), 0);
        assert_eq!(store.total(), 0);
    }

    #[test]
    fn test_muted_conversation_reads_zero_and_ignores_updates() {
        let store = UnreadCounterStore::new();
        store.mute(&id("a"));
        store.increment(&id("a"));
        store.set(&id("a"), 9);

        assert_eq!(store.get(&id("a")), 0);
        assert_eq!(store.total(), 0);
    }

    #[test]
    fn test_unmute_restores_count_kept_while_muted() {
        let store = UnreadCounterStore::new();
        store.set(&id("a"), 4);
        store.mute(&id("a"));
        assert_eq!(store.total(), 0);

        store.unmute(&id("a"));
        assert_eq!(store.get(&id("a")), 4);
        assert_eq!(store.total(), 4);
    }

    #[test]
    fn test_hydrate_replaces_state_and_drops_muted_entries() {
        let store = UnreadCounterStore::new();
        store.set(&id("stale"), 3);

        let snapshot = UnreadSnapshot {
            counts: HashMap::from([(id("a"), 2), (id("b"), 5)]),
            muted: HashSet::from([id("b")]),
        };
        store.hydrate(snapshot);

        assert_eq!(store.get(&id("stale")), 0);
        assert_eq!(store.get(&id("a")), 2);
        assert_eq!(store.get(&id("b")), 0);
        assert_eq!(store.total(), 2);

        // Count dropped at load time does not reappear on unmute.
        store.unmute(&id("b"));
        assert_eq!(store.get(&id("b")), 0);
    }

    #[test]
    fn test_hydrate_counts_keeps_local_mute_set() {
        let store = UnreadCounterStore::new();
        store.set(&id("stale"), 3);
        store.mute(&id("b"));

        store.hydrate_counts(HashMap::from([(id("a"), 2), (id("b"), 5), (id("c"), 0)]));

        assert!(store.is_muted(&id("b")));
        assert_eq!(store.get(&id("stale")), 0);
        assert_eq!(store.get(&id("a")), 2);
        assert_eq!(store.total(), 2);
        store.unmute(&id("b"));
        assert_eq!(store.get(&id("b")), 0);
    }

    #[test]
    fn test_clear_resets_one_conversation() {
        let store = UnreadCounterStore::new();
        store.set(&id("a"), 2);
        store.set(&id("b"), 1);
        store.clear(&id("a"));

        assert_eq!(store.get(&id("a")), 0);
        assert_eq!(store.total(), 1);
    }

    #[tokio::test]
    async fn test_total_is_published_on_change() {
        let store = UnreadCounterStore::new();
        let mut total = store.subscribe_total();

        store.increment(&id("a"));
        total.changed().await.unwrap();
        assert_eq!(*total.borrow_and_update(), 1);

        store.mute(&id("a"));
        total.changed().await.unwrap();
        assert_eq!(*total.borrow_and_update(), 0);
    }
}
