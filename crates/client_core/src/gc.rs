//! Reachability-based eviction of cached messages.
//!
//! A sweep computes the set of message keys something still depends on and
//! evicts every other message. Evicted entities are only retired; their slots
//! are destroyed by the graveyard flush on a later timer tick.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use shared::domain::{EntityKind, Peer, UnifiedKey};
use tracing::{debug, info};

use crate::{requests::RequestPurpose, Mirror, MirrorEvent, TimerKind};

/// A live consumer of cached messages, such as an open chat or a result list.
pub trait MessageView: Send + Sync {
    fn current_message_keys(&self) -> HashSet<UnifiedKey>;

    /// Conversation the view shows in full, if any.
    fn current_scope(&self) -> Option<Peer>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ViewId(pub u64);

#[derive(Default)]
pub struct ViewRegistry {
    views: HashMap<ViewId, Arc<dyn MessageView>>,
    next_id: u64,
}

impl ViewRegistry {
    pub fn register(&mut self, view: Arc<dyn MessageView>) -> ViewId {
        self.next_id += 1;
        let id = ViewId(self.next_id);
        self.views.insert(id, view);
        id
    }

    pub fn unregister(&mut self, id: ViewId) -> bool {
        self.views.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    fn iter(&self) -> impl Iterator<Item = &Arc<dyn MessageView>> + '_ {
        self.views.values()
    }
}

impl Mirror {
    pub fn register_view(&mut self, view: Arc<dyn MessageView>) -> ViewId {
        let id = self.views.register(view);
        debug!(view = id.0, "gc: view registered");
        self.schedule_sweep();
        id
    }

    pub fn unregister_view(&mut self, id: ViewId) -> bool {
        let removed = self.views.unregister(id);
        if removed {
            self.schedule_sweep();
        }
        removed
    }

    /// Debounced: every call pushes the sweep back by the full cleanup delay.
    pub fn schedule_sweep(&mut self) {
        let delay = self.settings.cleanup_delay();
        self.timers.arm(TimerKind::CleanupSweep, delay);
    }

    /// Arms a sweep without postponing one already due, so a steady stream
    /// of pushes cannot hold eviction off.
    pub(crate) fn ensure_sweep(&mut self) {
        let delay = self.settings.cleanup_delay();
        self.timers.arm_if_idle(TimerKind::CleanupSweep, delay);
    }

    /// Every message key something still depends on.
    pub fn locked_keys(&self) -> HashSet<UnifiedKey> {
        let mut locked: HashSet<UnifiedKey> = self
            .conversations
            .iter()
            .filter_map(|(_, conversation)| conversation.top_message)
            .collect();

        for view in self.views.iter() {
            locked.extend(view.current_message_keys());
            if let Some(scope) = view.current_scope() {
                locked.extend(self.ordering.messages(&scope).iter().copied());
            }
        }

        locked.extend(self.outbox_keys().copied());
        locked.extend(
            self.transfers
                .iter()
                .filter(|(_, transfer)| !transfer.state.is_terminal())
                .filter_map(|(_, transfer)| transfer.message.or(transfer.owner.message)),
        );
        locked.extend(self.pending_fetches.waiting_keys().copied());
        locked.extend(self.pending_fetches.targets().copied());
        locked.extend(self.search_results.iter().copied());
        for purpose in self.requests.purposes() {
            if let RequestPurpose::FetchMessages { targets, .. } = purpose {
                locked.extend(targets.iter().copied());
            }
        }
        locked
    }

    /// Evicts every unreachable message. Returns how many were evicted.
    pub fn sweep(&mut self) -> usize {
        let locked = self.locked_keys();
        let mut doomed: Vec<UnifiedKey> = self
            .messages
            .keys()
            .filter(|key| !locked.contains(*key))
            .copied()
            .collect();
        doomed.sort();
        for key in &doomed {
            self.evict_message(*key, false);
        }
        if !doomed.is_empty() {
            info!(evicted = doomed.len(), kept = self.messages.len(), "gc: sweep finished");
        }
        doomed.len()
    }

    /// Detaches a message from the cache and the ordering index.
    ///
    /// With `purge` the durable copy is deleted too. The entity stays
    /// resolvable through handles until the next graveyard flush.
    pub fn evict_message(&mut self, key: UnifiedKey, purge: bool) -> bool {
        let Some(peer) = self.messages.lookup(&key).map(|message| message.peer) else {
            return false;
        };
        self.messages.retire(&key);
        self.ordering.remove_message(&peer, &key);
        self.pending_fetches.remove_waiter(&key);
        self.search_results.retain(|result| *result != key);
        if purge {
            self.store.delete(EntityKind::Message, key.to_string());
        }
        self.emit(MirrorEvent::MessageRemoved(key));
        self.arm_graveyard();
        true
    }

    /// Destroys everything retired since the last flush.
    pub fn flush_graveyard(&mut self) -> usize {
        let flushed = self.messages.flush_retired()
            + self.conversations.flush_retired()
            + self.users.flush_retired()
            + self.groups.flush_retired()
            + self.sessions.flush_retired()
            + self.sticker_sets.flush_retired()
            + self.transfers.flush_retired()
            + self.contacts.flush_retired();
        if flushed > 0 {
            debug!(flushed, "gc: graveyard flushed");
        }
        flushed
    }
}
