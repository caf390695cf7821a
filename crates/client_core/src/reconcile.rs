use std::collections::HashSet;

use shared::{
    domain::{unify, EntityKind, Peer, UnifiedKey, UserId},
    protocol::{ChatRecord, DialogListKind, DialogRecord, MessageRecord, ProtocolRequest, UserRecord},
};
use tracing::{debug, info};

use crate::{
    coalesce::{Admission, Waiter},
    durable::Snapshot,
    entities::{Conversation, Group, Message, ReplyRef, User},
    entity_store::{Provenance, UpsertOutcome},
    requests::RequestPurpose,
    Mirror, MirrorEvent, TimerKind,
};

impl Mirror {
    /// Reconciles one message into the cache.
    ///
    /// Returns `None` for messages with nothing to render. The conversation's
    /// top message is never touched here; see [`Mirror::set_top_message`].
    pub fn insert_message(
        &mut self,
        mut message: Message,
        provenance: Provenance,
    ) -> Option<(UnifiedKey, UpsertOutcome)> {
        if message.is_degenerate() {
            debug!(peer = %message.peer, id = message.id.0, "reconcile: dropping empty message");
            return None;
        }

        let peer = message.peer;
        let key = unify(message.id, peer.key_scope());
        message.key = key;

        if let Some(reply) = message.reply_to {
            let target = reply.target();
            message.reply_to = Some(if self.messages.contains(&target) {
                ReplyRef::Resolved(target)
            } else if self.pending_fetches.is_unavailable(&target) {
                ReplyRef::Unavailable(target)
            } else {
                if self.pending_fetches.add_reply_waiter(target, peer, key) {
                    self.fetch_messages(peer, vec![target]);
                }
                ReplyRef::Unresolved(target)
            });
        }

        let outcome = self.messages.upsert(key, message, provenance);
        match outcome {
            UpsertOutcome::Ignored => return Some((key, outcome)),
            UpsertOutcome::Unchanged => {}
            UpsertOutcome::Inserted => {
                self.ordering.insert_message(peer, key, &self.messages);
                self.emit(MirrorEvent::MessageInserted(key));
            }
            UpsertOutcome::Updated => {
                self.ordering.insert_message(peer, key, &self.messages);
                self.emit(MirrorEvent::MessageUpdated(key));
            }
        }

        if provenance.persists() && outcome != UpsertOutcome::Unchanged {
            self.persist_message(&key);
        }

        if let Some(entry) = self.pending_fetches.resolve(&key) {
            for waiter in &entry.waiters {
                let patched = self.messages.modify(waiter, |message| {
                    message.reply_to = Some(ReplyRef::Resolved(key));
                });
                if patched {
                    self.persist_message(waiter);
                    self.emit(MirrorEvent::MessageUpdated(*waiter));
                }
            }
            debug!(key = %key, waiters = entry.waiters.len(), "reconcile: pending reference resolved");
        }

        if self.conversations.get(&peer).top_message == Some(key) {
            self.resort_conversations();
        }

        Some((key, outcome))
    }

    /// Points the conversation at `key` as its newest message.
    ///
    /// A key not cached yet is fetched so the top never dangles.
    pub fn set_top_message(&mut self, peer: Peer, key: Option<UnifiedKey>) -> bool {
        let changed = self.conversations.modify(&peer, |conversation| {
            conversation.top_message = key;
        });
        if !changed {
            return false;
        }
        if let Some(key) = key {
            self.ensure_top_present(peer, key);
        }
        self.persist_conversation(&peer);
        self.emit(MirrorEvent::ConversationChanged(peer));
        self.resort_conversations();
        true
    }

    fn ensure_top_present(&mut self, peer: Peer, key: UnifiedKey) {
        if self.messages.contains(&key) || self.pending_fetches.is_unavailable(&key) {
            return;
        }
        if self.pending_fetches.add_top_fetch(key, peer) {
            self.fetch_messages(peer, vec![key]);
        }
    }

    pub(crate) fn fetch_messages(&mut self, peer: Peer, targets: Vec<UnifiedKey>) {
        let ids = targets.iter().map(|key| key.local_id()).collect();
        self.issue(
            ProtocolRequest::GetMessages { peer, ids },
            RequestPurpose::FetchMessages { peer, targets },
        );
    }

    pub fn insert_conversation(
        &mut self,
        mut conversation: Conversation,
        provenance: Provenance,
    ) -> UpsertOutcome {
        let peer = conversation.peer;
        if let Some(existing) = self.conversations.lookup(&peer) {
            conversation.typing_users = existing.typing_users.clone();
            if conversation.encrypted && conversation.top_message.is_none() {
                conversation.top_message = existing.top_message;
            }
        }

        let top = conversation.top_message;
        let mute_until = conversation.mute_until;
        let outcome = self.conversations.upsert(peer, conversation, provenance);
        if outcome == UpsertOutcome::Ignored {
            return outcome;
        }

        if self.settings.global_mute && mute_until > 0 {
            self.muted.insert(peer);
        } else {
            self.muted.remove(&peer);
        }

        if let Some(top) = top {
            self.ensure_top_present(peer, top);
        }
        self.index_conversation(peer);
        self.resort_conversations();

        if outcome != UpsertOutcome::Unchanged {
            if provenance.persists() {
                self.persist_conversation(&peer);
            }
            self.emit(MirrorEvent::ConversationChanged(peer));
        }
        self.recompute_unread_total();
        outcome
    }

    /// Ensures a conversation exists, creating a local one when unknown.
    pub fn open_conversation(&mut self, peer: Peer) -> bool {
        if self.conversations.contains(&peer) {
            return false;
        }
        self.insert_conversation(Conversation::local(peer), Provenance::LocalOptimistic);
        true
    }

    pub fn upsert_user(&mut self, mut user: User, provenance: Provenance) -> UpsertOutcome {
        let id = user.id;
        if let Some(existing) = self.users.lookup(&id) {
            user.blocked = existing.blocked;
        }
        let outcome = self.users.upsert(id, user, provenance);
        if matches!(outcome, UpsertOutcome::Inserted | UpsertOutcome::Updated) {
            if provenance.persists() {
                self.persist_user(&id);
            }
            self.emit(MirrorEvent::UserChanged(id));
        }
        outcome
    }

    pub fn upsert_group(&mut self, group: Group, provenance: Provenance) -> UpsertOutcome {
        let peer = group.peer;
        let outcome = self.groups.upsert(peer, group, provenance);
        if matches!(outcome, UpsertOutcome::Inserted | UpsertOutcome::Updated) {
            if provenance.persists() {
                self.persist_group(&peer);
            }
            self.emit(MirrorEvent::GroupChanged(peer));
        }
        outcome
    }

    pub(crate) fn apply_users(&mut self, users: &[UserRecord], provenance: Provenance) {
        for record in users {
            self.upsert_user(User::from_record(record), provenance);
        }
    }

    pub(crate) fn apply_chats(&mut self, chats: &[ChatRecord], provenance: Provenance) {
        for record in chats {
            self.upsert_group(Group::from(record), provenance);
        }
    }

    /// Stub for a user known only by id, so lookups never come back empty-handed.
    pub(crate) fn ensure_user(&mut self, id: UserId) {
        if !self.users.contains(&id) {
            self.upsert_user(User::stub(id), Provenance::LivePush);
        }
    }

    /// Applies a full dialog listing for one kind.
    ///
    /// Conversations of that kind the listing no longer mentions are treated as
    /// deleted on the server.
    pub fn reconcile_dialogs(
        &mut self,
        kind: DialogListKind,
        dialogs: &[DialogRecord],
        messages: &[MessageRecord],
        users: &[UserRecord],
        chats: &[ChatRecord],
    ) {
        self.apply_users(users, Provenance::PullResponse);
        self.apply_chats(chats, Provenance::PullResponse);
        for record in messages {
            self.insert_message(Message::from_record(record), Provenance::PullResponse);
        }

        let mut candidates = self.deletion_candidates(kind);
        for dialog in dialogs {
            candidates.remove(&dialog.peer);
            self.insert_conversation(Conversation::from_record(dialog), Provenance::PullResponse);
        }

        let mut removed: Vec<Peer> = candidates.into_iter().collect();
        removed.sort();
        for peer in removed {
            info!(peer = %peer, ?kind, "reconcile: conversation missing from listing, removing");
            self.remove_conversation(peer);
        }

        if kind == DialogListKind::Direct {
            self.rehydrate_sessions();
        }
        self.schedule_sweep();
        info!(?kind, dialogs = dialogs.len(), "reconcile: dialog listing applied");
    }

    /// Known server-confirmed conversations a listing of `kind` is authoritative for.
    fn deletion_candidates(&self, kind: DialogListKind) -> HashSet<Peer> {
        let confirmed = self
            .conversations
            .iter()
            .filter(|(_, conversation)| !conversation.ephemeral && !conversation.encrypted)
            .map(|(peer, _)| *peer);
        match kind {
            DialogListKind::Direct => confirmed
                .filter(|peer| matches!(peer, Peer::User(_) | Peer::Group(_)))
                .collect(),
            DialogListKind::Channel => confirmed.filter(|peer| peer.is_channel()).collect(),
        }
    }

    /// Drops a conversation with its messages from memory and the durable store.
    pub fn remove_conversation(&mut self, peer: Peer) {
        for key in self.ordering.take_scope(&peer) {
            self.evict_message(key, false);
        }
        self.store
            .delete_scope(EntityKind::Message, peer.to_string());
        self.pending_fetches.drop_peer(&peer);

        let typing: Vec<UserId> = self
            .conversations
            .lookup(&peer)
            .map(|conversation| conversation.typing_users.iter().copied().collect())
            .unwrap_or_default();
        for user in typing {
            self.timers.disarm(&TimerKind::TypingExpiry(peer, user));
        }

        if self.conversations.retire(&peer) {
            self.ordering.remove_conversation(&peer);
            self.store
                .delete(EntityKind::Conversation, peer.to_string());
            self.emit(MirrorEvent::ConversationRemoved(peer));
            self.emit(MirrorEvent::ConversationsReordered);
        }
        self.muted.remove(&peer);
        self.arm_graveyard();
        self.recompute_unread_total();
    }

    pub fn refresh_dialogs(&mut self, kind: DialogListKind, waiter: Option<Waiter>) {
        if self.dialog_fetches.begin(kind, waiter) == Admission::Joined {
            debug!(?kind, "reconcile: dialog refresh already in flight");
            return;
        }
        let limit = self.settings.dialog_page_size;
        self.issue(
            ProtocolRequest::GetDialogs { kind, limit },
            RequestPurpose::Dialogs(kind),
        );
    }

    /// Debounced: a burst of triggers yields one refresh of both listings.
    pub fn schedule_dialog_refresh(&mut self) {
        let delay = self.settings.dialog_refresh();
        self.timers.arm(TimerKind::DialogRefresh, delay);
    }

    /// Loads a warm-start snapshot. Live data that already arrived wins.
    pub fn replay(&mut self, snapshot: Snapshot) {
        let Snapshot {
            conversations,
            mut messages,
            users,
            groups,
            sessions,
            sticker_sets,
            contacts,
        } = snapshot;

        for user in users {
            self.upsert_user(user, Provenance::StoreReplay);
        }
        for group in groups {
            self.upsert_group(group, Provenance::StoreReplay);
        }
        for session in sessions {
            let id = session.id;
            self.sessions.upsert(id, session, Provenance::StoreReplay);
        }
        for set in sticker_sets {
            self.sticker_index.insert(set.short_name.clone(), set.id);
            self.sticker_sets.upsert(set.id, set, Provenance::StoreReplay);
        }
        for contact in contacts {
            self.contacts
                .upsert(contact.user, contact, Provenance::StoreReplay);
        }

        messages.sort_by_key(|message| (message.date, message.id));
        let message_count = messages.len();
        for message in messages {
            self.insert_message(message, Provenance::StoreReplay);
        }
        let conversation_count = conversations.len();
        for conversation in conversations {
            self.insert_conversation(conversation, Provenance::StoreReplay);
        }

        self.rehydrate_sessions();
        info!(
            conversations = conversation_count,
            messages = message_count,
            "reconcile: warm start replayed"
        );
    }
}
