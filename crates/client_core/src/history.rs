//! History paging, read receipts and history deletion.

use std::collections::HashSet;

use shared::{
    domain::{unify, EntityKind, KeyScope, MessageId, Peer, SessionId, UnifiedKey},
    protocol::{ChatRecord, MessageRecord, ProtocolRequest, UserRecord},
};
use tracing::{debug, info, warn};

use crate::{
    coalesce::{Admission, Waiter},
    entities::Message,
    entity_store::Provenance,
    requests::RequestPurpose,
    Mirror, MirrorEvent,
};

impl Mirror {
    pub fn load_history(&mut self, peer: Peer, offset_id: MessageId, limit: i32) {
        self.issue(
            ProtocolRequest::GetHistory {
                peer,
                offset_id,
                limit,
            },
            RequestPurpose::History(peer),
        );
    }

    pub(crate) fn apply_history(
        &mut self,
        peer: Peer,
        messages: &[MessageRecord],
        users: &[UserRecord],
        chats: &[ChatRecord],
    ) {
        self.apply_users(users, Provenance::PullResponse);
        self.apply_chats(chats, Provenance::PullResponse);
        for record in messages {
            self.insert_message(Message::from_record(record), Provenance::PullResponse);
        }
        self.ordering.resort_scope(&peer, &self.messages);
        self.resort_conversations();
        self.schedule_sweep();
        debug!(peer = %peer, messages = messages.len(), "history: page applied");
    }

    /// Marks everything up to the top message as read.
    ///
    /// Concurrent calls for one peer share a single request.
    pub fn mark_read(&mut self, peer: Peer, waiter: Option<Waiter>) {
        if self.history_reads.begin(peer, waiter) == Admission::Joined {
            return;
        }
        if peer.is_secret() {
            self.finish_read(peer);
            return;
        }
        let max_id = self
            .conversations
            .get(&peer)
            .top_message
            .map(|key| key.local_id())
            .unwrap_or(MessageId(0));
        self.issue(
            ProtocolRequest::ReadHistory { peer, max_id },
            RequestPurpose::ReadHistory(peer),
        );
    }

    pub(crate) fn finish_read(&mut self, peer: Peer) {
        let top = self.conversations.get(&peer).top_message;
        self.conversations.modify(&peer, |conversation| {
            conversation.unread_count = 0;
            if let Some(top) = top {
                conversation.read_inbox_max_id = conversation.read_inbox_max_id.max(top.local_id().0);
            }
        });
        self.mark_messages_read(peer, |message| !message.out);
        self.persist_conversation(&peer);
        self.emit(MirrorEvent::ConversationChanged(peer));
        self.recompute_unread_total();
        self.history_reads.complete(&peer, Ok(()));

        if let Some(delete_chat) = self.deletes_after_read.remove(&peer) {
            self.delete_history(peer, delete_chat);
        }
    }

    pub(crate) fn apply_read_inbox(&mut self, peer: Peer, max_id: MessageId) {
        let top_id = self.conversations.get(&peer).top_message.map(|key| key.local_id());
        let changed = self.conversations.modify(&peer, |conversation| {
            conversation.read_inbox_max_id = conversation.read_inbox_max_id.max(max_id.0);
            if top_id.map_or(true, |top| top <= max_id) {
                conversation.unread_count = 0;
            }
        });
        self.mark_messages_read(peer, |message| !message.out && message.id <= max_id);
        if changed {
            self.persist_conversation(&peer);
            self.emit(MirrorEvent::ConversationChanged(peer));
            self.recompute_unread_total();
        }
    }

    pub(crate) fn apply_read_outbox(&mut self, peer: Peer, max_id: MessageId) {
        let changed = self.conversations.modify(&peer, |conversation| {
            conversation.read_outbox_max_id = conversation.read_outbox_max_id.max(max_id.0);
        });
        self.mark_messages_read(peer, |message| message.out && message.id <= max_id);
        if changed {
            self.persist_conversation(&peer);
        }
    }

    /// Secret chats acknowledge reads by date rather than by id.
    pub(crate) fn apply_encrypted_read(&mut self, session: SessionId, max_date: i64) {
        self.mark_messages_read(Peer::Secret(session), |message| {
            message.out && message.date <= max_date
        });
    }

    fn mark_messages_read(&mut self, peer: Peer, predicate: impl Fn(&Message) -> bool) {
        let keys: Vec<UnifiedKey> = self
            .ordering
            .messages(&peer)
            .iter()
            .copied()
            .filter(|key| {
                self.messages
                    .lookup(key)
                    .is_some_and(|message| message.unread && predicate(message))
            })
            .collect();
        for key in keys {
            self.messages.modify(&key, |message| message.unread = false);
            self.persist_message(&key);
            self.emit(MirrorEvent::MessageUpdated(key));
        }
    }

    /// Clears a conversation's history, optionally removing the conversation too.
    pub fn delete_history(&mut self, peer: Peer, delete_chat: bool) {
        if delete_chat {
            self.pending_deletes.insert(peer);
        }
        let unread = self.conversations.get(&peer).unread_count > 0;
        if unread && !peer.is_secret() {
            debug!(peer = %peer, "history: reading before delete");
            self.deletes_after_read.insert(peer, delete_chat);
            self.mark_read(peer, None);
            return;
        }

        match peer {
            Peer::Group(group) if delete_chat && !self.groups.get(&peer).left => {
                let Some(me) = self.me else {
                    warn!(peer = %peer, "history: cannot leave a group before login");
                    return;
                };
                self.issue(
                    ProtocolRequest::DeleteChatUser { group, user: me },
                    RequestPurpose::LeaveGroup(peer),
                );
            }
            Peer::Secret(session) => {
                if delete_chat {
                    self.issue(
                        ProtocolRequest::DiscardEncryption { session },
                        RequestPurpose::DiscardSecret(session),
                    );
                } else {
                    warn!(peer = %peer, "history: secret chat history is only cleared locally");
                    self.delete_local_history(peer);
                }
            }
            _ => {
                self.issue(
                    ProtocolRequest::DeleteHistory { peer },
                    RequestPurpose::DeleteHistory(peer),
                );
            }
        }
    }

    pub(crate) fn delete_local_history(&mut self, peer: Peer) {
        for key in self.ordering.take_scope(&peer) {
            self.evict_message(key, false);
        }
        self.store
            .delete_scope(EntityKind::Message, peer.to_string());

        if self.conversations.contains(&peer) {
            self.set_top_message(peer, None);
            self.conversations
                .modify(&peer, |conversation| conversation.unread_count = 0);
            self.persist_conversation(&peer);
            self.recompute_unread_total();
        }
        info!(peer = %peer, "history: local history deleted");
        self.emit(MirrorEvent::HistoryDeleted(peer));

        if self.pending_deletes.remove(&peer) {
            self.remove_conversation(peer);
            match peer {
                Peer::Group(_) | Peer::Channel(_) => {
                    if self.groups.retire(&peer) {
                        self.store.delete(EntityKind::Group, peer.to_string());
                    }
                }
                Peer::Secret(session) => {
                    if self.sessions.retire(&session) {
                        self.store
                            .delete(EntityKind::EncryptedSession, session.0.to_string());
                    }
                }
                Peer::User(_) => {}
            }
        }
    }

    /// Removes messages the server deleted. Tops pointing at them fall back
    /// to the newest remaining message.
    pub(crate) fn delete_messages(&mut self, scope: KeyScope, ids: &[MessageId]) {
        let deleted: HashSet<UnifiedKey> = ids.iter().map(|id| unify(*id, scope)).collect();
        let mut sorted: Vec<UnifiedKey> = deleted.iter().copied().collect();
        sorted.sort();
        for key in sorted {
            if !self.evict_message(key, true) {
                self.pending_fetches.remove_waiter(&key);
                self.store.delete(EntityKind::Message, key.to_string());
            }
        }

        let mut dangling: Vec<Peer> = self
            .conversations
            .iter()
            .filter(|(_, conversation)| {
                conversation
                    .top_message
                    .is_some_and(|top| deleted.contains(&top))
            })
            .map(|(peer, _)| *peer)
            .collect();
        dangling.sort();
        for peer in dangling {
            let fallback = self.ordering.messages(&peer).first().copied();
            self.set_top_message(peer, fallback);
        }
        debug!(deleted = ids.len(), "history: messages deleted");
    }
}
