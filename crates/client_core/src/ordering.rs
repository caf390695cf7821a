use std::{cmp::Reverse, collections::HashMap};

use shared::domain::{Peer, SessionId, UnifiedKey};

use crate::{
    entities::{Conversation, EncryptedSession, Message},
    entity_store::EntityStore,
};

/// Sort key shared by messages and conversations.
///
/// Entries with a timestamp order before entries without one; entries without
/// a timestamp fall back to their raw key. Sorting by `Reverse` of this key
/// gives newest first, and the sort is stable so ties keep their prior order.
pub type SortKey = (Option<i64>, u128);

pub fn message_sort_key(messages: &EntityStore<UnifiedKey, Message>, key: &UnifiedKey) -> SortKey {
    match messages.lookup(key) {
        Some(message) => (Some(message.date), 0),
        None => (None, key.raw()),
    }
}

/// The stores a conversation's position depends on.
pub struct ConversationContext<'a> {
    pub conversations: &'a EntityStore<Peer, Conversation>,
    pub messages: &'a EntityStore<UnifiedKey, Message>,
    pub sessions: &'a EntityStore<SessionId, EncryptedSession>,
}

impl ConversationContext<'_> {
    pub fn sort_key(&self, peer: &Peer) -> SortKey {
        let top = self
            .conversations
            .lookup(peer)
            .and_then(|conversation| conversation.top_message);
        let top_date = top
            .and_then(|key| self.messages.lookup(&key))
            .map(|message| message.date);
        let session_date = match peer {
            Peer::Secret(id) => self
                .sessions
                .lookup(id)
                .map(|session| session.date)
                .filter(|date| *date > 0),
            _ => None,
        };

        match top_date.or(session_date) {
            Some(date) => (Some(date), 0),
            None => (None, top.map(|key| key.raw()).unwrap_or(0)),
        }
    }
}

#[derive(Debug, Default)]
pub struct OrderingIndex {
    scopes: HashMap<Peer, Vec<UnifiedKey>>,
    conversations: Vec<Peer>,
}

impl OrderingIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self, peer: &Peer) -> &[UnifiedKey] {
        self.scopes.get(peer).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn scopes(&self) -> impl Iterator<Item = (&Peer, &[UnifiedKey])> + '_ {
        self.scopes.iter().map(|(peer, keys)| (peer, keys.as_slice()))
    }

    pub fn conversations(&self) -> &[Peer] {
        &self.conversations
    }

    /// Adds the key to its scope when missing and re-sorts the scope.
    pub fn insert_message(
        &mut self,
        peer: Peer,
        key: UnifiedKey,
        messages: &EntityStore<UnifiedKey, Message>,
    ) -> bool {
        let keys = self.scopes.entry(peer).or_default();
        let added = !keys.contains(&key);
        if added {
            keys.push(key);
        }
        keys.sort_by_key(|key| Reverse(message_sort_key(messages, key)));
        added
    }

    pub fn resort_scope(&mut self, peer: &Peer, messages: &EntityStore<UnifiedKey, Message>) {
        if let Some(keys) = self.scopes.get_mut(peer) {
            keys.sort_by_key(|key| Reverse(message_sort_key(messages, key)));
        }
    }

    pub fn remove_message(&mut self, peer: &Peer, key: &UnifiedKey) -> bool {
        let Some(keys) = self.scopes.get_mut(peer) else {
            return false;
        };
        let before = keys.len();
        keys.retain(|existing| existing != key);
        let removed = keys.len() != before;
        if keys.is_empty() {
            self.scopes.remove(peer);
        }
        removed
    }

    /// Removes the whole scope and returns the keys it held.
    pub fn take_scope(&mut self, peer: &Peer) -> Vec<UnifiedKey> {
        self.scopes.remove(peer).unwrap_or_default()
    }

    pub fn insert_conversation(&mut self, peer: Peer, context: &ConversationContext<'_>) -> bool {
        let added = !self.conversations.contains(&peer);
        if added {
            self.conversations.push(peer);
        }
        self.resort_conversations(context);
        added
    }

    pub fn remove_conversation(&mut self, peer: &Peer) -> bool {
        let before = self.conversations.len();
        self.conversations.retain(|existing| existing != peer);
        self.conversations.len() != before
    }

    pub fn resort_conversations(&mut self, context: &ConversationContext<'_>) {
        self.conversations
            .sort_by_key(|peer| Reverse(context.sort_key(peer)));
    }
}

#[cfg(test)]
mod tests {
    use shared::domain::{unify, ChannelId, GroupId, KeyScope, MessageId, UserId};

    use super::*;
    use crate::{
        entities::SessionState,
        entity_store::Provenance,
    };

    fn message(peer: Peer, id: i32, date: i64) -> Message {
        let key = unify(MessageId(id), peer.key_scope());
        Message {
            key,
            id: MessageId(id),
            peer,
            date,
            body: format!("m{id}"),
            ..Message::default()
        }
    }

    struct Fixture {
        conversations: EntityStore<Peer, Conversation>,
        messages: EntityStore<UnifiedKey, Message>,
        sessions: EntityStore<SessionId, EncryptedSession>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                conversations: EntityStore::new(),
                messages: EntityStore::new(),
                sessions: EntityStore::new(),
            }
        }

        fn context(&self) -> ConversationContext<'_> {
            ConversationContext {
                conversations: &self.conversations,
                messages: &self.messages,
                sessions: &self.sessions,
            }
        }

        fn conversation_with_top(&mut self, peer: Peer, top: Option<(i32, i64)>) {
            let mut conversation = Conversation::local(peer);
            if let Some((id, date)) = top {
                let m = message(peer, id, date);
                conversation.top_message = Some(m.key);
                self.messages.upsert(m.key, m, Provenance::LivePush);
            }
            self.conversations
                .upsert(peer, conversation, Provenance::LivePush);
        }
    }

    #[test]
    fn messages_sort_newest_first() {
        let peer = Peer::User(UserId(1));
        let mut messages = EntityStore::new();
        let mut index = OrderingIndex::new();
        for (id, date) in [(1, 100), (2, 300), (3, 200)] {
            let m = message(peer, id, date);
            let key = m.key;
            messages.upsert(key, m, Provenance::LivePush);
            index.insert_message(peer, key, &messages);
        }
        let ids: Vec<i32> = index
            .messages(&peer)
            .iter()
            .map(|key| key.local_id().0)
            .collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }

    #[test]
    fn equal_timestamps_keep_insertion_order() {
        let peer = Peer::Channel(ChannelId(9));
        let mut messages = EntityStore::new();
        let mut index = OrderingIndex::new();
        for id in [5, 3, 8] {
            let m = message(peer, id, 1_000);
            let key = m.key;
            messages.upsert(key, m, Provenance::LivePush);
            index.insert_message(peer, key, &messages);
        }
        let ids: Vec<i32> = index
            .messages(&peer)
            .iter()
            .map(|key| key.local_id().0)
            .collect();
        assert_eq!(ids, vec![5, 3, 8]);
    }

    #[test]
    fn duplicate_insert_does_not_grow_scope() {
        let peer = Peer::User(UserId(1));
        let mut messages = EntityStore::new();
        let mut index = OrderingIndex::new();
        let m = message(peer, 1, 10);
        let key = m.key;
        messages.upsert(key, m, Provenance::LivePush);
        assert!(index.insert_message(peer, key, &messages));
        assert!(!index.insert_message(peer, key, &messages));
        assert_eq!(index.messages(&peer).len(), 1);
    }

    #[test]
    fn conversations_without_signal_sort_last() {
        let mut fixture = Fixture::new();
        let quiet = Peer::Group(GroupId(1));
        let busy = Peer::User(UserId(2));
        fixture.conversation_with_top(quiet, None);
        fixture.conversation_with_top(busy, Some((10, 500)));

        let mut index = OrderingIndex::new();
        index.insert_conversation(quiet, &fixture.context());
        index.insert_conversation(busy, &fixture.context());
        assert_eq!(index.conversations(), &[busy, quiet]);
    }

    #[test]
    fn encrypted_session_date_stands_in_for_missing_top() {
        let mut fixture = Fixture::new();
        let secret = Peer::Secret(SessionId(4));
        let older = Peer::User(UserId(2));
        let newer = Peer::User(UserId(3));
        fixture.conversation_with_top(older, Some((10, 100)));
        fixture.conversation_with_top(newer, Some((11, 900)));
        fixture.conversation_with_top(secret, None);
        fixture.sessions.upsert(
            SessionId(4),
            EncryptedSession {
                id: SessionId(4),
                state: SessionState::Active,
                date: 500,
                ..EncryptedSession::default()
            },
            Provenance::LivePush,
        );

        let mut index = OrderingIndex::new();
        for peer in [older, secret, newer] {
            index.insert_conversation(peer, &fixture.context());
        }
        assert_eq!(index.conversations(), &[newer, secret, older]);
    }

    #[test]
    fn unresolvable_tops_fall_back_to_raw_ids() {
        let mut fixture = Fixture::new();
        let a = Peer::User(UserId(1));
        let b = Peer::User(UserId(2));
        for (peer, id) in [(a, 3), (b, 7)] {
            let mut conversation = Conversation::local(peer);
            conversation.top_message = Some(unify(MessageId(id), KeyScope::Global));
            fixture
                .conversations
                .upsert(peer, conversation, Provenance::LivePush);
        }

        let mut index = OrderingIndex::new();
        index.insert_conversation(a, &fixture.context());
        index.insert_conversation(b, &fixture.context());
        assert_eq!(index.conversations(), &[b, a]);
    }

    #[test]
    fn removing_last_key_drops_scope() {
        let peer = Peer::User(UserId(1));
        let mut messages = EntityStore::new();
        let mut index = OrderingIndex::new();
        let m = message(peer, 1, 10);
        let key = m.key;
        messages.upsert(key, m, Provenance::LivePush);
        index.insert_message(peer, key, &messages);
        assert!(index.remove_message(&peer, &key));
        assert_eq!(index.scopes().count(), 0);
    }
}
