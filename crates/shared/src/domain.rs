use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub i64);
    };
}

id_newtype!(UserId);
id_newtype!(GroupId);
id_newtype!(ChannelId);
id_newtype!(SessionId);
id_newtype!(DocumentId);
id_newtype!(StickerSetId);
id_newtype!(TransferId);
id_newtype!(RequestId);

/// Server-assigned message id. Only unique inside its [`KeyScope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(pub i32);

/// A conversation context as the remote service addresses it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum Peer {
    User(UserId),
    Group(GroupId),
    Channel(ChannelId),
    Secret(SessionId),
}

impl Peer {
    pub fn raw_id(&self) -> i64 {
        match self {
            Peer::User(id) => id.0,
            Peer::Group(id) => id.0,
            Peer::Channel(id) => id.0,
            Peer::Secret(id) => id.0,
        }
    }

    /// Key space the messages of this peer are numbered in.
    pub fn key_scope(&self) -> KeyScope {
        match self {
            Peer::User(_) | Peer::Group(_) => KeyScope::Global,
            Peer::Channel(id) => KeyScope::Channel(*id),
            Peer::Secret(id) => KeyScope::Secret(*id),
        }
    }

    pub fn is_secret(&self) -> bool {
        matches!(self, Peer::Secret(_))
    }

    pub fn is_channel(&self) -> bool {
        matches!(self, Peer::Channel(_))
    }

    fn prefix(&self) -> &'static str {
        match self {
            Peer::User(_) => "user",
            Peer::Group(_) => "group",
            Peer::Channel(_) => "channel",
            Peer::Secret(_) => "secret",
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.prefix(), self.raw_id())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid peer '{0}', expected <user|group|channel|secret>:<id>")]
pub struct ParsePeerError(pub String);

impl FromStr for Peer {
    type Err = ParsePeerError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (kind, id) = raw
            .split_once(':')
            .ok_or_else(|| ParsePeerError(raw.to_string()))?;
        let id: i64 = id
            .trim()
            .parse()
            .map_err(|_| ParsePeerError(raw.to_string()))?;
        match kind.trim() {
            "user" => Ok(Peer::User(UserId(id))),
            "group" => Ok(Peer::Group(GroupId(id))),
            "channel" => Ok(Peer::Channel(ChannelId(id))),
            "secret" => Ok(Peer::Secret(SessionId(id))),
            _ => Err(ParsePeerError(raw.to_string())),
        }
    }
}

/// Namespace a [`MessageId`] is unique within.
///
/// Direct and group messages share one server-wide sequence; every channel and
/// every encrypted session numbers its messages independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum KeyScope {
    Global,
    Channel(ChannelId),
    Secret(SessionId),
}

impl KeyScope {
    fn tag(&self) -> u128 {
        match self {
            KeyScope::Global => 0,
            KeyScope::Channel(_) => 1,
            KeyScope::Secret(_) => 2,
        }
    }

    fn raw_id(&self) -> i64 {
        match self {
            KeyScope::Global => 0,
            KeyScope::Channel(id) => id.0,
            KeyScope::Secret(id) => id.0,
        }
    }
}

const LOCAL_BITS: u32 = 32;
const SCOPE_ID_BITS: u32 = 64;
const TAG_SHIFT: u32 = LOCAL_BITS + SCOPE_ID_BITS;

/// Collision-free cache key for a message.
///
/// Layout, low to high: 32 bits of local id, 64 bits of scope id, then the
/// scope tag. Only [`unify`] builds one, so [`split`] is its exact inverse.
/// Serialized as a decimal string since the value does not fit a JSON number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UnifiedKey(u128);

impl Serialize for UnifiedKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for UnifiedKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse::<u128>()
            .map(UnifiedKey)
            .map_err(serde::de::Error::custom)
    }
}

impl UnifiedKey {
    pub fn raw(&self) -> u128 {
        self.0
    }

    pub fn local_id(&self) -> MessageId {
        split(*self).0
    }

    pub fn scope(&self) -> KeyScope {
        split(*self).1
    }
}

impl fmt::Display for UnifiedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (local, scope) = split(*self);
        match scope {
            KeyScope::Global => write!(f, "g:{}", local.0),
            KeyScope::Channel(id) => write!(f, "c{}:{}", id.0, local.0),
            KeyScope::Secret(id) => write!(f, "s{}:{}", id.0, local.0),
        }
    }
}

pub fn unify(local: MessageId, scope: KeyScope) -> UnifiedKey {
    let local_bits = local.0 as u32 as u128;
    let scope_bits = (scope.raw_id() as u64 as u128) << LOCAL_BITS;
    UnifiedKey(scope.tag() << TAG_SHIFT | scope_bits | local_bits)
}

pub fn split(key: UnifiedKey) -> (MessageId, KeyScope) {
    let local = MessageId(key.0 as u32 as i32);
    let scope_id = (key.0 >> LOCAL_BITS) as u64 as i64;
    let scope = match key.0 >> TAG_SHIFT {
        1 => KeyScope::Channel(ChannelId(scope_id)),
        2 => KeyScope::Secret(SessionId(scope_id)),
        _ => KeyScope::Global,
    };
    (local, scope)
}

/// Kinds of entities the durable cache persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Conversation,
    Message,
    User,
    Group,
    EncryptedSession,
    StickerSet,
    Contact,
}

impl EntityKind {
    pub const ALL: [EntityKind; 7] = [
        EntityKind::Conversation,
        EntityKind::Message,
        EntityKind::User,
        EntityKind::Group,
        EntityKind::EncryptedSession,
        EntityKind::StickerSet,
        EntityKind::Contact,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Conversation => "conversation",
            EntityKind::Message => "message",
            EntityKind::User => "user",
            EntityKind::Group => "group",
            EntityKind::EncryptedSession => "encrypted_session",
            EntityKind::StickerSet => "sticker_set",
            EntityKind::Contact => "contact",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn any_scope() -> impl Strategy<Value = KeyScope> {
        prop_oneof![
            Just(KeyScope::Global),
            any::<i64>().prop_map(|id| KeyScope::Channel(ChannelId(id))),
            any::<i64>().prop_map(|id| KeyScope::Secret(SessionId(id))),
        ]
    }

    proptest! {
        #[test]
        fn split_inverts_unify(local in any::<i32>(), scope in any_scope()) {
            let key = unify(MessageId(local), scope);
            prop_assert_eq!(split(key), (MessageId(local), scope));
        }

        #[test]
        fn scoped_keys_never_collide_with_global(local in any::<i32>(), scope in any_scope()) {
            prop_assume!(scope != KeyScope::Global);
            prop_assert_ne!(
                unify(MessageId(local), KeyScope::Global),
                unify(MessageId(local), scope)
            );
        }

        #[test]
        fn channel_and_secret_namespaces_are_disjoint(local in any::<i32>(), id in any::<i64>()) {
            prop_assert_ne!(
                unify(MessageId(local), KeyScope::Channel(ChannelId(id))),
                unify(MessageId(local), KeyScope::Secret(SessionId(id)))
            );
        }
    }

    #[test]
    fn unified_key_survives_json_values() {
        let key = unify(MessageId(9), KeyScope::Secret(SessionId(-3)));
        let value = serde_json::to_value(key).expect("encode");
        let decoded: UnifiedKey = serde_json::from_value(value).expect("decode");
        assert_eq!(decoded, key);
    }

    #[test]
    fn unify_is_stable_across_calls() {
        let scope = KeyScope::Channel(ChannelId(100));
        assert_eq!(unify(MessageId(5), scope), unify(MessageId(5), scope));
    }

    #[test]
    fn negative_local_ids_round_trip() {
        let key = unify(MessageId(-42), KeyScope::Global);
        assert_eq!(key.local_id(), MessageId(-42));
        assert_eq!(key.scope(), KeyScope::Global);
    }

    #[test]
    fn peer_parses_from_display_form() {
        let peer: Peer = "channel:77".parse().expect("peer");
        assert_eq!(peer, Peer::Channel(ChannelId(77)));
        assert_eq!(peer.to_string(), "channel:77");
        assert!("bogus:1".parse::<Peer>().is_err());
        assert!("user:abc".parse::<Peer>().is_err());
    }

    #[test]
    fn peer_key_scope_matches_numbering_rules() {
        assert_eq!(Peer::User(UserId(1)).key_scope(), KeyScope::Global);
        assert_eq!(Peer::Group(GroupId(2)).key_scope(), KeyScope::Global);
        assert_eq!(
            Peer::Channel(ChannelId(3)).key_scope(),
            KeyScope::Channel(ChannelId(3))
        );
    }
}
