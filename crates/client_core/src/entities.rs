use std::{collections::BTreeSet, path::PathBuf};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use shared::{
    domain::{
        unify, DocumentId, KeyScope, MessageId, Peer, SessionId, StickerSetId, TransferId,
        UnifiedKey, UserId,
    },
    protocol::{
        ChatRecord, ContactRecord, DialogRecord, EncryptedChatRecord, FileLocation, FileRecord, MediaKind,
        MediaRecord, MessageRecord, Presence, ServiceAction, StickerSetRecord, UserRecord,
    },
};

use crate::media_path::FileOwner;

const UNKNOWN_PEER: Peer = Peer::User(UserId(0));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub peer: Peer,
    pub top_message: Option<UnifiedKey>,
    pub unread_count: i32,
    #[serde(default)]
    pub read_inbox_max_id: i32,
    #[serde(default)]
    pub read_outbox_max_id: i32,
    #[serde(default)]
    pub mute_until: i64,
    /// Transient; rebuilt from push events.
    #[serde(skip)]
    pub typing_users: BTreeSet<UserId>,
    #[serde(default)]
    pub encrypted: bool,
    /// Created locally and not yet confirmed by any server listing.
    #[serde(default)]
    pub ephemeral: bool,
}

impl Default for Conversation {
    fn default() -> Self {
        Self::local(UNKNOWN_PEER)
    }
}

impl Conversation {
    pub fn local(peer: Peer) -> Self {
        Self {
            peer,
            top_message: None,
            unread_count: 0,
            read_inbox_max_id: 0,
            read_outbox_max_id: 0,
            mute_until: 0,
            typing_users: BTreeSet::new(),
            encrypted: peer.is_secret(),
            ephemeral: true,
        }
    }

    pub fn from_record(record: &DialogRecord) -> Self {
        let top_message = (record.top_message.0 != 0)
            .then(|| unify(record.top_message, record.peer.key_scope()));
        Self {
            peer: record.peer,
            top_message,
            unread_count: record.unread_count,
            read_inbox_max_id: record.read_inbox_max_id,
            read_outbox_max_id: record.read_outbox_max_id,
            mute_until: record.mute_until,
            typing_users: BTreeSet::new(),
            encrypted: record.peer.is_secret(),
            ephemeral: false,
        }
    }

    pub fn is_muted(&self) -> bool {
        self.mute_until > 0
    }
}

/// A reply target as seen from the replying message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "key", rename_all = "snake_case")]
pub enum ReplyRef {
    Resolved(UnifiedKey),
    /// Target not cached yet; a fetch is outstanding.
    Unresolved(UnifiedKey),
    /// Fetching the target gave up.
    Unavailable(UnifiedKey),
}

impl ReplyRef {
    pub fn target(&self) -> UnifiedKey {
        match self {
            ReplyRef::Resolved(key) | ReplyRef::Unresolved(key) | ReplyRef::Unavailable(key) => {
                *key
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaDescriptor {
    pub kind: MediaKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileRecord>,
    #[serde(default)]
    pub caption: String,
    /// Source file of a local upload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
}

impl From<&MediaRecord> for MediaDescriptor {
    fn from(record: &MediaRecord) -> Self {
        Self {
            kind: record.kind,
            file: record.file.clone(),
            caption: record.caption.clone(),
            local_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub key: UnifiedKey,
    pub id: MessageId,
    pub peer: Peer,
    pub from: UserId,
    pub date: i64,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<ServiceAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyRef>,
    pub out: bool,
    pub unread: bool,
    pub sent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub random_id: Option<i64>,
}

impl Default for Message {
    fn default() -> Self {
        Self {
            key: unify(MessageId(0), KeyScope::Global),
            id: MessageId(0),
            peer: UNKNOWN_PEER,
            from: UserId(0),
            date: 0,
            body: String::new(),
            media: None,
            action: None,
            reply_to: None,
            out: false,
            unread: false,
            sent: false,
            random_id: None,
        }
    }
}

impl Message {
    pub fn from_record(record: &MessageRecord) -> Self {
        let scope = record.peer.key_scope();
        Self {
            key: unify(record.id, scope),
            id: record.id,
            peer: record.peer,
            from: record.from,
            date: record.date,
            body: record.body.clone(),
            media: record.media.as_ref().map(MediaDescriptor::from),
            action: record.action.clone(),
            reply_to: record
                .reply_to
                .filter(|id| id.0 != 0)
                .map(|id| ReplyRef::Resolved(unify(id, scope))),
            out: record.out,
            unread: record.unread,
            sent: true,
            random_id: None,
        }
    }

    /// Nothing to render: no text, no media and no service action.
    pub fn is_degenerate(&self) -> bool {
        self.body.is_empty() && self.media.is_none() && self.action.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub status: Presence,
    pub access_hash: i64,
    #[serde(default)]
    pub blocked: bool,
    /// Known only by id; profile data has not arrived yet.
    #[serde(default)]
    pub stub: bool,
}

impl User {
    pub fn from_record(record: &UserRecord) -> Self {
        Self {
            id: record.id,
            first_name: record.first_name.clone(),
            last_name: record.last_name.clone(),
            username: record.username.clone(),
            phone: record.phone.clone(),
            status: record.status.clone(),
            access_hash: record.access_hash,
            blocked: false,
            stub: false,
        }
    }

    pub fn stub(id: UserId) -> Self {
        Self {
            id,
            stub: true,
            ..Self::default()
        }
    }

    pub fn display_name(&self) -> String {
        let full = format!("{} {}", self.first_name, self.last_name);
        let full = full.trim();
        if !full.is_empty() {
            return full.to_string();
        }
        self.username
            .clone()
            .unwrap_or_else(|| format!("user {}", self.id.0))
    }
}

/// A basic group or a channel, keyed by its [`Peer`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub peer: Peer,
    pub title: String,
    pub participants_count: i32,
    pub access_hash: i64,
    pub left: bool,
}

impl Default for Group {
    fn default() -> Self {
        Self {
            peer: UNKNOWN_PEER,
            title: String::new(),
            participants_count: 0,
            access_hash: 0,
            left: false,
        }
    }
}

impl From<&ChatRecord> for Group {
    fn from(record: &ChatRecord) -> Self {
        Self {
            peer: record.peer,
            title: record.title.clone(),
            participants_count: record.participants_count,
            access_hash: record.access_hash,
            left: record.left,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Peer initiated; waiting for the local side to accept.
    #[default]
    Requested,
    /// Locally initiated; waiting for the peer.
    Waiting,
    Active,
    Discarded,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EncryptedSession {
    pub id: SessionId,
    pub state: SessionState,
    pub access_hash: i64,
    pub date: i64,
    pub admin_id: UserId,
    pub participant_id: UserId,
    #[serde(default)]
    pub key_material_b64: String,
    #[serde(default)]
    pub key_fingerprint: i64,
}

impl EncryptedSession {
    pub fn from_record(record: &EncryptedChatRecord, state: SessionState) -> Self {
        Self {
            id: record.id,
            state,
            access_hash: record.access_hash,
            date: record.date,
            admin_id: record.admin_id,
            participant_id: record.participant_id,
            key_material_b64: STANDARD.encode(&record.g_a_or_b),
            key_fingerprint: record.key_fingerprint,
        }
    }

    /// The participant on the other side of the session.
    pub fn other_party(&self, me: Option<UserId>) -> UserId {
        if Some(self.admin_id) == me {
            self.participant_id
        } else {
            self.admin_id
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StickerSet {
    pub id: StickerSetId,
    pub short_name: String,
    pub title: String,
    pub count: i32,
    pub installed: bool,
    pub documents: Vec<DocumentId>,
}

impl From<&StickerSetRecord> for StickerSet {
    fn from(record: &StickerSetRecord) -> Self {
        Self {
            id: record.id,
            short_name: record.short_name.clone(),
            title: record.title.clone(),
            count: record.count,
            installed: record.installed,
            documents: record.documents.clone(),
        }
    }
}

/// A user in the address book. Profile data lives on the [`User`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Contact {
    pub user: UserId,
    #[serde(default)]
    pub mutual: bool,
}

impl From<&ContactRecord> for Contact {
    fn from(record: &ContactRecord) -> Self {
        Self {
            user: record.user_id,
            mutual: record.mutual,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferDirection {
    Upload,
    #[default]
    Download,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferState {
    /// Looking for the file in the download cache before fetching it.
    Checking,
    #[default]
    Active,
    /// All bytes arrived; the file is being moved into place.
    Finalizing,
    Completed,
    Cancelled,
    Failed,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Cancelled | TransferState::Failed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Transfer {
    pub id: TransferId,
    pub direction: TransferDirection,
    pub owner: FileOwner,
    /// Optimistic message an upload belongs to.
    pub message: Option<UnifiedKey>,
    pub location: Option<FileLocation>,
    pub transferred: i64,
    pub total: i64,
    pub path: PathBuf,
    pub state: TransferState,
}

#[cfg(test)]
mod tests {
    use shared::domain::ChannelId;

    use super::*;

    fn record(body: &str) -> MessageRecord {
        MessageRecord {
            id: MessageId(12),
            peer: Peer::Channel(ChannelId(300)),
            from: UserId(4),
            date: 1_700_000_000,
            body: body.into(),
            media: None,
            action: None,
            reply_to: Some(MessageId(11)),
            out: false,
            unread: true,
        }
    }

    #[test]
    fn message_key_and_reply_use_peer_scope() {
        let message = Message::from_record(&record("hello"));
        let scope = KeyScope::Channel(ChannelId(300));
        assert_eq!(message.key, unify(MessageId(12), scope));
        assert_eq!(
            message.reply_to,
            Some(ReplyRef::Resolved(unify(MessageId(11), scope)))
        );
        assert!(message.sent);
    }

    #[test]
    fn empty_message_without_media_is_degenerate() {
        assert!(Message::from_record(&record("")).is_degenerate());
        let mut with_action = Message::from_record(&record(""));
        with_action.action = Some(ServiceAction::PinMessage);
        assert!(!with_action.is_degenerate());
    }

    #[test]
    fn dialog_without_top_message_has_none() {
        let dialog = DialogRecord {
            peer: Peer::User(UserId(5)),
            top_message: MessageId(0),
            read_inbox_max_id: 0,
            read_outbox_max_id: 0,
            unread_count: 0,
            mute_until: 0,
        };
        let conversation = Conversation::from_record(&dialog);
        assert_eq!(conversation.top_message, None);
        assert!(!conversation.ephemeral);
    }

    #[test]
    fn typing_users_are_not_persisted() {
        let mut conversation = Conversation::local(Peer::User(UserId(1)));
        conversation.typing_users.insert(UserId(2));
        let value = serde_json::to_value(&conversation).expect("encode");
        let decoded: Conversation = serde_json::from_value(value).expect("decode");
        assert!(decoded.typing_users.is_empty());
    }

    #[test]
    fn session_keeps_key_material_as_base64() {
        let chat = EncryptedChatRecord {
            id: SessionId(8),
            status: shared::protocol::EncryptedChatStatus::Waiting,
            access_hash: 1,
            date: 0,
            admin_id: UserId(1),
            participant_id: UserId(2),
            g_a_or_b: vec![1, 2, 3],
            key_fingerprint: 99,
        };
        let session = EncryptedSession::from_record(&chat, SessionState::Waiting);
        assert_eq!(session.key_material_b64, "AQID");
        assert_eq!(session.other_party(Some(UserId(1))), UserId(2));
        assert_eq!(session.other_party(Some(UserId(2))), UserId(1));
    }

    #[test]
    fn display_name_falls_back_to_username_then_id() {
        let mut user = User::stub(UserId(3));
        assert_eq!(user.display_name(), "user 3");
        user.username = Some("ann".into());
        assert_eq!(user.display_name(), "ann");
        user.first_name = "Ann".into();
        assert_eq!(user.display_name(), "Ann");
    }
}
