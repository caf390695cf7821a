use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        DocumentId, GroupId, MessageId, Peer, RequestId, SessionId, StickerSetId, TransferId,
        UserId,
    },
    error::ProtocolError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DialogListKind {
    /// Users, basic groups and encrypted sessions.
    Direct,
    Channel,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Presence {
    #[default]
    Empty,
    Online {
        expires: i64,
    },
    Offline {
        was_online: i64,
    },
    Recently,
    LastWeek,
    LastMonth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypingAction {
    Typing,
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: UserId,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default)]
    pub status: Presence,
    pub access_hash: i64,
}

/// A basic group or a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRecord {
    pub peer: Peer,
    pub title: String,
    #[serde(default)]
    pub participants_count: i32,
    #[serde(default)]
    pub access_hash: i64,
    #[serde(default)]
    pub left: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileLocation {
    #[serde(default)]
    pub dc_id: i32,
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub volume_id: i64,
    #[serde(default)]
    pub local_id: i32,
    #[serde(default)]
    pub access_hash: i64,
}

impl FileLocation {
    /// No server-side file is addressable through this location.
    pub fn is_empty(&self) -> bool {
        self.id == 0 && self.volume_id == 0 && self.local_id == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Document,
    Sticker,
    Audio,
    Video,
    Geo,
    Contact,
    WebPage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub location: FileLocation,
    #[serde(default)]
    pub size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<FileLocation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRecord {
    pub kind: MediaKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileRecord>,
    #[serde(default)]
    pub caption: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServiceAction {
    ChatCreated { title: String },
    ChatEditTitle { title: String },
    ChatAddUser { user: UserId },
    ChatDeleteUser { user: UserId },
    ChatJoinedByLink,
    ChannelCreated { title: String },
    PinMessage,
    HistoryClear,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    pub peer: Peer,
    pub from: UserId,
    pub date: i64,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<ServiceAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    #[serde(default)]
    pub out: bool,
    #[serde(default)]
    pub unread: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedMessageRecord {
    pub session: SessionId,
    pub random_id: i64,
    pub date: i64,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogRecord {
    pub peer: Peer,
    pub top_message: MessageId,
    #[serde(default)]
    pub read_inbox_max_id: i32,
    #[serde(default)]
    pub read_outbox_max_id: i32,
    #[serde(default)]
    pub unread_count: i32,
    #[serde(default)]
    pub mute_until: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptedChatStatus {
    Empty,
    Requested,
    Waiting,
    Active,
    Discarded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedChatRecord {
    pub id: SessionId,
    pub status: EncryptedChatStatus,
    #[serde(default)]
    pub access_hash: i64,
    #[serde(default)]
    pub date: i64,
    #[serde(default)]
    pub admin_id: UserId,
    #[serde(default)]
    pub participant_id: UserId,
    #[serde(default)]
    pub g_a_or_b: Vec<u8>,
    #[serde(default)]
    pub key_fingerprint: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StickerSetRecord {
    pub id: StickerSetId,
    pub short_name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub count: i32,
    #[serde(default)]
    pub installed: bool,
    #[serde(default)]
    pub documents: Vec<DocumentId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactRecord {
    pub user_id: UserId,
    #[serde(default)]
    pub mutual: bool,
}

/// A phone book entry offered to the server for matching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputContact {
    pub phone: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UpdateState {
    pub pts: i32,
    pub qts: i32,
    pub date: i64,
    pub seq: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ProtocolRequest {
    GetDialogs {
        kind: DialogListKind,
        limit: i32,
    },
    GetHistory {
        peer: Peer,
        offset_id: MessageId,
        limit: i32,
    },
    GetMessages {
        peer: Peer,
        ids: Vec<MessageId>,
    },
    SendMessage {
        peer: Peer,
        random_id: i64,
        body: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<MessageId>,
    },
    SendMedia {
        peer: Peer,
        random_id: i64,
        transfer: TransferId,
        local_path: String,
        caption: String,
    },
    GetFile {
        transfer: TransferId,
        location: FileLocation,
        size: i64,
    },
    CancelTransfer {
        transfer: TransferId,
    },
    ReadHistory {
        peer: Peer,
        max_id: MessageId,
    },
    DeleteHistory {
        peer: Peer,
    },
    DeleteChatUser {
        group: GroupId,
        user: UserId,
    },
    UpdateNotifySettings {
        peer: Peer,
        mute_until: i64,
    },
    Block {
        user: UserId,
    },
    Unblock {
        user: UserId,
    },
    RequestEncryption {
        user: UserId,
        random_id: i64,
    },
    AcceptEncryption {
        session: SessionId,
    },
    DiscardEncryption {
        session: SessionId,
    },
    GetBlocked,
    GetAllStickers,
    InstallStickerSet {
        short_name: String,
    },
    UninstallStickerSet {
        short_name: String,
    },
    Search {
        query: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer: Option<Peer>,
        limit: i32,
    },
    GetState,
    GetDifference {
        state: UpdateState,
    },
    GetChannelDifference {
        peer: Peer,
        pts: i32,
        limit: i32,
    },
    GetContacts,
    ImportContacts {
        contacts: Vec<InputContact>,
        replace: bool,
    },
    /// `random_ids[i]` belongs to `ids[i]`.
    ForwardMessages {
        from: Peer,
        ids: Vec<MessageId>,
        random_ids: Vec<i64>,
        to: Peer,
    },
    CreateChat {
        users: Vec<UserId>,
        title: String,
    },
    AddChatUser {
        group: GroupId,
        user: UserId,
        forward_limit: i32,
    },
    EditChatTitle {
        group: GroupId,
        title: String,
    },
    SetTyping {
        peer: Peer,
        action: TypingAction,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Response {
    Dialogs {
        kind: DialogListKind,
        dialogs: Vec<DialogRecord>,
        messages: Vec<MessageRecord>,
        users: Vec<UserRecord>,
        chats: Vec<ChatRecord>,
    },
    Messages {
        messages: Vec<MessageRecord>,
        users: Vec<UserRecord>,
        chats: Vec<ChatRecord>,
    },
    MessageSent {
        id: MessageId,
        date: i64,
    },
    HistoryRead,
    /// A nonzero offset means the server has more history to delete.
    HistoryDeleted {
        offset: i32,
    },
    ChatUserDeleted,
    FileChunk {
        offset: i64,
        bytes: Vec<u8>,
        total: i64,
    },
    UploadProgress {
        uploaded: i64,
        total: i64,
    },
    TransferCancelled,
    Blocked {
        users: Vec<UserId>,
    },
    EncryptedChat {
        chat: EncryptedChatRecord,
    },
    AllStickers {
        sets: Vec<StickerSetRecord>,
    },
    StickerSet {
        set: StickerSetRecord,
    },
    State {
        state: UpdateState,
    },
    Difference {
        messages: Vec<MessageRecord>,
        encrypted_messages: Vec<EncryptedMessageRecord>,
        updates: Vec<Update>,
        users: Vec<UserRecord>,
        chats: Vec<ChatRecord>,
        state: UpdateState,
    },
    /// `complete == false` means the server holds more for this channel.
    ChannelDifference {
        peer: Peer,
        messages: Vec<MessageRecord>,
        updates: Vec<Update>,
        users: Vec<UserRecord>,
        chats: Vec<ChatRecord>,
        pts: i32,
        complete: bool,
    },
    Contacts {
        contacts: Vec<ContactRecord>,
        users: Vec<UserRecord>,
    },
    ImportedContacts {
        imported: i32,
        retry: i32,
        users: Vec<UserRecord>,
    },
    /// Changes caused by the request, shaped like a pushed batch.
    Updates {
        batch: UpdateBatch,
    },
    Ok,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Update {
    NewMessage {
        message: MessageRecord,
    },
    NewEncryptedMessage {
        message: EncryptedMessageRecord,
    },
    EditMessage {
        message: MessageRecord,
    },
    MessageIdAssigned {
        random_id: i64,
        id: MessageId,
    },
    DeleteMessages {
        ids: Vec<MessageId>,
    },
    DeleteChannelMessages {
        peer: Peer,
        ids: Vec<MessageId>,
    },
    UserStatus {
        user: UserId,
        status: Presence,
    },
    UserName {
        user: UserId,
        first_name: String,
        last_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
    },
    UserTyping {
        peer: Peer,
        user: UserId,
        action: TypingAction,
    },
    ReadHistoryInbox {
        peer: Peer,
        max_id: MessageId,
    },
    ReadHistoryOutbox {
        peer: Peer,
        max_id: MessageId,
    },
    EncryptedRead {
        session: SessionId,
        max_date: i64,
    },
    ChatParticipantAdd {
        group: GroupId,
        user: UserId,
    },
    ChatParticipantDelete {
        group: GroupId,
        user: UserId,
    },
    ChatUserRemoved {
        group: GroupId,
        user: UserId,
    },
    NotifySettings {
        peer: Peer,
        mute_until: i64,
    },
    UserBlocked {
        user: UserId,
        blocked: bool,
    },
    Encryption {
        chat: EncryptedChatRecord,
    },
    /// The server skipped updates of one channel.
    ChannelTooLong {
        peer: Peer,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UpdateBatch {
    pub updates: Vec<Update>,
    #[serde(default)]
    pub users: Vec<UserRecord>,
    #[serde(default)]
    pub chats: Vec<ChatRecord>,
    #[serde(default)]
    pub date: i64,
}

/// Everything the protocol client delivers back to the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolEvent {
    Response {
        request_id: RequestId,
        result: Result<Response, ProtocolError>,
    },
    Push(UpdateBatch),
    /// The server dropped updates; the client must catch up explicitly.
    TooLong,
    ConnectionLost(ProtocolError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ChannelId;

    #[test]
    fn request_uses_tagged_envelope() {
        let request = ProtocolRequest::ReadHistory {
            peer: Peer::Channel(ChannelId(7)),
            max_id: MessageId(40),
        };
        let value = serde_json::to_value(&request).expect("encode");
        assert_eq!(value["type"], "read_history");
        assert_eq!(value["payload"]["peer"]["type"], "channel");
        assert_eq!(value["payload"]["max_id"], 40);
    }

    #[test]
    fn message_record_defaults_optional_fields() {
        let raw = r#"{"id":5,"peer":{"type":"user","id":9},"from":9,"date":1700000000,"body":"hi"}"#;
        let record: MessageRecord = serde_json::from_str(raw).expect("decode");
        assert_eq!(record.reply_to, None);
        assert!(record.media.is_none());
        assert!(!record.out);
    }

    #[test]
    fn empty_file_location_is_detected() {
        assert!(FileLocation::default().is_empty());
        assert!(!FileLocation {
            id: 3,
            ..FileLocation::default()
        }
        .is_empty());
    }
}
