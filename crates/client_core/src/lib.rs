use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use shared::{
    domain::{EntityKind, Peer, SessionId, StickerSetId, TransferId, UnifiedKey, UserId},
    error::ProtocolError,
    protocol::{DialogListKind, UpdateState},
};
use tokio::{sync::broadcast, time::Instant};

pub mod coalesce;
pub mod config;
mod contacts;
pub mod durable;
pub mod entities;
pub mod entity_store;
pub mod error;
pub mod gc;
mod groups;
mod history;
pub mod media_io;
pub mod media_path;
pub mod ordering;
mod outbox;
pub mod pending;
mod preferences;
pub mod protocol_client;
mod reconcile;
pub mod requests;
pub mod runtime;
mod search;
mod secret_sessions;
mod stickers;
pub mod timers;
pub mod transfers;
mod typing;
mod updates;

use coalesce::RequestCoalescer;
use durable::StoreSink;
use entities::{
    Contact, Conversation, EncryptedSession, Group, Message, SessionState, StickerSet, Transfer,
    User,
};
use entity_store::{EntityStore, Handle, Provenance};
use gc::ViewRegistry;
use media_io::MediaSink;
use ordering::{ConversationContext, OrderingIndex};
use pending::PendingFetches;
use requests::RequestRegistry;
use stickers::StickerKey;
use timers::TimerQueue;
use transfers::ProgressAggregate;

pub use config::MirrorSettings;
pub use error::{MirrorError, Result};
pub use gc::{MessageView, ViewId};
pub use groups::DEFAULT_FORWARD_LIMIT;
pub use preferences::MUTE_FOREVER;
pub use protocol_client::{ChannelProtocolClient, MissingProtocolClient, ProtocolClient};
pub use runtime::MirrorHandle;

/// Change notifications, sent in the order the reconciliation steps happen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorEvent {
    ConversationChanged(Peer),
    ConversationsReordered,
    ConversationRemoved(Peer),
    MessageInserted(UnifiedKey),
    MessageUpdated(UnifiedKey),
    MessageRemoved(UnifiedKey),
    MessageAcknowledged {
        provisional: UnifiedKey,
        canonical: UnifiedKey,
    },
    MessageSendFailed {
        key: UnifiedKey,
        error: ProtocolError,
    },
    /// The server accepted a send but assigned no id.
    MessageSendDropped(UnifiedKey),
    UserChanged(UserId),
    GroupChanged(Peer),
    TypingChanged {
        peer: Peer,
        users: Vec<UserId>,
    },
    SessionStateChanged {
        session: SessionId,
        state: SessionState,
    },
    TransferProgress {
        transfer: TransferId,
        transferred: i64,
        total: i64,
    },
    TransferFinished {
        transfer: TransferId,
        path: std::path::PathBuf,
    },
    TransferCancelled(TransferId),
    TransferFailed {
        transfer: TransferId,
        error: String,
    },
    AggregateProgress(u8),
    UnreadTotalChanged(i32),
    StickerSetsChanged,
    ContactsChanged,
    /// `retry` counts entries the server asked to offer again later.
    ContactsImported {
        imported: i32,
        retry: i32,
    },
    SearchResults(Vec<UnifiedKey>),
    HistoryDeleted(Peer),
    ConnectionLost(ProtocolError),
    RequestFailed {
        request: shared::domain::RequestId,
        error: ProtocolError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerKind {
    CleanupSweep,
    GraveyardFlush,
    DialogRefresh,
    ContactRefresh,
    TypingExpiry(Peer, UserId),
}

/// The in-memory mirror of remote chat state.
///
/// Every mutation runs on one task; `runtime::run` owns the only instance and
/// feeds it commands, protocol events, media completions and timer ticks.
pub struct Mirror {
    settings: MirrorSettings,
    me: Option<UserId>,
    protocol: Arc<dyn ProtocolClient>,
    store: StoreSink,
    media: MediaSink,
    events: broadcast::Sender<MirrorEvent>,

    conversations: EntityStore<Peer, Conversation>,
    messages: EntityStore<UnifiedKey, Message>,
    users: EntityStore<UserId, User>,
    groups: EntityStore<Peer, Group>,
    sessions: EntityStore<SessionId, EncryptedSession>,
    sticker_sets: EntityStore<StickerSetId, StickerSet>,
    transfers: EntityStore<TransferId, Transfer>,
    contacts: EntityStore<UserId, Contact>,

    ordering: OrderingIndex,
    pending_fetches: PendingFetches,
    requests: RequestRegistry,
    dialog_fetches: RequestCoalescer<DialogListKind>,
    history_reads: RequestCoalescer<Peer>,
    sticker_ops: RequestCoalescer<StickerKey>,

    /// Optimistic sends awaiting their final id, by random id.
    outbox: HashMap<i64, UnifiedKey>,
    pending_deletes: HashSet<Peer>,
    /// Deletions parked until the unread messages are marked read.
    deletes_after_read: HashMap<Peer, bool>,
    views: ViewRegistry,
    search_results: Vec<UnifiedKey>,
    timers: TimerQueue<TimerKind>,
    progress: ProgressAggregate,
    sticker_index: HashMap<String, StickerSetId>,
    muted: HashSet<Peer>,
    downloads: HashMap<transfers::LocationKey, TransferId>,
    update_state: Option<UpdateState>,
    /// Last acknowledged pts per channel.
    channel_pts: HashMap<Peer, i32>,
    unread_total: i32,
    next_transfer: i64,
}

impl Mirror {
    pub fn new(settings: MirrorSettings, protocol: Arc<dyn ProtocolClient>) -> Self {
        let (events, _) = broadcast::channel(1024);
        let retry_limit = settings.fetch_retry_limit;
        Self {
            settings,
            me: None,
            protocol,
            store: StoreSink::detached(),
            media: MediaSink::default(),
            events,
            conversations: EntityStore::new(),
            messages: EntityStore::new(),
            users: EntityStore::new(),
            groups: EntityStore::new(),
            sessions: EntityStore::new(),
            sticker_sets: EntityStore::new(),
            transfers: EntityStore::new(),
            contacts: EntityStore::new(),
            ordering: OrderingIndex::new(),
            pending_fetches: PendingFetches::new(retry_limit),
            requests: RequestRegistry::new(),
            dialog_fetches: RequestCoalescer::new(),
            history_reads: RequestCoalescer::new(),
            sticker_ops: RequestCoalescer::new(),
            outbox: HashMap::new(),
            pending_deletes: HashSet::new(),
            deletes_after_read: HashMap::new(),
            views: ViewRegistry::default(),
            search_results: Vec::new(),
            timers: TimerQueue::new(),
            progress: ProgressAggregate::default(),
            sticker_index: HashMap::new(),
            muted: HashSet::new(),
            downloads: HashMap::new(),
            update_state: None,
            channel_pts: HashMap::new(),
            unread_total: 0,
            next_transfer: 1,
        }
    }

    pub fn with_store_sink(mut self, store: StoreSink) -> Self {
        self.store = store;
        self
    }

    pub fn with_media_sink(mut self, media: MediaSink) -> Self {
        self.media = media;
        self
    }

    pub fn set_me(&mut self, me: UserId) {
        self.me = Some(me);
    }

    pub fn me(&self) -> Option<UserId> {
        self.me
    }

    pub fn settings(&self) -> &MirrorSettings {
        &self.settings
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<MirrorEvent> {
        self.events.subscribe()
    }

    pub(crate) fn event_sender(&self) -> broadcast::Sender<MirrorEvent> {
        self.events.clone()
    }

    pub(crate) fn emit(&self, event: MirrorEvent) {
        let _ = self.events.send(event);
    }

    pub fn conversation(&self, peer: &Peer) -> &Conversation {
        self.conversations.get(peer)
    }

    pub fn has_conversation(&self, peer: &Peer) -> bool {
        self.conversations.contains(peer)
    }

    pub fn message(&self, key: &UnifiedKey) -> &Message {
        self.messages.get(key)
    }

    pub fn has_message(&self, key: &UnifiedKey) -> bool {
        self.messages.contains(key)
    }

    pub fn message_handle(&self, key: &UnifiedKey) -> Option<Handle<Message>> {
        self.messages.handle(key)
    }

    /// Resolves a handle taken earlier, including messages evicted but not yet flushed.
    pub fn resolve_message(&self, handle: Handle<Message>) -> Option<&Message> {
        self.messages.resolve(handle)
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn user(&self, id: &UserId) -> &User {
        self.users.get(id)
    }

    pub fn group(&self, peer: &Peer) -> &Group {
        self.groups.get(peer)
    }

    pub fn session(&self, id: &SessionId) -> &EncryptedSession {
        self.sessions.get(id)
    }

    pub fn has_session(&self, id: &SessionId) -> bool {
        self.sessions.contains(id)
    }

    pub fn transfer(&self, id: &TransferId) -> &Transfer {
        self.transfers.get(id)
    }

    /// Message keys of one conversation, newest first.
    pub fn messages_of(&self, peer: &Peer) -> &[UnifiedKey] {
        self.ordering.messages(peer)
    }

    /// Known conversations, most recent activity first.
    pub fn conversation_list(&self) -> &[Peer] {
        self.ordering.conversations()
    }

    pub fn pending_fetches(&self) -> &PendingFetches {
        &self.pending_fetches
    }

    pub fn outstanding_requests(&self) -> usize {
        self.requests.len()
    }

    pub fn unread_total(&self) -> i32 {
        self.unread_total
    }

    pub fn aggregate_progress(&self) -> u8 {
        self.progress.percent()
    }

    pub fn update_state(&self) -> Option<UpdateState> {
        self.update_state
    }

    pub fn channel_pts(&self, peer: &Peer) -> Option<i32> {
        self.channel_pts.get(peer).copied()
    }

    pub fn is_muted(&self, peer: &Peer) -> bool {
        self.muted.contains(peer)
    }

    pub fn is_pending_delete(&self, peer: &Peer) -> bool {
        self.pending_deletes.contains(peer)
    }

    pub fn retired_messages(&self) -> usize {
        self.messages.retired_len()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    pub fn is_timer_armed(&self, kind: &TimerKind) -> bool {
        self.timers.is_armed(kind)
    }

    pub fn fire_due_timers(&mut self, now: Instant) {
        for kind in self.timers.take_due(now) {
            match kind {
                TimerKind::CleanupSweep => {
                    self.sweep();
                }
                TimerKind::GraveyardFlush => {
                    self.flush_graveyard();
                }
                TimerKind::DialogRefresh => {
                    self.refresh_dialogs(DialogListKind::Direct, None);
                    self.refresh_dialogs(DialogListKind::Channel, None);
                }
                TimerKind::ContactRefresh => self.refresh_contacts(),
                TimerKind::TypingExpiry(peer, user) => self.expire_typing(peer, user),
            }
        }
    }

    pub(crate) fn arm_graveyard(&mut self) {
        let delay = self.settings.graveyard_flush();
        self.timers.arm_if_idle(TimerKind::GraveyardFlush, delay);
    }

    pub(crate) fn index_conversation(&mut self, peer: Peer) {
        let context = ConversationContext {
            conversations: &self.conversations,
            messages: &self.messages,
            sessions: &self.sessions,
        };
        if self.ordering.insert_conversation(peer, &context) {
            self.emit(MirrorEvent::ConversationsReordered);
        }
    }

    pub(crate) fn resort_conversations(&mut self) {
        let before = self.ordering.conversations().to_vec();
        let context = ConversationContext {
            conversations: &self.conversations,
            messages: &self.messages,
            sessions: &self.sessions,
        };
        self.ordering.resort_conversations(&context);
        if self.ordering.conversations() != before.as_slice() {
            self.emit(MirrorEvent::ConversationsReordered);
        }
    }

    pub(crate) fn persist_conversation(&self, peer: &Peer) {
        if let Some(conversation) = self.conversations.lookup(peer) {
            if !conversation.ephemeral {
                self.store.upsert(
                    EntityKind::Conversation,
                    peer.to_string(),
                    String::new(),
                    conversation,
                );
            }
        }
    }

    /// Writes a changed message through unless it is still optimistic.
    pub(crate) fn persist_message(&self, key: &UnifiedKey) {
        if self.messages.provenance(key) == Some(Provenance::LocalOptimistic) {
            return;
        }
        if let Some(message) = self.messages.lookup(key) {
            self.store.upsert(
                EntityKind::Message,
                key.to_string(),
                message.peer.to_string(),
                message,
            );
        }
    }

    pub(crate) fn persist_user(&self, id: &UserId) {
        if let Some(user) = self.users.lookup(id) {
            self.store
                .upsert(EntityKind::User, id.0.to_string(), String::new(), user);
        }
    }

    pub(crate) fn persist_group(&self, peer: &Peer) {
        if let Some(group) = self.groups.lookup(peer) {
            self.store
                .upsert(EntityKind::Group, peer.to_string(), String::new(), group);
        }
    }

    pub(crate) fn persist_session(&self, id: &SessionId) {
        if let Some(session) = self.sessions.lookup(id) {
            self.store.upsert(
                EntityKind::EncryptedSession,
                id.0.to_string(),
                String::new(),
                session,
            );
        }
    }

    pub(crate) fn persist_sticker_set(&self, id: &StickerSetId) {
        if let Some(set) = self.sticker_sets.lookup(id) {
            self.store.upsert(
                EntityKind::StickerSet,
                id.0.to_string(),
                String::new(),
                set,
            );
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
