//! Optimistic sends and their acknowledgement.

use std::path::PathBuf;

use chrono::Utc;
use rand::Rng;
use shared::{
    domain::{unify, MessageId, Peer, TransferId, UnifiedKey},
    error::ProtocolError,
    protocol::{MediaKind, ProtocolRequest},
};
use tracing::{debug, info, warn};

use crate::{
    entities::{MediaDescriptor, Message, ReplyRef},
    entity_store::Provenance,
    requests::RequestPurpose,
    secret_sessions::secret_message_id,
    Mirror, MirrorEvent,
};

impl Mirror {
    /// Shows the message immediately under a provisional key and sends it.
    pub fn send_message(
        &mut self,
        peer: Peer,
        body: String,
        reply_to: Option<MessageId>,
    ) -> Option<UnifiedKey> {
        let message = self.compose(peer, body.clone(), reply_to, None);
        let random_id = message.random_id?;
        let key = self.insert_optimistic(message)?;
        self.issue(
            ProtocolRequest::SendMessage {
                peer,
                random_id,
                body,
                reply_to: reply_to.filter(|id| id.0 != 0),
            },
            RequestPurpose::Send { random_id },
        );
        Some(key)
    }

    /// Optimistic media message plus the upload carrying its file.
    pub fn send_media(
        &mut self,
        peer: Peer,
        local_path: PathBuf,
        kind: MediaKind,
        caption: String,
    ) -> Option<(UnifiedKey, TransferId)> {
        let media = MediaDescriptor {
            kind,
            file: None,
            caption,
            local_path: Some(local_path.clone()),
        };
        let message = self.compose(peer, String::new(), None, Some(media));
        let key = self.insert_optimistic(message)?;
        let transfer = self.start_upload(key, local_path)?;
        Some((key, transfer))
    }

    fn compose(
        &mut self,
        peer: Peer,
        body: String,
        reply_to: Option<MessageId>,
        media: Option<MediaDescriptor>,
    ) -> Message {
        let scope = peer.key_scope();
        let random_id = self.fresh_random_id();
        let mut rng = rand::thread_rng();
        let provisional = loop {
            let candidate = MessageId(-rng.gen_range(1..i32::MAX));
            if !self.messages.contains(&unify(candidate, scope)) {
                break candidate;
            }
        };

        Message {
            key: unify(provisional, scope),
            id: provisional,
            peer,
            from: self.me.unwrap_or_default(),
            date: Utc::now().timestamp(),
            body,
            media,
            action: None,
            reply_to: reply_to
                .filter(|id| id.0 != 0)
                .map(|id| ReplyRef::Resolved(unify(id, scope))),
            out: true,
            unread: true,
            sent: false,
            random_id: Some(random_id),
        }
    }

    fn fresh_random_id(&self) -> i64 {
        let mut rng = rand::thread_rng();
        loop {
            let candidate: i64 = rng.gen();
            if candidate != 0 && !self.outbox.contains_key(&candidate) {
                break candidate;
            }
        }
    }

    /// Forwards messages of `from` into `to`, newest id first.
    ///
    /// Every cached source gets an optimistic copy in `to`, settled by the
    /// id assignments in the response. Returns the provisional keys.
    pub fn forward_messages(&mut self, from: Peer, ids: Vec<MessageId>, to: Peer) -> Vec<UnifiedKey> {
        let mut ids: Vec<MessageId> = ids.into_iter().filter(|id| id.0 > 0).collect();
        if ids.is_empty() {
            return Vec::new();
        }
        ids.sort_by(|a, b| b.cmp(a));

        let scope = from.key_scope();
        let mut random_ids = Vec::with_capacity(ids.len());
        let mut queued = Vec::new();
        for id in &ids {
            let source = self.messages.lookup(&unify(*id, scope)).cloned();
            let random_id = match source {
                Some(source) => {
                    let copy = self.compose(to, source.body, None, source.media);
                    let random_id = copy.random_id;
                    if let Some(key) = self.insert_optimistic(copy) {
                        queued.push(key);
                    }
                    random_id
                }
                None => None,
            };
            random_ids.push(random_id.unwrap_or_else(|| self.fresh_random_id()));
        }

        info!(from = %from, to = %to, count = ids.len(), "outbox: forwarding");
        self.issue(
            ProtocolRequest::ForwardMessages {
                from,
                ids,
                random_ids: random_ids.clone(),
                to,
            },
            RequestPurpose::Forward { random_ids },
        );
        queued
    }

    /// Forwarded copies the response did not assign an id were dropped by the server.
    pub(crate) fn settle_forward(&mut self, random_ids: &[i64]) {
        for random_id in random_ids {
            if self.outbox.contains_key(random_id) {
                debug!(random_id, "outbox: forward copy got no id");
                self.acknowledge_send(*random_id, MessageId(0), 0);
            }
        }
    }

    fn insert_optimistic(&mut self, message: Message) -> Option<UnifiedKey> {
        let peer = message.peer;
        let random_id = message.random_id?;
        self.open_conversation(peer);
        let (key, _) = self.insert_message(message, Provenance::LocalOptimistic)?;
        self.outbox.insert(random_id, key);
        self.set_top_message(peer, Some(key));
        debug!(peer = %peer, key = %key, random_id, "outbox: optimistic message queued");
        Some(key)
    }

    /// Replaces the provisional message with its canonical copy.
    ///
    /// Safe to call more than once for the same send; only the first call acts.
    pub fn acknowledge_send(&mut self, random_id: i64, id: MessageId, date: i64) {
        let Some(provisional) = self.outbox.remove(&random_id) else {
            debug!(random_id, "outbox: acknowledgement for unknown or settled send");
            return;
        };
        let Some(mut message) = self.messages.lookup(&provisional).cloned() else {
            return;
        };
        let peer = message.peer;
        let was_top = self.conversations.get(&peer).top_message == Some(provisional);

        let id = if peer.is_secret() && date > 0 {
            secret_message_id(date).unwrap_or(id)
        } else {
            id
        };

        if id.0 == 0 {
            warn!(peer = %peer, key = %provisional, "outbox: server dropped the message");
            self.evict_message(provisional, true);
            if was_top {
                let fallback = self.ordering.messages(&peer).first().copied();
                self.set_top_message(peer, fallback);
            }
            self.emit(MirrorEvent::MessageSendDropped(provisional));
            return;
        }

        self.evict_message(provisional, false);

        let canonical = unify(id, peer.key_scope());
        message.id = id;
        message.key = canonical;
        if date > 0 {
            message.date = date;
        }
        message.sent = true;
        message.random_id = None;
        self.insert_message(message, Provenance::LivePush);

        if was_top {
            self.set_top_message(peer, Some(canonical));
        }
        self.retarget_transfers(provisional, canonical);
        info!(peer = %peer, provisional = %provisional, canonical = %canonical, "outbox: send acknowledged");
        self.emit(MirrorEvent::MessageAcknowledged {
            provisional,
            canonical,
        });
    }

    pub(crate) fn fail_send(&mut self, random_id: i64, error: ProtocolError) {
        let Some(key) = self.outbox.get(&random_id).copied() else {
            return;
        };
        warn!(key = %key, error = %error, "outbox: send failed, message stays unsent");
        self.emit(MirrorEvent::MessageSendFailed { key, error });
    }

    /// Forgets a send whose optimistic message went away.
    pub(crate) fn abandon_send(&mut self, key: &UnifiedKey) {
        self.outbox.retain(|_, pending| pending != key);
    }

    pub fn is_unsent(&self, key: &UnifiedKey) -> bool {
        self.outbox.values().any(|pending| pending == key)
    }

    pub(crate) fn outbox_keys(&self) -> impl Iterator<Item = &UnifiedKey> + '_ {
        self.outbox.values()
    }
}
