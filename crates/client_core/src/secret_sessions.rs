//! Encrypted session lifecycle.
//!
//! States only move forward: Requested and Waiting lead to Active, and any
//! state may end in Discarded, which is terminal. Key material is kept as
//! base64 for bookkeeping only.

use rand::Rng;
use shared::{
    domain::{unify, EntityKind, MessageId, Peer, SessionId, UserId},
    protocol::{EncryptedChatRecord, EncryptedChatStatus, EncryptedMessageRecord, ProtocolRequest},
};
use tracing::{debug, info, warn};

use crate::{
    entities::{Conversation, EncryptedSession, MediaDescriptor, Message, SessionState},
    entity_store::Provenance,
    error::{MirrorError, Result},
    requests::RequestPurpose,
    Mirror, MirrorEvent,
};

/// Secret messages are keyed by their send date.
pub(crate) fn secret_message_id(date: i64) -> Option<MessageId> {
    match i32::try_from(date) {
        Ok(id) => Some(MessageId(id)),
        Err(_) => {
            warn!(date, "secret: message date does not fit a message id");
            None
        }
    }
}

impl SessionState {
    pub fn can_become(self, to: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, to),
            (Requested, Active)
                | (Requested, Discarded)
                | (Waiting, Active)
                | (Waiting, Discarded)
                | (Active, Discarded)
        ) || self == to
    }

    pub fn transition(self, session: SessionId, to: SessionState) -> Result<SessionState> {
        if self.can_become(to) {
            Ok(to)
        } else {
            Err(MirrorError::InvalidSessionTransition {
                session: session.0,
                from: self,
                to,
            })
        }
    }
}

impl Mirror {
    /// Applies a session record pushed or returned by the server.
    pub fn apply_encrypted_chat(&mut self, record: &EncryptedChatRecord) -> Result<()> {
        let state = match record.status {
            EncryptedChatStatus::Empty => {
                debug!(session = record.id.0, "secret: empty session record ignored");
                return Ok(());
            }
            EncryptedChatStatus::Requested => SessionState::Requested,
            EncryptedChatStatus::Waiting => SessionState::Waiting,
            EncryptedChatStatus::Active => SessionState::Active,
            EncryptedChatStatus::Discarded => SessionState::Discarded,
        };
        let id = record.id;
        let existing = self.sessions.lookup(&id).cloned();
        if let Some(existing) = &existing {
            existing.state.transition(id, state)?;
        }

        let mut session = EncryptedSession::from_record(record, state);
        if state == SessionState::Waiting && session.admin_id.0 == 0 {
            session.admin_id = self.me.unwrap_or_default();
        }
        if let Some(existing) = &existing {
            if record.g_a_or_b.is_empty() {
                session.key_material_b64 = existing.key_material_b64.clone();
            }
            if session.date == 0 {
                session.date = existing.date;
            }
            if session.admin_id.0 == 0 {
                session.admin_id = existing.admin_id;
            }
            if session.participant_id.0 == 0 {
                session.participant_id = existing.participant_id;
            }
        }
        let other = session.other_party(self.me);

        self.sessions.upsert(id, session, Provenance::LivePush);
        self.persist_session(&id);
        if existing.map(|s| s.state) != Some(state) {
            info!(session = id.0, ?state, "secret: session state changed");
            self.emit(MirrorEvent::SessionStateChanged { session: id, state });
        }
        self.ensure_session_conversation(id, Provenance::LivePush);

        let peer = Peer::Secret(id);
        match state {
            SessionState::Requested => {
                self.ensure_user(other);
                if self.settings.auto_accept_secret_chats {
                    self.issue(
                        ProtocolRequest::AcceptEncryption { session: id },
                        RequestPurpose::AcceptSecret(id),
                    );
                }
            }
            SessionState::Active | SessionState::Discarded => {
                if self.pending_deletes.contains(&peer) {
                    self.delete_local_history(peer);
                    return Ok(());
                }
            }
            SessionState::Waiting => {}
        }
        self.resort_conversations();
        Ok(())
    }

    fn ensure_session_conversation(&mut self, id: SessionId, provenance: Provenance) {
        let peer = Peer::Secret(id);
        if self.conversations.contains(&peer) {
            return;
        }
        let conversation = Conversation {
            ephemeral: false,
            ..Conversation::local(peer)
        };
        self.insert_conversation(conversation, provenance);
    }

    pub fn request_secret_chat(&mut self, user: UserId) {
        let random_id: i64 = rand::thread_rng().gen();
        self.issue(
            ProtocolRequest::RequestEncryption { user, random_id },
            RequestPurpose::RequestSecret { user },
        );
    }

    /// Discarding is local once acknowledged; the server's record may never arrive.
    pub(crate) fn mark_session_discarded(&mut self, id: SessionId) {
        let Some(current) = self.sessions.lookup(&id).map(|session| session.state) else {
            return;
        };
        if current != SessionState::Discarded {
            self.sessions
                .modify(&id, |session| session.state = SessionState::Discarded);
            self.persist_session(&id);
            self.emit(MirrorEvent::SessionStateChanged {
                session: id,
                state: SessionState::Discarded,
            });
        }
        let peer = Peer::Secret(id);
        if self.pending_deletes.contains(&peer) {
            self.delete_local_history(peer);
        }
    }

    /// Derives session states after a warm start and makes sure each has a conversation.
    pub(crate) fn rehydrate_sessions(&mut self) {
        let mut ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        ids.sort();
        for id in ids {
            let (state, date) = {
                let session = self.sessions.get(&id);
                (session.state, session.date)
            };
            let rehydrated = match state {
                SessionState::Waiting if date > 0 => SessionState::Active,
                state => state,
            };
            if rehydrated != state {
                self.sessions.modify(&id, |session| session.state = rehydrated);
                self.persist_session(&id);
                self.emit(MirrorEvent::SessionStateChanged {
                    session: id,
                    state: rehydrated,
                });
            }
            if rehydrated != SessionState::Discarded {
                self.ensure_session_conversation(id, Provenance::LivePush);
            }
        }
    }

    pub(crate) fn apply_encrypted_message(&mut self, record: &EncryptedMessageRecord) -> Result<()> {
        let Some(session) = self.sessions.lookup(&record.session).cloned() else {
            return Err(MirrorError::unknown(EntityKind::EncryptedSession, record.session.0));
        };
        if session.state == SessionState::Discarded {
            warn!(session = session.id.0, "secret: message for discarded session dropped");
            return Ok(());
        }
        let peer = Peer::Secret(session.id);
        let Some(id) = secret_message_id(record.date) else {
            return Ok(());
        };
        let message = Message {
            key: unify(id, peer.key_scope()),
            id,
            peer,
            from: session.other_party(self.me),
            date: record.date,
            body: record.body.clone(),
            media: record.media.as_ref().map(MediaDescriptor::from),
            action: None,
            reply_to: None,
            out: false,
            unread: true,
            sent: true,
            random_id: None,
        };
        self.ensure_session_conversation(session.id, Provenance::LivePush);
        self.apply_incoming(peer, message);
        Ok(())
    }
}
