//! Dispatch of protocol events: responses to our requests, pushed updates,
//! and connection-level signals.

use shared::{
    domain::{EntityKind, KeyScope, Peer, RequestId, UnifiedKey},
    error::{ErrorClass, ErrorCode, ProtocolError},
    protocol::{
        ChatRecord, DialogListKind, EncryptedMessageRecord, MessageRecord, ProtocolEvent,
        ProtocolRequest, Response, Update, UpdateBatch, UpdateState, UserRecord,
    },
};
use tracing::{debug, info, warn};

use crate::{
    entities::{Conversation, Group, Message, ReplyRef},
    entity_store::{Provenance, UpsertOutcome},
    error::{MirrorError, Result},
    pending::{FetchEntry, FetchFailure},
    requests::{PendingRequest, RequestPurpose},
    stickers::StickerKey,
    Mirror, MirrorEvent,
};

/// Most updates one channel catch-up asks for.
pub const CHANNEL_DIFFERENCE_LIMIT: i32 = 500;

impl Mirror {
    pub fn handle_protocol_event(&mut self, event: ProtocolEvent) {
        match event {
            ProtocolEvent::Response { request_id, result } => {
                self.handle_response(request_id, result)
            }
            ProtocolEvent::Push(batch) => {
                self.apply_batch(batch);
            }
            ProtocolEvent::TooLong => self.catch_up(),
            ProtocolEvent::ConnectionLost(error) => self.handle_fatal(error),
        }
    }

    /// First requests after the runtime comes up.
    pub fn start(&mut self) {
        self.issue(ProtocolRequest::GetState, RequestPurpose::SyncState);
        self.refresh_dialogs(DialogListKind::Direct, None);
        self.refresh_dialogs(DialogListKind::Channel, None);
        self.schedule_contact_refresh();
    }

    /// Recovers updates the server could not deliver.
    pub fn catch_up(&mut self) {
        match self.update_state {
            Some(state) => {
                self.issue(
                    ProtocolRequest::GetDifference { state },
                    RequestPurpose::Difference,
                );
            }
            None => {
                self.issue(ProtocolRequest::GetState, RequestPurpose::SyncState);
            }
        }
        self.schedule_dialog_refresh();
    }

    /// Recovers the updates one channel missed, starting from its last pts.
    ///
    /// A channel never caught up before starts from the global pts.
    pub fn catch_up_channel(&mut self, peer: Peer) {
        if !matches!(peer, Peer::Channel(_)) {
            debug!(peer = %peer, "updates: channel catch-up for a non-channel ignored");
            return;
        }
        let purpose = RequestPurpose::ChannelDifference(peer);
        if self.requests.find(|pending| *pending == purpose).is_some() {
            return;
        }
        let pts = self
            .channel_pts
            .get(&peer)
            .copied()
            .or(self.update_state.map(|state| state.pts))
            .unwrap_or(0);
        self.issue(
            ProtocolRequest::GetChannelDifference {
                peer,
                pts,
                limit: CHANNEL_DIFFERENCE_LIMIT,
            },
            purpose,
        );
    }

    /// Applies every update of a batch. A failing update is logged and
    /// skipped; the rest of the batch still applies. Returns the failure count.
    pub fn apply_batch(&mut self, batch: UpdateBatch) -> usize {
        self.apply_users(&batch.users, Provenance::LivePush);
        self.apply_chats(&batch.chats, Provenance::LivePush);
        let mut failed = 0;
        for update in &batch.updates {
            if let Err(err) = self.apply_update(update) {
                warn!(error = %err, "updates: update skipped");
                failed += 1;
            }
        }
        failed
    }

    pub fn apply_update(&mut self, update: &Update) -> Result<()> {
        match update {
            Update::NewMessage { message } => self.apply_new_message(message),
            Update::NewEncryptedMessage { message } => self.apply_encrypted_message(message)?,
            Update::EditMessage { message } => {
                self.insert_message(Message::from_record(message), Provenance::LivePush);
            }
            Update::MessageIdAssigned { random_id, id } => {
                self.acknowledge_send(*random_id, *id, 0)
            }
            Update::DeleteMessages { ids } => self.delete_messages(KeyScope::Global, ids),
            Update::DeleteChannelMessages { peer, ids } => {
                self.delete_messages(peer.key_scope(), ids)
            }
            Update::UserStatus { user, status } => {
                self.ensure_user(*user);
                let status = status.clone();
                self.users.modify(user, |record| record.status = status);
                self.persist_user(user);
                self.emit(MirrorEvent::UserChanged(*user));
            }
            Update::UserName {
                user,
                first_name,
                last_name,
                username,
            } => {
                self.ensure_user(*user);
                self.users.modify(user, |record| {
                    record.first_name = first_name.clone();
                    record.last_name = last_name.clone();
                    record.username = username.clone();
                    record.stub = false;
                });
                self.persist_user(user);
                self.emit(MirrorEvent::UserChanged(*user));
            }
            Update::UserTyping { peer, user, action } => self.apply_typing(*peer, *user, *action),
            Update::ReadHistoryInbox { peer, max_id } => self.apply_read_inbox(*peer, *max_id),
            Update::ReadHistoryOutbox { peer, max_id } => self.apply_read_outbox(*peer, *max_id),
            Update::EncryptedRead { session, max_date } => {
                self.apply_encrypted_read(*session, *max_date)
            }
            Update::ChatParticipantAdd { group, .. } => {
                self.adjust_participants(Peer::Group(*group), 1)?
            }
            Update::ChatParticipantDelete { group, .. } => {
                self.adjust_participants(Peer::Group(*group), -1)?
            }
            Update::ChatUserRemoved { group, user } => {
                let peer = Peer::Group(*group);
                if Some(*user) == self.me {
                    self.mark_group_left(peer)?;
                } else {
                    self.adjust_participants(peer, -1)?;
                }
            }
            Update::NotifySettings { peer, mute_until } => self.set_mute(*peer, *mute_until, false),
            Update::UserBlocked { user, blocked } => self.set_blocked(*user, *blocked),
            Update::Encryption { chat } => self.apply_encrypted_chat(chat)?,
            Update::ChannelTooLong { peer } => self.catch_up_channel(*peer),
        }
        Ok(())
    }

    fn apply_new_message(&mut self, record: &MessageRecord) {
        let message = Message::from_record(record);
        let peer = message.peer;
        self.confirm_conversation(peer);
        self.apply_incoming(peer, message);
    }

    /// A live message proves the conversation exists on the server.
    fn confirm_conversation(&mut self, peer: Peer) {
        if !self.conversations.contains(&peer) {
            let conversation = Conversation {
                ephemeral: false,
                ..Conversation::local(peer)
            };
            self.insert_conversation(conversation, Provenance::LivePush);
            return;
        }
        if self.conversations.get(&peer).ephemeral {
            self.conversations
                .modify(&peer, |conversation| conversation.ephemeral = false);
            self.persist_conversation(&peer);
        }
    }

    /// Inserts a pushed message and updates its conversation's counters and top.
    pub(crate) fn apply_incoming(&mut self, peer: Peer, message: Message) {
        let counts_unread = !message.out && message.unread;
        let from = message.from;
        let Some((key, outcome)) = self.insert_message(message, Provenance::LivePush) else {
            return;
        };
        if outcome == UpsertOutcome::Inserted && counts_unread {
            self.conversations
                .modify(&peer, |conversation| conversation.unread_count += 1);
            self.persist_conversation(&peer);
            self.emit(MirrorEvent::ConversationChanged(peer));
            self.recompute_unread_total();
        }
        self.advance_top(peer, key);
        self.stop_typing(peer, from);
        self.ensure_sweep();
    }

    /// Moves the top to `key` when it is newer than the current one.
    pub(crate) fn advance_top(&mut self, peer: Peer, key: UnifiedKey) -> bool {
        let newer = match self.conversations.get(&peer).top_message {
            None => true,
            Some(top) if top == key => false,
            Some(top) => match (self.messages.lookup(&top), self.messages.lookup(&key)) {
                (Some(current), Some(candidate)) => {
                    (candidate.date, key.raw()) > (current.date, top.raw())
                }
                (None, _) => true,
                (_, None) => false,
            },
        };
        newer && self.set_top_message(peer, Some(key))
    }

    fn adjust_participants(&mut self, peer: Peer, delta: i32) -> Result<()> {
        if !self.groups.contains(&peer) {
            return Err(MirrorError::unknown(EntityKind::Group, peer));
        }
        self.groups.modify(&peer, |group| {
            group.participants_count = (group.participants_count + delta).max(0);
        });
        self.persist_group(&peer);
        self.emit(MirrorEvent::GroupChanged(peer));
        Ok(())
    }

    fn mark_group_left(&mut self, peer: Peer) -> Result<()> {
        if !self.groups.contains(&peer) {
            return Err(MirrorError::unknown(EntityKind::Group, peer));
        }
        self.groups.modify(&peer, |group| group.left = true);
        self.persist_group(&peer);
        info!(peer = %peer, "updates: left group");
        self.emit(MirrorEvent::GroupChanged(peer));
        Ok(())
    }

    pub(crate) fn apply_difference(
        &mut self,
        messages: &[MessageRecord],
        encrypted_messages: &[EncryptedMessageRecord],
        updates: &[Update],
        users: &[UserRecord],
        chats: &[ChatRecord],
        state: UpdateState,
    ) {
        self.apply_users(users, Provenance::LivePush);
        self.apply_chats(chats, Provenance::LivePush);
        for record in messages {
            self.apply_new_message(record);
        }
        for record in encrypted_messages {
            if let Err(err) = self.apply_encrypted_message(record) {
                warn!(error = %err, "updates: encrypted message skipped");
            }
        }
        for update in updates {
            if let Err(err) = self.apply_update(update) {
                warn!(error = %err, "updates: update skipped");
            }
        }
        self.update_state = Some(state);
        info!(
            messages = messages.len(),
            updates = updates.len(),
            pts = state.pts,
            "updates: caught up"
        );
    }

    /// Users and chats of the response must already be applied.
    fn apply_channel_difference(
        &mut self,
        peer: Peer,
        messages: &[MessageRecord],
        updates: &[Update],
        pts: i32,
        complete: bool,
    ) {
        for record in messages {
            self.apply_new_message(record);
        }
        for update in updates {
            if let Err(err) = self.apply_update(update) {
                warn!(error = %err, "updates: update skipped");
            }
        }
        self.channel_pts.insert(peer, pts);
        info!(peer = %peer, messages = messages.len(), pts, complete, "updates: channel caught up");
        if !complete {
            self.catch_up_channel(peer);
        }
    }

    pub(crate) fn handle_response(
        &mut self,
        request_id: RequestId,
        result: std::result::Result<Response, ProtocolError>,
    ) {
        let Some(pending) = self.requests.take(request_id) else {
            debug!(
                error = %MirrorError::UnknownRequest(request_id.0),
                "updates: response dropped"
            );
            return;
        };
        match result {
            Ok(response) => self.complete_request(request_id, pending, response),
            Err(error) => self.fail_request(request_id, pending, error),
        }
    }

    fn complete_request(&mut self, request_id: RequestId, pending: PendingRequest, response: Response) {
        match (pending.purpose.clone(), response) {
            (
                RequestPurpose::Dialogs(kind),
                Response::Dialogs {
                    dialogs,
                    messages,
                    users,
                    chats,
                    ..
                },
            ) => {
                self.reconcile_dialogs(kind, &dialogs, &messages, &users, &chats);
                self.dialog_fetches.complete(&kind, Ok(()));
            }
            (
                RequestPurpose::History(peer),
                Response::Messages {
                    messages,
                    users,
                    chats,
                },
            ) => self.apply_history(peer, &messages, &users, &chats),
            (
                RequestPurpose::FetchMessages { peer, targets },
                Response::Messages {
                    messages,
                    users,
                    chats,
                },
            ) => {
                self.apply_users(&users, Provenance::PullResponse);
                self.apply_chats(&chats, Provenance::PullResponse);
                for record in &messages {
                    self.insert_message(Message::from_record(record), Provenance::PullResponse);
                }
                let missing: Vec<UnifiedKey> = targets
                    .into_iter()
                    .filter(|target| self.pending_fetches.is_pending(target))
                    .collect();
                if !missing.is_empty() {
                    self.fetch_failed(peer, missing);
                }
            }
            (RequestPurpose::Send { random_id }, Response::MessageSent { id, date }) => {
                self.acknowledge_send(random_id, id, date)
            }
            (RequestPurpose::Upload { transfer, .. }, Response::UploadProgress { uploaded, total }) => {
                self.upload_progress(transfer, uploaded, total);
                self.requests.insert(request_id, pending);
            }
            (RequestPurpose::Upload { transfer, random_id }, Response::MessageSent { id, date }) => {
                self.finish_upload(transfer);
                self.acknowledge_send(random_id, id, date);
            }
            (RequestPurpose::Download(transfer), Response::FileChunk { offset, bytes, total }) => {
                if self.on_file_chunk(transfer, offset, bytes, total) {
                    self.requests.insert(request_id, pending);
                }
            }
            (RequestPurpose::ReadHistory(peer), _) => self.finish_read(peer),
            (RequestPurpose::DeleteHistory(peer), Response::HistoryDeleted { offset }) => {
                if offset > 0 {
                    debug!(peer = %peer, offset, "updates: more history to delete");
                    self.issue_pending(PendingRequest {
                        attempts: 0,
                        ..pending
                    });
                } else {
                    self.delete_local_history(peer);
                }
            }
            (RequestPurpose::LeaveGroup(peer), _) => self.after_leave(peer),
            (RequestPurpose::RefreshBlocked, Response::Blocked { users }) => {
                self.apply_blocked_list(&users)
            }
            (
                RequestPurpose::RequestSecret { .. }
                | RequestPurpose::AcceptSecret(_)
                | RequestPurpose::DiscardSecret(_),
                Response::EncryptedChat { chat },
            ) => {
                if let Err(err) = self.apply_encrypted_chat(&chat) {
                    warn!(error = %err, "updates: session response rejected");
                }
            }
            (RequestPurpose::DiscardSecret(session), _) => self.mark_session_discarded(session),
            (RequestPurpose::Stickers, Response::AllStickers { sets }) => {
                self.apply_sticker_sets(&sets)
            }
            (RequestPurpose::InstallSticker(name), Response::StickerSet { set }) => {
                self.apply_installed_set(&name, &set)
            }
            (RequestPurpose::InstallSticker(name), _) => {
                self.sticker_ops.complete(&StickerKey::Set(name), Ok(()));
                self.refresh_stickers(None);
            }
            (RequestPurpose::UninstallSticker(name), _) => self.remove_sticker_set(&name),
            (
                RequestPurpose::Search,
                Response::Messages {
                    messages,
                    users,
                    chats,
                },
            ) => self.apply_search_results(&messages, &users, &chats),
            (RequestPurpose::SyncState, Response::State { state }) => {
                debug!(pts = state.pts, "updates: state stored");
                self.update_state = Some(state);
            }
            (
                RequestPurpose::Difference,
                Response::Difference {
                    messages,
                    encrypted_messages,
                    updates,
                    users,
                    chats,
                    state,
                },
            ) => self.apply_difference(
                &messages,
                &encrypted_messages,
                &updates,
                &users,
                &chats,
                state,
            ),
            (
                RequestPurpose::ChannelDifference(_),
                Response::ChannelDifference {
                    peer,
                    messages,
                    updates,
                    users,
                    chats,
                    pts,
                    complete,
                },
            ) => {
                self.apply_users(&users, Provenance::LivePush);
                self.apply_chats(&chats, Provenance::LivePush);
                self.apply_channel_difference(peer, &messages, &updates, pts, complete);
            }
            (RequestPurpose::Contacts, Response::Contacts { contacts, users }) => {
                self.apply_contacts(&contacts, &users)
            }
            (
                RequestPurpose::ImportContacts,
                Response::ImportedContacts {
                    imported,
                    retry,
                    users,
                },
            ) => self.apply_imported(imported, retry, &users),
            (RequestPurpose::Forward { random_ids }, Response::Updates { batch }) => {
                self.apply_batch(batch);
                self.settle_forward(&random_ids);
            }
            (
                purpose @ (RequestPurpose::CreateGroup | RequestPurpose::EditGroup(_)),
                Response::Updates { batch },
            ) => self.apply_group_change(&purpose, batch),
            (
                RequestPurpose::NotifySettings(_)
                | RequestPurpose::Block { .. }
                | RequestPurpose::CancelTransfer(_)
                | RequestPurpose::SetTyping(_),
                _,
            ) => {}
            (purpose, response) => {
                warn!(?purpose, ?response, "updates: unexpected response");
                let error = ProtocolError::new(ErrorCode::Internal, "unexpected response");
                self.give_up(request_id, purpose, error);
            }
        }
    }

    /// Failure handling by error class: transient errors are retried a bounded
    /// number of times, semantic errors correct local state, fatal errors
    /// reinitialize the connection.
    fn fail_request(&mut self, request_id: RequestId, pending: PendingRequest, error: ProtocolError) {
        warn!(
            request_id = request_id.0,
            purpose = ?pending.purpose,
            error = %error,
            "updates: request failed"
        );
        let class = error.class();
        if class == ErrorClass::Fatal {
            self.requests.insert(request_id, pending);
            self.handle_fatal(error);
            return;
        }
        if let RequestPurpose::FetchMessages { peer, targets } = &pending.purpose {
            self.fetch_failed(*peer, targets.clone());
            return;
        }
        if class == ErrorClass::Transient && pending.attempts + 1 < self.settings.fetch_retry_limit {
            self.issue_pending(PendingRequest {
                attempts: pending.attempts + 1,
                ..pending
            });
            return;
        }

        match pending.purpose {
            RequestPurpose::DeleteHistory(peer) if error.code == ErrorCode::PeerIdInvalid => {
                info!(peer = %peer, "updates: peer already gone, deleting locally");
                self.delete_local_history(peer);
            }
            RequestPurpose::LeaveGroup(peer) if class == ErrorClass::Semantic => {
                self.after_leave(peer);
            }
            purpose => self.give_up(request_id, purpose, error),
        }
    }

    fn after_leave(&mut self, peer: Peer) {
        if self.groups.contains(&peer) {
            self.groups.modify(&peer, |group| group.left = true);
            self.persist_group(&peer);
        } else {
            self.upsert_group(
                Group {
                    peer,
                    left: true,
                    ..Default::default()
                },
                Provenance::LivePush,
            );
        }
        self.delete_history(peer, true);
    }

    fn fetch_failed(&mut self, peer: Peer, targets: Vec<UnifiedKey>) {
        let mut retry = Vec::new();
        for target in targets {
            if !self.pending_fetches.is_pending(&target) {
                continue;
            }
            match self.pending_fetches.record_failure(&target) {
                FetchFailure::Retry => retry.push(target),
                FetchFailure::GiveUp(entry) => self.give_up_fetch(target, entry),
            }
        }
        if !retry.is_empty() {
            self.fetch_messages(peer, retry);
        }
    }

    /// Waiting replies keep an unavailable marker; a dangling top is replaced.
    fn give_up_fetch(&mut self, target: UnifiedKey, entry: FetchEntry) {
        warn!(key = %target, attempts = entry.attempts, "updates: message unavailable, giving up");
        for waiter in &entry.waiters {
            let patched = self.messages.modify(waiter, |message| {
                message.reply_to = Some(ReplyRef::Unavailable(target));
            });
            if patched {
                self.persist_message(waiter);
                self.emit(MirrorEvent::MessageUpdated(*waiter));
            }
        }
        if let Some(peer) = entry.for_top_of {
            if self.conversations.get(&peer).top_message == Some(target) {
                let fallback = self.ordering.messages(&peer).first().copied();
                self.set_top_message(peer, fallback);
            }
        }
    }

    fn give_up(&mut self, request_id: RequestId, purpose: RequestPurpose, error: ProtocolError) {
        match purpose {
            RequestPurpose::Dialogs(kind) => {
                self.dialog_fetches.complete(&kind, Err(error.clone()));
            }
            RequestPurpose::ReadHistory(peer) => {
                self.history_reads.complete(&peer, Err(error.clone()));
                self.deletes_after_read.remove(&peer);
            }
            RequestPurpose::Stickers => {
                self.sticker_ops.complete(&StickerKey::All, Err(error.clone()));
            }
            RequestPurpose::InstallSticker(name) | RequestPurpose::UninstallSticker(name) => {
                self.sticker_ops
                    .complete(&StickerKey::Set(name), Err(error.clone()));
            }
            RequestPurpose::Send { random_id } => self.fail_send(random_id, error.clone()),
            RequestPurpose::Forward { random_ids } => {
                for random_id in random_ids {
                    self.fail_send(random_id, error.clone());
                }
            }
            RequestPurpose::Upload {
                transfer,
                random_id,
            } => {
                self.fail_send(random_id, error.clone());
                self.fail_transfer(transfer, error.to_string());
            }
            RequestPurpose::Download(transfer) => self.fail_transfer(transfer, error.to_string()),
            RequestPurpose::Block { user, blocked } => self.set_blocked(user, !blocked),
            RequestPurpose::DeleteHistory(peer) | RequestPurpose::LeaveGroup(peer) => {
                self.pending_deletes.remove(&peer);
            }
            _ => {}
        }
        self.emit(MirrorEvent::RequestFailed {
            request: request_id,
            error,
        });
    }

    /// Reconnects and replays every outstanding request. Cached state is kept.
    pub fn handle_fatal(&mut self, error: ProtocolError) {
        warn!(error = %error, outstanding = self.requests.len(), "updates: connection lost, reinitializing");
        self.emit(MirrorEvent::ConnectionLost(error));
        self.protocol.reinitialize();
        for pending in self.requests.drain() {
            self.issue_pending(pending);
        }
    }
}
