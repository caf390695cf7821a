//! Notification settings, block list and the unread badge.

use std::collections::HashSet;

use shared::{
    domain::{Peer, UserId},
    protocol::ProtocolRequest,
};
use tracing::{debug, info};

use crate::{requests::RequestPurpose, Mirror, MirrorEvent};

/// Mute deadline the service treats as "forever", in seconds.
pub const MUTE_FOREVER: i64 = 1_576_800_000;

impl Mirror {
    pub fn mute(&mut self, peer: Peer) {
        self.set_mute(peer, MUTE_FOREVER, true);
    }

    pub fn unmute(&mut self, peer: Peer) {
        self.set_mute(peer, 0, true);
    }

    /// Applies a mute deadline locally, optionally telling the server.
    pub(crate) fn set_mute(&mut self, peer: Peer, mute_until: i64, issue: bool) {
        let changed = self.conversations.modify(&peer, |conversation| {
            conversation.mute_until = mute_until;
        });
        if self.settings.global_mute && mute_until > 0 {
            self.muted.insert(peer);
        } else {
            self.muted.remove(&peer);
        }
        if changed {
            self.persist_conversation(&peer);
            self.emit(MirrorEvent::ConversationChanged(peer));
        }
        if issue {
            self.issue(
                ProtocolRequest::UpdateNotifySettings { peer, mute_until },
                RequestPurpose::NotifySettings(peer),
            );
        }
        self.recompute_unread_total();
    }

    pub fn block(&mut self, user: UserId) {
        self.set_blocked(user, true);
        self.issue(
            ProtocolRequest::Block { user },
            RequestPurpose::Block {
                user,
                blocked: true,
            },
        );
    }

    pub fn unblock(&mut self, user: UserId) {
        self.set_blocked(user, false);
        self.issue(
            ProtocolRequest::Unblock { user },
            RequestPurpose::Block {
                user,
                blocked: false,
            },
        );
    }

    pub(crate) fn set_blocked(&mut self, user: UserId, blocked: bool) {
        self.ensure_user(user);
        let mut changed = false;
        self.users.modify(&user, |record| {
            changed = record.blocked != blocked;
            record.blocked = blocked;
        });
        if changed {
            self.persist_user(&user);
            self.emit(MirrorEvent::UserChanged(user));
        }
    }

    pub fn refresh_blocked(&mut self) {
        self.issue(ProtocolRequest::GetBlocked, RequestPurpose::RefreshBlocked);
    }

    /// The server's block list is complete; everyone else is unblocked.
    pub(crate) fn apply_blocked_list(&mut self, blocked: &[UserId]) {
        let listed: HashSet<UserId> = blocked.iter().copied().collect();
        let mut known: Vec<UserId> = self
            .users
            .iter()
            .filter(|(id, user)| user.blocked && !listed.contains(*id))
            .map(|(id, _)| *id)
            .collect();
        known.sort();
        for user in known {
            self.set_blocked(user, false);
        }
        for user in blocked {
            self.set_blocked(*user, true);
        }
        info!(blocked = blocked.len(), "preferences: block list refreshed");
    }

    pub(crate) fn recompute_unread_total(&mut self) {
        let total: i32 = self
            .conversations
            .iter()
            .filter(|(peer, _)| !self.muted.contains(*peer))
            .map(|(_, conversation)| conversation.unread_count.max(0))
            .sum();
        if total != self.unread_total {
            debug!(total, "preferences: unread total changed");
            self.unread_total = total;
            self.emit(MirrorEvent::UnreadTotalChanged(total));
        }
    }
}
