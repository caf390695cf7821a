use shared::{
    domain::{Peer, UserId},
    protocol::{ProtocolRequest, TypingAction},
};
use tracing::debug;

use crate::{requests::RequestPurpose, Mirror, MirrorEvent, TimerKind};

impl Mirror {
    /// Tells the other side we are typing. Secret chats never send it.
    pub fn set_typing(&mut self, peer: Peer, typing: bool) {
        if peer.is_secret() {
            debug!(peer = %peer, "typing: not sent for secret chats");
            return;
        }
        let action = if typing {
            TypingAction::Typing
        } else {
            TypingAction::Cancel
        };
        self.issue(
            ProtocolRequest::SetTyping { peer, action },
            RequestPurpose::SetTyping(peer),
        );
    }

    /// Typing indicators expire on their own unless refreshed by another push.
    pub fn apply_typing(&mut self, peer: Peer, user: UserId, action: TypingAction) {
        if !self.conversations.contains(&peer) {
            debug!(peer = %peer, user = user.0, "typing: unknown conversation ignored");
            return;
        }
        match action {
            TypingAction::Typing => {
                let mut added = false;
                self.conversations.modify(&peer, |conversation| {
                    added = conversation.typing_users.insert(user);
                });
                let expiry = self.settings.typing_expiry();
                self.timers.arm(TimerKind::TypingExpiry(peer, user), expiry);
                if added {
                    self.emit_typing(peer);
                }
            }
            TypingAction::Cancel => self.stop_typing(peer, user),
        }
    }

    pub(crate) fn stop_typing(&mut self, peer: Peer, user: UserId) {
        self.timers.disarm(&TimerKind::TypingExpiry(peer, user));
        let mut removed = false;
        self.conversations.modify(&peer, |conversation| {
            removed = conversation.typing_users.remove(&user);
        });
        if removed {
            self.emit_typing(peer);
        }
    }

    pub(crate) fn expire_typing(&mut self, peer: Peer, user: UserId) {
        debug!(peer = %peer, user = user.0, "typing: indicator expired");
        self.stop_typing(peer, user);
    }

    pub fn typing_users(&self, peer: &Peer) -> Vec<UserId> {
        self.conversations
            .lookup(peer)
            .map(|conversation| conversation.typing_users.iter().copied().collect())
            .unwrap_or_default()
    }

    fn emit_typing(&self, peer: Peer) {
        let users = self.typing_users(&peer);
        self.emit(MirrorEvent::TypingChanged { peer, users });
    }
}
