//! Group administration: creating groups, inviting members, renaming.
//!
//! The server answers each with an update batch describing what changed,
//! applied exactly like a push.

use shared::{
    domain::{GroupId, Peer, UserId},
    protocol::{ProtocolRequest, UpdateBatch},
};
use tracing::{info, warn};

use crate::{requests::RequestPurpose, Mirror};

/// Messages of history a newly added member gets to see.
pub const DEFAULT_FORWARD_LIMIT: i32 = 100;

impl Mirror {
    /// Returns `false` without sending anything when `users` is empty.
    pub fn create_group(&mut self, users: Vec<UserId>, title: String) -> bool {
        if users.is_empty() {
            warn!("groups: a group needs at least one other member");
            return false;
        }
        info!(members = users.len(), title = %title, "groups: creating");
        self.issue(
            ProtocolRequest::CreateChat { users, title },
            RequestPurpose::CreateGroup,
        );
        true
    }

    /// Invites a cached user. Unknown users are refused locally.
    pub fn add_group_member(&mut self, group: GroupId, user: UserId, forward_limit: i32) -> bool {
        if !self.users.contains(&user) {
            warn!(group = group.0, user = user.0, "groups: cannot add unknown user");
            return false;
        }
        self.issue(
            ProtocolRequest::AddChatUser {
                group,
                user,
                forward_limit: forward_limit.max(0),
            },
            RequestPurpose::EditGroup(Peer::Group(group)),
        );
        true
    }

    pub fn edit_group_title(&mut self, group: GroupId, title: String) {
        self.issue(
            ProtocolRequest::EditChatTitle { group, title },
            RequestPurpose::EditGroup(Peer::Group(group)),
        );
    }

    pub(crate) fn apply_group_change(&mut self, purpose: &RequestPurpose, batch: UpdateBatch) {
        let failed = self.apply_batch(batch);
        if failed > 0 {
            warn!(?purpose, failed, "groups: some changes did not apply");
        }
        if *purpose == RequestPurpose::CreateGroup {
            self.schedule_dialog_refresh();
        }
    }
}
