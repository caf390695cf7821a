use std::collections::HashMap;

use shared::{
    domain::{Peer, RequestId, SessionId, TransferId, UnifiedKey, UserId},
    protocol::{DialogListKind, ProtocolRequest},
};
use tracing::debug;

use crate::{stickers::StickerKey, Mirror};

/// Why a request was issued; decides how its response is reconciled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestPurpose {
    Dialogs(DialogListKind),
    History(Peer),
    FetchMessages {
        peer: Peer,
        targets: Vec<UnifiedKey>,
    },
    Send {
        random_id: i64,
    },
    Upload {
        transfer: TransferId,
        random_id: i64,
    },
    Download(TransferId),
    ReadHistory(Peer),
    DeleteHistory(Peer),
    LeaveGroup(Peer),
    NotifySettings(Peer),
    Block {
        user: UserId,
        blocked: bool,
    },
    RefreshBlocked,
    RequestSecret {
        user: UserId,
    },
    AcceptSecret(SessionId),
    DiscardSecret(SessionId),
    CancelTransfer(TransferId),
    Stickers,
    InstallSticker(String),
    UninstallSticker(String),
    Search,
    SyncState,
    Difference,
    ChannelDifference(Peer),
    Contacts,
    ImportContacts,
    /// One random id per forwarded message, in request order.
    Forward {
        random_ids: Vec<i64>,
    },
    CreateGroup,
    EditGroup(Peer),
    SetTyping(Peer),
}

impl RequestPurpose {
    pub fn transfer(&self) -> Option<TransferId> {
        match self {
            RequestPurpose::Upload { transfer, .. } | RequestPurpose::Download(transfer) => {
                Some(*transfer)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub request: ProtocolRequest,
    pub purpose: RequestPurpose,
    pub attempts: u32,
}

#[derive(Debug, Default)]
pub struct RequestRegistry {
    pending: HashMap<RequestId, PendingRequest>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: RequestId, pending: PendingRequest) {
        self.pending.insert(id, pending);
    }

    pub fn take(&mut self, id: RequestId) -> Option<PendingRequest> {
        self.pending.remove(&id)
    }

    pub fn get(&self, id: RequestId) -> Option<&PendingRequest> {
        self.pending.get(&id)
    }

    /// Drains every outstanding request, oldest id first.
    pub fn drain(&mut self) -> Vec<PendingRequest> {
        let mut drained: Vec<(RequestId, PendingRequest)> = self.pending.drain().collect();
        drained.sort_by_key(|(id, _)| *id);
        drained.into_iter().map(|(_, pending)| pending).collect()
    }

    pub fn find(&self, predicate: impl Fn(&RequestPurpose) -> bool) -> Option<RequestId> {
        self.pending
            .iter()
            .filter(|(_, pending)| predicate(&pending.purpose))
            .map(|(id, _)| *id)
            .min()
    }

    pub fn purposes(&self) -> impl Iterator<Item = &RequestPurpose> + '_ {
        self.pending.values().map(|pending| &pending.purpose)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Mirror {
    pub(crate) fn issue(&mut self, request: ProtocolRequest, purpose: RequestPurpose) -> RequestId {
        self.issue_pending(PendingRequest {
            request,
            purpose,
            attempts: 0,
        })
    }

    /// Sends a request and links the fresh id to whatever waits on it.
    pub(crate) fn issue_pending(&mut self, pending: PendingRequest) -> RequestId {
        let request_id = self.protocol.issue(pending.request.clone());
        debug!(
            request_id = request_id.0,
            purpose = ?pending.purpose,
            attempt = pending.attempts,
            "requests: issued"
        );
        match &pending.purpose {
            RequestPurpose::Dialogs(kind) => self.dialog_fetches.attach(kind, request_id),
            RequestPurpose::ReadHistory(peer) => self.history_reads.attach(peer, request_id),
            RequestPurpose::FetchMessages { targets, .. } => {
                self.pending_fetches.mark_issued(targets, request_id)
            }
            RequestPurpose::Stickers => self.sticker_ops.attach(&StickerKey::All, request_id),
            RequestPurpose::InstallSticker(name) | RequestPurpose::UninstallSticker(name) => self
                .sticker_ops
                .attach(&StickerKey::Set(name.clone()), request_id),
            _ => {}
        }
        self.requests.insert(request_id, pending);
        request_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(purpose: RequestPurpose) -> PendingRequest {
        PendingRequest {
            request: ProtocolRequest::GetState,
            purpose,
            attempts: 0,
        }
    }

    #[test]
    fn drain_returns_requests_in_issue_order() {
        let mut registry = RequestRegistry::new();
        registry.insert(RequestId(3), pending(RequestPurpose::Search));
        registry.insert(RequestId(1), pending(RequestPurpose::SyncState));
        registry.insert(RequestId(2), pending(RequestPurpose::Stickers));

        let purposes: Vec<RequestPurpose> = registry
            .drain()
            .into_iter()
            .map(|pending| pending.purpose)
            .collect();
        assert_eq!(
            purposes,
            vec![
                RequestPurpose::SyncState,
                RequestPurpose::Stickers,
                RequestPurpose::Search
            ]
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn find_locates_transfer_requests() {
        let mut registry = RequestRegistry::new();
        registry.insert(RequestId(8), pending(RequestPurpose::Download(TransferId(4))));
        assert_eq!(
            registry.find(|purpose| purpose.transfer() == Some(TransferId(4))),
            Some(RequestId(8))
        );
        assert_eq!(registry.find(|purpose| *purpose == RequestPurpose::Search), None);
    }
}
