use shared::{
    domain::{Peer, UnifiedKey},
    protocol::{ChatRecord, MessageRecord, ProtocolRequest, UserRecord},
};
use tracing::debug;

use crate::{entities::Message, entity_store::Provenance, requests::RequestPurpose, Mirror, MirrorEvent};

impl Mirror {
    /// Starts a search. The previous result set stays pinned until results arrive.
    pub fn search(&mut self, query: String, peer: Option<Peer>, limit: i32) {
        self.issue(
            ProtocolRequest::Search { query, peer, limit },
            RequestPurpose::Search,
        );
    }

    pub(crate) fn apply_search_results(
        &mut self,
        messages: &[MessageRecord],
        users: &[UserRecord],
        chats: &[ChatRecord],
    ) {
        self.apply_users(users, Provenance::PullResponse);
        self.apply_chats(chats, Provenance::PullResponse);
        let mut results: Vec<UnifiedKey> = Vec::with_capacity(messages.len());
        for record in messages {
            if let Some((key, _)) =
                self.insert_message(Message::from_record(record), Provenance::PullResponse)
            {
                results.push(key);
            }
        }
        let released = !self.search_results.is_empty();
        self.search_results = results.clone();
        if released {
            self.schedule_sweep();
        }
        debug!(results = results.len(), "search: results applied");
        self.emit(MirrorEvent::SearchResults(results));
    }

    pub fn search_results(&self) -> &[UnifiedKey] {
        &self.search_results
    }

    pub fn clear_search(&mut self) {
        if self.search_results.is_empty() {
            return;
        }
        self.search_results.clear();
        self.emit(MirrorEvent::SearchResults(Vec::new()));
        self.schedule_sweep();
    }
}
