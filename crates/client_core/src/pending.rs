//! Bookkeeping for messages referenced before they are cached.

use std::collections::{BTreeSet, HashMap, HashSet};

use shared::domain::{Peer, RequestId, UnifiedKey};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchEntry {
    pub peer: Peer,
    pub attempts: u32,
    pub request: Option<RequestId>,
    /// Messages whose reply points at the target.
    pub waiters: BTreeSet<UnifiedKey>,
    /// Conversation whose top message is the target.
    pub for_top_of: Option<Peer>,
}

impl FetchEntry {
    fn new(peer: Peer) -> Self {
        Self {
            peer,
            attempts: 0,
            request: None,
            waiters: BTreeSet::new(),
            for_top_of: None,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum FetchFailure {
    Retry,
    GiveUp(FetchEntry),
}

#[derive(Debug)]
pub struct PendingFetches {
    entries: HashMap<UnifiedKey, FetchEntry>,
    unavailable: HashSet<UnifiedKey>,
    retry_limit: u32,
}

impl PendingFetches {
    pub fn new(retry_limit: u32) -> Self {
        Self {
            entries: HashMap::new(),
            unavailable: HashSet::new(),
            retry_limit: retry_limit.max(1),
        }
    }

    /// Records `waiter` as replying to `target`. Returns whether a fetch must be issued.
    pub fn add_reply_waiter(&mut self, target: UnifiedKey, peer: Peer, waiter: UnifiedKey) -> bool {
        let fresh = !self.entries.contains_key(&target);
        self.entries
            .entry(target)
            .or_insert_with(|| FetchEntry::new(peer))
            .waiters
            .insert(waiter);
        fresh
    }

    pub fn add_top_fetch(&mut self, target: UnifiedKey, peer: Peer) -> bool {
        let fresh = !self.entries.contains_key(&target);
        self.entries
            .entry(target)
            .or_insert_with(|| FetchEntry::new(peer))
            .for_top_of = Some(peer);
        fresh
    }

    pub fn mark_issued(&mut self, targets: &[UnifiedKey], request: RequestId) {
        for target in targets {
            if let Some(entry) = self.entries.get_mut(target) {
                entry.request = Some(request);
            }
        }
    }

    pub fn resolve(&mut self, target: &UnifiedKey) -> Option<FetchEntry> {
        self.unavailable.remove(target);
        self.entries.remove(target)
    }

    pub fn record_failure(&mut self, target: &UnifiedKey) -> FetchFailure {
        let Some(entry) = self.entries.get_mut(target) else {
            return FetchFailure::Retry;
        };
        entry.attempts += 1;
        entry.request = None;
        if entry.attempts < self.retry_limit {
            return FetchFailure::Retry;
        }
        self.unavailable.insert(*target);
        match self.entries.remove(target) {
            Some(entry) => FetchFailure::GiveUp(entry),
            None => FetchFailure::Retry,
        }
    }

    /// Forgets an evicted waiter. Entries left without any reason to exist are dropped.
    pub fn remove_waiter(&mut self, waiter: &UnifiedKey) {
        self.entries.retain(|_, entry| {
            entry.waiters.remove(waiter);
            !entry.waiters.is_empty() || entry.for_top_of.is_some()
        });
    }

    pub fn drop_peer(&mut self, peer: &Peer) {
        self.entries.retain(|_, entry| entry.peer != *peer);
    }

    pub fn entry(&self, target: &UnifiedKey) -> Option<&FetchEntry> {
        self.entries.get(target)
    }

    pub fn is_pending(&self, target: &UnifiedKey) -> bool {
        self.entries.contains_key(target)
    }

    pub fn is_unavailable(&self, target: &UnifiedKey) -> bool {
        self.unavailable.contains(target)
    }

    pub fn targets(&self) -> impl Iterator<Item = &UnifiedKey> + '_ {
        self.entries.keys()
    }

    pub fn waiting_keys(&self) -> impl Iterator<Item = &UnifiedKey> + '_ {
        self.entries.values().flat_map(|entry| entry.waiters.iter())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use shared::domain::{unify, KeyScope, MessageId, UserId};

    use super::*;

    fn key(id: i32) -> UnifiedKey {
        unify(MessageId(id), KeyScope::Global)
    }

    #[test]
    fn only_first_waiter_triggers_fetch() {
        let mut pending = PendingFetches::new(3);
        let peer = Peer::User(UserId(1));
        assert!(pending.add_reply_waiter(key(10), peer, key(11)));
        assert!(!pending.add_reply_waiter(key(10), peer, key(12)));
        let entry = pending.entry(&key(10)).expect("entry");
        assert_eq!(entry.waiters.len(), 2);
    }

    #[test]
    fn gives_up_after_retry_limit() {
        let mut pending = PendingFetches::new(3);
        pending.add_reply_waiter(key(10), Peer::User(UserId(1)), key(11));
        assert_eq!(pending.record_failure(&key(10)), FetchFailure::Retry);
        assert_eq!(pending.record_failure(&key(10)), FetchFailure::Retry);
        match pending.record_failure(&key(10)) {
            FetchFailure::GiveUp(entry) => assert!(entry.waiters.contains(&key(11))),
            FetchFailure::Retry => panic!("third failure should give up"),
        }
        assert!(pending.is_unavailable(&key(10)));
        assert!(!pending.is_pending(&key(10)));
    }

    #[test]
    fn resolving_clears_unavailable_mark() {
        let mut pending = PendingFetches::new(1);
        pending.add_top_fetch(key(5), Peer::User(UserId(2)));
        assert!(matches!(
            pending.record_failure(&key(5)),
            FetchFailure::GiveUp(_)
        ));
        assert!(pending.is_unavailable(&key(5)));
        pending.resolve(&key(5));
        assert!(!pending.is_unavailable(&key(5)));
    }

    #[test]
    fn evicted_waiters_release_their_entry() {
        let mut pending = PendingFetches::new(3);
        pending.add_reply_waiter(key(10), Peer::User(UserId(1)), key(11));
        pending.remove_waiter(&key(11));
        assert!(pending.is_empty());
    }
}
