use std::{collections::HashMap, hash::Hash};

use shared::{domain::RequestId, error::ProtocolError};
use tokio::sync::oneshot;

pub type Waiter = oneshot::Sender<Result<(), ProtocolError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// No request in flight for the key; the caller must issue one.
    Issue,
    /// Joined the request already in flight.
    Joined,
}

struct Inflight {
    request: Option<RequestId>,
    waiters: Vec<Waiter>,
}

/// At most one outstanding request per key; later callers share its result.
pub struct RequestCoalescer<K> {
    inflight: HashMap<K, Inflight>,
}

impl<K> Default for RequestCoalescer<K> {
    fn default() -> Self {
        Self {
            inflight: HashMap::new(),
        }
    }
}

impl<K: Clone + Eq + Hash> RequestCoalescer<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&mut self, key: K, waiter: Option<Waiter>) -> Admission {
        match self.inflight.get_mut(&key) {
            Some(inflight) => {
                inflight.waiters.extend(waiter);
                Admission::Joined
            }
            None => {
                self.inflight.insert(
                    key,
                    Inflight {
                        request: None,
                        waiters: waiter.into_iter().collect(),
                    },
                );
                Admission::Issue
            }
        }
    }

    pub fn attach(&mut self, key: &K, request: RequestId) {
        if let Some(inflight) = self.inflight.get_mut(key) {
            inflight.request = Some(request);
        }
    }

    pub fn request_of(&self, key: &K) -> Option<RequestId> {
        self.inflight.get(key).and_then(|inflight| inflight.request)
    }

    pub fn is_inflight(&self, key: &K) -> bool {
        self.inflight.contains_key(key)
    }

    /// Clears the key and notifies every waiter. Returns how many were woken.
    pub fn complete(&mut self, key: &K, result: Result<(), ProtocolError>) -> usize {
        let Some(inflight) = self.inflight.remove(key) else {
            return 0;
        };
        let woken = inflight.waiters.len();
        for waiter in inflight.waiters {
            let _ = waiter.send(result.clone());
        }
        woken
    }
}

#[cfg(test)]
mod tests {
    use shared::error::ErrorCode;

    use super::*;

    #[tokio::test]
    async fn second_caller_joins_and_both_see_result() {
        let mut coalescer = RequestCoalescer::new();
        let (first_tx, first_rx) = oneshot::channel();
        let (second_tx, second_rx) = oneshot::channel();

        assert_eq!(coalescer.begin("read", Some(first_tx)), Admission::Issue);
        coalescer.attach(&"read", RequestId(4));
        assert_eq!(coalescer.begin("read", Some(second_tx)), Admission::Joined);
        assert_eq!(coalescer.request_of(&"read"), Some(RequestId(4)));

        assert_eq!(coalescer.complete(&"read", Ok(())), 2);
        assert_eq!(first_rx.await.expect("first"), Ok(()));
        assert_eq!(second_rx.await.expect("second"), Ok(()));
        assert!(!coalescer.is_inflight(&"read"));
    }

    #[tokio::test]
    async fn failure_reaches_every_waiter() {
        let mut coalescer = RequestCoalescer::new();
        let (tx, rx) = oneshot::channel();
        coalescer.begin(1u8, Some(tx));
        coalescer.begin(1u8, None);
        let error = ProtocolError::new(ErrorCode::Timeout, "slow");
        coalescer.complete(&1, Err(error.clone()));
        assert_eq!(rx.await.expect("waiter"), Err(error));
    }

    #[test]
    fn completing_unknown_key_is_noop() {
        let mut coalescer: RequestCoalescer<u8> = RequestCoalescer::new();
        assert_eq!(coalescer.complete(&9, Ok(())), 0);
    }
}
