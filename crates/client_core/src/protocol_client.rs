use std::sync::atomic::{AtomicI64, Ordering};

use shared::{domain::RequestId, protocol::ProtocolRequest};
use tokio::sync::mpsc;
use tracing::warn;

/// Outbound half of the remote protocol.
///
/// Issuing never blocks: the request is queued and its outcome comes back as a
/// `ProtocolEvent::Response` carrying the returned id.
pub trait ProtocolClient: Send + Sync {
    fn issue(&self, request: ProtocolRequest) -> RequestId;

    /// Drops the current connection and starts a fresh one.
    fn reinitialize(&self);
}

/// What a [`ChannelProtocolClient`] hands to the transport task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Request {
        request_id: RequestId,
        request: ProtocolRequest,
    },
    Reinitialize,
}

/// Forwards requests over a channel to whatever task owns the connection.
pub struct ChannelProtocolClient {
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    next_id: AtomicI64,
}

impl ChannelProtocolClient {
    pub fn new(outbound: mpsc::UnboundedSender<OutboundFrame>) -> Self {
        Self {
            outbound,
            next_id: AtomicI64::new(1),
        }
    }
}

impl ProtocolClient for ChannelProtocolClient {
    fn issue(&self, request: ProtocolRequest) -> RequestId {
        let request_id = RequestId(self.next_id.fetch_add(1, Ordering::Relaxed));
        if self
            .outbound
            .send(OutboundFrame::Request {
                request_id,
                request,
            })
            .is_err()
        {
            warn!(request_id = request_id.0, "protocol: transport closed, request dropped");
        }
        request_id
    }

    fn reinitialize(&self) {
        if self.outbound.send(OutboundFrame::Reinitialize).is_err() {
            warn!("protocol: transport closed, cannot reinitialize");
        }
    }
}

pub struct MissingProtocolClient {
    next_id: AtomicI64,
}

impl Default for MissingProtocolClient {
    fn default() -> Self {
        Self {
            next_id: AtomicI64::new(1),
        }
    }
}

impl ProtocolClient for MissingProtocolClient {
    fn issue(&self, request: ProtocolRequest) -> RequestId {
        let request_id = RequestId(self.next_id.fetch_add(1, Ordering::Relaxed));
        warn!(
            request_id = request_id.0,
            ?request,
            "protocol: no protocol client configured; request will never complete"
        );
        request_id
    }

    fn reinitialize(&self) {
        warn!("protocol: no protocol client configured; nothing to reinitialize");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_client_numbers_requests_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = ChannelProtocolClient::new(tx);
        let first = client.issue(ProtocolRequest::GetState);
        let second = client.issue(ProtocolRequest::GetAllStickers);
        client.reinitialize();

        assert_eq!(first, RequestId(1));
        assert_eq!(second, RequestId(2));
        assert_eq!(
            rx.try_recv().expect("first frame"),
            OutboundFrame::Request {
                request_id: first,
                request: ProtocolRequest::GetState
            }
        );
        assert!(matches!(
            rx.try_recv().expect("second frame"),
            OutboundFrame::Request { .. }
        ));
        assert_eq!(rx.try_recv().expect("reinit"), OutboundFrame::Reinitialize);
    }

    #[test]
    fn closed_transport_still_yields_ids() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let client = ChannelProtocolClient::new(tx);
        assert_eq!(client.issue(ProtocolRequest::GetState), RequestId(1));
    }
}
