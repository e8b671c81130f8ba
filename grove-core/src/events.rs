//! Peer lifecycle events, delivered to whatever sink the host wires in.

use std::sync::Arc;

use tracing::info;

/// Everything the engine reports about a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    Connected,
    ConnectionFailed,
    NewRoot,
    MerkleDownloadComplete,
    /// The peer's tree was already local; no request was needed.
    MerkleDownloadLocal,
    NoDatum,
    NatTraversal2Received,
    Disconnected,
}

/// Observer interface. The engine takes one sink at construction; use
/// [`Broadcast`] to fan out to several.
pub trait EventSink: Send + Sync {
    fn on_peer_event(&self, peer: &str, event: PeerEvent, detail: &str);
}

/// Sink that writes every event through `tracing`.
pub struct LogSink;

impl EventSink for LogSink {
    fn on_peer_event(&self, peer: &str, event: PeerEvent, detail: &str) {
        if detail.is_empty() {
            info!(peer, ?event, "peer event");
        } else {
            info!(peer, ?event, detail, "peer event");
        }
    }
}

/// Composite sink: delivers each event to every inner sink in order.
pub struct Broadcast {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl Broadcast {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for Broadcast {
    fn on_peer_event(&self, peer: &str, event: PeerEvent, detail: &str) {
        for sink in &self.sinks {
            sink.on_peer_event(peer, event, detail);
        }
    }
}
