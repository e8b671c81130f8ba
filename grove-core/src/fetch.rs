//! Fetch scheduler: walk an unknown Merkle tree by following hash references
//! as Datum replies arrive, paced by each peer's sliding window.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::engine::{Engine, EngineError};
use crate::events::PeerEvent;
use crate::peer::Peer;
use crate::transaction::RETRIES_DATUM;
use crate::tree::{self, Hash, NodeTag};
use crate::wire::MessageType;

/// One pending fetch: which hash, from which address.
#[derive(Debug, Clone, Copy)]
pub struct FetchJob {
    pub hash: Hash,
    pub addr: SocketAddr,
}

impl Engine {
    /// Begin downloading a peer's advertised tree. If the root has not
    /// changed since the last complete fetch, the tree is already local and
    /// no request goes out.
    pub async fn start_fetch(&self, name: &str) -> Result<(), EngineError> {
        let peer = self
            .peers
            .get(name)
            .ok_or_else(|| EngineError::UnknownPeer(name.to_owned()))?;
        if self.peers.is_banned(name) {
            return Err(EngineError::Banned(name.to_owned()));
        }
        let root = peer.root().ok_or_else(|| EngineError::NoRoot(name.to_owned()))?;
        let addr = peer
            .active_addr()
            .ok_or_else(|| EngineError::NotConnected(name.to_owned()))?;
        if !peer.root_changed() {
            debug!(peer = %name, "root unchanged, tree already local");
            self.events
                .on_peer_event(name, PeerEvent::MerkleDownloadLocal, "");
            return Ok(());
        }
        peer.start_fetch();
        let _ = self.fetch_tx.send(FetchJob { hash: root, addr }).await;
        Ok(())
    }

    /// Drain the job queue: wait for a window slot, then issue the
    /// DatumRequest as a reliable transaction.
    pub(crate) async fn fetch_loop(self: Arc<Self>, mut rx: mpsc::Receiver<FetchJob>) {
        while let Some(job) = rx.recv().await {
            let Some(peer) = self.peers.find_by_addr(job.addr) else {
                debug!(addr = %job.addr, "fetch job for unknown peer dropped");
                continue;
            };
            peer.window.acquire().await;
            self.send_request(
                Some(&peer.name),
                job.addr,
                MessageType::DatumRequest,
                &job.hash,
                false,
                RETRIES_DATUM,
                None,
            )
            .await;
        }
    }

    /// Store a verified datum and enqueue a fetch for every hash it
    /// references. Chunks terminate the descent.
    pub(crate) async fn ingest_datum(&self, peer: &Arc<Peer>, addr: SocketAddr, body: &[u8]) {
        let node = &body[tree::HASH_LEN..];
        let Some(tag) = tree::node_tag(node) else {
            warn!(peer = %peer.name, "datum with unknown node tag dropped");
            return;
        };
        self.store.fill(node.to_vec());
        if tag == NodeTag::Chunk {
            return;
        }
        for hash in tree::children(node) {
            if self.fetch_tx.send(FetchJob { hash, addr }).await.is_err() {
                return;
            }
        }
    }
}
