//! The protocol engine: socket, tables, task fabric.
//!
//! `Engine::bind` creates the node, `start` spawns the receive loop, the
//! request and response pipelines, the transaction reaper, the fetch
//! scheduler, the root poll and the directory keepalive. Per-peer
//! maintenance tasks are spawned as handshakes complete.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::crypto::{self, EphemeralKey, Identity};
use crate::directory::{DirectoryClient, DirectoryError};
use crate::events::{EventSink, PeerEvent};
use crate::fetch::FetchJob;
use crate::handshake;
use crate::peer::{resolve_addr, Peer, PeerState, PeerTable, RootPush};
use crate::store::{MerkleStore, RootHistory};
use crate::transaction::{
    ReapAction, TransactionTable, REAP_INTERVAL, RETRIES_DEFAULT, RETRIES_HELLO,
};
use crate::tree::Hash;
use crate::wire::{self, MessageType, HEADER_LEN, MAX_DATAGRAM, OFFSET_TYPE};

pub const PING_INTERVAL: Duration = Duration::from_secs(60);
pub const PEER_TIMEOUT: Duration = Duration::from_secs(360);
pub const REREGISTER_INTERVAL: Duration = Duration::from_secs(20 * 60);
pub const ROOT_POLL_INTERVAL: Duration = Duration::from_secs(180);

const PIPELINE_CAPACITY: usize = 1024;
const FETCH_QUEUE_CAPACITY: usize = 8192;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error("unknown peer {0}")]
    UnknownPeer(String),
    #[error("peer {0} is banned")]
    Banned(String),
    #[error("peer {0} has no active address")]
    NotConnected(String),
    #[error("no known root for peer {0}")]
    NoRoot(String),
    #[error("could not send Hello to {0}")]
    HelloFailed(String),
}

/// Engine construction parameters.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Our name in the directory.
    pub name: String,
    /// UDP bind address.
    pub bind: SocketAddr,
    /// Directory REST base URL.
    pub directory_url: String,
    /// Directory UDP endpoint, `host:port`.
    pub directory_udp: String,
    /// Name under which the directory itself answers Hello.
    pub directory_name: String,
    /// Advertise and use the encryption extension.
    pub encrypt: bool,
}

pub(crate) struct LocalRoots {
    pub root: Option<Hash>,
    pub history: RootHistory,
}

pub struct Engine {
    pub(crate) cfg: EngineConfig,
    pub(crate) socket: UdpSocket,
    pub(crate) identity: Identity,
    pub(crate) peers: PeerTable,
    pub(crate) store: MerkleStore,
    pub(crate) transactions: TransactionTable,
    pub(crate) local: Mutex<LocalRoots>,
    pub(crate) directory: DirectoryClient,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) fetch_tx: mpsc::Sender<FetchJob>,
    fetch_rx: Mutex<Option<mpsc::Receiver<FetchJob>>>,
}

impl Engine {
    /// Bind the UDP socket and assemble the engine. Binding is the only
    /// fatal failure in the whole node.
    pub async fn bind(
        cfg: EngineConfig,
        identity: Identity,
        events: Arc<dyn EventSink>,
    ) -> Result<Arc<Self>, EngineError> {
        let socket = UdpSocket::bind(cfg.bind).await?;
        let local_addr = socket.local_addr()?;
        info!(addr = %local_addr, "udp socket bound");
        let directory = DirectoryClient::new(&cfg.directory_url);
        let (fetch_tx, fetch_rx) = mpsc::channel(FETCH_QUEUE_CAPACITY);
        Ok(Arc::new(Self {
            cfg,
            socket,
            identity,
            peers: PeerTable::new(),
            store: MerkleStore::new(),
            transactions: TransactionTable::new(),
            local: Mutex::new(LocalRoots {
                root: None,
                history: RootHistory::new(),
            }),
            directory,
            events,
            fetch_tx,
            fetch_rx: Mutex::new(Some(fetch_rx)),
        }))
    }

    pub fn store(&self) -> &MerkleStore {
        &self.store
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    pub fn name(&self) -> &str {
        &self.cfg.name
    }

    pub fn local_root(&self) -> Option<Hash> {
        self.local.lock().expect("local roots lock").root
    }

    /// Publish a new local root, garbage-collecting whatever the bounded
    /// history evicts.
    pub fn set_local_root(&self, root: Hash) {
        let evicted = {
            let mut local = self.local.lock().expect("local roots lock");
            if local.root == Some(root) {
                return;
            }
            local.root = Some(root);
            local.history.push(root)
        };
        if let Some(old) = evicted {
            self.gc_evicted_root(&old);
        }
    }

    /// Register our key with the directory and pull the initial peer list.
    pub async fn bootstrap(&self) -> Result<(), EngineError> {
        self.directory
            .register_key(&self.cfg.name, &self.identity.public_key_bytes())
            .await?;
        let names = self.directory.peer_list().await?;
        info!(peers = names.len(), "directory listing fetched");
        self.refresh_peers(&names).await;
        Ok(())
    }

    /// Spawn every long-running task. Returns immediately; the tasks live
    /// until the runtime shuts down.
    pub fn start(self: &Arc<Self>) {
        let (req_tx, req_rx) = mpsc::channel(PIPELINE_CAPACITY);
        let (resp_tx, resp_rx) = mpsc::channel(PIPELINE_CAPACITY);

        tokio::spawn(self.clone().recv_loop(req_tx, resp_tx));
        tokio::spawn(self.clone().request_loop(req_rx));
        tokio::spawn(self.clone().response_loop(resp_rx));
        tokio::spawn(self.clone().reaper_loop());
        let fetch_rx = self
            .fetch_rx
            .lock()
            .expect("fetch rx lock")
            .take()
            .expect("start called twice");
        tokio::spawn(self.clone().fetch_loop(fetch_rx));
        tokio::spawn(self.clone().root_poll_loop());
        tokio::spawn(self.clone().keepalive_loop());
    }

    /// Initiate a handshake with a peer, probing from its first candidate
    /// address. The reaper escalates on silence.
    pub async fn connect(&self, name: &str) -> Result<(), EngineError> {
        let peer = self
            .peers
            .get(name)
            .ok_or_else(|| EngineError::UnknownPeer(name.to_owned()))?;
        if self.peers.is_banned(name) {
            return Err(EngineError::Banned(name.to_owned()));
        }
        if self.hello_to_peer(&peer).await {
            Ok(())
        } else {
            Err(EngineError::HelloFailed(name.to_owned()))
        }
    }

    /// Ask a peer for its current Merkle root.
    pub async fn request_root(&self, name: &str) -> Result<(), EngineError> {
        let peer = self
            .peers
            .get(name)
            .ok_or_else(|| EngineError::UnknownPeer(name.to_owned()))?;
        if self.peers.is_banned(name) {
            return Err(EngineError::Banned(name.to_owned()));
        }
        let addr = peer
            .active_addr()
            .ok_or_else(|| EngineError::NotConnected(name.to_owned()))?;
        self.send_request(
            Some(name),
            addr,
            MessageType::RootRequest,
            &[],
            false,
            RETRIES_DEFAULT,
            None,
        )
        .await;
        Ok(())
    }

    // ---- receive / dispatch ----

    async fn recv_loop(
        self: Arc<Self>,
        req_tx: mpsc::Sender<(Vec<u8>, SocketAddr)>,
        resp_tx: mpsc::Sender<(Vec<u8>, SocketAddr)>,
    ) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (n, addr) = match self.socket.recv_from(&mut buf).await {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(%err, "udp receive failed");
                    continue;
                }
            };
            if n < HEADER_LEN {
                debug!(%addr, len = n, "runt datagram dropped");
                continue;
            }
            let pkt = buf[..n].to_vec();
            // High bit of the type byte separates responses from requests.
            let out = if pkt[OFFSET_TYPE] > 127 {
                &resp_tx
            } else {
                &req_tx
            };
            if out.send((pkt, addr)).await.is_err() {
                return;
            }
        }
    }

    async fn request_loop(self: Arc<Self>, mut rx: mpsc::Receiver<(Vec<u8>, SocketAddr)>) {
        while let Some((pkt, addr)) = rx.recv().await {
            self.handle_request(&pkt, addr).await;
            self.peers.touch_addr(addr);
        }
    }

    async fn response_loop(self: Arc<Self>, mut rx: mpsc::Receiver<(Vec<u8>, SocketAddr)>) {
        while let Some((pkt, addr)) = rx.recv().await {
            self.handle_response(&pkt, addr).await;
            self.peers.touch_addr(addr);
        }
    }

    // ---- send paths ----

    pub(crate) async fn send_frame(&self, addr: SocketAddr, bytes: &[u8]) {
        if let Err(err) = self.socket.send_to(bytes, addr).await {
            warn!(%addr, %err, "udp send failed");
        }
    }

    /// Build and send a frame that tracks no transaction (responses, pings).
    pub(crate) async fn send_message(
        &self,
        addr: SocketAddr,
        id: u32,
        mtype: MessageType,
        body: &[u8],
        sign: bool,
    ) {
        let signer = sign.then_some(&self.identity);
        match wire::build_message(id, mtype, body, signer) {
            Ok(msg) => self.send_frame(addr, &msg).await,
            Err(err) => warn!(%err, ?mtype, "frame build failed"),
        }
    }

    pub(crate) async fn send_ok(&self, addr: SocketAddr, id: u32) {
        self.send_message(addr, id, MessageType::Ok, &[], false).await;
    }

    pub(crate) async fn send_error(&self, addr: SocketAddr, id: u32, reason: &str) {
        self.send_message(addr, id, MessageType::Error, reason.as_bytes(), false)
            .await;
    }

    /// Build, register and send a reliable request. Returns the transaction
    /// id, or `None` when the frame could not be built.
    pub(crate) async fn send_request(
        &self,
        peer: Option<&str>,
        addr: SocketAddr,
        mtype: MessageType,
        body: &[u8],
        sign: bool,
        retries: u32,
        ephemeral: Option<EphemeralKey>,
    ) -> Option<u32> {
        let id = self.transactions.next_id();
        let signer = sign.then_some(&self.identity);
        let msg = match wire::build_message(id, mtype, body, signer) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(%err, ?mtype, "request build failed");
                return None;
            }
        };
        self.transactions
            .register(id, peer, addr, mtype, msg.clone(), retries, ephemeral);
        self.send_frame(addr, &msg).await;
        Some(id)
    }

    // ---- handshake initiation ----

    /// Probe the peer's next candidate address with a Hello. False when the
    /// candidate list is exhausted or the frame could not go out.
    pub(crate) async fn hello_to_peer(&self, peer: &Arc<Peer>) -> bool {
        let Some(addr) = peer.next_address() else {
            return false;
        };
        self.send_hello(peer, addr).await
    }

    /// Send a signed Hello to a fixed address, plain or with a fresh
    /// ephemeral ECDH key. The directory always gets the plain form.
    pub(crate) async fn send_hello(&self, peer: &Arc<Peer>, addr: SocketAddr) -> bool {
        if peer.public_key().is_none() && peer.name != self.cfg.directory_name {
            match self.directory.peer_key(&peer.name).await {
                Ok(key) => peer.set_public_key(key),
                Err(err) => {
                    warn!(peer = %peer.name, %err, "public key fetch failed");
                    return false;
                }
            }
        }
        let ext = handshake::build_extensions(self.cfg.encrypt);
        let plain = !self.cfg.encrypt || peer.name == self.cfg.directory_name;
        debug!(peer = %peer.name, %addr, plain, "sending Hello");
        let sent = if plain {
            let body = handshake::hello_body(ext, &self.cfg.name, None);
            self.send_request(
                Some(&peer.name),
                addr,
                MessageType::Hello,
                &body,
                true,
                RETRIES_HELLO,
                None,
            )
            .await
        } else {
            let ephemeral = EphemeralKey::generate();
            let body =
                handshake::hello_body(ext, &self.cfg.name, Some(&ephemeral.public_bytes()));
            self.send_request(
                Some(&peer.name),
                addr,
                MessageType::Hello,
                &body,
                true,
                RETRIES_HELLO,
                Some(ephemeral),
            )
            .await
        };
        sent.is_some()
    }

    /// Ask the directory to relay a NAT traversal toward the peer's next
    /// candidate address.
    pub(crate) async fn try_nat_traversal(&self, peer: &Arc<Peer>) -> bool {
        if peer.name == self.cfg.directory_name {
            return false;
        }
        let Some(target) = peer.next_address() else {
            return false;
        };
        let Some(dir_addr) = resolve_addr(&self.cfg.directory_udp) else {
            warn!("directory UDP address does not resolve");
            return false;
        };
        debug!(peer = %peer.name, %target, "starting NAT traversal");
        let body = wire::encode_nat_body(target);
        self.send_request(
            Some(&peer.name),
            dir_addr,
            MessageType::NatTraversalRequest,
            &body,
            true,
            RETRIES_HELLO,
            None,
        )
        .await
        .is_some()
    }

    // ---- signature checks ----

    /// Verify a signed frame against the long-term key of the peer owning
    /// `addr`, fetching the key from the directory when unknown.
    pub(crate) async fn verify_signed_from(
        &self,
        addr: SocketAddr,
        signed: &[u8],
        signature: Option<&[u8]>,
    ) -> bool {
        let Some(peer) = self.peers.find_by_addr(addr) else {
            debug!(%addr, "signed frame from unknown address");
            return false;
        };
        self.verify_signed_peer(&peer, signed, signature).await
    }

    pub(crate) async fn verify_signed_peer(
        &self,
        peer: &Arc<Peer>,
        signed: &[u8],
        signature: Option<&[u8]>,
    ) -> bool {
        let Some(signature) = signature else {
            return false;
        };
        let key = match peer.public_key() {
            Some(key) => key,
            None => match self.directory.peer_key(&peer.name).await {
                Ok(key) => {
                    peer.set_public_key(key);
                    key
                }
                Err(err) => {
                    warn!(peer = %peer.name, %err, "public key fetch failed");
                    return false;
                }
            },
        };
        crypto::verify(&key, signed, signature)
    }

    // ---- reaper ----

    async fn reaper_loop(self: Arc<Self>) {
        let mut tick = tokio::time::interval(REAP_INTERVAL);
        loop {
            tick.tick().await;
            for action in self.transactions.reap(Instant::now()) {
                match action {
                    ReapAction::Resend { addr, msg } => self.send_frame(addr, &msg).await,
                    ReapAction::DatumExhausted { peer } => {
                        if let Some(peer) = peer.and_then(|name| self.peers.get(&name)) {
                            peer.window.on_timeout();
                        }
                    }
                    ReapAction::HelloExhausted { peer } => self.escalate_hello(&peer).await,
                    ReapAction::NatExhausted { peer } => self.escalate_nat(&peer).await,
                }
            }
        }
    }

    /// Hello retries ran out: rotate to the next candidate address, and when
    /// the list is exhausted fall back to NAT traversal.
    async fn escalate_hello(&self, name: &str) {
        let Some(peer) = self.peers.get(name) else {
            return;
        };
        if peer.state() != PeerState::Discovered {
            return;
        }
        if !self.hello_to_peer(&peer).await {
            self.events.on_peer_event(
                name,
                PeerEvent::ConnectionFailed,
                "no Hello answer, trying NAT traversal",
            );
            peer.set_state(PeerState::WaitHelloNat);
            self.try_nat_traversal(&peer).await;
        }
    }

    /// NAT traversal retries ran out: rotate, or give up on the peer.
    async fn escalate_nat(&self, name: &str) {
        let Some(peer) = self.peers.get(name) else {
            return;
        };
        if peer.state() != PeerState::WaitHelloNat {
            return;
        }
        if !self.try_nat_traversal(&peer).await {
            self.events
                .on_peer_event(name, PeerEvent::ConnectionFailed, "NAT traversal exhausted");
        }
    }

    // ---- maintenance ----

    /// Keepalive task for one associated peer: ping every minute, expire on
    /// six minutes of silence.
    pub(crate) fn spawn_maintenance(self: &Arc<Self>, peer: Arc<Peer>) {
        let engine = self.clone();
        tokio::spawn(async move {
            loop {
                if let Some(addr) = peer.active_addr() {
                    let id = engine.transactions.next_id();
                    engine
                        .send_message(addr, id, MessageType::Ping, &[], false)
                        .await;
                }
                if peer.idle_for() >= PEER_TIMEOUT {
                    info!(peer = %peer.name, "keepalive timeout, disconnecting");
                    peer.disconnect();
                    engine
                        .events
                        .on_peer_event(&peer.name, PeerEvent::Disconnected, "");
                    return;
                }
                tokio::time::sleep(PING_INTERVAL).await;
            }
        });
    }

    /// Directory keepalive: initial handshake, then periodic key
    /// re-registration, re-handshake and peer list refresh.
    async fn keepalive_loop(self: Arc<Self>) {
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.handshake_with_directory().await;
        loop {
            tokio::time::sleep(REREGISTER_INTERVAL).await;
            if let Err(err) = self
                .directory
                .register_key(&self.cfg.name, &self.identity.public_key_bytes())
                .await
            {
                warn!(%err, "key re-registration failed");
            }
            self.handshake_with_directory().await;
            match self.directory.peer_list_if_changed().await {
                Ok(Some(names)) => self.refresh_peers(&names).await,
                Ok(None) => {}
                Err(err) => warn!(%err, "peer list refresh failed"),
            }
        }
    }

    async fn handshake_with_directory(&self) {
        let Some(addr) = resolve_addr(&self.cfg.directory_udp) else {
            warn!("directory UDP address does not resolve");
            return;
        };
        let (peer, _) = self.peers.upsert(&self.cfg.directory_name);
        peer.pin_address(addr);
        self.send_hello(&peer, addr).await;
    }

    /// Poll every associated peer for its current root.
    async fn root_poll_loop(self: Arc<Self>) {
        let mut tick = tokio::time::interval(ROOT_POLL_INTERVAL);
        tick.tick().await;
        loop {
            tick.tick().await;
            for peer in self.peers.all() {
                if peer.state() != PeerState::Associated {
                    continue;
                }
                let Some(addr) = peer.active_addr() else {
                    continue;
                };
                if peer.root().is_none() || self.peers.is_banned(&peer.name) {
                    continue;
                }
                self.send_request(
                    Some(&peer.name),
                    addr,
                    MessageType::RootRequest,
                    &[],
                    false,
                    RETRIES_DEFAULT,
                    None,
                )
                .await;
            }
        }
    }

    // ---- peer bookkeeping ----

    /// Reconcile the table with a fresh directory listing: pull addresses
    /// for new or known names, drop names no longer listed.
    pub async fn refresh_peers(&self, names: &[String]) {
        let mut keep: HashSet<String> = HashSet::new();
        keep.insert(self.cfg.directory_name.clone());
        for name in names {
            if *name == self.cfg.name {
                continue;
            }
            keep.insert(name.clone());
            let addresses = match self.directory.peer_addresses(name).await {
                Ok(addresses) => addresses,
                Err(err) => {
                    warn!(peer = %name, %err, "address fetch failed");
                    continue;
                }
            };
            if addresses.is_empty() {
                debug!(peer = %name, "no addresses listed, skipping");
                continue;
            }
            let (peer, added) = self.peers.upsert(name);
            peer.set_addresses(addresses);
            if added {
                debug!(peer = %name, "peer discovered");
            }
        }
        for name in self.peers.retain_named(&keep) {
            debug!(peer = %name, "peer no longer listed, removed");
        }
    }

    /// Record a root advertised by a peer, garbage-collecting what its
    /// history evicts.
    pub(crate) fn add_peer_root(&self, peer: &Arc<Peer>, root: Hash) {
        match peer.push_root(root) {
            RootPush::Unchanged => {
                self.events
                    .on_peer_event(&peer.name, PeerEvent::NewRoot, "(unchanged)");
            }
            RootPush::Changed { evicted } => {
                self.events
                    .on_peer_event(&peer.name, PeerEvent::NewRoot, &hex::encode(root));
                if let Some(old) = evicted {
                    self.gc_evicted_root(&old);
                }
            }
        }
    }

    /// Delete an evicted root's tree unless some live root still references
    /// it; shared subtrees below it are protected by refcounts either way.
    pub(crate) fn gc_evicted_root(&self, old: &Hash) {
        {
            let local = self.local.lock().expect("local roots lock");
            if local.history.contains(old) {
                return;
            }
        }
        for peer in self.peers.all() {
            if peer.root() == Some(*old) || peer.roots().contains(old) {
                return;
            }
        }
        debug!(root = %hex::encode(old), "garbage-collecting displaced root");
        self.store.delete_tree(old);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::LogSink;
    use crate::transaction::RETRIES_DATUM;
    use crate::tree;
    use crate::window::WINDOW_INITIAL;

    struct Recorder(Mutex<Vec<(String, PeerEvent)>>);

    impl EventSink for Recorder {
        fn on_peer_event(&self, peer: &str, event: PeerEvent, _detail: &str) {
            self.0
                .lock()
                .expect("recorder lock")
                .push((peer.to_owned(), event));
        }
    }

    async fn named_engine(name: &str, encrypt: bool, events: Arc<dyn EventSink>) -> Arc<Engine> {
        let cfg = EngineConfig {
            name: name.to_owned(),
            bind: "127.0.0.1:0".parse().unwrap(),
            // Never contacted by these tests.
            directory_url: "http://127.0.0.1:9".to_owned(),
            directory_udp: "127.0.0.1:9".to_owned(),
            directory_name: "directory.test".to_owned(),
            encrypt,
        };
        Engine::bind(cfg, Identity::generate(), events)
            .await
            .unwrap()
    }

    async fn test_engine(events: Arc<dyn EventSink>) -> Arc<Engine> {
        named_engine("self", false, events).await
    }

    /// Two engines on localhost, each seeded with the other's identity and
    /// address so no directory round-trip is needed.
    async fn engine_pair(encrypt: bool) -> (Arc<Engine>, Arc<Engine>) {
        let a = named_engine("node-a", encrypt, Arc::new(LogSink)).await;
        let b = named_engine("node-b", encrypt, Arc::new(LogSink)).await;
        let addr_a = a.socket.local_addr().unwrap();
        let addr_b = b.socket.local_addr().unwrap();

        let (peer_b, _) = a.peers.upsert("node-b");
        peer_b.set_public_key(b.identity.public_key());
        peer_b.set_addresses(vec![addr_b.to_string()]);

        let (peer_a, _) = b.peers.upsert("node-a");
        peer_a.set_public_key(a.identity.public_key());
        peer_a.set_addresses(vec![addr_a.to_string()]);

        a.start();
        b.start();
        (a, b)
    }

    async fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
        let ok = tokio::time::timeout(Duration::from_secs(10), async {
            while !done() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(ok.is_ok(), "timed out waiting for {what}");
    }

    #[tokio::test]
    async fn two_nodes_plain_handshake() {
        let (a, b) = engine_pair(false).await;
        a.connect("node-b").await.unwrap();
        wait_for("both peers associated", || {
            a.peers.get("node-b").unwrap().state() == PeerState::Associated
                && b.peers.get("node-a").unwrap().state() == PeerState::Associated
        })
        .await;
        // Plain handshake installs no session key.
        assert!(a.peers.get("node-b").unwrap().session_key().is_none());
    }

    #[tokio::test]
    async fn two_nodes_encrypted_handshake_and_fetch() {
        let (a, b) = engine_pair(true).await;
        a.connect("node-b").await.unwrap();
        wait_for("both peers associated", || {
            a.peers.get("node-b").unwrap().state() == PeerState::Associated
                && b.peers.get("node-a").unwrap().state() == PeerState::Associated
        })
        .await;

        // Both sides derived the same 32-byte session key.
        let key_a = a.peers.get("node-b").unwrap().session_key();
        let key_b = b.peers.get("node-a").unwrap().session_key();
        assert!(key_a.is_some());
        assert_eq!(key_a, key_b);

        // b publishes a one-chunk tree; a fetches and verifies it.
        let root = b.store.fill(tree::chunk_node(b"shared payload"));
        b.set_local_root(root);
        let peer_b = a.peers.get("node-b").unwrap();
        a.add_peer_root(&peer_b, root);
        a.start_fetch("node-b").await.unwrap();

        wait_for("tree fetched", || peer_b.fetch_done()).await;
        assert!(a.store.verify(&root));
        assert_eq!(a.store.find(&root), b.store.find(&root));
    }

    fn peer_at(engine: &Engine, name: &str, addr: SocketAddr) -> Arc<Peer> {
        let (peer, _) = engine.peers.upsert(name);
        peer.pin_address(addr);
        peer
    }

    #[tokio::test]
    async fn forged_datum_not_stored_not_credited() {
        let engine = test_engine(Arc::new(LogSink)).await;
        let addr: SocketAddr = "127.0.0.1:46001".parse().unwrap();
        let peer = peer_at(&engine, "mallory", addr);

        let requested = tree::sha(&tree::chunk_node(b"the real data"));
        assert!(peer.window.try_acquire());
        let id = engine
            .send_request(
                Some("mallory"),
                addr,
                MessageType::DatumRequest,
                &requested,
                false,
                RETRIES_DATUM,
                None,
            )
            .await
            .unwrap();

        // Body hashes to something else than what was asked for.
        let mut body = requested.to_vec();
        body.extend_from_slice(b"not the real data");
        let pkt = wire::build_message(id, MessageType::Datum, &body, None).unwrap();
        engine.handle_response(&pkt, addr).await;

        assert!(!engine.store.contains(&requested));
        // The transaction is resolved so retries will not fire, but the
        // window slot was released as a loss, not credited.
        assert!(engine.transactions.is_empty());
        let (size, inflight) = peer.window.snapshot();
        assert_eq!(inflight, 0);
        assert_eq!(size, WINDOW_INITIAL / 2);
    }

    #[tokio::test]
    async fn verified_datum_stored_children_enqueued() {
        let engine = test_engine(Arc::new(LogSink)).await;
        let mut fetch_rx = engine.fetch_rx.lock().unwrap().take().unwrap();
        let addr: SocketAddr = "127.0.0.1:46002".parse().unwrap();
        let peer = peer_at(&engine, "carol", addr);

        let c1 = tree::sha(&tree::chunk_node(b"one"));
        let c2 = tree::sha(&tree::chunk_node(b"two"));
        let node = tree::directory_node(&[("a".to_owned(), c1), ("b".to_owned(), c2)]);
        let requested = tree::sha(&node);

        assert!(peer.window.try_acquire());
        let id = engine
            .send_request(
                Some("carol"),
                addr,
                MessageType::DatumRequest,
                &requested,
                false,
                RETRIES_DATUM,
                None,
            )
            .await
            .unwrap();

        let mut body = requested.to_vec();
        body.extend_from_slice(&node);
        let pkt = wire::build_message(id, MessageType::Datum, &body, None).unwrap();
        engine.handle_response(&pkt, addr).await;

        assert!(engine.store.contains(&requested));
        let (size, inflight) = peer.window.snapshot();
        assert_eq!(inflight, 0);
        assert_eq!(size, WINDOW_INITIAL + 1);
        // Both children queued for the same peer.
        assert_eq!(fetch_rx.try_recv().unwrap().hash, c1);
        assert_eq!(fetch_rx.try_recv().unwrap().hash, c2);
        assert!(fetch_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn sealed_datum_decrypts_with_session_key() {
        let engine = test_engine(Arc::new(LogSink)).await;
        let addr: SocketAddr = "127.0.0.1:46003".parse().unwrap();
        let peer = peer_at(&engine, "dave", addr);
        let key = [7u8; 32];
        peer.set_session_key(key);

        let node = tree::chunk_node(b"secret chunk");
        let requested = tree::sha(&node);
        assert!(peer.window.try_acquire());
        let id = engine
            .send_request(
                Some("dave"),
                addr,
                MessageType::DatumRequest,
                &requested,
                false,
                RETRIES_DATUM,
                None,
            )
            .await
            .unwrap();

        let mut plain = requested.to_vec();
        plain.extend_from_slice(&node);
        let sealed = crypto::seal(&key, &plain).unwrap();
        let pkt = wire::build_message(id, MessageType::Datum, &sealed, None).unwrap();
        engine.handle_response(&pkt, addr).await;

        assert!(engine.store.contains(&requested));
        assert_eq!(peer.window.snapshot().1, 0);
    }

    #[tokio::test]
    async fn fetch_completes_when_root_verifies() {
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let engine = test_engine(recorder.clone()).await;
        let addr: SocketAddr = "127.0.0.1:46004".parse().unwrap();
        let peer = peer_at(&engine, "erin", addr);

        let node = tree::chunk_node(b"whole tree in one chunk");
        let root = tree::sha(&node);
        peer.push_root(root);
        peer.start_fetch();

        assert!(peer.window.try_acquire());
        let id = engine
            .send_request(
                Some("erin"),
                addr,
                MessageType::DatumRequest,
                &root,
                false,
                RETRIES_DATUM,
                None,
            )
            .await
            .unwrap();
        let mut body = root.to_vec();
        body.extend_from_slice(&node);
        let pkt = wire::build_message(id, MessageType::Datum, &body, None).unwrap();
        engine.handle_response(&pkt, addr).await;

        assert!(peer.fetch_done());
        let events = recorder.0.lock().unwrap();
        assert!(events
            .iter()
            .any(|(name, ev)| name == "erin" && *ev == PeerEvent::MerkleDownloadComplete));
    }

    #[tokio::test]
    async fn unchanged_root_fetch_is_local() {
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let engine = test_engine(recorder.clone()).await;
        let addr: SocketAddr = "127.0.0.1:46005".parse().unwrap();
        let peer = peer_at(&engine, "frank", addr);

        peer.push_root([5u8; 32]);
        // A completed fetch clears root_changed.
        peer.start_fetch();
        peer.finish_fetch();

        engine.start_fetch("frank").await.unwrap();
        let events = recorder.0.lock().unwrap();
        assert!(events
            .iter()
            .any(|(name, ev)| name == "frank" && *ev == PeerEvent::MerkleDownloadLocal));
    }

    #[tokio::test]
    async fn displaced_root_is_garbage_collected() {
        let engine = test_engine(Arc::new(LogSink)).await;
        let (peer, _) = engine.peers.upsert("grace");

        // r1 holds {a, shared}; r2 holds {shared, b}; r3 and r4 are disjoint.
        let a = engine.store.fill(tree::chunk_node(b"only in r1"));
        let shared = engine.store.fill(tree::chunk_node(b"shared"));
        let r1 = engine
            .store
            .fill(tree::fanout_node(tree::NodeTag::Big, &[a, shared]));
        engine.add_peer_root(&peer, r1);

        engine.store.fill(tree::chunk_node(b"shared"));
        let b = engine.store.fill(tree::chunk_node(b"only in r2"));
        let r2 = engine
            .store
            .fill(tree::fanout_node(tree::NodeTag::Big, &[shared, b]));
        engine.add_peer_root(&peer, r2);

        let c = engine.store.fill(tree::chunk_node(b"r3"));
        let r3 = engine.store.fill(tree::fanout_node(tree::NodeTag::Big, &[c]));
        engine.add_peer_root(&peer, r3);

        // All three trees live while in the history.
        assert!(engine.store.verify(&r1));
        assert!(engine.store.verify(&r2));

        let d = engine.store.fill(tree::chunk_node(b"r4"));
        let r4 = engine.store.fill(tree::fanout_node(tree::NodeTag::Big, &[d]));
        engine.add_peer_root(&peer, r4);

        // r1 left the history: its exclusive nodes are gone, shared survive.
        assert!(!engine.store.contains(&r1));
        assert!(!engine.store.contains(&a));
        assert!(engine.store.contains(&shared));
        assert!(engine.store.verify(&r2));
        assert!(engine.store.verify(&r3));
        assert!(engine.store.verify(&r4));
    }

    #[tokio::test]
    async fn unchanged_root_readvertised_is_noop() {
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let engine = test_engine(recorder.clone()).await;
        let (peer, _) = engine.peers.upsert("heidi");
        engine.add_peer_root(&peer, [9u8; 32]);
        engine.add_peer_root(&peer, [9u8; 32]);
        let events = recorder.0.lock().unwrap();
        let new_roots = events
            .iter()
            .filter(|(_, ev)| *ev == PeerEvent::NewRoot)
            .count();
        assert_eq!(new_roots, 2);
        assert_eq!(peer.roots().len(), 1);
    }
}
