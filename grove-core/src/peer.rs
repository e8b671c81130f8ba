//! Peer records and the peer table: lifecycle state, candidate-address
//! probing, ban set, root history.

use std::collections::{HashMap, HashSet};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use p256::ecdsa::VerifyingKey;
use tracing::debug;

use crate::crypto::SESSION_KEY_LEN;
use crate::store::RootHistory;
use crate::tree::Hash;
use crate::window::SlidingWindow;

/// Lifecycle of a remote node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Known from the directory or an inbound Hello; no handshake yet.
    Discovered,
    /// NAT traversal started; waiting for the peer's Ping.
    WaitHelloNat,
    /// Handshake completed.
    Associated,
    /// Keepalive timed out.
    Expired,
}

/// Candidate-address cursor. `Pinned` means the active address was fixed by
/// the caller (server handshake, NAT ping) and must not rotate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    Rotate(usize),
    Pinned,
}

/// Outcome of recording a root advertised by a peer.
#[derive(Debug, PartialEq, Eq)]
pub enum RootPush {
    /// Same root as before; nothing to do.
    Unchanged,
    /// New root installed; the history may have evicted its oldest entry.
    Changed { evicted: Option<Hash> },
}

struct PeerInner {
    addresses: Vec<String>,
    cursor: Cursor,
    active_addr: Option<SocketAddr>,
    public_key: Option<VerifyingKey>,
    last_seen: Instant,
    root: Option<Hash>,
    roots: RootHistory,
    session_key: Option<[u8; SESSION_KEY_LEN]>,
    fetch_started: Option<Instant>,
    fetch_done: bool,
    root_changed: bool,
    state: PeerState,
}

/// Point-in-time view of a peer for display surfaces.
#[derive(Debug, Clone)]
pub struct PeerSummary {
    pub name: String,
    pub state: PeerState,
    pub active_addr: Option<SocketAddr>,
    pub root: Option<String>,
    pub window_size: u32,
    pub window_inflight: u32,
    pub idle: Duration,
}

/// One remote node. The table hands these out as `Arc<Peer>`; mutable state
/// sits behind the record's own lock, the window behind its own.
pub struct Peer {
    pub name: String,
    pub window: SlidingWindow,
    inner: RwLock<PeerInner>,
}

impl Peer {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            window: SlidingWindow::default(),
            inner: RwLock::new(PeerInner {
                addresses: Vec::new(),
                cursor: Cursor::Rotate(0),
                active_addr: None,
                public_key: None,
                last_seen: Instant::now(),
                root: None,
                roots: RootHistory::new(),
                session_key: None,
                fetch_started: None,
                fetch_done: false,
                root_changed: false,
                state: PeerState::Discovered,
            }),
        }
    }

    pub fn state(&self) -> PeerState {
        self.inner.read().expect("peer lock").state
    }

    pub fn set_state(&self, state: PeerState) {
        self.inner.write().expect("peer lock").state = state;
    }

    pub fn addresses(&self) -> Vec<String> {
        self.inner.read().expect("peer lock").addresses.clone()
    }

    pub fn set_addresses(&self, addresses: Vec<String>) {
        self.inner.write().expect("peer lock").addresses = addresses;
    }

    pub fn active_addr(&self) -> Option<SocketAddr> {
        self.inner.read().expect("peer lock").active_addr
    }

    /// Record the address a packet validated, without touching the cursor.
    pub fn set_active_addr(&self, addr: SocketAddr) {
        self.inner.write().expect("peer lock").active_addr = Some(addr);
    }

    /// Start the next probing round from the head of the candidate list.
    pub fn reset_cursor(&self) {
        self.inner.write().expect("peer lock").cursor = Cursor::Rotate(0);
    }

    pub fn public_key(&self) -> Option<VerifyingKey> {
        self.inner.read().expect("peer lock").public_key
    }

    pub fn set_public_key(&self, key: VerifyingKey) {
        self.inner.write().expect("peer lock").public_key = Some(key);
    }

    pub fn session_key(&self) -> Option<[u8; SESSION_KEY_LEN]> {
        self.inner.read().expect("peer lock").session_key
    }

    pub fn set_session_key(&self, key: [u8; SESSION_KEY_LEN]) {
        self.inner.write().expect("peer lock").session_key = Some(key);
    }

    pub fn touch(&self) {
        self.inner.write().expect("peer lock").last_seen = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.inner.read().expect("peer lock").last_seen.elapsed()
    }

    pub fn root(&self) -> Option<Hash> {
        self.inner.read().expect("peer lock").root
    }

    pub fn root_changed(&self) -> bool {
        self.inner.read().expect("peer lock").root_changed
    }

    pub fn roots(&self) -> RootHistory {
        self.inner.read().expect("peer lock").roots.clone()
    }

    /// Record an advertised root. Identical roots are a no-op; a new root
    /// enters the bounded history and may evict its oldest entry, which the
    /// caller garbage-collects if nothing else references it.
    pub fn push_root(&self, root: Hash) -> RootPush {
        let mut inner = self.inner.write().expect("peer lock");
        if inner.root == Some(root) {
            return RootPush::Unchanged;
        }
        inner.root = Some(root);
        inner.root_changed = true;
        let evicted = inner.roots.push(root);
        RootPush::Changed { evicted }
    }

    /// Begin fetching this peer's tree.
    pub fn start_fetch(&self) {
        let mut inner = self.inner.write().expect("peer lock");
        inner.fetch_started = Some(Instant::now());
        inner.fetch_done = false;
        inner.root_changed = false;
    }

    pub fn fetch_done(&self) -> bool {
        self.inner.read().expect("peer lock").fetch_done
    }

    /// Mark the fetch complete, returning its duration the first time.
    pub fn finish_fetch(&self) -> Option<Duration> {
        let mut inner = self.inner.write().expect("peer lock");
        if inner.fetch_done {
            return None;
        }
        inner.fetch_done = true;
        inner.fetch_started.map(|t| t.elapsed())
    }

    /// Advance the cursor and return the next candidate address. `None`
    /// means the list is exhausted (cursor wrapped to 0) or the address was
    /// pinned, in which case the pin is cleared for the next round.
    pub fn next_address(&self) -> Option<SocketAddr> {
        let mut inner = self.inner.write().expect("peer lock");
        let mut index = match inner.cursor {
            Cursor::Pinned => {
                inner.cursor = Cursor::Rotate(0);
                return None;
            }
            Cursor::Rotate(i) => i,
        };
        loop {
            if inner.addresses.is_empty() || index >= inner.addresses.len() {
                inner.cursor = Cursor::Rotate(0);
                return None;
            }
            match resolve_addr(&inner.addresses[index]) {
                Some(addr) => {
                    inner.active_addr = Some(addr);
                    inner.cursor = Cursor::Rotate(index + 1);
                    return Some(addr);
                }
                None => {
                    debug!(peer = %self.name, candidate = %inner.addresses[index], "unresolvable address skipped");
                    index += 1;
                }
            }
        }
    }

    /// Fix the active address from outside the rotation (server handshake,
    /// NAT ping source).
    pub fn pin_address(&self, addr: SocketAddr) {
        let mut inner = self.inner.write().expect("peer lock");
        inner.cursor = Cursor::Pinned;
        inner.active_addr = Some(addr);
    }

    /// Point the cursor at the candidate matching `addr`. Returns false when
    /// no candidate resolves to it.
    pub fn set_cursor_to(&self, addr: SocketAddr) -> bool {
        let mut inner = self.inner.write().expect("peer lock");
        for (i, candidate) in inner.addresses.iter().enumerate() {
            if let Some(resolved) = resolve_addr(candidate) {
                if same_addr(resolved, addr) {
                    inner.cursor = Cursor::Rotate(i);
                    inner.active_addr = Some(resolved);
                    return true;
                }
            }
        }
        false
    }

    /// Keepalive expiry: clear the active address and reset the cursor so a
    /// reconnect probes from the start of the candidate list.
    pub fn disconnect(&self) {
        let mut inner = self.inner.write().expect("peer lock");
        inner.state = PeerState::Expired;
        inner.active_addr = None;
        inner.cursor = Cursor::Rotate(0);
    }

    pub fn summary(&self) -> PeerSummary {
        let (window_size, window_inflight) = self.window.snapshot();
        let inner = self.inner.read().expect("peer lock");
        PeerSummary {
            name: self.name.clone(),
            state: inner.state,
            active_addr: inner.active_addr,
            root: inner.root.map(hex::encode),
            window_size,
            window_inflight,
            idle: inner.last_seen.elapsed(),
        }
    }

    fn matches_addr(&self, addr: SocketAddr, resolved: bool) -> bool {
        let inner = self.inner.read().expect("peer lock");
        if !resolved {
            return inner
                .active_addr
                .map(|a| same_addr(a, addr))
                .unwrap_or(false);
        }
        inner
            .addresses
            .iter()
            .filter_map(|s| resolve_addr(s))
            .any(|a| same_addr(a, addr))
    }
}

/// Resolve a `host:port` candidate string to a UDP endpoint.
pub fn resolve_addr(s: &str) -> Option<SocketAddr> {
    if let Ok(addr) = s.parse() {
        return Some(addr);
    }
    s.to_socket_addrs().ok()?.next()
}

/// Address equality after collapsing IPv4-mapped IPv6.
pub fn same_addr(a: SocketAddr, b: SocketAddr) -> bool {
    a.ip().to_canonical() == b.ip().to_canonical() && a.port() == b.port()
}

/// Name -> peer map plus the ban set, each behind its own lock.
#[derive(Default)]
pub struct PeerTable {
    peers: RwLock<HashMap<String, Arc<Peer>>>,
    banned: RwLock<HashSet<String>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch or create a record. The bool is true when the peer was created.
    pub fn upsert(&self, name: &str) -> (Arc<Peer>, bool) {
        let mut peers = self.peers.write().expect("peer table lock");
        match peers.get(name) {
            Some(peer) => (peer.clone(), false),
            None => {
                let peer = Arc::new(Peer::new(name));
                peers.insert(name.to_owned(), peer.clone());
                (peer, true)
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Peer>> {
        self.peers
            .read()
            .expect("peer table lock")
            .get(name)
            .cloned()
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Peer>> {
        self.peers.write().expect("peer table lock").remove(name)
    }

    pub fn all(&self) -> Vec<Arc<Peer>> {
        self.peers
            .read()
            .expect("peer table lock")
            .values()
            .cloned()
            .collect()
    }

    /// Identify the sender of a packet: validated active addresses first,
    /// then unvalidated candidates (NAT traversal, first contact).
    pub fn find_by_addr(&self, addr: SocketAddr) -> Option<Arc<Peer>> {
        let peers = self.peers.read().expect("peer table lock");
        if let Some(p) = peers.values().find(|p| p.matches_addr(addr, false)) {
            return Some(p.clone());
        }
        peers
            .values()
            .find(|p| p.matches_addr(addr, true))
            .cloned()
    }

    /// Update last-seen for whichever peer owns this address.
    pub fn touch_addr(&self, addr: SocketAddr) {
        if let Some(peer) = self.find_by_addr(addr) {
            peer.touch();
        }
    }

    /// Drop every peer the directory no longer lists. Returns their names.
    pub fn retain_named(&self, keep: &HashSet<String>) -> Vec<String> {
        let mut peers = self.peers.write().expect("peer table lock");
        let gone: Vec<String> = peers
            .keys()
            .filter(|name| !keep.contains(*name))
            .cloned()
            .collect();
        for name in &gone {
            peers.remove(name);
        }
        gone
    }

    /// Snapshot of every peer, for display surfaces.
    pub fn summaries(&self) -> Vec<PeerSummary> {
        self.all().iter().map(|p| p.summary()).collect()
    }

    pub fn ban(&self, name: &str) {
        self.banned
            .write()
            .expect("ban lock")
            .insert(name.to_owned());
    }

    pub fn unban(&self, name: &str) {
        self.banned.write().expect("ban lock").remove(name);
    }

    pub fn is_banned(&self, name: &str) -> bool {
        self.banned.read().expect("ban lock").contains(name)
    }

    pub fn is_banned_addr(&self, addr: SocketAddr) -> bool {
        match self.find_by_addr(addr) {
            Some(peer) => self.is_banned(&peer.name),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_then_exhaustion() {
        let peer = Peer::new("alpha");
        peer.set_addresses(vec!["127.0.0.1:4000".into(), "127.0.0.1:4001".into()]);
        let a = peer.next_address().unwrap();
        assert_eq!(a.port(), 4000);
        assert_eq!(peer.active_addr(), Some(a));
        let b = peer.next_address().unwrap();
        assert_eq!(b.port(), 4001);
        // Exhausted: cursor wraps and the caller is told to escalate.
        assert!(peer.next_address().is_none());
        // Wrapped cursor starts over.
        assert_eq!(peer.next_address().unwrap().port(), 4000);
    }

    #[test]
    fn pinned_address_refuses_rotation_once() {
        let peer = Peer::new("beta");
        peer.set_addresses(vec!["127.0.0.1:4000".into()]);
        let pinned: SocketAddr = "10.0.0.9:5555".parse().unwrap();
        peer.pin_address(pinned);
        assert_eq!(peer.active_addr(), Some(pinned));
        assert!(peer.next_address().is_none());
        // Pin cleared: rotation resumes from the head of the list.
        assert_eq!(peer.next_address().unwrap().port(), 4000);
    }

    #[test]
    fn unresolvable_candidates_skipped() {
        let peer = Peer::new("gamma");
        peer.set_addresses(vec!["not an address".into(), "127.0.0.1:4002".into()]);
        assert_eq!(peer.next_address().unwrap().port(), 4002);
    }

    #[test]
    fn set_cursor_to_known_candidate() {
        let peer = Peer::new("delta");
        peer.set_addresses(vec!["127.0.0.1:4000".into(), "127.0.0.1:4001".into()]);
        let target: SocketAddr = "127.0.0.1:4001".parse().unwrap();
        assert!(peer.set_cursor_to(target));
        assert_eq!(peer.active_addr(), Some(target));
        assert!(!peer.set_cursor_to("127.0.0.1:9999".parse().unwrap()));
    }

    #[test]
    fn mapped_ipv6_matches_ipv4() {
        let v4: SocketAddr = "192.0.2.1:7000".parse().unwrap();
        let mapped: SocketAddr = "[::ffff:192.0.2.1]:7000".parse().unwrap();
        assert!(same_addr(v4, mapped));
        assert!(!same_addr(v4, "192.0.2.1:7001".parse().unwrap()));
    }

    #[test]
    fn find_by_addr_prefers_active() {
        let table = PeerTable::new();
        let (peer, added) = table.upsert("epsilon");
        assert!(added);
        let addr: SocketAddr = "127.0.0.1:6100".parse().unwrap();
        peer.pin_address(addr);
        let found = table.find_by_addr(addr).unwrap();
        assert_eq!(found.name, "epsilon");
        // Candidate-only peers are still found, just second.
        let (other, _) = table.upsert("zeta");
        other.set_addresses(vec!["127.0.0.1:6200".into()]);
        assert_eq!(
            table
                .find_by_addr("127.0.0.1:6200".parse().unwrap())
                .unwrap()
                .name,
            "zeta"
        );
    }

    #[test]
    fn push_root_dedupes_and_evicts() {
        let peer = Peer::new("eta");
        assert_eq!(
            peer.push_root([1u8; 32]),
            RootPush::Changed { evicted: None }
        );
        assert_eq!(peer.push_root([1u8; 32]), RootPush::Unchanged);
        peer.push_root([2u8; 32]);
        peer.push_root([3u8; 32]);
        assert_eq!(
            peer.push_root([4u8; 32]),
            RootPush::Changed {
                evicted: Some([1u8; 32])
            }
        );
        assert!(peer.root_changed());
        assert_eq!(peer.root(), Some([4u8; 32]));
    }

    #[test]
    fn retain_drops_unlisted() {
        let table = PeerTable::new();
        table.upsert("keep");
        table.upsert("drop");
        let keep: HashSet<String> = ["keep".to_owned()].into();
        let gone = table.retain_named(&keep);
        assert_eq!(gone, vec!["drop".to_owned()]);
        assert!(table.get("drop").is_none());
        assert!(table.get("keep").is_some());
    }

    #[test]
    fn ban_set() {
        let table = PeerTable::new();
        let (peer, _) = table.upsert("theta");
        let addr: SocketAddr = "127.0.0.1:6300".parse().unwrap();
        peer.pin_address(addr);
        table.ban("theta");
        assert!(table.is_banned("theta"));
        assert!(table.is_banned_addr(addr));
        table.unban("theta");
        assert!(!table.is_banned_addr(addr));
    }

    #[test]
    fn summary_reflects_record() {
        let table = PeerTable::new();
        let (peer, _) = table.upsert("kappa");
        peer.push_root([0xabu8; 32]);
        peer.set_state(PeerState::Associated);
        let summaries = table.summaries();
        assert_eq!(summaries.len(), 1);
        let s = &summaries[0];
        assert_eq!(s.name, "kappa");
        assert_eq!(s.state, PeerState::Associated);
        assert_eq!(s.root.as_deref(), Some(hex::encode([0xabu8; 32]).as_str()));
        assert!(s.window_inflight <= s.window_size);
    }

    #[test]
    fn disconnect_resets_probing_state() {
        let peer = Peer::new("iota");
        peer.set_addresses(vec!["127.0.0.1:4000".into()]);
        peer.next_address();
        peer.set_state(PeerState::Associated);
        peer.disconnect();
        assert_eq!(peer.state(), PeerState::Expired);
        assert_eq!(peer.active_addr(), None);
        assert_eq!(peer.next_address().unwrap().port(), 4000);
    }
}
