//! Inbound request pipeline: Ping, Hello, RootRequest, DatumRequest and the
//! two NAT traversal messages.

use std::net::SocketAddr;

use tracing::{debug, warn};

use crate::crypto::{self, EphemeralKey};
use crate::engine::Engine;
use crate::events::PeerEvent;
use crate::handshake;
use crate::peer::PeerState;
use crate::transaction::RETRIES_DEFAULT;
use crate::tree::{self, HASH_LEN};
use crate::wire::{self, MessageType, ParsedMessage};

impl Engine {
    pub(crate) async fn handle_request(&self, pkt: &[u8], addr: SocketAddr) {
        let parsed = match wire::parse_message(pkt) {
            Ok(parsed) => parsed,
            Err(err) => {
                debug!(%addr, %err, "request dropped");
                return;
            }
        };
        debug!(%addr, id = parsed.id, type_code = parsed.type_code, "request received");
        match MessageType::from_code(parsed.type_code) {
            Some(MessageType::Ping) => self.on_ping(parsed.id, addr).await,
            Some(MessageType::Hello) => self.on_hello(&parsed, addr).await,
            Some(MessageType::RootRequest) => self.on_root_request(parsed.id, addr).await,
            Some(MessageType::DatumRequest) => self.on_datum_request(&parsed, addr).await,
            Some(MessageType::NatTraversalRequest) => self.on_nat_request(&parsed, addr).await,
            Some(MessageType::NatTraversalRequest2) => self.on_nat_request2(&parsed, addr).await,
            _ => {
                debug!(type_code = parsed.type_code, "unknown request type");
                self.send_error(addr, parsed.id, "unknown request").await;
            }
        }
    }

    /// Liveness probe. A Ping landing on a peer we are NAT-traversing is the
    /// signal that both mappings are open: pin the address and Hello it.
    async fn on_ping(&self, id: u32, addr: SocketAddr) {
        let Some(peer) = self.peers.find_by_addr(addr) else {
            self.send_error(addr, id, "hello first").await;
            return;
        };
        if self.peers.is_banned(&peer.name) {
            self.send_error(addr, id, "you are banned").await;
            return;
        }
        match peer.state() {
            PeerState::WaitHelloNat => {
                peer.set_state(PeerState::Discovered);
                peer.pin_address(addr);
                self.send_hello(&peer, addr).await;
            }
            PeerState::Discovered | PeerState::Expired => {
                self.send_error(addr, id, "hello first").await;
                return;
            }
            PeerState::Associated => {}
        }
        self.send_ok(addr, id).await;
    }

    /// Inbound handshake: verify the claimed name's signature, answer with a
    /// symmetric HelloReply, install the session key on the encrypted path.
    async fn on_hello(&self, parsed: &ParsedMessage<'_>, addr: SocketAddr) {
        let Some(name) = handshake::peer_name(parsed.body, &self.cfg.directory_name) else {
            debug!(%addr, "Hello body too short");
            return;
        };
        let Some(peer) = self.peers.get(&name) else {
            debug!(peer = %name, "Hello from unlisted peer dropped");
            return;
        };
        if self.peers.is_banned(&name) {
            self.send_error(addr, parsed.id, "you are banned").await;
            return;
        }
        if !self
            .verify_signed_peer(&peer, parsed.signed, parsed.signature)
            .await
        {
            debug!(peer = %name, "Hello signature invalid");
            return;
        }

        let encrypted =
            handshake::encryption_enabled(parsed.body) && name != self.cfg.directory_name;
        let ext = handshake::build_extensions(self.cfg.encrypt);
        let reply = if encrypted {
            let Some(peer_ephemeral) = handshake::ephemeral_public(parsed.body) else {
                debug!(peer = %name, "encrypted Hello without ephemeral key");
                return;
            };
            let ephemeral = EphemeralKey::generate();
            match ephemeral.agree(&peer_ephemeral) {
                Ok(session) => peer.set_session_key(session),
                Err(err) => {
                    warn!(peer = %name, %err, "key agreement failed");
                    return;
                }
            }
            handshake::hello_body(ext, &self.cfg.name, Some(&ephemeral.public_bytes()))
        } else {
            handshake::hello_body(ext, &self.cfg.name, None)
        };

        let state = peer.state();
        // A second Hello from an associated peer refreshes the session key
        // but never regresses the state.
        if state != PeerState::Expired {
            peer.set_active_addr(addr);
        }
        peer.touch();

        self.send_message(addr, parsed.id, MessageType::HelloReply, &reply, true)
            .await;

        // Not yet associated: learn who they are with a Hello of our own.
        if state == PeerState::Discovered || state == PeerState::WaitHelloNat {
            peer.set_cursor_to(addr);
            self.send_hello(&peer, addr).await;
        }
    }

    async fn on_root_request(&self, id: u32, addr: SocketAddr) {
        if self.peers.is_banned_addr(addr) {
            self.send_error(addr, id, "you are banned").await;
            return;
        }
        // An empty body when we have not published a root yet; the other
        // side drops replies shorter than a hash.
        let root = self.local_root();
        let body: &[u8] = root.as_ref().map(|r| r.as_slice()).unwrap_or(&[]);
        self.send_message(addr, id, MessageType::RootReply, body, true)
            .await;
    }

    /// Serve a node from the store, sealed when the peer holds a session
    /// key; answer NoDatum when we do not have it.
    async fn on_datum_request(&self, parsed: &ParsedMessage<'_>, addr: SocketAddr) {
        if self.peers.is_banned_addr(addr) {
            self.send_error(addr, parsed.id, "you are banned").await;
            return;
        }
        if parsed.body.len() < HASH_LEN {
            debug!(%addr, "DatumRequest body too short");
            return;
        }
        let mut hash = [0u8; HASH_LEN];
        hash.copy_from_slice(&parsed.body[..HASH_LEN]);

        let Some(node) = self.store.find(&hash) else {
            debug!(hash = %hex::encode(hash), "datum not held");
            self.send_message(addr, parsed.id, MessageType::NoDatum, &hash, true)
                .await;
            return;
        };
        let mut body = Vec::with_capacity(HASH_LEN + node.len());
        body.extend_from_slice(&tree::sha(&node));
        body.extend_from_slice(&node);

        let Some(peer) = self.peers.find_by_addr(addr) else {
            debug!(%addr, "DatumRequest from unknown address dropped");
            return;
        };
        if let Some(key) = peer.session_key() {
            match crypto::seal(&key, &body) {
                Ok(sealed) => {
                    self.send_message(addr, parsed.id, MessageType::Datum, &sealed, false)
                        .await;
                }
                Err(err) => warn!(peer = %peer.name, %err, "datum sealing failed"),
            }
            return;
        }
        self.send_message(addr, parsed.id, MessageType::Datum, &body, false)
            .await;
    }

    /// Relay leg of NAT traversal: forward the requester's observed address
    /// to the peer it wants to reach.
    async fn on_nat_request(&self, parsed: &ParsedMessage<'_>, addr: SocketAddr) {
        if !self
            .verify_signed_from(addr, parsed.signed, parsed.signature)
            .await
        {
            debug!(%addr, "NatTraversalRequest signature invalid");
            return;
        }
        self.send_ok(addr, parsed.id).await;
        let target = match wire::decode_nat_body(parsed.body) {
            Ok(target) => target,
            Err(err) => {
                debug!(%err, "bad NAT body");
                return;
            }
        };
        let body = wire::encode_nat_body(addr);
        self.send_request(
            None,
            target,
            MessageType::NatTraversalRequest2,
            &body,
            true,
            RETRIES_DEFAULT,
            None,
        )
        .await;
    }

    /// Far leg of NAT traversal: someone wants to reach us. Open a mapping
    /// toward them with a Ping and wait for their Hello.
    async fn on_nat_request2(&self, parsed: &ParsedMessage<'_>, addr: SocketAddr) {
        let initiator = match wire::decode_nat_body(parsed.body) {
            Ok(initiator) => initiator,
            Err(err) => {
                debug!(%err, "bad NAT body");
                return;
            }
        };
        // The initiator may be newer than our table; refresh before lookup.
        match self.directory.peer_list().await {
            Ok(names) => self.refresh_peers(&names).await,
            Err(err) => warn!(%err, "peer list fetch failed during NAT traversal"),
        }
        let Some(peer) = self.peers.find_by_addr(initiator) else {
            debug!(%initiator, "NatTraversalRequest2 for unknown initiator");
            return;
        };
        self.events
            .on_peer_event(&peer.name, PeerEvent::NatTraversal2Received, "");
        peer.set_active_addr(initiator);
        peer.set_state(PeerState::WaitHelloNat);
        if peer.public_key().is_none() {
            match self.directory.peer_key(&peer.name).await {
                Ok(key) => peer.set_public_key(key),
                Err(err) => {
                    warn!(peer = %peer.name, %err, "public key fetch failed");
                    return;
                }
            }
        }
        if !self
            .verify_signed_from(addr, parsed.signed, parsed.signature)
            .await
        {
            debug!(%addr, "NatTraversalRequest2 signature invalid");
            return;
        }
        self.send_ok(addr, parsed.id).await;

        let id = self.transactions.next_id();
        self.send_message(initiator, id, MessageType::Ping, &[], false)
            .await;
    }
}
