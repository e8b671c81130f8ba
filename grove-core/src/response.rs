//! Inbound response pipeline: resolve the matching transaction and drive
//! peer and fetch state forward.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::crypto;
use crate::engine::Engine;
use crate::events::PeerEvent;
use crate::handshake;
use crate::peer::PeerState;
use crate::tree::HASH_LEN;
use crate::wire::{self, MessageType, ParsedMessage};

impl Engine {
    pub(crate) async fn handle_response(self: &Arc<Self>, pkt: &[u8], addr: SocketAddr) {
        let parsed = match wire::parse_message(pkt) {
            Ok(parsed) => parsed,
            Err(err) => {
                debug!(%addr, %err, "response dropped");
                return;
            }
        };
        debug!(%addr, id = parsed.id, type_code = parsed.type_code, "response received");
        match MessageType::from_code(parsed.type_code) {
            Some(MessageType::Ok) => self.on_ok(parsed.id),
            Some(MessageType::Error) => self.on_error(&parsed),
            Some(MessageType::HelloReply) => self.on_hello_reply(&parsed).await,
            Some(MessageType::RootReply) => self.on_root_reply(&parsed, addr).await,
            Some(MessageType::Datum) => self.on_datum(&parsed, addr).await,
            Some(MessageType::NoDatum) => self.on_no_datum(&parsed, addr).await,
            _ => debug!(type_code = parsed.type_code, "unknown response type"),
        }
    }

    fn on_ok(&self, id: u32) {
        if let Some(tx) = self.transactions.resolve(id) {
            debug!(id, ?tx.msg_type, "Ok received");
        }
    }

    fn on_error(&self, parsed: &ParsedMessage<'_>) {
        self.transactions.resolve(parsed.id);
        warn!(
            id = parsed.id,
            reason = %String::from_utf8_lossy(parsed.body),
            "Error response"
        );
    }

    /// Complete a handshake we initiated: check the signature, finish key
    /// agreement on the encrypted path, associate the peer.
    async fn on_hello_reply(self: &Arc<Self>, parsed: &ParsedMessage<'_>) {
        let Some(tx) = self.transactions.resolve(parsed.id) else {
            debug!(id = parsed.id, "HelloReply with no pending transaction");
            return;
        };
        if tx.msg_type != MessageType::Hello {
            return;
        }
        let Some(name) = tx.peer.as_deref() else {
            debug!("Hello transaction without a peer");
            return;
        };
        let Some(peer) = self.peers.get(name) else {
            return;
        };
        if !self
            .verify_signed_peer(&peer, parsed.signed, parsed.signature)
            .await
        {
            self.events.on_peer_event(
                name,
                PeerEvent::ConnectionFailed,
                "HelloReply signature rejected",
            );
            return;
        }

        // Whether we asked for encryption is written in the Hello we sent.
        let sent = match wire::parse_message(&tx.msg) {
            Ok(sent) => sent,
            Err(err) => {
                warn!(%err, "stored Hello frame unparsable");
                return;
            }
        };
        let encrypted =
            handshake::encryption_enabled(sent.body) && name != self.cfg.directory_name;
        if encrypted {
            let Some(ephemeral) = tx.ephemeral.as_ref() else {
                warn!(peer = %name, "encrypted Hello lost its ephemeral key");
                return;
            };
            if parsed.signed.len() < crypto::PUBLIC_KEY_LEN {
                debug!(peer = %name, "HelloReply too short for a key");
                return;
            }
            let tail = &parsed.signed[parsed.signed.len() - crypto::PUBLIC_KEY_LEN..];
            match ephemeral.agree(tail) {
                Ok(session) => {
                    peer.set_session_key(session);
                    debug!(peer = %name, "session key installed");
                }
                Err(err) => {
                    warn!(peer = %name, %err, "key agreement failed");
                    return;
                }
            }
        }

        // Both the direct path (Discovered) and the NAT path (WaitHelloNat,
        // when the reply answers the Hello we sent after their Ping) finish
        // here.
        if matches!(
            peer.state(),
            PeerState::Discovered | PeerState::WaitHelloNat
        ) {
            peer.set_state(PeerState::Associated);
            peer.reset_cursor();
            peer.touch();
            info!(peer = %name, "associated");
            self.spawn_maintenance(peer.clone());
        }
        self.events.on_peer_event(name, PeerEvent::Connected, "");
    }

    async fn on_root_reply(&self, parsed: &ParsedMessage<'_>, addr: SocketAddr) {
        let Some(tx) = self.transactions.resolve(parsed.id) else {
            return;
        };
        if tx.msg_type != MessageType::RootRequest {
            return;
        }
        if !self
            .verify_signed_from(addr, parsed.signed, parsed.signature)
            .await
        {
            debug!(%addr, "RootReply signature invalid");
            return;
        }
        if parsed.body.len() < HASH_LEN {
            debug!(%addr, "RootReply without a root");
            return;
        }
        let Some(peer) = self.peers.find_by_addr(addr) else {
            debug!(%addr, "RootReply from unknown address");
            return;
        };
        let mut root = [0u8; HASH_LEN];
        root.copy_from_slice(&parsed.body[..HASH_LEN]);
        self.add_peer_root(&peer, root);
    }

    /// A requested node arrived. The window is credited only once the body
    /// decrypts and hashes to what was asked for; a forged or corrupt datum
    /// releases the slot as a loss instead.
    async fn on_datum(&self, parsed: &ParsedMessage<'_>, addr: SocketAddr) {
        let Some(tx) = self.transactions.resolve(parsed.id) else {
            debug!(id = parsed.id, "Datum with no pending transaction");
            return;
        };
        if tx.msg_type != MessageType::DatumRequest {
            return;
        }
        let Some(peer) = self.peers.find_by_addr(addr) else {
            debug!(%addr, "Datum from unknown address");
            return;
        };
        let rtt = tx.sent_at.elapsed();

        let requested: [u8; HASH_LEN] = {
            let sent = match wire::parse_message(&tx.msg) {
                Ok(sent) => sent,
                Err(err) => {
                    warn!(%err, "stored DatumRequest unparsable");
                    return;
                }
            };
            if sent.body.len() < HASH_LEN {
                return;
            }
            let mut out = [0u8; HASH_LEN];
            out.copy_from_slice(&sent.body[..HASH_LEN]);
            out
        };

        let body = match peer.session_key() {
            Some(key) => match crypto::open(&key, parsed.body) {
                Ok(plain) => plain,
                Err(err) => {
                    warn!(peer = %peer.name, %err, "datum decryption failed");
                    peer.window.on_timeout();
                    return;
                }
            },
            None => parsed.body.to_vec(),
        };

        if !crypto::verify_datum(&body, &requested) {
            warn!(
                peer = %peer.name,
                hash = %hex::encode(requested),
                "datum integrity check failed"
            );
            peer.window.on_timeout();
            return;
        }
        peer.window.on_success(rtt);

        self.ingest_datum(&peer, addr, &body).await;

        if !peer.fetch_done() {
            if let Some(root) = peer.root() {
                if self.store.verify(&root) {
                    if let Some(elapsed) = peer.finish_fetch() {
                        info!(peer = %peer.name, ?elapsed, "tree download complete");
                        self.events.on_peer_event(
                            &peer.name,
                            PeerEvent::MerkleDownloadComplete,
                            &format!("{}ms", elapsed.as_millis()),
                        );
                    }
                }
            }
        }
    }

    async fn on_no_datum(&self, parsed: &ParsedMessage<'_>, addr: SocketAddr) {
        let Some(tx) = self.transactions.resolve(parsed.id) else {
            return;
        };
        if tx.msg_type != MessageType::DatumRequest {
            return;
        }
        let Some(peer) = self.peers.find_by_addr(addr) else {
            debug!(%addr, "NoDatum from unknown address");
            return;
        };
        peer.window.on_success(tx.sent_at.elapsed());
        if !self
            .verify_signed_from(addr, parsed.signed, parsed.signature)
            .await
        {
            debug!(%addr, "NoDatum signature invalid");
        }
        self.events
            .on_peer_event(&peer.name, PeerEvent::NoDatum, "");
    }
}
