//! Reliable request/response over UDP: the pending-transaction table and the
//! reaper that retries, escalates or abandons.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::crypto::EphemeralKey;
use crate::wire::MessageType;

pub const INITIAL_TIMEOUT: Duration = Duration::from_secs(1);
pub const MAX_TIMEOUT: Duration = Duration::from_secs(64);
pub const REAP_INTERVAL: Duration = Duration::from_millis(200);

/// Default retry budget; Hello and NAT probes get one less (the escalation
/// path tries further addresses), datum fetches two more.
pub const RETRIES_DEFAULT: u32 = 4;
pub const RETRIES_HELLO: u32 = RETRIES_DEFAULT - 1;
pub const RETRIES_DATUM: u32 = RETRIES_DEFAULT + 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Pending,
    Resend,
    ChangeAddrHello,
    ChangeAddrNat,
    Done,
}

/// One outstanding request. `peer` is a name, not a reference: the peer
/// table stays the sole owner of peer records.
pub struct Transaction {
    pub id: u32,
    pub peer: Option<String>,
    pub addr: SocketAddr,
    pub msg_type: MessageType,
    pub msg: Vec<u8>,
    pub sent_at: Instant,
    pub timeout: Duration,
    pub retries: u32,
    pub state: TxState,
    /// Ephemeral ECDH secret of an encrypted Hello, consumed by the reply.
    pub ephemeral: Option<EphemeralKey>,
}

/// What the reaper wants done once the table lock is released.
#[derive(Debug)]
pub enum ReapAction {
    Resend { addr: SocketAddr, msg: Vec<u8> },
    /// Hello retries exhausted: rotate the address or fall back to NAT.
    HelloExhausted { peer: String },
    /// NAT traversal retries exhausted: rotate or give up.
    NatExhausted { peer: String },
    /// Datum retries exhausted: release the peer's window slot.
    DatumExhausted { peer: Option<String> },
}

#[derive(Default)]
pub struct TransactionTable {
    inner: Mutex<HashMap<u32, Transaction>>,
    next_id: AtomicU32,
}

impl TransactionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Monotone 32-bit id. Wrap is fine: an id only has to stay unique over
    /// the bounded lifetime of an outstanding transaction.
    pub fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn register(
        &self,
        id: u32,
        peer: Option<&str>,
        addr: SocketAddr,
        msg_type: MessageType,
        msg: Vec<u8>,
        retries: u32,
        ephemeral: Option<EphemeralKey>,
    ) {
        let tx = Transaction {
            id,
            peer: peer.map(str::to_owned),
            addr,
            msg_type,
            msg,
            sent_at: Instant::now(),
            timeout: INITIAL_TIMEOUT,
            retries,
            state: TxState::Pending,
            ephemeral,
        };
        self.inner.lock().expect("tx lock").insert(id, tx);
    }

    /// Resolve a transaction on receipt of its response. The entry is
    /// removed and handed to the caller, ephemeral secret included.
    pub fn resolve(&self, id: u32) -> Option<Transaction> {
        let mut tx = self.inner.lock().expect("tx lock").remove(&id)?;
        tx.state = TxState::Done;
        Some(tx)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("tx lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One reaper pass: classify every transaction under the lock, hand back
    /// the side effects to run outside it.
    pub fn reap(&self, now: Instant) -> Vec<ReapAction> {
        let mut actions = Vec::new();
        let mut table = self.inner.lock().expect("tx lock");
        let mut dead = Vec::new();
        for (id, tx) in table.iter_mut() {
            if tx.state == TxState::Done {
                dead.push(*id);
                continue;
            }
            if now.duration_since(tx.sent_at) <= tx.timeout {
                continue;
            }
            if tx.retries > 0 {
                tx.timeout *= 2;
                if tx.timeout > MAX_TIMEOUT {
                    dead.push(*id);
                    continue;
                }
                tx.retries -= 1;
                tx.sent_at = now;
                tx.state = TxState::Resend;
                actions.push(ReapAction::Resend {
                    addr: tx.addr,
                    msg: tx.msg.clone(),
                });
                tx.state = TxState::Pending;
                continue;
            }
            match tx.msg_type {
                MessageType::DatumRequest => {
                    actions.push(ReapAction::DatumExhausted {
                        peer: tx.peer.clone(),
                    });
                }
                MessageType::Hello => {
                    tx.state = TxState::ChangeAddrHello;
                    if let Some(peer) = tx.peer.clone() {
                        actions.push(ReapAction::HelloExhausted { peer });
                    }
                }
                MessageType::NatTraversalRequest => {
                    tx.state = TxState::ChangeAddrNat;
                    if let Some(peer) = tx.peer.clone() {
                        actions.push(ReapAction::NatExhausted { peer });
                    }
                }
                _ => {}
            }
            dead.push(*id);
        }
        for id in dead {
            table.remove(&id);
        }
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:9999".parse().unwrap()
    }

    fn register(table: &TransactionTable, mtype: MessageType, retries: u32) -> u32 {
        let id = table.next_id();
        table.register(id, Some("alpha"), addr(), mtype, vec![1, 2, 3], retries, None);
        id
    }

    #[test]
    fn ids_are_monotone() {
        let table = TransactionTable::new();
        let a = table.next_id();
        let b = table.next_id();
        assert_eq!(b, a + 1);
    }

    #[test]
    fn resolve_removes_entry() {
        let table = TransactionTable::new();
        let id = register(&table, MessageType::RootRequest, RETRIES_DEFAULT);
        let tx = table.resolve(id).unwrap();
        assert_eq!(tx.msg_type, MessageType::RootRequest);
        assert!(table.is_empty());
        assert!(table.resolve(id).is_none());
    }

    #[test]
    fn fresh_transaction_left_alone() {
        let table = TransactionTable::new();
        register(&table, MessageType::Ping, RETRIES_DEFAULT);
        assert!(table.reap(Instant::now()).is_empty());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn expired_transaction_resends_with_doubled_timeout() {
        let table = TransactionTable::new();
        register(&table, MessageType::RootRequest, RETRIES_DEFAULT);
        let later = Instant::now() + Duration::from_secs(2);
        let actions = table.reap(later);
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], ReapAction::Resend { .. }));
        // Still pending, with less budget.
        assert_eq!(table.len(), 1);
        // Not yet due again under the doubled (2s) timeout.
        assert!(table.reap(later + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn timeout_never_exceeds_cap() {
        let table = TransactionTable::new();
        // Plenty of retries so only the cap can end it: 1,2,4,...,64 then out.
        register(&table, MessageType::RootRequest, 20);
        let mut now = Instant::now();
        let mut resends = 0;
        for _ in 0..20 {
            now += Duration::from_secs(128);
            for action in table.reap(now) {
                if matches!(action, ReapAction::Resend { .. }) {
                    resends += 1;
                }
            }
            if table.is_empty() {
                break;
            }
        }
        assert!(table.is_empty());
        assert_eq!(resends, 6); // 2s,4s,8s,16s,32s,64s
    }

    #[test]
    fn datum_exhaustion_releases_window() {
        let table = TransactionTable::new();
        register(&table, MessageType::DatumRequest, 0);
        let actions = table.reap(Instant::now() + Duration::from_secs(2));
        assert!(matches!(
            &actions[0],
            ReapAction::DatumExhausted { peer: Some(name) } if name == "alpha"
        ));
        assert!(table.is_empty());
    }

    #[test]
    fn hello_and_nat_escalate() {
        let table = TransactionTable::new();
        register(&table, MessageType::Hello, 0);
        register(&table, MessageType::NatTraversalRequest, 0);
        let actions = table.reap(Instant::now() + Duration::from_secs(2));
        assert_eq!(actions.len(), 2);
        assert!(actions
            .iter()
            .any(|a| matches!(a, ReapAction::HelloExhausted { .. })));
        assert!(actions
            .iter()
            .any(|a| matches!(a, ReapAction::NatExhausted { .. })));
        assert!(table.is_empty());
    }

    #[test]
    fn other_types_silently_dropped_on_exhaustion() {
        let table = TransactionTable::new();
        register(&table, MessageType::Ping, 0);
        let actions = table.reap(Instant::now() + Duration::from_secs(2));
        assert!(actions.is_empty());
        assert!(table.is_empty());
    }
}
