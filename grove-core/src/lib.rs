//! Grove protocol engine.
//!
//! A grove node discovers peers through a central directory, establishes
//! authenticated (and optionally encrypted) UDP sessions with them, NAT
//! traversal included, and exchanges content-addressed file trees. Every
//! block is verified against its hash before it is stored or followed.
//!
//! The engine is pure protocol: the host supplies configuration, the
//! long-term key and an event sink, publishes a local root built from a data
//! directory, and decides when to fetch a remote tree.

pub mod crypto;
pub mod directory;
pub mod engine;
pub mod events;
pub mod fetch;
pub mod handshake;
pub mod peer;
pub mod request;
pub mod response;
pub mod store;
pub mod transaction;
pub mod tree;
pub mod window;
pub mod wire;

pub use crypto::Identity;
pub use directory::DirectoryClient;
pub use engine::{Engine, EngineConfig, EngineError};
pub use events::{Broadcast, EventSink, LogSink, PeerEvent};
pub use peer::{Peer, PeerState, PeerSummary, PeerTable};
pub use store::MerkleStore;
pub use tree::{build_path, restore, Hash};
pub use wire::MessageType;
