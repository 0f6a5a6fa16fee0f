//! Shoal protocol engine: per-peer session state machine and chunked
//! file-transfer protocol for the sync overlay.
//!
//! Transport-complete but filesystem-agnostic: the embedding process
//! supplies a [`store::FileStore`] (persistence, content hashing,
//! conflict detection) and a watcher that feeds
//! [`store::FileSystemEvent`]s into the [`node::LocalNode`], which fans
//! them out to every handshake-completed peer session.

pub mod hostport;
pub mod node;
pub mod protocol;
pub mod session;
pub mod store;
pub mod wire;

pub use hostport::HostPort;
pub use node::LocalNode;
pub use protocol::{FileDescriptor, Message};
pub use session::{PeerSession, SessionError};
pub use store::{FileStore, FileSystemEvent, StoreError};
pub use wire::{decode_line, encode_line, LineDecodeError, LineEncodeError};
