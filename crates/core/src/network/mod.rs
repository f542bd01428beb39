/// Peer network layer
///
/// Framing of messages over QUIC streams, the table of live peers with its
/// handshake and broadcast logic, and the dispatcher that applies inbound
/// gossip to the ledger.

pub mod connection_manager;
pub mod message_dispatcher;
pub mod message_handler;

pub use connection_manager::{ConnectionManager, PeerConnection, PeerSummary};
pub use message_dispatcher::{Dispatch, MessageDispatcher, PeerAction};
pub use message_handler::{ConnectionHandler, MessageCodec};
