/// Peer wire protocol
///
/// Messages are JSON objects tagged by `type`, framed with a 4-byte
/// little-endian length prefix by the network layer.

pub mod messages;

pub use messages::{ErrorCode, ErrorMessage, HelloMessage, Message, MessageId, MessagePayload};
