/// QUIC transport
///
/// Each node runs one endpoint that accepts inbound peers and dials outbound
/// ones. Certificates are self-signed and accepted without pinning; the
/// ledger does not authenticate peers.

mod connection;
mod endpoint;
mod stream;

pub use connection::{Connection, ConnectionError, ConnectionStats};
pub use endpoint::{Endpoint, EndpointConfig, EndpointError};
pub use stream::{RecvStream, SendStream, StreamError};
