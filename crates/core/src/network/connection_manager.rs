/// Connection manager for peer connections
///
/// Owns the table of live peers. Both dialled and accepted connections start
/// with a `Hello` exchange that tells each side the other's listen port, so
/// a peer is always keyed by the address it can be reached on.

use crate::network::message_handler::{ConnectionHandler, MessageCodec};
use crate::protocol::{ErrorCode, HelloMessage, Message, MessagePayload};
use crate::transport::{Connection, Endpoint};
use anyhow::{anyhow, Result};
use careledger_common::{protocol, AccountId, LedgerError, NetworkAddress, Role, Timestamp};
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// A handshaken peer
#[derive(Debug, Clone)]
pub struct PeerConnection {
    pub address: SocketAddr,
    pub hello: HelloMessage,
    pub handler: Arc<ConnectionHandler>,
    pub inbound: bool,
    pub connected_at: Timestamp,
}

/// Peer details for status displays
#[derive(Debug, Clone, Serialize)]
pub struct PeerSummary {
    pub address: String,
    pub node_name: String,
    pub account: Option<AccountId>,
    pub role: Option<Role>,
    pub inbound: bool,
    pub connected_secs: u64,
    pub rtt_ms: u64,
}

/// Connection manager
pub struct ConnectionManager {
    endpoint: Arc<Endpoint>,

    /// What we announce in every handshake
    local: HelloMessage,

    connections: Arc<RwLock<HashMap<SocketAddr, PeerConnection>>>,
}

impl ConnectionManager {
    pub fn new(endpoint: Arc<Endpoint>, local: HelloMessage) -> Self {
        Self {
            endpoint,
            local,
            connections: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn local_hello(&self) -> &HelloMessage {
        &self.local
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    /// Dial a peer and run the handshake
    ///
    /// A connection that loses a race with one the peer opened towards us is
    /// still returned so the caller can serve it, but the earlier entry stays
    /// in the table.
    pub async fn connect_to_peer(&self, addr: &NetworkAddress) -> Result<Arc<ConnectionHandler>> {
        debug!("Connecting to peer at {}", addr);
        let connection = self.endpoint.connect_to(addr).await?;
        let peer_addr = connection.remote_addr();

        let hello = match self.perform_handshake(&connection).await {
            Ok(hello) => hello,
            Err(e) => {
                connection.close("handshake failed");
                return Err(e);
            }
        };

        info!("Connected to peer {} ({})", hello.node_name, peer_addr);
        let handler = Arc::new(ConnectionHandler::new(connection, peer_addr));
        self.register(peer_addr, hello, handler.clone(), false).await;
        Ok(handler)
    }

    /// Complete the handshake on a connection accepted by the endpoint
    pub async fn accept_connection(&self, connection: Connection) -> Result<Arc<ConnectionHandler>> {
        let remote_addr = connection.remote_addr();
        debug!("Accepted connection from {}", remote_addr);

        let hello = match self.receive_handshake(&connection).await {
            Ok(hello) => hello,
            Err(e) => {
                connection.close("handshake failed");
                return Err(e);
            }
        };

        let peer_addr = SocketAddr::new(remote_addr.ip(), hello.listen_port);
        info!("Peer {} connected from {}", hello.node_name, peer_addr);

        let handler = Arc::new(ConnectionHandler::new(connection, peer_addr));
        self.register(peer_addr, hello, handler.clone(), true).await;
        Ok(handler)
    }

    async fn register(
        &self,
        address: SocketAddr,
        hello: HelloMessage,
        handler: Arc<ConnectionHandler>,
        inbound: bool,
    ) {
        let mut connections = self.connections.write().await;
        let replace = match connections.get(&address) {
            Some(existing) => existing.handler.is_closed(),
            None => true,
        };
        if replace {
            connections.insert(
                address,
                PeerConnection {
                    address,
                    hello,
                    handler,
                    inbound,
                    connected_at: Timestamp::now(),
                },
            );
        } else {
            debug!("Keeping existing connection to {}", address);
        }
    }

    fn check_hello(&self, hello: &HelloMessage) -> std::result::Result<(), (ErrorCode, String)> {
        if hello.protocol_version != protocol::VERSION {
            return Err((
                ErrorCode::ProtocolVersionMismatch,
                format!(
                    "protocol version {} (expected {})",
                    hello.protocol_version,
                    protocol::VERSION
                ),
            ));
        }
        if hello.session_id == self.local.session_id {
            return Err((ErrorCode::SelfConnection, "connected to ourselves".to_string()));
        }
        Ok(())
    }

    /// Handshake as the dialling side
    async fn perform_handshake(&self, connection: &Connection) -> Result<HelloMessage> {
        let request = Message::new(MessagePayload::Hello(self.local.clone()));
        let response = MessageCodec::send_request(connection, &request).await?;

        match response.payload {
            MessagePayload::HelloAck(hello) => {
                self.check_hello(&hello)
                    .map_err(|(_, reason)| anyhow!("Handshake rejected: {}", reason))?;
                Ok(hello)
            }
            MessagePayload::Error(err) => Err(anyhow!("Handshake error: {}", err.message)),
            other => Err(anyhow!("Unexpected handshake reply: {}", other.message_type())),
        }
    }

    /// Handshake as the accepting side
    async fn receive_handshake(&self, connection: &Connection) -> Result<HelloMessage> {
        let (send, mut recv) = connection.accept_bi().await?;

        let message = MessageCodec::recv_message(&mut recv)
            .await?
            .ok_or_else(|| anyhow!("No handshake received"))?;

        match message.payload {
            MessagePayload::Hello(hello) => {
                if let Err((code, reason)) = self.check_hello(&hello) {
                    MessageCodec::send_message_and_finish(send, &Message::error(code, reason.clone()))
                        .await?;
                    return Err(anyhow!("Handshake rejected: {}", reason));
                }

                let ack = Message::new(MessagePayload::HelloAck(self.local.clone()));
                MessageCodec::send_message_and_finish(send, &ack).await?;
                Ok(hello)
            }
            other => {
                let reply = Message::error(
                    ErrorCode::UnexpectedMessage,
                    format!("Expected hello, got {}", other.message_type()),
                );
                MessageCodec::send_message_and_finish(send, &reply).await?;
                Err(anyhow!("Expected hello message"))
            }
        }
    }

    /// Send `message` to every peer except `exclude`
    ///
    /// Each peer is sent to independently; a peer that cannot be reached is
    /// dropped from the table and does not affect the others. Returns the
    /// number of peers the message was delivered to.
    pub async fn broadcast(&self, message: &Message, exclude: Option<SocketAddr>) -> usize {
        let targets = self.handlers_except(exclude).await;
        if targets.is_empty() {
            return 0;
        }

        let mut sends = JoinSet::new();
        for handler in targets {
            let message = message.clone();
            sends.spawn(async move {
                let result = handler.send_message(&message).await;
                (handler, result)
            });
        }

        let mut delivered = 0;
        while let Some(joined) = sends.join_next().await {
            match joined {
                Ok((_, Ok(()))) => delivered += 1,
                Ok((handler, Err(e))) => self.drop_unreachable(&handler, e).await,
                Err(e) => warn!("Broadcast task failed: {}", e),
            }
        }

        debug!("Broadcast {} to {} peers", message.message_type(), delivered);
        delivered
    }

    /// Send a request to every peer; replies come back in arrival order
    pub async fn request_all(&self, request: &Message) -> Vec<(SocketAddr, Message)> {
        let mut requests = JoinSet::new();
        for handler in self.handlers_except(None).await {
            let request = request.clone();
            requests.spawn(async move {
                let result = handler.send_request(&request).await;
                (handler, result)
            });
        }

        let mut replies = Vec::new();
        while let Some(joined) = requests.join_next().await {
            match joined {
                Ok((handler, Ok(reply))) => replies.push((handler.peer_addr(), reply)),
                Ok((handler, Err(e))) => self.drop_unreachable(&handler, e).await,
                Err(e) => warn!("Request task failed: {}", e),
            }
        }
        replies
    }

    async fn handlers_except(&self, exclude: Option<SocketAddr>) -> Vec<Arc<ConnectionHandler>> {
        self.connections
            .read()
            .await
            .values()
            .filter(|peer| Some(peer.address) != exclude)
            .map(|peer| peer.handler.clone())
            .collect()
    }

    async fn drop_unreachable(&self, handler: &Arc<ConnectionHandler>, cause: anyhow::Error) {
        let err = LedgerError::peer_unreachable(format!("{}: {}", handler.peer_addr(), cause));
        warn!("{}; dropping peer", err);
        self.remove_connection(handler).await;
    }

    /// Forget a peer if `handler` is still the one registered for it
    pub async fn remove_connection(&self, handler: &Arc<ConnectionHandler>) -> bool {
        let mut connections = self.connections.write().await;
        let registered = connections
            .get(&handler.peer_addr())
            .map(|peer| Arc::ptr_eq(&peer.handler, handler))
            .unwrap_or(false);
        if registered {
            connections.remove(&handler.peer_addr());
            handler.close("dropped");
        }
        registered
    }

    pub async fn get_connection(&self, addr: &SocketAddr) -> Option<Arc<ConnectionHandler>> {
        self.connections
            .read()
            .await
            .get(addr)
            .filter(|peer| !peer.handler.is_closed())
            .map(|peer| peer.handler.clone())
    }

    pub async fn is_connected(&self, addr: &SocketAddr) -> bool {
        self.get_connection(addr).await.is_some()
    }

    /// Listen addresses of all live peers
    pub async fn peer_addresses(&self) -> Vec<SocketAddr> {
        self.connections.read().await.keys().copied().collect()
    }

    pub async fn list_peers(&self) -> Vec<PeerSummary> {
        let mut peers: Vec<PeerSummary> = self
            .connections
            .read()
            .await
            .values()
            .map(|peer| PeerSummary {
                address: peer.address.to_string(),
                node_name: peer.hello.node_name.clone(),
                account: peer.hello.account.clone(),
                role: peer.hello.role,
                inbound: peer.inbound,
                connected_secs: peer.connected_at.elapsed().as_secs(),
                rtt_ms: peer.handler.connection().stats().rtt_ms,
            })
            .collect();
        peers.sort_by(|a, b| a.address.cmp(&b.address));
        peers
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn disconnect_all(&self) {
        let mut connections = self.connections.write().await;
        for (_, peer) in connections.drain() {
            peer.handler.close("shutdown");
        }
    }
}
