/// Framing of protocol messages over QUIC streams
///
/// Each message travels on its own bidirectional stream: a 4-byte
/// little-endian length, then the JSON body. Requests get their reply on the
/// same stream; gossip is written and finished without waiting.

use crate::protocol::{ErrorCode, Message};
use crate::transport::{Connection, RecvStream, SendStream, StreamError};
use anyhow::{anyhow, Result};
use careledger_common::protocol::MAX_MESSAGE_SIZE;
use std::future::Future;
use std::net::SocketAddr;
use tracing::{debug, warn};

/// Message codec for sending and receiving messages over streams
pub struct MessageCodec;

impl MessageCodec {
    /// Write one length-prefixed message
    pub async fn send_message(send: &mut SendStream, message: &Message) -> Result<()> {
        let body = message.to_bytes()?;
        if body.len() > MAX_MESSAGE_SIZE {
            return Err(anyhow!(
                "Message too large: {} bytes (max {})",
                body.len(),
                MAX_MESSAGE_SIZE
            ));
        }

        let len = body.len() as u32;
        send.write_all(&len.to_le_bytes()).await?;
        send.write_all(&body).await?;

        debug!("Sent {} message ({} bytes)", message.message_type(), body.len());
        Ok(())
    }

    /// Read one message; `None` when the peer finished the stream without sending
    pub async fn recv_message(recv: &mut RecvStream) -> Result<Option<Message>> {
        let mut len_buf = [0u8; 4];
        match recv.read_exact(&mut len_buf).await {
            Ok(()) => {}
            Err(StreamError::FinishedEarly { read: 0, .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(anyhow!("Message too large: {} bytes (max {})", len, MAX_MESSAGE_SIZE));
        }

        let mut body = vec![0u8; len];
        recv.read_exact(&mut body).await?;

        let message = Message::from_slice(&body)?;
        debug!("Received {} message ({} bytes)", message.message_type(), len);
        Ok(Some(message))
    }

    /// Send a message and close the write half
    pub async fn send_message_and_finish(mut send: SendStream, message: &Message) -> Result<()> {
        Self::send_message(&mut send, message).await?;
        send.finish()?;
        Ok(())
    }

    /// Send a message on a fresh stream and wait for the reply on it
    pub async fn send_request(connection: &Connection, request: &Message) -> Result<Message> {
        let (mut send, mut recv) = connection.open_bi().await?;

        Self::send_message(&mut send, request).await?;
        send.finish()?;

        Self::recv_message(&mut recv)
            .await?
            .ok_or_else(|| anyhow!("No reply to {}", request.message_type()))
    }

    /// Send a message on a fresh stream without waiting for anything back
    pub async fn send_oneway(connection: &Connection, message: &Message) -> Result<()> {
        let (send, _recv) = connection.open_bi().await?;
        Self::send_message_and_finish(send, message).await
    }
}

/// One live connection to a peer, addressed by the peer's listen address
#[derive(Debug)]
pub struct ConnectionHandler {
    connection: Connection,
    peer_addr: SocketAddr,
}

impl ConnectionHandler {
    pub fn new(connection: Connection, peer_addr: SocketAddr) -> Self {
        Self {
            connection,
            peer_addr,
        }
    }

    pub async fn send_message(&self, message: &Message) -> Result<()> {
        MessageCodec::send_oneway(&self.connection, message).await
    }

    pub async fn send_request(&self, request: &Message) -> Result<Message> {
        MessageCodec::send_request(&self.connection, request).await
    }

    /// Handle inbound streams one at a time until the connection closes
    ///
    /// Messages are passed to `handler` in arrival order. A returned message
    /// is written back on the same stream; an error becomes an `Error` reply.
    pub async fn serve<F, Fut>(&self, handler: F)
    where
        F: Fn(Message) -> Fut,
        Fut: Future<Output = Result<Option<Message>>>,
    {
        loop {
            let (mut send, mut recv) = match self.connection.accept_bi().await {
                Ok(streams) => streams,
                Err(e) => {
                    debug!("Connection to {} ended: {}", self.peer_addr, e);
                    break;
                }
            };

            let message = match MessageCodec::recv_message(&mut recv).await {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    debug!("Empty stream from {}", self.peer_addr);
                    let _ = send.finish();
                    continue;
                }
                Err(e) => {
                    warn!("Dropped message from {}: {}", self.peer_addr, e);
                    let reply = Message::error(ErrorCode::InvalidMessage, e.to_string());
                    let _ = MessageCodec::send_message_and_finish(send, &reply).await;
                    continue;
                }
            };

            match handler(message).await {
                Ok(Some(reply)) => {
                    if let Err(e) = MessageCodec::send_message_and_finish(send, &reply).await {
                        warn!("Failed to reply to {}: {}", self.peer_addr, e);
                    }
                }
                Ok(None) => {
                    let _ = send.finish();
                }
                Err(e) => {
                    warn!("Error handling message from {}: {}", self.peer_addr, e);
                    let reply = Message::error(ErrorCode::InternalError, e.to_string());
                    let _ = MessageCodec::send_message_and_finish(send, &reply).await;
                }
            }
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }

    pub fn close(&self, reason: &str) {
        self.connection.close(reason);
    }
}
