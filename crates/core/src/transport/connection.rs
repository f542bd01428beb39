use quinn::Connection as QuinnConnection;
use std::net::SocketAddr;

/// A QUIC connection to one peer; cheap to clone
#[derive(Debug, Clone)]
pub struct Connection {
    inner: QuinnConnection,
}

impl Connection {
    pub(crate) fn new(inner: QuinnConnection) -> Self {
        Self { inner }
    }

    /// Open a bidirectional stream for one message exchange
    pub async fn open_bi(&self) -> Result<(super::SendStream, super::RecvStream), ConnectionError> {
        let (send, recv) = self.inner.open_bi().await.map_err(Self::classify)?;
        Ok((super::SendStream::new(send), super::RecvStream::new(recv)))
    }

    /// Wait for the peer to open a bidirectional stream
    pub async fn accept_bi(&self) -> Result<(super::SendStream, super::RecvStream), ConnectionError> {
        let (send, recv) = self.inner.accept_bi().await.map_err(Self::classify)?;
        Ok((super::SendStream::new(send), super::RecvStream::new(recv)))
    }

    fn classify(err: quinn::ConnectionError) -> ConnectionError {
        match err {
            quinn::ConnectionError::ApplicationClosed(_)
            | quinn::ConnectionError::LocallyClosed
            | quinn::ConnectionError::ConnectionClosed(_) => ConnectionError::Closed(err.to_string()),
            quinn::ConnectionError::TimedOut => ConnectionError::TimedOut,
            other => ConnectionError::Stream(other.to_string()),
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_address()
    }

    pub fn stats(&self) -> ConnectionStats {
        let quinn_stats = self.inner.stats();

        ConnectionStats {
            bytes_sent: quinn_stats.udp_tx.bytes,
            bytes_received: quinn_stats.udp_rx.bytes,
            rtt_ms: quinn_stats.path.rtt.as_millis() as u64,
        }
    }

    pub fn close(&self, reason: &str) {
        self.inner.close(0u32.into(), reason.as_bytes());
    }

    pub fn is_closed(&self) -> bool {
        self.inner.close_reason().is_some()
    }
}

/// Traffic counters for one connection
#[derive(Debug, Clone, Copy)]
pub struct ConnectionStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub rtt_ms: u64,
}

/// Connection errors
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Connection closed: {0}")]
    Closed(String),

    #[error("Connection timed out")]
    TimedOut,

    #[error("Stream error: {0}")]
    Stream(String),
}
