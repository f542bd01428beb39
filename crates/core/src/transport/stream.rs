use quinn::{RecvStream as QuinnRecvStream, SendStream as QuinnSendStream};

/// Write half of a bidirectional stream
#[derive(Debug)]
pub struct SendStream {
    inner: QuinnSendStream,
}

impl SendStream {
    pub(crate) fn new(inner: QuinnSendStream) -> Self {
        Self { inner }
    }

    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), StreamError> {
        self.inner
            .write_all(data)
            .await
            .map_err(|e| StreamError::Write(e.to_string()))
    }

    /// Close the write half; buffered data is still delivered
    pub fn finish(&mut self) -> Result<(), StreamError> {
        self.inner
            .finish()
            .map_err(|e| StreamError::Finish(e.to_string()))
    }
}

/// Read half of a bidirectional stream
#[derive(Debug)]
pub struct RecvStream {
    inner: QuinnRecvStream,
}

impl RecvStream {
    pub(crate) fn new(inner: QuinnRecvStream) -> Self {
        Self { inner }
    }

    /// Fill `buf` completely, or fail if the stream ends first
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), StreamError> {
        let expected = buf.len();
        self.inner.read_exact(buf).await.map_err(|e| match e {
            quinn::ReadExactError::FinishedEarly(read) => StreamError::FinishedEarly { expected, read },
            quinn::ReadExactError::ReadError(e) => StreamError::Read(e.to_string()),
        })
    }
}

/// Stream errors
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("Write error: {0}")]
    Write(String),

    #[error("Read error: {0}")]
    Read(String),

    #[error("Finish error: {0}")]
    Finish(String),

    #[error("Stream ended after {read} of {expected} bytes")]
    FinishedEarly { expected: usize, read: usize },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Connection, Endpoint, EndpointConfig};

    async fn connected() -> (Connection, Connection, Endpoint, Endpoint) {
        let server = Endpoint::new(EndpointConfig::default()).await.unwrap();
        let server_addr = server.local_addr();
        let client = Endpoint::new(EndpointConfig::default()).await.unwrap();

        let (client_conn, server_conn) = tokio::join!(client.connect(server_addr), server.accept());
        (client_conn.unwrap(), server_conn.unwrap(), client, server)
    }

    #[tokio::test]
    async fn test_request_and_reply_on_one_stream() {
        let (client, server, _c, _s) = connected().await;

        // The opener writes first; the peer only sees the stream once data arrives
        let (mut send, mut recv) = client.open_bi().await.unwrap();
        send.write_all(b"chain please").await.unwrap();
        send.finish().unwrap();

        let (mut reply, mut request) = server.accept_bi().await.unwrap();
        let mut asked = [0u8; 12];
        request.read_exact(&mut asked).await.unwrap();
        assert_eq!(&asked, b"chain please");

        reply.write_all(b"here it is").await.unwrap();
        reply.finish().unwrap();

        let mut answer = [0u8; 10];
        recv.read_exact(&mut answer).await.unwrap();
        assert_eq!(&answer, b"here it is");
    }

    #[tokio::test]
    async fn test_read_exact_reports_short_stream() {
        let (client, server, _c, _s) = connected().await;

        let (mut send, _recv) = client.open_bi().await.unwrap();
        send.write_all(b"abc").await.unwrap();
        send.finish().unwrap();

        let (_reply, mut request) = server.accept_bi().await.unwrap();
        let mut buf = [0u8; 8];
        let err = request.read_exact(&mut buf).await.unwrap_err();
        assert!(matches!(err, StreamError::FinishedEarly { expected: 8, .. }));
    }
}
