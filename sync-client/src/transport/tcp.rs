//! TCP transport with length-prefixed framing.
//!
//! Every message is sent as a 4-byte big-endian length followed by the
//! payload. Messages larger than [`MAX_MESSAGE_SIZE`] are refused on both
//! ends.

use super::{Connector, Listener, Transport, TransportError, MAX_MESSAGE_SIZE};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

/// Default timeout for dialing a peer.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connector over plain TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    bind_host: String,
    connect_timeout: Duration,
}

impl TcpConnector {
    /// Listen on all interfaces.
    pub fn new() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Listen on a specific interface only.
    pub fn bind_to(host: impl Into<String>) -> Self {
        Self {
            bind_host: host.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Override the dial timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn listen(&self, port: u16) -> Result<Box<dyn Listener>, TransportError> {
        let listener = TcpListener::bind((self.bind_host.as_str(), port))
            .await
            .map_err(|e| {
                TransportError::ListenFailed(format!("bind {}:{port}: {e}", self.bind_host))
            })?;
        let port = listener
            .local_addr()
            .map_err(|e| TransportError::ListenFailed(e.to_string()))?
            .port();
        Ok(Box::new(TcpLinkListener { listener, port }))
    }

    async fn dial(&self, host: &str, port: u16) -> Result<Arc<dyn Transport>, TransportError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::ConnectionFailed(format!("{host}:{port}: {e}")))?;
        Ok(Arc::new(TcpTransport::new(stream)))
    }
}

struct TcpLinkListener {
    listener: TcpListener,
    port: u16,
}

#[async_trait]
impl Listener for TcpLinkListener {
    fn local_port(&self) -> u16 {
        self.port
    }

    async fn accept(&mut self) -> Result<Arc<dyn Transport>, TransportError> {
        let (stream, addr) = self
            .listener
            .accept()
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("accept: {e}")))?;
        tracing::debug!(%addr, "inbound tcp link");
        Ok(Arc::new(TcpTransport::new(stream)))
    }
}

/// One framed TCP link.
pub struct TcpTransport {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    connected: AtomicBool,
}

impl TcpTransport {
    fn new(stream: TcpStream) -> Self {
        // Small protocol messages; don't wait to coalesce them.
        stream.set_nodelay(true).ok();
        let (reader, writer) = stream.into_split();
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            connected: AtomicBool::new(true),
        }
    }

    fn lost(&self, err: TransportError) -> TransportError {
        self.connected.store(false, Ordering::SeqCst);
        err
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(TransportError::SendFailed(format!(
                "Message too large: {} > {}",
                data.len(),
                MAX_MESSAGE_SIZE
            )));
        }
        if !self.is_connected() {
            return Err(TransportError::ConnectionClosed);
        }

        let mut writer = self.writer.lock().await;
        let len = (data.len() as u32).to_be_bytes();
        writer.write_all(&len).await.map_err(|e| {
            self.lost(TransportError::SendFailed(format!("Failed to write length: {e}")))
        })?;
        writer.write_all(data).await.map_err(|e| {
            self.lost(TransportError::SendFailed(format!("Failed to write data: {e}")))
        })?;
        Ok(())
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        let mut reader = self.reader.lock().await;

        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                self.lost(TransportError::ConnectionClosed)
            } else {
                self.lost(TransportError::ReceiveFailed(format!(
                    "Failed to read length: {e}"
                )))
            }
        })?;

        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(self.lost(TransportError::ReceiveFailed(format!(
                "Message too large: {} > {}",
                len, MAX_MESSAGE_SIZE
            ))));
        }

        let mut data = vec![0u8; len];
        reader.read_exact(&mut data).await.map_err(|e| {
            self.lost(TransportError::ReceiveFailed(format!("Failed to read data: {e}")))
        })?;
        Ok(data)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.writer.lock().await.shutdown().await.ok();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pair() -> (Arc<dyn Transport>, Arc<dyn Transport>) {
        let connector = TcpConnector::bind_to("127.0.0.1");
        let mut listener = connector.listen(0).await.unwrap();
        let port = listener.local_port();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        let dialed = connector.dial("127.0.0.1", port).await.unwrap();
        (dialed, accept.await.unwrap())
    }

    #[test]
    fn tcp_transport_implements_transport_trait() {
        fn assert_transport<T: Transport>() {}
        assert_transport::<TcpTransport>();
    }

    #[tokio::test]
    async fn messages_cross_in_both_directions() {
        let (a, b) = pair().await;

        a.send(b"hello").await.unwrap();
        b.send(b"world").await.unwrap();

        assert_eq!(b.recv().await.unwrap(), b"hello");
        assert_eq!(a.recv().await.unwrap(), b"world");
    }

    #[tokio::test]
    async fn framing_keeps_message_boundaries() {
        let (a, b) = pair().await;
        a.send(b"").await.unwrap();
        a.send(&[7u8; 10_000]).await.unwrap();

        assert_eq!(b.recv().await.unwrap(), Vec::<u8>::new());
        assert_eq!(b.recv().await.unwrap().len(), 10_000);
    }

    #[tokio::test]
    async fn send_oversized_message_fails() {
        let (a, _b) = pair().await;
        let oversized = vec![0u8; MAX_MESSAGE_SIZE + 1];
        assert!(matches!(
            a.send(&oversized).await,
            Err(TransportError::SendFailed(_))
        ));
    }

    #[tokio::test]
    async fn close_is_seen_by_remote() {
        let (a, b) = pair().await;
        a.close().await.unwrap();

        assert!(!a.is_connected());
        assert!(matches!(
            b.recv().await,
            Err(TransportError::ConnectionClosed)
        ));
        assert!(!b.is_connected());
    }

    #[tokio::test]
    async fn dial_to_closed_port_fails() {
        let connector = TcpConnector::bind_to("127.0.0.1");
        let port = {
            let listener = connector.listen(0).await.unwrap();
            listener.local_port()
        };
        assert!(connector.dial("127.0.0.1", port).await.is_err());
    }

    #[test]
    fn length_prefix_encodes_correctly() {
        let len: u32 = 0x0102_0304;
        assert_eq!(len.to_be_bytes(), [1, 2, 3, 4]);
        assert_eq!(MAX_MESSAGE_SIZE, 1024 * 1024);
    }
}
