//! In-process network for tests.
//!
//! A [`MemoryNetwork`] hands out [`MemoryConnector`]s that listen on virtual
//! ports and dial each other through channels. Failures can be injected per
//! target port (`fail_next_dial`) and live links can be cut (`sever`), which
//! is how tests simulate a transport failure on a single peer.

use super::{Connector, Listener, Transport, TransportError, MAX_MESSAGE_SIZE};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{mpsc, watch};

/// Host name every memory listener is reachable at.
pub const MEMORY_HOST: &str = "memory";

const FIRST_PORT: u16 = 40_000;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared virtual network.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

#[derive(Debug, Default)]
struct NetworkInner {
    listeners: HashMap<u16, mpsc::UnboundedSender<Arc<dyn Transport>>>,
    next_port: u16,
    fail_next_dial: HashMap<u16, String>,
    links: Vec<Weak<LinkShared>>,
}

#[derive(Debug)]
struct LinkShared {
    // Listening ports of the two ends, when known.
    ports: [Option<u16>; 2],
    closed: watch::Sender<bool>,
}

impl LinkShared {
    fn close(&self) {
        self.closed.send_replace(true);
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

impl MemoryNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// A connector attached to this network.
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            network: self.clone(),
            local_port: Arc::new(Mutex::new(None)),
        }
    }

    /// Cause the next dial to `port` to fail with the given error.
    pub fn fail_next_dial(&self, port: u16, error: &str) {
        let mut inner = lock(&self.inner);
        inner.fail_next_dial.insert(port, error.to_string());
    }

    /// Cut every live link with an end listening on `port`.
    ///
    /// Returns the number of links cut.
    pub fn sever(&self, port: u16) -> usize {
        let mut inner = lock(&self.inner);
        inner.links.retain(|l| l.strong_count() > 0);
        let mut cut = 0;
        for link in inner.links.iter().filter_map(Weak::upgrade) {
            if !link.is_closed() && link.ports.contains(&Some(port)) {
                link.close();
                cut += 1;
            }
        }
        cut
    }

    /// Number of links that are still open.
    pub fn open_links(&self) -> usize {
        let inner = lock(&self.inner);
        inner
            .links
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|l| !l.is_closed())
            .count()
    }

    /// Stop accepting on `port`; later dials to it fail.
    pub fn unlisten(&self, port: u16) {
        let mut inner = lock(&self.inner);
        inner.listeners.remove(&port);
    }
}

/// Connector for one device on a [`MemoryNetwork`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    network: MemoryNetwork,
    local_port: Arc<Mutex<Option<u16>>>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn listen(&self, port: u16) -> Result<Box<dyn Listener>, TransportError> {
        let mut inner = lock(&self.network.inner);
        let port = if port == 0 {
            if inner.next_port < FIRST_PORT {
                inner.next_port = FIRST_PORT;
            }
            while inner.listeners.contains_key(&inner.next_port) {
                inner.next_port = inner.next_port.wrapping_add(1).max(FIRST_PORT);
            }
            inner.next_port
        } else {
            port
        };
        if inner.listeners.contains_key(&port) {
            return Err(TransportError::ListenFailed(format!(
                "port {port} already in use"
            )));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        inner.listeners.insert(port, tx);
        *lock(&self.local_port) = Some(port);
        Ok(Box::new(MemoryListener {
            network: self.network.clone(),
            port,
            incoming: rx,
        }))
    }

    async fn dial(&self, host: &str, port: u16) -> Result<Arc<dyn Transport>, TransportError> {
        if host != MEMORY_HOST {
            return Err(TransportError::ConnectionFailed(format!(
                "unknown host {host}"
            )));
        }
        let local_port = *lock(&self.local_port);
        let mut inner = lock(&self.network.inner);
        if let Some(error) = inner.fail_next_dial.remove(&port) {
            return Err(TransportError::ConnectionFailed(error));
        }
        let listener = inner
            .listeners
            .get(&port)
            .ok_or_else(|| {
                TransportError::ConnectionFailed(format!("nothing listening on {port}"))
            })?
            .clone();

        let (closed, _) = watch::channel(false);
        let shared = Arc::new(LinkShared {
            ports: [local_port, Some(port)],
            closed,
        });
        inner.links.push(Arc::downgrade(&shared));
        drop(inner);

        let (dialer, acceptor) = MemoryTransport::pair(shared);
        listener
            .send(Arc::new(acceptor))
            .map_err(|_| TransportError::ConnectionFailed(format!("port {port} closed")))?;
        Ok(Arc::new(dialer))
    }
}

struct MemoryListener {
    network: MemoryNetwork,
    port: u16,
    incoming: mpsc::UnboundedReceiver<Arc<dyn Transport>>,
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.network.unlisten(self.port);
    }
}

#[async_trait]
impl Listener for MemoryListener {
    fn local_port(&self) -> u16 {
        self.port
    }

    async fn accept(&mut self) -> Result<Arc<dyn Transport>, TransportError> {
        self.incoming
            .recv()
            .await
            .ok_or(TransportError::ConnectionClosed)
    }
}

/// One end of an in-memory link.
struct MemoryTransport {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    shared: Arc<LinkShared>,
}

impl MemoryTransport {
    fn pair(shared: Arc<LinkShared>) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: b_tx,
                rx: tokio::sync::Mutex::new(a_rx),
                shared: shared.clone(),
            },
            Self {
                tx: a_tx,
                rx: tokio::sync::Mutex::new(b_rx),
                shared,
            },
        )
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.shared.close();
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(TransportError::SendFailed(format!(
                "Message too large: {} > {}",
                data.len(),
                MAX_MESSAGE_SIZE
            )));
        }
        if self.shared.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        self.tx
            .send(data.to_vec())
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        let mut closed = self.shared.closed.subscribe();
        let mut rx = self.rx.lock().await;
        loop {
            // Deliver what was sent before the link went down.
            if let Ok(msg) = rx.try_recv() {
                return Ok(msg);
            }
            if *closed.borrow_and_update() {
                return Err(TransportError::ConnectionClosed);
            }
            tokio::select! {
                msg = rx.recv() => return msg.ok_or(TransportError::ConnectionClosed),
                changed = closed.changed() => {
                    if changed.is_err() {
                        return Err(TransportError::ConnectionClosed);
                    }
                }
            }
        }
    }

    fn is_connected(&self) -> bool {
        !self.shared.is_closed()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.shared.close();
        Ok(())
    }
}
