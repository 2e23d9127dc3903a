//! UDP broadcast beacons.
//!
//! One socket bound to the discovery port both sends and receives. Beacons are
//! JSON datagrams broadcast to `255.255.255.255:<port>` unless another target
//! is given. Datagrams that do not decode as a [`Beacon`] are dropped.

use super::{Advertiser, DiscoveryError, ObservedBeacon};
use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use sync_types::Beacon;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const BEACON_CHANNEL_CAPACITY: usize = 256;
const MAX_DATAGRAM: usize = 64 * 1024;

/// Advertiser over UDP broadcast.
pub struct UdpAdvertiser {
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    beacons: broadcast::Sender<ObservedBeacon>,
    receiver: JoinHandle<()>,
}

impl UdpAdvertiser {
    /// Bind the discovery port and broadcast on it.
    pub async fn bind(port: u16) -> Result<Self, DiscoveryError> {
        Self::bind_with_target(port, None).await
    }

    /// Bind `port` (0 picks one) and send beacons to `target` instead of the
    /// broadcast address.
    pub async fn bind_with_target(
        port: u16,
        target: Option<SocketAddr>,
    ) -> Result<Self, DiscoveryError> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
        socket.set_broadcast(true)?;
        let port = socket.local_addr()?.port();
        let target = target.unwrap_or_else(|| SocketAddr::from((Ipv4Addr::BROADCAST, port)));

        let socket = Arc::new(socket);
        let (beacons, _) = broadcast::channel(BEACON_CHANNEL_CAPACITY);
        let receiver = tokio::spawn(receive_loop(Arc::clone(&socket), beacons.clone()));
        debug!(port, %target, "udp discovery bound");
        Ok(Self {
            socket,
            target,
            beacons,
            receiver,
        })
    }

    /// Port the advertiser listens on.
    pub fn local_port(&self) -> Result<u16, DiscoveryError> {
        Ok(self.socket.local_addr()?.port())
    }
}

impl Drop for UdpAdvertiser {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

#[async_trait]
impl Advertiser for UdpAdvertiser {
    async fn publish(&self, beacon: &Beacon) -> Result<(), DiscoveryError> {
        let bytes = beacon.to_bytes()?;
        self.socket.send_to(&bytes, self.target).await?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ObservedBeacon> {
        self.beacons.subscribe()
    }
}

async fn receive_loop(socket: Arc<UdpSocket>, beacons: broadcast::Sender<ObservedBeacon>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, addr)) => match Beacon::from_bytes(&buf[..len]) {
                Ok(beacon) => {
                    let _ = beacons.send(ObservedBeacon {
                        beacon,
                        host: addr.ip().to_string(),
                    });
                }
                Err(e) => debug!(%addr, error = %e, "ignoring datagram"),
            },
            Err(e) => {
                warn!(error = %e, "discovery socket error");
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_types::DeviceId;

    #[tokio::test]
    async fn beacon_reaches_target() {
        let listener = UdpAdvertiser::bind_with_target(0, None).await.unwrap();
        let port = listener.local_port().unwrap();
        let mut beacons = listener.subscribe();

        let target = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let sender = UdpAdvertiser::bind_with_target(0, Some(target))
            .await
            .unwrap();
        let beacon = Beacon::Withdraw {
            device_id: DeviceId::from_bytes(&[3; 32]).unwrap(),
        };
        sender.publish(&beacon).await.unwrap();

        let observed = tokio::time::timeout(Duration::from_secs(2), beacons.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(observed.beacon, beacon);
        assert_eq!(observed.host, "127.0.0.1");
    }

    #[tokio::test]
    async fn garbage_datagrams_are_dropped() {
        let listener = UdpAdvertiser::bind_with_target(0, None).await.unwrap();
        let port = listener.local_port().unwrap();
        let mut beacons = listener.subscribe();

        let raw = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        raw.send_to(b"not json", (Ipv4Addr::LOCALHOST, port)).await.unwrap();
        let beacon = Beacon::Withdraw {
            device_id: DeviceId::from_bytes(&[4; 32]).unwrap(),
        };
        raw.send_to(&beacon.to_bytes().unwrap(), (Ipv4Addr::LOCALHOST, port))
            .await
            .unwrap();

        let observed = tokio::time::timeout(Duration::from_secs(2), beacons.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(observed.beacon, beacon);
    }
}
