//! In-process advertisement substrate for tests.

use super::{Advertiser, DiscoveryError, ObservedBeacon};
use crate::transport::MEMORY_HOST;
use async_trait::async_trait;
use sync_types::Beacon;
use tokio::sync::broadcast;

const LAN_CAPACITY: usize = 1024;

/// Shared virtual LAN. Every advertiser on it sees every beacon.
#[derive(Debug, Clone)]
pub struct MemoryLan {
    beacons: broadcast::Sender<ObservedBeacon>,
}

impl MemoryLan {
    /// Create an empty LAN.
    pub fn new() -> Self {
        let (beacons, _) = broadcast::channel(LAN_CAPACITY);
        Self { beacons }
    }

    /// An advertiser attached to this LAN.
    ///
    /// Beacons appear to come from [`MEMORY_HOST`], so discovered devices can
    /// be dialed through a [`MemoryNetwork`](crate::transport::MemoryNetwork).
    pub fn advertiser(&self) -> MemoryAdvertiser {
        MemoryAdvertiser {
            beacons: self.beacons.clone(),
        }
    }
}

impl Default for MemoryLan {
    fn default() -> Self {
        Self::new()
    }
}

/// Advertiser for one device on a [`MemoryLan`].
#[derive(Debug, Clone)]
pub struct MemoryAdvertiser {
    beacons: broadcast::Sender<ObservedBeacon>,
}

#[async_trait]
impl Advertiser for MemoryAdvertiser {
    async fn publish(&self, beacon: &Beacon) -> Result<(), DiscoveryError> {
        // Nobody listening is not an error on a broadcast medium.
        let _ = self.beacons.send(ObservedBeacon {
            beacon: beacon.clone(),
            host: MEMORY_HOST.to_string(),
        });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ObservedBeacon> {
        self.beacons.subscribe()
    }
}
