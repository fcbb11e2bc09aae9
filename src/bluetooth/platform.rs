/// Boundary to the BLE radio stack and the platform permission prompt
use bluer::Uuid;
use std::time::Duration;

use crate::error::PlatformError;

/// Advertisement data reported for one peripheral during a scan
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredPeripheral {
    pub id: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

/// Asynchronous events emitted by the platform
#[derive(Debug, Clone, PartialEq)]
pub enum PlatformEvent {
    Discover(DiscoveredPeripheral),
    StopScan,
    Disconnect {
        id: String,
    },
    CharacteristicUpdate {
        id: String,
        characteristic: Uuid,
        value: Vec<u8>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Discover,
    StopScan,
    Disconnect,
    CharacteristicUpdate,
}

impl PlatformEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            PlatformEvent::Discover(_) => EventKind::Discover,
            PlatformEvent::StopScan => EventKind::StopScan,
            PlatformEvent::Disconnect { .. } => EventKind::Disconnect,
            PlatformEvent::CharacteristicUpdate { .. } => EventKind::CharacteristicUpdate,
        }
    }
}

/// Requests the core issues against the BLE stack.
///
/// Every request may suspend; events caused by a request arrive separately
/// through the platform's event channel.
#[allow(async_fn_in_trait)]
pub trait BlePlatform {
    /// Start a time-bounded scan. Completion is signalled by `PlatformEvent::StopScan`.
    async fn scan(
        &self,
        service_filters: &[Uuid],
        duration: Duration,
        allow_duplicates: bool,
    ) -> Result<(), PlatformError>;

    async fn connect(&self, id: &str) -> Result<(), PlatformError>;

    async fn disconnect(&self, id: &str) -> Result<(), PlatformError>;

    /// Resolve the GATT database of a connected peripheral and check `service` exists.
    async fn retrieve_services(&self, id: &str, service: Uuid) -> Result<(), PlatformError>;

    /// Enable notifications on `characteristic`; values arrive as `CharacteristicUpdate`.
    async fn start_notification(
        &self,
        id: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), PlatformError>;
}

/// Permission needed before a scan is meaningful on platforms that gate it
pub trait PermissionGate {
    fn check(&self) -> bool;
    fn request(&self) -> bool;
}

/// BlueZ grants scanning to any user allowed on the system bus
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBusPermission;

impl PermissionGate for SystemBusPermission {
    fn check(&self) -> bool {
        true
    }

    fn request(&self) -> bool {
        true
    }
}
