/// Peripheral connection lifecycle: scan, connect, subscribe, disconnect
use bluer::Uuid;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

use crate::bluetooth::platform::{BlePlatform, DiscoveredPeripheral, PermissionGate};
use crate::bluetooth::protocol::{ACCELEROMETER_DATA_UUID, ACCELEROMETER_SERVICE_UUID};
use crate::error::{ConnectionError, ScanError};
use crate::models::Peripheral;
use crate::registry::PeripheralRegistry;

const DEFAULT_SCAN_DURATION_SECS: u64 = 3;

/// Scan and connect parameters handed to the platform
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSettings {
    pub scan_duration: Duration,
    pub service_filters: Vec<Uuid>,
    pub allow_duplicates: bool,
    /// `None` lets a connect wait for the platform indefinitely
    pub connect_timeout: Option<Duration>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        ConnectionSettings {
            scan_duration: Duration::from_secs(DEFAULT_SCAN_DURATION_SECS),
            service_filters: Vec::new(),
            allow_duplicates: false,
            connect_timeout: None,
        }
    }
}

/// A connect waiting on the platform
#[derive(Debug)]
struct Attempt {
    token: u64,
    /// Disconnect observed while connecting
    dropped: bool,
}

/// Drives peripherals through discovered → connecting → connected → subscribed
///
/// All state visible to other components lives in the registry. The manager
/// additionally tracks the scanning flag, the current peripheral and which
/// connects are in flight, so a disconnect delivered mid-connect wins over the
/// late connect completion.
pub struct ConnectionManager<P> {
    platform: Arc<P>,
    registry: PeripheralRegistry,
    permissions: Arc<dyn PermissionGate + Send + Sync>,
    settings: ConnectionSettings,
    scanning: watch::Sender<bool>,
    current: Mutex<Option<String>>,
    in_flight: Mutex<HashMap<String, Attempt>>,
    attempts: AtomicU64,
}

impl<P: BlePlatform> ConnectionManager<P> {
    pub fn new(
        platform: Arc<P>,
        registry: PeripheralRegistry,
        permissions: Arc<dyn PermissionGate + Send + Sync>,
        settings: ConnectionSettings,
    ) -> Self {
        let (scanning, _) = watch::channel(false);
        ConnectionManager {
            platform,
            registry,
            permissions,
            settings,
            scanning,
            current: Mutex::new(None),
            in_flight: Mutex::new(HashMap::new()),
            attempts: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &PeripheralRegistry {
        &self.registry
    }

    pub fn is_scanning(&self) -> bool {
        *self.scanning.borrow()
    }

    /// Ask for scan permission if it is not already held
    pub fn ensure_permission(&self) -> bool {
        if self.permissions.check() {
            debug!("Scan permission is OK");
            return true;
        }
        if self.permissions.request() {
            info!("Scan permission granted by user");
            true
        } else {
            warn!("Scan permission refused by user");
            false
        }
    }

    /// Start a scan unless one is already running
    ///
    /// # Returns
    /// `Ok(true)` if a scan was requested, `Ok(false)` if one was already in progress
    pub async fn start_scan(&self) -> Result<bool, ScanError> {
        if !self.ensure_permission() {
            error!("Cannot scan without bluetooth scan permission");
            return Err(ScanError::PermissionDenied);
        }

        let started = self.scanning.send_if_modified(|scanning| {
            if *scanning {
                false
            } else {
                *scanning = true;
                true
            }
        });
        if !started {
            debug!("Scan already in progress");
            return Ok(false);
        }

        info!(
            "Scanning for {}s ({} service filters)",
            self.settings.scan_duration.as_secs(),
            self.settings.service_filters.len()
        );
        if let Err(e) = self
            .platform
            .scan(
                &self.settings.service_filters,
                self.settings.scan_duration,
                self.settings.allow_duplicates,
            )
            .await
        {
            error!("Scan request failed: {}", e);
            self.scanning.send_replace(false);
            return Err(e.into());
        }
        Ok(true)
    }

    /// Resolve once no scan is running
    pub async fn wait_scan_complete(&self) {
        let mut scanning = self.scanning.subscribe();
        let _ = scanning.wait_for(|running| !*running).await;
    }

    pub fn on_stop_scan(&self) {
        self.scanning.send_replace(false);
        info!("Scan is stopped");
    }

    /// Record an advertisement; connection flags of known peripherals are kept
    pub fn on_discovered(&self, discovered: DiscoveredPeripheral) -> Peripheral {
        let name = discovered.name.filter(|n| !n.trim().is_empty());
        let rssi = discovered.rssi;

        let stored = self.registry.upsert(&discovered.id, |mut p| {
            if let Some(name) = name {
                p.name = name;
            }
            if let Some(rssi) = rssi {
                p.rssi = rssi;
            }
            p
        });
        debug!("Got ble peripheral {} ({}) rssi {}", stored.id, stored.name, stored.rssi);
        stored
    }

    /// Connect, discover the accelerometer service and subscribe to its data
    ///
    /// Unknown ids and peripherals already connecting or connected are ignored.
    /// On failure the peripheral is left neither connecting nor connected and
    /// nothing is retried.
    pub async fn connect(&self, id: &str) -> Result<(), ConnectionError> {
        let Some(peripheral) = self.registry.get(id) else {
            debug!("Connect ignored, {} has not been discovered", id);
            return Ok(());
        };
        if peripheral.connecting || peripheral.connected {
            debug!("Connect ignored, {} is already connecting or connected", id);
            return Ok(());
        }

        let token = self.attempts.fetch_add(1, Ordering::Relaxed);
        self.lock_in_flight().insert(
            id.to_string(),
            Attempt {
                token,
                dropped: false,
            },
        );
        self.registry.upsert(id, |p| Peripheral {
            connecting: true,
            connected: false,
            ..p
        });
        info!("Connecting to {} ({})", id, peripheral.name);

        let connected = self.platform_connect(id).await;
        let Some(dropped) = self.finish_attempt(id, token) else {
            // A later connect to the same id owns the flags and the link now
            let e = ConnectionError::DroppedDuringConnect { id: id.to_string() };
            warn!("{} (superseded by a newer attempt)", e);
            return Err(e);
        };

        if let Err(e) = connected {
            error!("Connection error: {}", e);
            self.mark_disconnected(id);
            if matches!(e, ConnectionError::Timeout { .. }) {
                // The link may still come up after the request was dropped
                self.release_link(id).await;
            }
            return Err(e);
        }
        if dropped {
            let e = ConnectionError::DroppedDuringConnect { id: id.to_string() };
            warn!("{}", e);
            self.mark_disconnected(id);
            return Err(e);
        }

        self.registry.upsert(id, |p| Peripheral {
            connecting: false,
            connected: true,
            ..p
        });
        self.set_current(Some(id));
        info!("Connected to {}", id);

        if let Err(source) = self
            .platform
            .retrieve_services(id, ACCELEROMETER_SERVICE_UUID)
            .await
        {
            return Err(self
                .abandon(ConnectionError::ServiceDiscovery {
                    id: id.to_string(),
                    source,
                })
                .await);
        }
        debug!("Services resolved on {}", id);

        if let Err(source) = self
            .platform
            .start_notification(id, ACCELEROMETER_SERVICE_UUID, ACCELEROMETER_DATA_UUID)
            .await
        {
            return Err(self
                .abandon(ConnectionError::Subscribe {
                    id: id.to_string(),
                    source,
                })
                .await);
        }
        info!("Notification started on {}", id);
        Ok(())
    }

    async fn platform_connect(&self, id: &str) -> Result<(), ConnectionError> {
        let request = self.platform.connect(id);
        let result = match self.settings.connect_timeout {
            Some(limit) => match tokio::time::timeout(limit, request).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(ConnectionError::Timeout {
                        id: id.to_string(),
                        after: limit,
                    })
                }
            },
            None => request.await,
        };
        result.map_err(|source| ConnectionError::Connect {
            id: id.to_string(),
            source,
        })
    }

    /// Close the bookkeeping of one attempt
    ///
    /// # Returns
    /// Whether a disconnect arrived while it was pending, or `None` when a
    /// newer attempt replaced it
    fn finish_attempt(&self, id: &str, token: u64) -> Option<bool> {
        let mut in_flight = self.lock_in_flight();
        match in_flight.get(id) {
            Some(attempt) if attempt.token == token => in_flight.remove(id).map(|a| a.dropped),
            _ => None,
        }
    }

    async fn release_link(&self, id: &str) {
        if let Err(e) = self.platform.disconnect(id).await {
            warn!("Could not release link to {}: {}", id, e);
        }
    }

    /// Roll back a connect that failed after the link came up
    async fn abandon(&self, e: ConnectionError) -> ConnectionError {
        error!("Connection error: {}", e);
        let id = match &e {
            ConnectionError::ServiceDiscovery { id, .. } | ConnectionError::Subscribe { id, .. } => {
                id.clone()
            }
            _ => return e,
        };
        self.mark_disconnected(&id);
        self.release_link(&id).await;
        e
    }

    /// Ask the platform to drop the link; state changes only when the
    /// platform reports the disconnect
    pub async fn disconnect(&self, id: &str) -> Result<(), ConnectionError> {
        match self.registry.get(id) {
            Some(p) if p.connected => {}
            _ => {
                debug!("Disconnect ignored, {} is not connected", id);
                return Ok(());
            }
        }

        info!("Disconnecting from {}", id);
        self.platform.disconnect(id).await.map_err(|source| {
            let e = ConnectionError::Disconnect {
                id: id.to_string(),
                source,
            };
            error!("{}", e);
            e
        })
    }

    /// Platform reported the link is gone, with or without a local request
    pub fn on_disconnected(&self, id: &str) {
        if let Some(attempt) = self.lock_in_flight().get_mut(id) {
            attempt.dropped = true;
        }

        match self.registry.get(id) {
            None => debug!("Disconnect event for unknown peripheral {}", id),
            Some(p) if !p.connected && !p.connecting => {
                self.clear_current_if(id);
                debug!("{} already disconnected", id);
            }
            Some(_) => {
                self.mark_disconnected(id);
                info!("Disconnected from {}", id);
            }
        }
    }

    /// Single user-facing entry point: disconnect if connected, else connect
    pub async fn toggle_connection(&self, id: &str) -> Result<(), ConnectionError> {
        match self.registry.get(id) {
            Some(p) if p.connected => self.disconnect(id).await,
            Some(_) => self.connect(id).await,
            None => {
                debug!("Toggle ignored, {} has not been discovered", id);
                Ok(())
            }
        }
    }

    /// Open the detail view of a connected peripheral, or connect to it first
    ///
    /// # Returns
    /// The peripheral to show when it is already connected, `None` otherwise
    pub async fn go_to_peripheral(&self, id: &str) -> Result<Option<Peripheral>, ConnectionError> {
        match self.registry.get(id) {
            Some(p) if p.connected => {
                self.set_current(Some(id));
                Ok(Some(p))
            }
            Some(_) => {
                self.connect(id).await?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    pub fn current_peripheral(&self) -> Option<Peripheral> {
        let id = self.lock_current().clone()?;
        self.registry.get(&id)
    }

    fn mark_disconnected(&self, id: &str) {
        self.registry.upsert(id, |p| Peripheral {
            connecting: false,
            connected: false,
            ..p
        });
        self.clear_current_if(id);
    }

    fn set_current(&self, id: Option<&str>) {
        *self.lock_current() = id.map(str::to_string);
    }

    fn clear_current_if(&self, id: &str) {
        let mut current = self.lock_current();
        if current.as_deref() == Some(id) {
            *current = None;
        }
    }

    fn lock_current(&self) -> MutexGuard<'_, Option<String>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<String, Attempt>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
