/// BlueZ implementation of the BLE platform collaborator
use bluer::gatt::remote::{Characteristic, Service};
use bluer::{Adapter, Address, Device, DeviceEvent, DeviceProperty, Uuid};
use futures_util::{pin_mut, StreamExt};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

use crate::bluetooth::platform::{BlePlatform, PlatformEvent};
use crate::bluetooth::protocol::CLIENT_CONFIG_DESCRIPTOR_UUID;
use crate::bluetooth::scanner::start_discovery;
use crate::error::PlatformError;

const SERVICES_RESOLVE_ATTEMPTS: u32 = 25;
const SERVICES_RESOLVE_POLL_MS: u64 = 200;

/// BLE central on the default BlueZ adapter
///
/// Background tasks (scan window, disconnect watchers, notification
/// forwarders) report through the event channel returned by `new`.
pub struct BluezPlatform {
    _session: bluer::Session,
    adapter: Adapter,
    events: UnboundedSender<PlatformEvent>,
    tasks: Mutex<HashMap<String, Vec<JoinHandle<()>>>>,
}

impl BluezPlatform {
    /// Open a BlueZ session and power on the default adapter
    pub async fn new() -> Result<(Self, UnboundedReceiver<PlatformEvent>), PlatformError> {
        // Initialize Bluetooth session
        let session = match bluer::Session::new().await {
            Ok(session) => session,
            Err(e) => {
                error!("Failed to create Bluetooth session: {}", e);
                return Err(e.into());
            }
        };

        // Get the default Bluetooth adapter
        let adapter = match session.default_adapter().await {
            Ok(adapter) => adapter,
            Err(e) => {
                error!("Failed to get default Bluetooth adapter: {}", e);
                return Err(e.into());
            }
        };

        // Ensure Bluetooth adapter is powered on
        if let Err(e) = adapter.set_powered(true).await {
            error!("Failed to power on adapter: {}", e);
            return Err(e.into());
        }
        info!("Using Bluetooth adapter {}", adapter.name());

        let (events, receiver) = mpsc::unbounded_channel();
        Ok((
            BluezPlatform {
                _session: session,
                adapter,
                events,
                tasks: Mutex::new(HashMap::new()),
            },
            receiver,
        ))
    }

    fn device(&self, id: &str) -> Result<Device, PlatformError> {
        let addr: Address = id
            .parse()
            .map_err(|_| PlatformError::InvalidAddress(id.to_string()))?;
        Ok(self.adapter.device(addr)?)
    }

    fn track(&self, id: &str, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        let handles = tasks.entry(id.to_string()).or_default();
        handles.retain(|handle| !handle.is_finished());
        handles.push(task);
    }

    fn stop_tasks(&self, id: &str) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        for handle in tasks.remove(id).unwrap_or_default() {
            handle.abort();
        }
    }

    /// Report `Disconnect` once BlueZ drops the link, whoever initiated it
    async fn watch_disconnect(&self, id: &str, device: &Device) -> Result<(), PlatformError> {
        let device_events = device.events().await?;
        let events = self.events.clone();
        let id = id.to_string();

        let task = tokio::spawn({
            let id = id.clone();
            async move {
                pin_mut!(device_events);
                while let Some(event) = device_events.next().await {
                    if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
                        let _ = events.send(PlatformEvent::Disconnect { id });
                        return;
                    }
                }
            }
        });
        self.track(&id, task);
        Ok(())
    }

    async fn find_service(
        &self,
        id: &str,
        device: &Device,
        uuid: Uuid,
    ) -> Result<Service, PlatformError> {
        // GATT discovery finishes asynchronously after connect
        for _ in 0..SERVICES_RESOLVE_ATTEMPTS {
            if device.is_services_resolved().await? {
                break;
            }
            sleep(Duration::from_millis(SERVICES_RESOLVE_POLL_MS)).await;
        }

        for service in device.services().await? {
            if service.uuid().await? == uuid {
                return Ok(service);
            }
        }
        Err(PlatformError::ServiceNotFound {
            id: id.to_string(),
            service: uuid,
        })
    }

    async fn find_characteristic(
        &self,
        id: &str,
        service: &Service,
        uuid: Uuid,
    ) -> Result<Characteristic, PlatformError> {
        for characteristic in service.characteristics().await? {
            if characteristic.uuid().await? == uuid {
                return Ok(characteristic);
            }
        }
        Err(PlatformError::CharacteristicNotFound {
            id: id.to_string(),
            characteristic: uuid,
        })
    }
}

impl BlePlatform for BluezPlatform {
    async fn scan(
        &self,
        service_filters: &[Uuid],
        duration: Duration,
        allow_duplicates: bool,
    ) -> Result<(), PlatformError> {
        start_discovery(
            &self.adapter,
            service_filters,
            duration,
            allow_duplicates,
            self.events.clone(),
        )
        .await?;
        Ok(())
    }

    async fn connect(&self, id: &str) -> Result<(), PlatformError> {
        let device = self.device(id)?;
        // Forwarders left over from a previous link
        self.stop_tasks(id);
        if !device.is_connected().await? {
            device.connect().await?;
        }
        self.watch_disconnect(id, &device).await
    }

    async fn disconnect(&self, id: &str) -> Result<(), PlatformError> {
        let device = self.device(id)?;
        device.disconnect().await?;
        Ok(())
    }

    async fn retrieve_services(&self, id: &str, service: Uuid) -> Result<(), PlatformError> {
        let device = self.device(id)?;
        if !device.is_connected().await? {
            return Err(PlatformError::NotConnected(id.to_string()));
        }
        let service = self.find_service(id, &device, service).await?;
        debug!("Peripheral {} exposes service {}", id, service.uuid().await?);
        Ok(())
    }

    async fn start_notification(
        &self,
        id: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), PlatformError> {
        let device = self.device(id)?;
        let service = self.find_service(id, &device, service).await?;
        let data = self.find_characteristic(id, &service, characteristic).await?;

        let mut has_client_config = false;
        for descriptor in data.descriptors().await? {
            if descriptor.uuid().await? == CLIENT_CONFIG_DESCRIPTOR_UUID {
                has_client_config = true;
            }
        }
        if !has_client_config {
            warn!(
                "Characteristic {} on {} has no client configuration descriptor",
                characteristic, id
            );
        }

        let notifications = data.notify().await?;
        let events = self.events.clone();
        let task = tokio::spawn({
            let id = id.to_string();
            async move {
                pin_mut!(notifications);
                while let Some(value) = notifications.next().await {
                    let update = PlatformEvent::CharacteristicUpdate {
                        id: id.clone(),
                        characteristic,
                        value,
                    };
                    if events.send(update).is_err() {
                        return;
                    }
                }
                debug!("Notification stream from {} ended", id);
            }
        });
        self.track(id, task);
        Ok(())
    }
}

impl Drop for BluezPlatform {
    fn drop(&mut self) {
        let ids: Vec<String> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        for id in ids {
            self.stop_tasks(&id);
        }
    }
}
