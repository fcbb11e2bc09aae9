/// One streaming session: registry, state machine and event listeners
use log::{error, info};
use std::rc::Rc;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::bluetooth::connection::{ConnectionManager, ConnectionSettings};
use crate::bluetooth::dispatcher::{EventDispatcher, ListenerGuard};
use crate::bluetooth::platform::{BlePlatform, PermissionGate, PlatformEvent};
use crate::error::{ConnectionError, ScanError};
use crate::models::Peripheral;
use crate::registry::PeripheralRegistry;
use crate::storage::SampleStore;
use crate::utils::format_datetime;

/// Command surface offered to a front end, plus the resources it owns
///
/// Starting a session checks the scan permission and registers the event
/// listeners; `end` disconnects the current peripheral and removes all
/// listeners together. Must be created inside a `tokio::task::LocalSet`.
pub struct Session<P, S> {
    connections: Rc<ConnectionManager<P>>,
    listeners: Option<ListenerGuard>,
    _dispatcher: Rc<EventDispatcher<P, S>>,
}

impl<P, S> Session<P, S>
where
    P: BlePlatform + 'static,
    S: SampleStore + 'static,
{
    pub fn start(
        platform: Arc<P>,
        sink: Arc<S>,
        permissions: Arc<dyn PermissionGate + Send + Sync>,
        settings: ConnectionSettings,
        events: UnboundedReceiver<PlatformEvent>,
    ) -> Self {
        let connections = Rc::new(ConnectionManager::new(
            platform,
            PeripheralRegistry::new(),
            permissions,
            settings,
        ));
        connections.ensure_permission();

        let dispatcher = Rc::new(EventDispatcher::new(Rc::clone(&connections), sink));
        let listeners = Rc::clone(&dispatcher).listen(events);
        info!(
            "Session started at {}",
            format_datetime(&OffsetDateTime::now_utc())
        );

        Session {
            connections,
            listeners: Some(listeners),
            _dispatcher: dispatcher,
        }
    }

    pub async fn start_scan(&self) -> Result<bool, ScanError> {
        self.connections.start_scan().await
    }

    pub async fn wait_scan_complete(&self) {
        self.connections.wait_scan_complete().await
    }

    pub fn is_scanning(&self) -> bool {
        self.connections.is_scanning()
    }

    pub async fn toggle_connection(&self, id: &str) -> Result<(), ConnectionError> {
        self.connections.toggle_connection(id).await
    }

    pub async fn go_to_peripheral(&self, id: &str) -> Result<Option<Peripheral>, ConnectionError> {
        self.connections.go_to_peripheral(id).await
    }

    pub fn snapshot(&self) -> Vec<Peripheral> {
        self.connections.registry().snapshot()
    }

    pub fn current_peripheral(&self) -> Option<Peripheral> {
        self.connections.current_peripheral()
    }

    /// Look a peripheral up by id or advertised name, ignoring case
    pub fn find(&self, id_or_name: &str) -> Option<Peripheral> {
        self.snapshot().into_iter().find(|p| {
            p.id.eq_ignore_ascii_case(id_or_name)
                || (!p.has_default_name() && p.name.eq_ignore_ascii_case(id_or_name))
        })
    }

    pub fn is_listening(&self) -> bool {
        self.listeners.as_ref().map_or(false, ListenerGuard::is_active)
    }

    pub async fn end(mut self) {
        if let Some(current) = self.current_peripheral().filter(|p| p.connected) {
            if let Err(e) = self.connections.disconnect(&current.id).await {
                error!("Could not disconnect {} at session end: {}", current.id, e);
            }
        }
        if let Some(listeners) = self.listeners.take() {
            listeners.release().await;
        }
        info!(
            "Session ended at {}",
            format_datetime(&OffsetDateTime::now_utc())
        );
    }
}
