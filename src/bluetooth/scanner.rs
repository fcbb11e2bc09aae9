/// Time-bounded Bluetooth Low Energy discovery
use bluer::{Adapter, AdapterEvent, Address, Uuid};
use futures_util::{pin_mut, StreamExt};
use log::{debug, error, warn};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

use crate::bluetooth::platform::{DiscoveredPeripheral, PlatformEvent};
use crate::error::PlatformError;

/// Run discovery on `adapter` for `duration`, reporting every peripheral seen
///
/// A `Discover` event is sent for each device BlueZ reports (cached devices
/// included), then a single `StopScan` once the window closes.
///
/// # Arguments
/// * `adapter` - Powered BlueZ adapter
/// * `service_filters` - Only report devices advertising one of these services; empty means all
/// * `duration` - Scan window
/// * `allow_duplicates` - Ask BlueZ to report repeated advertisements
/// * `events` - Channel feeding the event dispatcher
///
/// # Returns
/// Handle of the background discovery task, or error if discovery cannot start
pub async fn start_discovery(
    adapter: &Adapter,
    service_filters: &[Uuid],
    duration: Duration,
    allow_duplicates: bool,
    events: UnboundedSender<PlatformEvent>,
) -> Result<JoinHandle<()>, PlatformError> {
    // Configure discovery filter for Low Energy devices only
    let filter = bluer::DiscoveryFilter {
        uuids: service_filters.iter().copied().collect(),
        transport: bluer::DiscoveryTransport::Le,
        duplicate_data: allow_duplicates,
        ..Default::default()
    };

    // Apply the discovery filter (warn if it fails, but continue)
    if let Err(e) = adapter.set_discovery_filter(filter).await {
        warn!("Failed to set discovery filter: {}", e);
    }

    let discovery_stream = match adapter.discover_devices().await {
        Ok(stream) => stream,
        Err(e) => {
            error!("Failed to start device discovery: {}", e);
            return Err(e.into());
        }
    };

    let adapter = adapter.clone();
    Ok(tokio::spawn(async move {
        // The discovery session ends when the stream is dropped with this block
        {
            let deadline = sleep(duration);
            pin_mut!(deadline);
            pin_mut!(discovery_stream);

            loop {
                tokio::select! {
                    _ = &mut deadline => break,
                    event = discovery_stream.next() => match event {
                        Some(AdapterEvent::DeviceAdded(addr)) => {
                            if let Some(discovered) = describe(&adapter, addr).await {
                                if events.send(PlatformEvent::Discover(discovered)).is_err() {
                                    return;
                                }
                            }
                        }
                        Some(other) => debug!("Discovery event: {:?}", other),
                        None => break,
                    },
                }
            }
        }

        let _ = events.send(PlatformEvent::StopScan);
    }))
}

/// Read the advertised name and signal strength of a discovered device
async fn describe(adapter: &Adapter, addr: Address) -> Option<DiscoveredPeripheral> {
    let device = match adapter.device(addr) {
        Ok(device) => device,
        Err(e) => {
            debug!("Discovered device {} vanished: {}", addr, e);
            return None;
        }
    };

    let name = device.name().await.unwrap_or_else(|e| {
        debug!("No name for {}: {}", addr, e);
        None
    });
    let rssi = device.rssi().await.unwrap_or(None);

    Some(DiscoveredPeripheral {
        id: addr.to_string().to_uppercase(),
        name,
        rssi,
    })
}
