//! End-to-end tests of the session against a scripted radio and a real CSV log.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use ble_accel_logger::bluetooth::platform::{DiscoveredPeripheral, SystemBusPermission};
use ble_accel_logger::bluetooth::protocol::{ACCELEROMETER_DATA_UUID, ACCELEROMETER_SERVICE_UUID};
use ble_accel_logger::bluetooth::{BlePlatform, ConnectionSettings, PlatformEvent};
use ble_accel_logger::error::{ConnectionError, PlatformError};
use ble_accel_logger::session::Session;
use ble_accel_logger::storage::CsvSampleSink;
use bluer::Uuid;
use tempfile::tempdir;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::LocalSet;

/// Radio that acknowledges every request and echoes them as platform events
struct ScriptedRadio {
    events: UnboundedSender<PlatformEvent>,
    requests: Mutex<Vec<String>>,
    refuse_subscribe: bool,
}

impl ScriptedRadio {
    fn new(events: UnboundedSender<PlatformEvent>) -> Self {
        ScriptedRadio {
            events,
            requests: Mutex::new(Vec::new()),
            refuse_subscribe: false,
        }
    }
}

impl BlePlatform for ScriptedRadio {
    async fn scan(&self, _: &[Uuid], _: Duration, _: bool) -> Result<(), PlatformError> {
        self.requests.lock().unwrap().push("scan".to_string());
        for (id, name) in [("C0:FF:EE:00:00:01", None), ("C0:FF:EE:00:00:02", Some("sensor"))] {
            let _ = self.events.send(PlatformEvent::Discover(DiscoveredPeripheral {
                id: id.to_string(),
                name: name.map(str::to_string),
                rssi: Some(-55),
            }));
        }
        let _ = self.events.send(PlatformEvent::StopScan);
        Ok(())
    }

    async fn connect(&self, id: &str) -> Result<(), PlatformError> {
        self.requests.lock().unwrap().push(format!("connect {}", id));
        Ok(())
    }

    async fn disconnect(&self, id: &str) -> Result<(), PlatformError> {
        self.requests.lock().unwrap().push(format!("disconnect {}", id));
        let _ = self.events.send(PlatformEvent::Disconnect { id: id.to_string() });
        Ok(())
    }

    async fn retrieve_services(&self, _: &str, service: Uuid) -> Result<(), PlatformError> {
        assert_eq!(service, ACCELEROMETER_SERVICE_UUID);
        Ok(())
    }

    async fn start_notification(
        &self,
        id: &str,
        _: Uuid,
        characteristic: Uuid,
    ) -> Result<(), PlatformError> {
        if self.refuse_subscribe {
            return Err(PlatformError::Rejected("notify".to_string()));
        }
        assert_eq!(characteristic, ACCELEROMETER_DATA_UUID);
        self.requests.lock().unwrap().push(format!("notify {}", id));
        Ok(())
    }
}

fn notification(id: &str, value: Vec<u8>) -> PlatformEvent {
    PlatformEvent::CharacteristicUpdate {
        id: id.to_string(),
        characteristic: ACCELEROMETER_DATA_UUID,
        value,
    }
}

#[tokio::test]
async fn streams_notifications_into_csv_log() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("accelerometer.csv");

    LocalSet::new()
        .run_until(async {
            let (tx, rx) = mpsc::unbounded_channel();
            let radio = Arc::new(ScriptedRadio::new(tx.clone()));
            let sink = Arc::new(CsvSampleSink::open(&path).await.unwrap());
            let session = Session::start(
                radio.clone(),
                sink,
                Arc::new(SystemBusPermission),
                ConnectionSettings::default(),
                rx,
            );

            session.start_scan().await.unwrap();
            session.wait_scan_complete().await;
            let peripherals = session.snapshot();
            assert_eq!(peripherals.len(), 2);
            assert_eq!(peripherals[0].name, "NO NAME");
            assert!(peripherals.iter().all(|p| !p.connected && !p.connecting));

            let id = session.find("SENSOR").unwrap().id;
            session.toggle_connection(&id).await.unwrap();
            let connected = session.current_peripheral().unwrap();
            assert!(connected.connected && !connected.connecting);
            assert_eq!(session.go_to_peripheral(&id).await.unwrap().unwrap().id, id);

            tx.send(notification(&id, vec![0x00, 0x10, 0x00, 0x20, 0x00, 0x30]))
                .unwrap();
            tx.send(notification(&id, vec![0x00, 0x10, 0x00, 0x20, 0x00]))
                .unwrap();
            for i in 0..99u8 {
                tx.send(notification(&id, vec![i, 0, 0, 0, 0, 0])).unwrap();
            }

            // Disconnect is confirmed by the radio's event, not flipped locally
            session.toggle_connection(&id).await.unwrap();
            while session.find(&id).unwrap().connected {
                tokio::task::yield_now().await;
            }
            assert!(session.current_peripheral().is_none());

            session.end().await;
            let requests = radio.requests.lock().unwrap().clone();
            assert_eq!(
                requests,
                vec![
                    "scan".to_string(),
                    format!("connect {}", id),
                    format!("notify {}", id),
                    format!("disconnect {}", id),
                ]
            );
        })
        .await;

    let contents = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 100, "malformed payload must not be logged");
    assert!(lines[0].ends_with(",4.096,8.192,12.288"), "{}", lines[0]);

    let mut previous = i64::MIN;
    for line in &lines {
        let fields: Vec<&str> = line.split(',').collect();
        assert_eq!(fields.len(), 4, "{}", line);
        let timestamp: i64 = fields[0].parse().unwrap();
        assert!(timestamp >= previous);
        previous = timestamp;
        for axis in &fields[1..] {
            assert!(axis.parse::<f64>().unwrap().abs() < 65.536);
        }
    }
}

#[tokio::test]
async fn failed_subscription_leaves_peripheral_idle() {
    let dir = tempdir().unwrap();

    LocalSet::new()
        .run_until(async {
            let (tx, rx) = mpsc::unbounded_channel();
            let radio = Arc::new(ScriptedRadio {
                refuse_subscribe: true,
                ..ScriptedRadio::new(tx)
            });
            let sink = Arc::new(CsvSampleSink::open(dir.path().join("a.csv")).await.unwrap());
            let session = Session::start(
                radio,
                sink,
                Arc::new(SystemBusPermission),
                ConnectionSettings::default(),
                rx,
            );

            session.start_scan().await.unwrap();
            session.wait_scan_complete().await;
            let id = session.snapshot()[0].id.clone();

            let err = session.toggle_connection(&id).await.unwrap_err();
            assert!(matches!(err, ConnectionError::Subscribe { .. }));
            let p = session.find(&id).unwrap();
            assert!(!p.connected && !p.connecting);
            assert!(session.current_peripheral().is_none());

            session.end().await;
        })
        .await;
}
