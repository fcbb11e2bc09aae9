/// Routing of platform events to the state machine and the sample pipeline
use log::{debug, error, info};
use std::rc::Rc;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};

use crate::bluetooth::connection::ConnectionManager;
use crate::bluetooth::platform::{BlePlatform, PlatformEvent};
use crate::bluetooth::protocol::{decode_sample, ACCELEROMETER_DATA_UUID};
use crate::error::PipelineError;
use crate::models::Sample;
use crate::storage::SampleStore;
use crate::utils::SampleClock;

/// Decode → timestamp → append for one notification payload
pub struct SamplePipeline<S> {
    sink: Arc<S>,
    clock: SampleClock,
}

impl<S: SampleStore> SamplePipeline<S> {
    pub fn new(sink: Arc<S>) -> Self {
        SamplePipeline {
            sink,
            clock: SampleClock::new(),
        }
    }

    /// Decode `payload` and persist the sample. Nothing is written for a
    /// malformed payload.
    pub async fn process(&self, payload: &[u8]) -> Result<Sample, PipelineError> {
        let (x, y, z) = decode_sample(payload)?;
        let sample = Sample {
            timestamp: self.clock.now_millis(),
            x,
            y,
            z,
        };
        self.sink.append(&sample).await?;
        Ok(sample)
    }
}

/// Routes each platform event to exactly one handler
pub struct EventDispatcher<P, S> {
    connections: Rc<ConnectionManager<P>>,
    pipeline: SamplePipeline<S>,
}

impl<P, S> EventDispatcher<P, S>
where
    P: BlePlatform + 'static,
    S: SampleStore + 'static,
{
    pub fn new(connections: Rc<ConnectionManager<P>>, sink: Arc<S>) -> Self {
        EventDispatcher {
            connections,
            pipeline: SamplePipeline::new(sink),
        }
    }

    pub async fn dispatch(&self, event: PlatformEvent) {
        match event {
            PlatformEvent::Discover(discovered) => {
                self.connections.on_discovered(discovered);
            }
            PlatformEvent::StopScan => self.connections.on_stop_scan(),
            PlatformEvent::Disconnect { id } => self.connections.on_disconnected(&id),
            PlatformEvent::CharacteristicUpdate {
                id,
                characteristic,
                value,
            } => {
                if characteristic != ACCELEROMETER_DATA_UUID {
                    debug!("Ignoring update from {} characteristic {}", id, characteristic);
                    return;
                }
                match self.pipeline.process(&value).await {
                    Ok(sample) => debug!(
                        "Received data from {} characteristic {} {},{},{}",
                        id, characteristic, sample.x, sample.y, sample.z
                    ),
                    Err(PipelineError::Decode(e)) => {
                        error!("Error decoding notification from {}: {}", id, e)
                    }
                    Err(PipelineError::Sink(e)) => error!("Dropped sample from {}: {}", id, e),
                }
            }
        }
    }

    /// Start handling events from `events` until the returned guard is released
    ///
    /// Each event runs as its own task on the current `LocalSet`, so a handler
    /// suspended on the sink does not hold back later events. Must be called
    /// from within a `LocalSet`.
    pub fn listen(self: Rc<Self>, events: mpsc::UnboundedReceiver<PlatformEvent>) -> ListenerGuard {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::task::spawn_local(self.run(events, shutdown_rx));
        info!("Listening for bluetooth events");

        ListenerGuard {
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }

    async fn run(
        self: Rc<Self>,
        mut events: mpsc::UnboundedReceiver<PlatformEvent>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let mut handlers = JoinSet::new();

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                event = events.recv() => match event {
                    Some(event) => {
                        debug!("Dispatching {:?} event", event.kind());
                        let dispatcher = Rc::clone(&self);
                        handlers.spawn_local(async move { dispatcher.dispatch(event).await });
                    }
                    None => {
                        info!("Bluetooth event channel closed");
                        break;
                    }
                },
                Some(finished) = handlers.join_next(), if !handlers.is_empty() => {
                    if let Err(e) = finished {
                        error!("Event handler failed: {}", e);
                    }
                }
            }
        }

        // Let in-flight writes land before the listeners go away
        while let Some(finished) = handlers.join_next().await {
            if let Err(e) = finished {
                error!("Event handler failed: {}", e);
            }
        }
        info!("Stopped listening for bluetooth events");
    }
}

/// Registration of all event listeners, released together
///
/// `release` stops the listener after pending handlers finish; dropping the
/// guard without releasing aborts it.
pub struct ListenerGuard {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ListenerGuard {
    pub async fn release(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Event listener ended abnormally: {}", e);
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.task.as_ref().map_or(false, |task| !task.is_finished())
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::platform::mock::MockPlatform;
    use crate::bluetooth::platform::{DiscoveredPeripheral, SystemBusPermission};
    use crate::bluetooth::connection::ConnectionSettings;
    use crate::error::SinkError;
    use crate::registry::PeripheralRegistry;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use tokio::task::LocalSet;

    #[derive(Default)]
    struct RecordingSink {
        samples: Mutex<Vec<Sample>>,
        fail: AtomicBool,
    }

    impl SampleStore for RecordingSink {
        async fn append(&self, sample: &Sample) -> Result<(), SinkError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(SinkError::Io {
                    path: "accelerometer.csv".to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::Other, "storage unavailable"),
                });
            }
            self.samples.lock().unwrap().push(*sample);
            Ok(())
        }
    }

    fn dispatcher(sink: Arc<RecordingSink>) -> Rc<EventDispatcher<MockPlatform, RecordingSink>> {
        let connections = Rc::new(ConnectionManager::new(
            Arc::new(MockPlatform::default()),
            PeripheralRegistry::new(),
            Arc::new(SystemBusPermission),
            ConnectionSettings::default(),
        ));
        Rc::new(EventDispatcher::new(connections, sink))
    }

    fn update(value: Vec<u8>) -> PlatformEvent {
        PlatformEvent::CharacteristicUpdate {
            id: "P1".to_string(),
            characteristic: ACCELEROMETER_DATA_UUID,
            value,
        }
    }

    #[tokio::test]
    async fn notification_is_decoded_and_appended() {
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = dispatcher(sink.clone());

        dispatcher
            .dispatch(update(vec![0x00, 0x10, 0x00, 0x20, 0x00, 0x30]))
            .await;

        let samples = sink.samples.lock().unwrap();
        assert_eq!(samples.len(), 1);
        let line = samples[0].to_csv_line();
        assert_eq!(
            line,
            format!("{},4.096,8.192,12.288\n", samples[0].timestamp)
        );
    }

    #[tokio::test]
    async fn malformed_payload_writes_nothing() {
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = dispatcher(sink.clone());

        dispatcher.dispatch(update(vec![1, 2, 3, 4, 5])).await;
        assert_eq!(sink.samples.lock().unwrap().len(), 0);

        // Pipeline keeps going after the bad payload
        dispatcher.dispatch(update(vec![0; 6])).await;
        assert_eq!(sink.samples.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn pipeline_reports_each_failure_kind() {
        let pipeline = SamplePipeline::new(Arc::new(RecordingSink::default()));
        assert!(matches!(
            pipeline.process(&[0; 5]).await,
            Err(PipelineError::Decode(_))
        ));

        let failing = SamplePipeline::new(Arc::new(RecordingSink {
            fail: AtomicBool::new(true),
            ..Default::default()
        }));
        assert!(matches!(
            failing.process(&[0; 6]).await,
            Err(PipelineError::Sink(_))
        ));
    }

    #[tokio::test]
    async fn sink_failure_does_not_stop_later_events() {
        LocalSet::new()
            .run_until(async {
                let sink = Arc::new(RecordingSink {
                    fail: AtomicBool::new(true),
                    ..Default::default()
                });
                let dispatcher = dispatcher(sink.clone());
                let connections = Rc::clone(&dispatcher.connections);
                let (tx, rx) = mpsc::unbounded_channel();
                let guard = Rc::clone(&dispatcher).listen(rx);

                tx.send(update(vec![0; 6])).unwrap();
                tx.send(PlatformEvent::Discover(DiscoveredPeripheral {
                    id: "P1".to_string(),
                    name: Some("micro:bit".to_string()),
                    rssi: Some(-42),
                }))
                .unwrap();
                while connections.registry().get("P1").is_none() {
                    tokio::task::yield_now().await;
                }
                assert!(guard.is_active());
                assert!(sink.samples.lock().unwrap().is_empty());

                // Storage is back; the next notification is logged
                sink.fail.store(false, Ordering::SeqCst);
                tx.send(update(vec![0x00, 0x10, 0x00, 0x20, 0x00, 0x30]))
                    .unwrap();
                while sink.samples.lock().unwrap().is_empty() {
                    tokio::task::yield_now().await;
                }
                guard.release().await;

                let samples = sink.samples.lock().unwrap();
                assert_eq!(samples.len(), 1);
                assert_eq!(samples[0].x, 4.096);
            })
            .await;
    }

    #[tokio::test]
    async fn other_characteristics_are_ignored() {
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = dispatcher(sink.clone());

        dispatcher
            .dispatch(PlatformEvent::CharacteristicUpdate {
                id: "P1".to_string(),
                characteristic: bluer::Uuid::nil(),
                value: vec![0; 6],
            })
            .await;
        assert!(sink.samples.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn listener_routes_until_released() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let sink = Arc::new(RecordingSink::default());
                let dispatcher = dispatcher(sink.clone());
                let connections = Rc::clone(&dispatcher.connections);
                let (tx, rx) = mpsc::unbounded_channel();

                let guard = Rc::clone(&dispatcher).listen(rx);
                assert!(guard.is_active());

                tx.send(PlatformEvent::Discover(DiscoveredPeripheral {
                    id: "P1".to_string(),
                    name: None,
                    rssi: Some(-42),
                }))
                .unwrap();
                for i in 0..10u8 {
                    tx.send(update(vec![i, 0, 0, 0, 0, 0])).unwrap();
                }
                tx.send(PlatformEvent::StopScan).unwrap();

                while sink.samples.lock().unwrap().len() < 10 {
                    tokio::task::yield_now().await;
                }
                guard.release().await;

                assert_eq!(connections.registry().get("P1").unwrap().rssi, -42);
                let samples = sink.samples.lock().unwrap();
                assert!(samples
                    .windows(2)
                    .all(|pair| pair[0].timestamp <= pair[1].timestamp));

                // Nothing is listening any more
                assert!(tx.send(PlatformEvent::StopScan).is_err());
            })
            .await;
    }
}
