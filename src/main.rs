use log::{error, info, warn};
use std::sync::Arc;
use tokio::task::LocalSet;
use tokio::time::{sleep, Duration};

use ble_accel_logger::bluetooth::platform::SystemBusPermission;
use ble_accel_logger::bluetooth::{BlePlatform, BluezPlatform};
use ble_accel_logger::config::LoggerConfig;
use ble_accel_logger::session::Session;
use ble_accel_logger::storage::{CsvSampleSink, SampleStore};

const RESCAN_DELAY_SECS: u64 = 10;
const STATUS_INTERVAL_SECS: u64 = 30;

async fn main_loop<P, S>(
    session: &Session<P, S>,
    target: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>>
where
    P: BlePlatform + 'static,
    S: SampleStore + 'static,
{
    info!("Starting accelerometer logging service");

    loop {
        if let Err(e) = session.start_scan().await {
            error!("Scan failed: {}", e);
            sleep(Duration::from_secs(RESCAN_DELAY_SECS)).await;
            continue;
        }
        session.wait_scan_complete().await;

        let peripherals = session.snapshot();
        info!("{} peripherals discovered", peripherals.len());
        for p in &peripherals {
            info!(
                "  {} {} RSSI: {}{}",
                p.id,
                p.name,
                p.rssi,
                if p.connected { " (connected)" } else { "" }
            );
        }

        if let Some(target) = target {
            match session.find(target) {
                Some(p) if !p.connected && !p.connecting => {
                    // Failures are logged by the state machine; try again next scan
                    if session.toggle_connection(&p.id).await.is_err() {
                        warn!("Will retry {} after the next scan", p.id);
                    }
                }
                Some(_) => {}
                None => warn!("Target peripheral {} not seen in this scan", target),
            }
        }

        // Stream while the current peripheral stays connected
        while let Some(current) = session.current_peripheral().filter(|p| p.connected) {
            info!("Streaming from {} ({})", current.id, current.name);
            sleep(Duration::from_secs(STATUS_INTERVAL_SECS)).await;
        }

        sleep(Duration::from_secs(RESCAN_DELAY_SECS)).await;
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    // Load configuration
    let config = match LoggerConfig::new() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e);
        }
    };

    let sink = match CsvSampleSink::open(&config.log_path).await {
        Ok(sink) => Arc::new(sink),
        Err(e) => {
            error!("Failed to open sample log: {}", e);
            return Err(e.into());
        }
    };

    let (platform, events) = BluezPlatform::new().await?;

    // All handlers share one cooperative event loop
    let local = LocalSet::new();
    local
        .run_until(async move {
            let session = Session::start(
                Arc::new(platform),
                sink,
                Arc::new(SystemBusPermission),
                config.connection.clone(),
                events,
            );

            // Run main loop or wait for shutdown signal
            tokio::select! {
                result = main_loop(&session, config.target.as_deref()) => {
                    if let Err(e) = result {
                        error!("Fatal error: {}", e);
                    }
                }
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => info!("Program terminated by user. Exiting gracefully."),
                        Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
                    }
                }
            }

            session.end().await;
        })
        .await;

    Ok(())
}
