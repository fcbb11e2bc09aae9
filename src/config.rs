use bluer::Uuid;
use log::{debug, info};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::bluetooth::connection::ConnectionSettings;

pub const LOG_FILE_NAME: &str = "accelerometer.csv";

#[derive(Debug, Clone)]
pub struct LoggerConfig {
    pub log_path: PathBuf,
    pub connection: ConnectionSettings,
    /// Peripheral id or advertised name to connect to after each scan
    pub target: Option<String>,
}

impl LoggerConfig {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        // Load environment variables
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from any key → value source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, Box<dyn std::error::Error>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let log_path = match read("ACCEL_LOG_PATH") {
            Some(path) => PathBuf::from(path),
            None => default_log_path(),
        };

        let mut connection = ConnectionSettings::default();

        if let Some(value) = read("SCAN_DURATION_SECS") {
            let secs: u64 = value.parse().map_err(|_| {
                format!("SCAN_DURATION_SECS must be a whole number of seconds, got '{}'", value)
            })?;
            if secs == 0 {
                return Err("SCAN_DURATION_SECS must be at least 1".into());
            }
            connection.scan_duration = Duration::from_secs(secs);
        }

        if let Some(value) = read("SCAN_SERVICE_UUIDS") {
            for uuid in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                let parsed: Uuid = uuid
                    .parse()
                    .map_err(|_| format!("Invalid service UUID in SCAN_SERVICE_UUIDS: '{}'", uuid))?;
                connection.service_filters.push(parsed);
            }
        }

        if let Some(value) = read("SCAN_ALLOW_DUPLICATES") {
            connection.allow_duplicates = parse_bool(&value).ok_or_else(|| {
                format!("SCAN_ALLOW_DUPLICATES must be true or false, got '{}'", value)
            })?;
        }

        if let Some(value) = read("CONNECT_TIMEOUT_SECS") {
            let secs: u64 = value.parse().map_err(|_| {
                format!("CONNECT_TIMEOUT_SECS must be a whole number of seconds, got '{}'", value)
            })?;
            // 0 keeps the default of waiting indefinitely
            connection.connect_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }

        let target = read("TARGET_PERIPHERAL");

        info!("Sample log: {}", log_path.display());
        debug!("Connection settings: {:?}", connection);
        if let Some(target) = &target {
            info!("Target peripheral: {}", target);
        }

        Ok(LoggerConfig {
            log_path,
            connection,
            target,
        })
    }
}

/// `<documents>/accelerometer.csv`, or the working directory when the
/// platform has no documents folder
pub fn default_log_path() -> PathBuf {
    dirs::document_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(LOG_FILE_NAME)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
