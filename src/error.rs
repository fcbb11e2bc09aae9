/// Error types shared across the BLE pipeline
use thiserror::Error;

/// Failure reported by the BLE platform collaborator.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("bluetooth error: {0}")]
    Bluetooth(#[from] bluer::Error),

    #[error("invalid peripheral address '{0}'")]
    InvalidAddress(String),

    #[error("service {service} not found on {id}")]
    ServiceNotFound { id: String, service: bluer::Uuid },

    #[error("characteristic {characteristic} not found on {id}")]
    CharacteristicNotFound {
        id: String,
        characteristic: bluer::Uuid,
    },

    #[error("peripheral {0} is not connected")]
    NotConnected(String),

    #[error("request rejected: {0}")]
    Rejected(String),
}

/// Notification payload could not be decoded into a sample.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed payload: expected 6 bytes, got {len}")]
    MalformedPayload { len: usize },
}

/// Connect, service discovery, subscription or disconnect failed.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connect to {id} failed: {source}")]
    Connect { id: String, source: PlatformError },

    #[error("connect to {id} timed out after {after:?}")]
    Timeout { id: String, after: std::time::Duration },

    #[error("service discovery on {id} failed: {source}")]
    ServiceDiscovery { id: String, source: PlatformError },

    #[error("notification subscription on {id} failed: {source}")]
    Subscribe { id: String, source: PlatformError },

    #[error("disconnect from {id} failed: {source}")]
    Disconnect { id: String, source: PlatformError },

    #[error("{id} disconnected while the connect was in flight")]
    DroppedDuringConnect { id: String },
}

/// Durable sample log could not be written.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sample log {path} unavailable: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

/// A scan request could not be started.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("scan refused: bluetooth scan permission denied")]
    PermissionDenied,

    #[error("scan failed: {0}")]
    Platform(#[from] PlatformError),
}

/// Failure anywhere in the notification → sample → log path.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Sink(#[from] SinkError),
}
