pub mod bluez;
pub mod connection;
pub mod dispatcher;
pub mod platform;
pub mod protocol;
pub mod scanner;

pub use bluez::BluezPlatform;
pub use connection::{ConnectionManager, ConnectionSettings};
pub use dispatcher::{EventDispatcher, ListenerGuard, SamplePipeline};
pub use platform::{BlePlatform, DiscoveredPeripheral, PermissionGate, PlatformEvent};
