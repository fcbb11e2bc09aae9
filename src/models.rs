/// Data types observed by the registry and the sample pipeline
use std::fmt;

/// Display name used when a peripheral does not advertise one
pub const DEFAULT_PERIPHERAL_NAME: &str = "NO NAME";

#[derive(Debug, Clone, PartialEq)]
pub struct Peripheral {
    pub id: String,
    pub name: String,
    pub rssi: i16,
    pub connecting: bool,
    pub connected: bool,
}

impl Peripheral {
    /// A freshly discovered peripheral: sentinel name, no signal reading, idle.
    pub fn new(id: &str) -> Self {
        Peripheral {
            id: id.to_string(),
            name: DEFAULT_PERIPHERAL_NAME.to_string(),
            rssi: 0,
            connecting: false,
            connected: false,
        }
    }

    pub fn has_default_name(&self) -> bool {
        self.name == DEFAULT_PERIPHERAL_NAME
    }
}

/// One decoded accelerometer reading
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Milliseconds since the Unix epoch at decode time
    pub timestamp: i64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Sample {
    /// Render as one log record, `timestamp,x,y,z` with trailing newline.
    pub fn to_csv_line(&self) -> String {
        format!("{}\n", self)
    }
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{},{}", self.timestamp, self.x, self.y, self.z)
    }
}
