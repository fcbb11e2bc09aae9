//! Streams accelerometer notifications from a BLE peripheral into a CSV log.

pub mod bluetooth;
pub mod config;
pub mod error;
pub mod models;
pub mod registry;
pub mod session;
pub mod storage;
pub mod utils;
