//! hidmon — hot-plug monitor and device table for OpenPilot USB HID boards.
//!
//! A [`DeviceMonitor`] keeps a table of attached HID devices up to date from
//! the operating system's hot-plug notifications and fans table changes out
//! to subscribers on a dedicated thread.

pub mod bridge;
pub mod config;
pub mod device;
mod dispatch;
pub mod error;
pub mod hooks;
pub mod models;
pub mod monitor;
pub mod signal;
pub mod table;

pub use device::{DeviceDescriptor, DeviceFilter, DeviceIdentity, PlatformHandle, VendorFilter};
pub use dispatch::SubscriptionId;
pub use error::MonitorError;
pub use models::RunState;
pub use monitor::{BridgeStatus, DeviceMonitor, MonitorOptions};
pub use table::DeviceEvent;
