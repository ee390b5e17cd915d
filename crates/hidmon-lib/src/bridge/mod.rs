//! Platform event bridges — turn OS hot-plug notifications into table changes.
//!
//! A bridge lives on the monitor's worker thread. The worker calls
//! [`HotplugBridge::enumerate_now`] once, then [`HotplugBridge::subscribe`],
//! then [`HotplugBridge::wait`] in a loop until shutdown, and finally
//! [`HotplugBridge::unsubscribe`]. Bridges report what they see through an
//! [`EventSink`], which updates the table and queues the fan-out.
//!
//! Exactly one implementation is compiled in as [`PlatformBridge`]:
//! udev on Linux, a message-only window on Windows, IOHIDManager on macOS.

use std::sync::Arc;
use std::time::Duration;

use crate::device::{DeviceDescriptor, DeviceIdentity, PlatformHandle, VendorFilter};
use crate::dispatch::Publisher;
use crate::error::{MonitorError, Result};
use crate::signal::ShutdownSignal;
use crate::table::DeviceTable;

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
mod report;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "macos")]
mod macos;
#[cfg(windows)]
mod windows;

#[doc(hidden)]
pub mod mock;

/// Why [`HotplugBridge::wait`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// At least one notification was processed (or a spurious wake-up).
    Events,
    /// The wait slice elapsed with nothing to do.
    Timeout,
    /// The shutdown signal interrupted the wait.
    Shutdown,
}

/// One OS hot-plug mechanism.
///
/// All methods are called from the monitor's worker thread, so an
/// implementation may keep thread-affine OS handles once `subscribe` runs.
pub trait HotplugBridge: Send {
    /// Short name used in logs and status output.
    fn name(&self) -> &'static str;

    /// Enumerate every currently attached device the bridge reports.
    ///
    /// Devices that cannot be read are skipped; only a failure to start the
    /// enumeration at all is an error.
    fn enumerate_now(&mut self) -> Result<Vec<DeviceDescriptor>>;

    /// Register for live notifications and hook `shutdown` so that raising
    /// it interrupts [`wait`](Self::wait).
    fn subscribe(&mut self, shutdown: &ShutdownSignal) -> Result<()>;

    /// Block for at most `timeout` on the platform wait primitive, applying
    /// any notifications to `sink`.
    fn wait(&mut self, sink: &EventSink, timeout: Duration) -> Result<Wake>;

    /// Stop notifications and release platform resources.
    fn unsubscribe(&mut self);
}

impl<B: HotplugBridge + ?Sized> HotplugBridge for Box<B> {
    fn name(&self) -> &'static str {
        (**self).name()
    }
    fn enumerate_now(&mut self) -> Result<Vec<DeviceDescriptor>> {
        (**self).enumerate_now()
    }
    fn subscribe(&mut self, shutdown: &ShutdownSignal) -> Result<()> {
        (**self).subscribe(shutdown)
    }
    fn wait(&mut self, sink: &EventSink, timeout: Duration) -> Result<Wake> {
        (**self).wait(sink, timeout)
    }
    fn unsubscribe(&mut self) {
        (**self).unsubscribe()
    }
}

/// Where bridges report arrivals and removals.
///
/// Each call runs the table mutation under the table lock, releases it, and
/// then queues the resulting change for fan-out. Cloneable so OS callback
/// threads can hold their own copy.
#[derive(Clone)]
pub struct EventSink {
    table: Arc<DeviceTable>,
    publisher: Publisher,
}

impl EventSink {
    pub(crate) fn new(table: Arc<DeviceTable>, publisher: Publisher) -> Self {
        EventSink { table, publisher }
    }

    /// A device appeared or was refreshed. Returns `true` if the table changed.
    pub fn arrived(&self, device: DeviceDescriptor) -> bool {
        let change = self.table.insert_or_update(device);
        match change {
            Some(change) => {
                self.publisher.publish(change);
                true
            }
            None => false,
        }
    }

    /// A device with this identity left. Unknown identities are ignored.
    pub fn departed(&self, identity: &DeviceIdentity) -> bool {
        let change = self.table.remove_by_identity(identity);
        match change {
            Some(change) => {
                self.publisher.publish(change);
                true
            }
            None => false,
        }
    }

    /// Every interface reached through `handle` left. Returns how many.
    pub fn departed_handle(&self, handle: &PlatformHandle) -> usize {
        let changes = self.table.remove_by_handle(handle);
        let n = changes.len();
        for change in changes {
            self.publisher.publish(change);
        }
        n
    }

    /// Replace the table contents with a full enumeration. Returns the
    /// number of changes queued.
    pub fn reconcile(&self, devices: Vec<DeviceDescriptor>) -> usize {
        let changes = self.table.reconcile(devices);
        let n = changes.len();
        for change in changes {
            self.publisher.publish(change);
        }
        n
    }
}

// ── Platform selection ──

#[cfg(target_os = "linux")]
pub type PlatformBridge = linux::UdevBridge;
#[cfg(windows)]
pub type PlatformBridge = windows::WindowMessageBridge;
#[cfg(target_os = "macos")]
pub type PlatformBridge = macos::IoKitBridge;
#[cfg(not(any(windows, target_os = "linux", target_os = "macos")))]
pub type PlatformBridge = StubBridge;

/// Bridge for the current target, reporting devices accepted by `vendors`.
pub fn platform_bridge(vendors: VendorFilter) -> PlatformBridge {
    PlatformBridge::new(vendors)
}

/// Bridge for targets without a hot-plug implementation.
///
/// Enumerates nothing and fails to subscribe, which leaves the monitor in
/// degraded mode with an empty table.
#[cfg(not(any(windows, target_os = "linux", target_os = "macos")))]
pub struct StubBridge;

#[cfg(not(any(windows, target_os = "linux", target_os = "macos")))]
impl StubBridge {
    pub fn new(_vendors: VendorFilter) -> Self {
        StubBridge
    }
}

#[cfg(not(any(windows, target_os = "linux", target_os = "macos")))]
impl HotplugBridge for StubBridge {
    fn name(&self) -> &'static str {
        "stub"
    }
    fn enumerate_now(&mut self) -> Result<Vec<DeviceDescriptor>> {
        Err(MonitorError::Unsupported("HID enumeration"))
    }
    fn subscribe(&mut self, _shutdown: &ShutdownSignal) -> Result<()> {
        Err(MonitorError::Unsupported("hot-plug notifications"))
    }
    fn wait(&mut self, _sink: &EventSink, _timeout: Duration) -> Result<Wake> {
        Err(MonitorError::Unsupported("hot-plug notifications"))
    }
    fn unsubscribe(&mut self) {}
}

/// Error for a bridge used before `subscribe` succeeded.
pub(crate) fn not_subscribed(bridge: &'static str) -> MonitorError {
    MonitorError::Platform(format!("{bridge} bridge used before subscribe"))
}
