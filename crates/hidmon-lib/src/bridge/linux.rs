//! Linux bridge — udev enumeration plus a udev monitor socket on `hidraw`.
//!
//! Each hidraw node is one HID interface. Vendor/product IDs come from the
//! parent `hid` device's `HID_ID`, usage from its report descriptor, and the
//! strings and bcdDevice from the parent `usb_device` when there is one
//! (Bluetooth and virtual HID devices have none). The device node path is
//! the platform handle.
//!
//! The worker blocks in `poll(2)` on the monitor socket and one end of a
//! socket pair; the shutdown waker writes to the other end.

use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use super::{EventSink, HotplugBridge, Wake, not_subscribed, report};
use crate::device::{DeviceDescriptor, PlatformHandle, VendorFilter};
use crate::error::{MonitorError, Result};
use crate::signal::ShutdownSignal;

const SUBSYSTEM: &str = "hidraw";

pub struct UdevBridge {
    vendors: VendorFilter,
    socket: Option<udev::MonitorSocket>,
    wake_rx: Option<UnixStream>,
    shutdown: Option<ShutdownSignal>,
}

// libudev handles are not thread-safe, but the monitor socket is created in
// `subscribe` and only ever touched from the worker thread that owns the bridge.
unsafe impl Send for UdevBridge {}

impl UdevBridge {
    pub fn new(vendors: VendorFilter) -> Self {
        UdevBridge {
            vendors,
            socket: None,
            wake_rx: None,
            shutdown: None,
        }
    }

    fn apply(&self, event: udev::Event, sink: &EventSink) {
        match event.event_type() {
            udev::EventType::Add | udev::EventType::Change => {
                let device = event.device();
                match describe(&device) {
                    Some(desc) if self.vendors.accepts(desc.vendor_id) => {
                        sink.arrived(desc);
                    }
                    Some(_) => {}
                    None => log::debug!(
                        "[udev] could not resolve {}",
                        device.syspath().display()
                    ),
                }
            }
            udev::EventType::Remove => {
                let n = sink.departed_handle(&handle_of(&event.device()));
                log::debug!("[udev] remove: {n} table entr{}", if n == 1 { "y" } else { "ies" });
            }
            _ => {}
        }
    }
}

impl HotplugBridge for UdevBridge {
    fn name(&self) -> &'static str {
        "udev"
    }

    fn enumerate_now(&mut self) -> Result<Vec<DeviceDescriptor>> {
        let mut enumerator = udev::Enumerator::new()
            .map_err(|e| MonitorError::Enumeration(format!("udev context: {e}")))?;
        enumerator
            .match_subsystem(SUBSYSTEM)
            .map_err(|e| MonitorError::Enumeration(format!("udev filter: {e}")))?;
        let devices = enumerator
            .scan_devices()
            .map_err(|e| MonitorError::Enumeration(format!("udev scan: {e}")))?;

        let mut found = Vec::new();
        for device in devices {
            match describe(&device) {
                Some(desc) if self.vendors.accepts(desc.vendor_id) => found.push(desc),
                Some(_) => {}
                None => log::warn!(
                    "[udev] skipping {}: could not read HID identity",
                    device.syspath().display()
                ),
            }
        }
        Ok(found)
    }

    fn subscribe(&mut self, shutdown: &ShutdownSignal) -> Result<()> {
        let socket = udev::MonitorBuilder::new()
            .and_then(|b| b.match_subsystem(SUBSYSTEM))
            .and_then(|b| b.listen())
            .map_err(|e| MonitorError::Subscription(format!("udev monitor: {e}")))?;

        let (wake_rx, wake_tx) = UnixStream::pair()?;
        wake_rx.set_nonblocking(true)?;
        wake_tx.set_nonblocking(true)?;
        shutdown.set_waker(move || {
            let _ = (&wake_tx).write(&[1]);
        });

        self.socket = Some(socket);
        self.wake_rx = Some(wake_rx);
        self.shutdown = Some(shutdown.clone());
        Ok(())
    }

    fn wait(&mut self, sink: &EventSink, timeout: Duration) -> Result<Wake> {
        let (Some(socket), Some(wake_rx)) = (&self.socket, &self.wake_rx) else {
            return Err(not_subscribed(self.name()));
        };
        let mut fds = [
            libc::pollfd {
                fd: socket.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: wake_rx.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        let ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        // SAFETY: `fds` is a live array of two initialized pollfd structs.
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Wake::Timeout);
            }
            return Err(MonitorError::Io(err));
        }
        if rc == 0 {
            return Ok(Wake::Timeout);
        }
        if fds[1].revents != 0 {
            let mut buf = [0u8; 16];
            while matches!((&*wake_rx).read(&mut buf), Ok(n) if n > 0) {}
            return Ok(Wake::Shutdown);
        }
        if socket_readable(fds[0].revents)? {
            match socket.iter().next() {
                Some(event) => self.apply(event, sink),
                None => log::trace!("[udev] readable with no pending record"),
            }
        }
        Ok(Wake::Events)
    }

    fn unsubscribe(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            shutdown.clear_waker();
        }
        self.socket = None;
        self.wake_rx = None;
    }
}

/// Whether the monitor socket has a record to read. An error or hang-up
/// without data means the socket is dead and will keep waking `poll`.
fn socket_readable(revents: libc::c_short) -> Result<bool> {
    if revents & libc::POLLIN != 0 {
        return Ok(true);
    }
    if revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
        return Err(MonitorError::Subscription(format!(
            "udev monitor socket failed (revents {revents:#x})"
        )));
    }
    Ok(false)
}

fn handle_of(device: &udev::Device) -> PlatformHandle {
    let path = match device.devnode() {
        Some(node) => node.display().to_string(),
        None => format!("/dev/{}", device.sysname().to_string_lossy()),
    };
    PlatformHandle::Path(path)
}

/// Build a descriptor for a hidraw device. `None` if it has no HID parent
/// or no parseable `HID_ID`.
fn describe(device: &udev::Device) -> Option<DeviceDescriptor> {
    let hid = device.parent_with_subsystem("hid").ok().flatten()?;
    let hid_id = hid.property_value("HID_ID")?.to_string_lossy().into_owned();
    let (vendor_id, product_id) = parse_hid_id(&hid_id)?;

    let usb = device
        .parent_with_subsystem_devtype("usb", "usb_device")
        .ok()
        .flatten();
    let usb_attr = |name: &str| -> String {
        usb.as_ref()
            .and_then(|u| u.attribute_value(name))
            .map(|v| v.to_string_lossy().trim().to_string())
            .unwrap_or_default()
    };
    let hid_prop = |name: &str| -> String {
        hid.property_value(name)
            .map(|v| v.to_string_lossy().trim().to_string())
            .unwrap_or_default()
    };

    let (usage_page, usage) = std::fs::read(hid.syspath().join("report_descriptor"))
        .map(|d| report::primary_usage(&d))
        .unwrap_or((0, 0));

    let serial_number = match usb_attr("serial") {
        s if s.is_empty() => hid_prop("HID_UNIQ"),
        s => s,
    };
    let product = match usb_attr("product") {
        s if s.is_empty() => hid_prop("HID_NAME"),
        s => s,
    };

    Some(DeviceDescriptor {
        serial_number,
        manufacturer: usb_attr("manufacturer"),
        product,
        usage_page,
        usage,
        vendor_id,
        product_id,
        firmware_version: u16::from_str_radix(&usb_attr("bcdDevice"), 16).unwrap_or(0),
        handle: handle_of(device),
    })
}

/// Parse `HID_ID=BBBB:VVVVVVVV:PPPPPPPP` into (vendor, product).
fn parse_hid_id(value: &str) -> Option<(u16, u16)> {
    let mut parts = value.trim().split(':');
    let _bus = parts.next()?;
    let vendor = u32::from_str_radix(parts.next()?, 16).ok()?;
    let product = u32::from_str_radix(parts.next()?, 16).ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((vendor as u16, product as u16))
}
