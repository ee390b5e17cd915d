//! macOS bridge — IOHIDManager matching/removal callbacks on the worker's
//! run loop.
//!
//! One manager is opened lazily (by the first enumeration or by
//! `subscribe`) and kept for the bridge's lifetime, so the `IOHIDDeviceRef`
//! used as the platform handle stays the same across enumerations and
//! notifications. Callbacks only fire while `wait` runs the run loop; they
//! queue their changes thread-locally and `wait` applies them to the sink.

use std::cell::RefCell;
use std::ffi::c_void;
use std::ptr;
use std::time::Duration;

use core_foundation::base::TCFType;
use core_foundation::number::CFNumber;
use core_foundation::runloop::{CFRunLoop, CFRunLoopRunResult, kCFRunLoopDefaultMode};
use core_foundation::string::CFString;
use core_foundation_sys::base::{
    CFAllocatorRef, CFGetTypeID, CFRelease, CFTypeRef, kCFAllocatorDefault,
};
use core_foundation_sys::dictionary::CFDictionaryRef;
use core_foundation_sys::number::CFNumberGetTypeID;
use core_foundation_sys::runloop::{CFRunLoopRef, CFRunLoopStop};
use core_foundation_sys::set::{CFSetGetCount, CFSetGetValues, CFSetRef};
use core_foundation_sys::string::{CFStringGetTypeID, CFStringRef};

use super::{EventSink, HotplugBridge, Wake, not_subscribed};
use crate::device::{DeviceDescriptor, PlatformHandle, VendorFilter};
use crate::error::{MonitorError, Result};
use crate::signal::ShutdownSignal;

type IOReturn = i32;
type IOHIDManagerRef = *mut c_void;
type IOHIDDeviceRef = *mut c_void;
type IOHIDDeviceCallback =
    unsafe extern "C" fn(context: *mut c_void, result: IOReturn, sender: *mut c_void, device: IOHIDDeviceRef);

const IO_RETURN_SUCCESS: IOReturn = 0;
const IO_HID_OPTIONS_NONE: u32 = 0;

#[link(name = "IOKit", kind = "framework")]
unsafe extern "C" {
    fn IOHIDManagerCreate(allocator: CFAllocatorRef, options: u32) -> IOHIDManagerRef;
    fn IOHIDManagerSetDeviceMatching(manager: IOHIDManagerRef, matching: CFDictionaryRef);
    fn IOHIDManagerOpen(manager: IOHIDManagerRef, options: u32) -> IOReturn;
    fn IOHIDManagerClose(manager: IOHIDManagerRef, options: u32) -> IOReturn;
    fn IOHIDManagerCopyDevices(manager: IOHIDManagerRef) -> CFSetRef;
    fn IOHIDManagerRegisterDeviceMatchingCallback(
        manager: IOHIDManagerRef,
        callback: Option<IOHIDDeviceCallback>,
        context: *mut c_void,
    );
    fn IOHIDManagerRegisterDeviceRemovalCallback(
        manager: IOHIDManagerRef,
        callback: Option<IOHIDDeviceCallback>,
        context: *mut c_void,
    );
    fn IOHIDManagerScheduleWithRunLoop(
        manager: IOHIDManagerRef,
        run_loop: CFRunLoopRef,
        mode: CFStringRef,
    );
    fn IOHIDManagerUnscheduleFromRunLoop(
        manager: IOHIDManagerRef,
        run_loop: CFRunLoopRef,
        mode: CFStringRef,
    );
    fn IOHIDDeviceGetProperty(device: IOHIDDeviceRef, key: CFStringRef) -> CFTypeRef;
}

enum Pending {
    Arrived(DeviceDescriptor),
    Removed(PlatformHandle),
}

thread_local! {
    static PENDING: RefCell<Vec<Pending>> = const { RefCell::new(Vec::new()) };
}

pub struct IoKitBridge {
    vendors: VendorFilter,
    manager: Option<IOHIDManagerRef>,
    run_loop: Option<CFRunLoop>,
    shutdown: Option<ShutdownSignal>,
}

// The manager is scheduled on the run loop of the worker thread that owns
// the bridge and is only touched from there.
unsafe impl Send for IoKitBridge {}

impl IoKitBridge {
    pub fn new(vendors: VendorFilter) -> Self {
        IoKitBridge {
            vendors,
            manager: None,
            run_loop: None,
            shutdown: None,
        }
    }

    fn manager(&mut self) -> Result<IOHIDManagerRef> {
        if let Some(manager) = self.manager {
            return Ok(manager);
        }
        // SAFETY: a NULL matching dictionary matches every HID device.
        unsafe {
            let manager = IOHIDManagerCreate(kCFAllocatorDefault, IO_HID_OPTIONS_NONE);
            if manager.is_null() {
                return Err(MonitorError::Platform("IOHIDManagerCreate returned NULL".into()));
            }
            IOHIDManagerSetDeviceMatching(manager, ptr::null());
            let ret = IOHIDManagerOpen(manager, IO_HID_OPTIONS_NONE);
            if ret != IO_RETURN_SUCCESS {
                CFRelease(manager as CFTypeRef);
                return Err(MonitorError::Platform(format!(
                    "IOHIDManagerOpen failed: 0x{:08x}",
                    ret as u32
                )));
            }
            self.manager = Some(manager);
            Ok(manager)
        }
    }

    fn release(&mut self) {
        if let Some(manager) = self.manager.take() {
            // SAFETY: manager was created and opened by `manager()`.
            unsafe {
                let _ = IOHIDManagerClose(manager, IO_HID_OPTIONS_NONE);
                CFRelease(manager as CFTypeRef);
            }
        }
    }
}

impl Drop for IoKitBridge {
    fn drop(&mut self) {
        self.unsubscribe();
        self.release();
    }
}

impl HotplugBridge for IoKitBridge {
    fn name(&self) -> &'static str {
        "iokit"
    }

    fn enumerate_now(&mut self) -> Result<Vec<DeviceDescriptor>> {
        let manager = self
            .manager()
            .map_err(|e| MonitorError::Enumeration(e.to_string()))?;
        // SAFETY: the copied set is released below; device refs stay owned by
        // the manager.
        let devices = unsafe {
            let set = IOHIDManagerCopyDevices(manager);
            if set.is_null() {
                return Ok(Vec::new());
            }
            let count = CFSetGetCount(set) as usize;
            let mut refs: Vec<*const c_void> = vec![ptr::null(); count];
            CFSetGetValues(set, refs.as_mut_ptr());
            CFRelease(set as CFTypeRef);
            refs
        };

        Ok(devices
            .into_iter()
            .map(|d| describe(d as IOHIDDeviceRef))
            .filter(|desc| self.vendors.accepts(desc.vendor_id))
            .collect())
    }

    fn subscribe(&mut self, shutdown: &ShutdownSignal) -> Result<()> {
        let manager = self
            .manager()
            .map_err(|e| MonitorError::Subscription(e.to_string()))?;
        let run_loop = CFRunLoop::get_current();
        // SAFETY: callbacks are plain functions with no context; the manager is
        // unscheduled in `unsubscribe` before the run loop's thread goes away.
        unsafe {
            IOHIDManagerRegisterDeviceMatchingCallback(manager, Some(on_matched), ptr::null_mut());
            IOHIDManagerRegisterDeviceRemovalCallback(manager, Some(on_removed), ptr::null_mut());
            IOHIDManagerScheduleWithRunLoop(
                manager,
                run_loop.as_concrete_TypeRef(),
                kCFRunLoopDefaultMode,
            );
        }

        let raw = run_loop.as_concrete_TypeRef() as usize;
        shutdown.set_waker(move || {
            // SAFETY: CFRunLoopStop may be called from any thread; the run loop
            // is retained by the bridge until the waker is cleared.
            unsafe { CFRunLoopStop(raw as CFRunLoopRef) };
        });

        self.run_loop = Some(run_loop);
        self.shutdown = Some(shutdown.clone());
        Ok(())
    }

    fn wait(&mut self, sink: &EventSink, timeout: Duration) -> Result<Wake> {
        if self.run_loop.is_none() {
            return Err(not_subscribed(self.name()));
        }
        if self.shutdown.as_ref().is_some_and(ShutdownSignal::is_raised) {
            return Ok(Wake::Shutdown);
        }
        // SAFETY: the default mode string is a process-lifetime constant.
        let result = CFRunLoop::run_in_mode(
            unsafe { kCFRunLoopDefaultMode },
            timeout,
            true,
        );

        let pending = PENDING.with(|p| std::mem::take(&mut *p.borrow_mut()));
        let had_events = !pending.is_empty();
        for change in pending {
            match change {
                Pending::Arrived(desc) => {
                    if self.vendors.accepts(desc.vendor_id) {
                        sink.arrived(desc);
                    }
                }
                Pending::Removed(handle) => {
                    sink.departed_handle(&handle);
                }
            }
        }

        Ok(match result {
            CFRunLoopRunResult::Stopped => Wake::Shutdown,
            CFRunLoopRunResult::TimedOut if !had_events => Wake::Timeout,
            _ => Wake::Events,
        })
    }

    fn unsubscribe(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            shutdown.clear_waker();
        }
        if let (Some(manager), Some(run_loop)) = (self.manager, self.run_loop.take()) {
            // SAFETY: undoes the registration made in `subscribe`.
            unsafe {
                IOHIDManagerUnscheduleFromRunLoop(
                    manager,
                    run_loop.as_concrete_TypeRef(),
                    kCFRunLoopDefaultMode,
                );
                IOHIDManagerRegisterDeviceMatchingCallback(manager, None, ptr::null_mut());
                IOHIDManagerRegisterDeviceRemovalCallback(manager, None, ptr::null_mut());
            }
        }
        PENDING.with(|p| p.borrow_mut().clear());
    }
}

unsafe extern "C" fn on_matched(
    _context: *mut c_void,
    _result: IOReturn,
    _sender: *mut c_void,
    device: IOHIDDeviceRef,
) {
    if device.is_null() {
        return;
    }
    let desc = describe(device);
    PENDING.with(|p| p.borrow_mut().push(Pending::Arrived(desc)));
}

unsafe extern "C" fn on_removed(
    _context: *mut c_void,
    _result: IOReturn,
    _sender: *mut c_void,
    device: IOHIDDeviceRef,
) {
    if device.is_null() {
        return;
    }
    PENDING.with(|p| p.borrow_mut().push(Pending::Removed(handle_of(device))));
}

fn handle_of(device: IOHIDDeviceRef) -> PlatformHandle {
    PlatformHandle::Opaque(device as usize as u64)
}

fn describe(device: IOHIDDeviceRef) -> DeviceDescriptor {
    let number = |key: &'static str| number_property(device, key).unwrap_or(0) as u16;
    let string = |key: &'static str| string_property(device, key).unwrap_or_default();
    DeviceDescriptor {
        serial_number: string("SerialNumber"),
        manufacturer: string("Manufacturer"),
        product: string("Product"),
        usage_page: number("PrimaryUsagePage"),
        usage: number("PrimaryUsage"),
        vendor_id: number("VendorID"),
        product_id: number("ProductID"),
        firmware_version: number("VersionNumber"),
        handle: handle_of(device),
    }
}

fn property(device: IOHIDDeviceRef, key: &'static str) -> CFTypeRef {
    let key = CFString::from_static_string(key);
    // SAFETY: get-rule lookup; the returned reference is not owned.
    unsafe { IOHIDDeviceGetProperty(device, key.as_concrete_TypeRef()) }
}

fn number_property(device: IOHIDDeviceRef, key: &'static str) -> Option<i64> {
    let value = property(device, key);
    // SAFETY: type is checked before wrapping; get rule retains.
    unsafe {
        if value.is_null() || CFGetTypeID(value) != CFNumberGetTypeID() {
            return None;
        }
        CFNumber::wrap_under_get_rule(value as _).to_i64()
    }
}

fn string_property(device: IOHIDDeviceRef, key: &'static str) -> Option<String> {
    let value = property(device, key);
    // SAFETY: type is checked before wrapping; get rule retains.
    unsafe {
        if value.is_null() || CFGetTypeID(value) != CFStringGetTypeID() {
            return None;
        }
        Some(CFString::wrap_under_get_rule(value as CFStringRef).to_string().trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_before_subscribe_is_an_error() {
        use crate::dispatch::Dispatcher;
        use crate::table::DeviceTable;
        use std::sync::Arc;

        let dispatcher = Dispatcher::spawn(4).unwrap();
        let sink = EventSink::new(Arc::new(DeviceTable::new()), dispatcher.publisher());
        let mut bridge = IoKitBridge::new(VendorFilter::any());
        assert!(bridge.wait(&sink, Duration::from_millis(1)).is_err());
    }

    #[test]
    fn opaque_handle_is_the_device_pointer() {
        let fake = 0x1000usize as IOHIDDeviceRef;
        assert_eq!(handle_of(fake), PlatformHandle::Opaque(0x1000));
    }
}
