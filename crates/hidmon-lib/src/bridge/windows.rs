//! Windows bridge — SetupDi enumeration plus a message-only window that
//! receives `WM_DEVICECHANGE` for the HID device-interface class.
//!
//! Broadcasts only carry the interface path. Arrivals are resolved to a
//! descriptor by opening the interface with zero access and querying the
//! HID class driver; if the device is already gone the arrival is dropped.
//! Removals are matched by path. Paths are lowercased because the casing in
//! broadcasts and in SetupDi results differs.

use std::cell::RefCell;
use std::ffi::c_void;
use std::mem;
use std::time::Duration;

use windows::Win32::Devices::DeviceAndDriverInstallation::*;
use windows::Win32::Devices::HumanInterfaceDevice::{
    HIDD_ATTRIBUTES, HIDP_CAPS, HidD_FreePreparsedData, HidD_GetAttributes,
    HidD_GetManufacturerString, HidD_GetPreparsedData, HidD_GetProductString,
    HidD_GetSerialNumberString, HidP_GetCaps, PHIDP_PREPARSED_DATA,
};
use windows::Win32::Foundation::{CloseHandle, HANDLE, HINSTANCE, HWND, LPARAM, LRESULT, WAIT_TIMEOUT, WPARAM};
use windows::Win32::Storage::FileSystem::{
    CreateFileW, FILE_FLAGS_AND_ATTRIBUTES, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows::Win32::System::LibraryLoader::GetModuleHandleW;
use windows::Win32::UI::WindowsAndMessaging::{
    CreateWindowExW, DEV_BROADCAST_DEVICEINTERFACE_W, DEV_BROADCAST_HDR,
    DEVICE_NOTIFY_WINDOW_HANDLE, DefWindowProcW, DestroyWindow, DispatchMessageW, HDEVNOTIFY,
    HWND_MESSAGE, MSG, MsgWaitForMultipleObjects, PM_REMOVE, PeekMessageW, PostMessageW,
    QS_ALLINPUT, RegisterClassW, RegisterDeviceNotificationW, TranslateMessage,
    UnregisterDeviceNotification, WINDOW_EX_STYLE, WINDOW_STYLE, WM_APP, WM_DEVICECHANGE,
    WNDCLASSW,
};
use windows::core::{GUID, PCWSTR, w};

use super::{EventSink, HotplugBridge, Wake, not_subscribed};
use crate::device::{DeviceDescriptor, PlatformHandle, VendorFilter};
use crate::error::{MonitorError, Result};
use crate::signal::ShutdownSignal;

/// GUID_DEVINTERFACE_HID
const HID_INTERFACE_GUID: GUID = GUID::from_u128(0x4d1e55b2_f16f_11cf_88cb_001111000030);

// dbt.h
const DBT_DEVICEARRIVAL: u32 = 0x8000;
const DBT_DEVICEREMOVECOMPLETE: u32 = 0x8004;
const DBT_DEVTYP_DEVICEINTERFACE: u32 = 0x0005;

/// Posted to the window by the shutdown waker.
const WM_HIDMON_STOP: u32 = WM_APP + 1;

const CLASS_NAME: PCWSTR = w!("HidmonNotificationSink");

/// Interface path plus direction, decoded in the window procedure.
struct InterfaceChange {
    arrived: bool,
    path: String,
}

thread_local! {
    // Filled by `wndproc` while `wait` pumps messages on the same thread.
    static PENDING: RefCell<Vec<InterfaceChange>> = const { RefCell::new(Vec::new()) };
}

pub struct WindowMessageBridge {
    vendors: VendorFilter,
    hwnd: Option<HWND>,
    notify: Option<HDEVNOTIFY>,
    shutdown: Option<ShutdownSignal>,
}

// The window and notification handle are created in `subscribe` and
// destroyed in `unsubscribe`, both on the worker thread that owns the bridge.
unsafe impl Send for WindowMessageBridge {}

impl WindowMessageBridge {
    pub fn new(vendors: VendorFilter) -> Self {
        WindowMessageBridge {
            vendors,
            hwnd: None,
            notify: None,
            shutdown: None,
        }
    }

    fn apply(&self, change: InterfaceChange, sink: &EventSink) {
        if change.arrived {
            match describe_path(&change.path) {
                Some(desc) if self.vendors.accepts(desc.vendor_id) => {
                    sink.arrived(desc);
                }
                Some(_) => {}
                None => log::debug!("[win32] could not resolve {}", change.path),
            }
        } else {
            sink.departed_handle(&PlatformHandle::Path(change.path));
        }
    }
}

impl HotplugBridge for WindowMessageBridge {
    fn name(&self) -> &'static str {
        "win32"
    }

    fn enumerate_now(&mut self) -> Result<Vec<DeviceDescriptor>> {
        let paths = enumerate_interface_paths()?;
        let mut found = Vec::new();
        for path in paths {
            match describe_path(&path) {
                Some(desc) if self.vendors.accepts(desc.vendor_id) => found.push(desc),
                Some(_) => {}
                None => log::warn!("[win32] skipping {path}: could not query HID attributes"),
            }
        }
        Ok(found)
    }

    fn subscribe(&mut self, shutdown: &ShutdownSignal) -> Result<()> {
        let subscription = |e: windows::core::Error| MonitorError::Subscription(e.to_string());

        // SAFETY: plain Win32 calls with locally owned, initialized arguments.
        unsafe {
            let module = GetModuleHandleW(None).map_err(subscription)?;
            let instance: HINSTANCE = module.into();
            let class = WNDCLASSW {
                lpfnWndProc: Some(wndproc),
                hInstance: instance,
                lpszClassName: CLASS_NAME,
                ..Default::default()
            };
            // Zero when a previous monitor in this process already registered it.
            if RegisterClassW(&class) == 0 {
                log::debug!("[win32] window class already registered");
            }

            let hwnd = CreateWindowExW(
                WINDOW_EX_STYLE::default(),
                CLASS_NAME,
                w!("hidmon"),
                WINDOW_STYLE::default(),
                0,
                0,
                0,
                0,
                Some(HWND_MESSAGE),
                None,
                Some(instance),
                None,
            )
            .map_err(subscription)?;

            let filter = DEV_BROADCAST_DEVICEINTERFACE_W {
                dbcc_size: mem::size_of::<DEV_BROADCAST_DEVICEINTERFACE_W>() as u32,
                dbcc_devicetype: DBT_DEVTYP_DEVICEINTERFACE,
                dbcc_classguid: HID_INTERFACE_GUID,
                ..Default::default()
            };
            let notify = match RegisterDeviceNotificationW(
                HANDLE(hwnd.0),
                &filter as *const _ as *const c_void,
                DEVICE_NOTIFY_WINDOW_HANDLE,
            ) {
                Ok(n) => n,
                Err(e) => {
                    let _ = DestroyWindow(hwnd);
                    return Err(subscription(e));
                }
            };

            let raw = hwnd.0 as usize;
            shutdown.set_waker(move || {
                // SAFETY: posting to a window that may already be destroyed
                // fails harmlessly.
                let _ = unsafe {
                    PostMessageW(
                        Some(HWND(raw as *mut c_void)),
                        WM_HIDMON_STOP,
                        WPARAM(0),
                        LPARAM(0),
                    )
                };
            });

            self.hwnd = Some(hwnd);
            self.notify = Some(notify);
        }
        self.shutdown = Some(shutdown.clone());
        Ok(())
    }

    fn wait(&mut self, sink: &EventSink, timeout: Duration) -> Result<Wake> {
        if self.hwnd.is_none() {
            return Err(not_subscribed(self.name()));
        }
        let ms = timeout.as_millis().min(u128::from(u32::MAX - 1)) as u32;
        let mut stop = false;
        // SAFETY: standard message pump on the thread that owns the window.
        unsafe {
            if MsgWaitForMultipleObjects(None, false, ms, QS_ALLINPUT) == WAIT_TIMEOUT {
                return Ok(Wake::Timeout);
            }
            let mut msg: MSG = mem::zeroed();
            while PeekMessageW(&mut msg, None, 0, 0, PM_REMOVE).as_bool() {
                if msg.message == WM_HIDMON_STOP {
                    stop = true;
                    continue;
                }
                let _ = TranslateMessage(&msg);
                DispatchMessageW(&msg);
            }
        }

        let changes = PENDING.with(|p| mem::take(&mut *p.borrow_mut()));
        for change in changes {
            self.apply(change, sink);
        }
        Ok(if stop { Wake::Shutdown } else { Wake::Events })
    }

    fn unsubscribe(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            shutdown.clear_waker();
        }
        // SAFETY: handles were created by `subscribe` on this thread.
        unsafe {
            if let Some(notify) = self.notify.take() {
                let _ = UnregisterDeviceNotification(notify);
            }
            if let Some(hwnd) = self.hwnd.take() {
                let _ = DestroyWindow(hwnd);
            }
        }
        PENDING.with(|p| p.borrow_mut().clear());
    }
}

unsafe extern "system" fn wndproc(hwnd: HWND, msg: u32, wparam: WPARAM, lparam: LPARAM) -> LRESULT {
    if msg == WM_DEVICECHANGE {
        // SAFETY: for WM_DEVICECHANGE, lparam is null or a DEV_BROADCAST_HDR.
        if let Some(change) = unsafe { decode_broadcast(wparam, lparam) } {
            PENDING.with(|p| p.borrow_mut().push(change));
        }
        return LRESULT(1);
    }
    unsafe { DefWindowProcW(hwnd, msg, wparam, lparam) }
}

/// Decode a device-interface broadcast into a lowercased path.
///
/// # Safety
/// `lparam` must be null or point to a valid `DEV_BROADCAST_HDR`.
unsafe fn decode_broadcast(wparam: WPARAM, lparam: LPARAM) -> Option<InterfaceChange> {
    let arrived = match wparam.0 as u32 {
        DBT_DEVICEARRIVAL => true,
        DBT_DEVICEREMOVECOMPLETE => false,
        _ => return None,
    };
    if lparam.0 == 0 {
        return None;
    }
    // SAFETY: caller guarantees lparam points to a broadcast header.
    let hdr = unsafe { &*(lparam.0 as *const DEV_BROADCAST_HDR) };
    if hdr.dbch_devicetype.0 != DBT_DEVTYP_DEVICEINTERFACE {
        return None;
    }
    let iface = lparam.0 as *const DEV_BROADCAST_DEVICEINTERFACE_W;
    let name_offset = mem::offset_of!(DEV_BROADCAST_DEVICEINTERFACE_W, dbcc_name);
    let max_chars = (hdr.dbch_size as usize).saturating_sub(name_offset) / 2;
    // SAFETY: dbcc_name is a NUL-terminated UTF-16 string inside the
    // dbch_size bytes of the broadcast.
    let path = unsafe {
        let ptr = (*iface).dbcc_name.as_ptr();
        let mut len = 0;
        while len < max_chars && *ptr.add(len) != 0 {
            len += 1;
        }
        String::from_utf16_lossy(std::slice::from_raw_parts(ptr, len))
    };
    Some(InterfaceChange {
        arrived,
        path: path.to_lowercase(),
    })
}

// ── SetupDi enumeration ──

/// Extract a null-terminated UTF-16 path from SP_DEVICE_INTERFACE_DETAIL_DATA_W.
///
/// # Safety
/// `detail` must point to a valid, fully initialized SP_DEVICE_INTERFACE_DETAIL_DATA_W.
unsafe fn extract_path(detail: &SP_DEVICE_INTERFACE_DETAIL_DATA_W) -> String {
    let ptr = &detail.DevicePath as *const u16;
    let mut len = 0;
    // SAFETY: caller guarantees the struct is filled; DevicePath is NUL-terminated.
    unsafe {
        while *ptr.add(len) != 0 {
            len += 1;
        }
        String::from_utf16_lossy(std::slice::from_raw_parts(ptr, len))
    }
}

/// Lowercased interface paths of every present HID interface.
fn enumerate_interface_paths() -> Result<Vec<String>> {
    // SAFETY: the info set is destroyed before returning; buffers are sized
    // from the required-size query.
    unsafe {
        let dev_info = SetupDiGetClassDevsW(
            Some(&HID_INTERFACE_GUID),
            PCWSTR::null(),
            None,
            DIGCF_PRESENT | DIGCF_DEVICEINTERFACE,
        )
        .map_err(|e| MonitorError::Enumeration(format!("SetupDiGetClassDevsW: {e}")))?;

        let mut paths = Vec::new();
        let mut index = 0u32;
        loop {
            let mut iface = SP_DEVICE_INTERFACE_DATA {
                cbSize: mem::size_of::<SP_DEVICE_INTERFACE_DATA>() as u32,
                ..Default::default()
            };
            if SetupDiEnumDeviceInterfaces(dev_info, None, &HID_INTERFACE_GUID, index, &mut iface)
                .is_err()
            {
                break;
            }
            index += 1;

            let mut req: u32 = 0;
            let _ = SetupDiGetDeviceInterfaceDetailW(dev_info, &iface, None, 0, Some(&mut req), None);
            if req == 0 {
                continue;
            }
            let mut buf = vec![0u8; req as usize];
            let detail = &mut *(buf.as_mut_ptr() as *mut SP_DEVICE_INTERFACE_DETAIL_DATA_W);
            detail.cbSize = mem::size_of::<SP_DEVICE_INTERFACE_DETAIL_DATA_W>() as u32;
            if SetupDiGetDeviceInterfaceDetailW(dev_info, &iface, Some(detail), req, None, None)
                .is_ok()
            {
                paths.push(extract_path(detail).to_lowercase());
            }
        }
        let _ = SetupDiDestroyDeviceInfoList(dev_info);
        Ok(paths)
    }
}

// ── HID queries ──

/// Read a HidD_Get*String result. Empty when the device has no such string.
fn hid_string(
    handle: HANDLE,
    getter: unsafe fn(HANDLE, *mut c_void, u32) -> bool,
) -> String {
    let mut buf = [0u16; 256];
    // SAFETY: buffer length is passed in bytes.
    let ok = unsafe { getter(handle, buf.as_mut_ptr() as *mut c_void, (buf.len() * 2) as u32) };
    if !ok {
        return String::new();
    }
    let len = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
    String::from_utf16_lossy(&buf[..len]).trim().to_string()
}

unsafe fn serial_string(h: HANDLE, buf: *mut c_void, len: u32) -> bool {
    unsafe { HidD_GetSerialNumberString(h, buf, len) }
}

unsafe fn manufacturer_string(h: HANDLE, buf: *mut c_void, len: u32) -> bool {
    unsafe { HidD_GetManufacturerString(h, buf, len) }
}

unsafe fn product_string(h: HANDLE, buf: *mut c_void, len: u32) -> bool {
    unsafe { HidD_GetProductString(h, buf, len) }
}

/// Open an interface path for attribute queries and build its descriptor.
///
/// Returns `None` when the device cannot be opened or is not a HID
/// collection (it may have been unplugged already).
fn describe_path(path: &str) -> Option<DeviceDescriptor> {
    let wide: Vec<u16> = path.encode_utf16().chain(Some(0)).collect();
    // SAFETY: `wide` is NUL-terminated and outlives the call; zero access
    // rights are enough for HidD_* queries and never conflict with other
    // openers.
    let handle = unsafe {
        CreateFileW(
            PCWSTR(wide.as_ptr()),
            0,
            FILE_SHARE_READ | FILE_SHARE_WRITE,
            None,
            OPEN_EXISTING,
            FILE_FLAGS_AND_ATTRIBUTES(0),
            None,
        )
    }
    .ok()?;

    let desc = describe_handle(handle, path);
    // SAFETY: handle came from CreateFileW above.
    let _ = unsafe { CloseHandle(handle) };
    desc
}

fn describe_handle(handle: HANDLE, path: &str) -> Option<DeviceDescriptor> {
    let mut attrs = HIDD_ATTRIBUTES {
        Size: mem::size_of::<HIDD_ATTRIBUTES>() as u32,
        ..Default::default()
    };
    // SAFETY: attrs is initialized with its size.
    if !unsafe { HidD_GetAttributes(handle, &mut attrs) } {
        return None;
    }

    let (usage_page, usage) = primary_caps(handle).unwrap_or((0, 0));
    Some(DeviceDescriptor {
        serial_number: hid_string(handle, serial_string),
        manufacturer: hid_string(handle, manufacturer_string),
        product: hid_string(handle, product_string),
        usage_page,
        usage,
        vendor_id: attrs.VendorID,
        product_id: attrs.ProductID,
        firmware_version: attrs.VersionNumber,
        handle: PlatformHandle::Path(path.to_lowercase()),
    })
}

fn primary_caps(handle: HANDLE) -> Option<(u16, u16)> {
    let mut ppd = PHIDP_PREPARSED_DATA::default();
    // SAFETY: ppd is freed below on every path that obtained it.
    unsafe {
        if !HidD_GetPreparsedData(handle, &mut ppd) {
            return None;
        }
        let mut caps = HIDP_CAPS::default();
        let status = HidP_GetCaps(ppd, &mut caps);
        let _ = HidD_FreePreparsedData(ppd);
        if status.is_ok() {
            Some((caps.UsagePage, caps.Usage))
        } else {
            None
        }
    }
}
