//! Device descriptors, identity, and query filters.

use std::fmt;

use serde::Serialize;

use crate::models::{self, RunState};

/// Opaque reference to the physical device, as handed out by the OS.
///
/// Not portable between platforms and not stable across replug.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum PlatformHandle {
    /// Device node or interface path (hidraw node, Windows interface path).
    Path(String),
    /// Pointer-sized handle (IOHIDDeviceRef).
    Opaque(u64),
}

impl Default for PlatformHandle {
    fn default() -> Self {
        PlatformHandle::Path(String::new())
    }
}

impl fmt::Display for PlatformHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlatformHandle::Path(p) => write!(f, "{p}"),
            PlatformHandle::Opaque(h) => write!(f, "0x{h:x}"),
        }
    }
}

/// One attached HID interface.
///
/// Fields the OS does not report are left empty or zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceDescriptor {
    pub serial_number: String,
    pub manufacturer: String,
    pub product: String,
    pub usage_page: u16,
    pub usage: u16,
    pub vendor_id: u16,
    pub product_id: u16,
    /// bcdDevice-style release number.
    pub firmware_version: u16,
    pub handle: PlatformHandle,
}

impl DeviceDescriptor {
    /// Key used to deduplicate table entries.
    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            vendor_id: self.vendor_id,
            product_id: self.product_id,
            usage_page: self.usage_page,
            usage: self.usage,
            handle: self.handle.clone(),
        }
    }

    pub fn run_state(&self) -> Option<RunState> {
        RunState::classify(self.vendor_id, self.product_id)
    }

    pub fn board_model(&self) -> u16 {
        models::board_model(self.product_id)
    }

    /// Registry name for known boards, falling back to the OS product string.
    pub fn display_name(&self) -> &str {
        match models::product_name(self.vendor_id, self.product_id) {
            Some(name) => name,
            None if !self.product.is_empty() => &self.product,
            None => "Unknown device",
        }
    }

    /// Firmware version as `major.minor` from the BCD release number.
    pub fn firmware_string(&self) -> String {
        format!(
            "{:x}.{:02x}",
            self.firmware_version >> 8,
            self.firmware_version & 0xff
        )
    }
}

/// `(vendor_id, product_id, usage_page, usage, handle)`, the table key.
///
/// The serial number is deliberately absent: several platforms report it
/// empty or shared between interfaces.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
    pub usage_page: u16,
    pub usage: u16,
    pub handle: PlatformHandle,
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:04x} usage {:04x}/{:04x} at {}",
            self.vendor_id, self.product_id, self.usage_page, self.usage, self.handle
        )
    }
}

/// Query filter for [`DeviceMonitor::devices_matching`](crate::monitor::DeviceMonitor::devices_matching).
///
/// `None` fields match anything; the default filter matches every device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceFilter {
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub run_state: Option<RunState>,
    pub board_model: Option<u16>,
    /// Set when a wildcard argument was outside the `u16` range. Such a
    /// filter rejects every device whatever the other fields say.
    pub unmatchable: bool,
}

impl DeviceFilter {
    /// Build a filter from integer arguments where `-1` means "any".
    ///
    /// Values outside the `u16` range other than `-1` can never match a
    /// device, so they produce a filter that matches nothing rather than an
    /// error.
    pub fn from_wildcards(
        vendor_id: i32,
        product_id: i32,
        run_state: Option<RunState>,
        board_model: i32,
    ) -> Self {
        let mut unmatchable = false;
        let mut wildcard = |value: i32| match value {
            -1 => None,
            v => match u16::try_from(v) {
                Ok(id) => Some(id),
                Err(_) => {
                    unmatchable = true;
                    None
                }
            },
        };
        let vendor_id = wildcard(vendor_id);
        let product_id = wildcard(product_id);
        let board_model = wildcard(board_model);
        DeviceFilter {
            vendor_id,
            product_id,
            run_state,
            board_model,
            unmatchable,
        }
    }

    pub fn matches(&self, device: &DeviceDescriptor) -> bool {
        if self.unmatchable {
            return false;
        }
        if let Some(vid) = self.vendor_id
            && device.vendor_id != vid
        {
            return false;
        }
        if let Some(pid) = self.product_id
            && device.product_id != pid
        {
            return false;
        }
        if let Some(state) = self.run_state
            && device.run_state() != Some(state)
        {
            return false;
        }
        if let Some(model) = self.board_model
            && device.board_model() != models::board_model(model)
        {
            return false;
        }
        true
    }

    /// Apply the filter to a snapshot, keeping table order.
    pub fn apply(&self, devices: Vec<DeviceDescriptor>) -> Vec<DeviceDescriptor> {
        devices.into_iter().filter(|d| self.matches(d)).collect()
    }
}

/// Vendor IDs a bridge reports. Empty means every HID device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VendorFilter(Vec<u16>);

impl VendorFilter {
    pub fn new(vendor_ids: Vec<u16>) -> Self {
        VendorFilter(vendor_ids)
    }

    pub fn any() -> Self {
        VendorFilter(Vec::new())
    }

    pub fn accepts(&self, vendor_id: u16) -> bool {
        self.0.is_empty() || self.0.contains(&vendor_id)
    }

    pub fn vendor_ids(&self) -> &[u16] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PID_COPTERCONTROL, PID_OPENPILOT, PID_OPLINK_MINI, VID_OPENPILOT};

    fn board(pid: u16, path: &str) -> DeviceDescriptor {
        DeviceDescriptor {
            vendor_id: VID_OPENPILOT,
            product_id: pid,
            usage_page: 0xff9c,
            usage: 0x0001,
            handle: PlatformHandle::Path(path.into()),
            ..Default::default()
        }
    }

    // ── identity ──

    #[test]
    fn identity_ignores_serial_and_strings() {
        let mut a = board(PID_OPENPILOT, "/dev/hidraw0");
        let mut b = a.clone();
        a.serial_number = "A".into();
        b.serial_number = "B".into();
        b.product = "Other".into();
        assert_eq!(a.identity(), b.identity());
    }

    #[test]
    fn identity_differs_by_handle() {
        let a = board(PID_OPENPILOT, "/dev/hidraw0");
        let b = board(PID_OPENPILOT, "/dev/hidraw1");
        assert_ne!(a.identity(), b.identity());
    }

    #[test]
    fn identity_differs_by_usage() {
        let a = board(PID_OPENPILOT, "/dev/hidraw0");
        let mut b = a.clone();
        b.usage = 2;
        assert_ne!(a.identity(), b.identity());
    }

    // ── DeviceFilter ──

    #[test]
    fn default_filter_matches_everything() {
        let f = DeviceFilter::default();
        assert!(f.matches(&board(PID_OPENPILOT, "a")));
        assert!(f.matches(&DeviceDescriptor::default()));
    }

    #[test]
    fn wildcards_equal_default() {
        assert_eq!(
            DeviceFilter::from_wildcards(-1, -1, None, -1),
            DeviceFilter::default()
        );
    }

    #[test]
    fn filter_by_vendor_and_product() {
        let f = DeviceFilter::from_wildcards(0x20a0, 0x415a, None, -1);
        assert!(f.matches(&board(PID_OPENPILOT, "a")));
        assert!(!f.matches(&board(PID_COPTERCONTROL, "a")));
    }

    #[test]
    fn filter_by_run_state() {
        let bl = DeviceFilter::from_wildcards(-1, -1, Some(RunState::Bootloader), -1);
        assert!(bl.matches(&board(PID_COPTERCONTROL, "a")));
        assert!(!bl.matches(&board(PID_OPENPILOT, "a")));

        let fw = DeviceFilter::from_wildcards(-1, -1, Some(RunState::Running), -1);
        assert!(fw.matches(&board(PID_OPLINK_MINI, "a")));
    }

    #[test]
    fn run_state_filter_excludes_unclassified_devices() {
        let f = DeviceFilter::from_wildcards(-1, -1, Some(RunState::Running), -1);
        let mouse = DeviceDescriptor {
            vendor_id: 0x046d,
            product_id: 0xc077,
            ..Default::default()
        };
        assert!(!f.matches(&mouse));
    }

    #[test]
    fn filter_by_board_model_spans_run_states() {
        let f = DeviceFilter::from_wildcards(-1, -1, None, 0x415c);
        assert!(f.matches(&board(0x415c, "a")));
        assert!(f.matches(&board(0x415d, "a")));
        assert!(!f.matches(&board(0x415a, "a")));
    }

    #[test]
    fn out_of_range_wildcard_matches_nothing() {
        let f = DeviceFilter::from_wildcards(0x1_0000, -1, None, -1);
        assert!(!f.matches(&board(PID_OPENPILOT, "a")));
    }

    #[test]
    fn out_of_range_product_rejects_top_of_id_space() {
        let f = DeviceFilter::from_wildcards(-1, -5, None, -1);
        let top = DeviceDescriptor {
            product_id: 0xffff,
            ..Default::default()
        };
        assert!(f.unmatchable);
        assert!(!f.matches(&top));
    }

    #[test]
    fn out_of_range_board_model_rejects_every_product() {
        let f = DeviceFilter::from_wildcards(-1, -1, None, 0x1_fffe);
        for pid in [0xfffe, 0xffff, PID_OPENPILOT] {
            let d = DeviceDescriptor {
                product_id: pid,
                ..Default::default()
            };
            assert!(!f.matches(&d), "matched {pid:#06x}");
        }
    }

    #[test]
    fn apply_keeps_order() {
        let devices = vec![
            board(PID_OPENPILOT, "a"),
            board(PID_COPTERCONTROL, "b"),
            board(PID_OPENPILOT, "c"),
        ];
        let f = DeviceFilter::from_wildcards(-1, 0x415a, None, -1);
        let out = f.apply(devices);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].handle, PlatformHandle::Path("a".into()));
        assert_eq!(out[1].handle, PlatformHandle::Path("c".into()));
    }

    // ── VendorFilter ──

    #[test]
    fn vendor_filter_empty_accepts_all() {
        assert!(VendorFilter::any().accepts(0x1234));
    }

    #[test]
    fn vendor_filter_list() {
        let f = VendorFilter::new(vec![VID_OPENPILOT]);
        assert!(f.accepts(VID_OPENPILOT));
        assert!(!f.accepts(0x046d));
    }

    // ── display helpers ──

    #[test]
    fn display_name_prefers_registry() {
        let mut d = board(PID_COPTERCONTROL, "a");
        d.product = "CC".into();
        assert_eq!(d.display_name(), "CopterControl");
    }

    #[test]
    fn display_name_falls_back_to_product_string() {
        let d = DeviceDescriptor {
            vendor_id: 0x046d,
            product: "USB Receiver".into(),
            ..Default::default()
        };
        assert_eq!(d.display_name(), "USB Receiver");
        assert_eq!(DeviceDescriptor::default().display_name(), "Unknown device");
    }

    #[test]
    fn firmware_string_from_bcd() {
        let d = DeviceDescriptor {
            firmware_version: 0x0102,
            ..Default::default()
        };
        assert_eq!(d.firmware_string(), "1.02");
    }

    #[test]
    fn handle_display() {
        assert_eq!(
            PlatformHandle::Path("/dev/hidraw3".into()).to_string(),
            "/dev/hidraw3"
        );
        assert_eq!(PlatformHandle::Opaque(0xdead).to_string(), "0xdead");
    }
}
