//! CLI subcommands — device queries, live watch, config and ID registry.

mod config_cmd;
mod devices;
mod ids;
mod watch;

use std::path::Path;

use clap::Subcommand;
use serde::Serialize;

pub(super) use crate::RUNNING;
pub(super) use hidmon_lib::config::Config;
pub(super) use hidmon_lib::error::Result;
pub(super) use hidmon_lib::models::{self, RunState};
pub(super) use hidmon_lib::{
    BridgeStatus, DeviceDescriptor, DeviceEvent, DeviceFilter, DeviceMonitor, MonitorOptions,
    VendorFilter,
};

const PADDING: usize = 2;

/// Compute alignment width for a command's key-value output.
/// Ensures at least PADDING spaces after the longest key in either level,
/// with top-level and indent values aligned to the same column.
pub(super) fn kv_width(top: &[&str], indent: &[&str]) -> usize {
    let top_max = top.iter().map(|k| k.len()).max().unwrap_or(0);
    let indent_max = indent.iter().map(|k| k.len()).max().unwrap_or(0);
    let top_need = if top.is_empty() { 0 } else { top_max + PADDING };
    // Indent keys lose 2 chars of inner width to the "  " prefix
    let indent_need = if indent.is_empty() {
        0
    } else {
        indent_max + PADDING + 2
    };
    top_need.max(indent_need)
}

pub(super) fn kv(key: &str, value: impl std::fmt::Display, w: usize) {
    println!("{key:<width$}{value}", width = w);
}

pub(super) fn kv_indent(key: &str, value: impl std::fmt::Display, w: usize) {
    println!("  {key:<width$}{value}", width = w - 2);
}

/// Load the config from `custom` or the platform path, logging parse warnings.
pub(super) fn load_config(custom: Option<&Path>) -> Config {
    let (config, warnings) = match custom {
        Some(path) => Config::load_from(path),
        None => Config::load_with_warnings(),
    };
    for w in &warnings {
        log::warn!("[config] {w}");
    }
    config
}

/// Monitor options from the config; `all_vendors` drops the vendor filter.
pub(super) fn monitor_options(config: &Config, all_vendors: bool) -> Result<MonitorOptions> {
    let mut options = config.monitor_options()?;
    if all_vendors {
        options.vendors = VendorFilter::any();
    }
    Ok(options)
}

/// Parse a USB ID argument, accepting `-1` (or `any`) as the wildcard.
pub(super) fn parse_wildcard_id(s: &str) -> std::result::Result<i32, String> {
    match s.trim() {
        "-1" | "any" | "*" => Ok(-1),
        other => models::parse_usb_id(other).map(i32::from),
    }
}

// ── JSON output structs ──

#[derive(Serialize)]
pub(super) struct DeviceJson {
    pub name: String,
    pub vendor_id: String,
    pub product_id: String,
    pub serial: Option<String>,
    pub manufacturer: String,
    pub product: String,
    pub usage_page: String,
    pub usage: String,
    pub firmware: String,
    pub run_state: Option<RunState>,
    pub board_model: String,
    pub handle: String,
}

impl From<&DeviceDescriptor> for DeviceJson {
    fn from(d: &DeviceDescriptor) -> Self {
        DeviceJson {
            name: d.display_name().to_string(),
            vendor_id: format!("{:04x}", d.vendor_id),
            product_id: format!("{:04x}", d.product_id),
            serial: (!d.serial_number.is_empty()).then(|| d.serial_number.clone()),
            manufacturer: d.manufacturer.clone(),
            product: d.product.clone(),
            usage_page: format!("{:04x}", d.usage_page),
            usage: format!("{:04x}", d.usage),
            firmware: d.firmware_string(),
            run_state: d.run_state(),
            board_model: format!("{:04x}", d.board_model()),
            handle: d.handle.to_string(),
        }
    }
}

#[derive(Serialize)]
pub(super) struct DevicesOutput {
    pub count: usize,
    pub status: BridgeStatus,
    pub devices: Vec<DeviceJson>,
}

#[derive(Serialize)]
pub(super) struct EventJson {
    pub event: &'static str,
    pub device: DeviceJson,
}

#[derive(Serialize)]
pub(super) struct ConfigOutput {
    pub config_file: Option<String>,
    pub config_file_exists: bool,
    pub settings: Config,
    pub problems: Vec<String>,
}

#[derive(Serialize)]
pub(super) struct BoardJson {
    pub name: &'static str,
    pub product_id: String,
    pub board_model: String,
    pub run_state: Option<RunState>,
}

#[derive(Serialize)]
pub(super) struct IdsOutput {
    pub vendor_id: String,
    pub run_state_bit: String,
    pub boards: Vec<BoardJson>,
}

#[derive(Subcommand)]
pub enum Command {
    /// List attached devices, optionally filtered (-1 = any)
    Devices {
        /// Vendor ID (hex, or -1 for any)
        #[arg(long, value_parser = parse_wildcard_id, allow_hyphen_values = true, default_value = "-1")]
        vid: i32,
        /// Product ID (hex, or -1 for any)
        #[arg(long, value_parser = parse_wildcard_id, allow_hyphen_values = true, default_value = "-1")]
        pid: i32,
        /// Run state: bootloader or running
        #[arg(long)]
        run_state: Option<RunState>,
        /// Board model (product ID with the run-state bit cleared, hex, or -1)
        #[arg(long, value_parser = parse_wildcard_id, allow_hyphen_values = true, default_value = "-1")]
        model: i32,
        /// Track every HID vendor, not just the configured ones
        #[arg(long)]
        all_vendors: bool,
    },

    /// Print arrivals and departures until Ctrl+C, running configured hooks
    Watch {
        /// Track every HID vendor, not just the configured ones
        #[arg(long)]
        all_vendors: bool,
    },

    /// Show current configuration and file paths
    Config,

    /// Show the known board IDs and the run-state bit convention
    Ids,
}

pub fn run(cmd: Command, json: bool, config_path: Option<&Path>) -> Result<()> {
    match cmd {
        Command::Devices {
            vid,
            pid,
            run_state,
            model,
            all_vendors,
        } => {
            let filter = DeviceFilter::from_wildcards(vid, pid, run_state, model);
            devices::cmd_devices(&filter, all_vendors, json, config_path)
        }
        Command::Watch { all_vendors } => watch::cmd_watch(all_vendors, json, config_path),
        Command::Config => config_cmd::cmd_config(json, config_path),
        Command::Ids => ids::cmd_ids(json),
    }
}


#[cfg(test)]
mod parse_tests {
    use super::*;

    #[test]
    fn wildcard_forms() {
        assert_eq!(parse_wildcard_id("-1"), Ok(-1));
        assert_eq!(parse_wildcard_id("any"), Ok(-1));
        assert_eq!(parse_wildcard_id("*"), Ok(-1));
    }

    #[test]
    fn hex_ids() {
        assert_eq!(parse_wildcard_id("0x20a0"), Ok(0x20a0));
        assert_eq!(parse_wildcard_id("415A"), Ok(0x415a));
        assert_eq!(parse_wildcard_id("#8352"), Ok(8352));
    }

    #[test]
    fn bad_ids_are_rejected() {
        assert!(parse_wildcard_id("zz").is_err());
        assert!(parse_wildcard_id("-2").is_err());
        assert!(parse_wildcard_id("0x10000").is_err());
    }

    #[test]
    fn all_vendors_drops_filter() {
        let options = monitor_options(&Config::default(), true).unwrap();
        assert!(options.vendors.accepts(0x046d));
        let options = monitor_options(&Config::default(), false).unwrap();
        assert!(!options.vendors.accepts(0x046d));
    }
}

#[cfg(test)]
mod json_struct_tests {
    use super::*;
    use hidmon_lib::PlatformHandle;

    fn board() -> DeviceDescriptor {
        DeviceDescriptor {
            serial_number: "OP-1".into(),
            vendor_id: 0x20a0,
            product_id: 0x415a,
            usage_page: 0xff9c,
            usage: 1,
            firmware_version: 0x0102,
            handle: PlatformHandle::Path("/dev/hidraw0".into()),
            ..Default::default()
        }
    }

    #[test]
    fn device_json_formats_ids_as_hex() {
        let json = serde_json::to_value(DeviceJson::from(&board())).unwrap();
        assert_eq!(json["name"], "OpenPilot");
        assert_eq!(json["vendor_id"], "20a0");
        assert_eq!(json["product_id"], "415a");
        assert_eq!(json["usage_page"], "ff9c");
        assert_eq!(json["firmware"], "1.02");
        assert_eq!(json["run_state"], "running");
        assert_eq!(json["handle"], "/dev/hidraw0");
    }

    #[test]
    fn device_json_empty_serial_is_null() {
        let dev = DeviceDescriptor {
            serial_number: String::new(),
            ..board()
        };
        let json = serde_json::to_value(DeviceJson::from(&dev)).unwrap();
        assert!(json["serial"].is_null());
    }

    #[test]
    fn devices_output_empty() {
        let output = DevicesOutput {
            count: 0,
            status: BridgeStatus::Stopped,
            devices: vec![],
        };
        let parsed = serde_json::to_value(&output).unwrap();
        assert_eq!(parsed["count"], 0);
        assert_eq!(parsed["status"]["state"], "stopped");
        assert!(parsed["devices"].as_array().unwrap().is_empty());
    }

    #[test]
    fn config_output_has_settings_and_problems() {
        let output = ConfigOutput {
            config_file: None,
            config_file_exists: false,
            settings: Config::default(),
            problems: vec![],
        };
        let parsed = serde_json::to_value(&output).unwrap();
        assert!(parsed["config_file"].is_null());
        assert_eq!(parsed["settings"]["queue_capacity"], 256);
        assert_eq!(parsed["settings"]["vendor_ids"][0], "0x20A0");
        assert!(parsed["problems"].as_array().unwrap().is_empty());
    }
}
