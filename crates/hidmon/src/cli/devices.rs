//! `devices` subcommand — list attached devices matching a filter.

use std::path::Path;

use super::{
    BridgeStatus, DeviceDescriptor, DeviceFilter, DeviceJson, DeviceMonitor, DevicesOutput,
    Result, kv_width, load_config, monitor_options,
};

pub(super) fn cmd_devices(
    filter: &DeviceFilter,
    all_vendors: bool,
    json: bool,
    config_path: Option<&Path>,
) -> Result<()> {
    let config = load_config(config_path);
    let mut monitor = DeviceMonitor::new(monitor_options(&config, all_vendors)?)?;
    monitor.start_platform()?;
    let status = monitor.status();
    if let BridgeStatus::Degraded { reason, .. } = &status {
        log::debug!("live updates unavailable: {reason}");
    }
    let devices = monitor.devices_matching(filter);
    monitor.stop();

    if json {
        let output = DevicesOutput {
            count: devices.len(),
            status,
            devices: devices.iter().map(DeviceJson::from).collect(),
        };
        println!("{}", serde_json::to_string_pretty(&output).unwrap_or_default());
        return Ok(());
    }

    if devices.is_empty() {
        println!("No matching devices found.");
        return Ok(());
    }

    println!(
        "Found {} device{}:",
        devices.len(),
        if devices.len() == 1 { "" } else { "s" }
    );
    println!();

    let w = kv_width(
        &[],
        &["Serial:", "Firmware:", "Usage:", "Run state:", "Handle:"],
    );
    for (i, dev) in devices.iter().enumerate() {
        println!("  [{}] {}", i + 1, headline(dev));
        print_details(dev, w);
    }

    Ok(())
}

fn headline(dev: &DeviceDescriptor) -> String {
    format!(
        "{} ({:04x}:{:04x})",
        dev.display_name(),
        dev.vendor_id,
        dev.product_id
    )
}

fn print_details(dev: &DeviceDescriptor, w: usize) {
    // Indented under the "  [n] " headline.
    let detail = |key: &str, value: &dyn std::fmt::Display| {
        println!("      {key:<width$}{value}", width = w - 2);
    };
    if !dev.serial_number.is_empty() {
        detail("Serial:", &dev.serial_number);
    }
    detail("Firmware:", &dev.firmware_string());
    detail(
        "Usage:",
        &format_args!("{:04x}:{:04x}", dev.usage_page, dev.usage),
    );
    if let Some(state) = dev.run_state() {
        detail("Run state:", &state);
    }
    detail("Handle:", &dev.handle);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headline_prefers_registry_name() {
        let dev = DeviceDescriptor {
            vendor_id: 0x20a0,
            product_id: 0x415c,
            product: "OPLink".into(),
            ..Default::default()
        };
        assert_eq!(headline(&dev), "OPLink Mini (20a0:415c)");
    }

    #[test]
    fn headline_falls_back_to_product_string() {
        let dev = DeviceDescriptor {
            vendor_id: 0x046d,
            product_id: 0xc52b,
            product: "USB Receiver".into(),
            ..Default::default()
        };
        assert_eq!(headline(&dev), "USB Receiver (046d:c52b)");
    }
}
