//! `watch` subcommand — print arrivals and departures until Ctrl+C.
//!
//! Subscribers are registered before the monitor starts, so devices already
//! attached show up as arrivals from the initial enumeration.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use hidmon_lib::hooks;

use super::{
    BridgeStatus, Config, DeviceDescriptor, DeviceEvent, DeviceJson, DeviceMonitor, EventJson,
    RUNNING, Result, load_config, monitor_options,
};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub(super) fn cmd_watch(all_vendors: bool, json: bool, config_path: Option<&Path>) -> Result<()> {
    let config = Arc::new(load_config(config_path));
    let mut monitor = DeviceMonitor::new(monitor_options(&config, all_vendors)?)?;

    let cfg = config.clone();
    monitor.on_arrived(move |d: &DeviceDescriptor| {
        report(&DeviceEvent::Arrived(d.clone()), json, &cfg);
    });
    let cfg = config.clone();
    monitor.on_departed(move |d: &DeviceDescriptor| {
        report(&DeviceEvent::Departed(d.clone()), json, &cfg);
    });

    monitor.start_platform()?;
    match monitor.status() {
        BridgeStatus::Live { bridge } => {
            log::info!("watching via {bridge}");
            if !json {
                println!("[watch] live ({bridge}), Ctrl+C to stop");
            }
        }
        BridgeStatus::Degraded { bridge, reason } => {
            eprintln!("[watch] live updates unavailable ({bridge}): {reason}");
            eprintln!("[watch] showing the devices attached at startup only");
        }
        other => log::debug!("unexpected status after start: {other}"),
    }

    while RUNNING.load(Ordering::SeqCst) {
        std::thread::sleep(POLL_INTERVAL);
    }

    monitor.stop();
    if !json {
        println!(
            "[watch] stopped, {} device(s) attached",
            monitor.all_devices().len()
        );
    }
    Ok(())
}

/// Print one table change and run its hook.
fn report(event: &DeviceEvent, json: bool, config: &Config) {
    if json {
        let line = EventJson {
            event: if event.is_arrival() { "arrived" } else { "departed" },
            device: DeviceJson::from(event.device()),
        };
        if let Ok(s) = serde_json::to_string(&line) {
            println!("{s}");
        }
    } else {
        println!("{}", format_event(event));
    }
    hooks::run_event_hook(event, config);
}

fn format_event(event: &DeviceEvent) -> String {
    let d = event.device();
    let sign = if event.is_arrival() { '+' } else { '-' };
    let mut line = format!(
        "{sign} {} ({:04x}:{:04x}) {}",
        d.display_name(),
        d.vendor_id,
        d.product_id,
        d.handle
    );
    if let Some(state) = d.run_state() {
        line.push_str(&format!(" [{state}]"));
    }
    if !d.serial_number.is_empty() {
        line.push_str(&format!(" serial={}", d.serial_number));
    }
    line
}
