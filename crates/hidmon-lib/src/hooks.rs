//! Hot-plug hooks — run user-defined commands when devices arrive or depart.
//!
//! The command sees the device through `HIDMON_*` environment variables.

use std::io;
use std::process::{Command, ExitStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::config::Config;
use crate::device::DeviceDescriptor;
use crate::table::DeviceEvent;

/// Guard preventing concurrent hook execution (shared across arrival/removal hooks).
static HOOK_RUNNING: AtomicBool = AtomicBool::new(false);

/// Default timeout for hook commands (30 seconds).
const HOOK_TIMEOUT: Duration = Duration::from_secs(30);

/// Poll interval when waiting for a hook process to exit.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Run the configured hook for a table change.
///
/// The command runs on a background thread. Empty commands are ignored, and
/// if a previous hook is still running the new one is skipped with a warning.
pub fn run_event_hook(event: &DeviceEvent, config: &Config) {
    let command = if event.is_arrival() {
        &config.on_arrival_command
    } else {
        &config.on_removal_command
    };
    run_hook(command, hook_env(event));
}

/// Environment passed to a hook command.
pub fn hook_env(event: &DeviceEvent) -> Vec<(&'static str, String)> {
    let d: &DeviceDescriptor = event.device();
    vec![
        (
            "HIDMON_EVENT",
            if event.is_arrival() { "arrived" } else { "departed" }.to_string(),
        ),
        ("HIDMON_VENDOR_ID", format!("{:04x}", d.vendor_id)),
        ("HIDMON_PRODUCT_ID", format!("{:04x}", d.product_id)),
        ("HIDMON_SERIAL", d.serial_number.clone()),
        ("HIDMON_PRODUCT", d.display_name().to_string()),
        ("HIDMON_HANDLE", d.handle.to_string()),
        (
            "HIDMON_RUN_STATE",
            d.run_state().map(|s| s.to_string()).unwrap_or_default(),
        ),
    ]
}

fn run_hook(command: &str, env: Vec<(&'static str, String)>) {
    let command = command.trim();
    if command.is_empty() {
        return;
    }
    if HOOK_RUNNING
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        log::warn!("hook skipped (previous hook still running): {command}");
        return;
    }
    let command = command.to_string();
    std::thread::spawn(move || {
        let result = run_hook_with_timeout(&command, &env, HOOK_TIMEOUT);
        HOOK_RUNNING.store(false, Ordering::SeqCst);
        match result {
            Ok(s) if !s.success() => {
                log::warn!("hook command exited with {s}: {command}");
            }
            Err(e) => {
                log::warn!("hook command failed: {e}: {command}");
            }
            _ => {}
        }
    });
}

fn shell(command: &str) -> Command {
    if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.args(["/C", command]);
        c
    } else {
        let mut c = Command::new("sh");
        c.args(["-c", command]);
        c
    }
}

/// Run a shell command with a timeout. Kills the process if it exceeds the deadline.
fn run_hook_with_timeout(
    command: &str,
    env: &[(&'static str, String)],
    timeout: Duration,
) -> io::Result<ExitStatus> {
    let mut child = shell(command)
        .envs(env.iter().map(|(k, v)| (*k, v.as_str())))
        .spawn()?;

    let max_polls = (timeout.as_millis() / POLL_INTERVAL.as_millis()).max(1) as u64;
    for _ in 0..max_polls {
        match child.try_wait()? {
            Some(status) => return Ok(status),
            None => std::thread::sleep(POLL_INTERVAL),
        }
    }

    log::warn!("hook command timed out after {timeout:?}, killing: {command}");
    let _ = child.kill();
    child.wait()
}
