//! `config` subcommand — show current configuration and file paths.

use std::path::Path;

use super::{Config, ConfigOutput, Result, kv, kv_indent, kv_width, load_config};

pub(super) fn cmd_config(json: bool, custom_path: Option<&Path>) -> Result<()> {
    let config = load_config(custom_path);
    let config_path = custom_path.map(|p| p.to_path_buf()).or_else(Config::path);
    let config_exists = config_path.as_ref().map(|p| p.exists()).unwrap_or(false);
    let problems: Vec<String> = match config.validate() {
        Ok(()) => Vec::new(),
        Err(errors) => errors.iter().map(ToString::to_string).collect(),
    };

    if json {
        let output = ConfigOutput {
            config_file: config_path.as_ref().map(|p| p.display().to_string()),
            config_file_exists: config_exists,
            settings: config,
            problems,
        };
        println!("{}", serde_json::to_string_pretty(&output).unwrap_or_default());
        return Ok(());
    }

    // Human-readable output
    let w = kv_width(
        &["Config file:"],
        &[
            "vendor_ids:",
            "queue_capacity:",
            "rescan_interval_secs:",
            "on_arrival_command:",
            "on_removal_command:",
        ],
    );

    match &config_path {
        Some(p) => {
            if config_exists {
                kv("Config file:", format_args!("{} (loaded)", p.display()), w);
            } else {
                kv(
                    "Config file:",
                    format_args!("{} (not found, using defaults)", p.display()),
                    w,
                );
            }
        }
        None => kv("Config file:", "(no config directory)", w),
    }
    println!();

    println!("Settings:");
    let vendors = if config.vendor_ids.is_empty() {
        "(all HID devices)".to_string()
    } else {
        config.vendor_ids.join(", ")
    };
    kv_indent("vendor_ids:", vendors, w);
    kv_indent("queue_capacity:", config.queue_capacity, w);
    let rescan = match config.rescan_interval_secs {
        0 => "off".to_string(),
        n => format!("every {n}s"),
    };
    kv_indent("rescan_interval_secs:", rescan, w);
    let command_label = |cmd: &str| {
        if cmd.trim().is_empty() {
            "(none)".to_string()
        } else {
            cmd.to_string()
        }
    };
    kv_indent(
        "on_arrival_command:",
        command_label(&config.on_arrival_command),
        w,
    );
    kv_indent(
        "on_removal_command:",
        command_label(&config.on_removal_command),
        w,
    );

    if !problems.is_empty() {
        println!();
        println!("Problems:");
        for p in &problems {
            println!("  {p}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cmd_config_with_missing_file_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("none.toml");
        assert!(cmd_config(false, Some(&path)).is_ok());
        assert!(cmd_config(true, Some(&path)).is_ok());
    }

    #[test]
    fn cmd_config_with_invalid_values_still_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "queue_capacity = 0\nvendor_ids = [\"zz\"]\n").unwrap();
        assert!(cmd_config(false, Some(&path)).is_ok());
    }
}
