//! Monitor configuration — TOML-based, platform-aware paths.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::device::VendorFilter;
use crate::error::{MonitorError, Result};
use crate::models::parse_usb_id;
use crate::monitor::{DEFAULT_QUEUE_CAPACITY, DEFAULT_WAIT_SLICE, MonitorOptions};

/// Header comment prepended to saved config files.
const CONFIG_HEADER: &str =
    "# hidmon configuration. Vendor IDs are hex; an empty list tracks every HID device.\n\n";

/// Largest accepted `queue_capacity`.
pub const MAX_QUEUE_CAPACITY: usize = 65_536;

/// Largest accepted `rescan_interval_secs`.
pub const MAX_RESCAN_INTERVAL_SECS: u64 = 3600;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Vendor IDs to track, hex (`"0x20A0"`) or `#decimal`. Empty = all HID devices.
    #[serde(default = "default_vendor_ids")]
    pub vendor_ids: Vec<String>,

    /// Capacity of the notification queue between the bridge and subscribers.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Full re-enumeration interval in seconds. 0 = disabled.
    #[serde(default)]
    pub rescan_interval_secs: u64,

    /// Command to run when a device arrives. Empty = disabled.
    #[serde(default)]
    pub on_arrival_command: String,

    /// Command to run when a device departs. Empty = disabled.
    #[serde(default)]
    pub on_removal_command: String,
}

fn default_vendor_ids() -> Vec<String> {
    vec!["0x20A0".into()]
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

impl Default for Config {
    fn default() -> Self {
        Config {
            vendor_ids: default_vendor_ids(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            rescan_interval_secs: 0,
            on_arrival_command: String::new(),
            on_removal_command: String::new(),
        }
    }
}

/// Validation errors that [`Config::validate`] can return.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// A `vendor_ids` entry is not a 16-bit USB ID.
    InvalidVendorId { value: String, reason: String },
    /// `queue_capacity` is zero or above [`MAX_QUEUE_CAPACITY`].
    QueueCapacityOutOfRange(usize),
    /// `rescan_interval_secs` is above [`MAX_RESCAN_INTERVAL_SECS`].
    RescanIntervalOutOfRange(u64),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::InvalidVendorId { value, reason } => {
                write!(f, "Invalid vendor ID \"{value}\": {reason}")
            }
            ValidationError::QueueCapacityOutOfRange(n) => {
                write!(f, "queue_capacity must be 1..={MAX_QUEUE_CAPACITY}, got {n}")
            }
            ValidationError::RescanIntervalOutOfRange(n) => write!(
                f,
                "rescan_interval_secs must be 0..={MAX_RESCAN_INTERVAL_SECS}, got {n}"
            ),
        }
    }
}

impl Config {
    /// Platform-specific config directory.
    pub fn dir() -> Option<PathBuf> {
        #[cfg(windows)]
        {
            dirs::config_dir().map(|p| p.join("Hidmon"))
        }
        #[cfg(not(windows))]
        {
            dirs::config_dir().map(|p| p.join("hidmon"))
        }
    }

    /// Full path to config file.
    pub fn path() -> Option<PathBuf> {
        Self::dir().map(|d| d.join("config.toml"))
    }

    /// Load config from disk, or return defaults if not found.
    pub fn load() -> Self {
        let (config, warnings) = Self::load_with_warnings();
        for w in &warnings {
            log::warn!("{w}");
        }
        config
    }

    /// Save config to an arbitrary path atomically (write to temp file, then rename).
    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let serialized = toml::to_string_pretty(self).map_err(std::io::Error::other)?;
        let contents = format!("{CONFIG_HEADER}{serialized}");
        let tmp = path.with_extension("toml.tmp");
        std::fs::write(&tmp, &contents)?;
        match std::fs::rename(&tmp, path) {
            Ok(()) => Ok(()),
            Err(_) => {
                // Rename can fail across filesystems; fall back to direct write + cleanup
                let result = std::fs::write(path, &contents);
                let _ = std::fs::remove_file(&tmp);
                result
            }
        }
    }

    /// Save config to the default platform path.
    pub fn save(&self) -> std::io::Result<()> {
        let Some(path) = Self::path() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "No config directory",
            ));
        };
        self.save_to(&path)
    }

    /// Load config from an arbitrary path, returning the config and any parse warnings.
    ///
    /// Returns `(defaults, [])` if the file doesn't exist.
    /// Returns `(defaults, [warning])` if the file exists but can't be parsed.
    pub fn load_from(path: &Path) -> (Self, Vec<String>) {
        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => (config, vec![]),
                Err(e) => {
                    let warning = format!(
                        "config parse error ({}), using defaults: {e}",
                        path.display()
                    );
                    (Self::default(), vec![warning])
                }
            },
            Err(_) => (Self::default(), vec![]),
        }
    }

    /// Load config from the default path, returning the config and any parse warnings.
    pub fn load_with_warnings() -> (Self, Vec<String>) {
        let Some(path) = Self::path() else {
            return (Self::default(), vec![]);
        };
        Self::load_from(&path)
    }

    /// Parse `vendor_ids` into numeric IDs, collecting every bad entry.
    pub fn parse_vendor_ids(&self) -> std::result::Result<Vec<u16>, Vec<ValidationError>> {
        let mut ids = Vec::new();
        let mut errors = Vec::new();
        for value in &self.vendor_ids {
            match parse_usb_id(value) {
                Ok(id) if !ids.contains(&id) => ids.push(id),
                Ok(_) => {}
                Err(reason) => errors.push(ValidationError::InvalidVendorId {
                    value: value.clone(),
                    reason,
                }),
            }
        }
        if errors.is_empty() { Ok(ids) } else { Err(errors) }
    }

    /// Validate the entire config, collecting all errors.
    pub fn validate(&self) -> std::result::Result<(), Vec<ValidationError>> {
        let mut errors = match self.parse_vendor_ids() {
            Ok(_) => Vec::new(),
            Err(errors) => errors,
        };

        if self.queue_capacity == 0 || self.queue_capacity > MAX_QUEUE_CAPACITY {
            errors.push(ValidationError::QueueCapacityOutOfRange(self.queue_capacity));
        }
        if self.rescan_interval_secs > MAX_RESCAN_INTERVAL_SECS {
            errors.push(ValidationError::RescanIntervalOutOfRange(
                self.rescan_interval_secs,
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Build [`MonitorOptions`] from a validated config.
    pub fn monitor_options(&self) -> Result<MonitorOptions> {
        if let Err(errors) = self.validate() {
            let joined: Vec<String> = errors.iter().map(ToString::to_string).collect();
            return Err(MonitorError::Config(joined.join("; ")));
        }
        let vendors = self
            .parse_vendor_ids()
            .map_err(|_| MonitorError::Config("invalid vendor_ids".into()))?;
        Ok(MonitorOptions {
            vendors: VendorFilter::new(vendors),
            queue_capacity: self.queue_capacity,
            rescan_interval: match self.rescan_interval_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            wait_slice: DEFAULT_WAIT_SLICE,
        })
    }
}
