//! Board models — identity registry for OpenPilot USB hardware.
//!
//! All boards share one vendor ID. The product ID encodes both the hardware
//! model and the firmware run state: the low bit is the run state
//! (1 = bootloader, 0 = running firmware) and the remaining bits are the
//! board model. Classification is a pure function of `(vendor_id, product_id)`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// USB vendor ID shared by every OpenPilot board.
pub const VID_OPENPILOT: u16 = 0x20a0;

/// OpenPilot main board.
pub const PID_OPENPILOT: u16 = 0x415a;

/// CopterControl board.
pub const PID_COPTERCONTROL: u16 = 0x415b;

/// OPLink Mini radio modem.
pub const PID_OPLINK_MINI: u16 = 0x415c;

/// Product-ID bit that carries the run state.
pub const RUN_STATE_BIT: u16 = 0x0001;

/// Firmware execution mode of an attached board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Bootloader = 0x01,
    Running = 0x02,
}

impl RunState {
    /// Classify a device from its USB identity.
    ///
    /// Returns `None` for devices outside the registry.
    pub fn classify(vendor_id: u16, product_id: u16) -> Option<RunState> {
        detect_board(vendor_id, product_id)?;
        if product_id & RUN_STATE_BIT != 0 {
            Some(RunState::Bootloader)
        } else {
            Some(RunState::Running)
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Bootloader => write!(f, "bootloader"),
            RunState::Running => write!(f, "running"),
        }
    }
}

impl FromStr for RunState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bootloader" | "bl" => Ok(RunState::Bootloader),
            "running" | "fw" | "firmware" => Ok(RunState::Running),
            other => Err(format!(
                "unknown run state \"{other}\" (expected bootloader or running)"
            )),
        }
    }
}

/// One entry in the board registry.
#[derive(Debug)]
pub struct KnownBoard {
    pub name: &'static str,
    pub product_id: u16,
}

static KNOWN_BOARDS: [KnownBoard; 3] = [
    KnownBoard {
        name: "OpenPilot",
        product_id: PID_OPENPILOT,
    },
    KnownBoard {
        name: "CopterControl",
        product_id: PID_COPTERCONTROL,
    },
    KnownBoard {
        name: "OPLink Mini",
        product_id: PID_OPLINK_MINI,
    },
];

/// All registered boards, in product-ID order.
pub fn known_boards() -> &'static [KnownBoard] {
    &KNOWN_BOARDS
}

/// Board model encoded in a product ID (run-state bit cleared).
pub fn board_model(product_id: u16) -> u16 {
    product_id & !RUN_STATE_BIT
}

/// Find the registry entry for a device.
///
/// Both run-state variants of a registered board model match, so a board in
/// its bootloader resolves to the same entry as its running firmware.
pub fn detect_board(vendor_id: u16, product_id: u16) -> Option<&'static KnownBoard> {
    if vendor_id != VID_OPENPILOT {
        return None;
    }
    let model = board_model(product_id);
    KNOWN_BOARDS
        .iter()
        .find(|b| b.product_id == product_id)
        .or_else(|| KNOWN_BOARDS.iter().find(|b| board_model(b.product_id) == model))
}

/// Human-readable board name, if the device is registered.
pub fn product_name(vendor_id: u16, product_id: u16) -> Option<&'static str> {
    detect_board(vendor_id, product_id).map(|b| b.name)
}

/// Parse a USB ID written as hex (`0x20a0`, `20A0`) or decimal with a `#` prefix.
pub fn parse_usb_id(s: &str) -> Result<u16, String> {
    let s = s.trim();
    if let Some(dec) = s.strip_prefix('#') {
        return dec
            .parse::<u16>()
            .map_err(|e| format!("invalid decimal ID \"{s}\": {e}"));
    }
    let hex = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    if hex.is_empty() {
        return Err("empty ID".into());
    }
    u16::from_str_radix(hex, 16).map_err(|e| format!("invalid hex ID \"{s}\": {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── RunState::classify ──

    #[test]
    fn classify_low_bit_clear_is_running() {
        assert_eq!(
            RunState::classify(VID_OPENPILOT, PID_OPENPILOT),
            Some(RunState::Running)
        );
        assert_eq!(
            RunState::classify(VID_OPENPILOT, PID_OPLINK_MINI),
            Some(RunState::Running)
        );
    }

    #[test]
    fn classify_low_bit_set_is_bootloader() {
        assert_eq!(
            RunState::classify(VID_OPENPILOT, PID_COPTERCONTROL),
            Some(RunState::Bootloader)
        );
        assert_eq!(
            RunState::classify(VID_OPENPILOT, PID_OPLINK_MINI | RUN_STATE_BIT),
            Some(RunState::Bootloader)
        );
    }

    #[test]
    fn classify_foreign_vendor_is_none() {
        assert_eq!(RunState::classify(0x046d, PID_OPENPILOT), None);
    }

    #[test]
    fn classify_unknown_product_is_none() {
        assert_eq!(RunState::classify(VID_OPENPILOT, 0x1234), None);
    }

    #[test]
    fn classify_is_pure() {
        let first = RunState::classify(VID_OPENPILOT, PID_COPTERCONTROL);
        for _ in 0..10 {
            assert_eq!(RunState::classify(VID_OPENPILOT, PID_COPTERCONTROL), first);
        }
    }

    #[test]
    fn run_state_discriminants() {
        assert_eq!(RunState::Bootloader as u8, 0x01);
        assert_eq!(RunState::Running as u8, 0x02);
    }

    // ── board_model ──

    #[test]
    fn board_model_clears_run_state_bit() {
        assert_eq!(board_model(0x415a), 0x415a);
        assert_eq!(board_model(0x415b), 0x415a);
        assert_eq!(board_model(0x415c), 0x415c);
        assert_eq!(board_model(0x415d), 0x415c);
    }

    // ── detect_board / product_name ──

    #[test]
    fn detect_registered_boards() {
        assert_eq!(product_name(VID_OPENPILOT, PID_OPENPILOT), Some("OpenPilot"));
        assert_eq!(
            product_name(VID_OPENPILOT, PID_COPTERCONTROL),
            Some("CopterControl")
        );
        assert_eq!(
            product_name(VID_OPENPILOT, PID_OPLINK_MINI),
            Some("OPLink Mini")
        );
    }

    #[test]
    fn detect_bootloader_variant_of_registered_model() {
        assert_eq!(product_name(VID_OPENPILOT, 0x415d), Some("OPLink Mini"));
    }

    #[test]
    fn detect_unknown_returns_none() {
        assert!(detect_board(VID_OPENPILOT, 0x0001).is_none());
        assert!(detect_board(0x0000, PID_OPENPILOT).is_none());
    }

    // ── RunState parsing ──

    #[test]
    fn parse_run_state() {
        assert_eq!("bootloader".parse::<RunState>(), Ok(RunState::Bootloader));
        assert_eq!("Running".parse::<RunState>(), Ok(RunState::Running));
        assert!("sleeping".parse::<RunState>().is_err());
    }

    #[test]
    fn display_run_state() {
        assert_eq!(RunState::Bootloader.to_string(), "bootloader");
        assert_eq!(RunState::Running.to_string(), "running");
    }

    // ── parse_usb_id ──

    #[test]
    fn parse_usb_id_forms() {
        assert_eq!(parse_usb_id("0x20a0"), Ok(0x20a0));
        assert_eq!(parse_usb_id("0X20A0"), Ok(0x20a0));
        assert_eq!(parse_usb_id("415a"), Ok(0x415a));
        assert_eq!(parse_usb_id(" 0x415B "), Ok(0x415b));
        assert_eq!(parse_usb_id("#8352"), Ok(0x20a0));
    }

    #[test]
    fn parse_usb_id_rejects_garbage() {
        assert!(parse_usb_id("").is_err());
        assert!(parse_usb_id("0x").is_err());
        assert!(parse_usb_id("0x12345").is_err());
        assert!(parse_usb_id("zz").is_err());
    }
}
