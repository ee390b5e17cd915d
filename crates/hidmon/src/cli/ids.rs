//! `ids` subcommand — print the board registry and the run-state bit convention.

use super::{BoardJson, IdsOutput, Result, RunState, models};

pub(super) fn cmd_ids(json: bool) -> Result<()> {
    let boards: Vec<BoardJson> = models::known_boards()
        .iter()
        .map(|b| BoardJson {
            name: b.name,
            product_id: format!("{:04x}", b.product_id),
            board_model: format!("{:04x}", models::board_model(b.product_id)),
            run_state: RunState::classify(models::VID_OPENPILOT, b.product_id),
        })
        .collect();

    if json {
        let output = IdsOutput {
            vendor_id: format!("{:04x}", models::VID_OPENPILOT),
            run_state_bit: format!("{:04x}", models::RUN_STATE_BIT),
            boards,
        };
        println!("{}", serde_json::to_string_pretty(&output).unwrap_or_default());
        return Ok(());
    }

    println!("Vendor ID: {:04x}", models::VID_OPENPILOT);
    println!();
    println!("  {:<16}{:<10}{:<8}Run state", "Board", "Product", "Model");
    for b in &boards {
        let state = b.run_state.map(|s| s.to_string()).unwrap_or_default();
        println!(
            "  {:<16}{:<10}{:<8}{state}",
            b.name, b.product_id, b.board_model
        );
    }
    println!();
    println!(
        "Product ID bit {:#06x} is the run state (set = {}, clear = {});",
        models::RUN_STATE_BIT,
        RunState::Bootloader,
        RunState::Running
    );
    println!("the remaining bits are the board model.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cmd_ids_succeeds() {
        assert!(cmd_ids(false).is_ok());
        assert!(cmd_ids(true).is_ok());
    }
}
