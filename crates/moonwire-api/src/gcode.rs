// ── G-code helpers ──

use serde::{Deserialize, Serialize};

/// Suffix appended to every non-blank line sent through `gcode_script`,
/// so console history shows where a command came from.
pub const GCODE_SOURCE_TAG: &str = " ; from moonwire";

/// Append [`GCODE_SOURCE_TAG`] to each non-blank line of `script`.
///
/// Blank lines pass through unchanged and line order is preserved.
pub fn annotate_gcode(script: &str) -> String {
    script
        .split('\n')
        .map(|line| {
            if line.trim().is_empty() {
                line.to_owned()
            } else {
                format!("{}{GCODE_SOURCE_TAG}", line.trim_end_matches('\r'))
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Whether a console entry was sent to Klipper or produced by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum GcodeEntryType {
    Command,
    #[default]
    Response,
}

/// One entry of Moonraker's G-code console history (`server.gcode_store`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GcodeStoreEntry {
    #[serde(default)]
    pub message: String,
    /// Unix timestamp in seconds.
    #[serde(default)]
    pub time: f64,
    #[serde(default, rename = "type")]
    pub entry_type: GcodeEntryType,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GcodeStoreResult {
    #[serde(default)]
    pub gcode_store: Vec<GcodeStoreEntry>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn annotates_each_command_line() {
        assert_eq!(
            annotate_gcode("G28\nG1 X10 Y10"),
            "G28 ; from moonwire\nG1 X10 Y10 ; from moonwire"
        );
    }

    #[test]
    fn blank_lines_are_left_alone() {
        assert_eq!(annotate_gcode("G28\n\n  \nM84"), "G28 ; from moonwire\n\n  \nM84 ; from moonwire");
        assert_eq!(annotate_gcode(""), "");
    }

    #[test]
    fn crlf_input_is_normalized() {
        assert_eq!(annotate_gcode("M105\r\nM114"), "M105 ; from moonwire\nM114 ; from moonwire");
    }

    #[test]
    fn parses_store_entries_with_defaults() {
        let result: GcodeStoreResult = serde_json::from_value(json!({
            "gcode_store": [
                {"message": "G28", "time": 1_700_000_000.5, "type": "command"},
                {"message": "ok"}
            ]
        }))
        .unwrap();

        assert_eq!(
            result.gcode_store,
            vec![
                GcodeStoreEntry {
                    message: "G28".into(),
                    time: 1_700_000_000.5,
                    entry_type: GcodeEntryType::Command,
                },
                GcodeStoreEntry {
                    message: "ok".into(),
                    time: 0.0,
                    entry_type: GcodeEntryType::Response,
                },
            ]
        );
    }
}
