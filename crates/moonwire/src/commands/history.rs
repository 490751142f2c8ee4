//! `moonwire history`: recent G-code console entries.

use std::time::Duration;

use moonwire_api::{GcodeEntryType, GcodeStoreEntry, MoonrakerClient};

use crate::cli::{GlobalOpts, HistoryArgs};
use crate::error::CliError;
use crate::output;

use super::console::console_line;

pub async fn handle(
    client: &MoonrakerClient,
    args: HistoryArgs,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    let entries = client.gcode_store(args.count).await?;
    let color = output::should_color(global.color);
    let out = output::render(global.output, entries.as_slice(), |entries| {
        entries
            .iter()
            .map(|e| entry_line(e, color))
            .collect::<Vec<_>>()
            .join("\n")
    })?;
    output::print_output(&out, global.quiet);
    Ok(())
}

fn entry_line(entry: &GcodeStoreEntry, color: bool) -> String {
    let stamp = output::dim(&clock(entry.time), color);
    match entry.entry_type {
        GcodeEntryType::Command => format!("{stamp} $ {}", output::heading(&entry.message, color)),
        GcodeEntryType::Response => format!("{stamp}   {}", console_line(&entry.message, color)),
    }
}

/// `HH:MM:SS` (UTC) for a Unix timestamp in seconds.
fn clock(unix_secs: f64) -> String {
    let secs = Duration::try_from_secs_f64(unix_secs).map_or(0, |d| d.as_secs()) % 86_400;
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}
