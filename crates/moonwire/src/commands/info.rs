//! `moonwire info`: run discovery and show the printer.

use std::fmt::Write as _;

use moonwire_api::{MoonrakerClient, PrinterHardware};

use crate::cli::GlobalOpts;
use crate::error::CliError;
use crate::output;

const WIDTH: usize = 18;

pub async fn handle(client: &MoonrakerClient, global: &GlobalOpts) -> Result<(), CliError> {
    let hardware = client.discover().await?;
    let color = output::should_color(global.color);
    let out = output::render(global.output, hardware.as_ref(), |hw| detail(hw, color))?;
    output::print_output(&out, global.quiet);
    Ok(())
}

fn detail(hw: &PrinterHardware, color: bool) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", output::heading(&hw.hostname, color));
    let _ = writeln!(out, "{}", output::field("Klippy", &hw.klippy_state, WIDTH));
    if !hw.state_message.is_empty() {
        let _ = writeln!(out, "{}", output::field("", output::dim(&hw.state_message, color), WIDTH));
    }
    let _ = writeln!(out, "{}", output::field("Klipper", &hw.software_version, WIDTH));
    let _ = writeln!(out, "{}", output::field("Moonraker", &hw.moonraker_version, WIDTH));
    if !hw.components.is_empty() {
        let _ = writeln!(out, "{}", output::field("Components", hw.components.join(", "), WIDTH));
    }

    let _ = writeln!(out, "\n{}", output::heading("Hardware", color));
    for (label, names) in [
        ("Heaters", &hw.heaters),
        ("Sensors", &hw.sensors),
        ("Fans", &hw.fans),
        ("LEDs", &hw.leds),
        ("Steppers", &hw.steppers),
        ("Filament sensors", &hw.filament_sensors),
        ("AFC", &hw.afc_objects),
    ] {
        if !names.is_empty() {
            let _ = writeln!(out, "{}", output::field(label, names.join(", "), WIDTH));
        }
    }

    let caps = &hw.capabilities;
    let features: Vec<&str> = [
        (caps.has_heated_bed, "heated bed"),
        (caps.has_bed_mesh, "bed mesh"),
        (caps.has_exclude_object, "exclude object"),
        (caps.has_firmware_retraction, "firmware retraction"),
        (caps.has_tool_changer, "tool changer"),
        (caps.has_afc, "AFC"),
        (caps.has_spoolman, "Spoolman"),
    ]
    .into_iter()
    .filter_map(|(present, name)| present.then_some(name))
    .collect();
    if !features.is_empty() {
        let _ = writeln!(out, "{}", output::field("Features", features.join(", "), WIDTH));
    }
    let _ = write!(out, "{}", output::field("Objects", hw.objects.len(), WIDTH));
    out
}
