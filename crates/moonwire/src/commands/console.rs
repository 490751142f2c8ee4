//! `moonwire console`: stream Klipper's G-code console.

use moonwire_api::{MoonrakerClient, Notification};

use crate::cli::GlobalOpts;
use crate::error::CliError;
use crate::output;

pub(crate) const GCODE_RESPONSE: &str = "notify_gcode_response";

const HANDLER: &str = "moonwire-console";

pub async fn handle(client: &MoonrakerClient, global: &GlobalOpts) -> Result<(), CliError> {
    let color = output::should_color(global.color);
    let quiet = global.quiet;
    client.register_method_callback(GCODE_RESPONSE, HANDLER, move |n: &Notification| {
        if quiet {
            return;
        }
        if let Some(line) = n.payload().and_then(|p| p.as_str()) {
            println!("{}", console_line(line, color));
        }
    });

    let result = super::run_until_interrupted(client, global).await;
    client.unregister_method_callback(GCODE_RESPONSE, HANDLER);
    result
}

/// Style one console line: `!!` errors red, `//` comments dimmed.
pub(crate) fn console_line(line: &str, color: bool) -> String {
    if line.starts_with("!!") {
        output::severity(line, true, color)
    } else if line.starts_with("//") {
        output::dim(line, color)
    } else {
        line.to_owned()
    }
}
