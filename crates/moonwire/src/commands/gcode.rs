//! `moonwire gcode`: run a script and echo the console output it produces.

use serde_json::json;

use moonwire_api::{MoonrakerClient, Notification, annotate_gcode};

use crate::cli::{GcodeArgs, GlobalOpts};
use crate::error::CliError;
use crate::output;

use super::console::{GCODE_RESPONSE, console_line};

const HANDLER: &str = "moonwire-gcode";

pub async fn handle(
    client: &MoonrakerClient,
    args: GcodeArgs,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    if args.script.trim().is_empty() {
        return Err(CliError::Validation {
            field: "script".into(),
            reason: "must contain at least one command".into(),
        });
    }

    if !global.quiet {
        let color = output::should_color(global.color);
        client.register_method_callback(GCODE_RESPONSE, HANDLER, move |n: &Notification| {
            if let Some(line) = n.payload().and_then(|p| p.as_str()) {
                println!("{}", console_line(line, color));
            }
        });
    }

    // Klipper answers "ok" once the whole script has run.
    let script = annotate_gcode(&args.script);
    let result = client
        .call("printer.gcode.script", &json!({ "script": script }))
        .await;
    client.unregister_method_callback(GCODE_RESPONSE, HANDLER);

    result?;
    Ok(())
}
