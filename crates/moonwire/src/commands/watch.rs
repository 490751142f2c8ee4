//! `moonwire watch`: subscribe and stream status updates.

use serde_json::Value;

use moonwire_api::{MoonrakerClient, Notification};

use crate::cli::{GlobalOpts, OutputFormat};
use crate::error::CliError;
use crate::output;

const STATUS_UPDATE: &str = "notify_status_update";

pub async fn handle(client: &MoonrakerClient, global: &GlobalOpts) -> Result<(), CliError> {
    let color = output::should_color(global.color);
    let format = global.output;
    let quiet = global.quiet;

    let id = client.register_notify_update(move |n: &Notification| {
        if quiet {
            return;
        }
        let line = match format {
            OutputFormat::Text => status_line(n, color),
            OutputFormat::Json | OutputFormat::JsonCompact => {
                serde_json::to_string(n).unwrap_or_default()
            }
        };
        println!("{line}");
    });

    let result = stream(client, global, color).await;
    client.unsubscribe_notify_update(id);
    result
}

async fn stream(client: &MoonrakerClient, global: &GlobalOpts, color: bool) -> Result<(), CliError> {
    // Discovery subscribes to every relevant object and replays the
    // initial status through the notify callback.
    let hardware = client.discover().await?;
    if !global.quiet {
        let banner = format!(
            "watching {} ({} objects), Ctrl-C to stop",
            hardware.hostname,
            hardware.objects.len()
        );
        eprintln!("{}", output::dim(&banner, color));
    }
    super::run_until_interrupted(client, global).await
}

/// `[eventtime] object.field=value ...` for a status delta, or the
/// method name and params for other notifications.
fn status_line(n: &Notification, color: bool) -> String {
    let status = match n.payload() {
        Some(Value::Object(status)) if n.method == STATUS_UPDATE => status,
        _ => return format!("{} {}", n.method, n.params),
    };
    let eventtime = n
        .params
        .get(1)
        .and_then(Value::as_f64)
        .map_or_else(String::new, |t| format!("[{t:.3}] "));

    let mut fields = Vec::new();
    for (object, values) in status {
        match values {
            Value::Object(values) => {
                for (field, value) in values {
                    fields.push(format!("{object}.{field}={value}"));
                }
            }
            other => fields.push(format!("{object}={other}")),
        }
    }
    format!("{}{}", output::dim(&eventtime, color), fields.join(" "))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn status_line_flattens_fields() {
        let n = Notification {
            method: "notify_status_update".into(),
            params: json!([{"extruder": {"temperature": 210.5}, "fan": {"speed": 0.4}}, 12.25]),
        };
        assert_eq!(
            status_line(&n, false),
            "[12.250] extruder.temperature=210.5 fan.speed=0.4"
        );
    }

    #[test]
    fn other_notifications_show_method() {
        let n = Notification {
            method: "notify_filelist_changed".into(),
            params: json!([{"action": "create_file"}]),
        };
        assert_eq!(
            status_line(&n, false),
            r#"notify_filelist_changed [{"action":"create_file"}]"#
        );
    }
}
