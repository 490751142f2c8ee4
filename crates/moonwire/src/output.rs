//! Output formatting: text or JSON, with optional color.

use std::io::{self, IsTerminal, Write};

use owo_colors::OwoColorize;

use crate::cli::{ColorMode, OutputFormat};
use crate::error::CliError;

/// Determine whether color output should be enabled.
pub fn should_color(mode: ColorMode) -> bool {
    match mode {
        ColorMode::Always => true,
        ColorMode::Never => false,
        ColorMode::Auto => io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none(),
    }
}

/// Render `data` as JSON, or with `text_fn` for the text format.
pub fn render<T>(
    format: OutputFormat,
    data: &T,
    text_fn: impl FnOnce(&T) -> String,
) -> Result<String, CliError>
where
    T: serde::Serialize + ?Sized,
{
    Ok(match format {
        OutputFormat::Text => text_fn(data),
        OutputFormat::Json => serde_json::to_string_pretty(data)?,
        OutputFormat::JsonCompact => serde_json::to_string(data)?,
    })
}

/// Print the rendered output to stdout, respecting quiet mode.
pub fn print_output(output: &str, quiet: bool) {
    if quiet || output.is_empty() {
        return;
    }
    let mut stdout = io::stdout().lock();
    let _ = writeln!(stdout, "{output}");
}

// ── Styled fragments ─────────────────────────────────────────────────

/// Bold heading.
pub fn heading(text: &str, color: bool) -> String {
    if color {
        text.bold().to_string()
    } else {
        text.to_owned()
    }
}

/// Dimmed secondary text.
pub fn dim(text: &str, color: bool) -> String {
    if color {
        text.dimmed().to_string()
    } else {
        text.to_owned()
    }
}

/// Red for errors, yellow for warnings.
pub fn severity(text: &str, is_error: bool, color: bool) -> String {
    match (color, is_error) {
        (false, _) => text.to_owned(),
        (true, true) => text.red().to_string(),
        (true, false) => text.yellow().to_string(),
    }
}

/// `label value` with the label padded to `width`.
pub fn field(label: &str, value: impl std::fmt::Display, width: usize) -> String {
    format!("  {label:<width$} {value}")
}
