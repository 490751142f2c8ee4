//! Clap derive structures for the `moonwire` CLI.

use clap::{Args, Parser, Subcommand, ValueEnum};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// moonwire -- talk to Klipper printers through Moonraker
#[derive(Debug, Parser)]
#[command(
    name = "moonwire",
    version,
    about = "Talk to Klipper printers through the Moonraker API",
    long_about = "Connects to Moonraker's JSON-RPC WebSocket to inspect a printer,\n\
        run G-code, and stream console output and status updates.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Printer profile to use
    #[arg(long, short = 'p', env = "MOONWIRE_PROFILE", global = true)]
    pub profile: Option<String>,

    /// Moonraker WebSocket URL, e.g. ws://voron.local:7125/websocket (overrides profile)
    #[arg(long, short = 'u', env = "MOONWIRE_URL", global = true)]
    pub url: Option<String>,

    /// Moonraker API key
    #[arg(long, env = "MOONWIRE_API_KEY", global = true, hide_env = true)]
    pub api_key: Option<String>,

    /// Output format
    #[arg(long, short = 'o', default_value = "text", global = true)]
    pub output: OutputFormat,

    /// When to use color output
    #[arg(long, default_value = "auto", global = true)]
    pub color: ColorMode,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,

    /// Request timeout in seconds (overrides profile)
    #[arg(long, env = "MOONWIRE_TIMEOUT", global = true)]
    pub timeout: Option<u64>,
}

// ── Output & Color Enums ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text (default)
    Text,
    /// Pretty-printed JSON
    Json,
    /// Compact single-line JSON
    JsonCompact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ColorMode {
    /// Auto-detect (color if terminal is interactive)
    Auto,
    /// Always emit color codes
    Always,
    /// Never emit color codes
    Never,
}

// ── Top-Level Command Enum ───────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Discover the printer and show its hardware
    #[command(alias = "i")]
    Info,

    /// Run a G-code script and print the console output it produces
    #[command(alias = "g")]
    Gcode(GcodeArgs),

    /// Stream the G-code console until interrupted
    Console,

    /// Stream live status updates until interrupted
    #[command(alias = "w")]
    Watch,

    /// Show recent G-code console history
    History(HistoryArgs),

    /// Manage printer profiles
    Config(ConfigArgs),
}

// ── Command Args ─────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GcodeArgs {
    /// G-code to run; separate multiple commands with newlines
    pub script: String,
}

#[derive(Debug, Args)]
pub struct HistoryArgs {
    /// Number of entries to fetch
    #[arg(long, short = 'n', default_value = "50")]
    pub count: u32,
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Create or replace a profile
    Init {
        /// Moonraker host name or IP
        #[arg(long)]
        host: String,

        /// Moonraker port
        #[arg(long, default_value = "7125")]
        port: u16,

        /// Use wss:// instead of ws://
        #[arg(long)]
        tls: bool,

        /// Environment variable holding the API key
        #[arg(long)]
        api_key_env: Option<String>,

        /// Make this the default profile
        #[arg(long)]
        default: bool,
    },

    /// Print the loaded configuration
    Show,

    /// Print the config file path
    Path,
}
