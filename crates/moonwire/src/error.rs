//! CLI error types with miette diagnostics.
//!
//! Maps `moonwire_api` and `moonwire_config` errors into user-facing
//! errors with actionable help text.

use miette::Diagnostic;
use thiserror::Error;

use moonwire_api::DiscoveryError;
use moonwire_config::ConfigError;

/// Process exit codes.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const NOT_FOUND: i32 = 4;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Connection ───────────────────────────────────────────────────

    #[error("Could not connect to Moonraker at {url}")]
    #[diagnostic(
        code(moonwire::connection_failed),
        help(
            "Check that Moonraker is running and reachable.\n\
             URL: {url}\n\
             Try: moonwire info -vv --url {url}"
        )
    )]
    ConnectionFailed { url: String },

    #[error("Connection to Moonraker lost")]
    #[diagnostic(
        code(moonwire::disconnected),
        help("Moonraker closed the connection. Re-run the command to reconnect.")
    )]
    Disconnected {
        #[source]
        source: moonwire_api::Error,
    },

    #[error("No printer configured")]
    #[diagnostic(
        code(moonwire::no_config),
        help(
            "Pass --url ws://<host>:7125/websocket, or create a profile with:\n\
             moonwire config init --host <host>\n\
             Expected at: {path}"
        )
    )]
    NoConfig { path: String },

    // ── Requests ─────────────────────────────────────────────────────

    #[error("{method} failed ({code}): {message}")]
    #[diagnostic(code(moonwire::rpc_error))]
    Rpc {
        method: String,
        code: i64,
        message: String,
    },

    #[error("{method} timed out")]
    #[diagnostic(
        code(moonwire::timeout),
        help("Increase the timeout with --timeout or check that Klipper is responsive.")
    )]
    Timeout { method: String },

    #[error("Printer discovery failed")]
    #[diagnostic(code(moonwire::discovery))]
    Discovery(#[source] DiscoveryError),

    #[error(transparent)]
    #[diagnostic(code(moonwire::client))]
    Client(moonwire_api::Error),

    // ── Configuration ────────────────────────────────────────────────

    #[error("Profile '{name}' not found in configuration")]
    #[diagnostic(
        code(moonwire::profile_not_found),
        help(
            "Available profiles: {available}\n\
             Create one with: moonwire config init --host <host>"
        )
    )]
    ProfileNotFound { name: String, available: String },

    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(moonwire::validation))]
    Validation { field: String, reason: String },

    #[error(transparent)]
    #[diagnostic(code(moonwire::config))]
    Config(ConfigError),

    // ── IO / Serialization ───────────────────────────────────────────

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON: {0}")]
    #[diagnostic(code(moonwire::json))]
    Json(#[from] serde_json::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConnectionFailed { .. } | Self::Disconnected { .. } => exit_code::CONNECTION,
            Self::Timeout { .. } => exit_code::TIMEOUT,
            Self::ProfileNotFound { .. } | Self::NoConfig { .. } => exit_code::NOT_FOUND,
            Self::Validation { .. } => exit_code::USAGE,
            Self::Client(e) if e.is_transient() => exit_code::CONNECTION,
            _ => exit_code::GENERAL,
        }
    }
}

// ── Library error mapping ────────────────────────────────────────────

impl From<moonwire_api::Error> for CliError {
    fn from(err: moonwire_api::Error) -> Self {
        use moonwire_api::{Error, RpcErrorKind};

        match err {
            Error::Rpc(e) => match e.kind {
                RpcErrorKind::Protocol => CliError::Rpc {
                    method: e.method,
                    code: e.code,
                    message: e.message,
                },
                RpcErrorKind::Timeout => CliError::Timeout { method: e.method },
                RpcErrorKind::ConnectionLost | RpcErrorKind::Cancelled => CliError::Disconnected {
                    source: Error::Rpc(e),
                },
            },
            Error::NotConnected { .. } | Error::SendFailed { .. } => {
                CliError::Disconnected { source: err }
            }
            Error::InvalidUrl(e) => CliError::Validation {
                field: "url".into(),
                reason: e.to_string(),
            },
            other => CliError::Client(other),
        }
    }
}

impl From<DiscoveryError> for CliError {
    fn from(err: DiscoveryError) -> Self {
        match err {
            DiscoveryError::Request { source, .. } => source.into(),
            other => CliError::Discovery(other),
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Validation { field, reason } => CliError::Validation { field, reason },
            ConfigError::Io(e) => CliError::Io(e),
            other => CliError::Config(other),
        }
    }
}
