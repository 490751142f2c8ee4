use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Top-level error type for the `moonwire-api` crate.
///
/// Covers connection setup, the WebSocket transport, local send failures,
/// and request-level failures (wrapped in [`RpcError`]). Transport errors
/// are normally absorbed by the reconnect loop and only surface as state
/// changes; the variants here are what synchronous API calls return.
#[derive(Debug, Error)]
pub enum Error {
    // ── Connection setup ────────────────────────────────────────────
    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// WebSocket handshake or socket failure.
    #[error("WebSocket connection failed: {0}")]
    WebSocketConnect(String),

    /// The socket did not open within the configured connection timeout.
    #[error("WebSocket connection timed out after {timeout_ms}ms")]
    ConnectTimeout { timeout_ms: u64 },

    /// WebSocket closed by the remote end.
    #[error("WebSocket closed (code {code}): {reason}")]
    WebSocketClosed { code: u16, reason: String },

    /// `force_reconnect()` called before any `connect()`.
    #[error("No previous connection to reconnect -- call connect() first")]
    NoPreviousConnection,

    // ── Sending ─────────────────────────────────────────────────────
    /// A request was issued while the client is not connected.
    #[error("Cannot send {method}: not connected")]
    NotConnected { method: String },

    /// The session's outbound queue closed while enqueueing a frame.
    #[error("Failed to send {method}: connection closing")]
    SendFailed { method: String },

    /// Envelope serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // ── Requests ────────────────────────────────────────────────────
    /// A tracked request failed (server error, timeout, lost connection).
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

impl Error {
    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::WebSocketConnect(_)
            | Self::ConnectTimeout { .. }
            | Self::WebSocketClosed { .. }
            | Self::NotConnected { .. }
            | Self::SendFailed { .. } => true,
            Self::Rpc(e) => matches!(
                e.kind,
                RpcErrorKind::Timeout | RpcErrorKind::ConnectionLost
            ),
            _ => false,
        }
    }
}

// ── RpcError ────────────────────────────────────────────────────────

/// Why a tracked request did not produce a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum RpcErrorKind {
    /// The server answered with a JSON-RPC `error` object.
    Protocol,
    /// No response arrived before the request's deadline.
    Timeout,
    /// The session carrying the request dropped unexpectedly.
    ConnectionLost,
    /// The request was discarded locally without a response
    /// (only observable through the future-based API).
    Cancelled,
}

/// Error delivered to a request's error callback.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{method} failed ({kind}): {message}")]
pub struct RpcError {
    pub kind: RpcErrorKind,
    /// JSON-RPC error code. Synthetic errors use `0`.
    pub code: i64,
    pub message: String,
    pub method: String,
}

/// Wire shape of a JSON-RPC `error` object.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ErrorObject {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

impl RpcError {
    pub(crate) fn protocol(method: &str, object: ErrorObject) -> Self {
        Self {
            kind: RpcErrorKind::Protocol,
            code: object.code,
            message: object.message,
            method: method.to_owned(),
        }
    }

    pub(crate) fn timeout(method: &str, timeout: Duration) -> Self {
        Self {
            kind: RpcErrorKind::Timeout,
            code: 0,
            message: format!("no response after {}ms", timeout.as_millis()),
            method: method.to_owned(),
        }
    }

    pub(crate) fn connection_lost(method: &str) -> Self {
        Self {
            kind: RpcErrorKind::ConnectionLost,
            code: 0,
            message: "connection lost before a response arrived".into(),
            method: method.to_owned(),
        }
    }

    pub(crate) fn cancelled(method: &str) -> Self {
        Self {
            kind: RpcErrorKind::Cancelled,
            code: 0,
            message: "request discarded without a response".into(),
            method: method.to_owned(),
        }
    }

    /// `true` when the server explicitly rejected the request.
    pub fn is_protocol(&self) -> bool {
        self.kind == RpcErrorKind::Protocol
    }

    /// `true` when the server never answered in time.
    pub fn is_timeout(&self) -> bool {
        self.kind == RpcErrorKind::Timeout
    }
}
