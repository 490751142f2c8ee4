use serde::Serialize;

/// What happened, for application-level notices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MoonrakerEventKind {
    /// An open session dropped; automatic reconnection has started.
    ConnectionLost,
    /// Automatic reconnection succeeded.
    Reconnected,
    /// Automatic reconnection gave up after `max_attempts` retries.
    ConnectionFailed,
    /// Moonraker lost its connection to Klipper.
    KlippyDisconnected,
    /// Klipper finished starting up.
    KlippyReady,
    /// A non-fatal discovery step failed.
    DiscoveryFailed,
    /// An inbound frame exceeded the size limit; the session was closed.
    MessageOversized,
}

/// A connection or printer event broadcast to `subscribe_events()` receivers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MoonrakerEvent {
    pub kind: MoonrakerEventKind,
    pub message: String,
    /// `true` for failures, `false` for warnings and recoveries.
    pub is_error: bool,
}

impl MoonrakerEvent {
    pub fn new(kind: MoonrakerEventKind, message: impl Into<String>, is_error: bool) -> Self {
        Self {
            kind,
            message: message.into(),
            is_error,
        }
    }
}
