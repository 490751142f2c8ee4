use std::time::Duration;

use secrecy::SecretString;

use crate::reconnect::ReconnectPolicy;

/// Largest inbound frame accepted before the session is closed (5 MiB).
pub const MAX_MESSAGE_SIZE: usize = 5 * 1024 * 1024;

/// Interval between `process_timeouts()` sweeps on the connection task.
pub const TIMEOUT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Timing knobs for sessions and requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutSettings {
    /// Time allowed for the WebSocket to open. Default: 10s.
    pub connection_timeout: Duration,
    /// Default deadline for callback-bearing requests. Default: 30s.
    pub request_timeout: Duration,
    /// Interval between keepalive pings on an open session. Default: 10s.
    pub keepalive_interval: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Configuration for a [`MoonrakerClient`](crate::MoonrakerClient).
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub timeouts: TimeoutSettings,
    /// Sent as `X-Api-Key` on the WebSocket upgrade when set.
    pub api_key: Option<SecretString>,
}

impl ClientConfig {
    pub fn with_api_key(mut self, key: SecretString) -> Self {
        self.api_key = Some(key);
        self
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutSettings) -> Self {
        self.timeouts = timeouts;
        self
    }
}
