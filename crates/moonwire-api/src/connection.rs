// ── WebSocket session task ──
//
// One task per `connect()`. It owns the socket for its generation, opens
// it, runs the session loop, and after an unexpected close retries with
// backoff until it reconnects, gives up, or is superseded. It holds only a
// `Weak<ClientInner>` and upgrades it per event.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::ClientRequestBuilder;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::client::{ClientInner, ConnectionCallback};
use crate::config::{MAX_MESSAGE_SIZE, TIMEOUT_SWEEP_INTERVAL};
use crate::error::Error;
use crate::events::{MoonrakerEvent, MoonrakerEventKind};
use crate::jsonrpc::{Inbound, decode_inbound};
use crate::reconnect::ConnectionGeneration;
use crate::state::ConnectionState;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const KLIPPY_DISCONNECTED: &str = "notify_klippy_disconnected";
const KLIPPY_READY: &str = "notify_klippy_ready";

const MIN_KEEPALIVE: Duration = Duration::from_millis(100);

/// Where to connect and whom to tell.
#[derive(Clone)]
pub(crate) struct ConnectionTarget {
    pub url: Url,
    pub on_connected: ConnectionCallback,
    pub on_disconnected: ConnectionCallback,
}

/// Why a session loop returned.
enum SessionEnd {
    /// Superseded, closed locally, or the client was dropped.
    Closed,
    /// The socket dropped underneath an open session.
    Lost(String),
}

// ── Task entry point ─────────────────────────────────────────────────

pub(crate) async fn run(inner: Weak<ClientInner>, generation: ConnectionGeneration, target: ConnectionTarget) {
    let Some((timeout, api_key)) = open_params(&inner) else {
        return;
    };

    let opened = tokio::select! {
        biased;
        () = generation.cancelled() => return,
        result = open(&target.url, api_key.as_ref(), timeout) => result,
    };

    let mut stream = match opened {
        Ok(stream) => stream,
        Err(e) => {
            let Some(client) = inner.upgrade() else {
                return;
            };
            if !client.transition_if_current(&generation, ConnectionState::Disconnected) {
                return;
            }
            warn!(url = %target.url, error = %e, "initial connection failed");
            drop(client);
            (target.on_disconnected)();
            return;
        }
    };

    let mut reconnected = false;
    loop {
        let reason = match session(&inner, &generation, &target, stream, reconnected).await {
            SessionEnd::Closed => break,
            SessionEnd::Lost(reason) => reason,
        };

        {
            let Some(client) = inner.upgrade() else {
                break;
            };
            if !client.transition_if_current(&generation, ConnectionState::Reconnecting) {
                break;
            }
            warn!(url = %target.url, reason = %reason, "connection lost");
            client.detach_session_for(&generation);
            client.emit(MoonrakerEvent::new(
                MoonrakerEventKind::ConnectionLost,
                format!("Connection to Moonraker lost: {reason}"),
                true,
            ));
            // Error callbacks may disconnect or reconnect the client.
            client.requests.fail_all();
            if !client.reconnect.is_current(&generation) {
                break;
            }
        }
        (target.on_disconnected)();

        match reconnect(&inner, &generation, &target).await {
            Some(next) => {
                stream = next;
                reconnected = true;
            }
            None => break,
        }
    }

    debug!(generation = generation.value(), "connection task exiting");
}

/// Upgrade the client, but only while `generation` is still live.
fn current(inner: &Weak<ClientInner>, generation: &ConnectionGeneration) -> Option<Arc<ClientInner>> {
    inner
        .upgrade()
        .filter(|client| client.reconnect.is_current(generation))
}

fn open_params(inner: &Weak<ClientInner>) -> Option<(Duration, Option<SecretString>)> {
    let client = inner.upgrade()?;
    let timeout = client.settings.load().connection_timeout;
    Some((timeout, client.api_key.clone()))
}

// ── Opening ──────────────────────────────────────────────────────────

async fn open(url: &Url, api_key: Option<&SecretString>, timeout: Duration) -> Result<WsStream, Error> {
    debug!(url = %url, "opening websocket");

    let uri: tungstenite::http::Uri = url
        .as_str()
        .parse()
        .map_err(|e: tungstenite::http::uri::InvalidUri| Error::WebSocketConnect(e.to_string()))?;

    let mut request = ClientRequestBuilder::new(uri);
    if let Some(key) = api_key {
        request = request.with_header("X-Api-Key", key.expose_secret());
    }

    let (stream, _response) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(request))
        .await
        .map_err(|_| Error::ConnectTimeout {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        })?
        .map_err(|e| Error::WebSocketConnect(e.to_string()))?;

    info!(url = %url, "websocket connected");
    Ok(stream)
}

/// Retry with backoff. `None` when superseded or out of attempts.
async fn reconnect(
    inner: &Weak<ClientInner>,
    generation: &ConnectionGeneration,
    target: &ConnectionTarget,
) -> Option<WsStream> {
    loop {
        let (delay, attempt, timeout, api_key) = {
            let client = current(inner, generation)?;
            let settings = client.settings.load_full();
            let attempt = client.reconnect.attempts() + 1;
            let Some(delay) = client.reconnect.next_delay(&settings.reconnect) else {
                if !client.transition_if_current(generation, ConnectionState::Failed) {
                    return None;
                }
                error!(
                    max_attempts = settings.reconnect.max_attempts,
                    "reconnection limit reached, giving up"
                );
                client.emit(MoonrakerEvent::new(
                    MoonrakerEventKind::ConnectionFailed,
                    format!(
                        "Could not reconnect to Moonraker after {} attempts",
                        settings.reconnect.max_attempts
                    ),
                    true,
                ));
                return None;
            };
            (delay, attempt, settings.connection_timeout, client.api_key.clone())
        };

        info!(
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            attempt,
            "waiting before reconnect"
        );
        tokio::select! {
            biased;
            () = generation.cancelled() => return None,
            () = tokio::time::sleep(delay) => {}
        }

        let opened = tokio::select! {
            biased;
            () = generation.cancelled() => return None,
            result = open(&target.url, api_key.as_ref(), timeout) => result,
        };
        match opened {
            Ok(stream) => return Some(stream),
            Err(e) => warn!(attempt, error = %e, "reconnect attempt failed"),
        }
    }
}

// ── Session loop ─────────────────────────────────────────────────────

async fn session(
    inner: &Weak<ClientInner>,
    generation: &ConnectionGeneration,
    target: &ConnectionTarget,
    stream: WsStream,
    reconnected: bool,
) -> SessionEnd {
    let (mut write, mut read) = stream.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();

    let keepalive_period = {
        let Some(client) = inner.upgrade() else {
            return SessionEnd::Closed;
        };
        if !client.open_session(generation, outbound_tx) {
            return SessionEnd::Closed;
        }
        if reconnected {
            client.emit(MoonrakerEvent::new(
                MoonrakerEventKind::Reconnected,
                "Reconnected to Moonraker",
                false,
            ));
        }
        client.settings.load().keepalive_interval.max(MIN_KEEPALIVE)
    };

    (target.on_connected)();
    if let Some(client) = current(inner, generation) {
        client.resume_discovery(generation);
    }

    let start = tokio::time::Instant::now();
    let mut keepalive = tokio::time::interval_at(start + keepalive_period, keepalive_period);
    let mut sweep = tokio::time::interval_at(start + TIMEOUT_SWEEP_INTERVAL, TIMEOUT_SWEEP_INTERVAL);

    loop {
        tokio::select! {
            biased;
            () = generation.cancelled() => {
                debug!(generation = generation.value(), "closing superseded session");
                let _ = write.send(Message::Close(None)).await;
                return SessionEnd::Closed;
            }
            Some(frame) = outbound_rx.recv() => {
                trace!(bytes = frame.len(), "sending frame");
                if let Err(e) = write.send(Message::Text(frame.into())).await {
                    return SessionEnd::Lost(e.to_string());
                }
            }
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let Some(client) = current(inner, generation) else {
                        return SessionEnd::Closed;
                    };
                    if text.len() > MAX_MESSAGE_SIZE {
                        error!(size = text.len(), max = MAX_MESSAGE_SIZE, "inbound message too large");
                        client.emit(MoonrakerEvent::new(
                            MoonrakerEventKind::MessageOversized,
                            format!(
                                "Received oversized data from printer ({} bytes). \
                                 This may indicate a communication error.",
                                text.len()
                            ),
                            true,
                        ));
                        let _ = write.send(Message::Close(None)).await;
                        client.disconnect();
                        return SessionEnd::Closed;
                    }
                    client.requests.process_timeouts(Instant::now());
                    handle_text(&client, target, &text);
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame.map_or_else(
                        || "close frame received".to_owned(),
                        |f| {
                            Error::WebSocketClosed {
                                code: f.code.into(),
                                reason: f.reason.as_str().to_owned(),
                            }
                            .to_string()
                        },
                    );
                    return SessionEnd::Lost(reason);
                }
                Some(Ok(_)) => {
                    // Ping, Pong, Binary: pongs are sent by tungstenite
                }
                Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                None => return SessionEnd::Lost("stream ended".to_owned()),
            },
            _ = keepalive.tick() => {
                trace!("keepalive ping");
                if let Err(e) = write.send(Message::Ping(Default::default())).await {
                    return SessionEnd::Lost(e.to_string());
                }
            }
            _ = sweep.tick() => {
                if let Some(client) = inner.upgrade() {
                    client.requests.process_timeouts(Instant::now());
                }
            }
        }
    }
}

// ── Inbound routing ──────────────────────────────────────────────────

fn handle_text(client: &ClientInner, target: &ConnectionTarget, text: &str) {
    let inbound = match decode_inbound(text) {
        Ok(inbound) => inbound,
        Err(e) => {
            error!(error = %e, "failed to parse inbound frame");
            return;
        }
    };

    match inbound {
        Inbound::Response { id, outcome } => {
            client.requests.resolve(id, outcome);
        }
        Inbound::Notification(notification) => {
            client.subscriptions.dispatch(&notification);

            match notification.method.as_str() {
                KLIPPY_DISCONNECTED => {
                    warn!("klippy disconnected from moonraker");
                    client.emit(MoonrakerEvent::new(
                        MoonrakerEventKind::KlippyDisconnected,
                        "Klipper has disconnected from Moonraker",
                        true,
                    ));
                    (target.on_disconnected)();
                }
                KLIPPY_READY => {
                    info!("klippy ready");
                    client.emit(MoonrakerEvent::new(
                        MoonrakerEventKind::KlippyReady,
                        "Klipper ready",
                        false,
                    ));
                    (target.on_connected)();
                }
                _ => {}
            }
        }
        Inbound::Ignored(reason) => warn!(reason, "ignoring malformed frame"),
    }
}
