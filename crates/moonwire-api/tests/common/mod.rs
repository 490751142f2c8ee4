// In-process Moonraker stand-in for integration tests.
//
// Accepts WebSocket connections on a loopback port, records every frame the
// client sends, answers requests through a pluggable responder, and lets
// tests push notifications or drop connections.

#![allow(dead_code, clippy::unwrap_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_util::sync::CancellationToken;

use moonwire_api::{ClientConfig, ConnectionState, MoonrakerClient, ReconnectPolicy, TimeoutSettings};

// ── Responders ──────────────────────────────────────────────────────

/// How the mock answers one request.
pub enum Reply {
    Result(Value),
    Error(i64, &'static str),
    /// Never answer.
    Silent,
}

/// `(connection index, request frame) -> reply`
pub type Responder = Arc<dyn Fn(usize, &Value) -> Reply + Send + Sync>;

/// Answers the discovery methods with a small Voron-like printer.
/// `printer.info` reports the connection index in the hostname.
pub fn printer_reply(conn: usize, request: &Value) -> Reply {
    match request["method"].as_str().unwrap_or_default() {
        "printer.objects.list" => Reply::Result(json!({
            "objects": [
                "webhooks", "configfile", "stepper_x", "stepper_y", "stepper_z",
                "extruder", "heater_bed", "temperature_sensor chamber",
                "fan", "heater_fan hotend_fan", "neopixel sb_leds",
                "filament_switch_sensor runout", "bed_mesh", "exclude_object",
                "print_stats"
            ]
        })),
        "server.info" => Reply::Result(json!({
            "klippy_connected": true,
            "klippy_state": "ready",
            "klippy_version": "v0.12.0-396",
            "moonraker_version": "v0.9.3-12",
            "components": ["file_manager", "history", "spoolman"]
        })),
        "printer.info" => Reply::Result(json!({
            "state": "ready",
            "state_message": "Printer is ready",
            "hostname": format!("voron-{conn}"),
            "software_version": "v0.12.0-396-g5ec1ef0"
        })),
        "printer.objects.subscribe" => Reply::Result(json!({
            "eventtime": 1234.5,
            "status": {
                "print_stats": {"state": "standby"},
                "extruder": {"temperature": 24.5, "target": 0.0}
            }
        })),
        "server.gcode_store" => Reply::Result(json!({
            "gcode_store": [
                {"message": "G28", "time": 1_700_000_000.0, "type": "command"},
                {"message": "// homing done", "time": 1_700_000_001.5, "type": "response"}
            ]
        })),
        _ => Reply::Result(json!("ok")),
    }
}

pub fn default_responder() -> Responder {
    Arc::new(printer_reply)
}

// ── Server ──────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
enum Control {
    Push(String),
    DropConnections,
}

pub struct MockMoonraker {
    pub url: String,
    frames: Arc<Mutex<Vec<(usize, Value)>>>,
    api_keys: Arc<Mutex<Vec<Option<String>>>>,
    connections: Arc<AtomicUsize>,
    control: broadcast::Sender<Control>,
    shutdown: CancellationToken,
}

impl MockMoonraker {
    pub async fn start() -> Self {
        Self::with_responder(default_responder()).await
    }

    pub async fn with_responder(responder: Responder) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/websocket", listener.local_addr().unwrap());
        let (control, _) = broadcast::channel(64);

        let server = Self {
            url,
            frames: Arc::default(),
            api_keys: Arc::default(),
            connections: Arc::default(),
            control,
            shutdown: CancellationToken::new(),
        };

        let frames = Arc::clone(&server.frames);
        let api_keys = Arc::clone(&server.api_keys);
        let connections = Arc::clone(&server.connections);
        let control = server.control.clone();
        let shutdown = server.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let stream = tokio::select! {
                    () = shutdown.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => stream,
                        Err(_) => continue,
                    },
                };
                let conn = connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(
                    conn,
                    stream,
                    Arc::clone(&responder),
                    Arc::clone(&frames),
                    Arc::clone(&api_keys),
                    control.subscribe(),
                    shutdown.clone(),
                ));
            }
        });

        server
    }

    /// Every frame received so far, with its connection index.
    pub fn frames(&self) -> Vec<(usize, Value)> {
        self.frames.lock().clone()
    }

    /// Methods received on connection `conn`, in order.
    pub fn methods_on(&self, conn: usize) -> Vec<String> {
        self.frames
            .lock()
            .iter()
            .filter(|(c, _)| *c == conn)
            .filter_map(|(_, f)| f["method"].as_str().map(str::to_owned))
            .collect()
    }

    pub fn frames_for(&self, method: &str) -> Vec<Value> {
        self.frames
            .lock()
            .iter()
            .filter(|(_, f)| f["method"] == method)
            .map(|(_, f)| f.clone())
            .collect()
    }

    pub fn api_keys(&self) -> Vec<Option<String>> {
        self.api_keys.lock().clone()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Send a raw text frame on every open connection.
    pub fn push_raw(&self, text: impl Into<String>) {
        let _ = self.control.send(Control::Push(text.into()));
    }

    pub fn notify(&self, method: &str, params: Value) {
        self.push_raw(json!({"jsonrpc": "2.0", "method": method, "params": params}).to_string());
    }

    /// Abruptly close every open connection; new ones are still accepted.
    pub fn drop_connections(&self) {
        let _ = self.control.send(Control::DropConnections);
    }

    /// Close every connection and stop listening.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Wait until `count` frames with `method` have arrived.
    pub async fn wait_for_frames(&self, method: &str, count: usize) {
        eventually(|| self.frames_for(method).len() >= count).await;
    }
}

impl Drop for MockMoonraker {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn serve(
    conn: usize,
    stream: TcpStream,
    responder: Responder,
    frames: Arc<Mutex<Vec<(usize, Value)>>>,
    api_keys: Arc<Mutex<Vec<Option<String>>>>,
    mut control: broadcast::Receiver<Control>,
    shutdown: CancellationToken,
) {
    let capture = Arc::clone(&api_keys);
    let callback = move |request: &Request, response: Response| {
        let key = request
            .headers()
            .get("X-Api-Key")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        capture.lock().push(key);
        Ok::<_, ErrorResponse>(response)
    };
    let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
        return;
    };
    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            () = shutdown.cancelled() => return,
            msg = control.recv() => match msg {
                Ok(Control::Push(text)) => {
                    if write.send(Message::Text(text.into())).await.is_err() {
                        return;
                    }
                }
                Ok(Control::DropConnections) | Err(broadcast::error::RecvError::Closed) => return,
                Err(broadcast::error::RecvError::Lagged(_)) => {}
            },
            frame = read.next() => {
                let Some(Ok(frame)) = frame else { return };
                let Message::Text(text) = frame else { continue };
                let Ok(request) = serde_json::from_str::<Value>(&text) else { continue };
                frames.lock().push((conn, request.clone()));

                let Some(id) = request.get("id").cloned() else { continue };
                let reply = match responder(conn, &request) {
                    Reply::Result(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
                    Reply::Error(code, message) => json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": {"code": code, "message": message}
                    }),
                    Reply::Silent => continue,
                };
                if write.send(Message::Text(reply.to_string().into())).await.is_err() {
                    return;
                }
            }
        }
    }
}

// ── Client helpers ──────────────────────────────────────────────────

/// Short timings so reconnect and timeout tests run quickly.
pub fn fast_config() -> ClientConfig {
    ClientConfig::default().with_timeouts(TimeoutSettings {
        connection_timeout: Duration::from_millis(500),
        request_timeout: Duration::from_secs(5),
        keepalive_interval: Duration::from_secs(10),
        reconnect: ReconnectPolicy {
            min_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(100),
            max_attempts: 0,
        },
    })
}

/// Connect with no-op callbacks and wait for `Connected`.
pub async fn connected_client(server: &MockMoonraker, config: ClientConfig) -> MoonrakerClient {
    let client = MoonrakerClient::new(config);
    let mut state = client.subscribe_state();
    client.connect(&server.url, || {}, || {}).unwrap();
    wait_for_state(&mut state, ConnectionState::Connected).await;
    client
}

pub async fn wait_for_state(rx: &mut watch::Receiver<ConnectionState>, target: ConnectionState) {
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == target))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {target}"))
        .unwrap();
}

/// Poll `condition` until it holds, failing after five seconds.
pub async fn eventually(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 5s"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
