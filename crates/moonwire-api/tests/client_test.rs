#![allow(clippy::unwrap_used)]
// Integration tests for `MoonrakerClient` against an in-process Moonraker.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tokio::net::TcpListener;

use moonwire_api::{
    ClientConfig, ConnectionState, Error, GcodeEntryType, MoonrakerClient, MoonrakerEventKind,
    ReconnectPolicy, RpcErrorKind, TimeoutSettings,
};

use common::{MockMoonraker, Reply, connected_client, eventually, fast_config, printer_reply, wait_for_state};

/// Replies to everything except `method`, which is left unanswered.
fn silent_for(method: &'static str) -> common::Responder {
    Arc::new(move |conn, request| {
        if request["method"] == method {
            Reply::Silent
        } else {
            printer_reply(conn, request)
        }
    })
}

// ── Request / response ──────────────────────────────────────────────

#[tokio::test]
async fn test_call_returns_result() {
    let server = MockMoonraker::start().await;
    let client = connected_client(&server, fast_config()).await;

    let info = client.call("server.info", &Value::Null).await.unwrap();
    assert_eq!(info["moonraker_version"], "v0.9.3-12");

    let frame = &server.frames_for("server.info")[0];
    assert_eq!(frame["jsonrpc"], "2.0");
    assert!(frame["id"].as_u64().unwrap() > 0);
    assert!(frame.get("params").is_none());
}

#[tokio::test]
async fn test_protocol_error_reaches_caller() {
    let server = MockMoonraker::with_responder(Arc::new(|_, _| {
        Reply::Error(-32601, "Method not found")
    }))
    .await;
    let client = connected_client(&server, fast_config()).await;

    let result = client.call("printer.bogus", &Value::Null).await;
    let Err(Error::Rpc(err)) = result else {
        panic!("expected RPC error, got {result:?}");
    };
    assert_eq!(err.kind, RpcErrorKind::Protocol);
    assert_eq!(err.code, -32601);
    assert_eq!(err.message, "Method not found");
    assert_eq!(err.method, "printer.bogus");
}

#[tokio::test]
async fn test_unanswered_request_times_out_once() {
    let server = MockMoonraker::with_responder(silent_for("printer.info")).await;
    let client = connected_client(&server, fast_config()).await;

    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    client
        .send_jsonrpc_with_handlers(
            "printer.info",
            &Value::Null,
            |_| panic!("no response was sent"),
            move |err| sink.lock().push(err.kind),
            Some(Duration::from_millis(100)),
        )
        .unwrap();

    eventually(|| !errors.lock().is_empty()).await;
    assert_eq!(client.pending_request_count(), 0);
    assert_eq!(client.process_timeouts(), 0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*errors.lock(), vec![RpcErrorKind::Timeout]);
}

#[tokio::test]
async fn test_call_with_timeout_reports_timeout_kind() {
    let server = MockMoonraker::with_responder(silent_for("printer.info")).await;
    let client = connected_client(&server, fast_config()).await;

    let result = client
        .call_with_timeout("printer.info", &Value::Null, Duration::from_millis(100))
        .await;
    assert!(
        matches!(&result, Err(Error::Rpc(e)) if e.is_timeout()),
        "expected timeout, got {result:?}"
    );
}

#[tokio::test]
async fn test_malformed_error_response_is_a_protocol_error() {
    let server = MockMoonraker::with_responder(silent_for("printer.info")).await;
    let client = connected_client(&server, fast_config()).await;

    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    let id = client
        .send_jsonrpc_with_handlers(
            "printer.info",
            &Value::Null,
            |_| panic!("the server rejected the request"),
            move |err| sink.lock().push((err.kind, err.message)),
            Some(Duration::from_millis(400)),
        )
        .unwrap();
    server.wait_for_frames("printer.info", 1).await;

    server.push_raw(
        json!({"jsonrpc": "2.0", "id": id, "error": "Klippy host not connected"}).to_string(),
    );
    eventually(|| !errors.lock().is_empty()).await;

    // Past the request deadline: no timeout follows the answer.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(
        *errors.lock(),
        vec![(RpcErrorKind::Protocol, "Klippy host not connected".to_string())]
    );
    assert_eq!(client.pending_request_count(), 0);
}

#[tokio::test]
async fn test_request_ids_are_unique_and_each_callback_fires_once() {
    let server = MockMoonraker::start().await;
    let client = connected_client(&server, fast_config()).await;

    let completions = Arc::new(AtomicUsize::new(0));
    let mut ids = Vec::new();
    for _ in 0..25 {
        let done = Arc::clone(&completions);
        let id = client
            .send_jsonrpc_with_callback("server.info", &Value::Null, move |_| {
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        ids.push(id);
    }

    eventually(|| completions.load(Ordering::SeqCst) == 25).await;
    assert_eq!(ids.iter().collect::<HashSet<_>>().len(), 25);
    assert!(ids.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(client.pending_request_count(), 0);
}

#[tokio::test]
async fn test_unknown_response_id_is_ignored() {
    let server = MockMoonraker::start().await;
    let client = connected_client(&server, fast_config()).await;

    server.push_raw(r#"{"jsonrpc":"2.0","id":987654,"result":{"late":true}}"#);
    server.push_raw(r#"{"jsonrpc":"2.0","id":"not-a-number","result":{}}"#);
    server.push_raw("this is not json");

    // The session is still healthy afterwards.
    let info = client.call("printer.info", &Value::Null).await.unwrap();
    assert_eq!(info["state"], "ready");
    assert_eq!(client.connection_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_cancelled_request_ignores_late_response() {
    let server = MockMoonraker::with_responder(silent_for("printer.objects.query")).await;
    let client = connected_client(&server, fast_config()).await;

    let fired = Arc::new(AtomicUsize::new(0));
    let on_ok = Arc::clone(&fired);
    let on_err = Arc::clone(&fired);
    let id = client
        .send_jsonrpc_with_handlers(
            "printer.objects.query",
            &json!({"objects": {"toolhead": null}}),
            move |_| {
                on_ok.fetch_add(1, Ordering::SeqCst);
            },
            move |_| {
                on_err.fetch_add(1, Ordering::SeqCst);
            },
            None,
        )
        .unwrap();
    server.wait_for_frames("printer.objects.query", 1).await;

    assert!(client.cancel_request(id));
    assert!(!client.cancel_request(id));
    server.push_raw(json!({"jsonrpc": "2.0", "id": id, "result": {"status": {}}}).to_string());

    // A round trip after the late response guarantees it was processed.
    client.call("server.info", &Value::Null).await.unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_dropped_call_future_cancels_request() {
    let server = MockMoonraker::with_responder(silent_for("printer.info")).await;
    let client = connected_client(&server, fast_config()).await;

    let pending = client.call("printer.info", &Value::Null);
    let result = tokio::time::timeout(Duration::from_millis(50), pending).await;
    assert!(result.is_err());
    assert_eq!(client.pending_request_count(), 0);
}

// ── Sending while not connected ─────────────────────────────────────

#[tokio::test]
async fn test_sends_fail_fast_after_disconnect() {
    let server = MockMoonraker::start().await;
    let client = connected_client(&server, fast_config()).await;
    client.disconnect();

    let result = client.send_jsonrpc_with_callback("server.info", &Value::Null, |_| {
        panic!("must not be called")
    });
    assert!(matches!(result, Err(Error::NotConnected { .. })));
    assert!(matches!(
        client.send_jsonrpc("printer.emergency_stop"),
        Err(Error::NotConnected { .. })
    ));
    assert_eq!(client.pending_request_count(), 0);
}

// ── G-code ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_gcode_script_is_annotated_and_untracked() {
    let server = MockMoonraker::start().await;
    let client = connected_client(&server, fast_config()).await;

    client.gcode_script("G28\n\nG1 Z10 F600").unwrap();
    server.wait_for_frames("printer.gcode.script", 1).await;

    let frame = &server.frames_for("printer.gcode.script")[0];
    assert!(frame.get("id").is_none());
    assert_eq!(
        frame["params"]["script"],
        "G28 ; from moonwire\n\nG1 Z10 F600 ; from moonwire"
    );
    assert_eq!(client.pending_request_count(), 0);
}

#[tokio::test]
async fn test_gcode_store_returns_entries() {
    let server = MockMoonraker::start().await;
    let client = connected_client(&server, fast_config()).await;

    let entries = client.gcode_store(50).await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].message, "G28");
    assert_eq!(entries[0].entry_type, GcodeEntryType::Command);
    assert_eq!(entries[1].entry_type, GcodeEntryType::Response);

    let frame = &server.frames_for("server.gcode_store")[0];
    assert_eq!(frame["params"], json!({"count": 50}));
}

// ── Notifications ───────────────────────────────────────────────────

#[tokio::test]
async fn test_status_updates_fan_out_in_registration_order() {
    let server = MockMoonraker::start().await;
    let client = connected_client(&server, fast_config()).await;

    let log = Arc::new(Mutex::new(Vec::new()));
    for tag in ["first", "second"] {
        let log = Arc::clone(&log);
        client.register_notify_update(move |n| {
            let temp = n.payload().unwrap()["extruder"]["temperature"].as_f64().unwrap();
            log.lock().push(format!("{tag}:{temp}"));
        });
    }

    server.notify("notify_status_update", json!([{"extruder": {"temperature": 200.5}}, 10.0]));
    server.notify("notify_status_update", json!([{"extruder": {"temperature": 201.0}}, 11.0]));
    eventually(|| log.lock().len() == 4).await;

    assert_eq!(
        *log.lock(),
        vec!["first:200.5", "second:200.5", "first:201", "second:201"]
    );
}

#[tokio::test]
async fn test_unsubscribed_callback_stops_receiving() {
    let server = MockMoonraker::start().await;
    let client = connected_client(&server, fast_config()).await;

    let kept = Arc::new(AtomicUsize::new(0));
    let removed = Arc::new(AtomicUsize::new(0));
    let k = Arc::clone(&kept);
    let r = Arc::clone(&removed);
    client.register_notify_update(move |_| {
        k.fetch_add(1, Ordering::SeqCst);
    });
    let id = client.register_notify_update(move |_| {
        r.fetch_add(1, Ordering::SeqCst);
    });

    assert!(client.unsubscribe_notify_update(id));
    assert!(!client.unsubscribe_notify_update(id));
    assert!(!client.unsubscribe_notify_update(0));

    server.notify("notify_filelist_changed", json!([{"action": "create_file"}]));
    eventually(|| kept.load(Ordering::SeqCst) == 1).await;
    assert_eq!(removed.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_method_callbacks_stream_console_output() {
    let server = MockMoonraker::start().await;
    let client = connected_client(&server, fast_config()).await;

    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&lines);
    client.register_method_callback("notify_gcode_response", "console", move |n| {
        sink.lock().push(n.payload().unwrap().as_str().unwrap().to_owned());
    });

    server.notify("notify_gcode_response", json!(["// probe at 100,100 is z=1.234"]));
    server.notify("notify_gcode_response", json!(["ok"]));
    eventually(|| lines.lock().len() == 2).await;

    assert!(client.unregister_method_callback("notify_gcode_response", "console"));
    server.notify("notify_gcode_response", json!(["dropped"]));
    client.call("server.info", &Value::Null).await.unwrap();

    assert_eq!(*lines.lock(), vec!["// probe at 100,100 is z=1.234", "ok"]);
}

#[tokio::test]
async fn test_klippy_notifications_invoke_connection_callbacks() {
    let server = MockMoonraker::start().await;
    let client = MoonrakerClient::new(fast_config());
    let mut events = client.subscribe_events();
    let mut state = client.subscribe_state();

    let connected = Arc::new(AtomicUsize::new(0));
    let disconnected = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&connected);
    let d = Arc::clone(&disconnected);
    client
        .connect(
            &server.url,
            move || {
                c.fetch_add(1, Ordering::SeqCst);
            },
            move || {
                d.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();
    wait_for_state(&mut state, ConnectionState::Connected).await;
    eventually(|| connected.load(Ordering::SeqCst) == 1).await;

    server.notify("notify_klippy_disconnected", json!([]));
    eventually(|| disconnected.load(Ordering::SeqCst) == 1).await;
    server.notify("notify_klippy_ready", json!([]));
    eventually(|| connected.load(Ordering::SeqCst) == 2).await;

    let first = events.recv().await.unwrap();
    assert_eq!(first.kind, MoonrakerEventKind::KlippyDisconnected);
    assert!(first.is_error);
    let second = events.recv().await.unwrap();
    assert_eq!(second.kind, MoonrakerEventKind::KlippyReady);
    assert!(!second.is_error);

    // Klippy notifications never change the WebSocket state.
    assert_eq!(client.connection_state(), ConnectionState::Connected);
}

// ── Lifecycle ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_connect_sends_api_key_header() {
    let server = MockMoonraker::start().await;
    let config = fast_config().with_api_key("moonraker-secret".to_string().into());
    let client = connected_client(&server, config).await;

    assert_eq!(server.api_keys(), vec![Some("moonraker-secret".to_owned())]);
    assert_eq!(client.last_url().unwrap().as_str(), server.url);
}

#[tokio::test]
async fn test_never_accepting_endpoint_times_out() {
    // Bound but never accepted: the TCP handshake completes in the
    // kernel backlog, the WebSocket upgrade never does.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/websocket", listener.local_addr().unwrap());

    let connection_timeout = Duration::from_millis(300);
    let client = MoonrakerClient::new(ClientConfig::default().with_timeouts(TimeoutSettings {
        connection_timeout,
        ..TimeoutSettings::default()
    }));

    let transitions = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&transitions);
    client.set_state_change_callback(Some(Arc::new(move |old, new| {
        sink.lock().push((old, new, Instant::now()));
    })));
    let disconnected = Arc::new(AtomicUsize::new(0));
    let d = Arc::clone(&disconnected);

    let started = Instant::now();
    client
        .connect(&url, || {}, move || {
            d.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    eventually(|| transitions.lock().len() == 2).await;

    let transitions = transitions.lock().clone();
    assert_eq!(
        (transitions[0].0, transitions[0].1),
        (ConnectionState::Disconnected, ConnectionState::Connecting)
    );
    assert_eq!(
        (transitions[1].0, transitions[1].1),
        (ConnectionState::Connecting, ConnectionState::Disconnected)
    );

    let elapsed = transitions[1].2.duration_since(started);
    assert!(elapsed >= Duration::from_millis(250), "gave up too early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "gave up too late: {elapsed:?}");
    assert_eq!(disconnected.load(Ordering::SeqCst), 1);
    drop(listener);
}

#[tokio::test]
async fn test_disconnect_discards_pending_requests_silently() {
    let server = MockMoonraker::with_responder(Arc::new(|_, _| Reply::Silent)).await;
    let client = connected_client(&server, fast_config()).await;

    let fired = Arc::new(AtomicUsize::new(0));
    for method in ["printer.info", "server.info", "printer.objects.list"] {
        let on_ok = Arc::clone(&fired);
        let on_err = Arc::clone(&fired);
        client
            .send_jsonrpc_with_handlers(
                method,
                &Value::Null,
                move |_| {
                    on_ok.fetch_add(1, Ordering::SeqCst);
                },
                move |_| {
                    on_err.fetch_add(1, Ordering::SeqCst);
                },
                None,
            )
            .unwrap();
    }
    assert_eq!(client.pending_request_count(), 3);

    let generation = client.connection_generation();
    client.disconnect();
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    assert_eq!(client.pending_request_count(), 0);
    assert!(client.connection_generation() > generation);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unexpected_close_fails_pending_and_reconnects() {
    let server = MockMoonraker::with_responder(silent_for("printer.info")).await;
    let client = connected_client(&server, fast_config()).await;
    let mut events = client.subscribe_events();
    let mut state = client.subscribe_state();

    let updates = Arc::new(AtomicUsize::new(0));
    let u = Arc::clone(&updates);
    client.register_notify_update(move |_| {
        u.fetch_add(1, Ordering::SeqCst);
    });

    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    client
        .send_jsonrpc_with_handlers(
            "printer.info",
            &Value::Null,
            |_| {},
            move |err| sink.lock().push(err.kind),
            None,
        )
        .unwrap();
    server.wait_for_frames("printer.info", 1).await;

    server.drop_connections();
    eventually(|| !errors.lock().is_empty()).await;
    assert_eq!(*errors.lock(), vec![RpcErrorKind::ConnectionLost]);

    // The second accept implies the client already left `Connected`.
    eventually(|| server.connection_count() == 2).await;
    wait_for_state(&mut state, ConnectionState::Connected).await;
    assert_eq!(events.recv().await.unwrap().kind, MoonrakerEventKind::ConnectionLost);
    assert_eq!(events.recv().await.unwrap().kind, MoonrakerEventKind::Reconnected);
    assert_eq!(server.connection_count(), 2);

    // Subscriptions outlive the session that created them.
    server.notify("notify_status_update", json!([{"toolhead": {"homed_axes": "xyz"}}, 1.0]));
    eventually(|| updates.load(Ordering::SeqCst) == 1).await;
}

#[tokio::test]
async fn test_disconnect_from_error_callback_stays_disconnected() {
    let server = MockMoonraker::with_responder(silent_for("printer.info")).await;
    let client = connected_client(&server, fast_config()).await;

    let transitions = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&transitions);
    client.set_state_change_callback(Some(Arc::new(move |old, new| {
        seen.lock().push((old, new));
    })));

    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    let handle = client.clone();
    client
        .send_jsonrpc_with_handlers(
            "printer.info",
            &Value::Null,
            |_| {},
            move |err| {
                sink.lock().push(err.kind);
                handle.disconnect();
            },
            None,
        )
        .unwrap();
    server.wait_for_frames("printer.info", 1).await;

    server.drop_connections();
    eventually(|| !errors.lock().is_empty()).await;

    // Several backoff periods: a stale retry would have reconnected by now.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(*errors.lock(), vec![RpcErrorKind::ConnectionLost]);
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    assert_eq!(server.connection_count(), 1);
    assert_eq!(
        *transitions.lock(),
        vec![
            (ConnectionState::Connected, ConnectionState::Reconnecting),
            (ConnectionState::Reconnecting, ConnectionState::Disconnected),
        ]
    );
}

#[tokio::test]
async fn test_reconnect_gives_up_after_max_attempts() {
    let server = MockMoonraker::start().await;
    let mut config = fast_config();
    config.timeouts.reconnect = ReconnectPolicy {
        min_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(40),
        max_attempts: 2,
    };
    let client = connected_client(&server, config).await;
    let mut events = client.subscribe_events();
    let mut state = client.subscribe_state();

    server.shutdown();
    wait_for_state(&mut state, ConnectionState::Failed).await;

    assert_eq!(events.recv().await.unwrap().kind, MoonrakerEventKind::ConnectionLost);
    let failed = events.recv().await.unwrap();
    assert_eq!(failed.kind, MoonrakerEventKind::ConnectionFailed);
    assert!(failed.is_error);
}

#[tokio::test]
async fn test_reconnect_with_new_url_supersedes_old_session() {
    let first = MockMoonraker::start().await;
    let second = MockMoonraker::start().await;
    let client = connected_client(&first, fast_config()).await;
    let generation = client.connection_generation();

    let mut state = client.subscribe_state();
    client.connect(&second.url, || {}, || {}).unwrap();
    assert_eq!(client.connection_generation(), generation + 1);
    wait_for_state(&mut state, ConnectionState::Connected).await;

    client.call("server.info", &Value::Null).await.unwrap();
    assert!(first.frames_for("server.info").is_empty());
    assert_eq!(second.frames_for("server.info").len(), 1);
}

#[tokio::test]
async fn test_oversized_message_closes_session() {
    let server = MockMoonraker::start().await;
    let client = connected_client(&server, fast_config()).await;
    let mut events = client.subscribe_events();
    let mut state = client.subscribe_state();

    let padding = "x".repeat(5 * 1024 * 1024);
    server.notify("notify_status_update", json!([{"blob": padding}, 0.0]));

    wait_for_state(&mut state, ConnectionState::Disconnected).await;
    let event = events.recv().await.unwrap();
    assert_eq!(event.kind, MoonrakerEventKind::MessageOversized);
    assert!(event.is_error);
}

#[tokio::test]
async fn test_force_reconnect_opens_new_session() {
    let server = MockMoonraker::start().await;
    let client = connected_client(&server, fast_config()).await;
    let generation = client.connection_generation();

    let mut state = client.subscribe_state();
    client.force_reconnect().unwrap();
    assert!(client.connection_generation() > generation);
    wait_for_state(&mut state, ConnectionState::Connected).await;

    assert_eq!(server.connection_count(), 2);
    client.call("server.info", &Value::Null).await.unwrap();
}

// ── Runtime ─────────────────────────────────────────────────────────

#[test]
fn test_client_driven_from_thread_outside_runtime() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let server = runtime.block_on(MockMoonraker::start());
    let client = MoonrakerClient::with_runtime(fast_config(), runtime.handle().clone());
    let mut state = client.subscribe_state();

    client.connect(&server.url, || {}, || {}).unwrap();
    runtime.block_on(wait_for_state(&mut state, ConnectionState::Connected));

    let (tx, rx) = std::sync::mpsc::channel();
    client.discover_printer(
        move |hw| {
            let _ = tx.send(hw.hostname.clone());
        },
        |err| panic!("discovery failed: {err}"),
    );
    let hostname = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(hostname, "voron-0");
}
