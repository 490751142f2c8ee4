// ── MoonrakerClient ──
//
// Cloneable handle over an `Arc<ClientInner>`. The inner state owns every
// registry; the connection task for the live generation holds only a
// `Weak` to it, so dropping the last handle ends the session.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use secrecy::SecretString;
use serde_json::{Value, json};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, trace};
use url::Url;

use crate::config::{ClientConfig, TimeoutSettings};
use crate::connection::{self, ConnectionTarget};
use crate::discovery::{
    self, DiscoveryError, DiscoveryErrorCallback, DiscoveryRequest, DiscoverySequencer,
    HardwareCallback, PrinterHardware,
};
use crate::error::{Error, RpcError};
use crate::events::MoonrakerEvent;
use crate::gcode::{GcodeStoreEntry, GcodeStoreResult, annotate_gcode};
use crate::jsonrpc::{Notification, RequestId, SubscriptionId, encode_request};
use crate::reconnect::{ConnectionGeneration, ReconnectCoordinator};
use crate::requests::{Completion, RequestRegistry};
use crate::state::{ConnectionState, ConnectionStateMachine, StateChangeCallback};
use crate::subscriptions::SubscriptionRegistry;

/// Invoked when a session opens (or Klippy becomes ready) and when it drops.
pub type ConnectionCallback = Arc<dyn Fn() + Send + Sync>;

const EVENT_CHANNEL_SIZE: usize = 64;

// ── Shared state ─────────────────────────────────────────────────────

/// Outbound side of the live session.
struct SessionHandle {
    generation: u64,
    outbound: mpsc::UnboundedSender<String>,
}

pub(crate) struct ClientInner {
    /// Session and discovery tasks run here, whichever thread calls in.
    pub(crate) runtime: Handle,
    pub(crate) settings: ArcSwap<TimeoutSettings>,
    pub(crate) api_key: Option<SecretString>,
    pub(crate) state: ConnectionStateMachine,
    pub(crate) requests: RequestRegistry,
    pub(crate) subscriptions: SubscriptionRegistry,
    pub(crate) reconnect: ReconnectCoordinator,
    pub(crate) discovery: DiscoverySequencer,
    events: broadcast::Sender<Arc<MoonrakerEvent>>,
    session: Mutex<Option<SessionHandle>>,
    last_connection: Mutex<Option<ConnectionTarget>>,
    /// Generation on which the last discovery should be repeated once open.
    rediscover_generation: AtomicU64,
}

impl ClientInner {
    pub(crate) fn emit(&self, event: MoonrakerEvent) {
        debug!(kind = %event.kind, message = %event.message, "client event");
        // No receivers is fine.
        let _ = self.events.send(Arc::new(event));
    }

    /// Move to `new` only while `generation` is live. Returns `false` once
    /// a `connect()`, `disconnect()` or `force_reconnect()` superseded it.
    pub(crate) fn transition_if_current(
        &self,
        generation: &ConnectionGeneration,
        new: ConnectionState,
    ) -> bool {
        let applied = self
            .reconnect
            .run_if_current(generation, || {
                self.state.stage(new);
            })
            .is_some();
        self.state.deliver();
        applied
    }

    /// Install the outbound queue for `generation` and enter `Connected`.
    /// Fails if the generation was superseded.
    pub(crate) fn open_session(
        &self,
        generation: &ConnectionGeneration,
        outbound: mpsc::UnboundedSender<String>,
    ) -> bool {
        let opened = self
            .reconnect
            .run_if_current(generation, || {
                *self.session.lock() = Some(SessionHandle {
                    generation: generation.value(),
                    outbound,
                });
                self.reconnect.reset_attempts();
                self.state.stage(ConnectionState::Connected);
            })
            .is_some();
        self.state.deliver();
        opened
    }

    /// Drop the outbound queue if it still belongs to `generation`.
    pub(crate) fn detach_session_for(&self, generation: &ConnectionGeneration) {
        let mut session = self.session.lock();
        if session.as_ref().is_some_and(|s| s.generation == generation.value()) {
            *session = None;
        }
    }

    fn detach_session(&self) {
        self.session.lock().take();
    }

    fn ensure_connected(&self, method: &str) -> Result<(), Error> {
        if self.state.get() == ConnectionState::Connected {
            Ok(())
        } else {
            debug!(method, state = %self.state.get(), "send rejected: not connected");
            Err(Error::NotConnected {
                method: method.to_owned(),
            })
        }
    }

    fn send_frame(&self, method: &str, frame: String) -> Result<(), Error> {
        let session = self.session.lock();
        let sent = session
            .as_ref()
            .is_some_and(|s| s.outbound.send(frame).is_ok());
        if sent {
            Ok(())
        } else {
            Err(Error::SendFailed {
                method: method.to_owned(),
            })
        }
    }

    /// Tear down the session without invoking any request callback.
    pub(crate) fn disconnect(&self) {
        let generation = self.reconnect.advance();
        self.detach_session();
        let discarded = self.requests.clear_silently();
        self.discovery.clear();
        self.reconnect.reset_attempts();
        self.rediscover_generation.store(0, Ordering::Release);
        // A connect() racing on another thread may already own a newer generation.
        self.transition_if_current(&generation, ConnectionState::Disconnected);
        info!(generation = generation.value(), discarded, "disconnected");
    }

    /// Repeat the last discovery after a forced reconnect, unless the
    /// application already started one on this generation.
    pub(crate) fn resume_discovery(self: &Arc<Self>, generation: &ConnectionGeneration) {
        let wanted = self
            .rediscover_generation
            .compare_exchange(generation.value(), 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if !wanted || self.discovery.started_generation() == generation.value() {
            return;
        }
        if let Some(request) = self.discovery.last_request() {
            debug!(generation = generation.value(), "re-running discovery after forced reconnect");
            discovery::spawn(MoonrakerClient { inner: Arc::clone(self) }, request);
        }
    }
}

// ── Public handle ────────────────────────────────────────────────────

/// Client for one Moonraker instance.
///
/// Cheap to clone; every clone drives the same connection. Methods may be
/// called from any thread; background work runs on the runtime the client
/// was created with.
#[derive(Clone)]
pub struct MoonrakerClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for MoonrakerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MoonrakerClient")
            .field("state", &self.inner.state.get())
            .field("generation", &self.inner.reconnect.generation())
            .field("pending", &self.inner.requests.len())
            .finish_non_exhaustive()
    }
}

impl MoonrakerClient {
    /// Create a client bound to the current Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime. Use
    /// [`with_runtime`](Self::with_runtime) to construct one elsewhere.
    pub fn new(config: ClientConfig) -> Self {
        Self::with_runtime(config, Handle::current())
    }

    /// Create a client whose background tasks run on `runtime`.
    pub fn with_runtime(config: ClientConfig, runtime: Handle) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self {
            inner: Arc::new(ClientInner {
                runtime,
                settings: ArcSwap::from_pointee(config.timeouts),
                api_key: config.api_key,
                state: ConnectionStateMachine::new(),
                requests: RequestRegistry::new(),
                subscriptions: SubscriptionRegistry::new(),
                reconnect: ReconnectCoordinator::new(),
                discovery: DiscoverySequencer::new(),
                events,
                session: Mutex::new(None),
                last_connection: Mutex::new(None),
                rediscover_generation: AtomicU64::new(0),
            }),
        }
    }

    pub(crate) fn inner(&self) -> &ClientInner {
        &self.inner
    }

    // ── Connection lifecycle ─────────────────────────────────────────

    /// Open a session to `url` (`ws://host:port/websocket`).
    ///
    /// Supersedes any existing session: its pending requests are discarded
    /// silently and its late frames are ignored. `on_connected` runs each
    /// time a session opens and whenever Klippy reports ready;
    /// `on_disconnected` runs when the first open fails, when an open
    /// session drops, and when Klippy disconnects.
    pub fn connect<C, D>(&self, url: &str, on_connected: C, on_disconnected: D) -> Result<(), Error>
    where
        C: Fn() + Send + Sync + 'static,
        D: Fn() + Send + Sync + 'static,
    {
        let url = Url::parse(url)?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::WebSocketConnect(format!(
                "unsupported URL scheme '{}'",
                url.scheme()
            )));
        }
        self.start_session(
            ConnectionTarget {
                url,
                on_connected: Arc::new(on_connected),
                on_disconnected: Arc::new(on_disconnected),
            },
            false,
        );
        Ok(())
    }

    fn start_session(&self, target: ConnectionTarget, rediscover: bool) {
        let inner = &self.inner;
        let generation = inner.reconnect.advance();
        inner.detach_session();
        let discarded = inner.requests.clear_silently();
        inner.reconnect.reset_attempts();
        let flag = if rediscover { generation.value() } else { 0 };
        inner.rediscover_generation.store(flag, Ordering::Release);
        *inner.last_connection.lock() = Some(target.clone());

        if !inner.transition_if_current(&generation, ConnectionState::Connecting) {
            debug!(generation = generation.value(), "connect superseded before it started");
            return;
        }
        info!(url = %target.url, generation = generation.value(), discarded, "connecting");

        inner
            .runtime
            .spawn(connection::run(Arc::downgrade(inner), generation, target));
    }

    /// Close the session. Pending requests are discarded without invoking
    /// their callbacks and the discovery snapshot is cleared. The state is
    /// `Disconnected` when this returns.
    pub fn disconnect(&self) {
        self.inner.disconnect();
    }

    /// Tear down and reopen the last connection, then repeat the last
    /// discovery unless `on_connected` starts one itself.
    pub fn force_reconnect(&self) -> Result<(), Error> {
        let target = self
            .inner
            .last_connection
            .lock()
            .clone()
            .ok_or(Error::NoPreviousConnection)?;

        info!(url = %target.url, "forcing reconnect");
        self.inner.disconnect();
        let rediscover = self.inner.discovery.last_request().is_some();
        self.start_session(target, rediscover);
        Ok(())
    }

    // ── Requests ─────────────────────────────────────────────────────

    /// Fire-and-forget request with no parameters.
    pub fn send_jsonrpc(&self, method: &str) -> Result<(), Error> {
        self.send_jsonrpc_with_params(method, &Value::Null)
    }

    /// Fire-and-forget request. No ID is allocated and nothing is tracked.
    pub fn send_jsonrpc_with_params(&self, method: &str, params: &Value) -> Result<(), Error> {
        self.inner.ensure_connected(method)?;
        let frame = encode_request(method, Some(params), None)?;
        self.inner.send_frame(method, frame)?;
        trace!(method, "sent notification-style request");
        Ok(())
    }

    /// Tracked request with a success callback. Failures are logged.
    pub fn send_jsonrpc_with_callback<F>(
        &self,
        method: &str,
        params: &Value,
        on_success: F,
    ) -> Result<RequestId, Error>
    where
        F: FnOnce(Value) + Send + 'static,
    {
        let completion = Completion::Callbacks {
            on_success: Box::new(on_success),
            on_error: None,
        };
        self.send_tracked(method, params, completion, None)
    }

    /// Tracked request with success and error callbacks. `timeout` overrides
    /// the configured request timeout for this call.
    ///
    /// Exactly one of the callbacks runs, exactly once, unless the request
    /// is cancelled or the client disconnects first.
    pub fn send_jsonrpc_with_handlers<F, E>(
        &self,
        method: &str,
        params: &Value,
        on_success: F,
        on_error: E,
        timeout: Option<Duration>,
    ) -> Result<RequestId, Error>
    where
        F: FnOnce(Value) + Send + 'static,
        E: FnOnce(RpcError) + Send + 'static,
    {
        let completion = Completion::Callbacks {
            on_success: Box::new(on_success),
            on_error: Some(Box::new(on_error)),
        };
        self.send_tracked(method, params, completion, timeout)
    }

    fn send_tracked(
        &self,
        method: &str,
        params: &Value,
        completion: Completion,
        timeout: Option<Duration>,
    ) -> Result<RequestId, Error> {
        self.inner.ensure_connected(method)?;
        let timeout = timeout.unwrap_or_else(|| self.inner.settings.load().request_timeout);
        let id = self.inner.requests.register(method, completion, timeout);

        let sent = encode_request(method, Some(params), Some(id))
            .map_err(Error::from)
            .and_then(|frame| self.inner.send_frame(method, frame));
        if let Err(e) = sent {
            self.inner.requests.cancel(id);
            return Err(e);
        }
        trace!(id, method, "sent request");
        Ok(id)
    }

    /// Send a request and await its result with the default timeout.
    pub async fn call(&self, method: &str, params: &Value) -> Result<Value, Error> {
        let timeout = self.inner.settings.load().request_timeout;
        self.call_with_timeout(method, params, timeout).await
    }

    /// Send a request and await its result.
    ///
    /// Dropping the future cancels the request locally.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: &Value,
        timeout: Duration,
    ) -> Result<Value, Error> {
        let (tx, rx) = oneshot::channel();
        let id = self.send_tracked(method, params, Completion::Channel(tx), Some(timeout))?;
        let _guard = CancelOnDrop {
            requests: &self.inner.requests,
            id,
        };

        match rx.await {
            Ok(outcome) => outcome.map_err(Error::from),
            // Sender dropped without an outcome: discarded by disconnect.
            Err(_) => Err(RpcError::cancelled(method).into()),
        }
    }

    /// Suppress the callbacks of a pending request. Bytes already sent are
    /// not recalled; a late response is dropped.
    pub fn cancel_request(&self, id: RequestId) -> bool {
        self.inner.requests.cancel(id)
    }

    /// Expire overdue requests. The connection task also sweeps every second.
    pub fn process_timeouts(&self) -> usize {
        self.inner.requests.process_timeouts(Instant::now())
    }

    pub fn pending_request_count(&self) -> usize {
        self.inner.requests.len()
    }

    // ── G-code ───────────────────────────────────────────────────────

    /// Run a G-code script. Every non-blank line is tagged with its source.
    pub fn gcode_script(&self, script: &str) -> Result<(), Error> {
        let script = annotate_gcode(script);
        debug!(lines = script.lines().count(), "sending gcode script");
        self.send_jsonrpc_with_params("printer.gcode.script", &json!({ "script": script }))
    }

    /// The most recent `count` console entries, oldest first.
    pub async fn gcode_store(&self, count: u32) -> Result<Vec<GcodeStoreEntry>, Error> {
        let result = self
            .call("server.gcode_store", &json!({ "count": count }))
            .await?;
        let store: GcodeStoreResult = serde_json::from_value(result)?;
        Ok(store.gcode_store)
    }

    // ── Subscriptions ────────────────────────────────────────────────

    /// Receive every `notify_status_update` and `notify_filelist_changed`.
    pub fn register_notify_update<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.inner.subscriptions.register_notify_update(Arc::new(callback))
    }

    pub fn unsubscribe_notify_update(&self, id: SubscriptionId) -> bool {
        self.inner.subscriptions.unsubscribe_notify_update(id)
    }

    /// Receive every notification named `method` until unregistered.
    pub fn register_method_callback<F>(&self, method: &str, handler_name: &str, callback: F)
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.inner
            .subscriptions
            .register_method_callback(method, handler_name, Arc::new(callback));
    }

    pub fn unregister_method_callback(&self, method: &str, handler_name: &str) -> bool {
        self.inner
            .subscriptions
            .unregister_method_callback(method, handler_name)
    }

    // ── Discovery ────────────────────────────────────────────────────

    /// Run the discovery sequence on the current connection.
    ///
    /// Exactly one of the callbacks runs unless the connection is
    /// superseded first, in which case neither does.
    pub fn discover_printer<C, E>(&self, on_complete: C, on_error: E)
    where
        C: Fn(&PrinterHardware) + Send + Sync + 'static,
        E: Fn(&DiscoveryError) + Send + Sync + 'static,
    {
        let request = DiscoveryRequest {
            on_complete: Arc::new(on_complete) as HardwareCallback,
            on_error: Arc::new(on_error) as DiscoveryErrorCallback,
        };
        self.inner.discovery.remember(request.clone());
        discovery::spawn(self.clone(), request);
    }

    /// Run the discovery sequence and await the published snapshot.
    pub async fn discover(&self) -> Result<Arc<PrinterHardware>, DiscoveryError> {
        discovery::discover(self).await
    }

    /// The last published snapshot; empty until discovery completes.
    pub fn hardware(&self) -> Arc<PrinterHardware> {
        self.inner.discovery.hardware()
    }

    pub fn clear_discovery_cache(&self) {
        self.inner.discovery.clear();
    }

    /// Called after `printer.objects.list`, before the remaining steps.
    pub fn set_on_hardware_discovered(&self, callback: Option<HardwareCallback>) {
        self.inner.discovery.set_on_hardware_discovered(callback);
    }

    /// Called with the published snapshot at the end of every discovery.
    pub fn set_on_discovery_complete(&self, callback: Option<HardwareCallback>) {
        self.inner.discovery.set_on_discovery_complete(callback);
    }

    // ── State and events ─────────────────────────────────────────────

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state.get()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn set_state_change_callback(&self, callback: Option<StateChangeCallback>) {
        self.inner.state.set_observer(callback);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<Arc<MoonrakerEvent>> {
        self.inner.events.subscribe()
    }

    pub fn last_url(&self) -> Option<Url> {
        self.inner
            .last_connection
            .lock()
            .as_ref()
            .map(|target| target.url.clone())
    }

    /// Incremented by every `connect()`, `disconnect()` and `force_reconnect()`.
    pub fn connection_generation(&self) -> u64 {
        self.inner.reconnect.generation()
    }

    pub fn timeouts(&self) -> TimeoutSettings {
        **self.inner.settings.load()
    }

    /// Applies to requests sent and sessions opened after the call.
    pub fn configure_timeouts(&self, settings: TimeoutSettings) {
        debug!(?settings, "timeouts reconfigured");
        self.inner.settings.store(Arc::new(settings));
    }
}

/// Cancels an awaited request if its future is dropped early.
struct CancelOnDrop<'a> {
    requests: &'a RequestRegistry,
    id: RequestId,
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        self.requests.cancel(self.id);
    }
}
