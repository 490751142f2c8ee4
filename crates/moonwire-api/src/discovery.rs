//! Printer discovery.
//!
//! After a session opens, a fixed chain of four requests populates the
//! [`PrinterHardware`] snapshot:
//!
//! 1. `printer.objects.list`: every Klipper object, partitioned into
//!    heaters, sensors, fans, LEDs and friends
//! 2. `server.info`: Moonraker/Klippy versions and server components
//! 3. `printer.info`: hostname, Klipper version and Klippy state
//! 4. `printer.objects.subscribe`: live status updates for the objects
//!    the UI cares about
//!
//! Each step runs only if the previous one succeeded. The chain is bound to
//! the [`ConnectionGeneration`] that was live when it started: once that
//! generation is superseded the chain stops without touching client state
//! or invoking any callback.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::client::MoonrakerClient;
use crate::error::Error;
use crate::events::{MoonrakerEvent, MoonrakerEventKind};
use crate::jsonrpc::Notification;
use crate::reconnect::ConnectionGeneration;
use crate::subscriptions::NOTIFY_STATUS_UPDATE;

/// Objects every session subscribes to, present or not.
const CORE_SUBSCRIPTIONS: [&str; 12] = [
    "print_stats",
    "virtual_sdcard",
    "toolhead",
    "gcode_move",
    "motion_report",
    "system_stats",
    "display_status",
    "bed_mesh",
    "exclude_object",
    "manual_probe",
    "stepper_enable",
    "idle_timeout",
];

const AFC_PREFIXES: [&str; 7] = [
    "AFC_stepper ",
    "AFC_hub ",
    "AFC_extruder ",
    "AFC_lane ",
    "AFC_BoxTurtle ",
    "AFC_OpenAMS ",
    "AFC_buffer ",
];

// ── Errors ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// A discovery request failed (server error, timeout, lost connection).
    #[error("{method} failed: {source}")]
    Request {
        method: &'static str,
        #[source]
        source: Error,
    },

    /// A request succeeded but its result had the wrong shape.
    #[error("{method} returned an unexpected result: {reason}")]
    InvalidResponse { method: &'static str, reason: String },

    /// A newer connection replaced the one this discovery ran on.
    /// Never passed to `on_error` callbacks.
    #[error("discovery superseded by a newer connection")]
    Superseded,
}

// ── Hardware snapshot ────────────────────────────────────────────────

/// Raw presence facts derived from the discovered object names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub heater_count: usize,
    pub sensor_count: usize,
    pub fan_count: usize,
    pub led_count: usize,
    pub stepper_count: usize,
    pub filament_sensor_count: usize,
    pub has_heated_bed: bool,
    pub has_bed_mesh: bool,
    pub has_exclude_object: bool,
    pub has_firmware_retraction: bool,
    pub has_tool_changer: bool,
    pub has_afc: bool,
    pub has_spoolman: bool,
}

/// What discovery learned about the connected printer.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PrinterHardware {
    pub heaters: Vec<String>,
    pub sensors: Vec<String>,
    pub fans: Vec<String>,
    pub leds: Vec<String>,
    pub steppers: Vec<String>,
    pub afc_objects: Vec<String>,
    pub filament_sensors: Vec<String>,
    /// Every object reported by `printer.objects.list`, in server order.
    pub objects: Vec<String>,
    pub hostname: String,
    /// Klipper software version from `printer.info`.
    pub software_version: String,
    pub moonraker_version: String,
    pub klippy_version: String,
    pub components: Vec<String>,
    pub klippy_state: String,
    pub state_message: String,
    pub capabilities: Capabilities,
}

impl PrinterHardware {
    /// Partition Klipper object names into hardware categories.
    pub fn from_objects<S: AsRef<str>>(names: &[S]) -> Self {
        let mut hw = Self::default();

        for name in names {
            let name = name.as_ref();
            hw.objects.push(name.to_owned());

            if name.starts_with("stepper_") {
                hw.steppers.push(name.to_owned());
            } else if (name.starts_with("extruder") && !name.starts_with("extruder_stepper"))
                || name == "heater_bed"
                || name.starts_with("heater_generic ")
            {
                hw.heaters.push(name.to_owned());
            } else if name.starts_with("temperature_sensor ") {
                hw.sensors.push(name.to_owned());
            } else if name.starts_with("temperature_fan ") {
                hw.sensors.push(name.to_owned());
                hw.fans.push(name.to_owned());
            } else if name == "fan"
                || name.starts_with("heater_fan ")
                || name.starts_with("fan_generic ")
                || name.starts_with("controller_fan ")
            {
                hw.fans.push(name.to_owned());
            } else if name.starts_with("output_pin ") {
                let lower = name.to_lowercase();
                if lower.contains("fan") {
                    hw.fans.push(name.to_owned());
                } else if ["light", "led", "lamp"].iter().any(|k| lower.contains(k)) {
                    hw.leds.push(name.to_owned());
                }
            } else if ["led ", "neopixel ", "dotstar "].iter().any(|p| name.starts_with(p)) {
                hw.leds.push(name.to_owned());
            } else if name == "AFC" || AFC_PREFIXES.iter().any(|p| name.starts_with(p)) {
                hw.afc_objects.push(name.to_owned());
            } else if name.starts_with("filament_switch_sensor ")
                || name.starts_with("filament_motion_sensor ")
            {
                hw.filament_sensors.push(name.to_owned());
            }
        }

        hw.refresh_capabilities();
        debug!(
            heaters = hw.heaters.len(),
            sensors = hw.sensors.len(),
            fans = hw.fans.len(),
            leds = hw.leds.len(),
            steppers = hw.steppers.len(),
            afc = hw.afc_objects.len(),
            filament_sensors = hw.filament_sensors.len(),
            "partitioned printer objects"
        );
        hw
    }

    pub fn has_object(&self, name: &str) -> bool {
        self.objects.iter().any(|o| o == name)
    }

    fn refresh_capabilities(&mut self) {
        self.capabilities = Capabilities {
            heater_count: self.heaters.len(),
            sensor_count: self.sensors.len(),
            fan_count: self.fans.len(),
            led_count: self.leds.len(),
            stepper_count: self.steppers.len(),
            filament_sensor_count: self.filament_sensors.len(),
            has_heated_bed: self.has_object("heater_bed"),
            has_bed_mesh: self.has_object("bed_mesh"),
            has_exclude_object: self.has_object("exclude_object"),
            has_firmware_retraction: self.has_object("firmware_retraction"),
            has_tool_changer: self.has_object("toolchanger"),
            has_afc: !self.afc_objects.is_empty(),
            has_spoolman: self.components.iter().any(|c| c == "spoolman"),
        };
    }

    fn apply_server_info(&mut self, info: ServerInfo) {
        self.moonraker_version = info.moonraker_version.unwrap_or_else(unknown);
        self.klippy_version = info.klippy_version.unwrap_or_else(unknown);
        self.components = info.components;
        self.refresh_capabilities();
    }

    fn apply_printer_info(&mut self, info: PrinterInfo) {
        self.hostname = info.hostname.unwrap_or_else(unknown);
        self.software_version = info.software_version.unwrap_or_else(unknown);
        self.klippy_state = info.state;
        self.state_message = info.state_message;
    }

    /// The `objects` parameter for `printer.objects.subscribe`.
    ///
    /// Every value is `null`, which asks Moonraker for all fields.
    pub fn subscription_objects(&self) -> Map<String, Value> {
        let mut objects = Map::new();
        let discovered = self
            .heaters
            .iter()
            .chain(&self.sensors)
            .chain(&self.fans)
            .chain(&self.leds)
            .chain(&self.afc_objects)
            .chain(&self.filament_sensors)
            .map(String::as_str);

        for name in CORE_SUBSCRIPTIONS.into_iter().chain(discovered) {
            objects.insert(name.to_owned(), Value::Null);
        }

        if self.capabilities.has_tool_changer {
            objects.insert("toolchanger".into(), Value::Null);
            for tool in self.objects.iter().filter(|o| o.starts_with("tool ")) {
                objects.insert(tool.clone(), Value::Null);
            }
        }
        if self.capabilities.has_firmware_retraction {
            objects.insert("firmware_retraction".into(), Value::Null);
        }
        objects
    }
}

fn unknown() -> String {
    "unknown".to_owned()
}

// ── Result shapes ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ObjectsList {
    objects: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ServerInfo {
    moonraker_version: Option<String>,
    klippy_version: Option<String>,
    components: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PrinterInfo {
    hostname: Option<String>,
    software_version: Option<String>,
    state: String,
    state_message: String,
}

fn parse<T: DeserializeOwned>(method: &'static str, value: Value) -> Result<T, DiscoveryError> {
    serde_json::from_value(value).map_err(|e| DiscoveryError::InvalidResponse {
        method,
        reason: e.to_string(),
    })
}

// ── Sequencer state ──────────────────────────────────────────────────

pub type HardwareCallback = Arc<dyn Fn(&PrinterHardware) + Send + Sync>;
pub type DiscoveryErrorCallback = Arc<dyn Fn(&DiscoveryError) + Send + Sync>;

/// A `discover_printer` call, kept so `force_reconnect()` can repeat it.
#[derive(Clone)]
pub(crate) struct DiscoveryRequest {
    pub on_complete: HardwareCallback,
    pub on_error: DiscoveryErrorCallback,
}

pub(crate) struct DiscoverySequencer {
    hardware: ArcSwap<PrinterHardware>,
    on_hardware_discovered: Mutex<Option<HardwareCallback>>,
    on_discovery_complete: Mutex<Option<HardwareCallback>>,
    last_request: Mutex<Option<DiscoveryRequest>>,
    /// Generation the most recent run started on. `0` before any run.
    started_generation: AtomicU64,
}

impl DiscoverySequencer {
    pub fn new() -> Self {
        Self {
            hardware: ArcSwap::from_pointee(PrinterHardware::default()),
            on_hardware_discovered: Mutex::new(None),
            on_discovery_complete: Mutex::new(None),
            last_request: Mutex::new(None),
            started_generation: AtomicU64::new(0),
        }
    }

    pub fn hardware(&self) -> Arc<PrinterHardware> {
        self.hardware.load_full()
    }

    pub fn clear(&self) {
        self.hardware.store(Arc::new(PrinterHardware::default()));
    }

    pub fn set_on_hardware_discovered(&self, callback: Option<HardwareCallback>) {
        *self.on_hardware_discovered.lock() = callback;
    }

    pub fn set_on_discovery_complete(&self, callback: Option<HardwareCallback>) {
        *self.on_discovery_complete.lock() = callback;
    }

    pub fn remember(&self, request: DiscoveryRequest) {
        *self.last_request.lock() = Some(request);
    }

    pub fn last_request(&self) -> Option<DiscoveryRequest> {
        self.last_request.lock().clone()
    }

    pub fn started_generation(&self) -> u64 {
        self.started_generation.load(Ordering::Acquire)
    }

    fn notify_hardware_discovered(&self, hardware: &PrinterHardware) {
        let callback = self.on_hardware_discovered.lock().clone();
        if let Some(callback) = callback {
            callback(hardware);
        }
    }

    fn notify_discovery_complete(&self, hardware: &PrinterHardware) {
        let callback = self.on_discovery_complete.lock().clone();
        if let Some(callback) = callback {
            callback(hardware);
        }
    }
}

// ── The chain ────────────────────────────────────────────────────────

/// Bind a discovery run to the live generation.
fn begin(client: &MoonrakerClient) -> ConnectionGeneration {
    let inner = client.inner();
    let generation = inner.reconnect.current();
    inner
        .discovery
        .started_generation
        .store(generation.value(), Ordering::Release);
    debug!(generation = generation.value(), "starting printer discovery");
    generation
}

/// Run discovery on the live generation and publish the result.
pub(crate) async fn discover(client: &MoonrakerClient) -> Result<Arc<PrinterHardware>, DiscoveryError> {
    let generation = begin(client);
    run(client, &generation).await
}

/// Callback form of [`discover`], run on its own task.
///
/// The generation is recorded before the task starts.
pub(crate) fn spawn(client: MoonrakerClient, request: DiscoveryRequest) {
    let generation = begin(&client);
    let runtime = client.inner().runtime.clone();
    runtime.spawn(async move {
        match run(&client, &generation).await {
            Ok(hardware) => (request.on_complete)(&hardware),
            Err(DiscoveryError::Superseded) => {}
            Err(e) => (request.on_error)(&e),
        }
    });
}

async fn run(
    client: &MoonrakerClient,
    generation: &ConnectionGeneration,
) -> Result<Arc<PrinterHardware>, DiscoveryError> {
    let result = tokio::select! {
        biased;
        () = generation.cancelled() => Err(DiscoveryError::Superseded),
        result = sequence(client, generation) => result,
    };

    match &result {
        Ok(hw) => info!(
            hostname = %hw.hostname,
            klipper = %hw.software_version,
            moonraker = %hw.moonraker_version,
            objects = hw.objects.len(),
            "printer discovery complete"
        ),
        Err(DiscoveryError::Superseded) => {
            debug!(generation = generation.value(), "discovery abandoned: connection superseded");
        }
        Err(e) => {
            warn!(error = %e, "printer discovery failed");
            client.inner().emit(MoonrakerEvent::new(
                MoonrakerEventKind::DiscoveryFailed,
                e.to_string(),
                true,
            ));
        }
    }
    result
}

async fn step(
    client: &MoonrakerClient,
    generation: &ConnectionGeneration,
    method: &'static str,
    params: Value,
) -> Result<Result<Value, Error>, DiscoveryError> {
    let result = client.call(method, &params).await;
    if !client.inner().reconnect.is_current(generation) {
        return Err(DiscoveryError::Superseded);
    }
    Ok(result)
}

async fn required_step<T: DeserializeOwned>(
    client: &MoonrakerClient,
    generation: &ConnectionGeneration,
    method: &'static str,
) -> Result<T, DiscoveryError> {
    let value = step(client, generation, method, Value::Null)
        .await?
        .map_err(|source| DiscoveryError::Request { method, source })?;
    parse(method, value)
}

async fn sequence(
    client: &MoonrakerClient,
    generation: &ConnectionGeneration,
) -> Result<Arc<PrinterHardware>, DiscoveryError> {
    let inner = client.inner();

    // Step 1
    let list: ObjectsList = required_step(client, generation, "printer.objects.list").await?;
    let mut hardware = PrinterHardware::from_objects(list.objects.as_slice());
    inner.discovery.notify_hardware_discovered(&hardware);

    // Step 2
    let info: ServerInfo = required_step(client, generation, "server.info").await?;
    debug!(moonraker = ?info.moonraker_version, klippy = ?info.klippy_version, "server info");
    hardware.apply_server_info(info);

    // Step 3
    let info: PrinterInfo = required_step(client, generation, "printer.info").await?;
    if matches!(info.state.as_str(), "shutdown" | "error") {
        warn!(state = %info.state, message = %info.state_message, "klippy is not ready");
    }
    hardware.apply_printer_info(info);

    // Step 4
    let method = "printer.objects.subscribe";
    let objects = hardware.subscription_objects();
    let count = objects.len();
    match step(client, generation, method, json!({ "objects": objects })).await? {
        Ok(result) => {
            info!(count, "subscribed to printer objects");
            if let Some(status) = result.get("status").filter(|s| s.is_object()) {
                inner.subscriptions.dispatch(&Notification {
                    method: NOTIFY_STATUS_UPDATE.to_owned(),
                    params: json!([status, 0.0]),
                });
            }
        }
        Err(Error::Rpc(e)) if e.is_protocol() => {
            warn!(error = %e, "subscription rejected, continuing without live updates");
            inner.emit(MoonrakerEvent::new(
                MoonrakerEventKind::DiscoveryFailed,
                format!("Failed to subscribe to printer updates: {}", e.message),
                false,
            ));
        }
        Err(source) => return Err(DiscoveryError::Request { method, source }),
    }

    // Publishing is the only mutation; a stale chain never reaches it.
    if !inner.reconnect.is_current(generation) {
        return Err(DiscoveryError::Superseded);
    }
    let hardware = Arc::new(hardware);
    inner.discovery.hardware.store(Arc::clone(&hardware));
    inner.discovery.notify_discovery_complete(&hardware);
    Ok(hardware)
}

// ── Tests ────────────────────────────────────────────────────────────
