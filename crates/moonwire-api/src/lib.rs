// moonwire-api: Async Rust client for the Moonraker JSON-RPC WebSocket API

pub mod client;
pub mod config;
mod connection;
pub mod discovery;
pub mod error;
pub mod events;
pub mod gcode;
pub mod jsonrpc;
pub mod reconnect;
pub mod requests;
pub mod state;
pub mod subscriptions;

pub use client::{ConnectionCallback, MoonrakerClient};
pub use config::{ClientConfig, TimeoutSettings};
pub use discovery::{Capabilities, DiscoveryError, HardwareCallback, PrinterHardware};
pub use error::{Error, RpcError, RpcErrorKind};
pub use events::{MoonrakerEvent, MoonrakerEventKind};
pub use gcode::{GcodeEntryType, GcodeStoreEntry, annotate_gcode};
pub use jsonrpc::{Notification, RequestId, SubscriptionId};
pub use reconnect::{ConnectionGeneration, ReconnectPolicy};
pub use state::{ConnectionState, StateChangeCallback};
