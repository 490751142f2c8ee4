// ── Notification fan-out ──
//
// Two independent tables: status-update subscribers keyed by an opaque
// SubscriptionId, and persistent per-method handlers keyed by
// (method, handler name). Dispatch snapshots the callbacks under the
// table's lock and invokes them after releasing it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::jsonrpc::{INVALID_SUBSCRIPTION_ID, Notification, SubscriptionId};

/// Callback for server-pushed notifications.
pub type NotifyCallback = Arc<dyn Fn(&Notification) + Send + Sync>;

pub const NOTIFY_STATUS_UPDATE: &str = "notify_status_update";
pub const NOTIFY_FILELIST_CHANGED: &str = "notify_filelist_changed";

/// Methods delivered to every `register_notify_update` subscriber.
const BROADCAST_METHODS: [&str; 2] = [NOTIFY_STATUS_UPDATE, NOTIFY_FILELIST_CHANGED];

pub struct SubscriptionRegistry {
    next_id: AtomicU64,
    /// IDs only grow, so key order is registration order.
    notify: Mutex<BTreeMap<SubscriptionId, NotifyCallback>>,
    methods: Mutex<HashMap<String, IndexMap<String, NotifyCallback>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            notify: Mutex::new(BTreeMap::new()),
            methods: Mutex::new(HashMap::new()),
        }
    }

    // ── Status-update subscribers ────────────────────────────────────

    pub fn register_notify_update(&self, callback: NotifyCallback) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.notify.lock().insert(id, callback);
        trace!(id, "registered notify callback");
        id
    }

    /// Remove a subscriber. Unknown IDs (and `0`) return `false`.
    pub fn unsubscribe_notify_update(&self, id: SubscriptionId) -> bool {
        if id == INVALID_SUBSCRIPTION_ID {
            return false;
        }
        let removed = self.notify.lock().remove(&id).is_some();
        if removed {
            debug!(id, "unsubscribed notify callback");
        } else {
            debug!(id, "unsubscribe ignored: unknown subscription");
        }
        removed
    }

    pub fn notify_count(&self) -> usize {
        self.notify.lock().len()
    }

    // ── Method handlers ──────────────────────────────────────────────

    /// Register a persistent handler. An existing handler with the same
    /// name for `method` is replaced in place.
    pub fn register_method_callback(&self, method: &str, handler_name: &str, callback: NotifyCallback) {
        let mut methods = self.methods.lock();
        let handlers = methods.entry(method.to_owned()).or_default();
        if handlers.insert(handler_name.to_owned(), callback).is_some() {
            warn!(method, handler = handler_name, "replaced existing method handler");
        } else {
            debug!(method, handler = handler_name, "registered method handler");
        }
    }

    pub fn unregister_method_callback(&self, method: &str, handler_name: &str) -> bool {
        let mut methods = self.methods.lock();
        let Some(handlers) = methods.get_mut(method) else {
            debug!(method, "unregister ignored: no handlers for method");
            return false;
        };
        // shift_remove keeps the remaining handlers in insertion order.
        if handlers.shift_remove(handler_name).is_none() {
            debug!(method, handler = handler_name, "unregister ignored: unknown handler");
            return false;
        }
        if handlers.is_empty() {
            methods.remove(method);
        }
        debug!(method, handler = handler_name, "unregistered method handler");
        true
    }

    pub fn method_handler_count(&self, method: &str) -> usize {
        self.methods.lock().get(method).map_or(0, IndexMap::len)
    }

    // ── Dispatch ─────────────────────────────────────────────────────

    fn callbacks_for(&self, method: &str) -> Vec<NotifyCallback> {
        let mut callbacks = Vec::new();
        if BROADCAST_METHODS.contains(&method) {
            callbacks.extend(self.notify.lock().values().cloned());
        }
        if let Some(handlers) = self.methods.lock().get(method) {
            callbacks.extend(handlers.values().cloned());
        }
        callbacks
    }

    /// Deliver a notification to every interested callback, in order.
    /// Returns the number of callbacks invoked.
    pub fn dispatch(&self, notification: &Notification) -> usize {
        let callbacks = self.callbacks_for(&notification.method);
        for callback in &callbacks {
            callback(notification);
        }
        trace!(method = %notification.method, delivered = callbacks.len(), "dispatched notification");
        callbacks.len()
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
