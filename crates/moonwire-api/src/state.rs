// ── Connection state machine ──
//
// The single authoritative ConnectionState lives in a `watch` channel so
// async consumers can await transitions, while synchronous callers read it
// directly. Every mutation goes through `stage()`, and observer calls run
// from a queue in the order the states were stored.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

/// Connection state observable by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// Not connected.
    Disconnected,
    /// Initial connection attempt in progress.
    Connecting,
    /// Connected and ready.
    Connected,
    /// Automatic reconnection in progress after an unexpected close.
    Reconnecting,
    /// Reconnection attempts exhausted.
    Failed,
}

/// Observer invoked with `(old, new)` on every state change.
pub type StateChangeCallback = Arc<dyn Fn(ConnectionState, ConnectionState) + Send + Sync>;

/// Observer notifications waiting to run, in the order the states were stored.
#[derive(Default)]
struct Delivery {
    queue: VecDeque<(ConnectionState, ConnectionState)>,
    delivering: bool,
}

pub struct ConnectionStateMachine {
    state: watch::Sender<ConnectionState>,
    observer: Mutex<Option<StateChangeCallback>>,
    delivery: Mutex<Delivery>,
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            state,
            observer: Mutex::new(None),
            delivery: Mutex::new(Delivery::default()),
        }
    }

    pub fn get(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// A receiver that observes every subsequent transition.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Replace the state-change observer. `None` removes it.
    pub fn set_observer(&self, observer: Option<StateChangeCallback>) {
        *self.observer.lock() = observer;
    }

    /// Store `new` and notify the observer if the state actually changed.
    pub fn transition(&self, new: ConnectionState) -> ConnectionState {
        let old = self.stage(new);
        self.deliver();
        old
    }

    /// Store `new` and queue the observer call without running it.
    ///
    /// Must be followed by [`deliver`](Self::deliver) once the caller's
    /// own locks are released.
    pub(crate) fn stage(&self, new: ConnectionState) -> ConnectionState {
        let mut delivery = self.delivery.lock();
        let old = self.state.send_replace(new);
        if old != new {
            debug!(from = %old, to = %new, "connection state changed");
            delivery.queue.push_back((old, new));
        }
        old
    }

    /// Run queued observer calls in order, with no lock held.
    ///
    /// Only one caller drains at a time. A transition made from inside the
    /// observer, or from another thread meanwhile, is queued and delivered
    /// by the caller already draining.
    pub(crate) fn deliver(&self) {
        {
            let mut delivery = self.delivery.lock();
            if delivery.delivering || delivery.queue.is_empty() {
                return;
            }
            delivery.delivering = true;
        }

        loop {
            let (old, new) = {
                let mut delivery = self.delivery.lock();
                let Some(change) = delivery.queue.pop_front() else {
                    delivery.delivering = false;
                    return;
                };
                change
            };
            let observer = self.observer.lock().clone();
            if let Some(observer) = observer {
                observer(old, new);
            }
        }
    }
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
