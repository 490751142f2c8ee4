// ── Reconnect policy and connection generations ──
//
// A generation is stamped on every piece of async work tied to one
// connection attempt. Advancing the generation cancels the previous
// attempt's token, so work that selects on `cancelled()` stops at once and
// work that only checks `is_current()` drops its result.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

// ── ReconnectPolicy ──────────────────────────────────────────────────

/// Exponential backoff configuration for automatic reconnection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry. Default: 200ms.
    pub min_delay: Duration,

    /// Upper bound on backoff delay. Default: 2s.
    pub max_delay: Duration,

    /// Retries before giving up. `0` retries forever.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            max_attempts: 0,
        }
    }
}

impl ReconnectPolicy {
    /// Backoff delay before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let min = self.min_delay.as_secs_f64();
        let max = self.max_delay.as_secs_f64().max(min);

        let exponent = i32::try_from(attempt.min(30)).unwrap_or(30);
        let capped = (min * 2.0_f64.powi(exponent)).min(max);

        // Deterministic jitter seeded from the attempt number.
        let jitter_factor = 1.0 + 0.25 * (f64::from(attempt) * 7.3).sin();
        Duration::from_secs_f64((capped * jitter_factor).clamp(min, max))
    }

    pub fn is_unbounded(&self) -> bool {
        self.max_attempts == 0
    }
}

// ── ConnectionGeneration ─────────────────────────────────────────────

/// The identity of one connection attempt.
#[derive(Debug, Clone)]
pub struct ConnectionGeneration {
    value: u64,
    token: CancellationToken,
}

impl ConnectionGeneration {
    pub fn value(&self) -> u64 {
        self.value
    }

    /// Resolves once this generation has been superseded or the client dropped.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

// ── ReconnectCoordinator ─────────────────────────────────────────────

pub struct ReconnectCoordinator {
    generation: AtomicU64,
    current: Mutex<CancellationToken>,
    root: CancellationToken,
    attempts: AtomicU32,
}

impl ReconnectCoordinator {
    pub fn new() -> Self {
        let root = CancellationToken::new();
        // Generation 0 exists before any connect() and is never "live" work.
        let current = root.child_token();
        Self {
            generation: AtomicU64::new(0),
            current: Mutex::new(current),
            root,
            attempts: AtomicU32::new(0),
        }
    }

    /// Invalidate the current generation and start a new one.
    pub fn advance(&self) -> ConnectionGeneration {
        let mut current = self.current.lock();
        current.cancel();
        let token = self.root.child_token();
        *current = token.clone();
        let value = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        drop(current);

        debug!(generation = value, "connection generation advanced");
        ConnectionGeneration { value, token }
    }

    /// The live generation.
    pub fn current(&self) -> ConnectionGeneration {
        let current = self.current.lock();
        ConnectionGeneration {
            value: self.generation.load(Ordering::Acquire),
            token: current.clone(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn is_current(&self, generation: &ConnectionGeneration) -> bool {
        !generation.is_cancelled() && generation.value == self.generation()
    }

    /// Run `f` only while `generation` is live.
    ///
    /// `f` runs under the lock `advance()` takes, so no newer generation
    /// can start until it returns. `f` must not call `advance()`.
    pub fn run_if_current<R>(&self, generation: &ConnectionGeneration, f: impl FnOnce() -> R) -> Option<R> {
        let _current = self.current.lock();
        if !self.is_current(generation) {
            return None;
        }
        Some(f())
    }

    // ── Attempt accounting ───────────────────────────────────────────

    /// Consume one retry attempt and return its backoff delay, or `None`
    /// once `max_attempts` retries have been used.
    pub fn next_delay(&self, policy: &ReconnectPolicy) -> Option<Duration> {
        let attempt = self.attempts.fetch_add(1, Ordering::AcqRel);
        if !policy.is_unbounded() && attempt >= policy.max_attempts {
            return None;
        }
        Some(policy.delay_for(attempt))
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }

    pub fn reset_attempts(&self) {
        self.attempts.store(0, Ordering::Release);
    }
}

impl Default for ReconnectCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ReconnectCoordinator {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

// ── Tests ────────────────────────────────────────────────────────────
