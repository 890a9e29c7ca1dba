//! Per-endpoint circuit breaker
//!
//! TigerStyle: Explicit state machine, timers evaluated lazily against the
//! injected `TimeProvider`.
//!
//! ```text
//!            ratio >= threshold            halfOpenTime elapsed
//!  CLOSED ─────────────────────▶ OPEN ──────────────────────▶ HALF_OPEN
//!    ▲                            ▲                               │
//!    │        trial failure       └───────────────────────────────┤
//!    └────────────────────────────────────────────────────────────┘
//!                            trial success
//! ```
//!
//! Failure and pass counters reset every `window_time_ms`, independent of
//! the state. The ratio is only evaluated once more than
//! `min_request_count` samples were seen in the current window.

use crate::events::RegistryEvent;
use crate::node::NodeId;
use meshwork_core::config::CircuitBreakerConfig;
use meshwork_core::constants::CIRCUIT_BREAKER_REJECT_CODE_MIN;
use meshwork_core::io::TimeProvider;
use meshwork_core::metrics;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Result of one call through an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Timeout,
    /// Handler or transport error; a missing code counts as server-class
    Failed { code: Option<u16> },
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: u64,
    passes: u64,
    window_started_ms: u64,
    opened_at_ms: u64,
    /// When the half-open trial call was handed out
    trial_started_ms: Option<u64>,
}

/// Circuit breaker guarding one action endpoint
pub struct CircuitBreaker {
    action: String,
    node_id: NodeId,
    config: CircuitBreakerConfig,
    time: Arc<dyn TimeProvider>,
    events: broadcast::Sender<RegistryEvent>,
    metrics_enabled: bool,
    inner: Mutex<BreakerState>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("action", &self.action)
            .field("node_id", &self.node_id)
            .field("state", &self.lock().state)
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(
        action: impl Into<String>,
        node_id: NodeId,
        config: CircuitBreakerConfig,
        time: Arc<dyn TimeProvider>,
        events: broadcast::Sender<RegistryEvent>,
        metrics_enabled: bool,
    ) -> Self {
        debug_assert!(config.threshold > 0.0 && config.threshold <= 1.0);
        let now = time.monotonic_ms();
        Self {
            action: action.into(),
            node_id,
            config,
            time,
            events,
            metrics_enabled,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failures: 0,
                passes: 0,
                window_started_ms: now,
                opened_at_ms: 0,
                trial_started_ms: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        // A panic while holding the lock leaves plain counters behind
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current state, applying any elapsed timers first
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.tick(&mut inner);
        inner.state
    }

    /// Admit one call, claiming the trial slot when half-open
    ///
    /// Half-open admits a single trial until its outcome is recorded. A
    /// trial with no outcome after `half_open_time_ms` is abandoned and the
    /// slot is offered again.
    pub fn allows_request(&self) -> bool {
        let mut inner = self.lock();
        self.tick(&mut inner);
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if self.trial_pending(&inner) {
                    return false;
                }
                inner.trial_started_ms = Some(self.time.monotonic_ms());
                true
            }
        }
    }

    /// Whether [`allows_request`](Self::allows_request) would admit a call
    pub fn is_passable(&self) -> bool {
        let mut inner = self.lock();
        self.tick(&mut inner);
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => !self.trial_pending(&inner),
        }
    }

    fn trial_pending(&self, inner: &BreakerState) -> bool {
        inner.trial_started_ms.map_or(false, |started| {
            self.time.monotonic_ms().saturating_sub(started) < self.config.half_open_time_ms
        })
    }

    /// `(failures, passes)` in the current window
    pub fn counters(&self) -> (u64, u64) {
        let mut inner = self.lock();
        self.tick(&mut inner);
        (inner.failures, inner.passes)
    }

    /// Feed the outcome of one call
    pub fn record(&self, outcome: CallOutcome) {
        let mut inner = self.lock();
        self.tick(&mut inner);
        inner.trial_started_ms = None;

        match outcome {
            CallOutcome::Success => self.on_success(&mut inner),
            CallOutcome::Timeout if self.config.failure_on_timeout => self.on_failure(&mut inner),
            CallOutcome::Failed { code } if self.config.failure_on_reject => {
                if code.unwrap_or(CIRCUIT_BREAKER_REJECT_CODE_MIN) >= CIRCUIT_BREAKER_REJECT_CODE_MIN
                {
                    self.on_failure(&mut inner);
                }
            }
            _ => {}
        }
    }

    fn tick(&self, inner: &mut BreakerState) {
        let now = self.time.monotonic_ms();

        if now.saturating_sub(inner.window_started_ms) >= self.config.window_time_ms {
            inner.failures = 0;
            inner.passes = 0;
            inner.window_started_ms = now;
        }

        if inner.state == CircuitState::Open
            && now.saturating_sub(inner.opened_at_ms) >= self.config.half_open_time_ms
        {
            self.half_open(inner);
        }
    }

    fn on_success(&self, inner: &mut BreakerState) {
        inner.passes += 1;
        if inner.state == CircuitState::HalfOpen {
            self.close(inner);
        }
    }

    fn on_failure(&self, inner: &mut BreakerState) {
        inner.failures += 1;

        if inner.state == CircuitState::HalfOpen {
            self.open(inner);
            return;
        }

        if inner.state != CircuitState::Closed {
            return;
        }

        let total = inner.failures + inner.passes;
        if total > self.config.min_request_count {
            let rate = inner.failures as f64 / total as f64;
            if rate >= self.config.threshold {
                self.open(inner);
            }
        }
    }

    fn open(&self, inner: &mut BreakerState) {
        let total = (inner.failures + inner.passes).max(1);
        let rate = inner.failures as f64 / total as f64;

        inner.state = CircuitState::Open;
        inner.opened_at_ms = self.time.monotonic_ms();
        inner.trial_started_ms = None;

        warn!(
            action = %self.action,
            node_id = %self.node_id,
            failures = inner.failures,
            passes = inner.passes,
            rate,
            "Circuit breaker opened"
        );

        self.notify(
            RegistryEvent::CircuitBreakerOpened {
                action: self.action.clone(),
                node_id: self.node_id.clone(),
                failures: inner.failures,
                passes: inner.passes,
                rate,
            },
            CircuitState::Open,
        );
    }

    fn half_open(&self, inner: &mut BreakerState) {
        inner.state = CircuitState::HalfOpen;
        inner.trial_started_ms = None;

        debug!(action = %self.action, node_id = %self.node_id, "Circuit breaker half-opened");

        self.notify(
            RegistryEvent::CircuitBreakerHalfOpened {
                action: self.action.clone(),
                node_id: self.node_id.clone(),
            },
            CircuitState::HalfOpen,
        );
    }

    fn close(&self, inner: &mut BreakerState) {
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.passes = 0;
        inner.window_started_ms = self.time.monotonic_ms();

        info!(action = %self.action, node_id = %self.node_id, "Circuit breaker closed");

        self.notify(
            RegistryEvent::CircuitBreakerClosed {
                action: self.action.clone(),
                node_id: self.node_id.clone(),
            },
            CircuitState::Closed,
        );
    }

    fn notify(&self, event: RegistryEvent, state: CircuitState) {
        // No subscribers is fine
        let _ = self.events.send(event);
        if self.metrics_enabled {
            metrics::record_circuit_breaker_transition(
                &self.action,
                self.node_id.as_str(),
                state.as_str(),
            );
        }
    }
}
