//! Circuit breaker: closed/open/half-open protection around a fallible
//! operation, plus a named registry so transports and the dispatcher can
//! share circuits by name (spec.md §4.4).

use std::collections::VecDeque;
use std::future::Future;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::CircuitConfig;

/// Circuit breaker state (spec.md §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation; the wrapped call runs.
    Closed,
    /// Short-circuiting; every call hits the fallback.
    Open,
    /// Probing; the next call runs and decides the next state.
    HalfOpen,
}

/// Point-in-time circuit statistics (spec.md §4.4, exposed via
/// `transport_circuit_stats`).
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count_in_window: usize,
    pub total_calls: u64,
    pub total_failures: u64,
    pub total_successes: u64,
    pub total_rejections: u64,
    pub opened_at: Option<chrono::DateTime<chrono::Utc>>,
}

struct Inner {
    config: CircuitConfig,
    state: CircuitState,
    /// Timestamps of failures within the rolling window (spec.md §4.4).
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    total_calls: u64,
    total_failures: u64,
    total_successes: u64,
    total_rejections: u64,
    /// Set while a half-open probe call is in flight, so concurrent callers
    /// are rejected instead of all running against the recovering
    /// dependency at once (spec.md §4.4 "the next invocation runs the
    /// operation", singular).
    half_open_probe_in_flight: bool,
}

impl Inner {
    fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            opened_at: None,
            total_calls: 0,
            total_failures: 0,
            total_successes: 0,
            total_rejections: 0,
            half_open_probe_in_flight: false,
        }
    }

    fn prune_window(&mut self) {
        let cutoff = Instant::now() - Duration::from_secs(self.config.within_secs);
        while matches!(self.failures.front(), Some(t) if *t < cutoff) {
            self.failures.pop_front();
        }
    }

    /// Resolve the effective state, applying the open -> half-open timeout
    /// transition lazily on read (spec.md §4.4).
    fn effective_state(&mut self) -> CircuitState {
        if self.state == CircuitState::Open {
            if let Some(opened_at) = self.opened_at {
                if opened_at.elapsed() >= Duration::from_secs(self.config.reset_after_secs) {
                    self.state = CircuitState::HalfOpen;
                }
            }
        }
        self.state
    }

    fn transition_to(&mut self, new: CircuitState, name: &str) {
        if self.state != new {
            tracing::info!(circuit = name, from = ?self.state, to = ?new, "circuit breaker transition");
            self.state = new;
            if new == CircuitState::Open {
                self.opened_at = Some(Instant::now());
                self.half_open_probe_in_flight = false;
            }
            if new == CircuitState::Closed {
                self.failures.clear();
                self.opened_at = None;
                self.half_open_probe_in_flight = false;
            }
        }
    }

    fn on_success(&mut self, name: &str) {
        self.total_calls += 1;
        self.total_successes += 1;
        match self.effective_state() {
            CircuitState::Closed => self.failures.clear(),
            CircuitState::HalfOpen => self.transition_to(CircuitState::Closed, name),
            CircuitState::Open => {}
        }
    }

    fn on_failure(&mut self, name: &str) {
        self.total_calls += 1;
        self.total_failures += 1;
        self.prune_window();
        self.failures.push_back(Instant::now());
        match self.effective_state() {
            CircuitState::Closed => {
                if self.failures.len() as u32 >= self.config.failure_threshold {
                    self.transition_to(CircuitState::Open, name);
                }
            }
            CircuitState::HalfOpen => self.transition_to(CircuitState::Open, name),
            CircuitState::Open => {}
        }
    }

    fn on_rejected(&mut self) {
        self.total_calls += 1;
        self.total_rejections += 1;
    }
}

/// Clears `half_open_probe_in_flight` when dropped, including during a
/// panic unwind through the wrapped future — without this, a probe call
/// whose future panics instead of resolving would leave the flag stuck
/// `true` forever, rejecting every future call and wedging the circuit
/// shut with no path back to `Closed` short of an external `reset()`.
struct ProbeGuard<'a> {
    inner: &'a Mutex<Inner>,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        self.inner.lock().half_open_probe_in_flight = false;
    }
}

/// Outcome returned from [`CircuitBreaker::execute`] when the circuit is
/// open and the wrapped operation did not run.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitOpenMarker {
    pub circuit: String,
    pub opened_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// A single named circuit breaker.
pub struct CircuitBreaker {
    name: String,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Inner::new(config)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().effective_state()
    }

    /// Run `f`. On success/failure, update the state machine; when the
    /// circuit is open, return `Err(CircuitOpenMarker)` without running `f`
    /// (spec.md §4.4 fallback semantics — the dispatcher/transport decides
    /// what the fallback does with the marker).
    pub async fn execute<F, T, E>(&self, f: F) -> Result<T, CircuitExecError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        let (can_run, took_probe) = {
            let mut inner = self.inner.lock();
            match inner.effective_state() {
                CircuitState::Open => {
                    inner.on_rejected();
                    (false, false)
                }
                CircuitState::HalfOpen => {
                    if inner.half_open_probe_in_flight {
                        inner.on_rejected();
                        (false, false)
                    } else {
                        inner.half_open_probe_in_flight = true;
                        (true, true)
                    }
                }
                CircuitState::Closed => (true, false),
            }
        };

        if !can_run {
            let opened_at = self.inner.lock().opened_at;
            return Err(CircuitExecError::Open(CircuitOpenMarker {
                circuit: self.name.clone(),
                opened_at: opened_at.map(instant_to_chrono),
            }));
        }

        let _probe_guard = took_probe.then(|| ProbeGuard { inner: &self.inner });

        match f.await {
            Ok(v) => {
                self.inner.lock().on_success(&self.name);
                Ok(v)
            }
            Err(e) => {
                self.inner.lock().on_failure(&self.name);
                Err(CircuitExecError::Inner(e))
            }
        }
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.transition_to(CircuitState::Closed, &self.name);
        inner.failures.clear();
    }

    pub fn stats(&self) -> CircuitStats {
        let mut inner = self.inner.lock();
        let state = inner.effective_state();
        CircuitStats {
            name: self.name.clone(),
            state,
            failure_count_in_window: inner.failures.len(),
            total_calls: inner.total_calls,
            total_failures: inner.total_failures,
            total_successes: inner.total_successes,
            total_rejections: inner.total_rejections,
            opened_at: inner.opened_at.map(instant_to_chrono),
        }
    }
}

/// Approximate conversion good enough for reporting in a marker; callers
/// should not rely on sub-second precision across process restarts.
fn instant_to_chrono(instant: Instant) -> chrono::DateTime<chrono::Utc> {
    let elapsed = instant.elapsed();
    chrono::Utc::now() - chrono::Duration::from_std(elapsed).unwrap_or_default()
}

#[derive(Debug)]
pub enum CircuitExecError<E> {
    Open(CircuitOpenMarker),
    Inner(E),
}

impl<E: std::fmt::Display> std::fmt::Display for CircuitExecError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitExecError::Open(m) => write!(f, "circuit '{}' is open", m.circuit),
            CircuitExecError::Inner(e) => write!(f, "{e}"),
        }
    }
}

impl<E: std::error::Error> std::error::Error for CircuitExecError<E> {}

/// Process-wide named circuit registry. Transports register their
/// `transport_publish`/`transport_subscribe` circuits here; the dispatcher
/// registers one per handler invocation context (spec.md §4.4).
#[derive(Default)]
pub struct CircuitRegistry {
    circuits: DashMap<String, std::sync::Arc<CircuitBreaker>>,
}

impl CircuitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create a circuit by name, using `config` only on first
    /// creation.
    pub fn get_or_create(&self, name: &str, config: CircuitConfig) -> std::sync::Arc<CircuitBreaker> {
        self.circuits
            .entry(name.to_string())
            .or_insert_with(|| std::sync::Arc::new(CircuitBreaker::new(name, config)))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<std::sync::Arc<CircuitBreaker>> {
        self.circuits.get(name).map(|e| e.clone())
    }

    /// Reset named circuits, or all circuits when `names` is empty
    /// (`reset_transport_circuits!` in spec.md §4.6).
    pub fn reset(&self, names: &[String]) {
        if names.is_empty() {
            for entry in self.circuits.iter() {
                entry.value().reset();
            }
        } else {
            for name in names {
                if let Some(c) = self.circuits.get(name) {
                    c.reset();
                }
            }
        }
    }

    pub fn stats_all(&self) -> Vec<CircuitStats> {
        self.circuits.iter().map(|e| e.value().stats()).collect()
    }
}
