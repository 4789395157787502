//! Per-channel circuit breakers.
//!
//! A breaker fails fast while a channel provider is down and probes for
//! recovery once a cool-down has passed.
//!
//! # State machine
//!
//! ```text
//!   ┌──────────┐  failure_threshold consecutive failures  ┌──────────┐
//!   │  CLOSED  │ ────────────────────────────────────────▶ │   OPEN   │
//!   └──────────┘                                           └──────────┘
//!        ▲                                                   │     ▲
//!        │ success_threshold                open_timeout     │     │ any
//!        │ consecutive successes            since last       │     │ failure
//!        │                                  failure          ▼     │
//!        │                                           ┌──────────────┐
//!        └────────────────────────────────────────── │  HALF-OPEN   │
//!                                                    └──────────────┘
//! ```
//!
//! The Open to Half-Open move is lazy: it happens on the first admission
//! check after the timeout, not on a timer.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use herald_core::RealClock;
//! use herald_dispatch::circuit::{CircuitBreakerManager, CircuitConfig};
//!
//! # async fn example() -> herald_dispatch::Result<()> {
//! let manager = CircuitBreakerManager::new(CircuitConfig::default(), Arc::new(RealClock::new()));
//! let breaker = manager.breaker("email").await;
//!
//! let value = breaker.execute(|| async { Ok::<_, herald_dispatch::DispatchError>(42) }).await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use herald_core::Clock;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::error::{DispatchError, Result};

/// Circuit breaker configuration shared by all channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Consecutive failures in Closed that open the circuit.
    pub failure_threshold: u32,
    /// Consecutive successes in Half-Open that close the circuit.
    pub success_threshold: u32,
    /// Cool-down after the last failure before a trial call is admitted.
    pub open_timeout: Duration,
    /// Trial calls admitted while Half-Open.
    pub half_open_max_requests: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            open_timeout: Duration::from_secs(60),
            half_open_max_requests: 3,
        }
    }
}

/// Current state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, all calls admitted.
    Closed,
    /// Failing fast, calls rejected.
    Open,
    /// Probing recovery with a limited number of calls.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Mutable state of one breaker.
#[derive(Debug, Clone)]
pub struct CircuitStats {
    /// Current circuit state.
    pub state: CircuitState,
    /// Consecutive failures since the last success.
    pub consecutive_failures: u32,
    /// Consecutive successes while Half-Open.
    pub consecutive_successes: u32,
    /// Trial calls recorded while Half-Open.
    pub half_open_requests: u32,
    /// When the most recent failure was recorded.
    pub last_failure_at: Option<Instant>,
    /// When the circuit last changed state.
    pub last_state_change: Instant,
}

impl CircuitStats {
    fn new(now: Instant) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            half_open_requests: 0,
            last_failure_at: None,
            last_state_change: now,
        }
    }

    fn reset_counters(&mut self) {
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        self.half_open_requests = 0;
    }
}

/// Serializable view of a breaker for health reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    /// Current circuit state.
    pub state: CircuitState,
    /// Consecutive failures since the last success.
    pub consecutive_failures: u32,
    /// Consecutive successes while Half-Open.
    pub consecutive_successes: u32,
    /// Trial calls recorded while Half-Open.
    pub half_open_requests: u32,
}

impl From<&CircuitStats> for CircuitSnapshot {
    fn from(stats: &CircuitStats) -> Self {
        Self {
            state: stats.state,
            consecutive_failures: stats.consecutive_failures,
            consecutive_successes: stats.consecutive_successes,
            half_open_requests: stats.half_open_requests,
        }
    }
}

/// Circuit breaker guarding one channel.
///
/// The stats lock is held only for the admission check and for recording the
/// outcome, never across the guarded call. Concurrent callers may therefore
/// both pass admission in Half-Open before either records a result.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    clock: Arc<dyn Clock>,
    stats: Mutex<CircuitStats>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    pub fn new(name: impl Into<String>, config: CircuitConfig, clock: Arc<dyn Clock>) -> Self {
        let stats = Mutex::new(CircuitStats::new(clock.now()));
        Self { name: name.into(), config, clock, stats }
    }

    /// Name of the channel this breaker guards.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs `op` if the breaker admits it and records the outcome.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::CircuitOpen` without invoking `op` when the
    /// circuit rejects the call, otherwise whatever `op` returns.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.try_acquire().await?;

        let result = op().await;
        match &result {
            Ok(_) => self.record_success().await,
            Err(_) => self.record_failure().await,
        }
        result
    }

    /// Current state, without applying the lazy Open to Half-Open move.
    pub async fn state(&self) -> CircuitState {
        self.stats.lock().await.state
    }

    /// Copy of the current stats.
    pub async fn stats(&self) -> CircuitStats {
        self.stats.lock().await.clone()
    }

    #[allow(clippy::significant_drop_tightening)]
    async fn try_acquire(&self) -> Result<()> {
        let mut stats = self.stats.lock().await;

        if stats.state == CircuitState::Open {
            let cooled_down = stats.last_failure_at.is_none_or(|failed_at| {
                self.clock.now().saturating_duration_since(failed_at) >= self.config.open_timeout
            });
            if cooled_down {
                self.transition_to_half_open(&mut stats);
            }
        }

        let admitted = match stats.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => stats.half_open_requests < self.config.half_open_max_requests,
        };

        if admitted {
            Ok(())
        } else {
            tracing::debug!(
                channel = %self.name,
                state = %stats.state,
                "circuit breaker rejected call"
            );
            Err(DispatchError::circuit_open(&self.name))
        }
    }

    #[allow(clippy::significant_drop_tightening)]
    async fn record_success(&self) {
        let mut stats = self.stats.lock().await;
        stats.consecutive_failures = 0;

        match stats.state {
            CircuitState::Closed => {},
            CircuitState::Open => {
                tracing::warn!(channel = %self.name, "recorded success for open circuit");
            },
            CircuitState::HalfOpen => {
                stats.consecutive_successes += 1;
                stats.half_open_requests += 1;

                if stats.consecutive_successes >= self.config.success_threshold {
                    self.transition_to_closed(&mut stats);
                }
            },
        }
    }

    #[allow(clippy::significant_drop_tightening)]
    async fn record_failure(&self) {
        let mut stats = self.stats.lock().await;
        stats.consecutive_failures += 1;
        stats.consecutive_successes = 0;
        stats.last_failure_at = Some(self.clock.now());

        match stats.state {
            CircuitState::Closed => {
                if stats.consecutive_failures >= self.config.failure_threshold {
                    self.transition_to_open(&mut stats);
                }
            },
            CircuitState::Open => {},
            CircuitState::HalfOpen => {
                stats.half_open_requests += 1;
                self.transition_to_open(&mut stats);
            },
        }
    }

    fn transition_to_open(&self, stats: &mut CircuitStats) {
        tracing::warn!(
            channel = %self.name,
            consecutive_failures = stats.consecutive_failures,
            "circuit breaker opening"
        );

        stats.state = CircuitState::Open;
        stats.last_state_change = self.clock.now();
    }

    fn transition_to_half_open(&self, stats: &mut CircuitStats) {
        tracing::info!(channel = %self.name, "circuit breaker transitioning to half-open");

        stats.state = CircuitState::HalfOpen;
        stats.last_state_change = self.clock.now();
        stats.half_open_requests = 0;
        stats.consecutive_successes = 0;
    }

    fn transition_to_closed(&self, stats: &mut CircuitStats) {
        tracing::info!(channel = %self.name, "circuit breaker closing, channel recovered");

        stats.state = CircuitState::Closed;
        stats.last_state_change = self.clock.now();
        stats.reset_counters();
    }
}

/// Registry of breakers keyed by channel name.
///
/// Breakers are created on first use and live as long as the manager.
#[derive(Debug)]
pub struct CircuitBreakerManager {
    config: CircuitConfig,
    clock: Arc<dyn Clock>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerManager {
    /// Creates an empty manager.
    pub fn new(config: CircuitConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock, breakers: RwLock::new(HashMap::new()) }
    }

    /// Returns the breaker for `name`, creating it if needed.
    pub async fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().await.get(name) {
            return breaker.clone();
        }

        let mut breakers = self.breakers.write().await;
        breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(name, self.config.clone(), self.clock.clone()))
            })
            .clone()
    }

    /// Snapshot of every breaker created so far.
    pub async fn snapshot(&self) -> BTreeMap<String, CircuitSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.read().await.values().cloned().collect();

        let mut snapshot = BTreeMap::new();
        for breaker in breakers {
            let stats = breaker.stats().await;
            snapshot.insert(breaker.name().to_string(), CircuitSnapshot::from(&stats));
        }
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use herald_core::TestClock;

    use super::*;

    fn test_config() -> CircuitConfig {
        CircuitConfig {
            failure_threshold: 3,
            success_threshold: 2,
            open_timeout: Duration::from_millis(100),
            half_open_max_requests: 2,
        }
    }

    fn breaker(clock: &TestClock) -> CircuitBreaker {
        CircuitBreaker::new("email", test_config(), Arc::new(clock.clone()))
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<()> {
        breaker.execute(|| async { Err::<(), _>(DispatchError::network("refused")) }).await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<()> {
        breaker.execute(|| async { Ok(()) }).await
    }

    #[tokio::test]
    async fn circuit_starts_closed() {
        let breaker = breaker(&TestClock::new());

        assert!(succeed(&breaker).await.is_ok());
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn consecutive_failures_open_circuit() {
        let breaker = breaker(&TestClock::new());

        for _ in 0..2 {
            let _ = fail(&breaker).await;
            assert_eq!(breaker.state().await, CircuitState::Closed);
        }

        let _ = fail(&breaker).await;
        assert_eq!(breaker.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn open_circuit_does_not_invoke_operation() {
        let breaker = breaker(&TestClock::new());
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }

        let calls = AtomicU32::new(0);
        let result = breaker
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(
            result,
            Err(DispatchError::CircuitOpen { ref channel }) if channel == "email"
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn timeout_admits_trial_call() {
        let clock = TestClock::new();
        let breaker = breaker(&clock);
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }

        clock.advance(Duration::from_millis(100));

        assert!(succeed(&breaker).await.is_ok());
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn half_open_closes_after_success_threshold() {
        let clock = TestClock::new();
        let breaker = breaker(&clock);
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        clock.advance(Duration::from_millis(150));

        succeed(&breaker).await.unwrap();
        succeed(&breaker).await.unwrap();

        let stats = breaker.stats().await;
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.consecutive_failures, 0);
        assert_eq!(stats.half_open_requests, 0);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_circuit() {
        let clock = TestClock::new();
        let breaker = breaker(&clock);
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        clock.advance(Duration::from_millis(150));

        succeed(&breaker).await.unwrap();
        let _ = fail(&breaker).await;

        assert_eq!(breaker.state().await, CircuitState::Open);
        assert!(matches!(succeed(&breaker).await, Err(DispatchError::CircuitOpen { .. })));
    }

    #[tokio::test]
    async fn success_resets_failure_counter() {
        let breaker = breaker(&TestClock::new());

        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        assert_eq!(breaker.stats().await.consecutive_failures, 2);

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.stats().await.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn manager_reuses_breakers_by_name() {
        let manager = CircuitBreakerManager::new(test_config(), Arc::new(TestClock::new()));

        let first = manager.breaker("sms").await;
        let second = manager.breaker("sms").await;
        let other = manager.breaker("push").await;

        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));

        let snapshot = manager.snapshot().await;
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot["sms"].state, CircuitState::Closed);
    }
}
