//! Circuit Breaker Pattern for Provider Resilience
//!
//! Implements the circuit breaker pattern to prevent cascading failures
//! when model providers are experiencing issues.
//!
//! ## States
//!
//! - **Closed**: Normal operation, failures accumulate
//! - **Open**: Provider is failing, requests are rejected immediately
//! - **HalfOpen**: Exactly one probe request is in flight
//!
//! ## Transitions
//!
//! ```text
//! Closed --[failure_threshold consecutive failures]--> Open
//! Open --[recovery_timeout elapsed, next allow_request]--> HalfOpen (probe allowed)
//! HalfOpen --[probe success]--> Closed
//! HalfOpen --[probe failure]--> Open (opened_at reset)
//! ```

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::constants::circuit_breaker as cb_constants;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - requests flow through
    Closed,
    /// Provider is failing - requests rejected immediately
    Open,
    /// Testing recovery - a single probe is allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening circuit
    pub failure_threshold: u32,
    /// Duration to wait before the next request may probe recovery
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: cb_constants::FAILURE_THRESHOLD,
            recovery_timeout: Duration::from_secs(cb_constants::RECOVERY_TIMEOUT_SECS),
        }
    }
}

impl From<&crate::config::BreakerSettings> for CircuitBreakerConfig {
    fn from(settings: &crate::config::BreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold,
            recovery_timeout: Duration::from_secs(settings.recovery_timeout_secs),
        }
    }
}

/// Point-in-time copy of one provider's breaker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerState {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub opened_at: Option<Instant>,
    /// Total successes recorded
    pub success_count: u64,
    /// Total failures recorded
    pub failure_count: u64,
}

/// Unified internal state - all mutable state in single struct
/// to ensure atomicity of state transitions
#[derive(Debug)]
struct CircuitBreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    success_count: u64,
    failure_count: u64,
    blocked_count: u64,
}

impl CircuitBreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probe_in_flight: false,
            success_count: 0,
            failure_count: 0,
            blocked_count: 0,
        }
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.probe_in_flight = false;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.probe_in_flight = false;
    }

    fn recovery_elapsed(&self, timeout: Duration) -> bool {
        self.opened_at
            .map(|opened_at| opened_at.elapsed() >= timeout)
            .unwrap_or(true)
    }
}

/// Thread-safe circuit breaker for a single provider.
///
/// All state is protected by a single RwLock to ensure consistency
/// between failure counts and state transitions. The lock is never held
/// across an await point.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    provider_name: String,
    inner: RwLock<CircuitBreakerInner>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker for a provider
    pub fn new(provider_name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            provider_name: provider_name.into(),
            inner: RwLock::new(CircuitBreakerInner::new()),
        }
    }

    pub fn provider_name(&self) -> &str {
        &self.provider_name
    }

    /// Check if a request may proceed, reserving the probe slot when half-open.
    ///
    /// An open breaker whose recovery timeout has elapsed moves to HalfOpen
    /// on this call and lets this one request through as the probe.
    pub fn allow_request(&self) -> bool {
        self.reserve().is_some()
    }

    /// Admit one call and hold its reservation until the permit settles.
    ///
    /// A permit dropped without `record_success`/`record_failure` releases
    /// the half-open probe slot it holds.
    pub fn try_acquire(self: &Arc<Self>) -> Option<CallPermit> {
        self.reserve().map(|probe| CallPermit {
            breaker: Arc::clone(self),
            probe,
            settled: false,
        })
    }

    /// `Some(true)` when the admitted call is the half-open probe
    fn reserve(&self) -> Option<bool> {
        let mut inner = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        match inner.state {
            CircuitState::Closed => Some(false),
            CircuitState::Open => {
                if inner.recovery_elapsed(self.config.recovery_timeout) {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    tracing::info!(
                        "Circuit breaker [{}]: Transitioning to HALF_OPEN (probe allowed)",
                        self.provider_name
                    );
                    Some(true)
                } else {
                    inner.blocked_count += 1;
                    tracing::debug!(
                        "Circuit breaker [{}]: Request blocked (circuit OPEN)",
                        self.provider_name
                    );
                    None
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    inner.blocked_count += 1;
                    tracing::debug!(
                        "Circuit breaker [{}]: Probe already in flight",
                        self.provider_name
                    );
                    None
                } else {
                    inner.probe_in_flight = true;
                    Some(true)
                }
            }
        }
    }

    /// Whether `allow_request` would currently succeed, without side effects.
    pub fn would_allow(&self) -> bool {
        let inner = self
            .inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => inner.recovery_elapsed(self.config.recovery_timeout),
            CircuitState::HalfOpen => !inner.probe_in_flight,
        }
    }

    /// Record a successful request
    pub fn record_success(&self) {
        let mut inner = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        inner.success_count += 1;
        inner.consecutive_failures = 0;

        if inner.state == CircuitState::HalfOpen {
            inner.close();
            tracing::info!(
                "Circuit breaker [{}]: Closed (provider recovered)",
                self.provider_name
            );
        }
    }

    /// Record a failed request. Returns `true` if this failure opened the circuit.
    pub fn record_failure(&self) -> bool {
        let mut inner = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        inner.failure_count += 1;
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.open();
                    tracing::warn!(
                        "Circuit breaker [{}]: Opened after {} consecutive failures (recovery: {:?})",
                        self.provider_name,
                        inner.consecutive_failures,
                        self.config.recovery_timeout
                    );
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                inner.open();
                tracing::warn!(
                    "Circuit breaker [{}]: Re-opened after failed probe",
                    self.provider_name
                );
                true
            }
            CircuitState::Open => false,
        }
    }

    /// Release a half-open probe whose call was cancelled before it settled.
    ///
    /// Nothing is counted; the next request may probe again.
    pub fn abandon_probe(&self) {
        let mut inner = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if inner.state == CircuitState::HalfOpen && inner.probe_in_flight {
            inner.probe_in_flight = false;
            tracing::debug!(
                "Circuit breaker [{}]: Probe abandoned",
                self.provider_name
            );
        }
    }

    /// Current breaker state
    pub fn status(&self) -> CircuitBreakerState {
        let inner = self
            .inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        CircuitBreakerState {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            opened_at: inner.opened_at,
            success_count: inner.success_count,
            failure_count: inner.failure_count,
        }
    }

    /// Get statistics for monitoring
    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self
            .inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        CircuitBreakerStats {
            provider_name: self.provider_name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            success_count: inner.success_count,
            failure_count: inner.failure_count,
            blocked_count: inner.blocked_count,
            time_in_state: inner.opened_at.map(|t| t.elapsed()),
        }
    }

    /// Force reset to closed state (for manual intervention)
    pub fn reset(&self) {
        let mut inner = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        inner.close();

        tracing::info!(
            "Circuit breaker [{}]: Manually reset to CLOSED",
            self.provider_name
        );
    }
}

// =============================================================================
// Call Permit
// =============================================================================

/// Admission for one call, settled exactly once.
pub struct CallPermit {
    breaker: Arc<CircuitBreaker>,
    probe: bool,
    settled: bool,
}

impl CallPermit {
    /// Whether this call is the half-open probe
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn record_success(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    /// Returns `true` if this failure opened the circuit.
    pub fn record_failure(mut self) -> bool {
        self.settled = true;
        self.breaker.record_failure()
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.abandon_probe();
        }
    }
}

/// Statistics for monitoring circuit breaker state
#[derive(Debug, Clone, serde::Serialize)]
pub struct CircuitBreakerStats {
    pub provider_name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub success_count: u64,
    pub failure_count: u64,
    pub blocked_count: u64,
    #[serde(skip)]
    pub time_in_state: Option<Duration>,
}

impl CircuitBreakerStats {
    /// Format as human-readable summary
    pub fn summary(&self) -> String {
        let time_str = self
            .time_in_state
            .map(|d| format!(" for {:.1}s", d.as_secs_f64()))
            .unwrap_or_default();

        format!(
            "[{}] {} | consecutive={} successes={} failures={} blocked={}{}",
            self.provider_name,
            self.state,
            self.consecutive_failures,
            self.success_count,
            self.failure_count,
            self.blocked_count,
            time_str
        )
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Provider id → breaker map, created lazily on first use.
///
/// Uses DashMap for lock-free concurrent access across requests.
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// Breaker for a provider, creating it on first use
    pub fn breaker(&self, provider: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(provider) {
            return Arc::clone(existing.value());
        }
        Arc::clone(
            self.breakers
                .entry(provider.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(provider, self.config.clone())))
                .value(),
        )
    }

    pub fn allow_request(&self, provider: &str) -> bool {
        self.breaker(provider).allow_request()
    }

    pub fn would_allow(&self, provider: &str) -> bool {
        self.breaker(provider).would_allow()
    }

    pub fn record_failure(&self, provider: &str) -> bool {
        self.breaker(provider).record_failure()
    }

    pub fn status(&self, provider: &str) -> CircuitBreakerState {
        self.breaker(provider).status()
    }

    /// Get circuit breaker stats for all known providers, sorted by name
    pub fn all_stats(&self) -> Vec<CircuitBreakerStats> {
        let mut stats: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| entry.value().stats())
            .collect();
        stats.sort_by(|a, b| a.provider_name.cmp(&b.provider_name));
        stats
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
