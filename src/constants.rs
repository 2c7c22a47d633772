//! Global Constants
//!
//! Centralized constants for configuration and tuning.
//! All magic numbers should be defined here with documentation.

/// Circuit breaker constants
pub mod circuit_breaker {
    /// Number of consecutive failures before opening circuit
    pub const FAILURE_THRESHOLD: u32 = 5;

    /// Duration to wait before allowing a recovery probe (seconds)
    pub const RECOVERY_TIMEOUT_SECS: u64 = 60;
}

/// Stage execution constants
pub mod stage {
    /// Default per-call timeout (seconds)
    pub const TIMEOUT_PER_CALL_SECS: u64 = 30;

    /// Default maximum concurrent provider calls within one stage
    pub const MAX_CONCURRENCY: usize = 8;

    /// Delay before the single retry on transient network errors (milliseconds)
    pub const RETRY_DELAY_MS: u64 = 250;

    /// Retries allowed per call (transient network errors only)
    pub const MAX_RETRIES: usize = 1;
}

/// Pipeline controller constants
pub mod pipeline {
    /// Minimum Initial successes required to enter PeerReview
    pub const PEER_REVIEW_MIN_SUCCESSES: usize = 3;

    /// Overall request deadline (seconds)
    pub const REQUEST_DEADLINE_SECS: u64 = 180;

    /// Default sampling temperature
    pub const TEMPERATURE: f32 = 0.7;

    /// Default maximum tokens to generate per call
    pub const MAX_TOKENS: usize = 2048;
}

/// Provider health constants
pub mod health {
    /// Snapshot refresh interval (seconds)
    pub const REFRESH_INTERVAL_SECS: u64 = 300;

    /// Timeout for a single active probe (seconds)
    pub const PROBE_TIMEOUT_SECS: u64 = 10;
}

/// Dedup cache constants
pub mod dedup {
    /// Retention for completed results (seconds)
    pub const RESULT_TTL_SECS: u64 = 180;
}

/// Network constants
pub mod network {
    /// Default HTTP client timeout for adapters (seconds)
    pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

    /// Maximum bytes of an error body kept in error messages
    pub const MAX_ERROR_BODY_CHARS: usize = 512;
}
