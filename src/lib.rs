//! Concord - Multi-Provider LLM Consensus Pipeline
//!
//! Sends one prompt to several language-model providers, lets each model
//! revise its answer after reading the others, and has a further model
//! synthesize a single final answer.
//!
//! ## Core Features
//!
//! - **Three-Stage Pipeline**: Initial, PeerReview and Synthesis
//! - **Health-Aware Gating**: declarative, hot-reloadable provider policy
//! - **Circuit Breakers**: per-provider failure isolation
//! - **Request Dedup**: one execution per identical in-flight request
//!
//! ## Quick Start
//!
//! ```ignore
//! use concord::{ConfigLoader, PipelineController, PipelineRequest};
//!
//! let config = ConfigLoader::load()?;
//! let controller = PipelineController::from_config(&config)?;
//! controller.start();
//!
//! let result = controller
//!     .submit(PipelineRequest::new("What is 1+1?"))
//!     .await?;
//! println!("{}", result.synthesis.as_deref().unwrap_or_default());
//! ```
//!
//! ## Modules
//!
//! - [`ai`]: provider adapters, circuit breakers, call timeouts
//! - [`pipeline`]: selection, stage execution, health, policy, dedup
//! - [`config`]: layered configuration
//! - [`types`]: identifiers and error taxonomy

pub mod ai;
pub mod cli;
pub mod config;
pub mod constants;
pub mod pipeline;
pub mod types;

// =============================================================================
// Core Re-exports
// =============================================================================

// Configuration
pub use config::{Config, ConfigLoader};

// Error Types
pub use types::{
    ConcordError, ErrorCategory, GatingError, ModelId, ModelRole, ProviderError, Result,
    StageKind, ValidationError,
};

// =============================================================================
// Pipeline Re-exports
// =============================================================================

pub use pipeline::{
    GatingPolicy, PipelineController, PipelineRequest, PipelineResult, PipelineStatus,
    SubmitOptions,
};

// =============================================================================
// AI Re-exports
// =============================================================================

pub use ai::{AdapterRegistry, CircuitBreakerRegistry, ProviderAdapter, SharedAdapter};
