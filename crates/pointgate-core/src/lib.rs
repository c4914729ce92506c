//! # Pointgate Core
//!
//! Resilience control plane for partner point accumulation.
//!
//! ## Overview
//!
//! Every accumulation request passes an ordered admission pipeline before it
//! reaches the partner point service:
//!
//! - **Rate limiting** per partner class (fixed window, or GCRA via `governor`)
//! - **Circuit breaking** per downstream target over a count-based sliding window
//! - **Bounded retry** with exponential backoff for transient failures
//! - **Failure ledger** so nothing the gateway accepted is lost
//! - **Reconciliation** of failed records by a periodic scheduler
//! - **Lifecycle events** published to NATS for dead-letter capture
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`circuit_breaker`] | Per-target CLOSED / OPEN / HALF_OPEN state machine |
//! | [`config`] | YAML and environment configuration |
//! | [`control_plane`] | Composition root owning shared state |
//! | [`downstream`] | Point service client trait, HTTP and mock clients |
//! | [`error`] | Accumulation and validation errors |
//! | [`events`] | Lifecycle events and publishers |
//! | [`ledger`] | Async failure ledger trait |
//! | [`pipeline`] | Admission pipeline stages |
//! | [`policy`] | Per-partner-class policy bundles |
//! | [`rate_limiter`] | Per-partner-class admission limiters |
//! | [`retry`] | Backoff and retry decisions |
//! | [`scheduler`] | Background reconciliation |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pointgate_core::{AccumulationCommand, ControlPlane, GatewayConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GatewayConfig::load(None)?;
//!     let plane = ControlPlane::from_config(config, true).await?;
//!
//!     let command = AccumulationCommand::new("M-1", "P-1", "MART", 10_000);
//!     let accumulated = plane.pipeline().accumulate(&command).await?;
//!     println!("earned {} points", accumulated.record.points);
//!
//!     let report = plane.scheduler().tick().await;
//!     println!("reconciled {} record(s)", report.completed);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌──────────────────┐
//! │ Admission       │────▶│ Rate Limiter     │
//! │ Pipeline        │────▶│ Circuit Breaker  │
//! └────────┬────────┘     └──────────────────┘
//!          │
//!          ▼
//! ┌─────────────────┐     ┌──────────────────┐
//! │ Point Service   │     │ Event Publisher  │
//! │ (reqwest/mock)  │     │ (NATS/log)       │
//! └─────────────────┘     └──────────────────┘
//!          │
//!          ▼
//! ┌─────────────────┐     ┌──────────────────┐
//! │ Failure Ledger  │◀────│ Retry Scheduler  │
//! │ (DuckDB)        │     │                  │
//! └─────────────────┘     └──────────────────┘
//! ```
//!
//! ## Error Handling
//!
//! ```rust
//! use pointgate_core::{AccumulationError, ErrorKind};
//!
//! fn handle_error(error: AccumulationError) {
//!     match error.kind() {
//!         ErrorKind::Throttled => {
//!             // Caller may resubmit later
//!         }
//!         ErrorKind::CircuitOpen | ErrorKind::RetriesExhausted => {
//!             // Persisted; the scheduler will reconcile it
//!         }
//!         _ => {}
//!     }
//! }
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod control_plane;
pub mod downstream;
pub mod error;
pub mod events;
pub mod ledger;
pub mod pipeline;
pub mod policy;
pub mod rate_limiter;
pub mod retry;
pub mod scheduler;

// Circuit breaker
pub use circuit_breaker::{
    CallOutcome, CallPermit, CircuitBreaker, CircuitBreakerRegistry, CircuitMetrics, CircuitOpen,
    CircuitState,
};

// Configuration and composition
pub use config::{ConfigError, GatewayConfig};
pub use control_plane::{ControlPlane, ControlPlaneBuilder, ControlPlaneError};

// Downstream transport
pub use downstream::{
    AccumulationClient, AccumulationReceipt, AccumulationRequest, DownstreamError,
    HttpAccumulationClient, MockAccumulationClient, ScriptedAccumulationClient, ScriptedReply,
};

// Errors
pub use error::{AccumulationError, ErrorKind, ValidationError};

// Events
pub use events::{
    EventPublishError, EventPublisher, EventType, LifecycleEvent, LoggingEventPublisher,
    NatsEventPublisher, RecordingEventPublisher,
};

// Ledger access
pub use ledger::{FailureLedger, InMemoryLedger};

// Pipeline
pub use pipeline::{Accumulated, AccumulationCommand, AdmissionPipeline, ReconcileOutcome};

// Policies and shared state
pub use policy::{
    BackoffPolicy, CircuitBreakerPolicy, PartnerPolicy, PolicySet, RateLimitAlgorithm,
    RateLimitPolicy, RetryPolicy,
};
pub use rate_limiter::{Admission, RateLimiterRegistry};
pub use retry::{ErrorClass, RetryDecision, RetryPolicyEngine};
pub use scheduler::{RetryScheduler, SchedulerSettings, TickReport};

// Record model
pub use pointgate_ledger::{AccumulationRecord, Ledger, PartnerClass, RecordStatus};
