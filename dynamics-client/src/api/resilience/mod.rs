//! Retry policy, configuration and diagnostics
//!
//! Provides the retry classifier and state machine, the execution
//! configuration, per-attempt logging and execution metrics.

pub mod concurrency;
pub mod config;
pub mod logging;
pub mod metrics;
pub mod retry;

pub use concurrency::{TransportGuard, TransportLock, TransportLockStats};
pub use config::{
    BatchConfig, EventualConsistencyPolicy, ExecutionConfig, ExecutionConfigBuilder,
    TransportLocking,
};
pub use logging::{ApiLogger, AttemptOutcome, AttemptRecord, DiagnosticsSink, MemorySink};
pub use metrics::{MetricsCollector, MetricsSnapshot};
pub use retry::{
    ErrorClass, RetryDecision, RetryLoop, RetryPhase, RetryReason, RetryState, ThrottleKind,
    classify, should_retry,
};
