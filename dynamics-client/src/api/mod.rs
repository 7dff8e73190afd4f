//! Organization service request execution
//!
//! Requests are sent through a [`Transport`] by the [`ExecutionEngine`], which
//! retries transient failures and throttling, or queued on a batch and sent
//! as one combined request. [`DynamicsClient`] ties both together.

pub mod batch;
pub mod client;
pub mod constants;
pub mod engine;
pub mod error;
pub mod request;
pub mod resilience;
pub mod transport;

pub use batch::{
    Batch, BatchExecutor, BatchItem, BatchItemResult, BatchRegistry, BatchStatus,
    CombinedResponse,
};
pub use client::{DynamicsClient, Submission};
pub use engine::ExecutionEngine;
pub use error::{BatchError, ExecutionError};
pub use request::{EntityReference, Fault, Request, Response, Target};
pub use resilience::{
    ApiLogger, AttemptOutcome, AttemptRecord, BatchConfig, DiagnosticsSink,
    EventualConsistencyPolicy, ExecutionConfig, MemorySink, MetricsSnapshot, RetryDecision,
    TransportLocking, should_retry,
};
pub use transport::{AuthenticationKind, ServiceVersion, Transport, TransportError};
