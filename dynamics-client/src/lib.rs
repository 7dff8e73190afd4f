//! Request-execution core for the Dynamics 365 organization service
//!
//! Retry with throttling-aware backoff, optional serialization of transport
//! access, and client-side batching through `ExecuteMultiple`.

pub mod api;

pub use api::{
    Batch, BatchError, BatchStatus, CombinedResponse, DynamicsClient, ExecutionConfig,
    ExecutionEngine, ExecutionError, Fault, Request, Response, Transport, TransportError,
};
