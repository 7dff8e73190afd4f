//! Client-side batching
//!
//! Requests are queued on a named batch in the registry, then submitted as a
//! single `ExecuteMultiple` call whose response is mapped back onto the
//! queued items.

pub mod executor;
pub mod models;
pub mod registry;

pub use executor::BatchExecutor;
pub use models::{Batch, BatchItem, BatchItemResult, BatchStatus, CombinedResponse};
pub use registry::BatchRegistry;
