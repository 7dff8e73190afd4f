//! Organization service constants
//!
//! Error codes, request names and feature-version minimums used by the
//! execution core.

use super::transport::ServiceVersion;

/// Request names understood by the organization service
pub mod requests {
    pub const CREATE: &str = "Create";
    pub const RETRIEVE: &str = "Retrieve";
    pub const RETRIEVE_MULTIPLE: &str = "RetrieveMultiple";
    pub const UPDATE: &str = "Update";
    pub const DELETE: &str = "Delete";
    pub const EXECUTE_MULTIPLE: &str = "ExecuteMultiple";
}

/// Well-known request/response parameter names
pub mod parameters {
    pub const TARGET: &str = "Target";
    pub const ID: &str = "id";
    pub const ATTRIBUTES: &str = "Attributes";
    pub const COLUMN_SET: &str = "ColumnSet";
    pub const QUERY: &str = "Query";
    pub const ENTITY_COLLECTION: &str = "EntityCollection";
    pub const BYPASS_CUSTOM_PLUGIN_EXECUTION: &str = "BypassCustomPluginExecution";

    // ExecuteMultiple envelope
    pub const REQUESTS: &str = "Requests";
    pub const SETTINGS: &str = "Settings";
    pub const CONTINUE_ON_ERROR: &str = "ContinueOnError";
    pub const RETURN_RESPONSES: &str = "ReturnResponses";
    pub const RESPONSES: &str = "Responses";
    pub const IS_FAULTED: &str = "IsFaulted";
    pub const REQUEST_INDEX: &str = "RequestIndex";
    pub const RESPONSE: &str = "Response";
    pub const FAULT: &str = "Fault";
}

/// Fault error codes reported by the organization service
pub mod error_codes {
    /// SQL timeout surfaced by the platform
    pub const SQL_TIMEOUT: i32 = -2147204784;
    /// Generic backend failure (HRESULT COR_E_INVALIDOPERATION range)
    pub const GENERIC_SQL_ERROR: i32 = -2146233087;
    /// Number of requests in the sliding window exceeded
    pub const THROTTLING_BURST_REQUEST_LIMIT_EXCEEDED: i32 = -2147015902;
    /// Combined execution time in the sliding window exceeded
    pub const THROTTLING_TIME_EXCEEDED: i32 = -2147015903;
    /// Number of concurrent requests exceeded
    pub const THROTTLING_CONCURRENCY_LIMIT_EXCEEDED: i32 = -2147015898;

    /// Backend storage codes that are retried when the message mentions SQL
    pub const BACKEND_STORAGE: [i32; 2] = [SQL_TIMEOUT, GENERIC_SQL_ERROR];
}

/// Detail key carrying the server-suggested pause on burst-limit faults
pub const RETRY_AFTER_DETAIL: &str = "Retry-After";

/// Entities whose records may not be visible immediately after they are written
pub const EVENTUAL_CONSISTENCY_ENTITIES: [&str; 2] = ["asyncoperation", "importjob"];

/// Minimum service version that honours `BypassCustomPluginExecution`
pub const BYPASS_CUSTOM_PLUGIN_MIN_VERSION: ServiceVersion = ServiceVersion::new(9, 1, 0, 0);

/// Minimum service version that supports `ExecuteMultiple`
pub const BATCH_OPERATIONS_MIN_VERSION: ServiceVersion = ServiceVersion::new(5, 0, 9690, 3000);

/// Default maximum number of retries for one logical call
pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// Default pause between retries, in milliseconds
pub const DEFAULT_RETRY_PAUSE_MS: u64 = 5_000;

/// Default maximum number of batches held by a registry
pub const DEFAULT_MAX_BATCHES: usize = 50_000;

/// Default maximum number of requests in one batch
pub const DEFAULT_MAX_REQUESTS_PER_BATCH: usize = 5_000;
