//! Error types surfaced by the execution core

use uuid::Uuid;

use super::batch::BatchStatus;
use super::request::Fault;
use super::transport::TransportError;

/// Failure of one logical call through the execution engine
#[derive(Debug, Clone)]
pub enum ExecutionError {
    /// No transport is connected; never retried
    Uninitialized,
    /// The cancellation signal fired before the next attempt started
    Cancelled { correlation_id: Uuid, attempts: u32 },
    /// The call failed and will not be retried
    Terminal {
        error: TransportError,
        correlation_id: Uuid,
        /// Number of retries performed before giving up
        retries: u32,
        /// Whether the last retry decision was caused by throttling
        throttled: bool,
    },
    /// A batch operation was rejected before reaching the service
    Batch(BatchError),
}

impl ExecutionError {
    /// The service fault behind a terminal failure, if the service returned one
    pub fn fault(&self) -> Option<&Fault> {
        match self {
            Self::Terminal { error, .. } => error.as_fault(),
            _ => None,
        }
    }

    pub fn correlation_id(&self) -> Option<Uuid> {
        match self {
            Self::Cancelled { correlation_id, .. } | Self::Terminal { correlation_id, .. } => {
                Some(*correlation_id)
            }
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

impl std::fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionError::Uninitialized => {
                write!(f, "Client is not connected to an organization service")
            }
            ExecutionError::Cancelled {
                correlation_id,
                attempts,
            } => write!(
                f,
                "Request {} cancelled after {} attempt(s)",
                correlation_id, attempts
            ),
            ExecutionError::Terminal {
                error,
                correlation_id,
                retries,
                throttled,
            } => {
                write!(f, "Request {} failed", correlation_id)?;
                if *retries > 0 {
                    write!(f, " after {} retries", retries)?;
                }
                if *throttled {
                    write!(f, " (throttled)")?;
                }
                write!(f, ": {}", error)
            }
            ExecutionError::Batch(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for ExecutionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ExecutionError::Terminal { error, .. } => Some(error),
            ExecutionError::Batch(err) => Some(err),
            _ => None,
        }
    }
}

impl From<BatchError> for ExecutionError {
    fn from(err: BatchError) -> Self {
        ExecutionError::Batch(err)
    }
}

/// Rejection of a batch registry or executor operation
#[derive(Debug, Clone, PartialEq)]
pub enum BatchError {
    /// No batch with this id is registered
    NotFound { id: Uuid },
    /// The batch is not in the state the operation requires
    InvalidState { id: Uuid, status: BatchStatus },
    /// The batch has no items to execute
    Empty { id: Uuid },
    /// The registry already holds its maximum number of batches
    CapacityExceeded { limit: usize },
    /// The connected service version does not support batch execution
    Unavailable { version: String },
    /// The queued requests could not be packed into the combined request
    Encoding { id: Uuid, reason: String },
    /// The combined response could not be mapped back onto the items
    MalformedResponse { id: Uuid, reason: String },
}

impl std::fmt::Display for BatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchError::NotFound { id } => write!(f, "Batch {} not found", id),
            BatchError::InvalidState { id, status } => {
                write!(f, "Batch {} is {:?} and cannot be changed or executed", id, status)
            }
            BatchError::Empty { id } => write!(f, "Batch {} has no requests to execute", id),
            BatchError::CapacityExceeded { limit } => {
                write!(f, "Batch limit of {} reached - release finished batches first", limit)
            }
            BatchError::Unavailable { version } => write!(
                f,
                "Batch operations are not supported by service version {}",
                version
            ),
            BatchError::Encoding { id, reason } => {
                write!(f, "Batch {} could not be encoded: {}", id, reason)
            }
            BatchError::MalformedResponse { id, reason } => {
                write!(f, "Batch {} returned a malformed response: {}", id, reason)
            }
        }
    }
}

impl std::error::Error for BatchError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_error_display_and_fault() {
        let correlation_id = Uuid::new_v4();
        let err = ExecutionError::Terminal {
            error: TransportError::Fault(Fault::new(-2147015903, "Time limit exceeded")),
            correlation_id,
            retries: 3,
            throttled: true,
        };

        let text = err.to_string();
        assert!(text.contains("after 3 retries"));
        assert!(text.contains("(throttled)"));
        assert_eq!(err.fault().map(|f| f.error_code), Some(-2147015903));
        assert_eq!(err.correlation_id(), Some(correlation_id));
    }

    #[test]
    fn test_uninitialized_has_no_fault() {
        let err = ExecutionError::Uninitialized;
        assert!(err.fault().is_none());
        assert!(err.correlation_id().is_none());
    }

    #[test]
    fn test_batch_error_converts() {
        let id = Uuid::new_v4();
        let err: ExecutionError = BatchError::Empty { id }.into();
        assert!(matches!(err, ExecutionError::Batch(BatchError::Empty { .. })));
        assert!(err.to_string().contains("no requests"));
    }
}
