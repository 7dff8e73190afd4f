//! Retry classification and the per-call retry state machine
//!
//! [`should_retry`] is a pure decision function: given the request, the error
//! from the last attempt and the number of retries so far, it decides whether
//! to try again and how long to pause. [`RetryLoop`] drives one logical call
//! through `Attempting -> Pausing -> Attempting ... -> Succeeded | FailedTerminal`
//! using only that function, so the policy can be tested without any I/O.

use std::time::Duration;

use super::config::ExecutionConfig;
use crate::api::constants::{error_codes, requests};
use crate::api::request::Request;
use crate::api::transport::TransportError;

/// Which rate limit the service reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleKind {
    /// Too many requests in the sliding window
    BurstLimit,
    /// Too much combined execution time in the sliding window
    TimeWindow,
    /// Too many concurrent requests
    ConcurrencyLimit,
}

/// Classification of a failed attempt, independent of the retry budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Backend storage timeout or deadlock
    BackendStorage,
    /// HTTP 502
    GatewayUnavailable,
    /// HTTP 503
    ServiceUnavailable,
    /// Explicit rate-limit fault
    Throttled(ThrottleKind),
    /// Anything else
    Other,
}

impl ErrorClass {
    /// Whether the service signalled admission control
    pub fn is_throttling(&self) -> bool {
        matches!(self, ErrorClass::ServiceUnavailable | ErrorClass::Throttled(_))
    }
}

/// Classify a transport error
pub fn classify(error: &TransportError) -> ErrorClass {
    let code = error.code();
    let message = error.message().to_uppercase();

    if code.is_some_and(|c| error_codes::BACKEND_STORAGE.contains(&c)) && message.contains("SQL") {
        return ErrorClass::BackendStorage;
    }

    if error.status() == Some(502) || message.contains("(502) BAD GATEWAY") {
        return ErrorClass::GatewayUnavailable;
    }

    if error.status() == Some(503) || message.contains("(503) SERVICE UNAVAILABLE") {
        return ErrorClass::ServiceUnavailable;
    }

    if let Some(fault) = error.as_fault() {
        match fault.error_code {
            error_codes::THROTTLING_BURST_REQUEST_LIMIT_EXCEEDED => {
                return ErrorClass::Throttled(ThrottleKind::BurstLimit);
            }
            error_codes::THROTTLING_TIME_EXCEEDED => {
                return ErrorClass::Throttled(ThrottleKind::TimeWindow);
            }
            error_codes::THROTTLING_CONCURRENCY_LIMIT_EXCEEDED => {
                return ErrorClass::Throttled(ThrottleKind::ConcurrencyLimit);
            }
            _ => {}
        }
    }

    ErrorClass::Other
}

/// Why a retry decision was made
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    BudgetExhausted,
    EventualConsistency,
    Transient(ErrorClass),
    NotRetryable,
}

/// Outcome of [`should_retry`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
    /// Pause before the next attempt (zero when not retrying)
    pub pause: Duration,
    pub is_throttled: bool,
    pub reason: RetryReason,
}

impl RetryDecision {
    fn stop(reason: RetryReason) -> Self {
        Self {
            retry: false,
            pause: Duration::ZERO,
            is_throttled: false,
            reason,
        }
    }

    fn retry(pause: Duration, is_throttled: bool, reason: RetryReason) -> Self {
        Self {
            retry: true,
            pause,
            is_throttled,
            reason,
        }
    }
}

/// `base + 2^attempt` seconds
pub fn exponential_pause(base: Duration, attempt: u32) -> Duration {
    base.saturating_add(Duration::from_secs(2u64.saturating_pow(attempt)))
}

/// Whether this request is a single-record read or a query
fn is_read(request: &Request) -> bool {
    request.is_named(requests::RETRIEVE) || request.is_named(requests::RETRIEVE_MULTIPLE)
}

/// Decide whether a failed attempt should be retried
///
/// `attempt` is the number of retries already performed for this call.
/// Rules are checked in order and the first match wins.
pub fn should_retry(
    request: &Request,
    error: &TransportError,
    attempt: u32,
    config: &ExecutionConfig,
) -> RetryDecision {
    if attempt >= config.max_retries {
        return RetryDecision::stop(RetryReason::BudgetExhausted);
    }

    // The real failure ("record not yet visible") surfaces as an arbitrary
    // error, so the error is not inspected here.
    if is_read(request)
        && request
            .entity_name()
            .is_some_and(|entity| config.eventual_consistency.applies_to(entity))
    {
        return RetryDecision::retry(config.retry_pause, false, RetryReason::EventualConsistency);
    }

    let class = classify(error);
    match class {
        ErrorClass::BackendStorage | ErrorClass::GatewayUnavailable => {
            RetryDecision::retry(config.retry_pause, false, RetryReason::Transient(class))
        }
        ErrorClass::ServiceUnavailable => {
            RetryDecision::retry(config.retry_pause, true, RetryReason::Transient(class))
        }
        ErrorClass::Throttled(kind) => {
            let server_pause = match kind {
                ThrottleKind::BurstLimit => error.as_fault().and_then(|f| f.retry_after()),
                _ => None,
            };
            let pause =
                server_pause.unwrap_or_else(|| exponential_pause(config.retry_pause, attempt));
            RetryDecision::retry(pause, true, RetryReason::Transient(class))
        }
        ErrorClass::Other => RetryDecision::stop(RetryReason::NotRetryable),
    }
}

/// Per-call retry counters, reset for every logical call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    /// Retries performed so far
    pub attempt: u32,
    /// Pause chosen by the last retry decision
    pub pause: Duration,
    /// Whether the last failure was throttling-caused
    pub is_throttled: bool,
}

/// Where one logical call currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPhase {
    Attempting,
    Pausing(Duration),
    Succeeded,
    FailedTerminal,
}

/// State machine for one logical call
#[derive(Debug, Clone)]
pub struct RetryLoop {
    state: RetryState,
    phase: RetryPhase,
}

impl RetryLoop {
    pub fn new(config: &ExecutionConfig) -> Self {
        Self {
            state: RetryState {
                attempt: 0,
                pause: config.retry_pause,
                is_throttled: false,
            },
            phase: RetryPhase::Attempting,
        }
    }

    pub fn state(&self) -> RetryState {
        self.state
    }

    pub fn phase(&self) -> RetryPhase {
        self.phase
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.phase, RetryPhase::Succeeded | RetryPhase::FailedTerminal)
    }

    /// The current attempt succeeded
    pub fn succeed(&mut self) {
        debug_assert_eq!(self.phase, RetryPhase::Attempting);
        self.phase = RetryPhase::Succeeded;
    }

    /// The current attempt failed; classify it and move to Pausing or FailedTerminal
    pub fn fail(
        &mut self,
        request: &Request,
        error: &TransportError,
        config: &ExecutionConfig,
    ) -> RetryDecision {
        debug_assert_eq!(self.phase, RetryPhase::Attempting);
        let decision = should_retry(request, error, self.state.attempt, config);

        if decision.retry {
            self.state.pause = decision.pause;
            self.state.is_throttled = decision.is_throttled;
            self.phase = RetryPhase::Pausing(decision.pause);
        } else {
            // Report throttling even when the budget ran out on a throttled error
            self.state.is_throttled = classify(error).is_throttling();
            self.phase = RetryPhase::FailedTerminal;
        }

        decision
    }

    /// The pause elapsed; start the next attempt
    pub fn resume(&mut self) {
        debug_assert!(matches!(self.phase, RetryPhase::Pausing(_)));
        self.state.attempt += 1;
        self.phase = RetryPhase::Attempting;
    }
}
