//! Execution engine
//!
//! Runs one logical call against a transport: assigns the correlation id,
//! serializes transport access, measures each attempt and drives the retry
//! state machine until the call succeeds or fails terminally.

use arc_swap::ArcSwap;
use chrono::Utc;
use log::{debug, warn};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::constants::{BYPASS_CUSTOM_PLUGIN_MIN_VERSION, parameters};
use super::error::ExecutionError;
use super::request::{Request, Response};
use super::resilience::{
    ApiLogger, AttemptOutcome, AttemptRecord, ExecutionConfig, MetricsCollector, MetricsSnapshot,
    RetryLoop, TransportLock, TransportLockStats,
};
use super::transport::{AuthenticationKind, ServiceVersion, Transport, TransportError};

/// What the loop does after an attempt
enum Step {
    Finished(Result<Response, ExecutionError>),
    Pause(Duration),
}

/// Measurements of one transport call
struct Attempt<'a> {
    request: &'a Request,
    tag: Option<&'a str>,
    correlation_id: Uuid,
    elapsed: Duration,
    lock_wait: Duration,
}

/// Executes requests through one transport with retry and locking
///
/// Cloning is cheap; clones share the transport, lock, configuration,
/// metrics and last-error slot.
#[derive(Clone)]
pub struct ExecutionEngine {
    transport: Arc<dyn Transport>,
    config: Arc<ArcSwap<ExecutionConfig>>,
    lock: TransportLock,
    logger: ApiLogger,
    metrics: Arc<MetricsCollector>,
    last_error: Arc<Mutex<Option<ExecutionError>>>,
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("service_version", &self.transport.service_version())
            .field("config", &*self.config.load_full())
            .finish()
    }
}

impl ExecutionEngine {
    pub fn new(transport: Arc<dyn Transport>, config: ExecutionConfig) -> Self {
        debug!(
            "Execution engine connected: auth={:?} version={} max_retries={} pause={:?} locking={:?}",
            transport.authentication_kind(),
            transport.service_version(),
            config.max_retries,
            config.retry_pause,
            config.locking
        );

        Self {
            transport,
            config: Arc::new(ArcSwap::from_pointee(config)),
            lock: TransportLock::new(),
            logger: ApiLogger::new(),
            metrics: Arc::new(MetricsCollector::new()),
            last_error: Arc::new(Mutex::new(None)),
        }
    }

    /// Replace the diagnostics logger
    pub fn with_logger(mut self, logger: ApiLogger) -> Self {
        self.logger = logger;
        self
    }

    /// Current configuration snapshot
    pub fn config(&self) -> Arc<ExecutionConfig> {
        self.config.load_full()
    }

    /// Swap the configuration; calls already in progress keep their snapshot
    ///
    /// Batch limits are enforced by the batch registry, not the engine; use
    /// `DynamicsClient::set_config` to update both.
    pub fn set_config(&self, config: ExecutionConfig) {
        self.config.store(Arc::new(config));
    }

    pub fn service_version(&self) -> ServiceVersion {
        self.transport.service_version()
    }

    pub fn authentication_kind(&self) -> AuthenticationKind {
        self.transport.authentication_kind()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn lock_stats(&self) -> TransportLockStats {
        self.lock.stats()
    }

    /// The most recent terminal failure, kept until the next one or until cleared
    pub fn last_error(&self) -> Option<ExecutionError> {
        self.last_error.lock().ok().and_then(|slot| slot.clone())
    }

    pub fn clear_last_error(&self) {
        if let Ok(mut slot) = self.last_error.lock() {
            *slot = None;
        }
    }

    /// Execute a request, blocking the calling thread between attempts
    ///
    /// Must not be called from inside an async runtime; use
    /// [`ExecutionEngine::execute_async`] there.
    pub fn execute(
        &self,
        request: Request,
        tag: Option<&str>,
        bypass_custom_logic: bool,
    ) -> Result<Response, ExecutionError> {
        let config = self.config.load_full();
        let (request, correlation_id) = self.prepare(request, bypass_custom_logic);
        self.metrics.record_call();

        let mut retry = RetryLoop::new(&config);
        loop {
            let guard = self.lock.acquire_blocking(config.locking);
            let start = Instant::now();
            let result = self.transport.send(&request);
            let elapsed = start.elapsed();
            let lock_wait = guard.wait();
            drop(guard);

            let attempt = Attempt {
                request: &request,
                tag,
                correlation_id,
                elapsed,
                lock_wait,
            };
            match self.complete_attempt(&mut retry, &config, attempt, result) {
                Step::Finished(result) => return result,
                Step::Pause(pause) => {
                    std::thread::sleep(pause);
                    retry.resume();
                }
            }
        }
    }

    /// Execute a request without blocking the executor
    ///
    /// Cancellation is checked before every attempt, including while waiting
    /// for the transport lock, and ends a pending retry pause early. A
    /// transport call already in flight is not interrupted.
    pub async fn execute_async(
        &self,
        request: Request,
        tag: Option<&str>,
        bypass_custom_logic: bool,
        cancel: &CancellationToken,
    ) -> Result<Response, ExecutionError> {
        let config = self.config.load_full();
        let (request, correlation_id) = self.prepare(request, bypass_custom_logic);
        self.metrics.record_call();

        let mut retry = RetryLoop::new(&config);
        loop {
            // A call queued behind another one is still cancellable
            let guard = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(self.cancelled(&request, tag, correlation_id, &retry, &config));
                }
                guard = self.lock.acquire(config.locking) => guard,
            };
            let start = Instant::now();
            let result = self.transport.send_async(&request).await;
            let elapsed = start.elapsed();
            let lock_wait = guard.wait();
            drop(guard);

            let attempt = Attempt {
                request: &request,
                tag,
                correlation_id,
                elapsed,
                lock_wait,
            };
            match self.complete_attempt(&mut retry, &config, attempt, result) {
                Step::Finished(result) => return result,
                Step::Pause(pause) => {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(pause) => {}
                    }
                    retry.resume();
                }
            }
        }
    }

    /// Assign the correlation id and apply the bypass flag
    fn prepare(&self, mut request: Request, bypass_custom_logic: bool) -> (Request, Uuid) {
        let correlation_id = *request.correlation_id.get_or_insert_with(Uuid::new_v4);

        if bypass_custom_logic {
            let version = self.transport.service_version();
            if version.supports(BYPASS_CUSTOM_PLUGIN_MIN_VERSION) {
                request.parameters.insert(
                    parameters::BYPASS_CUSTOM_PLUGIN_EXECUTION.to_string(),
                    Value::Bool(true),
                );
            } else {
                warn!(
                    "{}: bypass of custom logic requested but service version {} does not support it (needs {})",
                    request.name, version, BYPASS_CUSTOM_PLUGIN_MIN_VERSION
                );
            }
        }

        (request, correlation_id)
    }

    fn complete_attempt(
        &self,
        retry: &mut RetryLoop,
        config: &ExecutionConfig,
        attempt: Attempt<'_>,
        result: Result<Response, TransportError>,
    ) -> Step {
        self.metrics.record_attempt(attempt.lock_wait);
        let retry_count = retry.state().attempt;

        match result {
            Ok(response) => {
                retry.succeed();
                self.metrics.record_success();
                self.log(config, &attempt, retry_count, AttemptOutcome::Succeeded);
                Step::Finished(Ok(response))
            }
            Err(error) => {
                let decision = retry.fail(attempt.request, &error, config);
                if decision.retry {
                    self.metrics.record_retry(decision.is_throttled);
                    self.log(
                        config,
                        &attempt,
                        retry_count,
                        AttemptOutcome::Retrying {
                            pause: decision.pause,
                            throttled: decision.is_throttled,
                        },
                    );
                    return Step::Pause(decision.pause);
                }

                let throttled = retry.state().is_throttled;
                self.metrics.record_failure();
                self.log(
                    config,
                    &attempt,
                    retry_count,
                    AttemptOutcome::Failed {
                        throttled,
                        error: error.to_string(),
                    },
                );

                let failure = ExecutionError::Terminal {
                    error,
                    correlation_id: attempt.correlation_id,
                    retries: retry_count,
                    throttled,
                };
                self.store_last_error(&failure);
                Step::Finished(Err(failure))
            }
        }
    }

    fn cancelled(
        &self,
        request: &Request,
        tag: Option<&str>,
        correlation_id: Uuid,
        retry: &RetryLoop,
        config: &ExecutionConfig,
    ) -> ExecutionError {
        let attempts = retry.state().attempt;
        self.metrics.record_cancellation();
        let attempt = Attempt {
            request,
            tag,
            correlation_id,
            elapsed: Duration::ZERO,
            lock_wait: Duration::ZERO,
        };
        self.log(config, &attempt, attempts, AttemptOutcome::Cancelled);
        ExecutionError::Cancelled {
            correlation_id,
            attempts,
        }
    }

    fn log(
        &self,
        config: &ExecutionConfig,
        attempt: &Attempt<'_>,
        retry_count: u32,
        outcome: AttemptOutcome,
    ) {
        self.logger.log_attempt(&AttemptRecord {
            timestamp: Utc::now(),
            request_name: attempt.request.name.clone(),
            tag: attempt.tag.map(str::to_string),
            correlation_id: attempt.correlation_id,
            session_tracking_id: config.session_tracking_id,
            retry_count,
            elapsed: attempt.elapsed,
            lock_wait: attempt.lock_wait,
            outcome,
        });
    }

    fn store_last_error(&self, error: &ExecutionError) {
        if let Ok(mut slot) = self.last_error.lock() {
            *slot = Some(error.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::constants::error_codes;
    use crate::api::request::Fault;
    use crate::api::resilience::MemorySink;
    use crate::api::transport::mock::MockTransport;
    use std::sync::Barrier;

    fn unavailable() -> TransportError {
        TransportError::communication(
            Some(503),
            "The remote server returned an error: (503) Server Unavailable.",
        )
    }

    fn fast_config() -> ExecutionConfig {
        ExecutionConfig::builder()
            .max_retries(3)
            .retry_pause(Duration::ZERO)
            .build()
    }

    fn engine_with(
        transport: Arc<MockTransport>,
        config: ExecutionConfig,
    ) -> (ExecutionEngine, Arc<MemorySink>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let sink = Arc::new(MemorySink::new());
        let engine =
            ExecutionEngine::new(transport, config).with_logger(ApiLogger::with_sink(sink.clone()));
        (engine, sink)
    }

    #[test]
    fn test_success_assigns_correlation_id() {
        let transport = Arc::new(MockTransport::echo());
        let (engine, sink) = engine_with(transport.clone(), fast_config());

        let response = engine
            .execute(Request::new("WhoAmI"), Some("probe"), false)
            .unwrap();
        assert_eq!(response.name, "WhoAmI");

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        let correlation_id = sent[0].correlation_id.unwrap();

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert!(records[0].is_success());
        assert_eq!(records[0].correlation_id, correlation_id);
        assert_eq!(records[0].tag.as_deref(), Some("probe"));

        let metrics = engine.metrics();
        assert_eq!(metrics.calls, 1);
        assert_eq!(metrics.attempts, 1);
        assert_eq!(metrics.successes, 1);
    }

    #[test]
    fn test_retries_share_one_correlation_id() {
        let transport = Arc::new(
            MockTransport::echo().scripted(vec![Err(unavailable()), Err(unavailable())]),
        );
        let tracking = Uuid::new_v4();
        let config = ExecutionConfig::builder()
            .max_retries(3)
            .retry_pause(Duration::ZERO)
            .session_tracking_id(tracking)
            .build();
        let (engine, sink) = engine_with(transport.clone(), config);

        engine.execute(Request::new("Create"), None, false).unwrap();

        let records = sink.records();
        assert_eq!(records.len(), 3);
        let correlation_id = records[0].correlation_id;
        assert!(records.iter().all(|r| r.correlation_id == correlation_id));
        assert!(records.iter().all(|r| r.session_tracking_id == Some(tracking)));
        assert!(matches!(
            records[0].outcome,
            AttemptOutcome::Retrying { throttled: true, .. }
        ));
        assert_eq!(records[2].retry_count, 2);
        assert!(records[2].is_success());

        assert!(
            transport
                .sent()
                .iter()
                .all(|r| r.correlation_id == Some(correlation_id))
        );
        let metrics = engine.metrics();
        assert_eq!(metrics.retries, 2);
        assert_eq!(metrics.throttled_retries, 2);
    }

    #[test]
    fn test_fresh_calls_get_fresh_ids_and_caller_ids_are_kept() {
        let transport = Arc::new(MockTransport::echo());
        let (engine, _sink) = engine_with(transport.clone(), fast_config());

        engine.execute(Request::new("Create"), None, false).unwrap();
        engine.execute(Request::new("Create"), None, false).unwrap();
        let supplied = Uuid::new_v4();
        engine
            .execute(Request::new("Create").with_correlation_id(supplied), None, false)
            .unwrap();

        let sent = transport.sent();
        assert_ne!(sent[0].correlation_id, sent[1].correlation_id);
        assert_eq!(sent[2].correlation_id, Some(supplied));
    }

    #[test]
    fn test_terminal_fault_is_propagated_and_kept() {
        let fault = Fault::new(-2147220891, "Attribute does not exist");
        let transport = Arc::new(
            MockTransport::echo().scripted(vec![Err(TransportError::Fault(fault.clone()))]),
        );
        let (engine, sink) = engine_with(transport.clone(), fast_config());

        let err = engine
            .execute(Request::new("Update"), None, false)
            .unwrap_err();
        assert_eq!(err.fault(), Some(&fault));
        assert!(matches!(
            err,
            ExecutionError::Terminal {
                retries: 0,
                throttled: false,
                ..
            }
        ));
        assert_eq!(transport.call_count(), 1);

        let last = engine.last_error().unwrap();
        assert_eq!(last.correlation_id(), err.correlation_id());
        assert!(matches!(
            sink.records()[0].outcome,
            AttemptOutcome::Failed { throttled: false, .. }
        ));

        engine.clear_last_error();
        assert!(engine.last_error().is_none());
        assert_eq!(engine.metrics().failures, 1);
    }

    #[test]
    fn test_retry_budget_exhausted() {
        let transport = Arc::new(MockTransport::with_handler(|_| Err(unavailable())));
        let config = ExecutionConfig::builder()
            .max_retries(2)
            .retry_pause(Duration::ZERO)
            .build();
        let (engine, sink) = engine_with(transport.clone(), config);

        let err = engine
            .execute(Request::new("Create"), None, false)
            .unwrap_err();

        assert_eq!(transport.call_count(), 3);
        assert!(matches!(
            err,
            ExecutionError::Terminal {
                retries: 2,
                throttled: true,
                ..
            }
        ));
        assert_eq!(sink.records().len(), 3);
    }

    #[test]
    fn test_bypass_flag_depends_on_service_version() {
        let transport = Arc::new(MockTransport::echo());
        let (engine, _sink) = engine_with(transport.clone(), fast_config());
        engine.execute(Request::new("Create"), None, true).unwrap();
        engine.execute(Request::new("Create"), None, false).unwrap();

        let sent = transport.sent();
        assert_eq!(
            sent[0].parameter(parameters::BYPASS_CUSTOM_PLUGIN_EXECUTION),
            Some(&Value::Bool(true))
        );
        assert!(sent[1].parameter(parameters::BYPASS_CUSTOM_PLUGIN_EXECUTION).is_none());

        let old = Arc::new(MockTransport::echo().with_version(ServiceVersion::new(9, 0, 2, 3)));
        let (engine, _sink) = engine_with(old.clone(), fast_config());
        engine.execute(Request::new("Create"), None, true).unwrap();
        assert!(old.sent()[0].parameter(parameters::BYPASS_CUSTOM_PLUGIN_EXECUTION).is_none());
    }

    #[test]
    fn test_locking_serializes_blocking_calls() {
        let transport = Arc::new(MockTransport::echo().with_delay(Duration::from_millis(20)));
        let (engine, sink) = engine_with(transport.clone(), fast_config());
        let barrier = Arc::new(Barrier::new(4));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let engine = engine.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    engine.execute(Request::new("Create"), None, false)
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        assert_eq!(transport.max_in_flight(), 1);
        assert_eq!(engine.lock_stats().acquired, 4);
        assert!(sink.records().iter().any(|r| r.lock_wait > Duration::ZERO));
    }

    #[test]
    fn test_disabled_locking_allows_overlap() {
        let transport = Arc::new(MockTransport::echo().with_delay(Duration::from_millis(50)));
        let config = ExecutionConfig::builder()
            .retry_pause(Duration::ZERO)
            .cross_thread_locking(false)
            .build();
        let (engine, _sink) = engine_with(transport.clone(), config);
        let barrier = Arc::new(Barrier::new(4));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let engine = engine.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    engine.execute(Request::new("Create"), None, false)
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        assert!(transport.max_in_flight() > 1);
        assert_eq!(engine.lock_stats().acquired, 0);
    }

    #[test]
    fn test_set_config_applies_to_next_call() {
        let transport = Arc::new(MockTransport::with_handler(|_| Err(unavailable())));
        let (engine, _sink) = engine_with(transport.clone(), fast_config());

        engine.set_config(ExecutionConfig::disabled());
        assert!(engine.execute(Request::new("Create"), None, false).is_err());
        assert_eq!(transport.call_count(), 1);
        assert_eq!(engine.config().max_retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_burst_limit_waits_retry_after() {
        let burst = Fault::new(error_codes::THROTTLING_BURST_REQUEST_LIMIT_EXCEEDED, "Burst")
            .with_retry_after(Duration::from_secs(5));
        let transport =
            Arc::new(MockTransport::echo().scripted(vec![Err(TransportError::Fault(burst))]));
        let config = ExecutionConfig::builder()
            .max_retries(3)
            .retry_pause(Duration::from_secs(1))
            .build();
        let (engine, sink) = engine_with(transport.clone(), config);

        let start = tokio::time::Instant::now();
        engine
            .execute_async(Request::new("Create"), None, false, &CancellationToken::new())
            .await
            .unwrap();
        let waited = start.elapsed();

        assert!(waited >= Duration::from_secs(5));
        assert!(waited < Duration::from_secs(6));
        assert_eq!(
            sink.records()[0].outcome,
            AttemptOutcome::Retrying {
                pause: Duration::from_secs(5),
                throttled: true
            }
        );
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test]
    async fn test_async_cancelled_before_first_attempt() {
        let transport = Arc::new(MockTransport::echo());
        let (engine, sink) = engine_with(transport.clone(), fast_config());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = engine
            .execute_async(Request::new("Create"), None, false, &cancel)
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(transport.call_count(), 0);
        assert_eq!(sink.records()[0].outcome, AttemptOutcome::Cancelled);
        assert_eq!(engine.metrics().cancellations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_cancel_during_pause_stops_next_attempt() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let transport = Arc::new(MockTransport::with_handler(move |_| {
            trigger.cancel();
            Err(TransportError::communication(Some(503), "unavailable"))
        }));
        let config = ExecutionConfig::builder()
            .max_retries(5)
            .retry_pause(Duration::from_secs(60))
            .build();
        let (engine, _sink) = engine_with(transport.clone(), config);

        let start = tokio::time::Instant::now();
        let err = engine
            .execute_async(Request::new("Create"), None, false, &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, ExecutionError::Cancelled { attempts: 1, .. }));
        assert_eq!(transport.call_count(), 1);
        assert!(start.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_cancel_while_waiting_for_lock() {
        let transport = Arc::new(MockTransport::echo());
        let (engine, sink) = engine_with(transport.clone(), fast_config());
        let in_flight = engine
            .lock
            .acquire(crate::api::resilience::TransportLocking::Enabled)
            .await;

        let cancel = CancellationToken::new();
        let queued = engine.execute_async(Request::new("Create"), None, false, &cancel);
        let canceller = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        };
        let (result, ()) = tokio::join!(queued, canceller);
        drop(in_flight);

        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(transport.call_count(), 0);
        assert_eq!(sink.records()[0].outcome, AttemptOutcome::Cancelled);
        assert!(!engine.lock.is_held());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_async_calls_are_serialized() {
        let transport = Arc::new(MockTransport::echo().with_delay(Duration::from_millis(10)));
        let (engine, _sink) = engine_with(transport.clone(), fast_config());

        let calls = (0..4).map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .execute_async(Request::new("Create"), None, false, &CancellationToken::new())
                    .await
            })
        });
        for result in futures::future::join_all(calls).await {
            result.unwrap().unwrap();
        }

        assert_eq!(transport.call_count(), 4);
        assert_eq!(transport.max_in_flight(), 1);
    }
}
