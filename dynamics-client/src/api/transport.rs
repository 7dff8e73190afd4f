//! Transport handle abstraction
//!
//! A transport is a connected, authenticated channel to one organization
//! service. Connection negotiation and payload encoding live behind this
//! trait; the execution core only sends requests through it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::request::{Fault, Request, Response};

/// How the transport authenticated against the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthenticationKind {
    OAuth,
    Certificate,
    ClientSecret,
    ExternalTokenManagement,
    Unknown,
}

/// Four-part organization service version (e.g., 9.2.24021.205)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceVersion {
    pub major: u32,
    pub minor: u32,
    pub build: u32,
    pub revision: u32,
}

impl ServiceVersion {
    pub const fn new(major: u32, minor: u32, build: u32, revision: u32) -> Self {
        Self {
            major,
            minor,
            build,
            revision,
        }
    }

    /// Whether this version is at least `minimum`
    pub fn supports(&self, minimum: ServiceVersion) -> bool {
        *self >= minimum
    }
}

impl fmt::Display for ServiceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.build, self.revision
        )
    }
}

/// Error parsing a service version string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseVersionError {
    pub input: String,
}

impl fmt::Display for ParseVersionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid service version '{}'", self.input)
    }
}

impl std::error::Error for ParseVersionError {}

impl FromStr for ServiceVersion {
    type Err = ParseVersionError;

    /// Parses "major.minor[.build[.revision]]"; missing parts are zero
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseVersionError {
            input: s.to_string(),
        };

        let parts = s
            .trim()
            .split('.')
            .map(|p| p.parse::<u32>().map_err(|_| err()))
            .collect::<Result<Vec<_>, _>>()?;

        if parts.len() < 2 || parts.len() > 4 {
            return Err(err());
        }

        let part = |i: usize| parts.get(i).copied().unwrap_or(0);
        Ok(Self::new(part(0), part(1), part(2), part(3)))
    }
}

/// Failure of a single transport call
#[derive(Debug, Clone, PartialEq)]
pub enum TransportError {
    /// Structured fault returned by the service
    Fault(Fault),
    /// Channel-level failure, usually carrying an HTTP status
    Communication {
        status: Option<u16>,
        code: Option<i32>,
        message: String,
    },
}

impl TransportError {
    pub fn communication(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Communication {
            status,
            code: None,
            message: message.into(),
        }
    }

    /// Platform error code, from the fault or the communication error
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Fault(fault) => Some(fault.error_code),
            Self::Communication { code, .. } => *code,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Fault(fault) => &fault.message,
            Self::Communication { message, .. } => message,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Fault(_) => None,
            Self::Communication { status, .. } => *status,
        }
    }

    pub fn as_fault(&self) -> Option<&Fault> {
        match self {
            Self::Fault(fault) => Some(fault),
            Self::Communication { .. } => None,
        }
    }
}

impl From<Fault> for TransportError {
    fn from(fault: Fault) -> Self {
        Self::Fault(fault)
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fault(fault) => write!(f, "{}", fault),
            Self::Communication {
                status: Some(status),
                message,
                ..
            } => write!(f, "HTTP {}: {}", status, message),
            Self::Communication { message, .. } => write!(f, "Communication error: {}", message),
        }
    }
}

impl std::error::Error for TransportError {}

/// A connected endpoint that executes one request at a time
///
/// Implementations are not required to be safe under concurrent calls; the
/// execution engine serializes access unless transport locking is disabled.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Execute a request, blocking the calling thread
    fn send(&self, request: &Request) -> Result<Response, TransportError>;

    /// Execute a request without blocking the executor
    ///
    /// The default implementation delegates to [`Transport::send`].
    async fn send_async(&self, request: &Request) -> Result<Response, TransportError> {
        self.send(request)
    }

    fn authentication_kind(&self) -> AuthenticationKind;

    fn service_version(&self) -> ServiceVersion;
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted transport for tests

    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    type Handler = Box<dyn Fn(&Request) -> Result<Response, TransportError> + Send + Sync>;

    /// Transport that replays scripted outcomes, then falls back to a handler
    pub struct MockTransport {
        script: Mutex<VecDeque<Result<Response, TransportError>>>,
        fallback: Handler,
        sent: Mutex<Vec<Request>>,
        version: ServiceVersion,
        delay: Option<Duration>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl MockTransport {
        /// Transport that answers every request with an empty response of the same name
        pub fn echo() -> Self {
            Self::with_handler(|request| Ok(Response::new(request.name.clone())))
        }

        pub fn with_handler<F>(handler: F) -> Self
        where
            F: Fn(&Request) -> Result<Response, TransportError> + Send + Sync + 'static,
        {
            Self {
                script: Mutex::new(VecDeque::new()),
                fallback: Box::new(handler),
                sent: Mutex::new(Vec::new()),
                version: ServiceVersion::new(9, 2, 24021, 205),
                delay: None,
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }

        /// Queue outcomes returned before the fallback handler is used
        pub fn scripted(self, outcomes: Vec<Result<Response, TransportError>>) -> Self {
            self.script.lock().unwrap().extend(outcomes);
            self
        }

        pub fn with_version(mut self, version: ServiceVersion) -> Self {
            self.version = version;
            self
        }

        /// Hold every call for `delay` (blocking sleep) to expose overlapping calls
        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn sent(&self) -> Vec<Request> {
            self.sent.lock().unwrap().clone()
        }

        pub fn call_count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }

        /// Highest number of calls observed in flight at the same time
        pub fn max_in_flight(&self) -> usize {
            self.max_in_flight.load(Ordering::SeqCst)
        }

        fn next_outcome(&self, request: &Request) -> Result<Response, TransportError> {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);

            self.sent.lock().unwrap().push(request.clone());
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            let scripted = self.script.lock().unwrap().pop_front();
            let outcome = scripted.unwrap_or_else(|| (self.fallback)(request));

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            outcome
        }
    }

    /// Minimal in-memory organization service
    ///
    /// `Create` needs an entity target and echoes its parameters with a new id.
    /// `RetrieveMultiple` returns an empty collection. `ExecuteMultiple` runs each
    /// packed request through the same rules and honours `ContinueOnError` and
    /// `ReturnResponses`. Anything else echoes.
    pub fn organization_service(request: &Request) -> Result<Response, TransportError> {
        use crate::api::constants::{parameters, requests};
        use serde_json::{Value, json};

        if request.is_named(requests::CREATE) {
            if !matches!(request.target, Some(crate::api::request::Target::Entity(_))) {
                return Err(TransportError::Fault(Fault::new(
                    -2147220989,
                    "Create requires an entity target",
                )));
            }
            let mut response = Response::new(request.name.clone());
            for (key, value) in &request.parameters {
                response = response.with_result(key.clone(), value.clone());
            }
            return Ok(response.with_result(
                parameters::ID,
                json!(uuid::Uuid::new_v4().to_string()),
            ));
        }

        if request.is_named(requests::RETRIEVE_MULTIPLE) {
            return Ok(Response::new(request.name.clone())
                .with_result(parameters::ENTITY_COLLECTION, json!([])));
        }

        if !request.is_named(requests::EXECUTE_MULTIPLE) {
            return Ok(Response::new(request.name.clone()));
        }

        let settings = request.parameter(parameters::SETTINGS);
        let flag = |key: &str| {
            settings
                .and_then(|s| s.get(key))
                .and_then(Value::as_bool)
                .unwrap_or(false)
        };
        let continue_on_error = flag(parameters::CONTINUE_ON_ERROR);
        let return_responses = flag(parameters::RETURN_RESPONSES);

        let packed = request
            .parameter(parameters::REQUESTS)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut entries = Vec::new();
        let mut is_faulted = false;
        for (index, value) in packed.into_iter().enumerate() {
            let inner: Request = serde_json::from_value(value)
                .map_err(|e| TransportError::communication(Some(400), e.to_string()))?;
            match organization_service(&inner) {
                Ok(response) => {
                    if return_responses {
                        entries.push(json!({
                            parameters::REQUEST_INDEX: index,
                            parameters::RESPONSE: response,
                        }));
                    }
                }
                Err(err) => {
                    is_faulted = true;
                    let fault = err
                        .as_fault()
                        .cloned()
                        .unwrap_or_else(|| Fault::new(-1, err.to_string()));
                    entries.push(json!({
                        parameters::REQUEST_INDEX: index,
                        parameters::FAULT: fault,
                    }));
                    if !continue_on_error {
                        break;
                    }
                }
            }
        }

        Ok(Response::new(request.name.clone())
            .with_result(parameters::IS_FAULTED, json!(is_faulted))
            .with_result(parameters::RESPONSES, Value::Array(entries)))
    }

    #[async_trait]
    impl Transport for MockTransport {
        fn send(&self, request: &Request) -> Result<Response, TransportError> {
            self.next_outcome(request)
        }

        fn authentication_kind(&self) -> AuthenticationKind {
            AuthenticationKind::OAuth
        }

        fn service_version(&self) -> ServiceVersion {
            self.version
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_service_version() {
        let version: ServiceVersion = "9.2.24021.205".parse().unwrap();
        assert_eq!(version, ServiceVersion::new(9, 2, 24021, 205));

        let short: ServiceVersion = "9.1".parse().unwrap();
        assert_eq!(short, ServiceVersion::new(9, 1, 0, 0));

        assert!("9".parse::<ServiceVersion>().is_err());
        assert!("9.x.1".parse::<ServiceVersion>().is_err());
        assert!("1.2.3.4.5".parse::<ServiceVersion>().is_err());
    }

    #[test]
    fn test_service_version_ordering() {
        let old = ServiceVersion::new(9, 0, 2, 3);
        let new = ServiceVersion::new(9, 1, 0, 0);
        assert!(new.supports(old));
        assert!(!old.supports(new));
        assert!(new.supports(new));
        assert_eq!(new.to_string(), "9.1.0.0");
    }

    #[test]
    fn test_transport_error_accessors() {
        let fault = TransportError::from(Fault::new(-5, "boom"));
        assert_eq!(fault.code(), Some(-5));
        assert_eq!(fault.status(), None);
        assert!(fault.as_fault().is_some());

        let http = TransportError::communication(
            Some(503),
            "The remote server returned an error: (503) Server Unavailable.",
        );
        assert_eq!(http.status(), Some(503));
        assert_eq!(http.code(), None);
        assert!(http.to_string().starts_with("HTTP 503"));
    }
}
