//! Core request/response types for organization service calls

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use uuid::Uuid;

use super::constants::{RETRY_AFTER_DETAIL, parameters};

static FETCH_ENTITY_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<entity\s+name\s*=\s*["']([^"']+)["']"#).expect("fetch entity regex is valid")
});

/// Reference to a single record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityReference {
    /// Entity logical name (e.g., "account", "asyncoperation")
    pub logical_name: String,
    /// Record ID
    pub id: Uuid,
}

impl EntityReference {
    pub fn new(logical_name: impl Into<String>, id: Uuid) -> Self {
        Self {
            logical_name: logical_name.into(),
            id,
        }
    }
}

/// What a request operates on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Target {
    /// A single record
    Entity(EntityReference),
    /// A structured query over one entity
    Query { entity_name: String },
    /// A FetchXML query
    Fetch { xml: String },
}

impl Target {
    /// Logical name of the entity this target points at, if it can be determined
    pub fn entity_name(&self) -> Option<&str> {
        match self {
            Self::Entity(reference) => Some(&reference.logical_name),
            Self::Query { entity_name } => Some(entity_name),
            Self::Fetch { xml } => FETCH_ENTITY_NAME
                .captures(xml)
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str()),
        }
    }
}

/// A single named operation sent to the organization service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Request name (e.g., "Retrieve", "ExecuteMultiple")
    pub name: String,
    /// Ordered request parameters
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// Record or query the request operates on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Target>,
    /// Correlation id shared by every attempt of one logical call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
}

impl Request {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: Map::new(),
            target: None,
            correlation_id: None,
        }
    }

    /// Set a parameter, keeping insertion order
    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn with_target(mut self, target: Target) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn parameter(&self, key: &str) -> Option<&Value> {
        self.parameters.get(key)
    }

    /// Entity logical name of the target, if any
    pub fn entity_name(&self) -> Option<&str> {
        self.target.as_ref().and_then(Target::entity_name)
    }

    /// Case-insensitive request name comparison
    pub fn is_named(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// Successful result of a request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Name of the request this responds to
    pub name: String,
    /// Ordered response values
    #[serde(default)]
    pub results: Map<String, Value>,
}

impl Response {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            results: Map::new(),
        }
    }

    pub fn with_result(mut self, key: impl Into<String>, value: Value) -> Self {
        self.results.insert(key.into(), value);
        self
    }

    pub fn result(&self, key: &str) -> Option<&Value> {
        self.results.get(key)
    }

    /// Record id returned by a Create request
    pub fn id(&self) -> Option<Uuid> {
        self.result(parameters::ID)
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
    }
}

/// Structured error returned by the organization service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fault {
    pub error_code: i32,
    pub message: String,
    #[serde(default)]
    pub details: Map<String, Value>,
    /// Server-suggested pause before the next attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<Duration>,
}

impl Fault {
    pub fn new(error_code: i32, message: impl Into<String>) -> Self {
        Self {
            error_code,
            message: message.into(),
            details: Map::new(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }

    /// Server-suggested pause, from the typed field or the `Retry-After` detail (seconds)
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after.or_else(|| {
            self.details
                .get(RETRY_AFTER_DETAIL)
                .and_then(Value::as_f64)
                .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        })
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fault {}: {}", self.error_code, self.message)
    }
}
