//! Dynamics client facade
//!
//! Entry point for calling code. Owns the execution engine (absent until a
//! transport is connected) and the batch registry, and offers call-site
//! helpers for the common record operations.

use log::{debug, info};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::batch::{Batch, BatchExecutor, BatchRegistry, CombinedResponse};
use super::constants::{BATCH_OPERATIONS_MIN_VERSION, parameters, requests};
use super::engine::ExecutionEngine;
use super::error::{BatchError, ExecutionError};
use super::request::{EntityReference, Request, Response, Target};
use super::resilience::{ApiLogger, ExecutionConfig, MetricsSnapshot};
use super::transport::Transport;

/// Where a submitted request ended up
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// Queued on the batch; runs with `run_batch`
    Queued,
    /// Executed immediately because it could not be queued
    Executed(Response),
}

/// Client for one organization service connection
#[derive(Debug, Clone)]
pub struct DynamicsClient {
    engine: Option<ExecutionEngine>,
    batches: Arc<BatchRegistry>,
}

impl DynamicsClient {
    /// Client bound to a connected transport
    pub fn connect(transport: Arc<dyn Transport>, config: ExecutionConfig) -> Self {
        info!(
            "Connected to organization service {} ({:?})",
            transport.service_version(),
            transport.authentication_kind()
        );
        let batches = Arc::new(BatchRegistry::new(config.batch.clone()));
        Self {
            engine: Some(ExecutionEngine::new(transport, config)),
            batches,
        }
    }

    /// Client without a transport; every call fails with `Uninitialized`
    pub fn disconnected() -> Self {
        Self {
            engine: None,
            batches: Arc::new(BatchRegistry::default()),
        }
    }

    /// Replace the diagnostics logger used for every attempt
    pub fn with_logger(mut self, logger: ApiLogger) -> Self {
        self.engine = self.engine.map(|engine| engine.with_logger(logger));
        self
    }

    pub fn is_connected(&self) -> bool {
        self.engine.is_some()
    }

    pub fn engine(&self) -> Result<&ExecutionEngine, ExecutionError> {
        self.engine.as_ref().ok_or(ExecutionError::Uninitialized)
    }

    pub fn batches(&self) -> &BatchRegistry {
        &self.batches
    }

    /// Swap the configuration of the engine and the batch registry limits
    pub fn set_config(&self, config: ExecutionConfig) -> Result<(), ExecutionError> {
        let engine = self.engine()?;
        self.batches.set_limits(config.batch.clone());
        engine.set_config(config);
        Ok(())
    }

    /// Execute a request with retry, blocking the calling thread
    pub fn execute(
        &self,
        request: Request,
        tag: Option<&str>,
        bypass_custom_logic: bool,
    ) -> Result<Response, ExecutionError> {
        self.engine()?.execute(request, tag, bypass_custom_logic)
    }

    /// Execute a request with retry; `cancel` stops further attempts
    pub async fn execute_async(
        &self,
        request: Request,
        tag: Option<&str>,
        bypass_custom_logic: bool,
        cancel: &CancellationToken,
    ) -> Result<Response, ExecutionError> {
        self.engine()?
            .execute_async(request, tag, bypass_custom_logic, cancel)
            .await
    }

    /// Register a new batch
    ///
    /// Fails with `BatchError::Unavailable` when the connected service is too
    /// old to run combined requests.
    pub fn create_batch(
        &self,
        name: &str,
        return_results: bool,
        continue_on_error: bool,
    ) -> Result<Uuid, ExecutionError> {
        let version = self.engine()?.service_version();
        if !version.supports(BATCH_OPERATIONS_MIN_VERSION) {
            return Err(BatchError::Unavailable {
                version: version.to_string(),
            }
            .into());
        }

        Ok(self.batches.create(name, return_results, continue_on_error)?)
    }

    /// Queue a request; false when the batch is unknown, already run, or full
    pub fn add_to_batch(&self, id: Uuid, request: Request, tag: Option<&str>) -> bool {
        self.batches.add_item(id, request, tag)
    }

    /// Queue on a batch when possible, otherwise execute immediately
    pub fn submit(
        &self,
        request: Request,
        batch: Option<Uuid>,
        tag: Option<&str>,
    ) -> Result<Submission, ExecutionError> {
        if let Some(id) = batch {
            if self.batches.add_item(id, request.clone(), tag) {
                return Ok(Submission::Queued);
            }
            debug!(
                "{} could not be queued on batch {}, executing directly",
                request.name, id
            );
        }

        self.execute(request, tag, false).map(Submission::Executed)
    }

    pub fn run_batch(&self, id: Uuid) -> Result<CombinedResponse, ExecutionError> {
        BatchExecutor::new(self.engine()?, &self.batches).execute(id)
    }

    pub async fn run_batch_async(
        &self,
        id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<CombinedResponse, ExecutionError> {
        BatchExecutor::new(self.engine()?, &self.batches)
            .execute_async(id, cancel)
            .await
    }

    /// Drop a batch and its results; releasing twice is harmless
    pub fn release_batch(&self, id: Uuid) -> bool {
        self.batches.remove(id)
    }

    pub fn get_batch(&self, id: Uuid) -> Option<Batch> {
        self.batches.get(id)
    }

    pub fn get_batch_by_name(&self, name: &str) -> Option<Batch> {
        self.batches.get_by_name(name)
    }

    /// Last terminal failure seen by the engine
    pub fn last_error(&self) -> Option<ExecutionError> {
        self.engine.as_ref().and_then(ExecutionEngine::last_error)
    }

    pub fn metrics(&self) -> Option<MetricsSnapshot> {
        self.engine.as_ref().map(ExecutionEngine::metrics)
    }

    /// Create a record; the new id is in the response's `id` result
    pub fn create(
        &self,
        entity: &str,
        attributes: Map<String, Value>,
    ) -> Result<Response, ExecutionError> {
        let request = Request::new(requests::CREATE)
            .with_target(Target::Entity(EntityReference::new(entity, Uuid::nil())))
            .with_parameter(parameters::ATTRIBUTES, Value::Object(attributes));
        self.execute(request, Some(&format!("Create {}", entity)), false)
    }

    /// Retrieve one record; an empty column list retrieves all columns
    pub fn retrieve(
        &self,
        entity: &str,
        id: Uuid,
        columns: &[&str],
    ) -> Result<Response, ExecutionError> {
        let column_set = if columns.is_empty() {
            Value::Bool(true)
        } else {
            json!(columns)
        };
        let request = Request::new(requests::RETRIEVE)
            .with_target(Target::Entity(EntityReference::new(entity, id)))
            .with_parameter(parameters::COLUMN_SET, column_set);
        self.execute(request, Some(&format!("Retrieve {}", entity)), false)
    }

    /// Run a query or FetchXML; records come back under `EntityCollection`
    pub fn retrieve_multiple(&self, query: Target) -> Result<Response, ExecutionError> {
        let tag = format!(
            "RetrieveMultiple {}",
            query.entity_name().unwrap_or("unknown")
        );
        let query_value = match &query {
            Target::Fetch { xml } => Value::String(xml.clone()),
            Target::Query { entity_name } => json!({ "EntityName": entity_name }),
            Target::Entity(reference) => json!({ "EntityName": reference.logical_name }),
        };
        let request = Request::new(requests::RETRIEVE_MULTIPLE)
            .with_target(query)
            .with_parameter(parameters::QUERY, query_value);
        self.execute(request, Some(&tag), false)
    }

    pub fn update(
        &self,
        entity: &str,
        id: Uuid,
        attributes: Map<String, Value>,
    ) -> Result<Response, ExecutionError> {
        let request = Request::new(requests::UPDATE)
            .with_target(Target::Entity(EntityReference::new(entity, id)))
            .with_parameter(parameters::ATTRIBUTES, Value::Object(attributes));
        self.execute(request, Some(&format!("Update {}", entity)), false)
    }

    pub fn delete(&self, entity: &str, id: Uuid) -> Result<Response, ExecutionError> {
        let request = Request::new(requests::DELETE)
            .with_target(Target::Entity(EntityReference::new(entity, id)));
        self.execute(request, Some(&format!("Delete {}", entity)), false)
    }
}
