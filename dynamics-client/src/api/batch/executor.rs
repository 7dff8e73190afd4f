//! Batch execution
//!
//! Packs a batch's requests into one `ExecuteMultiple` request, sends it
//! through the execution engine and maps the combined response back onto the
//! batch items by request index.

use log::{error, info, warn};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::models::{BatchItemResult, CombinedResponse};
use super::registry::{BatchRegistry, PreparedBatch};
use crate::api::constants::{parameters, requests};
use crate::api::engine::ExecutionEngine;
use crate::api::error::{BatchError, ExecutionError};
use crate::api::request::{Fault, Request, Response};

/// Runs registered batches through an execution engine
#[derive(Debug, Clone, Copy)]
pub struct BatchExecutor<'a> {
    engine: &'a ExecutionEngine,
    registry: &'a BatchRegistry,
}

impl<'a> BatchExecutor<'a> {
    pub fn new(engine: &'a ExecutionEngine, registry: &'a BatchRegistry) -> Self {
        Self { engine, registry }
    }

    /// Execute a batch, blocking until the combined call finishes
    pub fn execute(&self, id: Uuid) -> Result<CombinedResponse, ExecutionError> {
        let prepared = self.registry.begin_execution(id)?;
        let request = match self.build_request(&prepared) {
            Ok(request) => request,
            Err(err) => return Err(self.abandon(&prepared, err.into())),
        };

        let tag = batch_tag(&prepared);
        info!(
            "Executing batch {} ('{}') with {} requests",
            prepared.id,
            prepared.name,
            prepared.items.len()
        );
        let result = self.engine.execute(request, Some(&tag), false);
        self.finish(&prepared, result)
    }

    /// Execute a batch without blocking the executor
    pub async fn execute_async(
        &self,
        id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<CombinedResponse, ExecutionError> {
        let prepared = self.registry.begin_execution(id)?;
        let request = match self.build_request(&prepared) {
            Ok(request) => request,
            Err(err) => return Err(self.abandon(&prepared, err.into())),
        };

        let tag = batch_tag(&prepared);
        info!(
            "Executing batch {} ('{}') with {} requests",
            prepared.id,
            prepared.name,
            prepared.items.len()
        );
        let result = self
            .engine
            .execute_async(request, Some(&tag), false, cancel)
            .await;
        self.finish(&prepared, result)
    }

    /// Build the combined request: items in order plus the batch settings
    fn build_request(&self, prepared: &PreparedBatch) -> Result<Request, BatchError> {
        let requests = prepared
            .items
            .iter()
            .map(|item| serde_json::to_value(&item.request))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| BatchError::Encoding {
                id: prepared.id,
                reason: e.to_string(),
            })?;

        Ok(Request::new(requests::EXECUTE_MULTIPLE)
            .with_parameter(parameters::REQUESTS, Value::Array(requests))
            .with_parameter(
                parameters::SETTINGS,
                json!({
                    parameters::CONTINUE_ON_ERROR: prepared.continue_on_error,
                    parameters::RETURN_RESPONSES: prepared.return_results,
                }),
            ))
    }

    fn finish(
        &self,
        prepared: &PreparedBatch,
        result: Result<Response, ExecutionError>,
    ) -> Result<CombinedResponse, ExecutionError> {
        let combined = result.and_then(|response| {
            demultiplex(prepared.id, prepared.items.len(), &response).map_err(ExecutionError::from)
        });

        match combined {
            Ok(combined) => {
                let faults = combined.faults().count();
                if faults > 0 {
                    warn!(
                        "Batch {} ('{}') completed with {} faulted item(s)",
                        prepared.id, prepared.name, faults
                    );
                } else {
                    info!("Batch {} ('{}') completed", prepared.id, prepared.name);
                }
                self.registry.finish_execution(prepared.id, Ok(combined.clone()));
                Ok(combined)
            }
            Err(err) => Err(self.abandon(prepared, err)),
        }
    }

    /// The combined call failed as a whole; the batch still counts as executed
    fn abandon(&self, prepared: &PreparedBatch, err: ExecutionError) -> ExecutionError {
        error!("Batch {} ('{}') failed: {}", prepared.id, prepared.name, err);
        self.registry.finish_execution(prepared.id, Err(err.to_string()));
        err
    }
}

fn batch_tag(prepared: &PreparedBatch) -> String {
    format!("Execute Batch - {}", prepared.name)
}

/// Fault code reported for an item whose entry could not be decoded
pub const UNDECODABLE_ITEM: i32 = -1;

/// Detail key holding the raw entry of an undecodable item
pub const RAW_ENTRY_DETAIL: &str = "RawEntry";

/// Stand-in fault for one item entry that does not decode; the other items keep
/// their results
fn undecodable(
    id: Uuid,
    index: usize,
    kind: &str,
    raw: &Value,
    err: serde_json::Error,
) -> BatchItemResult {
    warn!("Batch {}: undecodable {} at index {}: {}", id, kind, index, err);
    BatchItemResult::Fault(
        Fault::new(
            UNDECODABLE_ITEM,
            format!("Undecodable {} at index {}: {}", kind, index, err),
        )
        .with_detail(RAW_ENTRY_DETAIL, raw.clone()),
    )
}

/// Map an `ExecuteMultiple` response onto `item_count` items by request index
///
/// A missing or out-of-range index makes the whole response malformed. An
/// entry whose payload does not decode becomes a fault at its own index.
pub(crate) fn demultiplex(
    id: Uuid,
    item_count: usize,
    response: &Response,
) -> Result<CombinedResponse, BatchError> {
    let malformed = |reason: String| BatchError::MalformedResponse { id, reason };

    let entries = match response.result(parameters::RESPONSES) {
        None | Some(Value::Null) => &[][..],
        Some(Value::Array(entries)) => entries.as_slice(),
        Some(other) => {
            return Err(malformed(format!(
                "{} is not an array: {}",
                parameters::RESPONSES,
                other
            )));
        }
    };

    let mut per_item = vec![BatchItemResult::NotReturned; item_count];
    for entry in entries {
        let index = entry
            .get(parameters::REQUEST_INDEX)
            .and_then(Value::as_u64)
            .ok_or_else(|| malformed(format!("entry without {}", parameters::REQUEST_INDEX)))?
            as usize;
        let slot = per_item
            .get_mut(index)
            .ok_or_else(|| malformed(format!("index {} out of range (0..{})", index, item_count)))?;

        let fault = entry.get(parameters::FAULT).filter(|v| !v.is_null());
        let item_response = entry.get(parameters::RESPONSE).filter(|v| !v.is_null());

        *slot = if let Some(fault) = fault {
            match serde_json::from_value::<Fault>(fault.clone()) {
                Ok(fault) => BatchItemResult::Fault(fault),
                Err(e) => undecodable(id, index, "fault", fault, e),
            }
        } else if let Some(item_response) = item_response {
            match serde_json::from_value::<Response>(item_response.clone()) {
                Ok(item_response) => BatchItemResult::Response(item_response),
                Err(e) => undecodable(id, index, "response", item_response, e),
            }
        } else {
            BatchItemResult::NotReturned
        };
    }

    let server_faulted = response
        .result(parameters::IS_FAULTED)
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let is_faulted = server_faulted || per_item.iter().any(BatchItemResult::is_fault);

    Ok(CombinedResponse {
        is_faulted,
        per_item,
    })
}
