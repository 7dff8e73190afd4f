//! In-memory batch registry
//!
//! Batches live here from `create` until the caller calls `remove`. Nothing
//! is evicted automatically: a caller that never releases its batches keeps
//! them (and their requests and results) in memory.

use arc_swap::ArcSwap;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

use super::models::{Batch, BatchItem, BatchStatus, CombinedResponse};
use crate::api::error::BatchError;
use crate::api::request::Request;
use crate::api::resilience::BatchConfig;

/// Snapshot of a batch taken when it starts running
#[derive(Debug, Clone)]
pub(crate) struct PreparedBatch {
    pub id: Uuid,
    pub name: String,
    pub items: Vec<BatchItem>,
    pub continue_on_error: bool,
    pub return_results: bool,
}

/// Thread-safe table of batches keyed by id
#[derive(Debug)]
pub struct BatchRegistry {
    batches: RwLock<HashMap<Uuid, Batch>>,
    sequence: AtomicU64,
    limits: ArcSwap<BatchConfig>,
}

impl Default for BatchRegistry {
    fn default() -> Self {
        Self::new(BatchConfig::default())
    }
}

impl BatchRegistry {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            batches: RwLock::new(HashMap::new()),
            sequence: AtomicU64::new(0),
            limits: ArcSwap::from_pointee(config),
        }
    }

    /// Current capacity limits
    pub fn limits(&self) -> BatchConfig {
        BatchConfig::clone(&self.limits.load())
    }

    /// Replace the capacity limits; existing batches and items are kept even
    /// when they exceed the new limits
    pub fn set_limits(&self, limits: BatchConfig) {
        self.limits.store(Arc::new(limits));
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Uuid, Batch>> {
        self.batches.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Uuid, Batch>> {
        self.batches.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new empty batch
    pub fn create(
        &self,
        name: impl Into<String>,
        return_results: bool,
        continue_on_error: bool,
    ) -> Result<Uuid, BatchError> {
        let name = name.into();
        let max_batches = self.limits.load().max_batches;
        let mut batches = self.write();

        if batches.len() >= max_batches {
            warn!(
                "Cannot create batch '{}': {} batches already registered",
                name,
                batches.len()
            );
            return Err(BatchError::CapacityExceeded { limit: max_batches });
        }

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let batch = Batch::new(name, return_results, continue_on_error, sequence);
        let id = batch.id;
        debug!(
            "Created batch {} ('{}', return_results={}, continue_on_error={})",
            id, batch.name, return_results, continue_on_error
        );
        batches.insert(id, batch);

        Ok(id)
    }

    /// Queue a request on a batch
    ///
    /// Returns false when the batch does not exist, is no longer `Created`, or
    /// is full. Falling back to direct execution is up to the caller.
    pub fn add_item(&self, id: Uuid, request: Request, tag: Option<&str>) -> bool {
        let max_requests = self.limits.load().max_requests_per_batch;
        let mut batches = self.write();

        let Some(batch) = batches.get_mut(&id) else {
            debug!("Cannot add {} to batch {}: not found", request.name, id);
            return false;
        };

        if batch.status != BatchStatus::Created {
            debug!(
                "Cannot add {} to batch {}: batch is {:?}",
                request.name, id, batch.status
            );
            return false;
        }

        if batch.items.len() >= max_requests {
            warn!(
                "Cannot add {} to batch {}: limit of {} requests reached",
                request.name, id, max_requests
            );
            return false;
        }

        batch.items.push(BatchItem {
            request,
            tag: tag.map(str::to_string),
        });
        true
    }

    /// Copy of the batch with this id
    pub fn get(&self, id: Uuid) -> Option<Batch> {
        self.read().get(&id).cloned()
    }

    /// Copy of the most recently created batch with this name
    pub fn get_by_name(&self, name: &str) -> Option<Batch> {
        self.read()
            .values()
            .filter(|batch| batch.name == name)
            .max_by_key(|batch| batch.sequence)
            .cloned()
    }

    pub fn status(&self, id: Uuid) -> Option<BatchStatus> {
        self.read().get(&id).map(|batch| batch.status)
    }

    /// Release a batch; removing an unknown id is a no-op
    pub fn remove(&self, id: Uuid) -> bool {
        let removed = self.write().remove(&id).is_some();
        if removed {
            debug!("Released batch {}", id);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Ids of all registered batches, oldest first
    pub fn ids(&self) -> Vec<Uuid> {
        let batches = self.read();
        let mut entries: Vec<_> = batches.values().map(|b| (b.sequence, b.id)).collect();
        entries.sort_unstable_by_key(|(sequence, _)| *sequence);
        entries.into_iter().map(|(_, id)| id).collect()
    }

    /// Move a batch from Created to Running and take a snapshot of its items
    pub(crate) fn begin_execution(&self, id: Uuid) -> Result<PreparedBatch, BatchError> {
        let mut batches = self.write();
        let batch = batches.get_mut(&id).ok_or(BatchError::NotFound { id })?;

        if batch.status != BatchStatus::Created {
            return Err(BatchError::InvalidState {
                id,
                status: batch.status,
            });
        }
        if batch.items.is_empty() {
            return Err(BatchError::Empty { id });
        }

        batch.status = BatchStatus::Running;
        Ok(PreparedBatch {
            id,
            name: batch.name.clone(),
            items: batch.items.clone(),
            continue_on_error: batch.continue_on_error,
            return_results: batch.return_results,
        })
    }

    /// Move a running batch to Complete, storing the result or the failure
    pub(crate) fn finish_execution(&self, id: Uuid, outcome: Result<CombinedResponse, String>) {
        let mut batches = self.write();
        let Some(batch) = batches.get_mut(&id) else {
            debug!("Batch {} was released while running; result dropped", id);
            return;
        };

        batch.status = BatchStatus::Complete;
        match outcome {
            Ok(combined) => batch.combined_result = Some(combined),
            Err(error) => batch.error = Some(error),
        }
    }
}
