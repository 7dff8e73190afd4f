//! Batch data types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::request::{Fault, Request, Response};

/// Lifecycle of a batch; transitions only move forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchStatus {
    /// Accepting requests
    Created,
    /// Submitted, waiting for the combined response
    Running,
    /// Executed (whether or not individual items faulted)
    Complete,
}

/// One queued request
#[derive(Debug, Clone, PartialEq)]
pub struct BatchItem {
    pub request: Request,
    /// Caller label for diagnostics
    pub tag: Option<String>,
}

/// Outcome of one item in a combined execution
#[derive(Debug, Clone, PartialEq)]
pub enum BatchItemResult {
    Response(Response),
    Fault(Fault),
    /// The service returned nothing for this item: it succeeded while
    /// responses were not requested, or it was skipped after an earlier fault
    NotReturned,
}

impl BatchItemResult {
    pub fn is_fault(&self) -> bool {
        matches!(self, BatchItemResult::Fault(_))
    }

    pub fn response(&self) -> Option<&Response> {
        match self {
            BatchItemResult::Response(response) => Some(response),
            _ => None,
        }
    }

    pub fn fault(&self) -> Option<&Fault> {
        match self {
            BatchItemResult::Fault(fault) => Some(fault),
            _ => None,
        }
    }
}

/// Demultiplexed result of a batch, index-aligned with its items
#[derive(Debug, Clone, PartialEq)]
pub struct CombinedResponse {
    /// True when any item faulted
    pub is_faulted: bool,
    pub per_item: Vec<BatchItemResult>,
}

impl CombinedResponse {
    pub fn len(&self) -> usize {
        self.per_item.len()
    }

    pub fn is_empty(&self) -> bool {
        self.per_item.is_empty()
    }

    /// Indices and faults of failed items
    pub fn faults(&self) -> impl Iterator<Item = (usize, &Fault)> {
        self.per_item
            .iter()
            .enumerate()
            .filter_map(|(index, result)| result.fault().map(|fault| (index, fault)))
    }
}

/// A client-side group of requests executed as one combined call
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: Uuid,
    pub name: String,
    pub status: BatchStatus,
    /// Forwarded to the service; items after a fault still run when true
    pub continue_on_error: bool,
    /// Forwarded to the service; successful items return responses when true
    pub return_results: bool,
    pub items: Vec<BatchItem>,
    pub combined_result: Option<CombinedResponse>,
    /// Set when the combined call itself failed
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Creation order within the registry
    pub(crate) sequence: u64,
}

impl Batch {
    pub(crate) fn new(
        name: String,
        return_results: bool,
        continue_on_error: bool,
        sequence: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            status: BatchStatus::Created,
            continue_on_error,
            return_results,
            items: Vec::new(),
            combined_result: None,
            error: None,
            created_at: Utc::now(),
            sequence,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.status == BatchStatus::Complete
    }
}
