//! Records produced by a successful assignment.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ledger::model::ImageRef;

/// Which path committed an assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentMethod {
    /// Optimistic compare-and-swap on the ledger version.
    Transaction,
    /// Serialized by the advisory lock document.
    AdvisoryLock,
    /// Degraded unguarded write after retries were exhausted.
    Fallback,
}

impl AssignmentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentMethod::Transaction => "transaction",
            AssignmentMethod::AdvisoryLock => "advisory_lock",
            AssignmentMethod::Fallback => "fallback",
        }
    }
}

impl fmt::Display for AssignmentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssignmentMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transaction" => Ok(AssignmentMethod::Transaction),
            "advisory_lock" => Ok(AssignmentMethod::AdvisoryLock),
            "fallback" => Ok(AssignmentMethod::Fallback),
            other => Err(anyhow::anyhow!("Invalid AssignmentMethod value: {}", other)),
        }
    }
}

/// One image in a participant's batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignedImage {
    pub pool: String,
    pub number: u32,
    pub path: String,
    /// Count of the image right before this participant was added.
    pub assignment_count_at_assignment: u32,
}

impl AssignedImage {
    pub fn image_ref(&self) -> ImageRef {
        ImageRef::new(self.pool.clone(), self.number)
    }
}

/// The immutable batch handed to one participant, in presentation order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageAssignment {
    pub participant_id: String,
    pub images: Vec<AssignedImage>,
    pub log_id: String,
    pub method: AssignmentMethod,
    pub attempt: u32,
    pub assigned_at_ms: u64,
}

impl ImageAssignment {
    pub fn image_refs(&self) -> Vec<ImageRef> {
        self.images.iter().map(AssignedImage::image_ref).collect()
    }
}

/// Append-only audit record, one per committed assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentLogEntry {
    pub log_id: String,
    pub participant_id: String,
    pub image_ids: Vec<String>,
    pub created_ms: u64,
    pub attempt: u32,
    pub method: AssignmentMethod,
}

impl AssignmentLogEntry {
    pub fn for_assignment(a: &ImageAssignment) -> Self {
        Self {
            log_id: a.log_id.clone(),
            participant_id: a.participant_id.clone(),
            image_ids: a.images.iter().map(|i| i.image_ref().id()).collect(),
            created_ms: a.assigned_at_ms,
            attempt: a.attempt,
            method: a.method,
        }
    }
}
