// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::optimistic::EntryId;
use crate::types::{ActionKind, OperationId, Priority, ResultHandle, TimestampMs, TxRequest};
use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Processing,
    Confirmed,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Confirmed | OperationStatus::Failed | OperationStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperation {
    pub id: OperationId,
    pub kind: ActionKind,
    pub request: TxRequest,
    pub priority: Priority,
    pub attempts: u32,
    pub max_attempts: u32,
    pub status: OperationStatus,
    pub created_at: TimestampMs,
    pub updated_at: TimestampMs,
    pub result_handle: Option<ResultHandle>,
    pub last_error: Option<String>,
    pub estimated_cost: u64,
    pub speculative_ref: Option<EntryId>,
    /// Pending but waiting out a retry backoff; not eligible for selection
    pub backing_off: bool,
}

impl QueuedOperation {
    pub(crate) fn is_eligible(&self) -> bool {
        self.status == OperationStatus::Pending && !self.backing_off
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCounts {
    /// Pending and eligible for the next tick
    pub pending: usize,
    /// Pending after a failed attempt, still waiting out the retry delay
    pub backing_off: usize,
    pub processing: usize,
    pub confirmed: usize,
    pub failed: usize,
    /// Cumulative; cancelled operations leave the queue immediately
    pub cancelled: usize,
}

/// Point-in-time view of the queue, in selection order
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueSnapshot {
    pub counts: StatusCounts,
    pub operations: Vec<QueuedOperation>,
}

impl QueueSnapshot {
    pub fn get(&self, id: OperationId) -> Option<&QueuedOperation> {
        self.operations.iter().find(|op| op.id == id)
    }
}
