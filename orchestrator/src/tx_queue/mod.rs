// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Priority transaction queue.
//!
//! Operation lifecycle:
//!
//! ```text
//! Pending ──tick──▶ Processing ──ok──▶ Confirmed
//!    │  ▲                │
//!    │  └── backoff ─────┤ error, attempts left
//!    │                   └── error, exhausted ──▶ Failed
//!    └──cancel──▶ Cancelled
//! ```

mod history;
mod queue;
mod types;

pub use history::{HistoryEntry, HistoryLog, JsonlHistoryLog, MemoryHistoryLog};
pub use queue::TransactionQueue;
pub use types::{OperationStatus, QueueSnapshot, QueuedOperation, StatusCounts};
