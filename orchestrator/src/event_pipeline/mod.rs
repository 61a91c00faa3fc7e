// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Polling event ingestion with per-source cursors.
//!
//! Per-source state machine:
//!
//! ```text
//! Registered ──▶ Polling ──▶ Idle (caught up) ──▶ Polling ──▶ ...
//!                   └──────▶ Fetching (behind) ─┘
//! any state ──deregister──▶ Deactivated
//! ```

mod handlers;
mod pipeline;
mod types;

pub use handlers::{
    CorrectionSink, DefaultEventHandler, EventHandler, HandlerError, HandlerRegistry,
    LedgerCorrections,
};
pub use pipeline::EventIngestionPipeline;
pub use types::{
    EventKind, EventSource, LedgerEvent, PollReport, SourceId, SourceSnapshot, SourceState,
};
