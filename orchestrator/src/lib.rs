// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Client-side orchestration between an application's cached view of user
//! state and a remote, eventually-consistent lending ledger.
//!
//! ```text
//!   user action
//!       │
//!       ▼
//! ┌────────────────┐  approve   ┌──────────────────┐  submit   ┌──────────────┐
//! │ AllowanceCache │──────────▶ │ TransactionQueue │─────────▶ │ LedgerClient │
//! └────────────────┘            └──────────────────┘           └──────────────┘
//!       │ record                  │ confirm / fail                  ▲ poll
//!       ▼                         ▼                                 │
//! ┌──────────────────┐      ┌───────────┐      ┌─────────────────────────┐
//! │ OptimisticLedger │────▶ │ ReadCache │ ◀─── │ EventIngestionPipeline  │
//! └──────────────────┘      └───────────┘      └─────────────────────────┘
//! ```
//!
//! Components are constructed explicitly and wired by [`engine::Engine`];
//! there is no process-wide state.

pub mod allowance;
pub mod config;
pub mod engine;
pub mod error;
pub mod event_pipeline;
pub mod ledger_client;
pub mod metrics;
pub mod optimistic;
pub mod read_cache;
pub mod scheduler;
pub mod tx_queue;
pub mod types;

#[cfg(test)]
pub mod test_utils;

pub use engine::Engine;
pub use error::{EngineError, EngineResult};
