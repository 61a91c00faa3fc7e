// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Interface to the remote, authoritative ledger.
//!
//! Every call here is a suspension point; nothing in the engine holds a lock
//! across one of them.

mod json_rpc;

pub use json_rpc::JsonRpcLedgerClient;

use crate::event_pipeline::EventKind;
use crate::types::{FeeParameters, ResultHandle, TxRequest};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    // JSON-RPC level error returned by the provider
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    // The ledger refused the call (e.g. reverted)
    #[error("rejected by ledger: {0}")]
    Rejected(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("transport error: {0}")]
    Transport(String),
}

impl LedgerError {
    /// Whether the failure is likely to go away on its own.
    ///
    /// Informational only: the transaction queue retries every submission
    /// failure the same way.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LedgerError::Timeout(_) | LedgerError::RateLimited(_) | LedgerError::Transport(_)
        ) || matches!(self, LedgerError::Rpc { code, .. } if *code == -32603)
    }

    /// Returns a short string identifying the error type for metrics labels
    pub fn error_type(&self) -> &'static str {
        match self {
            LedgerError::Rpc { .. } => "rpc",
            LedgerError::Timeout(_) => "timeout",
            LedgerError::RateLimited(_) => "rate_limited",
            LedgerError::Rejected(_) => "rejected",
            LedgerError::InvalidResponse(_) => "invalid_response",
            LedgerError::Transport(_) => "transport",
        }
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Undecoded log as returned by the remote ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLog {
    pub address: String,
    pub event_kind: String,
    pub block_height: u64,
    pub tx_handle: String,
    pub log_index: u32,
    #[serde(default)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

#[async_trait]
pub trait LedgerClient: Send + Sync + 'static {
    async fn get_current_height(&self) -> LedgerResult<u64>;

    /// Logs emitted by `source_address` of kind `kind` in `[from, to]`, inclusive
    async fn get_logs(
        &self,
        source_address: &str,
        kind: EventKind,
        from: u64,
        to: u64,
    ) -> LedgerResult<Vec<RawLog>>;

    /// Current limit `spender` may move of `owner`'s `asset`
    async fn read_authorization(&self, asset: &str, owner: &str, spender: &str)
        -> LedgerResult<u128>;

    async fn estimate_cost(&self, request: &TxRequest) -> LedgerResult<u64>;

    async fn submit(&self, request: &TxRequest) -> LedgerResult<ResultHandle>;

    async fn get_fee_parameters(&self) -> LedgerResult<FeeParameters>;
}
