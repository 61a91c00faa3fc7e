// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::event_pipeline::SourceId;
use crate::ledger_client::LedgerError;
use crate::types::OperationId;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("remote ledger: {0}")]
    Ledger(#[from] LedgerError),

    #[error("unknown operation {0}")]
    UnknownOperation(OperationId),

    #[error("unknown event source {0}")]
    UnknownSource(SourceId),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("history log: {0}")]
    History(String),
}

impl EngineError {
    /// Returns a short string identifying the error type for metrics labels
    pub fn error_type(&self) -> &'static str {
        match self {
            EngineError::Ledger(e) => e.error_type(),
            EngineError::UnknownOperation(_) => "unknown_operation",
            EngineError::UnknownSource(_) => "unknown_source",
            EngineError::InvalidConfig(_) => "invalid_config",
            EngineError::History(_) => "history",
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
