// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::read_cache::{CacheDelta, CacheKey, CacheInvalidator};
use crate::types::{ActionKind, ResultHandle, TimestampMs};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId(pub u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "opt-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EntryStatus {
    Pending,
    Confirmed,
    Failed,
}

impl EntryStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, EntryStatus::Pending)
    }
}

/// What a speculative entry did to the read cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeculativePayload {
    pub owner: String,
    pub asset: Option<String>,
    pub amount: u128,
    /// Deltas applied at record time
    pub effects: Vec<CacheDelta>,
}

impl SpeculativePayload {
    pub fn for_action(kind: ActionKind, owner: &str, asset: &str, amount: u128) -> Self {
        Self {
            owner: owner.to_string(),
            asset: Some(asset.to_string()),
            amount,
            effects: kind.effects(owner, asset, amount),
        }
    }

    /// Payload for an effect observed on the ledger: nothing is applied locally.
    pub fn observed(owner: &str, asset: Option<&str>, amount: u128) -> Self {
        Self {
            owner: owner.to_string(),
            asset: asset.map(str::to_string),
            amount,
            effects: vec![],
        }
    }

    /// Keys whose cached value the entry may have made wrong
    pub fn affected_keys(&self) -> Vec<CacheKey> {
        let mut keys: Vec<CacheKey> = self.effects.iter().map(|d| d.key.clone()).collect();
        keys.push(CacheKey::position(&self.owner));
        keys
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeculativeEntry {
    pub id: EntryId,
    pub kind: ActionKind,
    pub payload: SpeculativePayload,
    pub created_at: TimestampMs,
    pub updated_at: TimestampMs,
    pub status: EntryStatus,
    pub result: Option<ResultHandle>,
    pub error: Option<String>,
    /// Created from a ledger event rather than a local action
    pub observed: bool,
}

/// Reverts the cache mutation made when an entry was recorded.
/// Consumed on use, so it can fire at most once.
pub trait RollbackHook: Send {
    fn rollback(self: Box<Self>, entry: &SpeculativeEntry) -> anyhow::Result<()>;
}

impl<F> RollbackHook for F
where
    F: FnOnce(&SpeculativeEntry) -> anyhow::Result<()> + Send,
{
    fn rollback(self: Box<Self>, entry: &SpeculativeEntry) -> anyhow::Result<()> {
        (*self)(entry)
    }
}

/// Rollback that drops every key the payload touched, forcing a fresh read
pub struct InvalidateKeys {
    invalidator: Arc<dyn CacheInvalidator>,
}

impl InvalidateKeys {
    pub fn new(invalidator: Arc<dyn CacheInvalidator>) -> Self {
        Self { invalidator }
    }
}

impl RollbackHook for InvalidateKeys {
    fn rollback(self: Box<Self>, entry: &SpeculativeEntry) -> anyhow::Result<()> {
        for key in entry.payload.affected_keys() {
            self.invalidator.invalidate(&key);
        }
        Ok(())
    }
}
