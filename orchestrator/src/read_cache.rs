// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Shared key-value read cache.
//!
//! This is the single channel through which the UI layer observes the
//! engine: readers call [`ReadCache::get`] and may [`ReadCache::subscribe`]
//! to a stream of [`CacheChange`] records. Writes are full-value
//! replacements or invalidations; the only delta write is
//! [`ReadCache::adjust`], used synchronously by the optimistic ledger.

use crate::allowance::AuthorizationRecord;
use crate::scheduler::Scheduler;
use crate::types::TimestampMs;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

const CHANGE_CHANNEL_SIZE: usize = 1024;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EntityKind {
    WalletBalance,
    Collateral,
    Debt,
    Staked,
    Allowance,
    Position,
    Market,
}

/// Stable cache key derived from (entity kind, owner, asset[, spender]).
///
/// Renders as `entity:owner:asset[:spender]`, omitting absent parts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub entity: EntityKind,
    pub owner: Option<String>,
    pub asset: Option<String>,
    pub spender: Option<String>,
}

impl CacheKey {
    fn new(entity: EntityKind, owner: Option<&str>, asset: Option<&str>) -> Self {
        Self {
            entity,
            owner: owner.map(str::to_string),
            asset: asset.map(str::to_string),
            spender: None,
        }
    }

    pub fn wallet_balance(owner: &str, asset: &str) -> Self {
        Self::new(EntityKind::WalletBalance, Some(owner), Some(asset))
    }

    pub fn collateral(owner: &str, asset: &str) -> Self {
        Self::new(EntityKind::Collateral, Some(owner), Some(asset))
    }

    pub fn debt(owner: &str, asset: &str) -> Self {
        Self::new(EntityKind::Debt, Some(owner), Some(asset))
    }

    pub fn staked(owner: &str, asset: &str) -> Self {
        Self::new(EntityKind::Staked, Some(owner), Some(asset))
    }

    pub fn allowance(owner: &str, asset: &str, spender: &str) -> Self {
        Self {
            spender: Some(spender.to_string()),
            ..Self::new(EntityKind::Allowance, Some(owner), Some(asset))
        }
    }

    /// Aggregate account position (health factor, totals)
    pub fn position(owner: &str) -> Self {
        Self::new(EntityKind::Position, Some(owner), None)
    }

    /// Protocol-wide metrics for one asset market
    pub fn market(asset: &str) -> Self {
        Self::new(EntityKind::Market, None, Some(asset))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.entity)?;
        for part in [&self.owner, &self.asset, &self.spender].into_iter().flatten() {
            write!(f, ":{}", part)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheDelta {
    pub key: CacheKey,
    pub delta: i128,
}

impl CacheDelta {
    pub fn new(key: CacheKey, delta: i128) -> Self {
        Self { key, delta }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheValue {
    Amount(i128),
    Authorization(AuthorizationRecord),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedEntry {
    pub value: CacheValue,
    pub stored_at: TimestampMs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheChange {
    Set(CacheKey),
    Adjusted { key: CacheKey, delta: i128 },
    Invalidated(CacheKey),
}

/// Capability handed to components that may only drop stale cache values
pub trait CacheInvalidator: Send + Sync {
    fn invalidate(&self, key: &CacheKey);

    /// Drop every key belonging to `owner`
    fn invalidate_owner(&self, owner: &str);

    /// Drop every key of one entity kind (e.g. all positions after a price move)
    fn invalidate_entity(&self, entity: EntityKind);
}

pub struct ReadCache {
    entries: RwLock<HashMap<CacheKey, CachedEntry>>,
    changes: broadcast::Sender<CacheChange>,
    scheduler: Arc<dyn Scheduler>,
}

impl ReadCache {
    pub fn new(scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            changes: broadcast::channel(CHANGE_CHANNEL_SIZE).0,
            scheduler,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheChange> {
        self.changes.subscribe()
    }

    pub fn get(&self, key: &CacheKey) -> Option<CachedEntry> {
        self.entries.read().get(key).cloned()
    }

    pub fn get_amount(&self, key: &CacheKey) -> Option<i128> {
        match self.get(key)?.value {
            CacheValue::Amount(amount) => Some(amount),
            CacheValue::Authorization(_) => None,
        }
    }

    /// Full-value replacement
    pub fn set(&self, key: CacheKey, value: CacheValue) {
        let entry = CachedEntry {
            value,
            stored_at: self.scheduler.now(),
        };
        self.entries.write().insert(key.clone(), entry);
        self.publish(CacheChange::Set(key));
    }

    pub fn set_amount(&self, key: CacheKey, amount: i128) {
        self.set(key, CacheValue::Amount(amount));
    }

    /// Apply a delta to a cached amount. Keys that are absent or hold a
    /// non-amount value are left alone; the next full read fills them.
    pub fn adjust(&self, key: &CacheKey, delta: i128) -> bool {
        let applied = {
            let mut entries = self.entries.write();
            match entries.get_mut(key) {
                Some(CachedEntry {
                    value: CacheValue::Amount(amount),
                    ..
                }) => {
                    *amount = amount.saturating_add(delta);
                    true
                }
                _ => false,
            }
        };
        if applied {
            self.publish(CacheChange::Adjusted {
                key: key.clone(),
                delta,
            });
        } else {
            debug!("[ReadCache] skip delta {} for uncached key {}", delta, key);
        }
        applied
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn publish(&self, change: CacheChange) {
        // No subscribers is fine
        let _ = self.changes.send(change);
    }

    fn remove_where(&self, pred: impl Fn(&CacheKey) -> bool) {
        let removed: Vec<CacheKey> = {
            let mut entries = self.entries.write();
            let keys: Vec<CacheKey> = entries.keys().filter(|k| pred(k)).cloned().collect();
            for key in &keys {
                entries.remove(key);
            }
            keys
        };
        for key in removed {
            self.publish(CacheChange::Invalidated(key));
        }
    }
}

impl CacheInvalidator for ReadCache {
    fn invalidate(&self, key: &CacheKey) {
        let removed = self.entries.write().remove(key).is_some();
        if removed {
            self.publish(CacheChange::Invalidated(key.clone()));
        }
    }

    fn invalidate_owner(&self, owner: &str) {
        self.remove_where(|k| k.owner.as_deref() == Some(owner));
    }

    fn invalidate_entity(&self, entity: EntityKind) {
        self.remove_where(|k| k.entity == entity);
    }
}

impl fmt::Debug for ReadCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadCache")
            .field("entries", &self.len())
            .finish()
    }
}
