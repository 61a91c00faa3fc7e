// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Time-boxed authorization cache with an auto-approval policy.
//!
//! Records live in the shared [`ReadCache`] under their allowance key, so an
//! `Approval` event or a confirmed approval invalidates them like any other
//! cached value.

use crate::config::AllowanceConfig;
use crate::error::EngineResult;
use crate::ledger_client::LedgerClient;
use crate::metrics::EngineMetrics;
use crate::read_cache::{CacheInvalidator, CacheKey, CacheValue, ReadCache};
use crate::scheduler::Scheduler;
use crate::tx_queue::TransactionQueue;
use crate::types::{ActionKind, OperationId, Priority, TimestampMs, TxRequest};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationRecord {
    pub asset: String,
    pub spender: String,
    pub owner: String,
    pub current_limit: u128,
    pub required_amount: u128,
    pub needs_increase: bool,
    pub last_checked_at: TimestampMs,
}

impl AuthorizationRecord {
    pub fn new(
        asset: &str,
        spender: &str,
        owner: &str,
        current_limit: u128,
        required_amount: u128,
        last_checked_at: TimestampMs,
    ) -> Self {
        Self {
            asset: asset.to_string(),
            spender: spender.to_string(),
            owner: owner.to_string(),
            current_limit,
            required_amount,
            needs_increase: current_limit < required_amount,
            last_checked_at,
        }
    }

    /// Same limit, new requirement; `needs_increase` is recomputed
    pub fn with_required(mut self, required_amount: u128) -> Self {
        self.required_amount = required_amount;
        self.needs_increase = self.current_limit < required_amount;
        self
    }

    pub fn is_fresh(&self, now: TimestampMs, ttl: Duration) -> bool {
        now.saturating_sub(self.last_checked_at) < ttl.as_millis() as u64
    }

    fn key(&self) -> CacheKey {
        CacheKey::allowance(&self.owner, &self.asset, &self.spender)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnsureOutcome {
    pub approved: bool,
    /// Approval operation carrying the increase, when one was needed
    pub request_id: Option<OperationId>,
}

#[derive(Clone)]
pub struct AllowanceCache {
    config: AllowanceConfig,
    client: Arc<dyn LedgerClient>,
    queue: TransactionQueue,
    cache: Arc<ReadCache>,
    scheduler: Arc<dyn Scheduler>,
    metrics: Option<Arc<EngineMetrics>>,
}

impl AllowanceCache {
    pub fn new(
        config: AllowanceConfig,
        client: Arc<dyn LedgerClient>,
        queue: TransactionQueue,
        cache: Arc<ReadCache>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        Self {
            config,
            client,
            queue,
            cache,
            scheduler,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Authorization of `spender` over `owner`'s `asset` against `required_amount`.
    ///
    /// A record younger than the TTL is served without a remote read. A
    /// failed remote read is returned as an error, never as "sufficient".
    pub async fn check(
        &self,
        asset: &str,
        spender: &str,
        owner: &str,
        required_amount: u128,
    ) -> EngineResult<AuthorizationRecord> {
        let key = CacheKey::allowance(owner, asset, spender);
        let now = self.scheduler.now();

        if let Some(CacheValue::Authorization(cached)) = self.cache.get(&key).map(|e| e.value) {
            if cached.is_fresh(now, self.config.ttl) {
                if let Some(m) = &self.metrics {
                    m.allowance_cache_hits.inc();
                }
                let record = cached.with_required(required_amount);
                self.store(&record);
                return Ok(record);
            }
        }

        if let Some(m) = &self.metrics {
            m.allowance_cache_misses.inc();
        }
        let current_limit = self.client.read_authorization(asset, owner, spender).await?;
        let record = AuthorizationRecord::new(
            asset,
            spender,
            owner,
            current_limit,
            required_amount,
            self.scheduler.now(),
        );
        debug!(
            "[AllowanceCache] {} may move {} {} of {} (needs {})",
            spender, current_limit, asset, owner, required_amount
        );
        self.store(&record);
        Ok(record)
    }

    /// Make sure `amount` is authorized, enqueueing an approval when it is
    /// not. An approval already pending for the same triple is reused.
    pub async fn ensure(
        &self,
        asset: &str,
        spender: &str,
        owner: &str,
        amount: u128,
    ) -> EngineResult<EnsureOutcome> {
        let record = self.check(asset, spender, owner, amount).await?;
        if !record.needs_increase {
            return Ok(EnsureOutcome {
                approved: true,
                request_id: None,
            });
        }

        if let Some(existing) = self.queue.find_active_approval(asset, spender, owner) {
            debug!(
                "[AllowanceCache] reusing in-flight approval {} for {}/{}/{}",
                existing, asset, spender, owner
            );
            return Ok(EnsureOutcome {
                approved: false,
                request_id: Some(existing),
            });
        }

        let approve_amount = self.approval_amount(amount);
        let id = self
            .queue
            .enqueue(
                ActionKind::Approve,
                TxRequest::approval(owner, asset, spender, approve_amount),
                Priority::High,
                None,
            )
            .await;
        if let Some(m) = &self.metrics {
            m.allowance_approvals_requested.inc();
        }
        info!(
            "[AllowanceCache] requested approval {} of {} {} for {} (limit {})",
            id, approve_amount, asset, spender, record.current_limit
        );
        Ok(EnsureOutcome {
            approved: false,
            request_id: Some(id),
        })
    }

    /// Force the next `check` for this triple to read the ledger
    pub fn invalidate(&self, asset: &str, spender: &str, owner: &str) {
        self.cache
            .invalidate(&CacheKey::allowance(owner, asset, spender));
    }

    fn approval_amount(&self, amount: u128) -> u128 {
        if self.config.unlimited {
            return u128::MAX;
        }
        let buffer = amount / 100 * u128::from(self.config.buffer_percent)
            + amount % 100 * u128::from(self.config.buffer_percent) / 100;
        amount.saturating_add(buffer)
    }

    fn store(&self, record: &AuthorizationRecord) {
        self.cache
            .set(record.key(), CacheValue::Authorization(record.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger_client::LedgerError;
    use crate::test_utils::Harness;
    use crate::types::CallPayload;
    use crate::EngineError;

    fn allowance(harness: &Harness) -> AllowanceCache {
        harness.allowance(harness.queue())
    }

    #[tokio::test]
    async fn test_fresh_record_served_without_remote_read() {
        let harness = Harness::new();
        let cache = allowance(&harness);
        harness.cache.set(
            CacheKey::allowance("O", "A", "S"),
            CacheValue::Authorization(AuthorizationRecord::new(
                "A",
                "S",
                "O",
                100,
                0,
                harness.scheduler.now(),
            )),
        );

        let record = cache.check("A", "S", "O", 50).await.unwrap();
        assert!(!record.needs_increase);
        assert_eq!(record.current_limit, 100);
        assert_eq!(record.required_amount, 50);
        assert_eq!(harness.client.authorization_reads(), 0);
        assert_eq!(harness.metrics.allowance_cache_hits.get(), 1);

        // Requirement is recomputed against the cached limit
        let record = cache.check("A", "S", "O", 150).await.unwrap();
        assert!(record.needs_increase);
        assert_eq!(harness.client.authorization_reads(), 0);
    }

    #[tokio::test]
    async fn test_stale_record_reads_remote() {
        let harness = Harness::new();
        harness.client.set_authorization("A", "O", "S", 30);
        let cache = allowance(&harness);

        let record = cache.check("A", "S", "O", 50).await.unwrap();
        assert!(record.needs_increase);
        assert_eq!(harness.client.authorization_reads(), 1);

        cache.check("A", "S", "O", 50).await.unwrap();
        assert_eq!(harness.client.authorization_reads(), 1);

        harness.scheduler.advance(Duration::from_secs(300));
        harness.client.set_authorization("A", "O", "S", 80);
        let record = cache.check("A", "S", "O", 50).await.unwrap();
        assert!(!record.needs_increase);
        assert_eq!(harness.client.authorization_reads(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_forces_remote_read() {
        let harness = Harness::new();
        let cache = allowance(&harness);
        cache.check("A", "S", "O", 1).await.unwrap();
        cache.invalidate("A", "S", "O");
        cache.check("A", "S", "O", 1).await.unwrap();
        assert_eq!(harness.client.authorization_reads(), 2);
    }

    #[tokio::test]
    async fn test_remote_read_failure_is_surfaced() {
        let harness = Harness::new();
        harness
            .client
            .fail_authorization_reads(Some(LedgerError::Timeout("provider".into())));
        let cache = allowance(&harness);
        let err = cache.check("A", "S", "O", 1).await.unwrap_err();
        assert!(matches!(err, EngineError::Ledger(LedgerError::Timeout(_))));
        assert!(cache.ensure("A", "S", "O", 1).await.is_err());
        assert!(harness.cache.is_empty());
    }

    #[tokio::test]
    async fn test_ensure_enqueues_buffered_high_priority_approval() {
        let harness = Harness::new();
        harness.client.set_authorization("DAI", "alice", "pool", 10);
        let queue = harness.queue();
        let cache = harness.allowance(queue.clone());

        let outcome = cache.ensure("DAI", "pool", "alice", 1_000).await.unwrap();
        assert!(!outcome.approved);
        let id = outcome.request_id.unwrap();
        let op = queue.get(id).unwrap();
        assert_eq!(op.kind, ActionKind::Approve);
        assert_eq!(op.priority, Priority::High);
        assert_eq!(
            op.request.payload,
            CallPayload::Approve {
                asset: "DAI".to_string(),
                spender: "pool".to_string(),
                amount: 1_100,
            }
        );

        // Same triple while the approval is in flight: no second approval
        let again = cache.ensure("DAI", "pool", "alice", 1_000).await.unwrap();
        assert_eq!(again.request_id, Some(id));
        assert_eq!(queue.status().operations.len(), 1);
    }

    #[tokio::test]
    async fn test_ensure_sufficient_is_approved() {
        let harness = Harness::new();
        harness.client.set_authorization("DAI", "alice", "pool", 5_000);
        let queue = harness.queue();
        let cache = harness.allowance(queue.clone());
        let outcome = cache.ensure("DAI", "pool", "alice", 1_000).await.unwrap();
        assert_eq!(
            outcome,
            EnsureOutcome {
                approved: true,
                request_id: None
            }
        );
        assert!(queue.status().operations.is_empty());
    }

    #[tokio::test]
    async fn test_approval_amounts() {
        let mut harness = Harness::new();
        let cache = allowance(&harness);
        assert_eq!(cache.approval_amount(1_000), 1_100);
        assert_eq!(cache.approval_amount(5), 5);
        assert_eq!(cache.approval_amount(u128::MAX), u128::MAX);

        harness.config.allowance.unlimited = true;
        let cache = allowance(&harness);
        assert_eq!(cache.approval_amount(1), u128::MAX);
    }
}
