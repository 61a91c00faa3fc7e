// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Mock ledger client and a pre-wired component harness for unit tests.

use crate::allowance::AllowanceCache;
use crate::config::EngineConfig;
use crate::event_pipeline::{EventIngestionPipeline, EventKind};
use crate::ledger_client::{LedgerClient, LedgerError, LedgerResult, RawLog};
use crate::metrics::EngineMetrics;
use crate::optimistic::OptimisticLedger;
use crate::read_cache::ReadCache;
use crate::scheduler::ManualScheduler;
use crate::tx_queue::TransactionQueue;
use crate::types::{FeeParameters, ResultHandle, TxRequest};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

pub fn raw_log(address: &str, kind: &str, height: u64, index: u32) -> RawLog {
    RawLog {
        address: address.to_string(),
        event_kind: kind.to_string(),
        block_height: height,
        tx_handle: format!("0x{:x}{:02x}", height, index),
        log_index: index,
        fields: serde_json::Map::new(),
    }
}

// Mock client used in unit tests. Scripted failures and gates are toggled
// from the test body while the component under test runs.
#[derive(Debug, Default)]
pub struct MockLedgerClient {
    height: AtomicU64,
    height_error: Mutex<Option<LedgerError>>,
    logs: Mutex<Vec<RawLog>>,
    log_queries: Mutex<Vec<(String, u64, u64)>>,
    failing_sources: Mutex<HashSet<String>>,
    logs_gate: Mutex<Option<Arc<Semaphore>>>,
    authorizations: Mutex<HashMap<(String, String, String), u128>>,
    authorization_error: Mutex<Option<LedgerError>>,
    authorization_reads: AtomicUsize,
    fail_estimates: AtomicBool,
    fail_fees: AtomicBool,
    fail_submissions: AtomicBool,
    submit_results: Mutex<VecDeque<LedgerResult<ResultHandle>>>,
    submit_gate: Mutex<Option<Arc<Semaphore>>>,
    submitted: Mutex<Vec<TxRequest>>,
    next_handle: AtomicU64,
}

impl MockLedgerClient {
    pub const ESTIMATED_COST: u64 = 21_000;

    pub fn set_height(&self, height: u64) {
        self.height.store(height, Ordering::SeqCst);
    }

    pub fn fail_height(&self, error: Option<LedgerError>) {
        *self.height_error.lock() = error;
    }

    pub fn add_log(&self, log: RawLog) {
        self.logs.lock().push(log);
    }

    /// `(from, to)` ranges requested for `address`, in call order
    pub fn log_queries(&self, address: &str) -> Vec<(u64, u64)> {
        self.log_queries
            .lock()
            .iter()
            .filter(|(a, _, _)| a == address)
            .map(|(_, from, to)| (*from, *to))
            .collect()
    }

    pub fn fail_logs_for(&self, address: &str, fail: bool) {
        let mut failing = self.failing_sources.lock();
        if fail {
            failing.insert(address.to_string());
        } else {
            failing.remove(address);
        }
    }

    /// Park every `get_logs` call until `release_logs`
    pub fn hold_logs(&self) {
        *self.logs_gate.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_logs(&self) {
        if let Some(gate) = self.logs_gate.lock().take() {
            gate.close();
        }
    }

    pub fn set_authorization(&self, asset: &str, owner: &str, spender: &str, limit: u128) {
        self.authorizations.lock().insert(
            (asset.to_string(), owner.to_string(), spender.to_string()),
            limit,
        );
    }

    pub fn fail_authorization_reads(&self, error: Option<LedgerError>) {
        *self.authorization_error.lock() = error;
    }

    pub fn authorization_reads(&self) -> usize {
        self.authorization_reads.load(Ordering::SeqCst)
    }

    pub fn fail_estimates(&self, fail: bool) {
        self.fail_estimates.store(fail, Ordering::SeqCst);
    }

    pub fn fail_fee_parameters(&self, fail: bool) {
        self.fail_fees.store(fail, Ordering::SeqCst);
    }

    pub fn fail_all_submissions(&self, fail: bool) {
        self.fail_submissions.store(fail, Ordering::SeqCst);
    }

    /// Scripted result for the next submission, ahead of the default
    pub fn push_submit_result(&self, result: LedgerResult<ResultHandle>) {
        self.submit_results.lock().push_back(result);
    }

    /// Park submissions until permits are released
    pub fn hold_submissions(&self) {
        *self.submit_gate.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_submissions(&self, count: usize) {
        if let Some(gate) = self.submit_gate.lock().as_ref() {
            gate.add_permits(count);
        }
    }

    /// Requests that reached the ledger, including rejected ones
    pub fn submitted(&self) -> Vec<TxRequest> {
        self.submitted.lock().clone()
    }
}

#[async_trait]
impl LedgerClient for MockLedgerClient {
    async fn get_current_height(&self) -> LedgerResult<u64> {
        if let Some(e) = self.height_error.lock().clone() {
            return Err(e);
        }
        Ok(self.height.load(Ordering::SeqCst))
    }

    async fn get_logs(
        &self,
        source_address: &str,
        kind: EventKind,
        from: u64,
        to: u64,
    ) -> LedgerResult<Vec<RawLog>> {
        self.log_queries
            .lock()
            .push((source_address.to_string(), from, to));
        let gate = self.logs_gate.lock().clone();
        if let Some(gate) = gate {
            // Closed on release
            let _ = gate.acquire().await;
        }
        if self.failing_sources.lock().contains(source_address) {
            return Err(LedgerError::Transport(format!(
                "logs unavailable for {}",
                source_address
            )));
        }
        Ok(self
            .logs
            .lock()
            .iter()
            .filter(|log| {
                log.address == source_address
                    && log.event_kind == kind.as_str()
                    && (from..=to).contains(&log.block_height)
            })
            .cloned()
            .collect())
    }

    async fn read_authorization(
        &self,
        asset: &str,
        owner: &str,
        spender: &str,
    ) -> LedgerResult<u128> {
        self.authorization_reads.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.authorization_error.lock().clone() {
            return Err(e);
        }
        Ok(self
            .authorizations
            .lock()
            .get(&(asset.to_string(), owner.to_string(), spender.to_string()))
            .copied()
            .unwrap_or(0))
    }

    async fn estimate_cost(&self, _request: &TxRequest) -> LedgerResult<u64> {
        if self.fail_estimates.load(Ordering::SeqCst) {
            return Err(LedgerError::Rejected("execution reverted".into()));
        }
        Ok(Self::ESTIMATED_COST)
    }

    async fn submit(&self, request: &TxRequest) -> LedgerResult<ResultHandle> {
        let gate = self.submit_gate.lock().clone();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        self.submitted.lock().push(request.clone());
        if let Some(result) = self.submit_results.lock().pop_front() {
            return result;
        }
        if self.fail_submissions.load(Ordering::SeqCst) {
            return Err(LedgerError::Rejected("nonce too low".into()));
        }
        let n = self.next_handle.fetch_add(1, Ordering::SeqCst);
        Ok(ResultHandle(format!("0xreceipt{}", n)))
    }

    async fn get_fee_parameters(&self) -> LedgerResult<FeeParameters> {
        if self.fail_fees.load(Ordering::SeqCst) {
            return Err(LedgerError::Timeout("fee history".into()));
        }
        Ok(FeeParameters {
            max_fee_per_unit: 30_000_000_000,
            priority_fee_per_unit: 1_500_000_000,
        })
    }
}

/// Components sharing one mock client, cache, clock and optimistic ledger.
/// Adjust `config` before building the component that reads it.
pub struct Harness {
    pub config: EngineConfig,
    pub client: Arc<MockLedgerClient>,
    pub scheduler: Arc<ManualScheduler>,
    pub cache: Arc<ReadCache>,
    pub metrics: Arc<EngineMetrics>,
    ledger: OptimisticLedger,
}

impl Harness {
    pub fn new() -> Self {
        let config = EngineConfig::new("http://127.0.0.1:0");
        let scheduler = Arc::new(ManualScheduler::default());
        let cache = Arc::new(ReadCache::new(scheduler.clone()));
        let metrics = Arc::new(EngineMetrics::new_for_testing());
        let ledger = OptimisticLedger::new(cache.clone(), scheduler.clone(), config.ledger.clone())
            .with_metrics(metrics.clone());
        Self {
            config,
            client: Arc::new(MockLedgerClient::default()),
            scheduler,
            cache,
            metrics,
            ledger,
        }
    }

    pub fn ledger(&self) -> OptimisticLedger {
        self.ledger.clone()
    }

    pub fn queue(&self) -> TransactionQueue {
        TransactionQueue::new(
            self.config.queue.clone(),
            self.client.clone(),
            self.ledger.clone(),
            self.cache.clone(),
            self.scheduler.clone(),
        )
        .with_metrics(self.metrics.clone())
    }

    pub fn pipeline(&self) -> EventIngestionPipeline {
        EventIngestionPipeline::new(
            self.config.events.clone(),
            self.client.clone(),
            self.ledger.clone(),
            self.cache.clone(),
            self.scheduler.clone(),
        )
        .with_metrics(self.metrics.clone())
    }

    pub fn allowance(&self, queue: TransactionQueue) -> AllowanceCache {
        AllowanceCache::new(
            self.config.allowance.clone(),
            self.client.clone(),
            queue,
            self.cache.clone(),
            self.scheduler.clone(),
        )
        .with_metrics(self.metrics.clone())
    }
}
