// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::allowance::AllowanceCache;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::event_pipeline::EventIngestionPipeline;
use crate::ledger_client::LedgerClient;
use crate::metrics::EngineMetrics;
use crate::optimistic::{EntryId, OptimisticLedger, SpeculativePayload};
use crate::read_cache::ReadCache;
use crate::scheduler::Scheduler;
use crate::tx_queue::{
    HistoryLog, JsonlHistoryLog, MemoryHistoryLog, QueueSnapshot, TransactionQueue,
};
use crate::types::{ActionKind, OperationId, Priority, TxRequest};
use prometheus::Registry;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// Handles produced by [`Engine::submit_action`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmittedAction {
    pub operation: OperationId,
    pub speculative: EntryId,
    /// Approval enqueued ahead of the action, if the allowance was short
    pub approval: Option<OperationId>,
}

/// All components built from one [`EngineConfig`] and wired to a single
/// ledger client, cache and scheduler.
pub struct Engine {
    cache: Arc<ReadCache>,
    ledger: OptimisticLedger,
    queue: TransactionQueue,
    pipeline: EventIngestionPipeline,
    allowance: AllowanceCache,
    metrics: Arc<EngineMetrics>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        client: Arc<dyn LedgerClient>,
        scheduler: Arc<dyn Scheduler>,
        registry: &Registry,
    ) -> EngineResult<Self> {
        config.validate()?;

        let metrics = Arc::new(EngineMetrics::new(registry));
        let cache = Arc::new(ReadCache::new(scheduler.clone()));
        let ledger = OptimisticLedger::new(cache.clone(), scheduler.clone(), config.ledger.clone())
            .with_metrics(metrics.clone());

        let history: Arc<dyn HistoryLog> = match &config.history_path {
            Some(path) => Arc::new(
                JsonlHistoryLog::open(path).map_err(|e| EngineError::History(format!("{:#}", e)))?,
            ),
            None => Arc::new(MemoryHistoryLog::new()),
        };

        let queue = TransactionQueue::new(
            config.queue.clone(),
            client.clone(),
            ledger.clone(),
            cache.clone(),
            scheduler.clone(),
        )
        .with_history(history)
        .with_metrics(metrics.clone());

        let pipeline = EventIngestionPipeline::new(
            config.events.clone(),
            client.clone(),
            ledger.clone(),
            cache.clone(),
            scheduler.clone(),
        )
        .with_metrics(metrics.clone());
        for source in &config.events.sources {
            pipeline.register(
                source.source_address.clone(),
                source.event_kind,
                source.start_height,
            );
        }

        let allowance = AllowanceCache::new(
            config.allowance.clone(),
            client,
            queue.clone(),
            cache.clone(),
            scheduler,
        )
        .with_metrics(metrics.clone());

        Ok(Self {
            cache,
            ledger,
            queue,
            pipeline,
            allowance,
            metrics,
        })
    }

    /// Spawn the queue and pipeline drivers
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        info!(
            "[Engine] starting with {} event sources",
            self.pipeline.sources().len()
        );
        vec![self.queue.start(), self.pipeline.start()]
    }

    /// Signal both drivers to exit after their current cycle
    pub fn stop(&self) {
        info!("[Engine] stopping");
        self.queue.stop();
        self.pipeline.stop();
    }

    /// Run a user action end to end: make sure the protocol may pull the
    /// tokens, apply the speculative effects, then queue the submission.
    ///
    /// Nothing is recorded or enqueued if the allowance check fails.
    pub async fn submit_action(
        &self,
        kind: ActionKind,
        owner: &str,
        destination: &str,
        asset: &str,
        amount: u128,
        priority: Priority,
    ) -> EngineResult<SubmittedAction> {
        let approval = if kind.requires_allowance() {
            self.allowance
                .ensure(asset, destination, owner, amount)
                .await?
                .request_id
        } else {
            None
        };

        let speculative = self.ledger.record(
            kind,
            SpeculativePayload::for_action(kind, owner, asset, amount),
            None,
        );
        let operation = self
            .queue
            .enqueue(
                kind,
                TxRequest::action(kind, owner, destination, asset, amount),
                priority,
                Some(speculative),
            )
            .await;

        Ok(SubmittedAction {
            operation,
            speculative,
            approval,
        })
    }

    pub fn status(&self) -> QueueSnapshot {
        self.queue.status()
    }

    pub fn cache(&self) -> &Arc<ReadCache> {
        &self.cache
    }

    pub fn ledger(&self) -> &OptimisticLedger {
        &self.ledger
    }

    pub fn queue(&self) -> &TransactionQueue {
        &self.queue
    }

    pub fn pipeline(&self) -> &EventIngestionPipeline {
        &self.pipeline
    }

    pub fn allowance(&self) -> &AllowanceCache {
        &self.allowance
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }
}
