// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::history::{HistoryEntry, HistoryLog};
use super::types::{OperationStatus, QueueSnapshot, QueuedOperation, StatusCounts};
use crate::config::QueueConfig;
use crate::ledger_client::{LedgerClient, LedgerError};
use crate::metrics::EngineMetrics;
use crate::optimistic::{EntryId, OptimisticLedger};
use crate::read_cache::CacheInvalidator;
use crate::scheduler::Scheduler;
use crate::types::{ActionKind, CallPayload, OperationId, Priority, ResultHandle, TxRequest};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Default)]
struct QueueState {
    /// Priority order, FIFO within a priority. Terminal operations stay in
    /// place until pruned.
    operations: Vec<QueuedOperation>,
    cancelled_total: usize,
}

impl QueueState {
    fn find_mut(&mut self, id: OperationId) -> Option<&mut QueuedOperation> {
        self.operations.iter_mut().find(|op| op.id == id)
    }

    fn count(&self, status: OperationStatus) -> usize {
        self.operations.iter().filter(|op| op.status == status).count()
    }

    fn backing_off_count(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| op.status == OperationStatus::Pending && op.backing_off)
            .count()
    }

    /// Drop the oldest terminal operations beyond `keep`
    fn prune_terminal(&mut self, keep: usize) {
        let mut terminal: Vec<(u64, OperationId)> = self
            .operations
            .iter()
            .filter(|op| op.status.is_terminal())
            .map(|op| (op.updated_at, op.id))
            .collect();
        if terminal.len() <= keep {
            return;
        }
        terminal.sort();
        let excess: Vec<OperationId> = terminal[..terminal.len() - keep]
            .iter()
            .map(|(_, id)| *id)
            .collect();
        self.operations.retain(|op| !excess.contains(&op.id));
    }
}

enum AttemptOutcome {
    Retry {
        kind: ActionKind,
        attempts: u32,
    },
    Exhausted(QueuedOperation),
}

/// Priority queue of ledger submissions with bounded concurrency and
/// linear-backoff retries.
///
/// Cheap to clone; clones share the queue.
#[derive(Clone)]
pub struct TransactionQueue {
    config: QueueConfig,
    client: Arc<dyn LedgerClient>,
    ledger: OptimisticLedger,
    invalidator: Arc<dyn CacheInvalidator>,
    scheduler: Arc<dyn Scheduler>,
    history: Option<Arc<dyn HistoryLog>>,
    metrics: Option<Arc<EngineMetrics>>,
    state: Arc<Mutex<QueueState>>,
    next_id: Arc<AtomicU64>,
    cancel: Arc<Mutex<CancellationToken>>,
}

impl TransactionQueue {
    pub fn new(
        config: QueueConfig,
        client: Arc<dyn LedgerClient>,
        ledger: OptimisticLedger,
        invalidator: Arc<dyn CacheInvalidator>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        Self {
            config,
            client,
            ledger,
            invalidator,
            scheduler,
            history: None,
            metrics: None,
            state: Arc::new(Mutex::new(QueueState::default())),
            next_id: Arc::new(AtomicU64::new(0)),
            cancel: Arc::new(Mutex::new(CancellationToken::new())),
        }
    }

    pub fn with_history(mut self, history: Arc<dyn HistoryLog>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Add an operation. Cost estimation is best-effort: a failed estimate
    /// falls back to the configured default instead of rejecting.
    pub async fn enqueue(
        &self,
        kind: ActionKind,
        request: TxRequest,
        priority: Priority,
        speculative_ref: Option<EntryId>,
    ) -> OperationId {
        let estimated_cost = match self.client.estimate_cost(&request).await {
            Ok(cost) => cost,
            Err(e) => {
                warn!(
                    "[TxQueue] cost estimation for {} failed, using default {}: {}",
                    kind, self.config.default_cost, e
                );
                if let Some(m) = &self.metrics {
                    m.queue_estimation_fallbacks.inc();
                }
                self.config.default_cost
            }
        };

        let now = self.scheduler.now();
        let id = OperationId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let op = QueuedOperation {
            id,
            kind,
            request,
            priority,
            attempts: 0,
            max_attempts: self.config.max_attempts,
            status: OperationStatus::Pending,
            created_at: now,
            updated_at: now,
            result_handle: None,
            last_error: None,
            estimated_cost,
            speculative_ref,
            backing_off: false,
        };

        {
            let mut state = self.state.lock();
            let weight = priority.weight();
            let position = state
                .operations
                .iter()
                .position(|existing| existing.priority.weight() < weight)
                .unwrap_or(state.operations.len());
            state.operations.insert(position, op);
            self.update_gauges(&state);
        }
        if let Some(m) = &self.metrics {
            m.queue_enqueued.with_label_values(&[kind.as_str()]).inc();
        }
        debug!(
            "[TxQueue] enqueued {} {} at {} priority (cost {})",
            id, kind, priority, estimated_cost
        );
        id
    }

    /// Cancel a pending operation, rolling back its optimistic entry.
    /// Returns false once the operation is processing or terminal.
    pub fn cancel(&self, id: OperationId) -> bool {
        let cancelled = {
            let mut state = self.state.lock();
            let index = state
                .operations
                .iter()
                .position(|op| op.id == id && op.status == OperationStatus::Pending);
            let cancelled = index.map(|i| state.operations.remove(i));
            if cancelled.is_some() {
                state.cancelled_total += 1;
            }
            self.update_gauges(&state);
            cancelled
        };
        let Some(mut op) = cancelled else {
            debug!("[TxQueue] {} is not pending, cannot cancel", id);
            return false;
        };

        op.status = OperationStatus::Cancelled;
        op.updated_at = self.scheduler.now();
        if let Some(entry) = op.speculative_ref {
            self.ledger.fail(entry, "cancelled");
        }
        self.append_history(&op);
        if let Some(m) = &self.metrics {
            m.queue_cancelled.with_label_values(&[op.kind.as_str()]).inc();
        }
        info!("[TxQueue] cancelled {} {}", id, op.kind);
        true
    }

    pub fn status(&self) -> QueueSnapshot {
        let state = self.state.lock();
        let backing_off = state.backing_off_count();
        QueueSnapshot {
            counts: StatusCounts {
                pending: state.count(OperationStatus::Pending) - backing_off,
                backing_off,
                processing: state.count(OperationStatus::Processing),
                confirmed: state.count(OperationStatus::Confirmed),
                failed: state.count(OperationStatus::Failed),
                cancelled: state.cancelled_total,
            },
            operations: state.operations.clone(),
        }
    }

    pub fn get(&self, id: OperationId) -> Option<QueuedOperation> {
        self.state
            .lock()
            .operations
            .iter()
            .find(|op| op.id == id)
            .cloned()
    }

    /// Id of a pending or processing approval of `spender` over `owner`'s `asset`
    pub fn find_active_approval(
        &self,
        asset: &str,
        spender: &str,
        owner: &str,
    ) -> Option<OperationId> {
        self.state
            .lock()
            .operations
            .iter()
            .find(|op| {
                !op.status.is_terminal()
                    && op.request.owner == owner
                    && matches!(
                        &op.request.payload,
                        CallPayload::Approve { asset: a, spender: s, .. } if a == asset && s == spender
                    )
            })
            .map(|op| op.id)
    }

    /// Drop every terminal operation from the snapshot. Returns how many.
    pub fn clear_completed(&self) -> usize {
        let mut state = self.state.lock();
        let before = state.operations.len();
        state.operations.retain(|op| !op.status.is_terminal());
        before - state.operations.len()
    }

    /// One driver cycle: move eligible operations to processing while the
    /// concurrency bound allows and spawn their submissions.
    pub fn tick(&self) -> Vec<JoinHandle<()>> {
        let selected: Vec<QueuedOperation> = {
            let mut state = self.state.lock();
            let processing = state.count(OperationStatus::Processing);
            let free = self.config.max_concurrent.saturating_sub(processing);
            let now = self.scheduler.now();
            let mut selected = Vec::with_capacity(free);
            for op in state.operations.iter_mut() {
                if selected.len() >= free {
                    break;
                }
                if op.is_eligible() {
                    op.status = OperationStatus::Processing;
                    op.updated_at = now;
                    selected.push(op.clone());
                }
            }
            self.update_gauges(&state);
            selected
        };

        selected
            .into_iter()
            .map(|op| {
                let queue = self.clone();
                tokio::spawn(async move { queue.execute(op).await })
            })
            .collect()
    }

    async fn execute(&self, op: QueuedOperation) {
        debug!(
            "[TxQueue] submitting {} {} (attempt {}/{})",
            op.id,
            op.kind,
            op.attempts + 1,
            op.max_attempts
        );
        let started = Instant::now();
        let outcome = self.submit(&op).await;
        if let Some(m) = &self.metrics {
            m.queue_submission_latency
                .with_label_values(&[op.kind.as_str()])
                .observe(started.elapsed().as_secs_f64());
        }
        match outcome {
            Ok(handle) => self.on_confirmed(op.id, handle),
            Err(e) => self.on_attempt_failed(op.id, e),
        }
    }

    async fn submit(&self, op: &QueuedOperation) -> Result<ResultHandle, LedgerError> {
        // Fees move between enqueue and execution
        let fees = self.client.get_fee_parameters().await?;
        let mut request = op.request.clone();
        request.fees = Some(fees);
        request.cost_limit.get_or_insert(op.estimated_cost);
        self.client.submit(&request).await
    }

    fn on_confirmed(&self, id: OperationId, handle: ResultHandle) {
        let confirmed = {
            let mut state = self.state.lock();
            let now = self.scheduler.now();
            let confirmed = state.find_mut(id).map(|op| {
                op.status = OperationStatus::Confirmed;
                op.result_handle = Some(handle.clone());
                op.updated_at = now;
                op.clone()
            });
            state.prune_terminal(self.config.completed_retention);
            self.update_gauges(&state);
            confirmed
        };
        let Some(op) = confirmed else {
            return;
        };

        info!("[TxQueue] {} {} confirmed: {}", op.id, op.kind, handle);
        if let Some(entry) = op.speculative_ref {
            self.ledger.confirm(entry, Some(handle));
        }
        let keys = op.request.affected_keys();
        if keys.is_empty() {
            self.invalidator.invalidate_owner(&op.request.owner);
        }
        for key in &keys {
            self.invalidator.invalidate(key);
        }
        self.append_history(&op);
        if let Some(m) = &self.metrics {
            m.queue_confirmed.with_label_values(&[op.kind.as_str()]).inc();
        }
    }

    fn on_attempt_failed(&self, id: OperationId, err: LedgerError) {
        if let Some(m) = &self.metrics {
            m.queue_submission_errors
                .with_label_values(&[err.error_type()])
                .inc();
        }
        let outcome = {
            let mut state = self.state.lock();
            let now = self.scheduler.now();
            let outcome = state.find_mut(id).map(|op| {
                op.attempts += 1;
                op.last_error = Some(err.to_string());
                op.updated_at = now;
                if op.attempts < op.max_attempts {
                    op.status = OperationStatus::Pending;
                    op.backing_off = true;
                    AttemptOutcome::Retry {
                        kind: op.kind,
                        attempts: op.attempts,
                    }
                } else {
                    op.status = OperationStatus::Failed;
                    AttemptOutcome::Exhausted(op.clone())
                }
            });
            if matches!(outcome, Some(AttemptOutcome::Exhausted(_))) {
                state.prune_terminal(self.config.completed_retention);
            }
            self.update_gauges(&state);
            outcome
        };

        match outcome {
            None => {}
            Some(AttemptOutcome::Retry { kind, attempts }) => {
                let delay = self.config.base_retry_delay * attempts;
                warn!(
                    "[TxQueue] {} {} attempt {} failed (transient: {}), retrying in {:?}: {}",
                    id,
                    kind,
                    attempts,
                    err.is_transient(),
                    delay,
                    err
                );
                if let Some(m) = &self.metrics {
                    m.queue_retried.with_label_values(&[kind.as_str()]).inc();
                }
                let state = Arc::downgrade(&self.state);
                self.scheduler.after(
                    delay,
                    Box::new(move || {
                        if let Some(state) = state.upgrade() {
                            if let Some(op) = state.lock().find_mut(id) {
                                op.backing_off = false;
                            }
                        }
                    }),
                );
            }
            Some(AttemptOutcome::Exhausted(op)) => {
                error!(
                    "[TxQueue] {} {} failed after {} attempts: {}",
                    op.id, op.kind, op.attempts, err
                );
                if let Some(entry) = op.speculative_ref {
                    self.ledger.fail(entry, &err.to_string());
                }
                self.append_history(&op);
                if let Some(m) = &self.metrics {
                    m.queue_failed.with_label_values(&[op.kind.as_str()]).inc();
                }
            }
        }
    }

    fn append_history(&self, op: &QueuedOperation) {
        if let Some(history) = &self.history {
            // Advisory only; never affects the operation
            if let Err(e) = history.append(&HistoryEntry::from_operation(op)) {
                warn!("[TxQueue] failed to append {} to history: {:?}", op.id, e);
            }
        }
    }

    fn update_gauges(&self, state: &QueueState) {
        if let Some(m) = &self.metrics {
            m.queue_pending
                .set(state.count(OperationStatus::Pending) as i64);
            m.queue_processing
                .set(state.count(OperationStatus::Processing) as i64);
        }
    }

    /// Spawn the periodic driver. It runs until [`TransactionQueue::stop`];
    /// starting again replaces any driver still running.
    pub fn start(&self) -> JoinHandle<()> {
        let cancel = CancellationToken::new();
        std::mem::replace(&mut *self.cancel.lock(), cancel.clone()).cancel();
        let queue = self.clone();
        tokio::spawn(async move {
            info!(
                "[TxQueue] driver started (max concurrent {}, tick {:?})",
                queue.config.max_concurrent, queue.config.tick_interval
            );
            let mut interval = time::interval(queue.config.tick_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("[TxQueue] driver stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        // Submissions run detached; in-flight ones finish after stop
                        queue.tick();
                    }
                }
            }
        })
    }

    pub fn stop(&self) {
        self.cancel.lock().cancel();
    }
}
