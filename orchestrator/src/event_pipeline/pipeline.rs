// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::handlers::{
    CorrectionSink, DefaultEventHandler, EventHandler, HandlerRegistry, LedgerCorrections,
};
use super::types::{
    EventKind, EventSource, LedgerEvent, PollReport, SourceId, SourceSnapshot, SourceState,
};
use crate::config::EventsConfig;
use crate::error::{EngineError, EngineResult};
use crate::ledger_client::{LedgerClient, LedgerResult, RawLog};
use crate::metrics::EngineMetrics;
use crate::optimistic::OptimisticLedger;
use crate::read_cache::CacheInvalidator;
use crate::scheduler::Scheduler;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// One source's fetch for the current cycle: heights `[from, to]`
struct Window {
    source: SourceId,
    address: String,
    kind: EventKind,
    handler: Arc<dyn EventHandler>,
    from: u64,
    to: u64,
}

/// Polls the remote ledger for finalized events, one bounded window per
/// source per cycle, and advances each source's cursor only after the whole
/// window was handled.
///
/// Cheap to clone; clones share sources.
#[derive(Clone)]
pub struct EventIngestionPipeline {
    config: EventsConfig,
    client: Arc<dyn LedgerClient>,
    registry: HandlerRegistry,
    sink: Arc<dyn CorrectionSink>,
    scheduler: Arc<dyn Scheduler>,
    metrics: Option<Arc<EngineMetrics>>,
    sources: Arc<Mutex<BTreeMap<SourceId, EventSource>>>,
    next_id: Arc<AtomicU64>,
    cancel: Arc<Mutex<CancellationToken>>,
}

impl EventIngestionPipeline {
    pub fn new(
        config: EventsConfig,
        client: Arc<dyn LedgerClient>,
        ledger: OptimisticLedger,
        invalidator: Arc<dyn CacheInvalidator>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        Self {
            config,
            client,
            registry: HandlerRegistry::with_defaults(),
            sink: Arc::new(LedgerCorrections::new(ledger, invalidator)),
            scheduler,
            metrics: None,
            sources: Arc::new(Mutex::new(BTreeMap::new())),
            next_id: Arc::new(AtomicU64::new(0)),
            cancel: Arc::new(Mutex::new(CancellationToken::new())),
        }
    }

    /// Handlers used for sources registered afterwards
    pub fn with_registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Follow `kind` events from `source_address`. Polling starts at the
    /// height after `start_height` (0 when absent).
    pub fn register(
        &self,
        source_address: impl Into<String>,
        kind: EventKind,
        start_height: Option<u64>,
    ) -> SourceId {
        let handler = self
            .registry
            .get(kind)
            .unwrap_or_else(|| Arc::new(DefaultEventHandler));
        self.register_with_handler(source_address, kind, start_height, handler)
    }

    pub fn register_with_handler(
        &self,
        source_address: impl Into<String>,
        kind: EventKind,
        start_height: Option<u64>,
        handler: Arc<dyn EventHandler>,
    ) -> SourceId {
        let id = SourceId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let source = EventSource {
            id,
            source_address: source_address.into(),
            event_kind: kind,
            handler,
            is_active: true,
            last_processed_height: start_height.unwrap_or(0),
            state: SourceState::Registered,
        };
        info!(
            "[EventPipeline] registered {} for {} events from {} at height {}",
            id, kind, source.source_address, source.last_processed_height
        );
        self.set_height_gauge(id, source.last_processed_height);
        self.sources.lock().insert(id, source);
        id
    }

    /// Stop following a source. A fetch already in flight for it completes
    /// but its events are dropped.
    pub fn deregister(&self, id: SourceId) -> EngineResult<SourceSnapshot> {
        let mut source = self
            .sources
            .lock()
            .remove(&id)
            .ok_or(EngineError::UnknownSource(id))?;
        source.is_active = false;
        source.state = SourceState::Deactivated;
        info!(
            "[EventPipeline] deregistered {} at height {}",
            id, source.last_processed_height
        );
        Ok(source.snapshot())
    }

    pub fn sources(&self) -> Vec<SourceSnapshot> {
        self.sources.lock().values().map(EventSource::snapshot).collect()
    }

    pub fn source(&self, id: SourceId) -> Option<SourceSnapshot> {
        self.sources.lock().get(&id).map(EventSource::snapshot)
    }

    /// One poll cycle over every active source.
    ///
    /// A failed height read skips the cycle. A failed fetch or handler only
    /// holds back its own source; the same window is fetched next cycle.
    pub async fn poll_once(&self) -> PollReport {
        if let Some(m) = &self.metrics {
            m.event_poll_cycles.inc();
        }
        let mut report = PollReport::default();
        for source in self.sources.lock().values_mut().filter(|s| s.is_active) {
            source.state = SourceState::Polling;
        }

        let height = match self.client.get_current_height().await {
            Ok(height) => height,
            Err(e) => {
                warn!("[EventPipeline] failed to read current height: {}", e);
                return report;
            }
        };
        report.remote_height = Some(height);
        if let Some(m) = &self.metrics {
            m.event_remote_height.set(height as i64);
        }

        let windows = self.plan_windows(height);
        let fetches = windows.into_iter().map(|window| async move {
            let logs = self
                .client
                .get_logs(&window.address, window.kind, window.from, window.to)
                .await;
            (window, logs)
        });
        for (window, logs) in join_all(fetches).await {
            self.process_window(window, logs, height, &mut report);
        }
        report
    }

    fn plan_windows(&self, height: u64) -> Vec<Window> {
        let mut sources = self.sources.lock();
        let mut windows = vec![];
        for source in sources.values_mut().filter(|s| s.is_active) {
            if source.last_processed_height >= height {
                source.state = SourceState::Idle;
                continue;
            }
            source.state = SourceState::Fetching;
            let from = source.last_processed_height + 1;
            let to = height.min(source.last_processed_height.saturating_add(self.config.max_window));
            windows.push(Window {
                source: source.id,
                address: source.source_address.clone(),
                kind: source.event_kind,
                handler: source.handler.clone(),
                from,
                to,
            });
        }
        windows
    }

    fn process_window(
        &self,
        window: Window,
        logs: LedgerResult<Vec<RawLog>>,
        height: u64,
        report: &mut PollReport,
    ) {
        let logs = match logs {
            Ok(logs) => logs,
            Err(e) => {
                warn!(
                    "[EventPipeline] {} failed to fetch [{}, {}]: {}",
                    window.source, window.from, window.to, e
                );
                if let Some(m) = &self.metrics {
                    m.event_poll_errors
                        .with_label_values(&[&window.source.to_string()])
                        .inc();
                }
                report.failed.push(window.source);
                return;
            }
        };
        if !self.sources.lock().contains_key(&window.source) {
            debug!(
                "[EventPipeline] {} was deregistered, dropping {} fetched logs",
                window.source,
                logs.len()
            );
            return;
        }

        let observed_at = self.scheduler.now();
        let mut events: Vec<LedgerEvent> = logs
            .into_iter()
            .map(|raw| LedgerEvent::from_raw(raw, window.kind, observed_at))
            .collect();
        events.sort_by_key(LedgerEvent::ordering_key);

        for event in &events {
            if let Err(e) = window.handler.handle(event, self.sink.as_ref()) {
                error!(
                    "[EventPipeline] {} handler failed on {} at {}:{}, window [{}, {}] will be retried: {}",
                    window.source,
                    event.kind,
                    event.block_height,
                    event.sequence_index,
                    window.from,
                    window.to,
                    e
                );
                if let Some(m) = &self.metrics {
                    m.event_handler_errors
                        .with_label_values(&[event.kind.as_str()])
                        .inc();
                }
                report.failed.push(window.source);
                return;
            }
            if let Some(m) = &self.metrics {
                m.events_handled
                    .with_label_values(&[event.kind.as_str()])
                    .inc();
            }
        }
        report.events_handled += events.len();

        let mut sources = self.sources.lock();
        let Some(source) = sources.get_mut(&window.source) else {
            return;
        };
        // Only advance from the cursor the window was planned against
        if source.last_processed_height + 1 != window.from {
            warn!(
                "[EventPipeline] {} cursor moved to {} during fetch of [{}, {}], not advancing",
                window.source, source.last_processed_height, window.from, window.to
            );
            return;
        }
        source.last_processed_height = window.to;
        source.state = if window.to < height {
            SourceState::Fetching
        } else {
            SourceState::Idle
        };
        debug!(
            "[EventPipeline] {} handled {} events in [{}, {}]",
            window.source,
            events.len(),
            window.from,
            window.to
        );
        self.set_height_gauge(window.source, window.to);
        report.advanced.push((window.source, window.to));
    }

    fn set_height_gauge(&self, id: SourceId, height: u64) {
        if let Some(m) = &self.metrics {
            m.event_last_processed_height
                .with_label_values(&[&id.to_string()])
                .set(height as i64);
        }
    }

    /// Spawn the periodic driver. It runs until [`EventIngestionPipeline::stop`];
    /// starting again replaces any driver still running.
    pub fn start(&self) -> JoinHandle<()> {
        let cancel = CancellationToken::new();
        std::mem::replace(&mut *self.cancel.lock(), cancel.clone()).cancel();
        let pipeline = self.clone();
        tokio::spawn(async move {
            info!(
                "[EventPipeline] driver started (poll {:?}, window {})",
                pipeline.config.poll_interval, pipeline.config.max_window
            );
            let mut interval = time::interval(pipeline.config.poll_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("[EventPipeline] driver stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        pipeline.poll_once().await;
                    }
                }
            }
        })
    }

    pub fn stop(&self) {
        self.cancel.lock().cancel();
    }
}
