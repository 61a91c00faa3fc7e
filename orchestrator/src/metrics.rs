// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use axum::{extract::State, http::StatusCode, routing::get, Router};
use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_vec_with_registry,
    register_int_gauge_with_registry, Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Registry, TextEncoder,
};
use std::net::SocketAddr;
use tokio::task::JoinHandle;
use tracing::{error, info};

const SUBMISSION_LATENCY_SEC_BUCKETS: &[f64] = &[
    0.05, 0.1, 0.25, 0.5, 0.75, 1.0, 1.5, 2.0, 3.0, 5.0, 7.5, 10., 15., 20., 30., 45., 60., 90.,
    120.,
];

#[derive(Clone, Debug)]
pub struct EngineMetrics {
    pub(crate) queue_enqueued: IntCounterVec,
    pub(crate) queue_confirmed: IntCounterVec,
    pub(crate) queue_failed: IntCounterVec,
    pub(crate) queue_cancelled: IntCounterVec,
    pub(crate) queue_retried: IntCounterVec,
    pub(crate) queue_submission_errors: IntCounterVec,
    pub(crate) queue_estimation_fallbacks: IntCounter,
    pub(crate) queue_pending: IntGauge,
    pub(crate) queue_processing: IntGauge,
    pub(crate) queue_submission_latency: HistogramVec,

    pub(crate) event_poll_cycles: IntCounter,
    pub(crate) event_poll_errors: IntCounterVec,
    pub(crate) events_handled: IntCounterVec,
    pub(crate) event_handler_errors: IntCounterVec,
    pub(crate) event_last_processed_height: IntGaugeVec,
    pub(crate) event_remote_height: IntGauge,

    pub(crate) allowance_cache_hits: IntCounter,
    pub(crate) allowance_cache_misses: IntCounter,
    pub(crate) allowance_approvals_requested: IntCounter,

    pub(crate) optimistic_active_entries: IntGauge,
    pub(crate) optimistic_rollbacks: IntCounter,
    pub(crate) optimistic_rollback_errors: IntCounter,
}

impl EngineMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            queue_enqueued: register_int_counter_vec_with_registry!(
                "orchestrator_queue_enqueued",
                "Total number of operations enqueued, by action kind",
                &["kind"],
                registry,
            )
            .unwrap(),
            queue_confirmed: register_int_counter_vec_with_registry!(
                "orchestrator_queue_confirmed",
                "Total number of operations confirmed by the ledger, by action kind",
                &["kind"],
                registry,
            )
            .unwrap(),
            queue_failed: register_int_counter_vec_with_registry!(
                "orchestrator_queue_failed",
                "Total number of operations failed after exhausting attempts, by action kind",
                &["kind"],
                registry,
            )
            .unwrap(),
            queue_cancelled: register_int_counter_vec_with_registry!(
                "orchestrator_queue_cancelled",
                "Total number of pending operations cancelled, by action kind",
                &["kind"],
                registry,
            )
            .unwrap(),
            queue_retried: register_int_counter_vec_with_registry!(
                "orchestrator_queue_retried",
                "Total number of submission retries scheduled, by action kind",
                &["kind"],
                registry,
            )
            .unwrap(),
            queue_submission_errors: register_int_counter_vec_with_registry!(
                "orchestrator_queue_submission_errors",
                "Total number of failed submission attempts, by error type",
                &["type"],
                registry,
            )
            .unwrap(),
            queue_estimation_fallbacks: register_int_counter_with_registry!(
                "orchestrator_queue_estimation_fallbacks",
                "Total number of cost estimations replaced by the default cost",
                registry,
            )
            .unwrap(),
            queue_pending: register_int_gauge_with_registry!(
                "orchestrator_queue_pending",
                "Current number of pending operations",
                registry,
            )
            .unwrap(),
            queue_processing: register_int_gauge_with_registry!(
                "orchestrator_queue_processing",
                "Current number of operations with a submission in flight",
                registry,
            )
            .unwrap(),
            queue_submission_latency: register_histogram_vec_with_registry!(
                "orchestrator_queue_submission_latency",
                "Latency of a single submission attempt, by action kind",
                &["kind"],
                SUBMISSION_LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )
            .unwrap(),
            event_poll_cycles: register_int_counter_with_registry!(
                "orchestrator_event_poll_cycles",
                "Total number of event poll cycles run",
                registry,
            )
            .unwrap(),
            event_poll_errors: register_int_counter_vec_with_registry!(
                "orchestrator_event_poll_errors",
                "Total number of failed log fetches, by source",
                &["source"],
                registry,
            )
            .unwrap(),
            events_handled: register_int_counter_vec_with_registry!(
                "orchestrator_events_handled",
                "Total number of ledger events handled, by event kind",
                &["kind"],
                registry,
            )
            .unwrap(),
            event_handler_errors: register_int_counter_vec_with_registry!(
                "orchestrator_event_handler_errors",
                "Total number of event handler failures, by event kind",
                &["kind"],
                registry,
            )
            .unwrap(),
            event_last_processed_height: register_int_gauge_vec_with_registry!(
                "orchestrator_event_last_processed_height",
                "Cursor of each event source",
                &["source"],
                registry,
            )
            .unwrap(),
            event_remote_height: register_int_gauge_with_registry!(
                "orchestrator_event_remote_height",
                "Latest height reported by the remote ledger",
                registry,
            )
            .unwrap(),
            allowance_cache_hits: register_int_counter_with_registry!(
                "orchestrator_allowance_cache_hits",
                "Total number of authorization checks served from cache",
                registry,
            )
            .unwrap(),
            allowance_cache_misses: register_int_counter_with_registry!(
                "orchestrator_allowance_cache_misses",
                "Total number of authorization checks that read the ledger",
                registry,
            )
            .unwrap(),
            allowance_approvals_requested: register_int_counter_with_registry!(
                "orchestrator_allowance_approvals_requested",
                "Total number of approval operations enqueued",
                registry,
            )
            .unwrap(),
            optimistic_active_entries: register_int_gauge_with_registry!(
                "orchestrator_optimistic_active_entries",
                "Current number of pending speculative entries",
                registry,
            )
            .unwrap(),
            optimistic_rollbacks: register_int_counter_with_registry!(
                "orchestrator_optimistic_rollbacks",
                "Total number of speculative entries rolled back",
                registry,
            )
            .unwrap(),
            optimistic_rollback_errors: register_int_counter_with_registry!(
                "orchestrator_optimistic_rollback_errors",
                "Total number of rollback hooks that returned an error",
                registry,
            )
            .unwrap(),
        }
    }

    pub fn new_for_testing() -> Self {
        let registry = Registry::new();
        Self::new(&registry)
    }
}

async fn metrics_handler(State(registry): State<Registry>) -> (StatusCode, String) {
    let mut buffer = Vec::new();
    match TextEncoder::new().encode(&registry.gather(), &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            String::from_utf8_lossy(&buffer).into_owned(),
        ),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// Serve `registry` in the prometheus text format on `GET /metrics`
pub async fn start_metrics_server(
    addr: SocketAddr,
    registry: Registry,
) -> anyhow::Result<JoinHandle<()>> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("[Metrics] serving on {}", listener.local_addr()?);
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(registry);
    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("[Metrics] server exited: {:?}", e);
        }
    }))
}
