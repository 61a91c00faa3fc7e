// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::types::{EventKind, LedgerEvent};
use crate::optimistic::OptimisticLedger;
use crate::read_cache::{CacheInvalidator, CacheKey, EntityKind};
use crate::types::{ActionKind, ResultHandle};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use strum::IntoEnumIterator;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),
}

/// What a handler is allowed to do in response to an event
pub trait CorrectionSink: Send + Sync {
    fn invalidate_cache(&self, keys: &[CacheKey]);

    fn invalidate_owner(&self, owner: &str);

    fn invalidate_entity(&self, entity: EntityKind);

    /// Settle the local view of an action the ledger has now finalized
    fn apply_optimistic_correction(
        &self,
        kind: ActionKind,
        owner: &str,
        asset: Option<&str>,
        amount: u128,
        tx_handle: &str,
    );
}

/// Handles every event of the kinds it is registered for. Must tolerate
/// re-delivery of the same event.
pub trait EventHandler: Send + Sync + fmt::Debug {
    fn handle(&self, event: &LedgerEvent, sink: &dyn CorrectionSink) -> Result<(), HandlerError>;
}

/// Sink backed by the optimistic ledger and the shared read cache
pub struct LedgerCorrections {
    ledger: OptimisticLedger,
    invalidator: Arc<dyn CacheInvalidator>,
}

impl LedgerCorrections {
    pub fn new(ledger: OptimisticLedger, invalidator: Arc<dyn CacheInvalidator>) -> Self {
        Self {
            ledger,
            invalidator,
        }
    }
}

impl CorrectionSink for LedgerCorrections {
    fn invalidate_cache(&self, keys: &[CacheKey]) {
        for key in keys {
            self.invalidator.invalidate(key);
        }
    }

    fn invalidate_owner(&self, owner: &str) {
        self.invalidator.invalidate_owner(owner);
    }

    fn invalidate_entity(&self, entity: EntityKind) {
        self.invalidator.invalidate_entity(entity);
    }

    fn apply_optimistic_correction(
        &self,
        kind: ActionKind,
        owner: &str,
        asset: Option<&str>,
        amount: u128,
        tx_handle: &str,
    ) {
        self.ledger.reconcile(
            kind,
            owner,
            asset,
            amount,
            Some(ResultHandle(tx_handle.to_string())),
        );
    }
}

/// Invalidates whatever an event can have changed and settles matching
/// optimistic entries. Events missing the fields needed to name precise
/// keys fall back to invalidating whole entity kinds.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultEventHandler;

impl DefaultEventHandler {
    fn invalidate_entities(kind: EventKind, sink: &dyn CorrectionSink) {
        for entity in kind.affected_entities() {
            sink.invalidate_entity(*entity);
        }
    }

    fn handle_action(event: &LedgerEvent, action: ActionKind, sink: &dyn CorrectionSink) {
        let (Some(owner), Some(asset)) = (event.field_str("owner"), event.field_str("asset"))
        else {
            debug!(
                "[EventPipeline] {} at {} lacks owner/asset, invalidating by entity",
                event.kind, event.block_height
            );
            Self::invalidate_entities(event.kind, sink);
            return;
        };
        let amount = event.field_amount("amount");

        let mut keys: Vec<CacheKey> = action
            .effects(owner, asset, amount.unwrap_or_default())
            .into_iter()
            .map(|d| d.key)
            .collect();
        keys.push(CacheKey::position(owner));
        keys.push(CacheKey::market(asset));
        sink.invalidate_cache(&keys);

        if let Some(amount) = amount {
            sink.apply_optimistic_correction(action, owner, Some(asset), amount, &event.tx_handle);
        }
    }

    fn handle_liquidation(event: &LedgerEvent, sink: &dyn CorrectionSink) {
        let Some(borrower) = event.field_str("borrower") else {
            Self::invalidate_entities(event.kind, sink);
            return;
        };
        sink.invalidate_owner(borrower);
        let markets: Vec<CacheKey> = ["collateralAsset", "debtAsset"]
            .iter()
            .filter_map(|f| event.field_str(f))
            .map(CacheKey::market)
            .collect();
        if markets.is_empty() {
            sink.invalidate_entity(EntityKind::Market);
        } else {
            sink.invalidate_cache(&markets);
        }
    }

    fn handle_price_update(event: &LedgerEvent, sink: &dyn CorrectionSink) {
        // Every position's health depends on prices
        sink.invalidate_entity(EntityKind::Position);
        match event.field_str("asset") {
            Some(asset) => sink.invalidate_cache(&[CacheKey::market(asset)]),
            None => sink.invalidate_entity(EntityKind::Market),
        }
    }

    fn handle_approval(event: &LedgerEvent, sink: &dyn CorrectionSink) {
        // Approval events are emitted by the asset contract itself
        let asset = event
            .field_str("asset")
            .unwrap_or(event.source_address.as_str());
        match (event.field_str("owner"), event.field_str("spender")) {
            (Some(owner), Some(spender)) => {
                sink.invalidate_cache(&[CacheKey::allowance(owner, asset, spender)])
            }
            _ => sink.invalidate_entity(EntityKind::Allowance),
        }
    }
}

impl EventHandler for DefaultEventHandler {
    fn handle(&self, event: &LedgerEvent, sink: &dyn CorrectionSink) -> Result<(), HandlerError> {
        match event.kind {
            EventKind::Liquidation => Self::handle_liquidation(event, sink),
            EventKind::PriceUpdate => Self::handle_price_update(event, sink),
            EventKind::Approval => Self::handle_approval(event, sink),
            kind => match kind.action_kind() {
                Some(action) => Self::handle_action(event, action, sink),
                None => Self::invalidate_entities(kind, sink),
            },
        }
        Ok(())
    }
}

/// Event kind to handler mapping consulted at registration time
#[derive(Debug, Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<EventKind, Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with [`DefaultEventHandler`] for every kind
    pub fn with_defaults() -> Self {
        let default: Arc<dyn EventHandler> = Arc::new(DefaultEventHandler);
        Self {
            handlers: EventKind::iter().map(|k| (k, default.clone())).collect(),
        }
    }

    pub fn register(&mut self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        self.handlers.insert(kind, handler);
    }

    pub fn get(&self, kind: EventKind) -> Option<Arc<dyn EventHandler>> {
        self.handlers.get(&kind).cloned()
    }
}
