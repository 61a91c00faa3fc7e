// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::types::{
    EntryId, EntryStatus, InvalidateKeys, RollbackHook, SpeculativeEntry, SpeculativePayload,
};
use crate::config::LedgerConfig;
use crate::metrics::EngineMetrics;
use crate::read_cache::ReadCache;
use crate::scheduler::Scheduler;
use crate::types::{ActionKind, ResultHandle};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info};

struct Slot {
    entry: SpeculativeEntry,
    rollback: Option<Box<dyn RollbackHook>>,
}

/// Result handles remembered after their entry is collected, so a late
/// re-delivery of the same ledger event stays a no-op.
const SETTLED_HANDLE_CAPACITY: usize = 4096;

#[derive(Default)]
struct LedgerState {
    next_id: u64,
    slots: BTreeMap<EntryId, Slot>,
    settled: HashMap<ResultHandle, EntryId>,
    settled_order: VecDeque<ResultHandle>,
}

impl LedgerState {
    fn remember_settled(&mut self, handle: &ResultHandle, id: EntryId) {
        if self.settled.insert(handle.clone(), id).is_none() {
            self.settled_order.push_back(handle.clone());
            while self.settled_order.len() > SETTLED_HANDLE_CAPACITY {
                if let Some(old) = self.settled_order.pop_front() {
                    self.settled.remove(&old);
                }
            }
        }
    }

    fn settled_by(&self, handle: &ResultHandle) -> Option<EntryId> {
        self.settled.get(handle).copied().or_else(|| {
            self.slots
                .values()
                .find(|s| s.entry.result.as_ref() == Some(handle))
                .map(|s| s.entry.id)
        })
    }

    fn pending_count(&self) -> usize {
        self.slots
            .values()
            .filter(|s| s.entry.status == EntryStatus::Pending)
            .count()
    }

    fn allocate_id(&mut self) -> EntryId {
        self.next_id += 1;
        EntryId(self.next_id)
    }
}

/// Journal of speculative cache mutations awaiting a ledger outcome.
///
/// Cheap to clone; clones share the journal.
#[derive(Clone)]
pub struct OptimisticLedger {
    state: Arc<Mutex<LedgerState>>,
    cache: Arc<ReadCache>,
    scheduler: Arc<dyn Scheduler>,
    config: LedgerConfig,
    metrics: Option<Arc<EngineMetrics>>,
}

impl OptimisticLedger {
    pub fn new(cache: Arc<ReadCache>, scheduler: Arc<dyn Scheduler>, config: LedgerConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(LedgerState::default())),
            cache,
            scheduler,
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn cache(&self) -> &Arc<ReadCache> {
        &self.cache
    }

    /// Record a pending entry and apply its deltas to the read cache before
    /// returning. Without a hook, failure invalidates the touched keys.
    pub fn record(
        &self,
        kind: ActionKind,
        payload: SpeculativePayload,
        rollback: Option<Box<dyn RollbackHook>>,
    ) -> EntryId {
        let now = self.scheduler.now();
        let rollback =
            rollback.unwrap_or_else(|| Box::new(InvalidateKeys::new(self.cache.clone())));

        for effect in &payload.effects {
            self.cache.adjust(&effect.key, effect.delta);
        }

        let id = {
            let mut state = self.state.lock();
            let id = state.allocate_id();
            let entry = SpeculativeEntry {
                id,
                kind,
                payload,
                created_at: now,
                updated_at: now,
                status: EntryStatus::Pending,
                result: None,
                error: None,
                observed: false,
            };
            state.slots.insert(
                id,
                Slot {
                    entry,
                    rollback: Some(rollback),
                },
            );
            self.update_gauge(&state);
            id
        };
        debug!("[OptimisticLedger] recorded {} ({})", id, kind);
        id
    }

    /// `pending -> confirmed`. Returns false if the entry is missing or
    /// already terminal.
    pub fn confirm(&self, id: EntryId, result: Option<ResultHandle>) -> bool {
        let confirmed = {
            let mut state = self.state.lock();
            let confirmed = Self::confirm_locked(&mut state, id, result, self.scheduler.now());
            self.update_gauge(&state);
            confirmed
        };
        if confirmed {
            debug!("[OptimisticLedger] confirmed {}", id);
            self.schedule_removal(id, self.config.confirmed_retention);
        }
        confirmed
    }

    /// `pending -> failed`, firing the rollback hook. Returns false if the
    /// entry is missing or already terminal.
    pub fn fail(&self, id: EntryId, error: &str) -> bool {
        let taken = {
            let mut state = self.state.lock();
            let now = self.scheduler.now();
            let taken = match state.slots.get_mut(&id) {
                Some(slot) if slot.entry.status == EntryStatus::Pending => {
                    slot.entry.status = EntryStatus::Failed;
                    slot.entry.error = Some(error.to_string());
                    slot.entry.updated_at = now;
                    Some((slot.entry.clone(), slot.rollback.take()))
                }
                _ => None,
            };
            self.update_gauge(&state);
            taken
        };
        let Some((entry, rollback)) = taken else {
            return false;
        };

        info!("[OptimisticLedger] {} failed: {}", id, error);
        // Hook runs outside the lock so it may call back into the ledger
        if let Some(hook) = rollback {
            if let Some(m) = &self.metrics {
                m.optimistic_rollbacks.inc();
            }
            if let Err(e) = hook.rollback(&entry) {
                error!("[OptimisticLedger] rollback of {} failed: {:?}", id, e);
                if let Some(m) = &self.metrics {
                    m.optimistic_rollback_errors.inc();
                }
            }
        }
        self.schedule_removal(id, self.config.failed_retention);
        true
    }

    /// Match a ledger-observed effect to a local entry.
    ///
    /// An entry already settled under `tx_handle` (confirmed by the queue or
    /// by an earlier delivery of the same event) is returned unchanged.
    /// Otherwise the oldest pending local entry of the same kind, owner,
    /// asset and amount is confirmed. Without a match, records an
    /// already-confirmed observed entry that touches nothing.
    pub fn reconcile(
        &self,
        kind: ActionKind,
        owner: &str,
        asset: Option<&str>,
        amount: u128,
        tx_handle: Option<ResultHandle>,
    ) -> EntryId {
        let now = self.scheduler.now();
        let (id, matched) = {
            let mut state = self.state.lock();
            if let Some(id) = tx_handle.as_ref().and_then(|h| state.settled_by(h)) {
                debug!(
                    "[OptimisticLedger] {} already settled as {}",
                    tx_handle.as_ref().map(|h| h.0.as_str()).unwrap_or_default(),
                    id
                );
                return id;
            }
            let matched = state
                .slots
                .values()
                .find(|s| {
                    let e = &s.entry;
                    e.status == EntryStatus::Pending
                        && !e.observed
                        && e.kind == kind
                        && e.payload.owner == owner
                        && e.payload.asset.as_deref() == asset
                        && e.payload.amount == amount
                })
                .map(|s| s.entry.id);
            let id = match matched {
                Some(id) => {
                    Self::confirm_locked(&mut state, id, tx_handle, now);
                    id
                }
                None => {
                    let id = state.allocate_id();
                    let entry = SpeculativeEntry {
                        id,
                        kind,
                        payload: SpeculativePayload::observed(owner, asset, amount),
                        created_at: now,
                        updated_at: now,
                        status: EntryStatus::Confirmed,
                        result: tx_handle.clone(),
                        error: None,
                        observed: true,
                    };
                    state.slots.insert(
                        id,
                        Slot {
                            entry,
                            rollback: None,
                        },
                    );
                    if let Some(handle) = &tx_handle {
                        state.remember_settled(handle, id);
                    }
                    id
                }
            };
            self.update_gauge(&state);
            (id, matched.is_some())
        };
        debug!(
            "[OptimisticLedger] reconciled {} {} for {} (matched local entry: {})",
            kind, amount, owner, matched
        );
        self.schedule_removal(id, self.config.confirmed_retention);
        id
    }

    /// Snapshot of every entry not yet garbage-collected, oldest first
    pub fn list_active(&self) -> Vec<SpeculativeEntry> {
        self.state
            .lock()
            .slots
            .values()
            .map(|s| s.entry.clone())
            .collect()
    }

    pub fn get(&self, id: EntryId) -> Option<SpeculativeEntry> {
        self.state.lock().slots.get(&id).map(|s| s.entry.clone())
    }

    fn confirm_locked(
        state: &mut LedgerState,
        id: EntryId,
        result: Option<ResultHandle>,
        now: u64,
    ) -> bool {
        let Some(slot) = state
            .slots
            .get_mut(&id)
            .filter(|s| s.entry.status == EntryStatus::Pending)
        else {
            return false;
        };
        slot.entry.status = EntryStatus::Confirmed;
        slot.entry.updated_at = now;
        // Confirmed entries never roll back
        slot.rollback = None;
        if let Some(handle) = result {
            slot.entry.result = Some(handle.clone());
            state.remember_settled(&handle, id);
        }
        true
    }

    fn schedule_removal(&self, id: EntryId, delay: Duration) {
        let state: Weak<Mutex<LedgerState>> = Arc::downgrade(&self.state);
        self.scheduler.after(
            delay,
            Box::new(move || {
                if let Some(state) = state.upgrade() {
                    state.lock().slots.remove(&id);
                }
            }),
        );
    }

    fn update_gauge(&self, state: &LedgerState) {
        if let Some(m) = &self.metrics {
            m.optimistic_active_entries.set(state.pending_count() as i64);
        }
    }
}

impl std::fmt::Debug for OptimisticLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimisticLedger")
            .field("entries", &self.state.lock().slots.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::read_cache::CacheKey;
    use crate::scheduler::ManualScheduler;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn setup() -> (OptimisticLedger, Arc<ReadCache>, Arc<ManualScheduler>) {
        let scheduler = Arc::new(ManualScheduler::default());
        let cache = Arc::new(ReadCache::new(scheduler.clone()));
        let ledger = OptimisticLedger::new(cache.clone(), scheduler.clone(), LedgerConfig::default())
            .with_metrics(Arc::new(EngineMetrics::new_for_testing()));
        (ledger, cache, scheduler)
    }

    fn counting_hook(counter: &Arc<AtomicUsize>) -> Box<dyn RollbackHook> {
        let counter = counter.clone();
        Box::new(move |_: &SpeculativeEntry| -> anyhow::Result<()> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn test_record_applies_deltas_synchronously() {
        let (ledger, cache, _) = setup();
        let wallet = CacheKey::wallet_balance("alice", "USDC");
        let collateral = CacheKey::collateral("alice", "USDC");
        cache.set_amount(wallet.clone(), 1_000);
        cache.set_amount(collateral.clone(), 0);

        let payload = SpeculativePayload::for_action(ActionKind::Deposit, "alice", "USDC", 400);
        let id = ledger.record(ActionKind::Deposit, payload, None);

        assert_eq!(cache.get_amount(&wallet), Some(600));
        assert_eq!(cache.get_amount(&collateral), Some(400));
        let entry = ledger.get(id).unwrap();
        assert_eq!(entry.status, EntryStatus::Pending);
        assert_eq!(ledger.list_active().len(), 1);
    }

    #[test]
    fn test_fail_fires_rollback_exactly_once() {
        let (ledger, _, _) = setup();
        let fired = Arc::new(AtomicUsize::new(0));
        let payload = SpeculativePayload::for_action(ActionKind::Borrow, "alice", "DAI", 100);
        let id = ledger.record(ActionKind::Borrow, payload, Some(counting_hook(&fired)));

        assert!(ledger.fail(id, "reverted"));
        assert!(!ledger.fail(id, "reverted again"));
        assert!(!ledger.confirm(id, None));
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        let entry = ledger.get(id).unwrap();
        assert_eq!(entry.status, EntryStatus::Failed);
        assert_eq!(entry.error.as_deref(), Some("reverted"));
    }

    #[test]
    fn test_confirm_never_rolls_back() {
        let (ledger, _, _) = setup();
        let fired = Arc::new(AtomicUsize::new(0));
        let payload = SpeculativePayload::for_action(ActionKind::Stake, "bob", "GOV", 5);
        let id = ledger.record(ActionKind::Stake, payload, Some(counting_hook(&fired)));

        assert!(ledger.confirm(id, Some(ResultHandle("0xabc".into()))));
        assert!(!ledger.fail(id, "late failure"));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(ledger.get(id).unwrap().result, Some(ResultHandle("0xabc".into())));
    }

    #[test]
    fn test_unknown_entry_is_noop() {
        let (ledger, _, _) = setup();
        assert!(!ledger.confirm(EntryId(99), None));
        assert!(!ledger.fail(EntryId(99), "x"));
    }

    #[test]
    fn test_default_rollback_invalidates_touched_keys() {
        let (ledger, cache, _) = setup();
        let debt = CacheKey::debt("alice", "DAI");
        let unrelated = CacheKey::debt("bob", "DAI");
        cache.set_amount(debt.clone(), 10);
        cache.set_amount(unrelated.clone(), 10);
        cache.set_amount(CacheKey::position("alice"), 1);

        let payload = SpeculativePayload::for_action(ActionKind::Borrow, "alice", "DAI", 5);
        let id = ledger.record(ActionKind::Borrow, payload, None);
        assert_eq!(cache.get_amount(&debt), Some(15));

        ledger.fail(id, "rejected");
        assert!(cache.get(&debt).is_none());
        assert!(cache.get(&CacheKey::position("alice")).is_none());
        assert_eq!(cache.get_amount(&unrelated), Some(10));
    }

    #[test]
    fn test_rollback_error_still_reaches_failed() {
        let (ledger, _, _) = setup();
        let payload = SpeculativePayload::for_action(ActionKind::Repay, "alice", "DAI", 1);
        let hook: Box<dyn RollbackHook> =
            Box::new(|_: &SpeculativeEntry| -> anyhow::Result<()> { anyhow::bail!("cache offline") });
        let id = ledger.record(ActionKind::Repay, payload, Some(hook));

        assert!(ledger.fail(id, "rejected"));
        assert_eq!(ledger.get(id).unwrap().status, EntryStatus::Failed);
    }

    #[test]
    fn test_terminal_entries_are_collected_after_retention() {
        let (ledger, _, scheduler) = setup();
        let a = ledger.record(
            ActionKind::Deposit,
            SpeculativePayload::for_action(ActionKind::Deposit, "alice", "USDC", 1),
            None,
        );
        let b = ledger.record(
            ActionKind::Withdraw,
            SpeculativePayload::for_action(ActionKind::Withdraw, "alice", "USDC", 1),
            None,
        );
        ledger.confirm(a, None);
        ledger.fail(b, "boom");

        scheduler.advance(Duration::from_secs(5));
        assert!(ledger.get(a).is_none());
        assert!(ledger.get(b).is_some());

        scheduler.advance(Duration::from_secs(5));
        assert!(ledger.get(b).is_none());
        assert!(ledger.list_active().is_empty());
    }

    #[test]
    fn test_reconcile_confirms_matching_pending_entry() {
        let (ledger, _, _) = setup();
        let fired = Arc::new(AtomicUsize::new(0));
        let first = ledger.record(
            ActionKind::Borrow,
            SpeculativePayload::for_action(ActionKind::Borrow, "alice", "DAI", 100),
            Some(counting_hook(&fired)),
        );
        let second = ledger.record(
            ActionKind::Borrow,
            SpeculativePayload::for_action(ActionKind::Borrow, "alice", "DAI", 100),
            None,
        );

        let id = ledger.reconcile(
            ActionKind::Borrow,
            "alice",
            Some("DAI"),
            100,
            Some(ResultHandle("0xfeed".into())),
        );
        assert_eq!(id, first);
        assert_eq!(ledger.get(first).unwrap().status, EntryStatus::Confirmed);
        assert_eq!(ledger.get(second).unwrap().status, EntryStatus::Pending);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_reconcile_of_queue_confirmed_tx_leaves_twin_pending() {
        let (ledger, _, _) = setup();
        let fired = Arc::new(AtomicUsize::new(0));
        let payload = || SpeculativePayload::for_action(ActionKind::Borrow, "alice", "DAI", 100);
        let first = ledger.record(ActionKind::Borrow, payload(), None);
        let second = ledger.record(ActionKind::Borrow, payload(), Some(counting_hook(&fired)));

        let tx1 = ResultHandle("0xtx1".into());
        assert!(ledger.confirm(first, Some(tx1.clone())));
        let id = ledger.reconcile(ActionKind::Borrow, "alice", Some("DAI"), 100, Some(tx1));
        assert_eq!(id, first);
        assert_eq!(ledger.get(second).unwrap().status, EntryStatus::Pending);
        assert_eq!(ledger.list_active().len(), 2);

        // The second operation can still fail and undo its effects
        assert!(ledger.fail(second, "out of attempts"));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(ledger.get(second).unwrap().status, EntryStatus::Failed);
    }

    #[test]
    fn test_reconcile_redelivery_is_noop() {
        let (ledger, _, scheduler) = setup();
        let pending = ledger.record(
            ActionKind::Deposit,
            SpeculativePayload::for_action(ActionKind::Deposit, "alice", "USDC", 40),
            None,
        );
        let twin = ledger.record(
            ActionKind::Deposit,
            SpeculativePayload::for_action(ActionKind::Deposit, "alice", "USDC", 40),
            None,
        );
        let tx = || Some(ResultHandle("0xdep".into()));

        let id = ledger.reconcile(ActionKind::Deposit, "alice", Some("USDC"), 40, tx());
        assert_eq!(id, pending);
        let again = ledger.reconcile(ActionKind::Deposit, "alice", Some("USDC"), 40, tx());
        assert_eq!(again, pending);
        assert_eq!(ledger.get(twin).unwrap().status, EntryStatus::Pending);

        // Unmatched observed effects are recorded once per handle
        let repay = || {
            let handle = Some(ResultHandle("0xrep".into()));
            ledger.reconcile(ActionKind::Repay, "bob", Some("DAI"), 3, handle)
        };
        let observed = repay();
        let before = ledger.list_active();
        assert_eq!(repay(), observed);
        assert_eq!(ledger.list_active(), before);

        // Still recognised after the entries are collected
        scheduler.advance(Duration::from_secs(5));
        assert!(ledger.get(observed).is_none());
        assert_eq!(repay(), observed);
        assert_eq!(ledger.list_active().len(), 1);
        assert_eq!(ledger.get(twin).unwrap().status, EntryStatus::Pending);
    }

    #[test]
    fn test_reconcile_without_match_records_observed_entry() {
        let (ledger, cache, _) = setup();
        let wallet = CacheKey::wallet_balance("carol", "WETH");
        cache.set_amount(wallet.clone(), 50);

        let id = ledger.reconcile(ActionKind::Withdraw, "carol", Some("WETH"), 7, None);
        let entry = ledger.get(id).unwrap();
        assert!(entry.observed);
        assert_eq!(entry.status, EntryStatus::Confirmed);
        assert_eq!(cache.get_amount(&wallet), Some(50));
    }
}
