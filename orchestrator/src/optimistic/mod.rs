// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Speculative state mutations and their reconciliation.
//!
//! Lifecycle of an entry:
//!
//! ```text
//! record ──▶ Pending ──confirm──▶ Confirmed ──(retention)──▶ removed
//!                    └──fail────▶ Failed ─────(retention)──▶ removed
//!                                  │
//!                                  └─ rollback hook, exactly once
//! ```

mod ledger;
mod types;

pub use ledger::OptimisticLedger;
pub use types::{
    EntryId, EntryStatus, InvalidateKeys, RollbackHook, SpeculativeEntry, SpeculativePayload,
};
