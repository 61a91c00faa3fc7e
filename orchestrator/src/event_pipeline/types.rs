// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::handlers::EventHandler;
use crate::ledger_client::RawLog;
use crate::read_cache::EntityKind;
use crate::types::{ActionKind, TimestampMs};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Kinds of protocol events the pipeline can follow
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
    strum::EnumString,
    strum::EnumIter,
    strum::IntoStaticStr,
)]
pub enum EventKind {
    Deposit,
    Withdraw,
    Borrow,
    Repay,
    Liquidation,
    PriceUpdate,
    Approval,
    Stake,
    Unstake,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    /// The local action whose optimistic entry this event settles
    pub fn action_kind(&self) -> Option<ActionKind> {
        match self {
            EventKind::Deposit => Some(ActionKind::Deposit),
            EventKind::Withdraw => Some(ActionKind::Withdraw),
            EventKind::Borrow => Some(ActionKind::Borrow),
            EventKind::Repay => Some(ActionKind::Repay),
            EventKind::Stake => Some(ActionKind::Stake),
            EventKind::Unstake => Some(ActionKind::Unstake),
            EventKind::Liquidation | EventKind::PriceUpdate | EventKind::Approval => None,
        }
    }

    /// Entity kinds whose cached values this event can change
    pub fn affected_entities(&self) -> &'static [EntityKind] {
        use EntityKind::*;
        match self {
            EventKind::Deposit | EventKind::Withdraw => {
                &[WalletBalance, Collateral, Position, Market]
            }
            EventKind::Borrow | EventKind::Repay => &[WalletBalance, Debt, Position, Market],
            EventKind::Stake | EventKind::Unstake => &[WalletBalance, Staked, Position, Market],
            EventKind::Liquidation => &[Collateral, Debt, Position, Market],
            EventKind::PriceUpdate => &[Position, Market],
            EventKind::Approval => &[Allowance],
        }
    }
}

/// Normalized event, immutable once built
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEvent {
    pub kind: EventKind,
    pub source_address: String,
    pub block_height: u64,
    pub tx_handle: String,
    pub sequence_index: u32,
    pub fields: serde_json::Map<String, serde_json::Value>,
    pub observed_at: TimestampMs,
}

impl LedgerEvent {
    pub fn from_raw(raw: RawLog, kind: EventKind, observed_at: TimestampMs) -> Self {
        Self {
            kind,
            source_address: raw.address,
            block_height: raw.block_height,
            tx_handle: raw.tx_handle,
            sequence_index: raw.log_index,
            fields: raw.fields,
            observed_at,
        }
    }

    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name)?.as_str()
    }

    /// Amounts arrive as decimal strings or, when small, plain numbers
    pub fn field_amount(&self, name: &str) -> Option<u128> {
        match self.fields.get(name)? {
            serde_json::Value::String(s) => s.parse().ok(),
            serde_json::Value::Number(n) => n.as_u64().map(u128::from),
            _ => None,
        }
    }

    /// Position in ledger order
    pub fn ordering_key(&self) -> (u64, u32) {
        (self.block_height, self.sequence_index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceId(pub u64);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "source-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SourceState {
    /// Registered, not yet polled
    Registered,
    /// Current cycle read the remote height
    Polling,
    /// Caught up with the remote height
    Idle,
    /// Behind the remote height, windows being fetched
    Fetching,
    Deactivated,
}

pub struct EventSource {
    pub id: SourceId,
    pub source_address: String,
    pub event_kind: EventKind,
    pub handler: Arc<dyn EventHandler>,
    pub is_active: bool,
    pub last_processed_height: u64,
    pub state: SourceState,
}

impl EventSource {
    pub fn snapshot(&self) -> SourceSnapshot {
        SourceSnapshot {
            id: self.id,
            source_address: self.source_address.clone(),
            event_kind: self.event_kind,
            is_active: self.is_active,
            last_processed_height: self.last_processed_height,
            state: self.state,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSnapshot {
    pub id: SourceId,
    pub source_address: String,
    pub event_kind: EventKind,
    pub is_active: bool,
    pub last_processed_height: u64,
    pub state: SourceState,
}

/// Outcome of one poll cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    /// Remote height read this cycle; `None` if the read failed
    pub remote_height: Option<u64>,
    /// Sources whose cursor moved, with the new cursor
    pub advanced: Vec<(SourceId, u64)>,
    /// Sources whose window will be retried
    pub failed: Vec<SourceId>,
    pub events_handled: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_event_kind_names() {
        assert_eq!(EventKind::PriceUpdate.to_string(), "PriceUpdate");
        assert_eq!(EventKind::from_str("Liquidation").unwrap(), EventKind::Liquidation);
        assert_eq!(
            serde_json::to_value(EventKind::Approval).unwrap(),
            serde_json::json!("Approval")
        );
        assert_eq!(EventKind::Repay.action_kind(), Some(ActionKind::Repay));
        assert_eq!(EventKind::PriceUpdate.action_kind(), None);
    }

    #[test]
    fn test_field_accessors() {
        let raw: RawLog = serde_json::from_value(serde_json::json!({
            "address": "0xpool",
            "eventKind": "Deposit",
            "blockHeight": 10,
            "txHandle": "0x1",
            "logIndex": 2,
            "fields": {"owner": "alice", "amount": "340282366920938463463374607431768211455", "small": 5, "bad": true}
        }))
        .unwrap();
        let event = LedgerEvent::from_raw(raw, EventKind::Deposit, 99);
        assert_eq!(event.field_str("owner"), Some("alice"));
        assert_eq!(event.field_amount("amount"), Some(u128::MAX));
        assert_eq!(event.field_amount("small"), Some(5));
        assert_eq!(event.field_amount("bad"), None);
        assert_eq!(event.field_str("missing"), None);
        assert_eq!(event.ordering_key(), (10, 2));
        assert_eq!(event.observed_at, 99);
    }
}
