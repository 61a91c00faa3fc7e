// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::read_cache::{CacheDelta, CacheKey};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};
use std::fmt;

/// Milliseconds since the unix epoch, as reported by a [`crate::scheduler::Scheduler`].
pub type TimestampMs = u64;

/// User-intended state change against the lending protocol
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
    strum::IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ActionKind {
    Deposit,
    Withdraw,
    Borrow,
    Repay,
    Stake,
    Unstake,
    Approve,
}

impl ActionKind {
    /// Cache deltas this action is expected to produce for `owner`.
    ///
    /// Amounts above `i128::MAX` saturate; the deltas are speculative and
    /// are superseded by the next full read anyway.
    pub fn effects(&self, owner: &str, asset: &str, amount: u128) -> Vec<CacheDelta> {
        let amount = i128::try_from(amount).unwrap_or(i128::MAX);
        let wallet = CacheKey::wallet_balance(owner, asset);
        match self {
            ActionKind::Deposit => vec![
                CacheDelta::new(wallet, -amount),
                CacheDelta::new(CacheKey::collateral(owner, asset), amount),
            ],
            ActionKind::Withdraw => vec![
                CacheDelta::new(CacheKey::collateral(owner, asset), -amount),
                CacheDelta::new(wallet, amount),
            ],
            ActionKind::Borrow => vec![
                CacheDelta::new(CacheKey::debt(owner, asset), amount),
                CacheDelta::new(wallet, amount),
            ],
            ActionKind::Repay => vec![
                CacheDelta::new(CacheKey::debt(owner, asset), -amount),
                CacheDelta::new(wallet, -amount),
            ],
            ActionKind::Stake => vec![
                CacheDelta::new(wallet, -amount),
                CacheDelta::new(CacheKey::staked(owner, asset), amount),
            ],
            ActionKind::Unstake => vec![
                CacheDelta::new(CacheKey::staked(owner, asset), -amount),
                CacheDelta::new(wallet, amount),
            ],
            ActionKind::Approve => vec![],
        }
    }

    /// Stable lowercase name, used as a metrics label
    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    /// Whether the protocol pulls the owner's tokens, which needs a prior allowance.
    pub fn requires_allowance(&self) -> bool {
        matches!(
            self,
            ActionKind::Deposit | ActionKind::Repay | ActionKind::Stake
        )
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    pub fn weight(&self) -> u8 {
        match self {
            Priority::High => 3,
            Priority::Medium => 2,
            Priority::Low => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId(pub u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

/// Opaque receipt id returned by the remote ledger on submission
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultHandle(pub String);

impl fmt::Display for ResultHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fee market parameters, refreshed right before each submission
#[serde_as]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeParameters {
    #[serde_as(as = "DisplayFromStr")]
    pub max_fee_per_unit: u128,
    #[serde_as(as = "DisplayFromStr")]
    pub priority_fee_per_unit: u128,
}

/// What the submitted call does. Encoding is the remote client's job.
// 128-bit amounts travel as decimal strings
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CallPayload {
    Action {
        kind: ActionKind,
        asset: String,
        #[serde_as(as = "DisplayFromStr")]
        amount: u128,
    },
    Approve {
        asset: String,
        spender: String,
        #[serde_as(as = "DisplayFromStr")]
        amount: u128,
    },
    Raw {
        data: Vec<u8>,
    },
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxRequest {
    /// Account submitting and paying for the call
    pub owner: String,
    /// Contract the call is sent to
    pub destination: String,
    pub payload: CallPayload,
    /// Native value attached to the call
    #[serde_as(as = "DisplayFromStr")]
    pub value: u128,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fees: Option<FeeParameters>,
}

impl TxRequest {
    pub fn action(
        kind: ActionKind,
        owner: impl Into<String>,
        destination: impl Into<String>,
        asset: impl Into<String>,
        amount: u128,
    ) -> Self {
        Self {
            owner: owner.into(),
            destination: destination.into(),
            payload: CallPayload::Action {
                kind,
                asset: asset.into(),
                amount,
            },
            value: 0,
            cost_limit: None,
            fees: None,
        }
    }

    /// Authorization request sent to the asset contract itself
    pub fn approval(
        owner: impl Into<String>,
        asset: impl Into<String>,
        spender: impl Into<String>,
        amount: u128,
    ) -> Self {
        let asset = asset.into();
        Self {
            owner: owner.into(),
            destination: asset.clone(),
            payload: CallPayload::Approve {
                asset,
                spender: spender.into(),
                amount,
            },
            value: 0,
            cost_limit: None,
            fees: None,
        }
    }

    pub fn asset(&self) -> Option<&str> {
        match &self.payload {
            CallPayload::Action { asset, .. } | CallPayload::Approve { asset, .. } => Some(asset),
            CallPayload::Raw { .. } => None,
        }
    }

    pub fn amount(&self) -> u128 {
        match &self.payload {
            CallPayload::Action { amount, .. } | CallPayload::Approve { amount, .. } => *amount,
            CallPayload::Raw { .. } => self.value,
        }
    }

    /// Read-cache keys that hold stale values once this request lands.
    /// Empty for raw calls, whose effect is unknown.
    pub fn affected_keys(&self) -> Vec<CacheKey> {
        match &self.payload {
            CallPayload::Action {
                kind,
                asset,
                amount,
            } => {
                let mut keys: Vec<CacheKey> = kind
                    .effects(&self.owner, asset, *amount)
                    .into_iter()
                    .map(|d| d.key)
                    .collect();
                keys.push(CacheKey::position(&self.owner));
                keys.push(CacheKey::market(asset));
                keys
            }
            CallPayload::Approve { asset, spender, .. } => {
                vec![CacheKey::allowance(&self.owner, asset, spender)]
            }
            CallPayload::Raw { .. } => vec![],
        }
    }
}
