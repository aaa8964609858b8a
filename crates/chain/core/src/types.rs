//! Common types shared between the staking contract collaborators and the engine.

use std::collections::BTreeMap;
use std::fmt;

use primitive_types::U256;
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;

/// Account identity (contract address of the user's wallet).
///
/// Addresses are compared case-insensitively, so the identifier is stored
/// lowercased.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(address: impl AsRef<str>) -> Self {
        Self(address.as_ref().trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether a field belongs to one account or to the whole pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ScopeKind {
    Account,
    Global,
}

/// A concrete scope: the global pool, or one specific account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Scope {
    Global,
    Account(AccountId),
}

impl Scope {
    pub fn kind(&self) -> ScopeKind {
        match self {
            Scope::Global => ScopeKind::Global,
            Scope::Account(_) => ScopeKind::Account,
        }
    }

    pub fn account(&self) -> Option<&AccountId> {
        match self {
            Scope::Global => None,
            Scope::Account(account) => Some(account),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Global => f.write_str("global"),
            Scope::Account(account) => write!(f, "account:{}", account),
        }
    }
}

/// Named contract fields the UI can read.
///
/// Every value is a `uint256`; boolean flags are encoded as 0/1.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumIter,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "camelCase")]
pub enum Field {
    // Per-account
    WalletBalance,
    Allowance,
    StakedAmount,
    PendingRewards,
    LastStakeTimestamp,
    TimeUntilUnlock,
    CanWithdraw,

    // Pool-wide
    TotalStaked,
    CurrentRewardRate,
    InitialApr,
    MinLockDuration,
    AprReductionPerThousand,
    EmergencyWithdrawPenalty,
    TotalRewards,
    Paused,
}

impl Field {
    pub fn scope_kind(&self) -> ScopeKind {
        match self {
            Field::WalletBalance
            | Field::Allowance
            | Field::StakedAmount
            | Field::PendingRewards
            | Field::LastStakeTimestamp
            | Field::TimeUntilUnlock
            | Field::CanWithdraw => ScopeKind::Account,
            _ => ScopeKind::Global,
        }
    }

    /// All fields belonging to a scope, in declaration order.
    pub fn in_scope(kind: ScopeKind) -> Vec<Field> {
        Field::iter().filter(|f| f.scope_kind() == kind).collect()
    }

    pub fn name(&self) -> &'static str {
        self.into()
    }
}

/// State-changing calls the user can initiate.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, strum::Display,
)]
#[strum(serialize_all = "camelCase")]
pub enum ActionKind {
    Stake,
    Withdraw,
    Claim,
    EmergencyWithdraw,
    Approve,
}

impl ActionKind {
    /// Whether the call carries an explicit amount argument.
    pub fn takes_amount(&self) -> bool {
        matches!(
            self,
            ActionKind::Stake | ActionKind::Withdraw | ActionKind::Approve
        )
    }
}

/// A contract call ready for submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractCall {
    pub kind: ActionKind,
    pub amount: Option<U256>,
}

impl ContractCall {
    pub fn new(kind: ActionKind, amount: Option<U256>) -> Self {
        Self { kind, amount }
    }
}

/// Generic transaction identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub Vec<u8>);

impl TransactionId {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(&self.0))
    }
}

/// Final status reported by a transaction receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiptStatus {
    Success,
    Reverted { reason: String },
}

/// Transaction receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub transaction_id: TransactionId,
    pub status: ReceiptStatus,
    /// Event-log position at which the transaction was included.
    ///
    /// Events emitted by the transaction, and reads served after it, carry a
    /// sequence at or above this value.
    pub sequence: u64,
}

/// Result of one batched read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldValues {
    /// Event-log position the read was served at.
    pub sequence: u64,
    pub values: BTreeMap<Field, U256>,
}

impl FieldValues {
    pub fn get(&self, field: Field) -> U256 {
        self.values.get(&field).copied().unwrap_or_default()
    }
}

/// Contract event types the engine understands.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, strum::Display,
)]
pub enum EventType {
    Staked,
    Withdrawn,
    RewardsClaimed,
    EmergencyWithdrawn,
    RewardRateUpdated,
    Approval,
}

impl EventType {
    /// The user action an event confirms, if any.
    pub fn action_kind(&self) -> Option<ActionKind> {
        match self {
            EventType::Staked => Some(ActionKind::Stake),
            EventType::Withdrawn => Some(ActionKind::Withdraw),
            EventType::RewardsClaimed => Some(ActionKind::Claim),
            EventType::EmergencyWithdrawn => Some(ActionKind::EmergencyWithdraw),
            EventType::Approval => Some(ActionKind::Approve),
            EventType::RewardRateUpdated => None,
        }
    }

    /// Event types carrying values for the given scope.
    pub fn relevant_to(kind: ScopeKind) -> &'static [EventType] {
        match kind {
            ScopeKind::Account => &[
                EventType::Staked,
                EventType::Withdrawn,
                EventType::RewardsClaimed,
                EventType::EmergencyWithdrawn,
                EventType::Approval,
            ],
            ScopeKind::Global => &[
                EventType::Staked,
                EventType::Withdrawn,
                EventType::EmergencyWithdrawn,
                EventType::RewardRateUpdated,
            ],
        }
    }
}

/// Payload keys used by contract events.
pub mod payload {
    pub const AMOUNT: &str = "amount";
    pub const NEW_TOTAL_STAKED: &str = "newTotalStaked";
    pub const CURRENT_REWARD_RATE: &str = "currentRewardRate";
    pub const NEW_PENDING_REWARDS: &str = "newPendingRewards";
    pub const PENALTY: &str = "penalty";
    pub const OLD_RATE: &str = "oldRate";
    pub const NEW_RATE: &str = "newRate";
    pub const TOTAL_STAKED: &str = "totalStaked";
    pub const VALUE: &str = "value";
}

/// A change notification emitted by the contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub event_type: EventType,
    pub account: Option<AccountId>,
    pub payload: BTreeMap<String, U256>,
    /// Event-log position; non-decreasing per (event type, account).
    pub sequence: u64,
}

impl Notification {
    pub fn amount(&self, key: &str) -> Option<U256> {
        self.payload.get(key).copied()
    }
}

/// Where a notification subscription starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartFrom {
    Now,
    Sequence(u64),
}

/// Identifier of a live notification subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// A live notification stream.
///
/// The stream ends (`recv` yields `None`) when the source drops the
/// subscription.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub receiver: tokio::sync::mpsc::Receiver<Notification>,
}
