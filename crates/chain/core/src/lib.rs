//! Staking contract abstraction for the state-sync engine.
//!
//! The engine depends only on the capabilities defined here, so any backend
//! (an EVM RPC client, a test double) can be plugged in.
//!
//! # Architecture
//!
//! ```text
//! StakingChain (composite trait)
//!   ├── ContractReader        batched field reads
//!   ├── TransactionSubmitter  calls and receipts
//!   └── NotificationSource    contract event streams
//! ```
//!
//! All contract values are `uint256`, represented as [`U256`]. Sequences are
//! positions in the contract event log and order every observation the engine
//! receives.
//!
//! # Usage
//!
//! ```ignore
//! use chain_core::{ContractReader, Field};
//!
//! async fn total(reader: &dyn ContractReader) -> U256 {
//!     let values = reader.read(None, &[Field::TotalStaked]).await?;
//!     values.get(Field::TotalStaked)
//! }
//! ```

pub mod traits;
pub mod types;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use primitive_types::U256;

// Re-export all traits
pub use traits::{
    ContractReader, NotificationSource, ReadError, StakingChain, SubmitError, SubscribeError,
    TransactionSubmitter,
};

// Re-export all types
pub use types::{
    AccountId, ActionKind, ContractCall, EventType, Field, FieldValues, Notification, Receipt,
    ReceiptStatus, Scope, ScopeKind, StartFrom, Subscription, SubscriptionId, TransactionId,
    payload,
};

#[cfg(any(test, feature = "mock"))]
pub use mock::{MockStakingChain, tokens};
