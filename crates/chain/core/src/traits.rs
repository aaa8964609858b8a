//! Staking contract collaborator traits.
//!
//! The engine never talks to a chain directly. It consumes three narrow
//! capabilities, which a backend may implement separately or bundle into one
//! [`StakingChain`]:
//! - [`ContractReader`]: batched field reads
//! - [`TransactionSubmitter`]: state-changing calls and receipts
//! - [`NotificationSource`]: at-least-once event streams

use async_trait::async_trait;

use crate::types::{
    AccountId, ContractCall, EventType, Field, FieldValues, Receipt, StartFrom, Subscription,
    SubscriptionId, TransactionId,
};

// ============================================================================
// Error Types
// ============================================================================

/// Batched read errors. A read fails as a whole; there is no partial success.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("transient read failure: {0}")]
    Transient(String),

    #[error("account-scoped fields requested without an account")]
    MissingAccount,
}

/// Transaction submission errors.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("submission rejected: {0}")]
    Rejected(String),

    #[error("receipt for {0} not observed in time")]
    ReceiptTimeout(TransactionId),

    #[error("transport error: {0}")]
    Transport(String),
}

/// Notification subscription errors.
#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    #[error("notification source unavailable: {0}")]
    Unavailable(String),
}

// ============================================================================
// Collaborator Traits
// ============================================================================

/// Batched, possibly failing reads of named contract fields.
#[async_trait]
pub trait ContractReader: Send + Sync {
    /// Read `fields` for `account`, or pool-wide fields when `account` is `None`.
    async fn read(
        &self,
        account: Option<&AccountId>,
        fields: &[Field],
    ) -> Result<FieldValues, ReadError>;
}

/// Submits state-changing calls and reports their receipts.
#[async_trait]
pub trait TransactionSubmitter: Send + Sync {
    /// Broadcast a call signed by `account`.
    async fn submit(
        &self,
        account: &AccountId,
        call: &ContractCall,
    ) -> Result<TransactionId, SubmitError>;

    /// Wait for the receipt of a previously submitted transaction.
    ///
    /// `SubmitError::ReceiptTimeout` means the outcome is unknown, not failed;
    /// callers may ask again.
    async fn await_receipt(&self, tx: &TransactionId) -> Result<Receipt, SubmitError>;
}

/// At-least-once, per-(event, account) ordered change notifications.
#[async_trait]
pub trait NotificationSource: Send + Sync {
    async fn subscribe(
        &self,
        event_type: EventType,
        from: StartFrom,
    ) -> Result<Subscription, SubscribeError>;

    async fn unsubscribe(&self, id: SubscriptionId);
}

/// Complete staking chain backend.
pub trait StakingChain: ContractReader + TransactionSubmitter + NotificationSource {
    /// Backend name (e.g., "Mock", "EVM").
    fn name(&self) -> &str;

    /// Network name (e.g., "mainnet", "sepolia", "local").
    fn network(&self) -> &str;
}
