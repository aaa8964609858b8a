//! Cloneable façade for the presentation layer.
//!
//! [`SyncHandle`] hides channel plumbing: reads are served from the last
//! published snapshot and never wait on in-flight work, while registrations,
//! account switches, and actions go through the gate worker.

use std::collections::HashMap;
use std::sync::Arc;

use chain_core::{AccountId, ActionKind, Field, U256};
use tokio::sync::{broadcast, watch};
use tracing::info;

use super::errors::{Result, SyncError};
use super::view::{ActionOutcome, ChangeCallback, ObserverId, StoreSnapshot, TrackedView};
use crate::events::{Event, EventBus, Topic};
use crate::workers::{ActionCoordinator, GateHandle, MetricsSnapshot, SyncMetrics};

/// Client-facing handle to interact with the engine
#[derive(Clone)]
pub struct SyncHandle {
    gate: GateHandle,
    coordinator: ActionCoordinator,
    event_bus: EventBus,
    metrics: Arc<SyncMetrics>,
}

impl SyncHandle {
    pub(crate) fn new(
        gate: GateHandle,
        coordinator: ActionCoordinator,
        event_bus: EventBus,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        Self {
            gate,
            coordinator,
            event_bus,
            metrics,
        }
    }

    /// Merged values and staleness for `fields`.
    ///
    /// Does not register an observer, so it starts no polling on its own.
    pub fn tracked_fields(&self, fields: &[Field]) -> TrackedView {
        self.gate.snapshot().view(fields)
    }

    /// The last published snapshot.
    pub fn snapshot(&self) -> Arc<StoreSnapshot> {
        self.gate.snapshot()
    }

    /// A receiver that wakes on every published snapshot.
    pub fn changes(&self) -> watch::Receiver<Arc<StoreSnapshot>> {
        self.gate.changes()
    }

    /// Register an observer for `fields`, returning their current view.
    ///
    /// The first observer of a scope starts its poll cycle and notification
    /// subscriptions. Re-registering an id replaces its fields and callback.
    pub async fn register(
        &self,
        id: ObserverId,
        fields: &[Field],
        callback: ChangeCallback,
    ) -> Result<TrackedView> {
        self.gate.register(id, fields.to_vec(), callback).await
    }

    /// Remove an observer; the last observer of a scope stops its workers.
    ///
    /// Returns whether the observer was registered.
    pub async fn unregister(&self, id: ObserverId) -> Result<bool> {
        self.gate.unregister(id).await
    }

    /// Submit a user action on behalf of the active account.
    ///
    /// Returns once the receipt succeeded (with the optimistic delta applied)
    /// or once the receipt timed out (`OutcomeStatus::Pending`). The action
    /// keeps running to a terminal state either way; follow it through
    /// [`ActionOutcome::tracker`].
    ///
    /// # Errors
    ///
    /// - `NoAccount` / `InvalidAmount` before anything is submitted
    /// - `SubmissionRejected`, `Reverted`, or `Transport` when the action (or
    ///   its nested approval) fails
    pub async fn perform_action(
        &self,
        kind: ActionKind,
        amount: Option<U256>,
    ) -> Result<ActionOutcome> {
        let account = self.account().ok_or(SyncError::NoAccount)?;
        validate_amount(kind, amount)?;
        self.coordinator.perform(account, kind, amount).await
    }

    /// Switch the active account.
    ///
    /// Per-account values of the previous account are dropped; global values
    /// are kept. In-flight actions of the previous account still finish.
    pub async fn switch_account(&self, account: Option<AccountId>) -> Result<()> {
        info!(
            "switching account to {}",
            account.as_ref().map(AccountId::as_str).unwrap_or("none")
        );
        self.gate.switch_account(account).await
    }

    pub fn account(&self) -> Option<AccountId> {
        self.gate.snapshot().account.clone()
    }

    /// Subscribe to events from a specific topic
    ///
    /// # Topics
    ///
    /// - `Topic::Action` - Action lifecycle notices
    /// - `Topic::Freshness` - Scopes turning stale or fresh again
    /// - `Topic::Notification` - Contract events applied to the store
    pub fn subscribe(&self, topic: Topic) -> broadcast::Receiver<Event> {
        self.event_bus.subscribe(topic)
    }

    pub fn subscribe_multiple(&self, topics: &[Topic]) -> HashMap<Topic, broadcast::Receiver<Event>> {
        self.event_bus.subscribe_multiple(topics)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

fn validate_amount(kind: ActionKind, amount: Option<U256>) -> Result<()> {
    match (kind.takes_amount(), amount) {
        (true, Some(amount)) if !amount.is_zero() => Ok(()),
        (true, _) => Err(SyncError::InvalidAmount {
            kind,
            reason: "amount must be greater than zero",
        }),
        (false, None) => Ok(()),
        (false, Some(_)) => Err(SyncError::InvalidAmount {
            kind,
            reason: "action takes no amount",
        }),
    }
}
