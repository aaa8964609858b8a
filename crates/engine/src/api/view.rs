//! Read-side types handed to observers and callers.
//!
//! Everything here is an immutable snapshot; observers never get a handle into
//! the store itself.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use chain_core::{AccountId, ActionKind, Field, ScopeKind, TransactionId, U256};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::store::{ActionId, FieldOp, TrackedField};

/// Caller-chosen identity of an observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObserverId(pub u64);

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "observer#{}", self.0)
    }
}

/// Everything the gate last accepted, published after every change.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    pub account: Option<AccountId>,
    pub fields: BTreeMap<Field, TrackedField>,
    pub stale: BTreeSet<ScopeKind>,
    /// Bumped on every publication.
    pub version: u64,
}

impl StoreSnapshot {
    pub fn value(&self, field: Field) -> U256 {
        self.fields
            .get(&field)
            .map(|tracked| tracked.value)
            .unwrap_or_default()
    }

    pub fn is_stale(&self, scope: ScopeKind) -> bool {
        self.stale.contains(&scope)
    }

    pub fn view(&self, fields: &[Field]) -> TrackedView {
        let values = fields
            .iter()
            .map(|&field| {
                let tracked = self
                    .fields
                    .get(&field)
                    .cloned()
                    .unwrap_or_else(|| TrackedField::unset(field));
                (field, tracked)
            })
            .collect();
        let is_stale = fields
            .iter()
            .any(|field| self.is_stale(field.scope_kind()));

        TrackedView { values, is_stale }
    }
}

/// Merged values for a set of fields plus a staleness flag.
///
/// Every requested field is present; unset fields read as zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedView {
    pub values: BTreeMap<Field, TrackedField>,
    pub is_stale: bool,
}

impl TrackedView {
    pub fn value(&self, field: Field) -> U256 {
        self.values
            .get(&field)
            .map(|tracked| tracked.value)
            .unwrap_or_default()
    }

    pub fn get(&self, field: Field) -> Option<&TrackedField> {
        self.values.get(&field)
    }
}

/// Delivered to an observer when any of its fields changes.
#[derive(Debug, Clone)]
pub struct ChangeNotice {
    /// Observed fields whose value, provenance, or freshness changed.
    pub changed: Vec<Field>,
    pub view: TrackedView,
}

/// Observer callback; invoked on the gate task, so it must not block.
pub type ChangeCallback = Arc<dyn Fn(&ChangeNotice) + Send + Sync>;

/// Lifecycle of a user action.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[strum(serialize_all = "lowercase")]
pub enum ActionState {
    Submitted,
    Confirmed,
    Reconciled,
    Failed,
}

impl ActionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ActionState::Reconciled | ActionState::Failed)
    }
}

/// How far the action had progressed when [`ActionOutcome`] was returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeStatus {
    /// Receipt succeeded; the optimistic delta is visible.
    Confirmed,
    /// Receipt not observed in time; the action stays submitted and is
    /// re-checked in the background. Always about the action's own
    /// transaction, never a nested approval.
    Pending,
}

/// Follows an action after `perform_action` returns.
#[derive(Debug, Clone)]
pub struct ActionTracker {
    id: ActionId,
    state: watch::Receiver<ActionState>,
}

impl ActionTracker {
    pub(crate) fn new(id: ActionId, state: watch::Receiver<ActionState>) -> Self {
        Self { id, state }
    }

    pub fn id(&self) -> ActionId {
        self.id
    }

    pub fn state(&self) -> ActionState {
        *self.state.borrow()
    }

    /// Waits until the action reaches `reconciled` or `failed`.
    pub async fn settled(&self) -> ActionState {
        let mut state = self.state.clone();
        if let Ok(terminal) = state.wait_for(ActionState::is_terminal).await {
            return *terminal;
        }
        *state.borrow()
    }
}

/// Result of `perform_action`, for optional user notice.
#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub id: ActionId,
    pub kind: ActionKind,
    /// The action's own transaction; a nested approval is never reported here.
    pub transaction: TransactionId,
    /// Optimistic delta applied to the store; empty while pending.
    pub delta: Vec<(Field, FieldOp)>,
    pub status: OutcomeStatus,
    pub tracker: ActionTracker,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Provenance;

    #[test]
    fn views_default_unset_fields_to_zero() {
        let mut snapshot = StoreSnapshot::default();
        snapshot.fields.insert(
            Field::TotalStaked,
            TrackedField {
                field: Field::TotalStaked,
                scope: ScopeKind::Global,
                value: U256::from(7u64),
                provenance: Provenance::Event,
                sequence: 3,
            },
        );
        snapshot.stale.insert(ScopeKind::Account);

        let global = snapshot.view(&[Field::TotalStaked, Field::Paused]);
        assert_eq!(global.value(Field::TotalStaked), U256::from(7u64));
        assert_eq!(global.value(Field::Paused), U256::zero());
        assert_eq!(global.values.len(), 2);
        assert!(!global.is_stale);

        let mixed = snapshot.view(&[Field::TotalStaked, Field::StakedAmount]);
        assert!(mixed.is_stale);
    }

    #[tokio::test]
    async fn tracker_settles_on_terminal_state() {
        let (tx, rx) = watch::channel(ActionState::Submitted);
        let tracker = ActionTracker::new(ActionId(1), rx);

        let waiter = tokio::spawn({
            let tracker = tracker.clone();
            async move { tracker.settled().await }
        });
        tx.send_replace(ActionState::Confirmed);
        tx.send_replace(ActionState::Reconciled);

        assert_eq!(waiter.await.unwrap(), ActionState::Reconciled);
        assert_eq!(tracker.state(), ActionState::Reconciled);
    }
}
