//! Event types for different topics.

use chain_core::{ActionKind, Field, Notification, ScopeKind, TransactionId};
use serde::{Deserialize, Serialize};

use crate::store::{ActionId, FieldOp};

/// What finally removed an action's optimistic overlays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconciledBy {
    Notification,
    ForcedPoll,
    Poll,
    /// Nothing left to reconcile (e.g. the account was switched away).
    Released,
}

/// Action lifecycle notices for user-facing toasts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ActionEvent {
    Submitted {
        id: ActionId,
        kind: ActionKind,
        transaction: TransactionId,
    },

    /// Receipt not observed in time; the outcome is unknown and re-checked.
    Pending {
        id: ActionId,
        kind: ActionKind,
        transaction: TransactionId,
    },

    /// Receipt succeeded and the optimistic delta was applied.
    Confirmed {
        id: ActionId,
        kind: ActionKind,
        delta: Vec<(Field, FieldOp)>,
    },

    Reconciled {
        id: ActionId,
        kind: ActionKind,
        by: ReconciledBy,
    },

    Failed {
        id: ActionId,
        kind: ActionKind,
        reason: String,
    },
}

/// Data freshness transitions per scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FreshnessEvent {
    Stale {
        scope: ScopeKind,
        consecutive_failures: u32,
    },
    Fresh {
        scope: ScopeKind,
    },
}

/// A contract event the engine applied, for activity feeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub notification: Notification,
    /// Emitted by (or for) the active account.
    pub is_current_account: bool,
}
