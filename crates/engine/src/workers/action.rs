//! User action lifecycle.
//!
//! Each action runs as its own task:
//!
//! ```text
//! [approve if allowance is short] -> submit -> receipt -> optimistic delta
//!     -> wait for notification -> forced polls -> reconciled | rolled back
//! ```
//!
//! The caller gets an [`ActionOutcome`] as soon as the receipt succeeds (or
//! times out), and follows the rest through the outcome's tracker and the
//! `Action` topic.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chain_core::{
    AccountId, ActionKind, ContractCall, ContractReader, Field, Receipt, ReceiptStatus, Scope,
    ScopeKind, SubmitError, TransactionId, TransactionSubmitter, U256,
};
use tokio::sync::{oneshot, watch};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{ActionOutcome, ActionState, ActionTracker, OutcomeStatus, Result, SyncError};
use crate::deltas;
use crate::engine::ActionConfig;
use crate::events::{ActionEvent, Event, EventBus, ReconciledBy};
use crate::store::{ActionId, FieldOp};
use crate::workers::SyncMetrics;
use crate::workers::gate::{GateHandle, OptimisticApplied, OptimisticRequest};

/// Runs user actions against the submitter and the gate.
#[derive(Clone)]
pub(crate) struct ActionCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    reader: Arc<dyn ContractReader>,
    submitter: Arc<dyn TransactionSubmitter>,
    gate: GateHandle,
    event_bus: EventBus,
    metrics: Arc<SyncMetrics>,
    config: ActionConfig,
    cancel: CancellationToken,
    next_id: AtomicU64,
}

struct PendingAction {
    id: ActionId,
    kind: ActionKind,
    amount: Option<U256>,
    account: AccountId,
    state: watch::Sender<ActionState>,
}

/// The `perform_action` caller, answered at most once.
///
/// A nested approval runs with a caller that has no reply channel, so only the
/// requested action's own receipt can answer.
struct Caller {
    reply: Option<oneshot::Sender<Result<ActionOutcome>>>,
    id: ActionId,
    kind: ActionKind,
    tracker: ActionTracker,
}

impl Caller {
    fn silent(action: &PendingAction) -> Self {
        Self {
            reply: None,
            id: action.id,
            kind: action.kind,
            tracker: ActionTracker::new(action.id, action.state.subscribe()),
        }
    }

    fn outcome(
        &mut self,
        transaction: TransactionId,
        delta: Vec<(Field, FieldOp)>,
        status: OutcomeStatus,
    ) {
        let outcome = ActionOutcome {
            id: self.id,
            kind: self.kind,
            transaction,
            delta,
            status,
            tracker: self.tracker.clone(),
        };
        self.answer(Ok(outcome));
    }

    fn failed(&mut self, error: SyncError) {
        self.answer(Err(error));
    }

    fn answer(&mut self, result: Result<ActionOutcome>) {
        if let Some(reply) = self.reply.take()
            && reply.send(result).is_err()
        {
            debug!("{} reply channel closed (caller dropped)", self.id);
        }
    }
}

impl ActionCoordinator {
    pub(crate) fn new(
        reader: Arc<dyn ContractReader>,
        submitter: Arc<dyn TransactionSubmitter>,
        gate: GateHandle,
        event_bus: EventBus,
        metrics: Arc<SyncMetrics>,
        config: ActionConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                reader,
                submitter,
                gate,
                event_bus,
                metrics,
                config,
                cancel,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Starts an action and waits for its first answer.
    pub async fn perform(
        &self,
        account: AccountId,
        kind: ActionKind,
        amount: Option<U256>,
    ) -> Result<ActionOutcome> {
        let action = self.inner.start(kind, amount, account);
        let (reply_tx, reply_rx) = oneshot::channel();
        let caller = Caller {
            reply: Some(reply_tx),
            id: action.id,
            kind,
            tracker: ActionTracker::new(action.id, action.state.subscribe()),
        };

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let cancel = inner.cancel.clone();
            let id = action.id;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => debug!("{} abandoned: engine shutting down", id),
                _ = inner.drive(action, caller) => {}
            }
        });

        reply_rx.await.map_err(SyncError::ReplyChannelClosed)?
    }
}

impl Inner {
    fn start(&self, kind: ActionKind, amount: Option<U256>, account: AccountId) -> PendingAction {
        let id = ActionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (state, _) = watch::channel(ActionState::Submitted);
        PendingAction {
            id,
            kind,
            amount,
            account,
            state,
        }
    }

    async fn drive(self: &Arc<Self>, action: PendingAction, mut caller: Caller) {
        if action.kind == ActionKind::Stake
            && let Err(error) = self.prepare(&action).await
        {
            self.fail(&action, error.to_string());
            caller.failed(error);
            return;
        }

        let receipt = match self.submit_and_confirm(&action, &mut caller).await {
            Ok(receipt) => receipt,
            Err(error) => {
                self.fail(&action, error.to_string());
                caller.failed(error);
                return;
            }
        };

        let applied = match self.apply_optimistic(&action, &receipt).await {
            Ok(applied) => applied,
            Err(error) => {
                self.fail(&action, error.to_string());
                caller.failed(error);
                return;
            }
        };

        caller.outcome(
            receipt.transaction_id,
            applied.delta.clone(),
            OutcomeStatus::Confirmed,
        );
        self.reconcile(&action, applied.reconciled).await;
    }

    /// Approves the staking contract first when the allowance is short.
    ///
    /// The approval reconciles on its own; only its receipt gates the stake.
    /// A slow approval receipt is re-checked without answering the caller.
    async fn prepare(self: &Arc<Self>, action: &PendingAction) -> Result<()> {
        let amount = action.amount.unwrap_or_default();
        let allowance = match self
            .reader
            .read(Some(&action.account), &[Field::Allowance])
            .await
        {
            Ok(values) => values.get(Field::Allowance),
            Err(error) => {
                warn!("allowance check for {} failed: {}; approving", action.id, error);
                U256::zero()
            }
        };
        if allowance >= amount {
            return Ok(());
        }

        let approve = self.start(ActionKind::Approve, Some(amount), action.account.clone());
        info!(
            "{} needs approval ({} < {}); submitting {}",
            action.id, allowance, amount, approve.id
        );

        let mut approver = Caller::silent(&approve);
        let applied = match self.submit_and_confirm(&approve, &mut approver).await {
            Ok(receipt) => self.apply_optimistic(&approve, &receipt).await,
            Err(error) => Err(error),
        };
        let applied = match applied {
            Ok(applied) => applied,
            Err(error) => {
                self.fail(&approve, error.to_string());
                return Err(error);
            }
        };

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let cancel = inner.cancel.clone();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                _ = inner.reconcile(&approve, applied.reconciled) => {}
            }
        });
        Ok(())
    }

    /// Submits the call and waits for a successful receipt.
    ///
    /// A receipt timeout answers the caller with a pending outcome and keeps
    /// re-checking.
    async fn submit_and_confirm(
        &self,
        action: &PendingAction,
        caller: &mut Caller,
    ) -> Result<Receipt> {
        let call = ContractCall::new(action.kind, action.amount);
        let transaction = self
            .submitter
            .submit(&action.account, &call)
            .await
            .map_err(|error| match error {
                SubmitError::Rejected(reason) => SyncError::SubmissionRejected(reason),
                other => SyncError::Transport(other.to_string()),
            })?;

        info!("{} {} submitted as {}", action.id, action.kind, transaction);
        self.metrics.record_submitted();
        self.event_bus.publish(Event::Action(ActionEvent::Submitted {
            id: action.id,
            kind: action.kind,
            transaction: transaction.clone(),
        }));

        let mut rechecks = 0u32;
        loop {
            let error = match self.submitter.await_receipt(&transaction).await {
                Ok(receipt) => {
                    return match receipt.status {
                        ReceiptStatus::Success => Ok(receipt),
                        ReceiptStatus::Reverted { reason } => Err(SyncError::Reverted {
                            kind: action.kind,
                            reason,
                        }),
                    };
                }
                Err(SubmitError::Rejected(reason)) => {
                    return Err(SyncError::SubmissionRejected(reason));
                }
                Err(error) => error,
            };

            if rechecks == 0 {
                warn!("{} receipt for {} not observed ({}); re-checking", action.id, transaction, error);
                caller.outcome(transaction.clone(), Vec::new(), OutcomeStatus::Pending);
                self.event_bus.publish(Event::Action(ActionEvent::Pending {
                    id: action.id,
                    kind: action.kind,
                    transaction: transaction.clone(),
                }));
            }

            rechecks += 1;
            if let Some(limit) = self.config.receipt_recheck_limit
                && rechecks > limit
            {
                return Err(SyncError::ReceiptTimeout(transaction));
            }
            time::sleep(self.config.receipt_recheck_interval).await;
        }
    }

    async fn apply_optimistic(
        &self,
        action: &PendingAction,
        receipt: &Receipt,
    ) -> Result<OptimisticApplied> {
        let snapshot = self.gate.snapshot();
        let writes =
            deltas::optimistic_writes(action.kind, action.amount, &action.account, &snapshot);

        let applied = self
            .gate
            .optimistic(OptimisticRequest {
                action: action.id,
                kind: action.kind,
                account: action.account.clone(),
                included_at: receipt.sequence,
                writes,
            })
            .await?;

        info!("{} confirmed at #{}", action.id, receipt.sequence);
        action.state.send_replace(ActionState::Confirmed);
        self.metrics.record_confirmed();
        self.event_bus.publish(Event::Action(ActionEvent::Confirmed {
            id: action.id,
            kind: action.kind,
            delta: applied.delta.clone(),
        }));
        Ok(applied)
    }

    /// Waits for the overlays to be lifted; rolls them back past the cap.
    async fn reconcile(&self, action: &PendingAction, mut reconciled: oneshot::Receiver<ReconciledBy>) {
        match self.await_reconciliation(action, &mut reconciled).await {
            Ok(by) => {
                info!("{} reconciled ({:?})", action.id, by);
                action.state.send_replace(ActionState::Reconciled);
                self.metrics.record_reconciled();
                self.event_bus.publish(Event::Action(ActionEvent::Reconciled {
                    id: action.id,
                    kind: action.kind,
                    by,
                }));
            }
            Err(reason) => {
                if let Err(error) = self.gate.resolve(action.id).await {
                    debug!("rollback of {} skipped: {}", action.id, error);
                }
                for scope in [ScopeKind::Account, ScopeKind::Global] {
                    if let Err(error) = self.gate.mark_stale(scope).await {
                        debug!("marking {:?} stale skipped: {}", scope, error);
                    }
                }
                self.fail(action, reason);
            }
        }
    }

    async fn await_reconciliation(
        &self,
        action: &PendingAction,
        reconciled: &mut oneshot::Receiver<ReconciledBy>,
    ) -> std::result::Result<ReconciledBy, String> {
        let cap = self.config.reconcile_cap;
        let deadline = Instant::now() + cap;
        let abandoned = || "engine stopped before reconciliation".to_string();

        match time::timeout(self.config.reconcile_timeout.min(cap), &mut *reconciled).await {
            Ok(Ok(by)) => return Ok(by),
            Ok(Err(_)) => return Err(abandoned()),
            Err(_) => debug!("{} not confirmed by notification; forcing polls", action.id),
        }

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(format!("not reconciled within {}s", cap.as_secs()));
            }

            self.metrics.record_forced_poll();
            self.force_poll(action).await.map_err(|_| abandoned())?;

            let wait = self.config.forced_poll_retry.min(remaining);
            match time::timeout(wait, &mut *reconciled).await {
                Ok(Ok(by)) => return Ok(by),
                Ok(Err(_)) => return Err(abandoned()),
                Err(_) => {}
            }
        }
    }

    /// Reads both scopes and hands them to the gate as forced by `action`.
    async fn force_poll(&self, action: &PendingAction) -> Result<()> {
        for scope in [Scope::Account(action.account.clone()), Scope::Global] {
            let fields = Field::in_scope(scope.kind());
            match self.reader.read(scope.account(), &fields).await {
                Ok(values) => self.gate.poll(scope, values, Some(action.id)).await?,
                Err(error) => warn!("forced poll of {} for {} failed: {}", scope, action.id, error),
            }
        }
        Ok(())
    }

    fn fail(&self, action: &PendingAction, reason: String) {
        warn!("{} {} failed: {}", action.id, action.kind, reason);
        action.state.send_replace(ActionState::Failed);
        self.metrics.record_failed();
        self.event_bus.publish(Event::Action(ActionEvent::Failed {
            id: action.id,
            kind: action.kind,
            reason,
        }));
    }
}
