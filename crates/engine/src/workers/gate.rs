//! Gate worker that owns the [`ValueStore`].
//!
//! Every mutation (poll results, notification deltas, optimistic overlays,
//! rollbacks, account switches, observer registration) arrives here as a
//! [`GateCommand`] and is applied one at a time. After each accepted change
//! the worker publishes a fresh [`StoreSnapshot`] on a watch channel, which is
//! what every read is served from, and fans the change out to observers.
//! Each contract event is announced on the `Notification` topic once, however
//! many scope workers delivered it.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chain_core::{
    AccountId, ActionKind, EventType, Field, FieldValues, Notification, Scope, ScopeKind,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{ChangeCallback, ObserverId, Result, StoreSnapshot, SyncError, TrackedView};
use crate::events::{Event, EventBus, FreshnessEvent, NotificationEvent, ReconciledBy};
use crate::registry::SubscriptionRegistry;
use crate::store::{ActionId, FieldKey, FieldOp, FieldWrite, Provenance, Rule, ValueStore, Write};
use crate::workers::{ScopeSupervisor, SyncMetrics};

/// Optimistic delta of a confirmed action.
#[derive(Debug)]
pub(crate) struct OptimisticRequest {
    pub action: ActionId,
    pub kind: ActionKind,
    pub account: AccountId,
    pub included_at: u64,
    pub writes: Vec<(FieldKey, FieldOp)>,
}

/// What the gate layered for an action.
#[derive(Debug)]
pub(crate) struct OptimisticApplied {
    pub delta: Vec<(Field, FieldOp)>,
    /// Fires once the action has no overlays left.
    pub reconciled: oneshot::Receiver<ReconciledBy>,
}

/// Commands that can be sent to the gate worker
pub(crate) enum GateCommand {
    /// A successful batched read of one scope.
    Poll {
        scope: Scope,
        values: FieldValues,
        forced_by: Option<ActionId>,
        reply: oneshot::Sender<()>,
    },
    PollFailed {
        scope: Scope,
        error: String,
    },
    /// Deltas derived from one notification.
    Events {
        notification: Notification,
        writes: Vec<FieldWrite>,
    },
    Optimistic {
        request: OptimisticRequest,
        reply: oneshot::Sender<OptimisticApplied>,
    },
    /// Drop an action's overlays (rollback after failure).
    Resolve {
        action: ActionId,
        reply: oneshot::Sender<()>,
    },
    MarkStale {
        scope: ScopeKind,
    },
    Register {
        id: ObserverId,
        fields: Vec<Field>,
        callback: ChangeCallback,
        reply: oneshot::Sender<TrackedView>,
    },
    Unregister {
        id: ObserverId,
        reply: oneshot::Sender<bool>,
    },
    SwitchAccount {
        account: Option<AccountId>,
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable sender side of the gate, plus the published snapshot.
#[derive(Clone)]
pub(crate) struct GateHandle {
    command_tx: mpsc::Sender<GateCommand>,
    snapshot: watch::Receiver<Arc<StoreSnapshot>>,
}

impl GateHandle {
    pub(crate) fn new(
        command_tx: mpsc::Sender<GateCommand>,
        snapshot: watch::Receiver<Arc<StoreSnapshot>>,
    ) -> Self {
        Self {
            command_tx,
            snapshot,
        }
    }

    pub fn snapshot(&self) -> Arc<StoreSnapshot> {
        Arc::clone(&self.snapshot.borrow())
    }

    pub fn changes(&self) -> watch::Receiver<Arc<StoreSnapshot>> {
        self.snapshot.clone()
    }

    async fn send(&self, command: GateCommand) -> Result<()> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| SyncError::CommandChannelClosed)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> GateCommand,
    ) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(command(reply_tx)).await?;
        reply_rx.await.map_err(SyncError::ReplyChannelClosed)
    }

    pub async fn poll(
        &self,
        scope: Scope,
        values: FieldValues,
        forced_by: Option<ActionId>,
    ) -> Result<()> {
        self.request(|reply| GateCommand::Poll {
            scope,
            values,
            forced_by,
            reply,
        })
        .await
    }

    pub async fn poll_failed(&self, scope: Scope, error: String) -> Result<()> {
        self.send(GateCommand::PollFailed { scope, error }).await
    }

    pub async fn events(&self, notification: Notification, writes: Vec<FieldWrite>) -> Result<()> {
        self.send(GateCommand::Events {
            notification,
            writes,
        })
        .await
    }

    pub async fn optimistic(&self, request: OptimisticRequest) -> Result<OptimisticApplied> {
        self.request(|reply| GateCommand::Optimistic { request, reply })
            .await
    }

    pub async fn resolve(&self, action: ActionId) -> Result<()> {
        self.request(|reply| GateCommand::Resolve { action, reply })
            .await
    }

    pub async fn mark_stale(&self, scope: ScopeKind) -> Result<()> {
        self.send(GateCommand::MarkStale { scope }).await
    }

    pub async fn register(
        &self,
        id: ObserverId,
        fields: Vec<Field>,
        callback: ChangeCallback,
    ) -> Result<TrackedView> {
        self.request(|reply| GateCommand::Register {
            id,
            fields,
            callback,
            reply,
        })
        .await
    }

    pub async fn unregister(&self, id: ObserverId) -> Result<bool> {
        self.request(|reply| GateCommand::Unregister { id, reply })
            .await
    }

    pub async fn switch_account(&self, account: Option<AccountId>) -> Result<()> {
        self.request(|reply| GateCommand::SwitchAccount { account, reply })
            .await
    }
}

/// Background task that serializes every store mutation.
pub(crate) struct GateWorker {
    store: ValueStore,
    account: Option<AccountId>,
    registry: SubscriptionRegistry,
    supervisor: ScopeSupervisor,
    command_rx: mpsc::Receiver<GateCommand>,
    snapshot_tx: watch::Sender<Arc<StoreSnapshot>>,
    event_bus: EventBus,
    metrics: Arc<SyncMetrics>,

    /// Pending reconciliation signals, keyed by action.
    waiters: HashMap<ActionId, oneshot::Sender<ReconciledBy>>,
    /// Last announced sequence per (event type, account).
    announced: HashMap<(EventType, Option<AccountId>), u64>,
    failures: HashMap<ScopeKind, u32>,
    stale: BTreeSet<ScopeKind>,
    stale_after_failures: u32,
    version: u64,
}

impl GateWorker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        store: ValueStore,
        account: Option<AccountId>,
        supervisor: ScopeSupervisor,
        command_rx: mpsc::Receiver<GateCommand>,
        snapshot_tx: watch::Sender<Arc<StoreSnapshot>>,
        event_bus: EventBus,
        metrics: Arc<SyncMetrics>,
        stale_after_failures: u32,
    ) -> Self {
        Self {
            store,
            account,
            registry: SubscriptionRegistry::new(),
            supervisor,
            command_rx,
            snapshot_tx,
            event_bus,
            metrics,
            waiters: HashMap::new(),
            announced: HashMap::new(),
            failures: HashMap::new(),
            stale: BTreeSet::new(),
            stale_after_failures: stale_after_failures.max(1),
            version: 0,
        }
    }

    /// Main worker loop.
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                command = self.command_rx.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
            }
        }

        // Fail queued requests so no worker waits on a reply that never comes.
        self.command_rx.close();
        while self.command_rx.try_recv().is_ok() {}

        self.supervisor.shutdown().await;
        debug!("gate worker stopped");
    }

    fn handle_command(&mut self, command: GateCommand) {
        match command {
            GateCommand::Poll {
                scope,
                values,
                forced_by,
                reply,
            } => {
                self.handle_poll(scope, values, forced_by);
                if reply.send(()).is_err() {
                    debug!("Poll reply channel closed (caller dropped)");
                }
            }
            GateCommand::PollFailed { scope, error } => self.handle_poll_failure(scope, error),
            GateCommand::Events {
                notification,
                writes,
            } => {
                let changed = self.apply(writes);
                self.publish(changed);
                self.announce(notification);
            }
            GateCommand::Optimistic { request, reply } => {
                let applied = self.handle_optimistic(request);
                if reply.send(applied).is_err() {
                    debug!("Optimistic reply channel closed (caller dropped)");
                }
            }
            GateCommand::Resolve { action, reply } => {
                self.waiters.remove(&action);
                let released = self.store.resolve(action);
                self.publish(released.changed.iter().map(|key| key.field).collect());
                if reply.send(()).is_err() {
                    debug!("Resolve reply channel closed (caller dropped)");
                }
            }
            GateCommand::MarkStale { scope } => self.mark_stale(scope, None),
            GateCommand::Register {
                id,
                fields,
                callback,
                reply,
            } => {
                let transitions = self.registry.register(id, fields.clone(), callback);
                for scope in transitions.stopped {
                    self.supervisor.stop(scope);
                }
                for scope in transitions.started {
                    self.supervisor.start(scope);
                }
                let view = self.snapshot_tx.borrow().view(&fields);
                if reply.send(view).is_err() {
                    debug!("Register reply channel closed (caller dropped)");
                }
            }
            GateCommand::Unregister { id, reply } => {
                let transitions = self.registry.unregister(id);
                let known = transitions.is_some();
                for scope in transitions.map(|t| t.stopped).unwrap_or_default() {
                    self.supervisor.stop(scope);
                }
                if reply.send(known).is_err() {
                    debug!("Unregister reply channel closed (caller dropped)");
                }
            }
            GateCommand::SwitchAccount { account, reply } => {
                self.handle_switch(account);
                if reply.send(()).is_err() {
                    debug!("SwitchAccount reply channel closed (caller dropped)");
                }
            }
        }
    }

    fn is_current(&self, scope: &Scope) -> bool {
        match scope {
            Scope::Global => true,
            Scope::Account(account) => self.account.as_ref() == Some(account),
        }
    }

    /// Routes writes through the store, returning the fields whose visible
    /// state changed.
    fn apply(&mut self, writes: Vec<FieldWrite>) -> BTreeSet<Field> {
        let now = Instant::now();
        let mut changed = BTreeSet::new();

        for write in writes {
            if !self.is_current(&write.key.scope) {
                debug!("{} dropped: account no longer active", write.key);
                self.metrics.record_discarded();
                continue;
            }

            let field = write.key.field;
            let source = write.write.provenance();
            let applied = self.store.write(write, now);
            self.metrics.record_rule(applied.rule);
            if applied.changed {
                changed.insert(field);
            }

            let by = match (applied.rule, source) {
                (Rule::Forced, _) => ReconciledBy::ForcedPoll,
                (_, Provenance::Event) => ReconciledBy::Notification,
                _ => ReconciledBy::Poll,
            };
            for action in applied.reconciled {
                self.signal(action, by);
            }
        }

        changed
    }

    fn signal(&mut self, action: ActionId, by: ReconciledBy) {
        if let Some(waiter) = self.waiters.remove(&action) {
            debug!("{} reconciled ({:?})", action, by);
            let _ = waiter.send(by);
        }
    }

    fn handle_poll(&mut self, scope: Scope, values: FieldValues, forced_by: Option<ActionId>) {
        if !self.is_current(&scope) {
            debug!("poll of {} dropped: account no longer active", scope);
            self.metrics.record_discarded();
            return;
        }

        let sequence = values.sequence;
        let writes = values
            .values
            .into_iter()
            .map(|(field, value)| FieldWrite {
                key: FieldKey {
                    scope: scope.clone(),
                    field,
                },
                write: Write::Poll {
                    value,
                    sequence,
                    forced_by,
                },
            })
            .collect();

        let mut changed = self.apply(writes);

        let kind = scope.kind();
        self.failures.remove(&kind);
        if self.stale.remove(&kind) {
            info!("{} scope fresh again", scope);
            self.event_bus
                .publish(Event::Freshness(FreshnessEvent::Fresh { scope: kind }));
            changed.extend(Field::in_scope(kind));
        }

        self.publish(changed);
    }

    fn handle_poll_failure(&mut self, scope: Scope, error: String) {
        if !self.is_current(&scope) {
            return;
        }

        let kind = scope.kind();
        let failures = self.failures.entry(kind).or_default();
        *failures += 1;
        let failures = *failures;
        warn!("poll of {} failed ({} in a row): {}", scope, failures, error);

        if failures >= self.stale_after_failures {
            self.mark_stale(kind, Some(failures));
        }
    }

    fn mark_stale(&mut self, kind: ScopeKind, failures: Option<u32>) {
        if !self.stale.insert(kind) {
            return;
        }

        warn!("{:?} scope marked stale", kind);
        self.event_bus
            .publish(Event::Freshness(FreshnessEvent::Stale {
                scope: kind,
                consecutive_failures: failures
                    .unwrap_or_else(|| self.failures.get(&kind).copied().unwrap_or(0)),
            }));
        self.publish(Field::in_scope(kind).into_iter().collect());
    }

    fn handle_optimistic(&mut self, request: OptimisticRequest) -> OptimisticApplied {
        let (waiter, reconciled) = oneshot::channel();
        self.waiters.insert(request.action, waiter);

        let now = Instant::now();
        let mut delta = Vec::new();
        let mut changed = BTreeSet::new();

        for (key, op) in request.writes {
            if !self.is_current(&key.scope) {
                debug!("{} overlay on {} dropped: account no longer active", request.action, key);
                self.metrics.record_discarded();
                continue;
            }

            let field = key.field;
            let applied = self.store.write(
                FieldWrite {
                    key,
                    write: Write::Optimistic {
                        action: request.action,
                        kind: request.kind,
                        account: request.account.clone(),
                        included_at: request.included_at,
                        op,
                    },
                },
                now,
            );
            if applied.rule == Rule::Optimistic {
                delta.push((field, op));
            }
            if applied.changed {
                changed.insert(field);
            }
        }

        if !self.store.is_outstanding(request.action) {
            self.signal(request.action, ReconciledBy::Released);
        }

        self.publish(changed);
        OptimisticApplied { delta, reconciled }
    }

    fn handle_switch(&mut self, account: Option<AccountId>) {
        if account == self.account {
            return;
        }

        let mut changed: BTreeSet<Field> = Field::in_scope(ScopeKind::Account).into_iter().collect();
        if let Some(previous) = self.account.take() {
            let released = self.store.drop_account(&previous);
            for action in released.actions {
                self.signal(action, ReconciledBy::Released);
            }
            changed.extend(released.changed.into_iter().map(|key| key.field));
        }

        self.account = account.clone();
        self.failures.remove(&ScopeKind::Account);
        self.stale.remove(&ScopeKind::Account);
        self.supervisor.switch_account(account);
        self.publish(changed);
    }

    fn announce(&mut self, notification: Notification) {
        let key = (notification.event_type, notification.account.clone());
        if self
            .announced
            .get(&key)
            .is_some_and(|last| notification.sequence <= *last)
        {
            return;
        }
        self.announced.insert(key, notification.sequence);

        let is_current_account =
            notification.account.is_some() && notification.account == self.account;
        self.event_bus
            .publish(Event::Notification(NotificationEvent {
                notification,
                is_current_account,
            }));
    }

    /// Publishes a snapshot and notifies observers of `changed`.
    fn publish(&mut self, changed: BTreeSet<Field>) {
        if changed.is_empty() {
            return;
        }

        self.version += 1;
        let snapshot = Arc::new(StoreSnapshot {
            account: self.account.clone(),
            fields: self.store.fields(),
            stale: self.stale.clone(),
            version: self.version,
        });
        self.snapshot_tx.send_replace(Arc::clone(&snapshot));

        let panicked = self.registry.notify(&changed, &snapshot);
        for _ in 0..panicked {
            self.metrics.record_observer_panic();
        }
    }
}
