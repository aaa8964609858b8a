//! Starts and stops scope workers as observers come and go.
//!
//! Each observed scope gets one poll worker and one notification worker per
//! relevant event type, all sharing a cancellation token that is a child of
//! the engine's. The account scope follows the active account.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chain_core::{AccountId, ContractReader, EventType, NotificationSource, Scope, ScopeKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::engine::{NotificationConfig, PollConfig};
use crate::workers::SyncMetrics;
use crate::workers::gate::GateHandle;
use crate::workers::notification::NotificationWorker;
use crate::workers::poll::PollWorker;

/// Everything a scope worker needs.
#[derive(Clone)]
pub(crate) struct ScopeContext {
    pub reader: Arc<dyn ContractReader>,
    pub notifications: Arc<dyn NotificationSource>,
    pub gate: GateHandle,
    pub poll: PollConfig,
    pub notification: NotificationConfig,
    pub metrics: Arc<SyncMetrics>,
}

struct ScopeWorkers {
    scope: Scope,
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

pub(crate) struct ScopeSupervisor {
    context: ScopeContext,
    cancel: CancellationToken,
    account: Option<AccountId>,
    wanted: BTreeSet<ScopeKind>,
    running: HashMap<ScopeKind, ScopeWorkers>,
}

impl ScopeSupervisor {
    pub(crate) fn new(
        context: ScopeContext,
        cancel: CancellationToken,
        account: Option<AccountId>,
    ) -> Self {
        Self {
            context,
            cancel,
            account,
            wanted: BTreeSet::new(),
            running: HashMap::new(),
        }
    }

    /// First observer of `kind` arrived.
    pub fn start(&mut self, kind: ScopeKind) {
        self.wanted.insert(kind);
        self.spawn(kind);
    }

    /// Last observer of `kind` left.
    pub fn stop(&mut self, kind: ScopeKind) {
        self.wanted.remove(&kind);
        self.cancel_scope(kind);
    }

    pub fn switch_account(&mut self, account: Option<AccountId>) {
        self.account = account;
        if self.wanted.contains(&ScopeKind::Account) {
            self.cancel_scope(ScopeKind::Account);
            self.spawn(ScopeKind::Account);
        }
    }

    fn spawn(&mut self, kind: ScopeKind) {
        if self.running.contains_key(&kind) {
            return;
        }

        let scope = match kind {
            ScopeKind::Global => Scope::Global,
            ScopeKind::Account => match &self.account {
                Some(account) => Scope::Account(account.clone()),
                None => {
                    debug!("no active account; account scope stays idle");
                    return;
                }
            },
        };

        let token = self.cancel.child_token();
        let mut tasks = Vec::new();

        let poller = PollWorker::new(
            scope.clone(),
            Arc::clone(&self.context.reader),
            self.context.gate.clone(),
            self.context.poll.interval,
            Arc::clone(&self.context.metrics),
        );
        tasks.push(tokio::spawn(poller.run(token.clone())));

        for &event_type in EventType::relevant_to(kind) {
            let listener = NotificationWorker::new(
                scope.clone(),
                event_type,
                Arc::clone(&self.context.notifications),
                self.context.gate.clone(),
                self.context.notification.resubscribe_backoff,
                Arc::clone(&self.context.metrics),
            );
            tasks.push(tokio::spawn(listener.run(token.clone())));
        }

        info!("{} scope workers started ({} tasks)", scope, tasks.len());
        self.running.insert(kind, ScopeWorkers { scope, token, tasks });
    }

    fn cancel_scope(&mut self, kind: ScopeKind) {
        if let Some(workers) = self.running.remove(&kind) {
            info!("{} scope workers stopped", workers.scope);
            workers.token.cancel();
        }
    }

    /// Cancels every scope and waits for its tasks.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        for (_, workers) in self.running.drain() {
            for task in workers.tasks {
                if let Err(error) = task.await {
                    debug!("{} scope worker ended abnormally: {}", workers.scope, error);
                }
            }
        }
    }
}
