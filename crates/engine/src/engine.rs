//! Engine orchestrator.
//!
//! The engine owns the gate worker (and through it the scope workers), wires
//! up command and snapshot channels, and exposes a builder-based API for
//! clients to track fields and perform actions.

use std::sync::Arc;
use std::time::Duration;

use chain_core::{AccountId, ContractReader, NotificationSource, StakingChain, TransactionSubmitter};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::api::{Result, StoreSnapshot, SyncError, SyncHandle};
use crate::events::EventBus;
use crate::store::ValueStore;
use crate::workers::{
    ActionCoordinator, GateHandle, GateWorker, ScopeContext, ScopeSupervisor, SyncMetrics,
};

/// Periodic batched reads.
#[derive(Debug, Clone)]
pub struct PollConfig {
    pub interval: Duration,
    /// Consecutive failed polls before a scope is flagged stale.
    pub stale_after_failures: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            stale_after_failures: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NotificationConfig {
    /// Delay before resubscribing after a dropped or refused subscription.
    pub resubscribe_backoff: Duration,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            resubscribe_backoff: Duration::from_secs(1),
        }
    }
}

/// Timing of the action lifecycle.
#[derive(Debug, Clone)]
pub struct ActionConfig {
    /// Bounded wait for a confirming notification before forcing polls.
    pub reconcile_timeout: Duration,
    /// Outer cap, measured from confirmation, after which the action fails
    /// and its optimistic delta is rolled back.
    pub reconcile_cap: Duration,
    /// Delay between forced polls that did not land.
    pub forced_poll_retry: Duration,
    /// Delay between receipt re-checks after a receipt timeout.
    pub receipt_recheck_interval: Duration,
    /// `None` re-checks until the receipt is observed.
    pub receipt_recheck_limit: Option<u32>,
}

impl Default for ActionConfig {
    fn default() -> Self {
        Self {
            reconcile_timeout: Duration::from_secs(10),
            reconcile_cap: Duration::from_secs(60),
            forced_poll_retry: Duration::from_secs(1),
            receipt_recheck_interval: Duration::from_secs(5),
            receipt_recheck_limit: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PolicyConfig {
    /// How long an optimistic overlay on a global field holds polls back.
    pub global_suppression_window: Duration,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            global_suppression_window: Duration::from_secs(15),
        }
    }
}

/// Engine configuration shared across the orchestrator and workers.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub poll: PollConfig,
    pub notifications: NotificationConfig,
    pub actions: ActionConfig,
    pub policy: PolicyConfig,
    pub event_buffer_size: usize,
    pub command_buffer_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll: PollConfig::default(),
            notifications: NotificationConfig::default(),
            actions: ActionConfig::default(),
            policy: PolicyConfig::default(),
            event_buffer_size: 100,
            command_buffer_size: 32,
        }
    }
}

/// Staking state synchronization engine.
///
/// Owns the background workers; [`SyncHandle`] is the cloneable façade for
/// clients. Dropping the engine cancels its workers.
pub struct Engine {
    handle: SyncHandle,
    cancel: CancellationToken,
    gate_worker: JoinHandle<()>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Get a cloneable handle to this engine
    pub fn handle(&self) -> SyncHandle {
        self.handle.clone()
    }

    /// Cancel every scope worker and wait for the gate to stop.
    ///
    /// Actions still in flight lose their gate and stop at their next step.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("sync engine shutting down");
        self.cancel.cancel();
        (&mut self.gate_worker)
            .await
            .map_err(SyncError::WorkerJoin)?;
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Builder for [`Engine`].
pub struct EngineBuilder {
    config: EngineConfig,
    reader: Option<Arc<dyn ContractReader>>,
    submitter: Option<Arc<dyn TransactionSubmitter>>,
    notifications: Option<Arc<dyn NotificationSource>>,
    account: Option<AccountId>,
}

impl EngineBuilder {
    fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            reader: None,
            submitter: None,
            notifications: None,
            account: None,
        }
    }

    /// Override engine configuration
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn reader(mut self, reader: Arc<dyn ContractReader>) -> Self {
        self.reader = Some(reader);
        self
    }

    pub fn submitter(mut self, submitter: Arc<dyn TransactionSubmitter>) -> Self {
        self.submitter = Some(submitter);
        self
    }

    pub fn notifications(mut self, notifications: Arc<dyn NotificationSource>) -> Self {
        self.notifications = Some(notifications);
        self
    }

    /// Use one backend for all three collaborators.
    pub fn chain<C>(self, chain: Arc<C>) -> Self
    where
        C: StakingChain + 'static,
    {
        self.reader(chain.clone())
            .submitter(chain.clone())
            .notifications(chain)
    }

    /// Initially active account (optional)
    pub fn account(mut self, account: Option<AccountId>) -> Self {
        self.account = account;
        self
    }

    /// Build the engine and start its gate worker.
    ///
    /// Must be called within a Tokio runtime.
    pub fn build(self) -> Result<Engine> {
        let reader = self
            .reader
            .ok_or(SyncError::MissingCollaborator("contract reader"))?;
        let submitter = self
            .submitter
            .ok_or(SyncError::MissingCollaborator("transaction submitter"))?;
        let notifications = self
            .notifications
            .ok_or(SyncError::MissingCollaborator("notification source"))?;
        let config = self.config;

        let (command_tx, command_rx) = mpsc::channel(config.command_buffer_size.max(1));
        let initial = StoreSnapshot {
            account: self.account.clone(),
            ..StoreSnapshot::default()
        };
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(initial));

        let gate = GateHandle::new(command_tx, snapshot_rx);
        let event_bus = EventBus::with_capacity(config.event_buffer_size);
        let metrics = Arc::new(SyncMetrics::new());
        let cancel = CancellationToken::new();

        let supervisor = ScopeSupervisor::new(
            ScopeContext {
                reader: Arc::clone(&reader),
                notifications,
                gate: gate.clone(),
                poll: config.poll.clone(),
                notification: config.notifications.clone(),
                metrics: Arc::clone(&metrics),
            },
            cancel.child_token(),
            self.account.clone(),
        );

        let worker = GateWorker::new(
            ValueStore::new(config.policy.clone()),
            self.account.clone(),
            supervisor,
            command_rx,
            snapshot_tx,
            event_bus.clone(),
            Arc::clone(&metrics),
            config.poll.stale_after_failures,
        );
        let gate_worker = tokio::spawn(worker.run(cancel.clone()));

        let coordinator = ActionCoordinator::new(
            reader,
            submitter,
            gate.clone(),
            event_bus.clone(),
            Arc::clone(&metrics),
            config.actions.clone(),
            cancel.child_token(),
        );

        info!(
            "sync engine started (account: {})",
            self.account
                .as_ref()
                .map(AccountId::as_str)
                .unwrap_or("none")
        );

        Ok(Engine {
            handle: SyncHandle::new(gate, coordinator, event_bus, metrics),
            cancel,
            gate_worker,
        })
    }
}
