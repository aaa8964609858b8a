//! Notification listener for one (scope, event type).
//!
//! Subscribes from "now", derives field deltas from each notification, and
//! hands them to the gate. Duplicates are dropped against a per-account
//! watermark: delivery is at-least-once but ordered per (event type,
//! account), so anything at or below the last applied sequence was seen.
//! When the stream ends the worker resubscribes after a backoff; whatever was
//! missed in the gap is recovered by the next poll.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chain_core::{
    AccountId, EventType, Notification, NotificationSource, Scope, StartFrom, Subscription,
};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::deltas;
use crate::workers::SyncMetrics;
use crate::workers::gate::GateHandle;

pub(crate) struct NotificationWorker {
    scope: Scope,
    event_type: EventType,
    source: Arc<dyn NotificationSource>,
    gate: GateHandle,
    backoff: Duration,
    metrics: Arc<SyncMetrics>,
    watermark: HashMap<Option<AccountId>, u64>,
}

/// Why a subscription stopped delivering.
enum StreamEnd {
    Dropped,
    Cancelled,
    GateClosed,
}

impl NotificationWorker {
    pub(crate) fn new(
        scope: Scope,
        event_type: EventType,
        source: Arc<dyn NotificationSource>,
        gate: GateHandle,
        backoff: Duration,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        Self {
            scope,
            event_type,
            source,
            gate,
            backoff,
            metrics,
            watermark: HashMap::new(),
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            let subscribed = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                subscribed = self.source.subscribe(self.event_type, StartFrom::Now) => subscribed,
            };

            match subscribed {
                Ok(subscription) => {
                    debug!("{} subscribed to {}", self.scope, self.event_type);
                    match self.listen(subscription, &cancel).await {
                        StreamEnd::Dropped => {
                            warn!(
                                "{} subscription for {} dropped; resubscribing",
                                self.event_type, self.scope
                            );
                        }
                        StreamEnd::Cancelled | StreamEnd::GateClosed => break,
                    }
                }
                Err(error) => {
                    warn!(
                        "{} subscription for {} failed: {}",
                        self.event_type, self.scope, error
                    );
                }
            }

            self.metrics.record_resubscribe();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = time::sleep(self.backoff) => {}
            }
        }

        debug!("{} listener for {} stopped", self.event_type, self.scope);
    }

    async fn listen(&mut self, mut subscription: Subscription, cancel: &CancellationToken) -> StreamEnd {
        let end = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break StreamEnd::Cancelled,
                next = subscription.receiver.recv() => next,
            };

            let Some(notification) = next else {
                break StreamEnd::Dropped;
            };

            let delivered = tokio::select! {
                biased;
                _ = cancel.cancelled() => break StreamEnd::Cancelled,
                delivered = self.handle(notification) => delivered,
            };
            if !delivered {
                break StreamEnd::GateClosed;
            }
        };

        if !matches!(end, StreamEnd::Dropped) {
            self.source.unsubscribe(subscription.id).await;
        }
        end
    }

    /// Returns false once the gate is gone.
    async fn handle(&mut self, notification: Notification) -> bool {
        if let Scope::Account(account) = &self.scope
            && notification.account.as_ref() != Some(account)
        {
            return true;
        }

        if let Some(last) = self.watermark.get(&notification.account)
            && notification.sequence <= *last
        {
            trace!(
                "{} #{} already applied; dropped",
                notification.event_type, notification.sequence
            );
            self.metrics.record_duplicate();
            return true;
        }
        self.watermark
            .insert(notification.account.clone(), notification.sequence);

        let writes = deltas::notification_writes(&notification, &self.scope);
        if writes.is_empty() {
            return true;
        }

        self.metrics.record_notification();
        self.gate.events(notification, writes).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chain_core::{Field, MockStakingChain, U256, payload};
    use tokio::sync::{mpsc, watch};

    use super::*;
    use crate::api::StoreSnapshot;
    use crate::workers::gate::GateCommand;

    fn staked(sequence: u64) -> Notification {
        Notification {
            event_type: EventType::Staked,
            account: Some(AccountId::new("0xa11ce")),
            payload: BTreeMap::from([(payload::AMOUNT.to_string(), U256::from(100u64))]),
            sequence,
        }
    }

    #[tokio::test]
    async fn duplicates_never_reach_the_gate() {
        let (command_tx, mut command_rx) = mpsc::channel(8);
        let (_snapshot_tx, snapshot_rx) = watch::channel(Arc::new(StoreSnapshot::default()));
        let metrics = Arc::new(SyncMetrics::new());
        let mut worker = NotificationWorker::new(
            Scope::Account(AccountId::new("0xa11ce")),
            EventType::Staked,
            Arc::new(MockStakingChain::new()),
            GateHandle::new(command_tx, snapshot_rx),
            Duration::from_secs(1),
            Arc::clone(&metrics),
        );

        assert!(worker.handle(staked(5)).await);
        assert!(worker.handle(staked(5)).await);
        assert!(worker.handle(staked(4)).await);
        assert!(worker.handle(staked(6)).await);

        let mut forwarded = Vec::new();
        while let Ok(GateCommand::Events { writes, .. }) = command_rx.try_recv() {
            forwarded.push(writes);
        }
        assert_eq!(forwarded.len(), 2);
        assert_eq!(forwarded[0][1].key.field, Field::StakedAmount);
        assert_eq!(metrics.snapshot().duplicates_dropped, 2);
    }

    #[tokio::test]
    async fn notifications_for_other_accounts_are_skipped() {
        let (command_tx, mut command_rx) = mpsc::channel(8);
        let (_snapshot_tx, snapshot_rx) = watch::channel(Arc::new(StoreSnapshot::default()));
        let mut worker = NotificationWorker::new(
            Scope::Account(AccountId::new("0xb0b")),
            EventType::Staked,
            Arc::new(MockStakingChain::new()),
            GateHandle::new(command_tx, snapshot_rx),
            Duration::from_secs(1),
            Arc::new(SyncMetrics::new()),
        );

        assert!(worker.handle(staked(1)).await);
        assert!(command_rx.try_recv().is_err());
    }
}
