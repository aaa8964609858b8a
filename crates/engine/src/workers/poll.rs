//! Periodic batched reads for one observed scope.
//!
//! A failed read leaves the store untouched; the gate counts consecutive
//! failures and flags the scope stale once they pile up.

use std::sync::Arc;
use std::time::Duration;

use chain_core::{ContractReader, Field, Scope};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::workers::SyncMetrics;
use crate::workers::gate::GateHandle;

pub(crate) struct PollWorker {
    scope: Scope,
    fields: Vec<Field>,
    reader: Arc<dyn ContractReader>,
    gate: GateHandle,
    interval: Duration,
    metrics: Arc<SyncMetrics>,
}

impl PollWorker {
    pub(crate) fn new(
        scope: Scope,
        reader: Arc<dyn ContractReader>,
        gate: GateHandle,
        interval: Duration,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        Self {
            fields: Field::in_scope(scope.kind()),
            scope,
            reader,
            gate,
            interval,
            metrics,
        }
    }

    /// Polls immediately, then once per interval, until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                delivered = self.poll_once() => {
                    if !delivered {
                        break;
                    }
                }
            }
        }

        debug!("poll worker for {} stopped", self.scope);
    }

    /// Returns false once the gate is gone.
    async fn poll_once(&self) -> bool {
        match self.reader.read(self.scope.account(), &self.fields).await {
            Ok(values) => {
                trace!("{} polled at #{}", self.scope, values.sequence);
                self.metrics.record_poll(true);
                self.gate
                    .poll(self.scope.clone(), values, None)
                    .await
                    .is_ok()
            }
            Err(error) => {
                self.metrics.record_poll(false);
                self.gate
                    .poll_failed(self.scope.clone(), error.to_string())
                    .await
                    .is_ok()
            }
        }
    }
}
