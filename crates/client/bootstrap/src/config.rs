//! Client configuration structures and loaders.
use std::env;
use std::time::Duration;

use chain_core::AccountId;
use sync_engine::EngineConfig;

/// Configuration required to bootstrap a sync engine for a client.
#[derive(Clone, Debug, Default)]
pub struct BootstrapConfig {
    pub engine: EngineConfig,
    /// Account to activate at startup; `None` starts disconnected.
    pub account: Option<AccountId>,
    pub session_id: Option<String>,
}

impl BootstrapConfig {
    pub fn new(engine: EngineConfig) -> Self {
        Self {
            engine,
            account: None,
            session_id: None,
        }
    }

    /// Construct configuration from process environment variables.
    ///
    /// Environment variables:
    /// - `SYNC_POLL_INTERVAL_MS` - Poll cycle per observed scope (default: 30000)
    /// - `SYNC_STALE_AFTER_FAILURES` - Failed polls before a scope is stale (default: 3)
    /// - `SYNC_RECONCILE_TIMEOUT_MS` - Wait for a confirming notification (default: 10000)
    /// - `SYNC_RECONCILE_CAP_MS` - Give up and roll back after this long (default: 60000)
    /// - `SYNC_SUPPRESSION_WINDOW_MS` - Polls held back by global overlays (default: 15000)
    /// - `SYNC_RECEIPT_RECHECK_MS` - Receipt re-check delay after a timeout (default: 5000)
    /// - `SYNC_ACCOUNT` - Account to activate at startup (default: none)
    /// - `SYNC_SESSION_ID` - Session identifier for log files (default: auto-generated)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read_ms = |key: &str| read_var::<u64>(&lookup, key).map(Duration::from_millis);
        let mut config = Self::default();

        // Poll configuration
        if let Some(interval) = read_ms("SYNC_POLL_INTERVAL_MS") {
            config.engine.poll.interval = interval.max(Duration::from_millis(1));
        }
        if let Some(failures) = read_var::<u32>(&lookup, "SYNC_STALE_AFTER_FAILURES") {
            config.engine.poll.stale_after_failures = failures.max(1);
        }

        // Action configuration
        if let Some(timeout) = read_ms("SYNC_RECONCILE_TIMEOUT_MS") {
            config.engine.actions.reconcile_timeout = timeout;
        }
        if let Some(cap) = read_ms("SYNC_RECONCILE_CAP_MS") {
            config.engine.actions.reconcile_cap = cap;
        }
        if let Some(recheck) = read_ms("SYNC_RECEIPT_RECHECK_MS") {
            config.engine.actions.receipt_recheck_interval = recheck;
        }

        // Reconciliation policy
        if let Some(window) = read_ms("SYNC_SUPPRESSION_WINDOW_MS") {
            config.engine.policy.global_suppression_window = window;
        }

        config.account = lookup("SYNC_ACCOUNT")
            .filter(|account| !account.trim().is_empty())
            .map(|account| AccountId::new(account.trim()));
        config.session_id = lookup("SYNC_SESSION_ID");

        config
    }
}

fn read_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: std::str::FromStr,
{
    lookup(key)?.trim().parse().ok()
}
