//! Builds the sync engine and config bundle used by front-ends.
use std::sync::Arc;

use anyhow::{Context, Result};
use chain_core::StakingChain;
use sync_engine::Engine;
use tracing::info;

use crate::config::BootstrapConfig;

/// Builder that assembles the engine and configuration for clients.
pub struct SyncBuilder {
    config: BootstrapConfig,
}

impl SyncBuilder {
    pub fn new(config: BootstrapConfig) -> Self {
        Self { config }
    }

    /// Start the engine against `chain`.
    ///
    /// Must be called within a Tokio runtime.
    pub fn build<C>(self, chain: Arc<C>) -> Result<EngineSetup>
    where
        C: StakingChain + 'static,
    {
        info!(
            "connecting to {} on {}",
            chain.name(),
            chain.network()
        );

        let engine = Engine::builder()
            .config(self.config.engine.clone())
            .chain(chain)
            .account(self.config.account.clone())
            .build()
            .context("failed to start sync engine")?;

        Ok(EngineSetup {
            config: self.config,
            engine,
        })
    }
}

pub struct EngineSetup {
    pub config: BootstrapConfig,
    pub engine: Engine,
}

#[cfg(test)]
mod tests {
    use chain_core::{AccountId, MockStakingChain};

    use super::*;

    #[tokio::test]
    async fn setup_activates_configured_account() {
        let config = BootstrapConfig {
            account: Some(AccountId::new("0xa11ce")),
            ..BootstrapConfig::default()
        };
        let setup = SyncBuilder::new(config)
            .build(Arc::new(MockStakingChain::new()))
            .expect("engine should start");

        assert_eq!(
            setup.engine.handle().account(),
            Some(AccountId::new("0xa11ce"))
        );
        setup.engine.shutdown().await.expect("shutdown should succeed");
    }
}
