//! Staking client binary.
//!
//! Composition root that loads configuration, sets up logging, starts the
//! sync engine against a chain backend, and runs a short session: observe the
//! account's fields, stake, and follow the action until it reconciles.
//!
//! # Features
//!
//! - `mock`: in-memory staking contract (default)
//!
//! # Examples
//!
//! ```bash
//! SYNC_ACCOUNT=0xa11ce RUST_LOG=sync_engine=debug cargo run -p stake-client
//! ```

use anyhow::Result;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let config = client_bootstrap::BootstrapConfig::from_env();
    setup_logging(&config.session_id)?;

    #[cfg(feature = "mock")]
    {
        run_mock_session(config).await?;
    }

    #[cfg(not(feature = "mock"))]
    {
        compile_error!("At least one chain backend feature must be enabled (mock, ...)");
    }

    Ok(())
}

/// Stake against the in-memory contract and print what the engine shows.
#[cfg(feature = "mock")]
async fn run_mock_session(mut config: client_bootstrap::BootstrapConfig) -> Result<()> {
    use std::sync::Arc;

    use anyhow::Context;
    use chain_core::{AccountId, ActionKind, Field, MockStakingChain, tokens};
    use client_bootstrap::SyncBuilder;
    use sync_engine::{ChangeNotice, ObserverId, format_token_amount};

    const DECIMALS: u32 = 18;
    const FIELDS: [Field; 5] = [
        Field::WalletBalance,
        Field::Allowance,
        Field::StakedAmount,
        Field::TotalStaked,
        Field::CurrentRewardRate,
    ];

    let account = config
        .account
        .get_or_insert_with(|| AccountId::new("0xa11ce"))
        .clone();

    let chain = Arc::new(MockStakingChain::new());
    chain.fund(&account, tokens(1_000));

    let setup = SyncBuilder::new(config).build(Arc::clone(&chain))?;
    let handle = setup.engine.handle();
    tracing::info!("Session started for {}", account);

    let view = handle
        .register(
            ObserverId(1),
            &FIELDS,
            Arc::new(|notice: &ChangeNotice| {
                for field in &notice.changed {
                    println!(
                        "  {:<20} {:>12}{}",
                        field.to_string(),
                        format_token_amount(notice.view.value(*field), DECIMALS, 4),
                        if notice.view.is_stale { " (stale)" } else { "" }
                    );
                }
            }),
        )
        .await?;
    println!("Observing {} fields for {}", view.values.len(), account);

    let outcome = handle
        .perform_action(ActionKind::Stake, Some(tokens(100)))
        .await
        .context("stake failed")?;
    println!(
        "Stake {} ({:?}), tx {}",
        outcome.id, outcome.status, outcome.transaction
    );

    let state = outcome.tracker.settled().await;
    println!("Stake {} settled: {:?}", outcome.id, state);

    let view = handle.tracked_fields(&FIELDS);
    println!("{}", serde_json::to_string_pretty(&view)?);

    let metrics = handle.metrics();
    tracing::info!(
        "polls: {} ok / {} failed, notifications: {}, forced polls: {}",
        metrics.polls_succeeded,
        metrics.polls_failed,
        metrics.notifications_applied,
        metrics.forced_polls
    );

    setup.engine.shutdown().await?;
    tracing::info!("Client shutdown complete");
    Ok(())
}

/// Setup logging to a session log file
fn setup_logging(session_id: &Option<String>) -> Result<()> {
    use std::time::{SystemTime, UNIX_EPOCH};

    let log_dir = directories::ProjectDirs::from("", "", "stake-sync")
        .map(|dirs| dirs.cache_dir().join("logs"))
        .unwrap_or_else(|| std::env::temp_dir().join("stake-sync").join("logs"));

    // Create session ID if not provided
    let session_id = session_id.clone().unwrap_or_else(|| {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default();
        format!("session_{}", timestamp)
    });

    let session_log_dir = log_dir.join(&session_id);
    std::fs::create_dir_all(&session_log_dir)?;

    let file_appender = tracing_appender::rolling::never(&session_log_dir, "client.log");
    let (non_blocking_file, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking_file)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .init();

    // Keep the file writer alive for the whole process
    std::mem::forget(guard);

    tracing::info!("Logging initialized: session={}", session_id);
    tracing::info!("Log file: {}/client.log", session_log_dir.display());

    Ok(())
}
