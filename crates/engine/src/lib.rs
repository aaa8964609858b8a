//! Client-side state synchronization for a staking contract.
//!
//! This crate keeps a local view of contract fields current by combining
//! periodic polls, pushed notifications, and optimistic deltas from the
//! user's own actions. Consumers embed [`Engine`], register observers, and
//! perform actions through [`SyncHandle`].
//!
//! Modules are organized by responsibility:
//! - [`engine`] hosts the orchestrator, builder, and configuration
//! - [`api`] exposes the types downstream clients interact with
//! - [`store`] holds the value store and its reconciliation policy
//! - [`registry`] tracks which observer watches which field
//! - [`deltas`] maps notifications and actions to field writes
//! - [`events`] provides the topic-based bus for user notices
//! - [`format`] renders token amounts and durations for display
//! - [`workers`] keeps background tasks internal to the crate
pub mod api;
pub mod deltas;
pub mod engine;
pub mod events;
pub mod format;
pub mod registry;
pub mod store;

mod workers;

pub use api::{
    ActionOutcome, ActionState, ActionTracker, ChangeCallback, ChangeNotice, ObserverId,
    OutcomeStatus, Result, StoreSnapshot, SyncError, SyncHandle, TrackedView,
};
pub use engine::{
    ActionConfig, Engine, EngineBuilder, EngineConfig, NotificationConfig, PolicyConfig,
    PollConfig,
};
pub use events::{
    ActionEvent, Event, EventBus, FreshnessEvent, NotificationEvent, ReconciledBy, Topic,
};
pub use format::{FormatError, format_duration, format_token_amount, parse_token_amount};
pub use store::{ActionId, FieldKey, FieldOp, Provenance, Rule, TrackedField, ValueStore};
pub use workers::{MetricsSnapshot, SyncMetrics};
