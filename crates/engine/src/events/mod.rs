//! Topic-based event bus for user notices.
//!
//! Observers read values through the registry; the bus carries everything a
//! UI may want to announce (action progress, data freshness, contract
//! activity) without ever blocking the gate.

mod bus;
mod types;

pub use bus::{Event, EventBus, Topic};
pub use types::{ActionEvent, FreshnessEvent, NotificationEvent, ReconciledBy};
