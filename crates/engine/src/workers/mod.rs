//! Worker tasks that back the engine.
//!
//! The gate worker serializes every store mutation. Poll and notification
//! workers run per observed scope under the supervisor, and the action
//! coordinator spawns one task per user action; all of them only produce
//! candidate writes for the gate.

mod action;
mod gate;
mod metrics;
mod notification;
mod poll;
mod supervisor;

pub(crate) use action::ActionCoordinator;
pub(crate) use gate::{GateHandle, GateWorker};
pub use metrics::{MetricsSnapshot, SyncMetrics};
pub(crate) use supervisor::{ScopeContext, ScopeSupervisor};
