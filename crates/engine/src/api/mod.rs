//! Public engine API surface.
//!
//! Gathers the types exposed to the presentation layer so the workers can stay
//! focused on reconciliation.

pub mod errors;
pub mod handle;
pub mod view;

pub use errors::{Result, SyncError};
pub use handle::SyncHandle;
pub use view::{
    ActionOutcome, ActionState, ActionTracker, ChangeCallback, ChangeNotice, ObserverId,
    OutcomeStatus, StoreSnapshot, TrackedView,
};
