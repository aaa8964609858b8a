//! Observer registration and change fan-out.
//!
//! Keeps a reference count per scope kind so the supervisor only polls and
//! subscribes for scopes somebody is looking at. Callbacks run on the gate
//! task; a panicking callback is caught and logged so it cannot take the
//! gate, or any other observer, down with it.

use std::collections::{BTreeSet, HashMap};
use std::panic::{self, AssertUnwindSafe};

use chain_core::{Field, ScopeKind};
use tracing::{debug, error};

use crate::api::{ChangeCallback, ChangeNotice, ObserverId, StoreSnapshot};

struct Observer {
    fields: Vec<Field>,
    scopes: BTreeSet<ScopeKind>,
    callback: ChangeCallback,
}

/// Scope kinds whose observer count crossed zero.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ScopeTransitions {
    pub started: Vec<ScopeKind>,
    pub stopped: Vec<ScopeKind>,
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    observers: HashMap<ObserverId, Observer>,
    scopes: HashMap<ScopeKind, usize>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) an observer.
    pub fn register(
        &mut self,
        id: ObserverId,
        fields: Vec<Field>,
        callback: ChangeCallback,
    ) -> ScopeTransitions {
        let mut transitions = self.remove(id);

        let scopes: BTreeSet<ScopeKind> = fields.iter().map(Field::scope_kind).collect();
        for scope in &scopes {
            let count = self.scopes.entry(*scope).or_default();
            *count += 1;
            if *count == 1 {
                // Replacing an observer may stop and restart the same scope.
                if let Some(index) = transitions.stopped.iter().position(|s| s == scope) {
                    transitions.stopped.remove(index);
                } else {
                    transitions.started.push(*scope);
                }
            }
        }

        debug!("{} registered for {} field(s)", id, fields.len());
        self.observers.insert(
            id,
            Observer {
                fields,
                scopes,
                callback,
            },
        );
        transitions
    }

    /// Removes an observer; `None` if it was not registered.
    pub fn unregister(&mut self, id: ObserverId) -> Option<ScopeTransitions> {
        if !self.observers.contains_key(&id) {
            return None;
        }
        debug!("{} unregistered", id);
        Some(self.remove(id))
    }

    fn remove(&mut self, id: ObserverId) -> ScopeTransitions {
        let mut transitions = ScopeTransitions::default();
        let Some(observer) = self.observers.remove(&id) else {
            return transitions;
        };

        for scope in observer.scopes {
            if let Some(count) = self.scopes.get_mut(&scope) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.scopes.remove(&scope);
                    transitions.stopped.push(scope);
                }
            }
        }
        transitions
    }

    pub fn observer_count(&self, scope: ScopeKind) -> usize {
        self.scopes.get(&scope).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    /// Calls every observer whose fields intersect `changed`.
    ///
    /// Returns the number of callbacks that panicked.
    pub fn notify(&self, changed: &BTreeSet<Field>, snapshot: &StoreSnapshot) -> usize {
        let mut panicked = 0;
        for (id, observer) in &self.observers {
            let intersecting: Vec<Field> = observer
                .fields
                .iter()
                .filter(|field| changed.contains(field))
                .copied()
                .collect();
            if intersecting.is_empty() {
                continue;
            }

            let notice = ChangeNotice {
                changed: intersecting,
                view: snapshot.view(&observer.fields),
            };
            let callback = &observer.callback;
            if panic::catch_unwind(AssertUnwindSafe(|| callback(&notice))).is_err() {
                error!("{} panicked in its change callback", id);
                panicked += 1;
            }
        }
        panicked
    }
}
