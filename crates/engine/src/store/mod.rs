//! Best-known value per (scope, field).
//!
//! Each slot keeps a ground-truth base (last accepted poll or event) and a
//! stack of optimistic overlays, one per in-flight action touching the field.
//! The visible value is the base with every overlay folded on top, so dropping
//! an overlay is an exact rollback and never disturbs ground truth.
//!
//! Event deltas are relative and event types arrive in no particular order, so
//! a slot remembers which event sequences it folded in since its last absolute
//! value. A delta is applied exactly once, whatever order it arrives in.
//!
//! [`ValueStore`] executes [`policy::decide`] verdicts; it is owned by the gate
//! worker and never shared.

pub mod policy;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use chain_core::{AccountId, ActionKind, Field, Scope, ScopeKind, U256};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, trace};

pub use policy::{BaseUpdate, Decision, Rule};

use crate::engine::PolicyConfig;

/// Identifier of a user action, unique within one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActionId(pub u64);

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "action#{}", self.0)
    }
}

/// Subsystem that produced a stored value.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[strum(serialize_all = "lowercase")]
pub enum Provenance {
    #[default]
    Poll,
    Event,
    Optimistic,
}

/// Address of one slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldKey {
    pub scope: Scope,
    pub field: Field,
}

impl FieldKey {
    /// Key for `field` under the given account (ignored for global fields).
    pub fn new(field: Field, account: Option<&AccountId>) -> Option<Self> {
        let scope = match field.scope_kind() {
            ScopeKind::Global => Scope::Global,
            ScopeKind::Account => Scope::Account(account?.clone()),
        };
        Some(Self { scope, field })
    }

    pub fn global(field: Field) -> Self {
        Self {
            scope: Scope::Global,
            field,
        }
    }
}

impl fmt::Display for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scope, self.field)
    }
}

/// Saturating arithmetic applied to a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldOp {
    Set(U256),
    Add(U256),
    Sub(U256),
}

impl FieldOp {
    /// Absolute ops carry a value that already reflects every earlier event.
    pub fn is_absolute(&self) -> bool {
        matches!(self, FieldOp::Set(_))
    }

    pub fn apply(&self, value: U256) -> U256 {
        match *self {
            FieldOp::Set(v) => v,
            FieldOp::Add(v) => value.saturating_add(v),
            FieldOp::Sub(v) => value.saturating_sub(v),
        }
    }
}

/// The (action kind, account) a contract event confirms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub kind: ActionKind,
    pub account: AccountId,
}

/// Candidate write, tagged by the subsystem that produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum Write {
    Optimistic {
        action: ActionId,
        kind: ActionKind,
        account: AccountId,
        /// Receipt position of the action's transaction.
        included_at: u64,
        op: FieldOp,
    },
    Event {
        op: FieldOp,
        sequence: u64,
        origin: Option<Origin>,
    },
    Poll {
        value: U256,
        sequence: u64,
        /// Set when the poll was forced to reconcile a specific action.
        forced_by: Option<ActionId>,
    },
}

impl Write {
    pub fn provenance(&self) -> Provenance {
        match self {
            Write::Optimistic { .. } => Provenance::Optimistic,
            Write::Event { .. } => Provenance::Event,
            Write::Poll { .. } => Provenance::Poll,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldWrite {
    pub key: FieldKey,
    pub write: Write,
}

/// An optimistic delta layered over a slot's base value.
#[derive(Debug, Clone, PartialEq)]
pub struct Overlay {
    pub action: ActionId,
    pub kind: ActionKind,
    pub account: AccountId,
    pub included_at: u64,
    pub op: FieldOp,
    pub applied_at: Instant,
}

impl Overlay {
    /// Whether an event from `origin` at `sequence` confirms this overlay.
    ///
    /// The confirming event is the first one the action's transaction emits,
    /// which is exactly the receipt position.
    pub fn confirmed_by(&self, origin: &Origin, sequence: u64) -> bool {
        self.kind == origin.kind && self.account == origin.account && sequence == self.included_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Deferred {
    value: U256,
    sequence: u64,
}

/// Storage for one (scope, field).
#[derive(Debug, Clone, Default)]
pub struct Slot {
    base: U256,
    provenance: Provenance,
    /// Highest sequence folded into the base.
    sequence: u64,
    /// Sequence of the last absolute value (a poll or a `Set` event).
    floor: u64,
    /// Relative event deltas folded in above `floor`.
    folded: BTreeSet<u64>,
    overlays: Vec<Overlay>,
    deferred: Option<Deferred>,
}

impl Slot {
    pub fn value(&self) -> U256 {
        self.overlays
            .iter()
            .fold(self.base, |value, overlay| overlay.op.apply(value))
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn overlays(&self) -> &[Overlay] {
        &self.overlays
    }

    pub fn provenance(&self) -> Provenance {
        if self.overlays.is_empty() {
            self.provenance
        } else {
            Provenance::Optimistic
        }
    }

    /// Whether the base already includes whatever happened at `sequence`.
    pub fn reflects(&self, sequence: u64) -> bool {
        sequence <= self.floor || self.folded.contains(&sequence)
    }

    /// Whether an event delta still has to reach the base.
    fn accepts(&self, op: &FieldOp, sequence: u64) -> bool {
        if op.is_absolute() {
            sequence > self.sequence
        } else {
            !self.reflects(sequence)
        }
    }

    fn set_base(&mut self, value: U256, provenance: Provenance, sequence: u64) {
        self.base = value;
        self.provenance = provenance;
        self.sequence = self.sequence.max(sequence);
        self.floor = sequence;
        self.folded.retain(|folded| *folded > sequence);
        if self
            .deferred
            .is_some_and(|deferred| deferred.sequence <= sequence)
        {
            self.deferred = None;
        }
    }

    fn fold_event(&mut self, op: FieldOp, sequence: u64) {
        if let FieldOp::Set(value) = op {
            self.set_base(value, Provenance::Event, sequence);
            return;
        }
        self.base = op.apply(self.base);
        self.provenance = Provenance::Event;
        self.sequence = self.sequence.max(sequence);
        self.folded.insert(sequence);
    }

    /// Applies a deferred poll once nothing obstructs it.
    fn settle(&mut self) {
        if !self.overlays.is_empty() {
            return;
        }
        if let Some(deferred) = self.deferred.take()
            && deferred.sequence >= self.sequence
        {
            self.set_base(deferred.value, Provenance::Poll, deferred.sequence);
        }
    }
}

/// Read-only view of one field as observers see it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedField {
    pub field: Field,
    pub scope: ScopeKind,
    pub value: U256,
    pub provenance: Provenance,
    pub sequence: u64,
}

impl TrackedField {
    /// Zero value for a field that has never been written.
    pub fn unset(field: Field) -> Self {
        Self {
            field,
            scope: field.scope_kind(),
            value: U256::zero(),
            provenance: Provenance::default(),
            sequence: 0,
        }
    }

    fn from_slot(field: Field, slot: &Slot) -> Self {
        Self {
            field,
            scope: field.scope_kind(),
            value: slot.value(),
            provenance: slot.provenance(),
            sequence: slot.sequence(),
        }
    }
}

/// Result of one write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub rule: Rule,
    /// Visible value or provenance changed.
    pub changed: bool,
    /// Actions left with no overlays by this write.
    pub reconciled: Vec<ActionId>,
}

/// Result of removing an action's overlays.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Released {
    pub changed: Vec<FieldKey>,
    pub actions: Vec<ActionId>,
}

#[derive(Debug, Default)]
pub struct ValueStore {
    slots: HashMap<FieldKey, Slot>,
    outstanding: HashMap<ActionId, usize>,
    policy: PolicyConfig,
}

impl ValueStore {
    pub fn new(policy: PolicyConfig) -> Self {
        Self {
            slots: HashMap::new(),
            outstanding: HashMap::new(),
            policy,
        }
    }

    pub fn read(&self, key: &FieldKey) -> U256 {
        self.slots.get(key).map(Slot::value).unwrap_or_default()
    }

    pub fn slot(&self, key: &FieldKey) -> Option<&Slot> {
        self.slots.get(key)
    }

    pub fn tracked(&self, key: &FieldKey) -> TrackedField {
        self.slots
            .get(key)
            .map(|slot| TrackedField::from_slot(key.field, slot))
            .unwrap_or_else(|| TrackedField::unset(key.field))
    }

    /// Whether an action still has overlays in the store.
    pub fn is_outstanding(&self, action: ActionId) -> bool {
        self.outstanding.contains_key(&action)
    }

    /// Routes a candidate write through the reconciliation policy.
    pub fn write(&mut self, write: FieldWrite, now: Instant) -> Applied {
        let FieldWrite { key, write } = write;
        let slot = self.slots.entry(key.clone()).or_default();
        let before = (slot.value(), slot.provenance());
        let decision = policy::decide(slot, &write, key.scope.kind(), now, &self.policy);

        trace!("{} {:?} -> {:?}", key, write, decision);

        let mut lifted: Vec<ActionId> = Vec::with_capacity(decision.lift.len());
        let mut indices = decision.lift.clone();
        indices.sort_unstable_by(|a, b| b.cmp(a));
        for index in indices {
            lifted.push(slot.overlays.remove(index).action);
        }

        match (&write, decision.base) {
            (
                Write::Optimistic {
                    action,
                    kind,
                    account,
                    included_at,
                    op,
                },
                BaseUpdate::Overlay,
            ) => {
                slot.overlays.push(Overlay {
                    action: *action,
                    kind: *kind,
                    account: account.clone(),
                    included_at: *included_at,
                    op: *op,
                    applied_at: now,
                });
                *self.outstanding.entry(*action).or_default() += 1;
            }
            (Write::Event { op, sequence, .. }, BaseUpdate::Apply) => {
                slot.fold_event(*op, *sequence);
            }
            (Write::Poll { value, sequence, .. }, BaseUpdate::Apply) => {
                slot.set_base(*value, Provenance::Poll, *sequence);
            }
            (Write::Poll { value, sequence, .. }, BaseUpdate::Defer) => {
                let keep = slot
                    .deferred
                    .is_none_or(|pending| *sequence >= pending.sequence);
                if keep {
                    slot.deferred = Some(Deferred {
                        value: *value,
                        sequence: *sequence,
                    });
                }
            }
            _ => {}
        }

        slot.settle();
        let changed = before != (slot.value(), slot.provenance());
        if changed {
            debug!("{} = {} ({}, {:?})", key, slot.value(), slot.provenance(), decision.rule);
        }

        let reconciled = lifted
            .into_iter()
            .filter(|action| self.release(*action, 1))
            .collect();

        Applied {
            rule: decision.rule,
            changed,
            reconciled,
        }
    }

    /// Drops every overlay of `action` (rollback, or settling a finished action).
    pub fn resolve(&mut self, action: ActionId) -> Released {
        let mut changed = Vec::new();
        for (key, slot) in self.slots.iter_mut() {
            let count = slot.overlays.len();
            slot.overlays.retain(|overlay| overlay.action != action);
            if slot.overlays.len() != count {
                slot.settle();
                changed.push(key.clone());
            }
        }
        let actions = self
            .outstanding
            .remove(&action)
            .map(|_| vec![action])
            .unwrap_or_default();
        Released { changed, actions }
    }

    /// Forgets every slot belonging to `account`.
    ///
    /// Returns the actions whose overlays all lived in those slots.
    pub fn drop_account(&mut self, account: &AccountId) -> Released {
        let scope = Scope::Account(account.clone());
        let keys: Vec<FieldKey> = self
            .slots
            .keys()
            .filter(|key| key.scope == scope)
            .cloned()
            .collect();

        let mut actions = Vec::new();
        for key in &keys {
            if let Some(slot) = self.slots.remove(key) {
                for overlay in slot.overlays {
                    if self.release(overlay.action, 1) {
                        actions.push(overlay.action);
                    }
                }
            }
        }
        actions.sort_unstable();
        actions.dedup();

        Released {
            changed: keys,
            actions,
        }
    }

    /// Every live slot, resolved for observers.
    pub fn fields(&self) -> BTreeMap<Field, TrackedField> {
        self.slots
            .iter()
            .map(|(key, slot)| (key.field, TrackedField::from_slot(key.field, slot)))
            .collect()
    }

    /// Decrements an action's overlay count; true when it reaches zero.
    fn release(&mut self, action: ActionId, count: usize) -> bool {
        let Some(remaining) = self.outstanding.get_mut(&action) else {
            return false;
        };
        *remaining = remaining.saturating_sub(count);
        if *remaining == 0 {
            self.outstanding.remove(&action);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn alice() -> AccountId {
        AccountId::new("0xa11ce")
    }

    fn staked() -> FieldKey {
        FieldKey::new(Field::StakedAmount, Some(&alice())).unwrap()
    }

    fn poll(value: u64, sequence: u64) -> Write {
        Write::Poll {
            value: U256::from(value),
            sequence,
            forced_by: None,
        }
    }

    fn optimistic(action: u64, op: FieldOp, included_at: u64) -> Write {
        Write::Optimistic {
            action: ActionId(action),
            kind: ActionKind::Stake,
            account: alice(),
            included_at,
            op,
        }
    }

    fn stake_event(amount: u64, sequence: u64) -> Write {
        Write::Event {
            op: FieldOp::Add(U256::from(amount)),
            sequence,
            origin: Some(Origin {
                kind: ActionKind::Stake,
                account: alice(),
            }),
        }
    }

    fn forced_poll(value: u64, sequence: u64, action: u64) -> Write {
        Write::Poll {
            value: U256::from(value),
            sequence,
            forced_by: Some(ActionId(action)),
        }
    }

    fn write(store: &mut ValueStore, write: Write) -> Applied {
        store.write(
            FieldWrite {
                key: staked(),
                write,
            },
            Instant::now(),
        )
    }

    #[test]
    fn unset_fields_read_as_zero() {
        let store = ValueStore::default();
        assert_eq!(store.read(&staked()), U256::zero());
        assert_eq!(store.tracked(&staked()).provenance, Provenance::Poll);
    }

    #[test]
    fn optimistic_overlay_is_superseded_by_matching_event() {
        let mut store = ValueStore::default();
        write(&mut store, poll(0, 3));
        write(&mut store, optimistic(1, FieldOp::Add(U256::from(100u64)), 4));
        assert_eq!(store.read(&staked()), U256::from(100u64));
        assert_eq!(store.tracked(&staked()).provenance, Provenance::Optimistic);

        let applied = write(&mut store, stake_event(100, 4));
        assert_eq!(applied.rule, Rule::Superseded);
        assert_eq!(applied.reconciled, vec![ActionId(1)]);
        assert_eq!(store.read(&staked()), U256::from(100u64));
        assert_eq!(store.tracked(&staked()).provenance, Provenance::Event);
        assert!(!store.is_outstanding(ActionId(1)));
    }

    #[test]
    fn forced_poll_lifts_every_action_it_already_includes() {
        let mut store = ValueStore::default();
        write(&mut store, poll(0, 1));
        write(&mut store, optimistic(1, FieldOp::Add(U256::from(100u64)), 5));
        write(&mut store, optimistic(2, FieldOp::Add(U256::from(50u64)), 6));
        assert_eq!(store.read(&staked()), U256::from(150u64));

        let applied = write(&mut store, forced_poll(150, 7, 1));
        assert_eq!(applied.rule, Rule::Forced);
        assert_eq!(applied.reconciled, vec![ActionId(2), ActionId(1)]);
        assert_eq!(store.read(&staked()), U256::from(150u64));
        assert_eq!(store.tracked(&staked()).provenance, Provenance::Poll);
    }

    #[test]
    fn forced_poll_keeps_overlays_of_later_transactions() {
        let mut store = ValueStore::default();
        write(&mut store, poll(0, 1));
        write(&mut store, optimistic(1, FieldOp::Add(U256::from(100u64)), 5));
        write(&mut store, optimistic(2, FieldOp::Add(U256::from(50u64)), 8));

        // Read after the first stake landed but before the second.
        let applied = write(&mut store, forced_poll(100, 7, 1));
        assert_eq!(applied.reconciled, vec![ActionId(1)]);
        assert_eq!(store.read(&staked()), U256::from(150u64));
        assert!(store.is_outstanding(ActionId(2)));
    }

    #[test]
    fn notification_confirms_the_action_included_at_its_sequence() {
        let mut store = ValueStore::default();
        write(&mut store, poll(0, 1));
        write(&mut store, optimistic(1, FieldOp::Add(U256::from(100u64)), 5));
        write(&mut store, optimistic(2, FieldOp::Add(U256::from(50u64)), 8));

        // The first stake's notification never arrived.
        let applied = write(&mut store, stake_event(50, 8));
        assert_eq!(applied.rule, Rule::Superseded);
        assert_eq!(applied.reconciled, vec![ActionId(2)]);
        assert_eq!(store.read(&staked()), U256::from(150u64));
        assert!(store.is_outstanding(ActionId(1)));
    }

    #[test]
    fn confirming_event_behind_a_newer_one_still_lands() {
        let mut store = ValueStore::default();
        write(&mut store, poll(100, 1));
        write(
            &mut store,
            Write::Optimistic {
                action: ActionId(1),
                kind: ActionKind::Withdraw,
                account: alice(),
                included_at: 9,
                op: FieldOp::Sub(U256::from(50u64)),
            },
        );
        assert_eq!(store.read(&staked()), U256::from(50u64));

        write(&mut store, stake_event(30, 10));
        assert_eq!(store.read(&staked()), U256::from(80u64));

        let withdrawn = Write::Event {
            op: FieldOp::Sub(U256::from(50u64)),
            sequence: 9,
            origin: Some(Origin {
                kind: ActionKind::Withdraw,
                account: alice(),
            }),
        };
        let applied = write(&mut store, withdrawn.clone());
        assert_eq!(applied.rule, Rule::Superseded);
        assert_eq!(applied.reconciled, vec![ActionId(1)]);
        assert_eq!(store.read(&staked()), U256::from(80u64));

        let again = write(&mut store, withdrawn);
        assert_eq!(again.rule, Rule::Stale);
        assert_eq!(store.read(&staked()), U256::from(80u64));
    }

    #[test]
    fn duplicate_event_applies_once() {
        let mut store = ValueStore::default();
        write(&mut store, stake_event(100, 7));
        let again = write(&mut store, stake_event(100, 7));

        assert_eq!(again.rule, Rule::Stale);
        assert!(!again.changed);
        assert_eq!(store.read(&staked()), U256::from(100u64));
    }

    #[test]
    fn deferred_poll_lands_after_rollback() {
        let mut store = ValueStore::default();
        write(&mut store, poll(50, 2));
        write(&mut store, optimistic(9, FieldOp::Sub(U256::from(50u64)), 3));

        let deferred = write(&mut store, poll(50, 5));
        assert_eq!(deferred.rule, Rule::Deferred);
        assert_eq!(store.read(&staked()), U256::zero());

        let released = store.resolve(ActionId(9));
        assert_eq!(released.actions, vec![ActionId(9)]);
        assert_eq!(store.read(&staked()), U256::from(50u64));
        assert_eq!(store.slot(&staked()).map(Slot::sequence), Some(5));
    }

    #[tokio::test(start_paused = true)]
    async fn global_overlays_expire_after_suppression_window() {
        let mut store = ValueStore::new(PolicyConfig {
            global_suppression_window: Duration::from_secs(15),
        });
        let total = FieldKey::global(Field::TotalStaked);
        let overlay = FieldWrite {
            key: total.clone(),
            write: optimistic(2, FieldOp::Add(U256::from(10u64)), 1),
        };
        store.write(overlay, Instant::now());

        let early = store.write(
            FieldWrite {
                key: total.clone(),
                write: poll(500, 1),
            },
            Instant::now(),
        );
        assert_eq!(early.rule, Rule::Deferred);

        tokio::time::advance(Duration::from_secs(16)).await;
        let late = store.write(
            FieldWrite {
                key: total.clone(),
                write: poll(510, 2),
            },
            Instant::now(),
        );
        assert_eq!(late.rule, Rule::SuppressionExpired);
        assert_eq!(late.reconciled, vec![ActionId(2)]);
        assert_eq!(store.read(&total), U256::from(510u64));
    }

    #[test]
    fn dropping_an_account_releases_its_actions() {
        let mut store = ValueStore::default();
        write(&mut store, optimistic(4, FieldOp::Add(U256::one()), 1));

        let released = store.drop_account(&alice());
        assert_eq!(released.actions, vec![ActionId(4)]);
        assert_eq!(released.changed, vec![staked()]);
        assert!(store.fields().is_empty());
    }
}
