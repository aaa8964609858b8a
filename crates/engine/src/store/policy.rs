//! Reconciliation policy.
//!
//! A pure function deciding what a candidate write does to a slot. Rules are
//! evaluated in order:
//!
//! 1. Optimistic writes are always layered on top of the slot, unless ground
//!    truth already reflects the action's transaction.
//! 2. An event confirming an overlay's (action kind, account) supersedes that
//!    overlay; its delta reaches the base only if the base lacks it.
//! 3. Any other event is accepted only if the base lacks it: absolute values
//!    need a sequence above the stored one, relative deltas must not have been
//!    folded in yet.
//! 4. A poll is deferred while overlays are outstanding. A poll forced for an
//!    action applies, and lifts every overlay whose transaction it includes.
//! 5. Global overlays older than the suppression window no longer hold polls
//!    back; other accounts mutate global fields too.

use chain_core::ScopeKind;
use tokio::time::Instant;

use super::{Slot, Write};
use crate::engine::PolicyConfig;

/// Which rule produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rule {
    /// Layered as an optimistic overlay.
    Optimistic,
    /// The slot already reflects the action's transaction.
    Observed,
    /// A confirming event replaced an overlay.
    Superseded,
    /// Newer ground truth replaced the base.
    Newer,
    /// Older than, or equal to, what the slot already holds.
    Stale,
    /// Held back by outstanding overlays.
    Deferred,
    /// A forced poll lifted its action's overlays.
    Forced,
    /// Global overlays outlived the suppression window.
    SuppressionExpired,
}

/// What happens to the slot's base value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseUpdate {
    Keep,
    Apply,
    Defer,
    Overlay,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub rule: Rule,
    /// Indices of overlays removed before the base update.
    pub lift: Vec<usize>,
    pub base: BaseUpdate,
}

impl Decision {
    fn new(rule: Rule, lift: Vec<usize>, base: BaseUpdate) -> Self {
        Self { rule, lift, base }
    }
}

pub fn decide(
    slot: &Slot,
    write: &Write,
    scope: ScopeKind,
    now: Instant,
    config: &PolicyConfig,
) -> Decision {
    match write {
        Write::Optimistic { included_at, .. } => {
            if slot.reflects(*included_at) {
                Decision::new(Rule::Observed, vec![], BaseUpdate::Keep)
            } else {
                Decision::new(Rule::Optimistic, vec![], BaseUpdate::Overlay)
            }
        }

        Write::Event {
            op,
            sequence,
            origin,
        } => {
            let confirmed = origin.as_ref().and_then(|origin| {
                slot.overlays
                    .iter()
                    .position(|overlay| overlay.confirmed_by(origin, *sequence))
            });
            let accepted = slot.accepts(op, *sequence);

            // An absolute value already includes every transaction before it.
            let lift: Vec<usize> = if accepted && op.is_absolute() {
                reflected(slot, *sequence, |index| Some(index) == confirmed)
            } else {
                confirmed.into_iter().collect()
            };
            let base = if accepted {
                BaseUpdate::Apply
            } else {
                BaseUpdate::Keep
            };

            let rule = match (confirmed, accepted) {
                (Some(_), _) => Rule::Superseded,
                (None, true) => Rule::Newer,
                (None, false) => Rule::Stale,
            };
            Decision::new(rule, lift, base)
        }

        Write::Poll {
            sequence,
            forced_by,
            ..
        } => {
            let mut forced = false;
            let mut expired = false;
            let triggers: Vec<usize> = slot
                .overlays
                .iter()
                .enumerate()
                .filter(|(_, overlay)| {
                    if Some(overlay.action) == *forced_by {
                        forced = true;
                        true
                    } else if scope == ScopeKind::Global
                        && now.saturating_duration_since(overlay.applied_at)
                            >= config.global_suppression_window
                    {
                        expired = true;
                        true
                    } else {
                        false
                    }
                })
                .map(|(index, _)| index)
                .collect();

            if triggers.is_empty() && !slot.overlays.is_empty() {
                return Decision::new(Rule::Deferred, vec![], BaseUpdate::Defer);
            }
            if *sequence < slot.sequence {
                return Decision::new(Rule::Stale, vec![], BaseUpdate::Keep);
            }

            // The poll replaces the base, so every overlay whose transaction it
            // already includes goes with it; later ones stay on top.
            let lift = reflected(slot, *sequence, |index| triggers.contains(&index));
            let rule = if forced {
                Rule::Forced
            } else if expired {
                Rule::SuppressionExpired
            } else {
                Rule::Newer
            };
            Decision::new(rule, lift, BaseUpdate::Apply)
        }
    }
}

/// Overlays included at or before `sequence`, plus any `also` selects.
fn reflected(slot: &Slot, sequence: u64, also: impl Fn(usize) -> bool) -> Vec<usize> {
    slot.overlays
        .iter()
        .enumerate()
        .filter(|(index, overlay)| overlay.included_at <= sequence || also(*index))
        .map(|(index, _)| index)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chain_core::{AccountId, ActionKind, U256};

    use super::*;
    use crate::store::{ActionId, FieldOp, Origin, Overlay};

    fn alice() -> AccountId {
        AccountId::new("0xa11ce")
    }

    /// A slot whose base came from a poll at `sequence`.
    fn slot_with(sequence: u64, overlays: Vec<Overlay>) -> Slot {
        Slot {
            sequence,
            floor: sequence,
            overlays,
            ..Slot::default()
        }
    }

    fn overlay(action: u64, kind: ActionKind, included_at: u64, applied_at: Instant) -> Overlay {
        Overlay {
            action: ActionId(action),
            kind,
            account: alice(),
            included_at,
            op: FieldOp::Add(U256::from(10u64)),
            applied_at,
        }
    }

    fn event(sequence: u64, kind: Option<ActionKind>) -> Write {
        Write::Event {
            op: FieldOp::Add(U256::from(10u64)),
            sequence,
            origin: kind.map(|kind| Origin {
                kind,
                account: alice(),
            }),
        }
    }

    fn poll(sequence: u64, forced_by: Option<u64>) -> Write {
        Write::Poll {
            value: U256::from(1u64),
            sequence,
            forced_by: forced_by.map(ActionId),
        }
    }

    fn decide_now(slot: &Slot, write: &Write, scope: ScopeKind) -> Decision {
        decide(slot, write, scope, Instant::now(), &PolicyConfig::default())
    }

    #[test]
    fn optimistic_writes_are_layered() {
        let write = Write::Optimistic {
            action: ActionId(1),
            kind: ActionKind::Stake,
            account: alice(),
            included_at: 10,
            op: FieldOp::Add(U256::one()),
        };

        let fresh = decide_now(&slot_with(4, vec![]), &write, ScopeKind::Account);
        assert_eq!(fresh.base, BaseUpdate::Overlay);

        let observed = decide_now(&slot_with(12, vec![]), &write, ScopeKind::Account);
        assert_eq!(observed.rule, Rule::Observed);
        assert_eq!(observed.base, BaseUpdate::Keep);
    }

    #[test]
    fn matching_event_supersedes_overlay() {
        let now = Instant::now();
        let slot = slot_with(3, vec![overlay(1, ActionKind::Stake, 5, now)]);

        let decision = decide_now(&slot, &event(5, Some(ActionKind::Stake)), ScopeKind::Account);
        assert_eq!(decision, Decision::new(Rule::Superseded, vec![0], BaseUpdate::Apply));

        // A poll already carried the base past the event.
        let ahead = slot_with(8, vec![overlay(1, ActionKind::Stake, 5, now)]);
        let decision = decide_now(&ahead, &event(5, Some(ActionKind::Stake)), ScopeKind::Account);
        assert_eq!(decision, Decision::new(Rule::Superseded, vec![0], BaseUpdate::Keep));
    }

    #[test]
    fn events_from_other_kinds_do_not_supersede() {
        let slot = slot_with(3, vec![overlay(1, ActionKind::Stake, 5, Instant::now())]);

        let decision = decide_now(&slot, &event(6, Some(ActionKind::Withdraw)), ScopeKind::Account);
        assert_eq!(decision.rule, Rule::Newer);
        assert!(decision.lift.is_empty());

        // Emitted before the action's transaction was included.
        let early = decide_now(&slot, &event(4, Some(ActionKind::Stake)), ScopeKind::Account);
        assert_eq!(early.rule, Rule::Newer);
        assert!(early.lift.is_empty());
    }

    #[test]
    fn events_confirm_only_the_overlay_included_at_their_sequence() {
        let now = Instant::now();
        let slot = slot_with(
            1,
            vec![
                overlay(1, ActionKind::Stake, 5, now),
                overlay(2, ActionKind::Stake, 8, now),
            ],
        );

        let decision = decide_now(&slot, &event(8, Some(ActionKind::Stake)), ScopeKind::Account);
        assert_eq!(decision, Decision::new(Rule::Superseded, vec![1], BaseUpdate::Apply));
    }

    #[test]
    fn relative_deltas_apply_once_in_any_order() {
        let mut slot = slot_with(1, vec![]);
        slot.sequence = 10;
        slot.folded.insert(10);

        let late = decide_now(&slot, &event(9, None), ScopeKind::Account);
        assert_eq!(late.rule, Rule::Newer);
        assert_eq!(late.base, BaseUpdate::Apply);

        let repeat = decide_now(&slot, &event(10, None), ScopeKind::Account);
        assert_eq!(repeat.rule, Rule::Stale);

        let absolute = Write::Event {
            op: FieldOp::Set(U256::from(3u64)),
            sequence: 9,
            origin: None,
        };
        assert_eq!(decide_now(&slot, &absolute, ScopeKind::Account).rule, Rule::Stale);
    }

    #[test]
    fn unrelated_events_need_a_newer_sequence() {
        let slot = slot_with(7, vec![]);
        assert_eq!(decide_now(&slot, &event(7, None), ScopeKind::Global).rule, Rule::Stale);
        assert_eq!(decide_now(&slot, &event(8, None), ScopeKind::Global).rule, Rule::Newer);
    }

    #[test]
    fn polls_wait_for_outstanding_overlays() {
        let slot = slot_with(3, vec![overlay(1, ActionKind::Stake, 5, Instant::now())]);

        let decision = decide_now(&slot, &poll(9, None), ScopeKind::Account);
        assert_eq!(decision, Decision::new(Rule::Deferred, vec![], BaseUpdate::Defer));
    }

    #[test]
    fn forced_polls_lift_every_overlay_they_include() {
        let now = Instant::now();
        let slot = slot_with(
            3,
            vec![
                overlay(1, ActionKind::Stake, 5, now),
                overlay(2, ActionKind::Stake, 6, now),
                overlay(3, ActionKind::Stake, 12, now),
            ],
        );

        let decision = decide_now(&slot, &poll(9, Some(2)), ScopeKind::Account);
        assert_eq!(decision, Decision::new(Rule::Forced, vec![0, 1], BaseUpdate::Apply));

        // Forced polls never rewind a base that moved past them.
        let ahead = slot_with(10, vec![overlay(2, ActionKind::Stake, 6, now)]);
        let decision = decide_now(&ahead, &poll(9, Some(2)), ScopeKind::Account);
        assert_eq!(decision, Decision::new(Rule::Stale, vec![], BaseUpdate::Keep));
    }

    #[test]
    fn older_polls_are_discarded() {
        let slot = slot_with(9, vec![]);
        assert_eq!(decide_now(&slot, &poll(8, None), ScopeKind::Account).rule, Rule::Stale);
        assert_eq!(decide_now(&slot, &poll(9, None), ScopeKind::Account).rule, Rule::Newer);
    }

    #[test]
    fn suppression_window_applies_to_global_fields_only() {
        let config = PolicyConfig {
            global_suppression_window: Duration::from_secs(15),
        };
        let applied_at = Instant::now();
        let later = applied_at + Duration::from_secs(20);
        let slot = slot_with(3, vec![overlay(1, ActionKind::Stake, 5, applied_at)]);

        let global = decide(&slot, &poll(9, None), ScopeKind::Global, later, &config);
        assert_eq!(global.rule, Rule::SuppressionExpired);
        assert_eq!(global.lift, vec![0]);

        let account = decide(&slot, &poll(9, None), ScopeKind::Account, later, &config);
        assert_eq!(account.rule, Rule::Deferred);
    }
}
