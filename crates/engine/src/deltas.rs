//! Field deltas implied by notifications and by user actions.
//!
//! The optimistic delta of each action kind touches exactly the fields its
//! confirming notification derives, so the notification can supersede it.

use chain_core::{AccountId, ActionKind, EventType, Field, Notification, Scope, U256, payload};
use tracing::warn;

use crate::api::StoreSnapshot;
use crate::store::{FieldKey, FieldOp, FieldWrite, Origin, Write};

/// Event writes a notification implies for one scope.
///
/// Account scopes only take notifications about their own account.
pub fn notification_writes(notification: &Notification, scope: &Scope) -> Vec<FieldWrite> {
    if let Scope::Account(account) = scope
        && notification.account.as_ref() != Some(account)
    {
        return Vec::new();
    }

    let origin = notification
        .event_type
        .action_kind()
        .zip(notification.account.clone())
        .map(|(kind, account)| Origin { kind, account });

    let ops = match scope {
        Scope::Account(_) => account_ops(notification),
        Scope::Global => global_ops(notification),
    };

    ops.into_iter()
        .map(|(field, op)| FieldWrite {
            key: FieldKey {
                scope: scope.clone(),
                field,
            },
            write: Write::Event {
                op,
                sequence: notification.sequence,
                origin: origin.clone(),
            },
        })
        .collect()
}

fn account_ops(notification: &Notification) -> Vec<(Field, FieldOp)> {
    let amount = notification.amount(payload::AMOUNT);
    let required = |value: Option<U256>| {
        if value.is_none() {
            warn!(
                "{} #{} carries no {}; skipped",
                notification.event_type,
                notification.sequence,
                payload::AMOUNT
            );
        }
        value
    };

    match notification.event_type {
        EventType::Staked => required(amount)
            .map(|amount| {
                vec![
                    (Field::WalletBalance, FieldOp::Sub(amount)),
                    (Field::StakedAmount, FieldOp::Add(amount)),
                ]
            })
            .unwrap_or_default(),
        EventType::Withdrawn => required(amount)
            .map(|amount| {
                vec![
                    (Field::StakedAmount, FieldOp::Sub(amount)),
                    (Field::WalletBalance, FieldOp::Add(amount)),
                ]
            })
            .unwrap_or_default(),
        EventType::RewardsClaimed => required(amount)
            .map(|amount| {
                let pending = notification
                    .amount(payload::NEW_PENDING_REWARDS)
                    .unwrap_or_default();
                vec![
                    (Field::WalletBalance, FieldOp::Add(amount)),
                    (Field::PendingRewards, FieldOp::Set(pending)),
                ]
            })
            .unwrap_or_default(),
        EventType::EmergencyWithdrawn => required(amount)
            .map(|amount| {
                let penalty = notification.amount(payload::PENALTY).unwrap_or_default();
                vec![
                    (Field::StakedAmount, FieldOp::Sub(amount)),
                    (Field::WalletBalance, FieldOp::Add(amount.saturating_sub(penalty))),
                ]
            })
            .unwrap_or_default(),
        EventType::Approval => notification
            .amount(payload::VALUE)
            .map(|value| vec![(Field::Allowance, FieldOp::Set(value))])
            .unwrap_or_default(),
        EventType::RewardRateUpdated => Vec::new(),
    }
}

fn global_ops(notification: &Notification) -> Vec<(Field, FieldOp)> {
    let set = |field: Field, key: &str| {
        notification
            .amount(key)
            .map(|value| (field, FieldOp::Set(value)))
    };

    match notification.event_type {
        EventType::Staked | EventType::Withdrawn => [
            set(Field::TotalStaked, payload::NEW_TOTAL_STAKED),
            set(Field::CurrentRewardRate, payload::CURRENT_REWARD_RATE),
        ]
        .into_iter()
        .flatten()
        .collect(),
        EventType::EmergencyWithdrawn => set(Field::TotalStaked, payload::NEW_TOTAL_STAKED)
            .into_iter()
            .collect(),
        EventType::RewardRateUpdated => [
            set(Field::CurrentRewardRate, payload::NEW_RATE),
            set(Field::TotalStaked, payload::TOTAL_STAKED),
        ]
        .into_iter()
        .flatten()
        .collect(),
        EventType::RewardsClaimed | EventType::Approval => Vec::new(),
    }
}

/// Optimistic delta of an action, keyed for the acting account.
///
/// Claim and emergency withdraw size their delta from the current snapshot.
pub fn optimistic_writes(
    kind: ActionKind,
    amount: Option<U256>,
    account: &AccountId,
    snapshot: &StoreSnapshot,
) -> Vec<(FieldKey, FieldOp)> {
    let own = |field: Field| FieldKey {
        scope: Scope::Account(account.clone()),
        field,
    };
    let total = FieldKey::global(Field::TotalStaked);
    let current = |field: Field| {
        if snapshot.account.as_ref() == Some(account) {
            snapshot.value(field)
        } else {
            U256::zero()
        }
    };
    let amount = amount.unwrap_or_default();

    match kind {
        ActionKind::Stake => vec![
            (own(Field::WalletBalance), FieldOp::Sub(amount)),
            (own(Field::StakedAmount), FieldOp::Add(amount)),
            (total, FieldOp::Add(amount)),
        ],
        ActionKind::Withdraw => vec![
            (own(Field::StakedAmount), FieldOp::Sub(amount)),
            (own(Field::WalletBalance), FieldOp::Add(amount)),
            (total, FieldOp::Sub(amount)),
        ],
        ActionKind::Claim => vec![
            (
                own(Field::WalletBalance),
                FieldOp::Add(current(Field::PendingRewards)),
            ),
            (own(Field::PendingRewards), FieldOp::Set(U256::zero())),
        ],
        ActionKind::EmergencyWithdraw => {
            let staked = current(Field::StakedAmount);
            let percent = snapshot.value(Field::EmergencyWithdrawPenalty);
            let penalty = staked.saturating_mul(percent) / U256::from(100u64);
            vec![
                (own(Field::StakedAmount), FieldOp::Sub(staked)),
                (
                    own(Field::WalletBalance),
                    FieldOp::Add(staked.saturating_sub(penalty)),
                ),
                (total, FieldOp::Sub(staked)),
            ]
        }
        ActionKind::Approve => vec![(own(Field::Allowance), FieldOp::Set(amount))],
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chain_core::ScopeKind;

    use super::*;
    use crate::store::{Provenance, TrackedField};

    fn alice() -> AccountId {
        AccountId::new("0xa11ce")
    }

    fn notification(
        event_type: EventType,
        account: Option<AccountId>,
        payload: &[(&str, u64)],
    ) -> Notification {
        Notification {
            event_type,
            account,
            payload: payload
                .iter()
                .map(|(k, v)| (k.to_string(), U256::from(*v)))
                .collect::<BTreeMap<_, _>>(),
            sequence: 12,
        }
    }

    fn ops(writes: &[FieldWrite]) -> Vec<(Field, FieldOp)> {
        writes
            .iter()
            .map(|w| match &w.write {
                Write::Event { op, .. } => (w.key.field, *op),
                other => panic!("unexpected write {:?}", other),
            })
            .collect()
    }

    #[test]
    fn stake_notification_splits_across_scopes() {
        let staked = notification(
            EventType::Staked,
            Some(alice()),
            &[
                (payload::AMOUNT, 100),
                (payload::NEW_TOTAL_STAKED, 900),
                (payload::CURRENT_REWARD_RATE, 950),
            ],
        );

        let account = notification_writes(&staked, &Scope::Account(alice()));
        assert_eq!(
            ops(&account),
            vec![
                (Field::WalletBalance, FieldOp::Sub(U256::from(100u64))),
                (Field::StakedAmount, FieldOp::Add(U256::from(100u64))),
            ]
        );

        let global = notification_writes(&staked, &Scope::Global);
        assert_eq!(
            ops(&global),
            vec![
                (Field::TotalStaked, FieldOp::Set(U256::from(900u64))),
                (Field::CurrentRewardRate, FieldOp::Set(U256::from(950u64))),
            ]
        );
        assert!(matches!(
            &global[0].write,
            Write::Event { origin: Some(Origin { kind: ActionKind::Stake, .. }), sequence: 12, .. }
        ));
    }

    #[test]
    fn other_accounts_are_ignored_by_account_scope() {
        let staked = notification(
            EventType::Staked,
            Some(AccountId::new("0xb0b")),
            &[(payload::AMOUNT, 5), (payload::NEW_TOTAL_STAKED, 5)],
        );
        assert!(notification_writes(&staked, &Scope::Account(alice())).is_empty());
        assert_eq!(notification_writes(&staked, &Scope::Global).len(), 1);
    }

    #[test]
    fn emergency_withdraw_credits_amount_minus_penalty() {
        let withdrawn = notification(
            EventType::EmergencyWithdrawn,
            Some(alice()),
            &[(payload::AMOUNT, 100), (payload::PENALTY, 5)],
        );
        let writes = notification_writes(&withdrawn, &Scope::Account(alice()));
        assert_eq!(
            ops(&writes)[1],
            (Field::WalletBalance, FieldOp::Add(U256::from(95u64)))
        );
    }

    #[test]
    fn rate_updates_touch_global_fields_only() {
        let updated = notification(
            EventType::RewardRateUpdated,
            None,
            &[(payload::NEW_RATE, 40), (payload::TOTAL_STAKED, 7)],
        );
        let writes = notification_writes(&updated, &Scope::Global);
        assert_eq!(writes.len(), 2);
        assert!(matches!(&writes[0].write, Write::Event { origin: None, .. }));
    }

    #[test]
    fn emergency_delta_uses_current_stake_and_penalty() {
        let mut snapshot = StoreSnapshot {
            account: Some(alice()),
            ..StoreSnapshot::default()
        };
        for (field, value) in [
            (Field::StakedAmount, 200u64),
            (Field::EmergencyWithdrawPenalty, 5),
        ] {
            snapshot.fields.insert(
                field,
                TrackedField {
                    field,
                    scope: field.scope_kind(),
                    value: U256::from(value),
                    provenance: Provenance::Poll,
                    sequence: 1,
                },
            );
        }

        let writes = optimistic_writes(ActionKind::EmergencyWithdraw, None, &alice(), &snapshot);
        let by_field: Vec<(Field, ScopeKind, FieldOp)> = writes
            .iter()
            .map(|(key, op)| (key.field, key.scope.kind(), *op))
            .collect();
        assert_eq!(
            by_field,
            vec![
                (Field::StakedAmount, ScopeKind::Account, FieldOp::Sub(U256::from(200u64))),
                (Field::WalletBalance, ScopeKind::Account, FieldOp::Add(U256::from(190u64))),
                (Field::TotalStaked, ScopeKind::Global, FieldOp::Sub(U256::from(200u64))),
            ]
        );
    }
}
