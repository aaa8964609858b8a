//! Mock staking chain for testing.
//!
//! Simulates the staking contract in-memory, including its event log, and
//! exposes fault-injection knobs so engine tests can reproduce failed reads,
//! rejected or reverted transactions, lost receipts, and missing or duplicated
//! notifications.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use primitive_types::U256;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::traits::{
    ContractReader, NotificationSource, ReadError, StakingChain, SubmitError, SubscribeError,
    TransactionSubmitter,
};
use crate::types::{
    AccountId, ActionKind, ContractCall, EventType, Field, FieldValues, Notification, Receipt,
    ReceiptStatus, StartFrom, Subscription, SubscriptionId, TransactionId, payload,
};

const SUBSCRIPTION_CAPACITY: usize = 256;

/// One token with 18 decimals.
pub fn tokens(whole: u64) -> U256 {
    U256::from(whole) * U256::exp10(18)
}

#[derive(Debug, Default, Clone)]
struct Ledger {
    balance: U256,
    allowance: U256,
    staked: U256,
    pending_rewards: U256,
    last_stake: U256,
}

#[derive(Debug, Clone)]
struct Pool {
    total_staked: U256,
    reward_rate: U256,
    initial_apr: U256,
    min_lock_duration: U256,
    apr_reduction_per_thousand: U256,
    emergency_withdraw_penalty: U256,
    total_rewards: U256,
    paused: bool,
}

impl Default for Pool {
    fn default() -> Self {
        Self {
            total_staked: U256::zero(),
            reward_rate: U256::from(1_000u64),
            initial_apr: U256::from(1_000u64),
            min_lock_duration: U256::from(86_400u64),
            apr_reduction_per_thousand: U256::from(50u64),
            emergency_withdraw_penalty: U256::from(5u64),
            total_rewards: U256::zero(),
            paused: false,
        }
    }
}

impl Pool {
    /// The rate shrinks by a fixed step for every thousand whole tokens staked.
    fn rate_for(&self, total_staked: U256) -> U256 {
        let thousands = total_staked / tokens(1_000);
        self.initial_apr
            .saturating_sub(thousands.saturating_mul(self.apr_reduction_per_thousand))
    }
}

#[derive(Debug, Default)]
struct Faults {
    failing_reads: u32,
    reject_next: Option<String>,
    reverts: HashMap<ActionKind, String>,
    receipt_timeouts: u32,
    muted: HashSet<EventType>,
    duplicate: bool,
    receipt_delay: Option<Duration>,
}

struct Subscriber {
    id: SubscriptionId,
    event_type: EventType,
    sender: mpsc::Sender<Notification>,
}

#[derive(Default)]
struct MockState {
    sequence: u64,
    accounts: HashMap<AccountId, Ledger>,
    pool: Pool,
    next_tx: u64,
    pending: HashMap<TransactionId, (AccountId, ContractCall)>,
    submitted: Vec<ContractCall>,
    next_subscription: u64,
    subscribers: Vec<Subscriber>,
    history: Vec<Notification>,
    faults: Faults,
    reads: u64,
}

impl MockState {
    fn ledger(&mut self, account: &AccountId) -> &mut Ledger {
        self.accounts.entry(account.clone()).or_default()
    }

    fn next_tx_id(&mut self) -> TransactionId {
        self.next_tx += 1;
        TransactionId::from_bytes(self.next_tx.to_be_bytes().to_vec())
    }

    fn read_field(&self, account: Option<&AccountId>, field: Field) -> U256 {
        let ledger = account
            .and_then(|a| self.accounts.get(a))
            .cloned()
            .unwrap_or_default();
        let flag = |b: bool| if b { U256::one() } else { U256::zero() };

        match field {
            Field::WalletBalance => ledger.balance,
            Field::Allowance => ledger.allowance,
            Field::StakedAmount => ledger.staked,
            Field::PendingRewards => ledger.pending_rewards,
            Field::LastStakeTimestamp => ledger.last_stake,
            Field::TimeUntilUnlock => U256::zero(),
            Field::CanWithdraw => flag(!ledger.staked.is_zero()),
            Field::TotalStaked => self.pool.total_staked,
            Field::CurrentRewardRate => self.pool.reward_rate,
            Field::InitialApr => self.pool.initial_apr,
            Field::MinLockDuration => self.pool.min_lock_duration,
            Field::AprReductionPerThousand => self.pool.apr_reduction_per_thousand,
            Field::EmergencyWithdrawPenalty => self.pool.emergency_withdraw_penalty,
            Field::TotalRewards => self.pool.total_rewards,
            Field::Paused => flag(self.pool.paused),
        }
    }

    /// Applies a call to the contract state, returning the events it emits.
    fn execute(
        &mut self,
        account: &AccountId,
        call: &ContractCall,
    ) -> Result<Vec<(EventType, Option<AccountId>, Vec<(&'static str, U256)>)>, String> {
        if let Some(reason) = self.faults.reverts.remove(&call.kind) {
            return Err(reason);
        }

        let amount = call.amount.unwrap_or_default();
        let who = Some(account.clone());
        let old_rate = self.pool.reward_rate;
        let mut events = Vec::new();

        match call.kind {
            ActionKind::Approve => {
                self.ledger(account).allowance = amount;
                events.push((EventType::Approval, who, vec![(payload::VALUE, amount)]));
                return Ok(events);
            }
            ActionKind::Stake => {
                let sequence = U256::from(self.sequence + 1);
                let ledger = self.ledger(account);
                if ledger.allowance < amount {
                    return Err("ERC20: insufficient allowance".into());
                }
                if ledger.balance < amount {
                    return Err("ERC20: transfer amount exceeds balance".into());
                }
                ledger.allowance -= amount;
                ledger.balance -= amount;
                ledger.staked += amount;
                ledger.last_stake = sequence;
                self.pool.total_staked += amount;
                self.pool.reward_rate = self.pool.rate_for(self.pool.total_staked);
                events.push((
                    EventType::Staked,
                    who,
                    vec![
                        (payload::AMOUNT, amount),
                        (payload::NEW_TOTAL_STAKED, self.pool.total_staked),
                        (payload::CURRENT_REWARD_RATE, self.pool.reward_rate),
                    ],
                ));
            }
            ActionKind::Withdraw => {
                let ledger = self.ledger(account);
                if ledger.staked < amount {
                    return Err("insufficient staked balance".into());
                }
                ledger.staked -= amount;
                ledger.balance += amount;
                self.pool.total_staked = self.pool.total_staked.saturating_sub(amount);
                self.pool.reward_rate = self.pool.rate_for(self.pool.total_staked);
                events.push((
                    EventType::Withdrawn,
                    who,
                    vec![
                        (payload::AMOUNT, amount),
                        (payload::NEW_TOTAL_STAKED, self.pool.total_staked),
                        (payload::CURRENT_REWARD_RATE, self.pool.reward_rate),
                    ],
                ));
            }
            ActionKind::Claim => {
                let ledger = self.ledger(account);
                let rewards = ledger.pending_rewards;
                if rewards.is_zero() {
                    return Err("no rewards to claim".into());
                }
                ledger.pending_rewards = U256::zero();
                ledger.balance += rewards;
                self.pool.total_rewards += rewards;
                events.push((
                    EventType::RewardsClaimed,
                    who,
                    vec![
                        (payload::AMOUNT, rewards),
                        (payload::NEW_PENDING_REWARDS, U256::zero()),
                    ],
                ));
            }
            ActionKind::EmergencyWithdraw => {
                let percent = self.pool.emergency_withdraw_penalty;
                let ledger = self.ledger(account);
                let staked = ledger.staked;
                if staked.is_zero() {
                    return Err("nothing staked".into());
                }
                let penalty = staked * percent / U256::from(100u64);
                ledger.staked = U256::zero();
                ledger.balance += staked - penalty;
                self.pool.total_staked = self.pool.total_staked.saturating_sub(staked);
                self.pool.reward_rate = self.pool.rate_for(self.pool.total_staked);
                events.push((
                    EventType::EmergencyWithdrawn,
                    who,
                    vec![
                        (payload::AMOUNT, staked),
                        (payload::PENALTY, penalty),
                        (payload::NEW_TOTAL_STAKED, self.pool.total_staked),
                    ],
                ));
            }
        }

        if self.pool.reward_rate != old_rate {
            events.push((
                EventType::RewardRateUpdated,
                None,
                vec![
                    (payload::OLD_RATE, old_rate),
                    (payload::NEW_RATE, self.pool.reward_rate),
                    (payload::TOTAL_STAKED, self.pool.total_staked),
                ],
            ));
        }

        Ok(events)
    }

    fn emit(&mut self, event_type: EventType, account: Option<AccountId>, fields: Vec<(&str, U256)>) {
        self.sequence += 1;
        let notification = Notification {
            event_type,
            account,
            payload: fields
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            sequence: self.sequence,
        };
        self.history.push(notification.clone());

        if self.faults.muted.contains(&event_type) {
            trace!("mock: {} #{} muted", event_type, notification.sequence);
            return;
        }

        let copies = if self.faults.duplicate { 2 } else { 1 };
        self.subscribers.retain(|s| !s.sender.is_closed());
        for subscriber in self
            .subscribers
            .iter()
            .filter(|s| s.event_type == event_type)
        {
            for _ in 0..copies {
                if subscriber.sender.try_send(notification.clone()).is_err() {
                    debug!("mock: subscriber {:?} lagging, notification dropped", subscriber.id);
                }
            }
        }
    }

    fn run(&mut self, account: &AccountId, call: &ContractCall, tx: TransactionId) -> Receipt {
        match self.execute(account, call) {
            Ok(events) => {
                let included_at = self.sequence + 1;
                for (event_type, who, fields) in events {
                    self.emit(event_type, who, fields);
                }
                Receipt {
                    transaction_id: tx,
                    status: ReceiptStatus::Success,
                    sequence: included_at,
                }
            }
            Err(reason) => Receipt {
                transaction_id: tx,
                status: ReceiptStatus::Reverted { reason },
                sequence: self.sequence,
            },
        }
    }
}

/// In-memory staking contract.
///
/// Cloning shares the same underlying contract.
#[derive(Clone, Default)]
pub struct MockStakingChain {
    state: Arc<Mutex<MockState>>,
}

impl MockStakingChain {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------------
    // Contract setup
    // ------------------------------------------------------------------------

    /// Credit wallet tokens to an account.
    pub fn fund(&self, account: &AccountId, amount: U256) {
        self.lock().ledger(account).balance += amount;
    }

    pub fn set_allowance(&self, account: &AccountId, amount: U256) {
        self.lock().ledger(account).allowance = amount;
    }

    /// Accrue rewards for an account.
    pub fn set_pending_rewards(&self, account: &AccountId, amount: U256) {
        self.lock().ledger(account).pending_rewards = amount;
    }

    /// Executes a call for another account immediately (third-party activity).
    pub fn external_call(&self, account: &AccountId, call: ContractCall) -> Receipt {
        let mut state = self.lock();
        let tx = state.next_tx_id();
        state.run(account, &call, tx)
    }

    // ------------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------------

    pub fn fail_next_reads(&self, count: u32) {
        self.lock().faults.failing_reads = count;
    }

    pub fn reject_next_submission(&self, reason: impl Into<String>) {
        self.lock().faults.reject_next = Some(reason.into());
    }

    /// The next executed call of `kind` reverts with `reason`.
    pub fn revert_next(&self, kind: ActionKind, reason: impl Into<String>) {
        self.lock().faults.reverts.insert(kind, reason.into());
    }

    /// The next `count` receipt requests time out without executing the call.
    pub fn time_out_next_receipts(&self, count: u32) {
        self.lock().faults.receipt_timeouts = count;
    }

    pub fn set_receipt_delay(&self, delay: Option<Duration>) {
        self.lock().faults.receipt_delay = delay;
    }

    /// Stop delivering an event type (it is still recorded in the log).
    pub fn mute(&self, event_type: EventType) {
        self.lock().faults.muted.insert(event_type);
    }

    pub fn unmute(&self, event_type: EventType) {
        self.lock().faults.muted.remove(&event_type);
    }

    /// Deliver every notification twice.
    pub fn duplicate_notifications(&self, enabled: bool) {
        self.lock().faults.duplicate = enabled;
    }

    /// Drop every live subscription, ending their streams.
    pub fn drop_subscriptions(&self) {
        self.lock().subscribers.clear();
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    pub fn staked_of(&self, account: &AccountId) -> U256 {
        self.lock().read_field(Some(account), Field::StakedAmount)
    }

    pub fn balance_of(&self, account: &AccountId) -> U256 {
        self.lock().read_field(Some(account), Field::WalletBalance)
    }

    pub fn allowance_of(&self, account: &AccountId) -> U256 {
        self.lock().read_field(Some(account), Field::Allowance)
    }

    pub fn total_staked(&self) -> U256 {
        self.lock().pool.total_staked
    }

    /// Calls submitted through [`TransactionSubmitter::submit`], in order.
    pub fn submitted_calls(&self) -> Vec<ContractCall> {
        self.lock().submitted.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        let mut state = self.lock();
        state.subscribers.retain(|s| !s.sender.is_closed());
        state.subscribers.len()
    }

    pub fn read_count(&self) -> u64 {
        self.lock().reads
    }
}

#[async_trait]
impl ContractReader for MockStakingChain {
    async fn read(
        &self,
        account: Option<&AccountId>,
        fields: &[Field],
    ) -> Result<FieldValues, ReadError> {
        let mut state = self.lock();
        state.reads += 1;

        if state.faults.failing_reads > 0 {
            state.faults.failing_reads -= 1;
            return Err(ReadError::Transient("mock: injected read failure".into()));
        }

        if account.is_none()
            && fields
                .iter()
                .any(|f| f.scope_kind() == crate::types::ScopeKind::Account)
        {
            return Err(ReadError::MissingAccount);
        }

        Ok(FieldValues {
            sequence: state.sequence,
            values: fields
                .iter()
                .map(|&f| (f, state.read_field(account, f)))
                .collect(),
        })
    }
}

#[async_trait]
impl TransactionSubmitter for MockStakingChain {
    async fn submit(
        &self,
        account: &AccountId,
        call: &ContractCall,
    ) -> Result<TransactionId, SubmitError> {
        let mut state = self.lock();
        if let Some(reason) = state.faults.reject_next.take() {
            return Err(SubmitError::Rejected(reason));
        }

        let tx = state.next_tx_id();
        state.submitted.push(call.clone());
        state
            .pending
            .insert(tx.clone(), (account.clone(), call.clone()));
        debug!("mock: {} submitted as {}", call.kind, tx);
        Ok(tx)
    }

    async fn await_receipt(&self, tx: &TransactionId) -> Result<Receipt, SubmitError> {
        let delay = self.lock().faults.receipt_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if state.faults.receipt_timeouts > 0 {
            state.faults.receipt_timeouts -= 1;
            return Err(SubmitError::ReceiptTimeout(tx.clone()));
        }

        let (account, call) = state
            .pending
            .remove(tx)
            .ok_or_else(|| SubmitError::Transport(format!("unknown transaction {}", tx)))?;
        Ok(state.run(&account, &call, tx.clone()))
    }
}

#[async_trait]
impl NotificationSource for MockStakingChain {
    async fn subscribe(
        &self,
        event_type: EventType,
        from: StartFrom,
    ) -> Result<Subscription, SubscribeError> {
        let mut state = self.lock();
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_CAPACITY);

        if let StartFrom::Sequence(since) = from {
            for past in state
                .history
                .iter()
                .filter(|n| n.event_type == event_type && n.sequence >= since)
            {
                let _ = sender.try_send(past.clone());
            }
        }

        state.next_subscription += 1;
        let id = SubscriptionId(state.next_subscription);
        state.subscribers.push(Subscriber {
            id,
            event_type,
            sender,
        });
        Ok(Subscription { id, receiver })
    }

    async fn unsubscribe(&self, id: SubscriptionId) {
        self.lock().subscribers.retain(|s| s.id != id);
    }
}

impl StakingChain for MockStakingChain {
    fn name(&self) -> &str {
        "MockStaking"
    }

    fn network(&self) -> &str {
        "mock-network"
    }
}
