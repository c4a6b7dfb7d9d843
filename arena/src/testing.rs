//! In-memory ledger for unit tests.

use crate::error::{Error, Result};
use crate::ledger::{Ledger, LedgerCall, Receipt};
use crate::types::{ContestRef, OutcomeKind, StakePlaced};
use crate::utils::units;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use web3::futures::channel::mpsc::{unbounded, UnboundedSender};
use web3::futures::stream::{BoxStream, StreamExt};
use web3::types::{Address, H256, U256};

/// What the next `send` does.
#[derive(Debug, Clone)]
pub enum SendScript {
    /// Broadcast and mine successfully.
    Mined,
    /// Broadcast, then revert.
    Reverted,
    /// Broadcast but never mined.
    Pending,
    /// Refused by the signer with the given message.
    Refused(String),
}

#[derive(Default)]
struct State {
    totals: HashMap<(ContestRef, OutcomeKind), U256>,
    stakes: HashMap<(Address, ContestRef, OutcomeKind), U256>,
    claimable: HashMap<(Address, String), U256>,
    owner_rewards: HashMap<(ContestRef, OutcomeKind), U256>,
    winners: HashSet<String>,
    balances: HashMap<Address, U256>,
    scripts: VecDeque<SendScript>,
    receipts: HashMap<H256, Receipt>,
    sent: Vec<LedgerCall>,
    fail_reads: bool,
    read_delay: Option<Duration>,
    subscribers: Vec<UnboundedSender<StakePlaced>>,
}

pub struct MockLedger {
    configured: bool,
    state: Mutex<State>,
    reads: AtomicUsize,
    reward_reads: AtomicUsize,
    nonce: AtomicUsize,
}

pub fn user(n: u8) -> Address {
    Address::repeat_byte(n)
}

impl MockLedger {
    pub fn new() -> Self {
        Self {
            configured: true,
            state: Mutex::new(State::default()),
            reads: AtomicUsize::new(0),
            reward_reads: AtomicUsize::new(0),
            nonce: AtomicUsize::new(0),
        }
    }

    pub fn unconfigured() -> Self {
        Self {
            configured: false,
            ..Self::new()
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn set_total(&self, contest: &ContestRef, outcome: OutcomeKind, amount: U256) {
        self.with(|s| s.totals.insert((contest.clone(), outcome), amount));
    }

    pub fn set_claimable(&self, user: Address, contest_id: &str, amount: U256) {
        self.with(|s| s.claimable.insert((user, contest_id.to_string()), amount));
    }

    pub fn set_owner_reward(&self, contest: &ContestRef, outcome: OutcomeKind, amount: U256) {
        self.with(|s| s.owner_rewards.insert((contest.clone(), outcome), amount));
    }

    pub fn set_winners_set(&self, contest_id: &str) {
        self.with(|s| s.winners.insert(contest_id.to_string()));
    }

    pub fn set_balance(&self, user: Address, amount: U256) {
        self.with(|s| s.balances.insert(user, amount));
    }

    pub fn fail_reads(&self, fail: bool) {
        self.with(|s| s.fail_reads = fail);
    }

    pub fn read_delay(&self, delay: Duration) {
        self.with(|s| s.read_delay = Some(delay));
    }

    pub fn script(&self, script: SendScript) {
        self.with(|s| s.scripts.push_back(script));
    }

    /// Number of `total_staked` reads issued.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of claimable and owner reward reads issued.
    pub fn reward_reads(&self) -> usize {
        self.reward_reads.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<LedgerCall> {
        self.with(|s| s.sent.clone())
    }

    /// Deliver a notification to every stream handed out so far.
    pub fn emit(&self, event: StakePlaced) {
        self.with(|s| s.subscribers.retain(|tx| tx.unbounded_send(event.clone()).is_ok()));
    }

    /// Apply a mined call to the in-memory state.
    fn apply(state: &mut State, call: &LedgerCall) {
        match call {
            LedgerCall::PlaceStake(intent) => {
                *state
                    .totals
                    .entry((intent.contest.clone(), intent.outcome))
                    .or_default() += intent.amount;
            }
            LedgerCall::SetWinners { contest_id, .. } => {
                state.winners.insert(contest_id.clone());
            }
            LedgerCall::ClaimRewards { contest_id } => {
                state.claimable.retain(|(_, c), _| c != contest_id);
            }
            LedgerCall::ClaimProjectOwnerReward { contest, outcome } => {
                state.owner_rewards.remove(&(contest.clone(), *outcome));
            }
        }
    }

    async fn read<R>(&self, f: impl FnOnce(&State) -> R) -> Result<R> {
        let (fail, delay) = self.with(|s| (s.fail_reads, s.read_delay));
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(Error::Read("connection refused".to_string()));
        }
        Ok(self.with(|s| f(s)))
    }
}

impl Ledger for MockLedger {
    fn is_configured(&self) -> bool {
        self.configured
    }

    async fn total_staked(&self, contest: &ContestRef, outcome: OutcomeKind) -> Result<U256> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let key = (contest.clone(), outcome);
        self.read(|s| s.totals.get(&key).copied().unwrap_or_default()).await
    }

    async fn stake_of(&self, user: Address, contest: &ContestRef, outcome: OutcomeKind) -> Result<U256> {
        let key = (user, contest.clone(), outcome);
        self.read(|s| s.stakes.get(&key).copied().unwrap_or_default()).await
    }

    async fn winners_set(&self, contest_id: &str) -> Result<bool> {
        self.read(|s| s.winners.contains(contest_id)).await
    }

    async fn claimable_reward(&self, user: Address, contest_id: &str) -> Result<U256> {
        self.reward_reads.fetch_add(1, Ordering::SeqCst);
        let key = (user, contest_id.to_string());
        self.read(|s| s.claimable.get(&key).copied().unwrap_or_default()).await
    }

    async fn project_owner_reward(&self, contest: &ContestRef, outcome: OutcomeKind) -> Result<U256> {
        self.reward_reads.fetch_add(1, Ordering::SeqCst);
        let key = (contest.clone(), outcome);
        self.read(|s| s.owner_rewards.get(&key).copied().unwrap_or_default()).await
    }

    async fn balance(&self, user: Address) -> Result<U256> {
        self.read(|s| s.balances.get(&user).copied().unwrap_or_else(|| units(1_000_000)))
            .await
    }

    async fn send(&self, call: LedgerCall) -> Result<H256> {
        let n = self.nonce.fetch_add(1, Ordering::SeqCst) as u64 + 1;
        let tx = H256::from_low_u64_be(n);
        self.with(|s| {
            s.sent.push(call.clone());
            match s.scripts.pop_front().unwrap_or(SendScript::Mined) {
                SendScript::Refused(msg) => return Err(Error::Write(msg)),
                SendScript::Mined => {
                    Self::apply(s, &call);
                    s.receipts.insert(
                        tx,
                        Receipt {
                            tx,
                            block_number: Some(n),
                            success: true,
                        },
                    );
                }
                SendScript::Reverted => {
                    s.receipts.insert(
                        tx,
                        Receipt {
                            tx,
                            block_number: Some(n),
                            success: false,
                        },
                    );
                }
                SendScript::Pending => {}
            }
            Ok(tx)
        })
    }

    async fn receipt(&self, tx: H256) -> Result<Option<Receipt>> {
        Ok(self.with(|s| s.receipts.get(&tx).copied()))
    }

    fn stake_events(&self) -> BoxStream<'static, StakePlaced> {
        let (tx, rx) = unbounded();
        self.with(|s| s.subscribers.push(tx));
        rx.boxed()
    }
}

pub fn stake_event(contest: &ContestRef, who: Address, tokens: u64, timestamp: u64) -> StakePlaced {
    StakePlaced {
        user: who,
        contest: contest.clone(),
        outcome: OutcomeKind::Finalist,
        amount: units(tokens),
        timestamp,
    }
}
