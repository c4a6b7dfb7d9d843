//! Typed seam between the client and the staking contract.
//!
//! Everything above this module talks to a [`Ledger`]; `contract::ChainLedger`
//! binds it to a deployed contract and tests bind it to an in-memory ledger.

use crate::error::Result;
use crate::types::{ContestRef, OutcomeKind, Outcomes, StakeIntent, StakePlaced, WinnerSet};
use std::future::Future;
use web3::futures::stream::BoxStream;
use web3::types::{Address, H256, U256};

/// A state-changing call, handed to the signing layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerCall {
    PlaceStake(StakeIntent),
    SetWinners { contest_id: String, winners: WinnerSet },
    ClaimRewards { contest_id: String },
    ClaimProjectOwnerReward { contest: ContestRef, outcome: OutcomeKind },
}

impl LedgerCall {
    /// Contract function the call maps to.
    pub fn method(&self) -> &'static str {
        match self {
            LedgerCall::PlaceStake(_) => "stake",
            LedgerCall::SetWinners { .. } => "setWinners",
            LedgerCall::ClaimRewards { .. } => "claimRewards",
            LedgerCall::ClaimProjectOwnerReward { .. } => "claimProjectOwnerReward",
        }
    }

    /// Native value attached to the transaction.
    pub fn value(&self) -> U256 {
        match self {
            LedgerCall::PlaceStake(intent) => intent.amount,
            _ => U256::zero(),
        }
    }
}

/// Outcome of a mined transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Receipt {
    pub tx: H256,
    pub block_number: Option<u64>,
    pub success: bool,
}

pub trait Ledger: Send + Sync + 'static {
    /// Whether a contract address was configured.
    fn is_configured(&self) -> bool;

    fn total_staked(&self, contest: &ContestRef, outcome: OutcomeKind) -> impl Future<Output = Result<U256>> + Send;

    fn stake_of(
        &self,
        user: Address,
        contest: &ContestRef,
        outcome: OutcomeKind,
    ) -> impl Future<Output = Result<U256>> + Send;

    fn winners_set(&self, contest_id: &str) -> impl Future<Output = Result<bool>> + Send;

    fn claimable_reward(&self, user: Address, contest_id: &str) -> impl Future<Output = Result<U256>> + Send;

    fn project_owner_reward(
        &self,
        contest: &ContestRef,
        outcome: OutcomeKind,
    ) -> impl Future<Output = Result<U256>> + Send;

    /// Native balance of an account.
    fn balance(&self, user: Address) -> impl Future<Output = Result<U256>> + Send;

    /// Hand the call to the signing layer. Resolves with the transaction hash
    /// once the signer approved it and it was broadcast.
    fn send(&self, call: LedgerCall) -> impl Future<Output = Result<H256>> + Send;

    /// `None` while the transaction is not mined yet.
    fn receipt(&self, tx: H256) -> impl Future<Output = Result<Option<Receipt>>> + Send;

    /// Push stream of every `StakePlaced` event, unfiltered.
    fn stake_events(&self) -> BoxStream<'static, StakePlaced>;
}

/// Read all three outcome totals for one project.
pub async fn pool_reads<L: Ledger>(ledger: &L, contest: &ContestRef) -> Outcomes<Result<U256>> {
    let (win_prize, finalist, vc_meeting) = tokio::join!(
        ledger.total_staked(contest, OutcomeKind::WinPrize),
        ledger.total_staked(contest, OutcomeKind::Finalist),
        ledger.total_staked(contest, OutcomeKind::VcMeeting),
    );
    Outcomes {
        win_prize,
        finalist,
        vc_meeting,
    }
}
