//! The four user-initiated writes and their confirmation side effects.

use crate::catalog::{Catalog, KvStore, Project};
use crate::error::{Error, FailureReason, Result};
use crate::ledger::{Ledger, LedgerCall};
use crate::portfolio::{StakeBook, UserStake};
use crate::rewards::RewardTracker;
use crate::tx::Operation;
use crate::types::{ClaimTarget, ContestRef, OutcomeKind, StakeIntent, WinnerSet};
use crate::utils::{get_timestamp, to_display};
use log::{info, warn};
use std::sync::{Arc, Mutex, MutexGuard};
use web3::types::{Address, H256, U256};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub struct PlaceStake {
    intent: StakeIntent,
    staker: Address,
    odds: f64,
    book: Arc<Mutex<StakeBook>>,
}

impl PlaceStake {
    pub fn new(intent: StakeIntent, staker: Address, odds: f64, book: Arc<Mutex<StakeBook>>) -> Result<Self> {
        if intent.amount.is_zero() {
            return Err(Error::InvalidAmount("stake must be greater than zero".to_string()));
        }
        Ok(Self {
            intent,
            staker,
            odds,
            book,
        })
    }

    /// Stake on a catalog project; the owner share goes to the staker when the project has no owner.
    pub fn on_project(
        project: &Project,
        contest_id: &str,
        outcome: OutcomeKind,
        amount: U256,
        staker: Address,
        book: Arc<Mutex<StakeBook>>,
    ) -> Result<Self> {
        let intent = StakeIntent {
            contest: ContestRef::new(contest_id, project.id.as_str()),
            outcome,
            amount,
            payee: project.payee(staker),
        };
        Self::new(intent, staker, project.odds_for(outcome), book)
    }

    pub fn intent(&self) -> &StakeIntent {
        &self.intent
    }

    pub fn potential_win(&self) -> f64 {
        to_display(self.intent.amount) * self.odds
    }
}

impl Operation for PlaceStake {
    fn name(&self) -> &'static str {
        "stake"
    }

    fn call(&self) -> LedgerCall {
        LedgerCall::PlaceStake(self.intent.clone())
    }

    async fn precheck<L: Ledger>(&self, ledger: &L) -> std::result::Result<(), FailureReason> {
        match ledger.balance(self.staker).await {
            Ok(balance) if balance < self.intent.amount => Err(FailureReason::InsufficientBalance),
            Ok(_) => Ok(()),
            Err(e) => {
                // the wallet will refuse it anyway
                warn!("balance of {:?} unavailable: {}", self.staker, e);
                Ok(())
            }
        }
    }

    async fn on_confirmed(&self, tx: H256) {
        info!(
            "stake of {} on {} {} confirmed in {:?}",
            self.intent.amount, self.intent.contest, self.intent.outcome, tx
        );
        lock(&self.book).record(UserStake {
            contest: self.intent.contest.clone(),
            outcome: self.intent.outcome,
            amount: self.intent.amount,
            potential_win: self.potential_win(),
            timestamp: get_timestamp(),
        });
    }
}

/// Reject a target already claimed in this session.
fn unclaimed<L: Ledger>(
    tracker: &Option<Arc<RewardTracker<L>>>,
    target: &ClaimTarget,
) -> std::result::Result<(), FailureReason> {
    match tracker {
        Some(tracker) if tracker.is_claimed(target) => {
            Err(FailureReason::Unknown(format!("reward for {} was already claimed", target)))
        }
        _ => Ok(()),
    }
}

pub struct ClaimRewards<L: Ledger> {
    target: ClaimTarget,
    tracker: Option<Arc<RewardTracker<L>>>,
}

impl<L: Ledger> ClaimRewards<L> {
    pub fn new(user: Address, contest_id: impl Into<String>, tracker: Option<Arc<RewardTracker<L>>>) -> Self {
        Self {
            target: ClaimTarget::Staker {
                user,
                contest_id: contest_id.into(),
            },
            tracker,
        }
    }
}

impl<L: Ledger> Operation for ClaimRewards<L> {
    fn name(&self) -> &'static str {
        "claimRewards"
    }

    fn call(&self) -> LedgerCall {
        match &self.target {
            ClaimTarget::Staker { contest_id, .. } => LedgerCall::ClaimRewards {
                contest_id: contest_id.clone(),
            },
            ClaimTarget::ProjectOwner { contest, .. } => LedgerCall::ClaimRewards {
                contest_id: contest.contest_id().to_string(),
            },
        }
    }

    async fn precheck<M: Ledger>(&self, _ledger: &M) -> std::result::Result<(), FailureReason> {
        unclaimed(&self.tracker, &self.target)
    }

    async fn on_confirmed(&self, _tx: H256) {
        if let Some(tracker) = &self.tracker {
            tracker.settle_claim(&self.target).await;
        }
    }
}

pub struct ClaimOwnerReward<L: Ledger> {
    contest: ContestRef,
    outcome: OutcomeKind,
    tracker: Option<Arc<RewardTracker<L>>>,
}

impl<L: Ledger> ClaimOwnerReward<L> {
    pub fn new(contest: ContestRef, outcome: OutcomeKind, tracker: Option<Arc<RewardTracker<L>>>) -> Self {
        Self {
            contest,
            outcome,
            tracker,
        }
    }

    fn target(&self) -> ClaimTarget {
        ClaimTarget::ProjectOwner {
            contest: self.contest.clone(),
            outcome: self.outcome,
        }
    }
}

impl<L: Ledger> Operation for ClaimOwnerReward<L> {
    fn name(&self) -> &'static str {
        "claimProjectOwnerReward"
    }

    fn call(&self) -> LedgerCall {
        LedgerCall::ClaimProjectOwnerReward {
            contest: self.contest.clone(),
            outcome: self.outcome,
        }
    }

    async fn precheck<M: Ledger>(&self, _ledger: &M) -> std::result::Result<(), FailureReason> {
        unclaimed(&self.tracker, &self.target())
    }

    async fn on_confirmed(&self, _tx: H256) {
        if let Some(tracker) = &self.tracker {
            tracker.settle_claim(&self.target()).await;
        }
    }
}

/// Submits the authority's draft; on confirmation the draft is finalized and persisted.
pub struct SetWinners<S: KvStore> {
    contest_id: String,
    draft: Arc<Mutex<WinnerSet>>,
    catalog: Option<Arc<Catalog<S>>>,
}

impl<S: KvStore> SetWinners<S> {
    pub fn new(contest_id: impl Into<String>, draft: Arc<Mutex<WinnerSet>>, catalog: Option<Arc<Catalog<S>>>) -> Self {
        Self {
            contest_id: contest_id.into(),
            draft,
            catalog,
        }
    }

    pub fn draft(&self) -> WinnerSet {
        lock(&self.draft).clone()
    }
}

impl<S: KvStore> Operation for SetWinners<S> {
    fn name(&self) -> &'static str {
        "setWinners"
    }

    fn call(&self) -> LedgerCall {
        LedgerCall::SetWinners {
            contest_id: self.contest_id.clone(),
            winners: self.draft(),
        }
    }

    async fn precheck<L: Ledger>(&self, ledger: &L) -> std::result::Result<(), FailureReason> {
        if self.draft().finalized {
            return Err(FailureReason::AlreadyFinalized);
        }
        match ledger.winners_set(&self.contest_id).await {
            Ok(true) => Err(FailureReason::AlreadyFinalized),
            Ok(false) => Ok(()),
            Err(e) => {
                warn!("winnersSet({}) unavailable: {}", self.contest_id, e);
                Ok(())
            }
        }
    }

    async fn on_confirmed(&self, tx: H256) {
        let winners = {
            let mut draft = lock(&self.draft);
            draft.finalized = true;
            draft.clone()
        };
        info!("winners of {} finalized in {:?}", self.contest_id, tx);
        if let Some(catalog) = &self.catalog {
            if let Err(e) = catalog.save_winners(&self.contest_id, &winners) {
                warn!("winners of {} not persisted: {}", self.contest_id, e);
            }
        }
    }
}
