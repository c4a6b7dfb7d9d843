use crate::types::{ContestRef, OutcomeKind};
use crate::utils::to_display;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use web3::types::U256;

/// A confirmed stake echoed locally, before any index picks it up.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStake {
    pub contest: ContestRef,
    pub outcome: OutcomeKind,
    pub amount: U256,
    pub potential_win: f64,
    pub timestamp: u64,
}

/// Session stakes of the connected account.
#[derive(Debug, Default, Clone)]
pub struct StakeBook {
    stakes: Vec<UserStake>,
}

impl StakeBook {
    pub fn record(&mut self, stake: UserStake) {
        self.stakes.push(stake);
    }

    pub fn stakes(&self) -> &[UserStake] {
        &self.stakes
    }

    pub fn total_staked(&self) -> U256 {
        self.stakes
            .iter()
            .fold(U256::zero(), |acc, s| acc.saturating_add(s.amount))
    }

    pub fn total_potential_win(&self) -> f64 {
        self.stakes.iter().map(|s| s.potential_win).sum()
    }

    /// Stakes per contest, newest first.
    pub fn by_contest(&self) -> BTreeMap<String, Vec<UserStake>> {
        let mut grouped: BTreeMap<String, Vec<UserStake>> = BTreeMap::new();
        for stake in self.stakes.iter().rev() {
            grouped
                .entry(stake.contest.contest_id().to_string())
                .or_default()
                .push(stake.clone());
        }
        grouped
    }

    /// Contests with at least one stake; the staker reward trackers watch these.
    pub fn contest_ids(&self) -> BTreeSet<String> {
        self.stakes
            .iter()
            .map(|s| s.contest.contest_id().to_string())
            .collect()
    }

    pub fn summary(&self) -> (f64, f64) {
        (to_display(self.total_staked()), self.total_potential_win())
    }
}
