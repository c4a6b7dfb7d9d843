use crate::error::{Error, Result};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::ops::{Index, IndexMut};
use web3::types::{Address, U256};

/// Scope of every pool query: one project inside one hackathon.
#[derive(Debug, Display, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[display(fmt = "{}/{}", contest_id, project_id)]
pub struct ContestRef {
    contest_id: String,
    project_id: String,
}

impl ContestRef {
    pub fn new(contest_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            contest_id: contest_id.into(),
            project_id: project_id.into(),
        }
    }

    pub fn contest_id(&self) -> &str {
        &self.contest_id
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OutcomeKind {
    #[display(fmt = "Win Prize")]
    WinPrize,
    #[display(fmt = "Finalist")]
    Finalist,
    #[display(fmt = "VC Meeting")]
    VcMeeting,
}

impl OutcomeKind {
    pub const ALL: [OutcomeKind; 3] = [OutcomeKind::WinPrize, OutcomeKind::Finalist, OutcomeKind::VcMeeting];

    /// Encoding used by the staking contract.
    pub fn ordinal(self) -> u8 {
        match self {
            OutcomeKind::WinPrize => 0,
            OutcomeKind::Finalist => 1,
            OutcomeKind::VcMeeting => 2,
        }
    }

    fn index(self) -> usize {
        self.ordinal() as usize
    }
}

impl TryFrom<u8> for OutcomeKind {
    type Error = Error;

    fn try_from(ordinal: u8) -> Result<Self> {
        match ordinal {
            0 => Ok(OutcomeKind::WinPrize),
            1 => Ok(OutcomeKind::Finalist),
            2 => Ok(OutcomeKind::VcMeeting),
            other => Err(Error::UnknownOutcome(other)),
        }
    }
}

impl std::str::FromStr for OutcomeKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace(&['-', '_', ' '][..], "").as_str() {
            "winprize" | "win" => Ok(Self::WinPrize),
            "finalist" => Ok(Self::Finalist),
            "vcmeeting" | "vc" => Ok(Self::VcMeeting),
            _ => Err("Invalid outcome: winPrize, finalist and vcMeeting are supported".to_owned()),
        }
    }
}

/// One value per outcome, indexed by `OutcomeKind`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Outcomes<T> {
    pub win_prize: T,
    pub finalist: T,
    pub vc_meeting: T,
}

impl<T> Outcomes<T> {
    pub fn from_fn(mut f: impl FnMut(OutcomeKind) -> T) -> Self {
        Self {
            win_prize: f(OutcomeKind::WinPrize),
            finalist: f(OutcomeKind::Finalist),
            vc_meeting: f(OutcomeKind::VcMeeting),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (OutcomeKind, &T)> {
        OutcomeKind::ALL.into_iter().map(move |o| (o, &self[o]))
    }
}

impl<T> Index<OutcomeKind> for Outcomes<T> {
    type Output = T;

    fn index(&self, outcome: OutcomeKind) -> &T {
        match outcome.index() {
            0 => &self.win_prize,
            1 => &self.finalist,
            _ => &self.vc_meeting,
        }
    }
}

impl<T> IndexMut<OutcomeKind> for Outcomes<T> {
    fn index_mut(&mut self, outcome: OutcomeKind) -> &mut T {
        match outcome.index() {
            0 => &mut self.win_prize,
            1 => &mut self.finalist,
            _ => &mut self.vc_meeting,
        }
    }
}

/// Per-outcome stake totals for one `ContestRef`.
///
/// The total is derived on read and never stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PoolSnapshot {
    amounts: Outcomes<U256>,
    loaded: Outcomes<bool>,
}

impl PoolSnapshot {
    pub fn new(amounts: Outcomes<U256>) -> Self {
        Self {
            amounts,
            loaded: Outcomes::from_fn(|_| true),
        }
    }

    pub fn amount(&self, outcome: OutcomeKind) -> U256 {
        self.amounts[outcome]
    }

    pub fn amounts(&self) -> &Outcomes<U256> {
        &self.amounts
    }

    pub fn total(&self) -> U256 {
        self.amounts
            .iter()
            .fold(U256::zero(), |acc, (_, v)| acc.saturating_add(*v))
    }

    /// Whether at least one read for `outcome` has completed.
    pub fn is_loaded(&self, outcome: OutcomeKind) -> bool {
        self.loaded[outcome]
    }

    /// Rebuild with the outcomes that were read successfully; the others keep their previous value.
    pub fn merged(&self, reads: &Outcomes<Option<U256>>) -> Self {
        let mut next = *self;
        for (outcome, read) in reads.iter() {
            if let Some(amount) = read {
                next.amounts[outcome] = *amount;
                next.loaded[outcome] = true;
            }
        }
        next
    }

    /// The fetched amount when it is nonzero, otherwise the caller's fallback.
    pub fn display(&self, outcome: OutcomeKind, fallback: U256) -> U256 {
        let amount = self.amounts[outcome];
        if amount > U256::zero() {
            amount
        } else {
            fallback
        }
    }

    /// A snapshot holding display values for every outcome.
    pub fn with_fallback(&self, fallback: &Outcomes<U256>) -> Self {
        Self {
            amounts: Outcomes::from_fn(|o| self.display(o, fallback[o])),
            loaded: self.loaded,
        }
    }
}

/// A stake the user committed to. Consumed by exactly one transaction lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StakeIntent {
    pub contest: ContestRef,
    pub outcome: OutcomeKind,
    pub amount: U256,
    /// Receives the project owner share.
    pub payee: Address,
}

/// Who a reward is claimed for.
#[derive(Debug, Display, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum ClaimTarget {
    #[display(fmt = "staker {:?} in {}", user, contest_id)]
    Staker { user: Address, contest_id: String },
    #[display(fmt = "owner of {} ({})", contest, outcome)]
    ProjectOwner { contest: ContestRef, outcome: OutcomeKind },
}

impl ClaimTarget {
    pub fn outcome(&self) -> Option<OutcomeKind> {
        match self {
            ClaimTarget::Staker { .. } => None,
            ClaimTarget::ProjectOwner { outcome, .. } => Some(*outcome),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClaimableReward {
    pub target: ClaimTarget,
    pub outcome: Option<OutcomeKind>,
    pub amount: U256,
}

/// Winning projects of one hackathon, set once by the authority.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WinnerSet {
    pub win_prize: BTreeSet<String>,
    pub finalist: BTreeSet<String>,
    pub vc_meeting: BTreeSet<String>,
    #[serde(default)]
    pub finalized: bool,
}

impl WinnerSet {
    pub fn projects(&self, outcome: OutcomeKind) -> &BTreeSet<String> {
        match outcome {
            OutcomeKind::WinPrize => &self.win_prize,
            OutcomeKind::Finalist => &self.finalist,
            OutcomeKind::VcMeeting => &self.vc_meeting,
        }
    }

    /// Add the project to the outcome, or remove it when already present.
    /// Returns whether the project is selected afterwards.
    pub fn toggle(&mut self, project_id: &str, outcome: OutcomeKind) -> bool {
        let set = match outcome {
            OutcomeKind::WinPrize => &mut self.win_prize,
            OutcomeKind::Finalist => &mut self.finalist,
            OutcomeKind::VcMeeting => &mut self.vc_meeting,
        };
        if set.remove(project_id) {
            false
        } else {
            set.insert(project_id.to_string());
            true
        }
    }

    pub fn is_empty(&self) -> bool {
        self.win_prize.is_empty() && self.finalist.is_empty() && self.vc_meeting.is_empty()
    }
}

/// `StakePlaced` notification emitted by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StakePlaced {
    pub user: Address,
    pub contest: ContestRef,
    pub outcome: OutcomeKind,
    pub amount: U256,
    pub timestamp: u64,
}

impl StakePlaced {
    /// Identity used to drop duplicate deliveries.
    pub fn dedupe_key(&self) -> (Address, U256, u64) {
        (self.user, self.amount, self.timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::units;

    #[test]
    fn outcome_ordinals_are_stable() {
        for outcome in OutcomeKind::ALL {
            assert_eq!(OutcomeKind::try_from(outcome.ordinal()).unwrap(), outcome);
        }
        assert!(matches!(OutcomeKind::try_from(3), Err(Error::UnknownOutcome(3))));
        assert_eq!("vcMeeting".parse::<OutcomeKind>().unwrap(), OutcomeKind::VcMeeting);
        assert_eq!("win-prize".parse::<OutcomeKind>().unwrap(), OutcomeKind::WinPrize);
        assert!("loser".parse::<OutcomeKind>().is_err());
    }

    #[test]
    fn snapshot_total_is_sum_of_outcomes() {
        let snapshot = PoolSnapshot::new(Outcomes {
            win_prize: units(1000),
            finalist: units(500),
            vc_meeting: U256::zero(),
        });
        assert_eq!(snapshot.total(), units(1500));

        let merged = snapshot.merged(&Outcomes {
            win_prize: None,
            finalist: Some(units(700)),
            vc_meeting: Some(units(5)),
        });
        assert_eq!(merged.amount(OutcomeKind::WinPrize), units(1000));
        assert_eq!(merged.total(), units(1705));
    }

    #[test]
    fn zero_read_uses_fallback_but_nonzero_wins() {
        let snapshot = PoolSnapshot::default().merged(&Outcomes {
            win_prize: Some(units(3)),
            finalist: Some(U256::zero()),
            vc_meeting: None,
        });
        assert!(snapshot.is_loaded(OutcomeKind::Finalist));
        assert!(!snapshot.is_loaded(OutcomeKind::VcMeeting));
        assert_eq!(snapshot.display(OutcomeKind::WinPrize, units(50)), units(3));
        assert_eq!(snapshot.display(OutcomeKind::Finalist, units(50)), units(50));

        let shown = snapshot.with_fallback(&Outcomes::from_fn(|_| units(10)));
        assert_eq!(shown.total(), units(23));
    }

    #[test]
    fn toggle_winners() {
        let mut winners = WinnerSet::default();
        assert!(winners.is_empty());
        assert!(winners.toggle("p1", OutcomeKind::WinPrize));
        assert!(winners.toggle("p2", OutcomeKind::Finalist));
        assert!(!winners.toggle("p1", OutcomeKind::WinPrize));
        assert!(winners.projects(OutcomeKind::WinPrize).is_empty());
        assert!(winners.projects(OutcomeKind::Finalist).contains("p2"));
    }
}
