use crate::config::SyncOpts;
use crate::error::Result;
use crate::ledger::Ledger;
use crate::sync::{PollSource, Poller};
use crate::types::{ClaimTarget, ClaimableReward, ContestRef, OutcomeKind};
use log::{info, warn};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use web3::futures::future::join_all;
use web3::types::{Address, U256};

/// Current claimable amount for one target.
pub async fn read_reward<L: Ledger>(ledger: &L, target: &ClaimTarget) -> Result<U256> {
    match target {
        ClaimTarget::Staker { user, contest_id } => ledger.claimable_reward(*user, contest_id).await,
        ClaimTarget::ProjectOwner { contest, outcome } => ledger.project_owner_reward(contest, *outcome).await,
    }
}

pub struct RewardSource<L> {
    ledger: Arc<L>,
    targets: Vec<ClaimTarget>,
}

impl<L: Ledger> PollSource for RewardSource<L> {
    type Fetched = Vec<(ClaimTarget, Option<U256>)>;
    type Value = BTreeMap<ClaimTarget, U256>;

    async fn fetch(&self) -> Self::Fetched {
        let reads = join_all(self.targets.iter().map(|t| read_reward(self.ledger.as_ref(), t))).await;
        self.targets
            .iter()
            .cloned()
            .zip(reads)
            .map(|(target, read)| match read {
                Ok(amount) => (target, Some(amount)),
                Err(e) => {
                    warn!("reward of {} unavailable: {}", target, e);
                    (target, None)
                }
            })
            .collect()
    }

    fn merge(&self, current: &Self::Value, fetched: Self::Fetched) -> Self::Value {
        let mut next = current.clone();
        for (target, amount) in fetched {
            if let Some(amount) = amount {
                next.insert(target, amount);
            }
        }
        next
    }
}

/// Polls claimable rewards and exposes the positive, unclaimed ones.
pub struct RewardTracker<L: Ledger> {
    ledger: Arc<L>,
    poller: Poller<RewardSource<L>>,
    claimed: Mutex<HashSet<ClaimTarget>>,
}

impl<L: Ledger> RewardTracker<L> {
    pub fn new(ledger: Arc<L>, targets: Vec<ClaimTarget>, opts: &SyncOpts, enabled: bool) -> Self {
        let enabled = enabled && ledger.is_configured() && !targets.is_empty();
        let source = RewardSource {
            ledger: ledger.clone(),
            targets,
        };
        Self {
            ledger,
            poller: Poller::spawn(source, None, opts.into(), enabled),
            claimed: Mutex::new(HashSet::new()),
        }
    }

    /// Staker rewards of `user` in each contest.
    pub fn staker(ledger: Arc<L>, user: Address, contest_ids: impl IntoIterator<Item = String>, opts: &SyncOpts) -> Self {
        let targets = contest_ids
            .into_iter()
            .map(|contest_id| ClaimTarget::Staker { user, contest_id })
            .collect();
        Self::new(ledger, targets, opts, true)
    }

    /// Owner rewards of one project, polled only when the connected account is the owner.
    pub fn project_owner(
        ledger: Arc<L>,
        connected: Option<Address>,
        owner: Address,
        contest: ContestRef,
        opts: &SyncOpts,
    ) -> Self {
        // Address compares bytes, so hex case never matters
        let is_owner = connected == Some(owner);
        let targets = OutcomeKind::ALL
            .into_iter()
            .map(|outcome| ClaimTarget::ProjectOwner {
                contest: contest.clone(),
                outcome,
            })
            .collect();
        Self::new(ledger, targets, opts, is_owner)
    }

    pub fn is_active(&self) -> bool {
        self.poller.is_active()
    }

    pub fn refresh(&self) {
        self.poller.refresh()
    }

    pub fn changed(&self) -> watch::Receiver<BTreeMap<ClaimTarget, U256>> {
        self.poller.subscribe()
    }

    pub fn is_claimed(&self, target: &ClaimTarget) -> bool {
        self.claimed.lock().map(|c| c.contains(target)).unwrap_or(false)
    }

    pub fn visible(&self) -> Vec<ClaimableReward> {
        self.poller
            .current()
            .into_iter()
            .filter(|(target, amount)| !amount.is_zero() && !self.is_claimed(target))
            .map(|(target, amount)| ClaimableReward {
                outcome: target.outcome(),
                target,
                amount,
            })
            .collect()
    }

    pub fn can_claim(&self, target: &ClaimTarget) -> bool {
        self.visible().iter().any(|r| &r.target == target)
    }

    /// After a confirmed claim: re-read the target, then hide it for the session.
    pub async fn settle_claim(&self, target: &ClaimTarget) {
        match read_reward(self.ledger.as_ref(), target).await {
            Ok(amount) => {
                if !amount.is_zero() {
                    info!("{} still reports {} after claim, hidden for this session", target, amount);
                }
                self.poller.apply(vec![(target.clone(), Some(amount))]);
            }
            Err(e) => warn!("re-read of {} after claim failed: {}", target, e),
        }
        if let Ok(mut claimed) = self.claimed.lock() {
            claimed.insert(target.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{user, MockLedger};
    use crate::utils::units;
    use std::time::Duration;
    use tokio::time::sleep;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[tokio::test(start_paused = true)]
    async fn only_positive_rewards_are_visible() {
        let ledger = Arc::new(MockLedger::new());
        ledger.set_claimable(user(1), "h1", units(30));
        let tracker = RewardTracker::staker(
            ledger.clone(),
            user(1),
            vec!["h1".to_string(), "h2".to_string()],
            &SyncOpts::default(),
        );
        sleep(ms(10)).await;
        assert_eq!(ledger.reward_reads(), 2);
        let visible = tracker.visible();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].amount, units(30));
        assert_eq!(visible[0].outcome, None);
    }

    #[tokio::test(start_paused = true)]
    async fn settled_claim_stays_hidden_despite_stale_reads() {
        let ledger = Arc::new(MockLedger::new());
        ledger.set_claimable(user(1), "h1", units(30));
        let tracker = RewardTracker::staker(ledger.clone(), user(1), vec!["h1".to_string()], &SyncOpts::default());
        sleep(ms(10)).await;
        let target = ClaimTarget::Staker {
            user: user(1),
            contest_id: "h1".to_string(),
        };
        assert!(tracker.can_claim(&target));

        // the ledger has not caught up yet
        let before = ledger.reward_reads();
        tracker.settle_claim(&target).await;
        assert_eq!(ledger.reward_reads(), before + 1);
        assert!(tracker.is_claimed(&target));
        assert!(!tracker.can_claim(&target));

        sleep(Duration::from_secs(5)).await;
        assert!(tracker.visible().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn owner_rewards_poll_only_for_the_owner() {
        let ledger = Arc::new(MockLedger::new());
        let contest = ContestRef::new("h1", "p1");
        ledger.set_owner_reward(&contest, OutcomeKind::VcMeeting, units(4));

        let stranger =
            RewardTracker::project_owner(ledger.clone(), Some(user(2)), user(1), contest.clone(), &SyncOpts::default());
        sleep(ms(10)).await;
        assert!(!stranger.is_active());
        assert_eq!(ledger.reward_reads(), 0);

        let owner =
            RewardTracker::project_owner(ledger.clone(), Some(user(1)), user(1), contest.clone(), &SyncOpts::default());
        sleep(ms(10)).await;
        assert_eq!(ledger.reward_reads(), 3);
        let visible = owner.visible();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].outcome, Some(OutcomeKind::VcMeeting));
    }

    #[tokio::test(start_paused = true)]
    async fn unconfigured_ledger_is_not_polled() {
        let ledger = Arc::new(MockLedger::unconfigured());
        let tracker = RewardTracker::staker(ledger.clone(), user(1), vec!["h1".to_string()], &SyncOpts::default());
        sleep(Duration::from_secs(6)).await;
        assert!(!tracker.is_active());
        assert_eq!(ledger.reward_reads(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_poll_keeps_known_rewards() {
        let ledger = Arc::new(MockLedger::new());
        ledger.set_claimable(user(1), "h1", units(9));
        let tracker = RewardTracker::staker(ledger.clone(), user(1), vec!["h1".to_string()], &SyncOpts::default());
        sleep(ms(10)).await;
        ledger.fail_reads(true);
        sleep(Duration::from_secs(5)).await;
        assert_eq!(tracker.visible()[0].amount, units(9));
    }
}
