//! Change feed: fans ledger `StakePlaced` notifications out to per-project subscribers.

use crate::ledger::Ledger;
use crate::types::{ContestRef, OutcomeKind, StakePlaced};
use crate::utils::{format_units, short_address, TaskGuard};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::{self, error::RecvError};
use web3::futures::StreamExt;
use web3::types::{Address, U256};

const FEED_CAPACITY: usize = 256;
pub const ACTIVITY_CAPACITY: usize = 20;
/// Dedupe window, in notifications.
const SEEN_CAPACITY: usize = 1024;

type DedupeKey = (Address, U256, u64);

/// The most recent `capacity` keys; the oldest is forgotten first.
#[derive(Debug)]
struct RecentKeys {
    order: VecDeque<DedupeKey>,
    keys: HashSet<DedupeKey>,
    capacity: usize,
}

impl RecentKeys {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            keys: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// False when the key is already remembered.
    fn insert(&mut self, key: DedupeKey) -> bool {
        if !self.keys.insert(key) {
            return false;
        }
        self.order.push_back(key);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.keys.remove(&oldest);
            }
        }
        true
    }
}

impl Default for RecentKeys {
    fn default() -> Self {
        Self::new(SEEN_CAPACITY)
    }
}

/// Owns the single upstream subscription. Cloning shares it.
#[derive(Clone)]
pub struct ChangeFeed {
    sender: broadcast::Sender<StakePlaced>,
    _pump: Option<Arc<TaskGuard>>,
}

impl ChangeFeed {
    /// Start pumping the ledger's notifications. Nothing is subscribed upstream
    /// while the ledger is not configured.
    pub fn spawn<L: Ledger>(ledger: &L) -> Self {
        let (sender, _) = broadcast::channel(FEED_CAPACITY);
        if !ledger.is_configured() {
            warn!("staking contract not configured, change feed disabled");
            return Self { sender, _pump: None };
        }
        let mut events = ledger.stake_events();
        let tx = sender.clone();
        let pump = TaskGuard::spawn(async move {
            while let Some(event) = events.next().await {
                debug!("StakePlaced {} {} {}", event.contest, event.outcome, event.amount);
                // no receivers is fine
                let _ = tx.send(event);
            }
            info!("stake event stream closed");
        });
        Self {
            sender,
            _pump: Some(Arc::new(pump)),
        }
    }

    /// A feed that only carries what is published by hand.
    pub fn detached() -> Self {
        let (sender, _) = broadcast::channel(FEED_CAPACITY);
        Self { sender, _pump: None }
    }

    pub fn publish(&self, event: StakePlaced) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self, contest: ContestRef) -> FeedSubscription {
        FeedSubscription {
            contest,
            receiver: self.sender.subscribe(),
            seen: RecentKeys::default(),
        }
    }
}

/// Notifications for one `ContestRef`, each (user, amount, timestamp) delivered once.
/// Dropping it unsubscribes.
pub struct FeedSubscription {
    contest: ContestRef,
    receiver: broadcast::Receiver<StakePlaced>,
    seen: RecentKeys,
}

impl FeedSubscription {
    pub fn contest(&self) -> &ContestRef {
        &self.contest
    }

    /// Next matching notification, `None` once the feed is gone. Cancel safe.
    pub async fn recv(&mut self) -> Option<StakePlaced> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if event.contest != self.contest {
                        continue;
                    }
                    if !self.seen.insert(event.dedupe_key()) {
                        debug!("duplicate StakePlaced for {} dropped", self.contest);
                        continue;
                    }
                    return Some(event);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("feed for {} lagged, {} notifications skipped", self.contest, skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivityEntry {
    pub user: String,
    pub outcome: OutcomeKind,
    pub amount: String,
    pub timestamp: u64,
}

impl From<&StakePlaced> for ActivityEntry {
    fn from(event: &StakePlaced) -> Self {
        Self {
            user: short_address(&event.user),
            outcome: event.outcome,
            amount: format_units(event.amount),
            timestamp: event.timestamp,
        }
    }
}

/// Newest first, at most `ACTIVITY_CAPACITY` distinct entries.
#[derive(Debug, Default)]
pub struct ActivityLog {
    entries: VecDeque<ActivityEntry>,
    seen: RecentKeys,
}

impl ActivityLog {
    /// Returns false for a duplicate.
    pub fn push(&mut self, event: &StakePlaced) -> bool {
        if !self.seen.insert(event.dedupe_key()) {
            return false;
        }
        self.entries.push_front(event.into());
        self.entries.truncate(ACTIVITY_CAPACITY);
        true
    }

    pub fn entries(&self) -> Vec<ActivityEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Keeps an `ActivityLog` filled from a subscription while alive.
pub struct ActivityWatcher {
    log: Arc<Mutex<ActivityLog>>,
    _task: TaskGuard,
}

impl ActivityWatcher {
    pub fn follow(feed: &ChangeFeed, contest: ContestRef) -> Self {
        let log = Arc::new(Mutex::new(ActivityLog::default()));
        let mut subscription = feed.subscribe(contest);
        let sink = log.clone();
        let task = TaskGuard::spawn(async move {
            while let Some(event) = subscription.recv().await {
                if let Ok(mut log) = sink.lock() {
                    log.push(&event);
                }
            }
        });
        Self { log, _task: task }
    }

    pub fn entries(&self) -> Vec<ActivityEntry> {
        self.log.lock().map(|log| log.entries()).unwrap_or_default()
    }
}
