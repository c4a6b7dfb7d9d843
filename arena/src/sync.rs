//! Poll + subscribe + merge.
//!
//! A `Poller` owns one background task that is the single writer of its
//! value. Fetches are started by the interval, by a debounced feed
//! notification or on request; results are merged in completion order, so
//! the latest completed read always wins regardless of which trigger started
//! it. Dropping the `Poller` aborts the task and everything in flight.

use crate::config::SyncOpts;
use crate::feed::{ChangeFeed, FeedSubscription};
use crate::ledger::{pool_reads, Ledger};
use crate::types::{ContestRef, OutcomeKind, Outcomes, PoolSnapshot, StakePlaced};
use crate::utils::TaskGuard;
use log::{debug, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use web3::futures::stream::{FuturesUnordered, StreamExt};
use web3::types::U256;

pub trait PollSource: Send + Sync + 'static {
    type Fetched: Send + 'static;
    type Value: Clone + Default + Send + Sync + 'static;

    /// One complete read. Failures are folded into `Fetched`, never raised.
    fn fetch(&self) -> impl Future<Output = Self::Fetched> + Send;

    /// Build the next value from the current one and a completed read.
    fn merge(&self, current: &Self::Value, fetched: Self::Fetched) -> Self::Value;
}

enum Command<F> {
    Refresh,
    Apply(F),
}

#[derive(Debug, Clone, Copy)]
pub struct PollTiming {
    pub interval: Duration,
    pub debounce: Duration,
}

impl From<&SyncOpts> for PollTiming {
    fn from(opts: &SyncOpts) -> Self {
        Self {
            interval: opts.poll_interval(),
            debounce: opts.debounce(),
        }
    }
}

pub struct Poller<S: PollSource> {
    source: Arc<S>,
    state: watch::Receiver<S::Value>,
    commands: Option<mpsc::UnboundedSender<Command<S::Fetched>>>,
    _task: Option<TaskGuard>,
}

impl<S: PollSource> Poller<S> {
    /// Start polling. A disabled poller never fetches and keeps the default value.
    pub fn spawn(source: S, feed: Option<FeedSubscription>, timing: PollTiming, enabled: bool) -> Self {
        let source = Arc::new(source);
        let (state_tx, state) = watch::channel(S::Value::default());
        if !enabled {
            return Self {
                source,
                state,
                commands: None,
                _task: None,
            };
        }
        let (commands, command_rx) = mpsc::unbounded_channel();
        let task = TaskGuard::spawn(run(source.clone(), state_tx, feed, command_rx, timing));
        Self {
            source,
            state,
            commands: Some(commands),
            _task: Some(task),
        }
    }

    pub fn current(&self) -> S::Value {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<S::Value> {
        self.state.clone()
    }

    pub fn is_active(&self) -> bool {
        self.commands.is_some()
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Start an out of band fetch.
    pub fn refresh(&self) {
        self.command(Command::Refresh);
    }

    /// Merge a read taken outside the poller.
    pub fn apply(&self, fetched: S::Fetched) {
        self.command(Command::Apply(fetched));
    }

    fn command(&self, command: Command<S::Fetched>) {
        if let Some(tx) = &self.commands {
            let _ = tx.send(command);
        }
    }
}

async fn next_event(feed: &mut Option<FeedSubscription>) -> Option<StakePlaced> {
    match feed {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

async fn run<S: PollSource>(
    source: Arc<S>,
    state: watch::Sender<S::Value>,
    mut feed: Option<FeedSubscription>,
    mut commands: mpsc::UnboundedReceiver<Command<S::Fetched>>,
    timing: PollTiming,
) {
    let mut ticker = interval(timing.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let debounce = sleep(timing.debounce);
    tokio::pin!(debounce);
    let mut armed = false;
    let mut in_flight = FuturesUnordered::new();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                in_flight.push(source.fetch());
            }
            Some(fetched) = in_flight.next(), if !in_flight.is_empty() => {
                state.send_modify(|value| *value = source.merge(value, fetched));
            }
            event = next_event(&mut feed), if feed.is_some() => match event {
                Some(event) => {
                    if !armed {
                        debug!("refresh of {} scheduled by stake {}", event.contest, event.amount);
                        debounce.as_mut().reset(Instant::now() + timing.debounce);
                        armed = true;
                    }
                }
                None => {
                    warn!("change feed closed, falling back to interval polling");
                    feed = None;
                }
            },
            _ = &mut debounce, if armed => {
                armed = false;
                in_flight.push(source.fetch());
            }
            Some(command) = commands.recv() => match command {
                Command::Refresh => in_flight.push(source.fetch()),
                Command::Apply(fetched) => state.send_modify(|value| *value = source.merge(value, fetched)),
            },
        }
    }
}

/// Reads the three outcome totals of one project.
pub struct PoolSource<L> {
    ledger: Arc<L>,
    contest: ContestRef,
}

impl<L: Ledger> PollSource for PoolSource<L> {
    type Fetched = Outcomes<Option<U256>>;
    type Value = PoolSnapshot;

    async fn fetch(&self) -> Self::Fetched {
        let reads = pool_reads(self.ledger.as_ref(), &self.contest).await;
        Outcomes::from_fn(|outcome| match &reads[outcome] {
            Ok(amount) => Some(*amount),
            Err(e) => {
                warn!("getTotalStaked {} {} failed, keeping last value: {}", self.contest, outcome, e);
                None
            }
        })
    }

    fn merge(&self, current: &PoolSnapshot, fetched: Self::Fetched) -> PoolSnapshot {
        current.merged(&fetched)
    }
}

/// Authoritative pool totals of one project, kept fresh while alive.
pub struct PoolSync<L: Ledger> {
    contest: ContestRef,
    poller: Poller<PoolSource<L>>,
}

impl<L: Ledger> PoolSync<L> {
    pub fn activate(ledger: Arc<L>, feed: &ChangeFeed, contest: ContestRef, opts: &SyncOpts) -> Self {
        let enabled = ledger.is_configured();
        if !enabled {
            warn!("staking contract not configured, pool {} is not polled", contest);
        }
        let subscription = enabled.then(|| feed.subscribe(contest.clone()));
        let source = PoolSource {
            ledger,
            contest: contest.clone(),
        };
        Self {
            contest,
            poller: Poller::spawn(source, subscription, opts.into(), enabled),
        }
    }

    pub fn contest(&self) -> &ContestRef {
        &self.contest
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        self.poller.current()
    }

    pub fn display(&self, outcome: OutcomeKind, fallback: U256) -> U256 {
        self.snapshot().display(outcome, fallback)
    }

    pub fn display_snapshot(&self, fallback: &Outcomes<U256>) -> PoolSnapshot {
        self.snapshot().with_fallback(fallback)
    }

    pub fn changed(&self) -> watch::Receiver<PoolSnapshot> {
        self.poller.subscribe()
    }

    pub fn refresh(&self) {
        self.poller.refresh()
    }
}
