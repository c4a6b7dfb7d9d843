use anyhow::{anyhow, bail, Context as _};
use arena::{
    api::{self, Views},
    catalog::{Catalog, CatalogSeed, Db, KvStore, MemoryStore, Project},
    config::{Config, Opts},
    contract::ChainLedger,
    error::Alert,
    feed::ChangeFeed,
    odds::Quote,
    ops::{ClaimOwnerReward, ClaimRewards, PlaceStake, SetWinners},
    portfolio::StakeBook,
    rewards::RewardTracker,
    sync::PoolSync,
    tx::{TransactionHandle, TxController, TxStage},
    types::{ClaimTarget, WinnerSet},
    utils::{format_units, parse_units},
    ContestRef, Ledger, OutcomeKind, PoolSnapshot,
};
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::{
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::watch;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub(crate) struct Cli {
    #[clap(flatten)]
    pub(crate) opts: Opts,

    #[clap(subcommand)]
    pub(crate) command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Commands {
    /// Print a sample config file
    ShowConfig,
    /// Follow the live pool of one project
    Watch {
        #[clap(long)]
        contest: String,
        #[clap(long)]
        project: String,
        /// Stop after this many seconds, runs until ctrl-c otherwise
        #[clap(long)]
        seconds: Option<u64>,
    },
    /// Odds, pool share and potential return of a stake
    Quote {
        #[clap(long)]
        contest: String,
        #[clap(long)]
        project: String,
        #[clap(long)]
        outcome: OutcomeKind,
        /// Stake in tokens
        #[clap(long)]
        amount: Option<f64>,
    },
    /// Stake tokens on an outcome of a project
    Stake {
        #[clap(long)]
        contest: String,
        #[clap(long)]
        project: String,
        #[clap(long)]
        outcome: OutcomeKind,
        /// Decimal token amount, e.g. 12.5
        #[clap(long)]
        amount: String,
    },
    /// Claim staker rewards of a hackathon
    Claim {
        #[clap(long)]
        contest: String,
    },
    /// Claim the owner reward of a project for one outcome
    ClaimOwner {
        #[clap(long)]
        contest: String,
        #[clap(long)]
        project: String,
        #[clap(long)]
        outcome: OutcomeKind,
    },
    /// Record the winners of a hackathon, once
    SetWinners {
        #[clap(long)]
        contest: String,
        #[clap(long, value_delimiter = ',')]
        win_prize: Vec<String>,
        #[clap(long, value_delimiter = ',')]
        finalist: Vec<String>,
        #[clap(long, value_delimiter = ',')]
        vc_meeting: Vec<String>,
    },
    /// List claimable rewards of the configured account
    Rewards {
        /// Hackathon ids, every known hackathon when empty
        #[clap(long, value_delimiter = ',')]
        contests: Vec<String>,
    },
    /// Serve the read-only http views
    Serve,
}

type Store = Box<dyn KvStore>;

pub(crate) struct Context {
    pub(crate) config: Config,
    pub(crate) ledger: Arc<ChainLedger>,
    pub(crate) catalog: Arc<Catalog<Store>>,
}

impl Context {
    pub(crate) fn setup(config: Config) -> anyhow::Result<Self> {
        let ledger = Arc::new(ChainLedger::setup(&config)?);
        let store: Store = if config.redis.is_empty() {
            info!("no redis configured, catalog changes live in memory");
            Box::new(MemoryStore::default())
        } else {
            let db = Db::open(&config.redis)?;
            info!("catalog store {}", db);
            Box::new(db)
        };
        let mut catalog = Catalog::new(store);
        if !config.catalog.is_empty() {
            match CatalogSeed::from_file(Path::new(&config.catalog)) {
                Ok(seed) => catalog = catalog.with_seed(seed),
                Err(e) => warn!("catalog seed {} not loaded: {}", config.catalog, e),
            }
        }
        Ok(Self {
            config,
            ledger,
            catalog: Arc::new(catalog),
        })
    }

    /// Warn when the endpoint serves another chain than configured.
    pub(crate) async fn check_chain(&self) {
        match self.ledger.chain_id().await {
            Ok(id) if id.to_string() == self.config.chain.chain_id => {
                info!("connected to {} (chain id {})", self.config.chain.name, id)
            }
            Ok(id) => warn!(
                "endpoint reports chain id {}, config expects {}",
                id, self.config.chain.chain_id
            ),
            Err(e) => warn!("chain id unavailable: {}", e),
        }
    }

    fn controller(&self) -> TxController<ChainLedger> {
        TxController::new(self.ledger.clone(), (&self.config.sync).into()).with_settings(self.ledger.settings().clone())
    }

    fn project(&self, project_id: &str) -> anyhow::Result<Project> {
        Ok(self.catalog.project(project_id)?.unwrap_or_else(|| {
            warn!("project {} not in the catalog, using default odds", project_id);
            Project {
                id: project_id.to_string(),
                ..Default::default()
            }
        }))
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.config.sync.request_timeout_secs)
    }
}

async fn first_change<T>(rx: &mut watch::Receiver<T>, within: Duration) {
    if tokio::time::timeout(within, rx.changed()).await.is_err() {
        warn!("no data within {:?}", within);
    }
}

fn report(handle: &TransactionHandle) -> anyhow::Result<()> {
    match handle.stage() {
        TxStage::Confirmed => {
            if let Some(tx) = handle.tx_ref() {
                println!("confirmed {:?}", tx);
            }
            if let Some(url) = handle.explorer_url() {
                println!("{}", url);
            }
            Ok(())
        }
        TxStage::Idle => {
            println!("cancelled");
            Ok(())
        }
        stage => match handle.alert() {
            Some(Alert::Blocking(m)) | Some(Alert::Inline(m)) | Some(Alert::Finalized(m)) | Some(Alert::Failure(m)) => {
                Err(anyhow!(m))
            }
            None => Err(anyhow!("transaction ended in {:?}", stage)),
        },
    }
}

pub(crate) async fn run(ctx: Context, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Watch {
            contest,
            project,
            seconds,
        } => watch_pool(&ctx, ContestRef::new(contest, project), seconds).await,
        Commands::Quote {
            contest,
            project,
            outcome,
            amount,
        } => quote(&ctx, ContestRef::new(contest, project), outcome, amount).await,
        Commands::Stake {
            contest,
            project,
            outcome,
            amount,
        } => stake(&ctx, &contest, &project, outcome, &amount).await,
        Commands::Claim { contest } => claim(&ctx, contest).await,
        Commands::ClaimOwner {
            contest,
            project,
            outcome,
        } => claim_owner(&ctx, ContestRef::new(contest, project), outcome).await,
        Commands::SetWinners {
            contest,
            win_prize,
            finalist,
            vc_meeting,
        } => {
            let mut draft = WinnerSet::default();
            for (outcome, ids) in [
                (OutcomeKind::WinPrize, win_prize),
                (OutcomeKind::Finalist, finalist),
                (OutcomeKind::VcMeeting, vc_meeting),
            ] {
                for id in ids {
                    draft.toggle(&id, outcome);
                }
            }
            set_winners(&ctx, contest, draft).await
        }
        Commands::Rewards { contests } => rewards(&ctx, contests).await,
        Commands::ShowConfig | Commands::Serve => bail!("not a ledger command"),
    }
}

async fn watch_pool(ctx: &Context, contest: ContestRef, seconds: Option<u64>) -> anyhow::Result<()> {
    ctx.check_chain().await;
    let fallback = ctx.project(contest.project_id())?.fallback();
    let feed = ChangeFeed::spawn(ctx.ledger.as_ref());
    let pool = PoolSync::activate(ctx.ledger.clone(), &feed, contest.clone(), &ctx.config.sync);
    let mut changes = pool.changed();
    let deadline = tokio::time::sleep(Duration::from_secs(seconds.unwrap_or(u64::MAX / 4)));
    tokio::pin!(deadline);

    let print = |shown: PoolSnapshot| {
        let line = OutcomeKind::ALL
            .iter()
            .map(|o| format!("{} {}", o, format_units(shown.amount(*o))))
            .collect::<Vec<_>>()
            .join(" | ");
        println!("{} {} | total {}", contest, line, format_units(shown.total()));
    };
    print(pool.display_snapshot(&fallback));

    loop {
        tokio::select! {
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                let shown = changes.borrow_and_update().with_fallback(&fallback);
                print(shown);
            }
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

async fn quote(ctx: &Context, contest: ContestRef, outcome: OutcomeKind, amount: Option<f64>) -> anyhow::Result<()> {
    let project = ctx.project(contest.project_id())?;
    let feed = ChangeFeed::detached();
    let pool = PoolSync::activate(ctx.ledger.clone(), &feed, contest, &ctx.config.sync);
    first_change(&mut pool.changed(), ctx.request_timeout()).await;
    let quote = Quote::compute(&pool.display_snapshot(&project.fallback()), &project.odds(), amount, outcome);
    println!("{}", serde_json::to_string_pretty(&quote)?);
    Ok(())
}

async fn stake(ctx: &Context, contest_id: &str, project_id: &str, outcome: OutcomeKind, amount: &str) -> anyhow::Result<()> {
    let amount = parse_units(amount)?;
    let staker = ctx.config.require_account()?;
    let project = ctx.project(project_id)?;
    let book = Arc::new(Mutex::new(StakeBook::default()));
    let op = PlaceStake::on_project(&project, contest_id, outcome, amount, staker, book.clone())?;
    info!(
        "staking {} on {} of {}/{}, potential win {:.2}",
        format_units(amount),
        outcome,
        contest_id,
        project_id,
        op.potential_win()
    );

    let handle = ctx.controller().run(&op).await;
    report(&handle)?;
    if let Ok(book) = book.lock() {
        let (staked, potential) = book.summary();
        println!("staked {:.4}, potential win {:.4}", staked, potential);
    }
    Ok(())
}

async fn claim(ctx: &Context, contest_id: String) -> anyhow::Result<()> {
    let user = ctx.config.require_account()?;
    let tracker = Arc::new(RewardTracker::staker(
        ctx.ledger.clone(),
        user,
        [contest_id.clone()],
        &ctx.config.sync,
    ));
    let target = ClaimTarget::Staker {
        user,
        contest_id: contest_id.clone(),
    };
    // an unconfigured ledger is reported by the controller
    if ctx.ledger.is_configured() {
        first_change(&mut tracker.changed(), ctx.request_timeout()).await;
        if !tracker.can_claim(&target) {
            println!("nothing to claim in {}", contest_id);
            return Ok(());
        }
    }
    let op = ClaimRewards::new(user, contest_id, Some(tracker));
    report(&ctx.controller().run(&op).await)
}

async fn claim_owner(ctx: &Context, contest: ContestRef, outcome: OutcomeKind) -> anyhow::Result<()> {
    let connected = ctx.config.account_address()?;
    let project = ctx.project(contest.project_id())?;
    let owner = project
        .owner()
        .with_context(|| format!("project {} has no owner address", contest.project_id()))?;
    if connected != Some(owner) {
        bail!("only the project owner can claim owner rewards");
    }
    let tracker = Arc::new(RewardTracker::project_owner(
        ctx.ledger.clone(),
        connected,
        owner,
        contest.clone(),
        &ctx.config.sync,
    ));
    let target = ClaimTarget::ProjectOwner {
        contest: contest.clone(),
        outcome,
    };
    if ctx.ledger.is_configured() {
        first_change(&mut tracker.changed(), ctx.request_timeout()).await;
        if !tracker.can_claim(&target) {
            println!("no {} owner reward for {}", outcome, contest);
            return Ok(());
        }
    }
    let op = ClaimOwnerReward::new(contest, outcome, Some(tracker));
    report(&ctx.controller().run(&op).await)
}

async fn set_winners(ctx: &Context, contest_id: String, draft: WinnerSet) -> anyhow::Result<()> {
    if draft.is_empty() {
        bail!("no winners given");
    }
    let draft = match ctx.catalog.load_winners(&contest_id)? {
        Some(stored) if stored.finalized => stored,
        _ => draft,
    };
    let op = SetWinners::new(contest_id, Arc::new(Mutex::new(draft)), Some(ctx.catalog.clone()));
    report(&ctx.controller().run(&op).await)
}

async fn rewards(ctx: &Context, contests: Vec<String>) -> anyhow::Result<()> {
    let user = ctx.config.require_account()?;
    let contests = if contests.is_empty() {
        ctx.catalog.all_hackathons()?.into_keys().collect()
    } else {
        contests
    };
    if !ctx.ledger.is_configured() {
        bail!("staking contract not configured");
    }
    let tracker = RewardTracker::staker(ctx.ledger.clone(), user, contests, &ctx.config.sync);
    first_change(&mut tracker.changed(), ctx.request_timeout()).await;
    let visible = tracker.visible();
    if visible.is_empty() {
        println!("nothing to claim");
    }
    for reward in visible {
        println!("{}: {}", reward.target, format_units(reward.amount));
    }
    Ok(())
}

pub(crate) async fn serve(ctx: Context) -> anyhow::Result<()> {
    use actix_web::{web, App, HttpServer};

    ctx.check_chain().await;
    let feed = ChangeFeed::spawn(ctx.ledger.as_ref());
    let views = web::Data::new(Views::new(
        ctx.ledger.clone(),
        feed,
        ctx.catalog.clone(),
        ctx.config.sync.clone(),
    ));
    info!("listening on {}", ctx.config.http_listen);
    HttpServer::new(move || {
        App::new()
            .app_data(views.clone())
            .configure(api::configure::<ChainLedger, Store>)
    })
    .bind(&ctx.config.http_listen)?
    .workers(1)
    .run()
    .await?;
    Ok(())
}
