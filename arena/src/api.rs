use crate::catalog::{Catalog, KvStore, Project};
use crate::config::SyncOpts;
use crate::feed::{ActivityEntry, ActivityWatcher, ChangeFeed};
use crate::ledger::Ledger;
use crate::odds::{Quote, DEFAULT_ODDS};
use crate::sync::PoolSync;
use crate::types::{ContestRef, OutcomeKind, Outcomes, PoolSnapshot};
use crate::utils::{format_units, TaskGuard};
use actix_web::{body::BoxBody, error, web, Error, HttpRequest, HttpResponse, Responder};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::{interval, Instant};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ApiResult<T = ()> {
    pub code: i32,
    pub msg: Option<Cow<'static, str>>,
    pub data: Option<T>,
}

impl<T: Serialize> ApiResult<T> {
    pub fn new() -> Self {
        Self {
            code: 200,
            msg: None,
            data: None,
        }
    }
    pub fn code(mut self, code: i32) -> Self {
        self.code = code;
        self
    }
    pub fn with_msg<S: Into<Cow<'static, str>>>(mut self, msg: S) -> Self {
        self.msg = Some(msg.into());
        self
    }
    pub fn with_data(mut self, data: T) -> Self {
        self.data = Some(data);
        self
    }
    pub fn log_to_resp(&self, req: &HttpRequest) -> HttpResponse {
        self.log(req);
        self.to_resp()
    }
    pub fn log(&self, req: &HttpRequest) {
        info!(
            "{} \"{} {} {:?}\" {}",
            req.peer_addr().map(|a| a.to_string()).unwrap_or_else(|| "-".to_string()),
            req.method(),
            req.uri(),
            req.version(),
            self.code
        );
    }
    pub fn to_resp(&self) -> HttpResponse {
        match serde_json::to_string(self) {
            Ok(json) => HttpResponse::Ok().content_type("application/json").body(json),
            Err(e) => Error::from(e).into(),
        }
    }
}

impl<T: Serialize> Default for ApiResult<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Serialize> Responder for ApiResult<T> {
    type Body = BoxBody;

    fn respond_to(self, req: &HttpRequest) -> HttpResponse {
        (&self).respond_to(req)
    }
}

impl<T: Serialize> Responder for &ApiResult<T> {
    type Body = BoxBody;

    fn respond_to(self, req: &HttpRequest) -> HttpResponse {
        self.log_to_resp(req)
    }
}

// return 200 all
pub fn json_error_handler<E: std::fmt::Display + std::fmt::Debug + 'static>(err: E, req: &HttpRequest) -> error::Error {
    let detail = err.to_string();
    let api = ApiResult::new().with_data(()).code(400).with_msg(detail);
    let response = api.log_to_resp(req);

    error::InternalError::from_response(err, response).into()
}

pub async fn notfound(req: HttpRequest) -> Result<HttpResponse, Error> {
    let api = ApiResult::new().with_data(()).code(404).with_msg("route not found");

    Ok(api.respond_to(&req))
}

/// An observer is dropped after this many poll intervals without a request.
const IDLE_POLLS: u32 = 3;

struct Entry<T> {
    observer: Arc<T>,
    last_read: Instant,
}

/// Live observers keyed by project.
struct Registry<L: Ledger> {
    pools: Mutex<HashMap<ContestRef, Entry<PoolSync<L>>>>,
    activity: Mutex<HashMap<ContestRef, Entry<ActivityWatcher>>>,
}

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn touch<T>(
    entries: &Mutex<HashMap<ContestRef, Entry<T>>>,
    contest: &ContestRef,
    activate: impl FnOnce() -> T,
) -> Arc<T> {
    let mut entries = locked(entries);
    let entry = entries.entry(contest.clone()).or_insert_with(|| Entry {
        observer: Arc::new(activate()),
        last_read: Instant::now(),
    });
    entry.last_read = Instant::now();
    entry.observer.clone()
}

fn evict_idle<T>(entries: &Mutex<HashMap<ContestRef, Entry<T>>>, idle: Duration, kind: &str) {
    let now = Instant::now();
    locked(entries).retain(|contest, entry| {
        let keep = now.duration_since(entry.last_read) < idle;
        if !keep {
            info!("{} {} idle, released", kind, contest);
        }
        keep
    });
}

impl<L: Ledger> Registry<L> {
    fn sweep(&self, idle: Duration) {
        evict_idle(&self.pools, idle, "pool");
        evict_idle(&self.activity, idle, "activity");
    }
}

/// Observers shared by every request. Activated on first use for catalog
/// projects, released once nobody has asked for them for a while.
pub struct Views<L: Ledger, S: KvStore> {
    ledger: Arc<L>,
    feed: ChangeFeed,
    catalog: Arc<Catalog<S>>,
    opts: SyncOpts,
    registry: Arc<Registry<L>>,
    _reaper: TaskGuard,
}

impl<L: Ledger, S: KvStore> Views<L, S> {
    pub fn new(ledger: Arc<L>, feed: ChangeFeed, catalog: Arc<Catalog<S>>, opts: SyncOpts) -> Self {
        let registry = Arc::new(Registry {
            pools: Mutex::new(HashMap::new()),
            activity: Mutex::new(HashMap::new()),
        });
        let idle = opts.poll_interval() * IDLE_POLLS;
        let period = opts.poll_interval().max(Duration::from_millis(1));
        let sweeper = registry.clone();
        let reaper = TaskGuard::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                sweeper.sweep(idle);
            }
        });
        Self {
            ledger,
            feed,
            catalog,
            opts,
            registry,
            _reaper: reaper,
        }
    }

    /// `None` for projects the catalog does not know.
    pub fn pool(&self, contest: &ContestRef) -> Option<Arc<PoolSync<L>>> {
        self.project(contest.project_id())?;
        Some(touch(&self.registry.pools, contest, || {
            info!("activating pool {}", contest);
            PoolSync::activate(self.ledger.clone(), &self.feed, contest.clone(), &self.opts)
        }))
    }

    pub fn activity(&self, contest: &ContestRef) -> Option<Arc<ActivityWatcher>> {
        self.project(contest.project_id())?;
        Some(touch(&self.registry.activity, contest, || {
            ActivityWatcher::follow(&self.feed, contest.clone())
        }))
    }

    pub fn active_pools(&self) -> usize {
        locked(&self.registry.pools).len()
    }

    pub fn project(&self, project_id: &str) -> Option<Project> {
        match self.catalog.project(project_id) {
            Ok(project) => project,
            Err(e) => {
                warn!("catalog lookup of {} failed: {}", project_id, e);
                None
            }
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolView {
    pub contest: ContestRef,
    pub amounts: Outcomes<String>,
    pub display: Outcomes<String>,
    pub total: String,
    pub display_total: String,
    pub loaded: Outcomes<bool>,
}

#[derive(Debug, Deserialize)]
pub struct QuoteQuery {
    pub outcome: String,
    pub amount: Option<f64>,
}

fn unknown_project<T: Serialize>(contest: &ContestRef) -> ApiResult<T> {
    ApiResult::new().code(404).with_msg(format!("unknown project {}", contest.project_id()))
}

async fn pool_view<L: Ledger, S: KvStore + 'static>(
    views: web::Data<Views<L, S>>,
    path: web::Path<(String, String)>,
) -> ApiResult<PoolView> {
    let (contest_id, project_id) = path.into_inner();
    let contest = ContestRef::new(contest_id, project_id);
    let (Some(project), Some(pool)) = (views.project(contest.project_id()), views.pool(&contest)) else {
        return unknown_project(&contest);
    };
    let snapshot = pool.snapshot();
    let shown = snapshot.with_fallback(&project.fallback());
    ApiResult::new().with_data(PoolView {
        amounts: Outcomes::from_fn(|o| format_units(snapshot.amount(o))),
        display: Outcomes::from_fn(|o| format_units(shown.amount(o))),
        total: format_units(snapshot.total()),
        display_total: format_units(shown.total()),
        loaded: Outcomes::from_fn(|o| snapshot.is_loaded(o)),
        contest,
    })
}

/// Unknown projects are quoted at the default odds against an empty pool.
async fn quote_view<L: Ledger, S: KvStore + 'static>(
    views: web::Data<Views<L, S>>,
    path: web::Path<(String, String)>,
    query: web::Query<QuoteQuery>,
) -> ApiResult<Quote> {
    let outcome: OutcomeKind = match query.outcome.parse() {
        Ok(outcome) => outcome,
        Err(e) => return ApiResult::new().code(400).with_msg(e),
    };
    let (contest_id, project_id) = path.into_inner();
    let contest = ContestRef::new(contest_id, project_id);
    let (odds, shown) = match (views.project(contest.project_id()), views.pool(&contest)) {
        (Some(project), Some(pool)) => (project.odds(), pool.display_snapshot(&project.fallback())),
        _ => (DEFAULT_ODDS, PoolSnapshot::default()),
    };
    ApiResult::new().with_data(Quote::compute(&shown, &odds, query.amount, outcome))
}

async fn activity_view<L: Ledger, S: KvStore + 'static>(
    views: web::Data<Views<L, S>>,
    path: web::Path<(String, String)>,
) -> ApiResult<Vec<ActivityEntry>> {
    let (contest_id, project_id) = path.into_inner();
    let contest = ContestRef::new(contest_id, project_id);
    match views.activity(&contest) {
        Some(watcher) => ApiResult::new().with_data(watcher.entries()),
        None => unknown_project(&contest),
    }
}

/// Routes of the view server.
pub fn configure<L: Ledger, S: KvStore + 'static>(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::QueryConfig::default().error_handler(|err, req| json_error_handler(err, req)))
        .route("/pool/{contest}/{project}", web::get().to(pool_view::<L, S>))
        .route("/quote/{contest}/{project}", web::get().to(quote_view::<L, S>))
        .route("/activity/{contest}/{project}", web::get().to(activity_view::<L, S>))
        .default_service(web::route().to(notfound));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{MemoryStore, OutcomeOdds};
    use crate::testing::{stake_event, user, MockLedger};
    use crate::utils::units;
    use actix_web::{test, App};
    use serde_json::Value;
    use std::time::Duration;

    fn views(ledger: &Arc<MockLedger>) -> web::Data<Views<MockLedger, MemoryStore>> {
        let catalog = Catalog::new(MemoryStore::default());
        catalog
            .add_project(Project {
                id: "p1".to_string(),
                outcomes: Outcomes {
                    win_prize: OutcomeOdds { odds: 3.0, staked: 0.0 },
                    finalist: OutcomeOdds { odds: 1.5, staked: 0.0 },
                    vc_meeting: OutcomeOdds { odds: 2.0, staked: 80.0 },
                },
                ..Default::default()
            })
            .unwrap();
        let feed = ChangeFeed::spawn(ledger.as_ref());
        web::Data::new(Views::new(ledger.clone(), feed, Arc::new(catalog), SyncOpts::default()))
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_pools_stop_reading() {
        let ledger = Arc::new(MockLedger::new());
        let views = views(&ledger);
        for i in 0..50 {
            assert!(views.pool(&ContestRef::new(format!("junk{}", i), "x")).is_none());
        }
        assert!(views.pool(&ContestRef::new("h1", "p1")).is_some());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(ledger.reads(), 3);
        assert_eq!(views.active_pools(), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(views.active_pools(), 0);
        let reads = ledger.reads();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(ledger.reads(), reads);
    }

    #[tokio::test(start_paused = true)]
    async fn pools_in_use_stay_active() {
        let ledger = Arc::new(MockLedger::new());
        let views = views(&ledger);
        let contest = ContestRef::new("h1", "p1");
        for _ in 0..12 {
            assert!(views.pool(&contest).is_some());
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        assert_eq!(views.active_pools(), 1);
        assert!(ledger.reads() >= 30);
    }

    macro_rules! get {
        ($app:expr, $uri:expr) => {{
            let req = test::TestRequest::get().uri($uri).to_request();
            let body: Value = test::call_and_read_body_json(&$app, req).await;
            body
        }};
    }

    #[actix_web::test]
    async fn pool_view_shows_fallback_until_stakes_arrive() {
        let ledger = Arc::new(MockLedger::new());
        let contest = ContestRef::new("h1", "p1");
        ledger.set_total(&contest, OutcomeKind::Finalist, units(500));
        let app = test::init_service(
            App::new()
                .app_data(views(&ledger))
                .configure(configure::<MockLedger, MemoryStore>),
        )
        .await;

        get!(app, "/pool/h1/p1");
        tokio::time::sleep(Duration::from_millis(50)).await;
        let body = get!(app, "/pool/h1/p1");
        assert_eq!(body["code"], 200);
        assert_eq!(body["data"]["amounts"]["finalist"], "500");
        assert_eq!(body["data"]["display"]["vcMeeting"], "80");
        assert_eq!(body["data"]["total"], "500");
        assert_eq!(body["data"]["displayTotal"], "580");
        assert_eq!(body["data"]["loaded"]["winPrize"], true);
    }

    #[actix_web::test]
    async fn quote_uses_catalog_odds() {
        let ledger = Arc::new(MockLedger::new());
        let app = test::init_service(
            App::new()
                .app_data(views(&ledger))
                .configure(configure::<MockLedger, MemoryStore>),
        )
        .await;

        let body = get!(app, "/quote/h1/p1?outcome=winPrize&amount=10");
        assert_eq!(body["data"]["potentialReturn"], 30.0);
        assert_eq!(body["data"]["roiPercent"], 200.0);

        let body = get!(app, "/quote/h1/p2?outcome=finalist");
        assert_eq!(body["data"]["odds"], 1.5);
        assert_eq!(body["data"]["roiPercent"], Value::Null);

        let body = get!(app, "/quote/h1/p1?outcome=loser");
        assert_eq!(body["code"], 400);

        let body = get!(app, "/quote/h1/p1");
        assert_eq!(body["code"], 400);
    }

    #[actix_web::test]
    async fn activity_and_unknown_routes() {
        let ledger = Arc::new(MockLedger::new());
        let app = test::init_service(
            App::new()
                .app_data(views(&ledger))
                .configure(configure::<MockLedger, MemoryStore>),
        )
        .await;

        let body = get!(app, "/activity/h1/p1");
        assert_eq!(body["data"].as_array().map(|a| a.len()), Some(0));
        ledger.emit(stake_event(&ContestRef::new("h1", "p1"), user(4), 12, 7));
        ledger.emit(stake_event(&ContestRef::new("h1", "p1"), user(4), 12, 7));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let body = get!(app, "/activity/h1/p1");
        assert_eq!(body["data"][0]["amount"], "12");
        assert_eq!(body["data"].as_array().map(|a| a.len()), Some(1));

        let body = get!(app, "/activity/h1/p9");
        assert_eq!(body["code"], 404);
        let body = get!(app, "/pool/junk/x");
        assert_eq!(body["code"], 404);
        assert_eq!(ledger.reads(), 0);

        let body = get!(app, "/nowhere");
        assert_eq!(body["code"], 404);
    }
}
