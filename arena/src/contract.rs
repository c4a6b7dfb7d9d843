use crate::config::{Config, LedgerSettings};
use crate::error::{Error, Result};
use crate::ledger::{Ledger, LedgerCall, Receipt};
use crate::types::{ContestRef, OutcomeKind, StakePlaced};
use crate::utils::{extract_keypair_from_str, handle_error, TaskGuard};
use lazy_static::lazy_static;
use log::{debug, warn};
use reqwest::{Client, Url};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use web3::{
    self,
    contract::{Contract, Options},
    ethabi::{self, RawLog, Token},
    futures::{channel::mpsc, stream::BoxStream, Stream, StreamExt},
    signing::SecretKey,
    transports::Http,
    types::{Address, BlockNumber, FilterBuilder, Log, H256, U256},
};

/// ABI of the staking contract.
pub const STAKING_ABI: &str = r#"[
  {"name":"stake","type":"function","stateMutability":"payable",
   "inputs":[{"name":"hackathonId","type":"string"},{"name":"projectId","type":"string"},
             {"name":"outcome","type":"uint8"},{"name":"projectOwnerAddress","type":"address"}],
   "outputs":[]},
  {"name":"getStake","type":"function","stateMutability":"view",
   "inputs":[{"name":"user","type":"address"},{"name":"hackathonId","type":"string"},
             {"name":"projectId","type":"string"},{"name":"outcome","type":"uint8"}],
   "outputs":[{"name":"amount","type":"uint256"}]},
  {"name":"getTotalStaked","type":"function","stateMutability":"view",
   "inputs":[{"name":"hackathonId","type":"string"},{"name":"projectId","type":"string"},
             {"name":"outcome","type":"uint8"}],
   "outputs":[{"name":"total","type":"uint256"}]},
  {"name":"setWinners","type":"function","stateMutability":"nonpayable",
   "inputs":[{"name":"hackathonId","type":"string"},{"name":"winPrizeProjectIds","type":"string[]"},
             {"name":"finalistProjectIds","type":"string[]"},{"name":"vcMeetingProjectIds","type":"string[]"}],
   "outputs":[]},
  {"name":"claimRewards","type":"function","stateMutability":"nonpayable",
   "inputs":[{"name":"hackathonId","type":"string"}],"outputs":[]},
  {"name":"claimProjectOwnerReward","type":"function","stateMutability":"nonpayable",
   "inputs":[{"name":"hackathonId","type":"string"},{"name":"projectId","type":"string"},
             {"name":"outcome","type":"uint8"}],
   "outputs":[]},
  {"name":"getClaimableReward","type":"function","stateMutability":"view",
   "inputs":[{"name":"user","type":"address"},{"name":"hackathonId","type":"string"}],
   "outputs":[{"name":"amount","type":"uint256"}]},
  {"name":"getProjectOwnerReward","type":"function","stateMutability":"view",
   "inputs":[{"name":"hackathonId","type":"string"},{"name":"projectId","type":"string"},
             {"name":"outcome","type":"uint8"}],
   "outputs":[{"name":"amount","type":"uint256"}]},
  {"name":"winnersSet","type":"function","stateMutability":"view",
   "inputs":[{"name":"hackathonId","type":"string"}],
   "outputs":[{"name":"set","type":"bool"}]},
  {"name":"StakePlaced","type":"event","anonymous":false,
   "inputs":[{"name":"user","type":"address","indexed":true},
             {"name":"hackathonId","type":"string","indexed":false},
             {"name":"projectId","type":"string","indexed":false},
             {"name":"outcome","type":"uint8","indexed":false},
             {"name":"amount","type":"uint256","indexed":false},
             {"name":"timestamp","type":"uint256","indexed":false}]}
]"#;

lazy_static! {
    static ref STAKING_CONTRACT: Option<ethabi::Contract> = ethabi::Contract::load(STAKING_ABI.as_bytes()).ok();
}

const EVENT_RETRY_SECS: u64 = 3;

fn staking_abi() -> Result<&'static ethabi::Contract> {
    STAKING_CONTRACT
        .as_ref()
        .ok_or_else(|| Error::Protocol("embedded staking ABI does not parse".to_string()))
}

/// Who signs writes.
#[derive(Clone)]
pub enum Signer {
    /// The node or connected wallet signs for this account.
    Node(Address),
    Local(SecretKey),
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Signer::Node(addr) => write!(f, "Node({:?})", addr),
            Signer::Local(_) => write!(f, "Local(..)"),
        }
    }
}

/// [`Ledger`] bound to a deployed staking contract over JSON-RPC.
#[derive(Debug, Clone)]
pub struct ChainLedger {
    web3: web3::Web3<Http>,
    contract: Option<Contract<Http>>,
    settings: LedgerSettings,
    signer: Option<Signer>,
    event_poll: Duration,
}

impl ChainLedger {
    pub fn setup(config: &Config) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.sync.request_timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("http client: {}", e)))?;
        let url = Url::parse(config.chain.endpoint.as_str())
            .map_err(|e| Error::Config(format!("bad endpoint {}: {}", config.chain.endpoint, e)))?;
        let transport = Http::with_client(client, url);
        let web3 = web3::Web3::new(transport);

        let settings = config.ledger_settings()?;
        let contract = match settings.address {
            Some(addr) => Some(Contract::new(web3.eth(), addr, staking_abi()?.clone())),
            None => {
                warn!("staking contract address not configured, reads and writes are disabled");
                None
            }
        };
        let signer = if !config.account.secret.trim().is_empty() {
            let (sk, _) = extract_keypair_from_str(&config.account.secret)?;
            Some(Signer::Local(sk))
        } else {
            config.account_address()?.map(Signer::Node)
        };

        Ok(Self {
            web3,
            contract,
            settings,
            signer,
            event_poll: config.sync.poll_interval(),
        })
    }

    pub fn settings(&self) -> &LedgerSettings {
        &self.settings
    }

    pub async fn chain_id(&self) -> Result<U256> {
        Ok(self.web3.eth().chain_id().await?)
    }

    fn contract(&self) -> Result<&Contract<Http>> {
        self.contract.as_ref().ok_or(Error::NotConfigured)
    }

    async fn query_uint(&self, func: &str, params: Vec<Token>) -> Result<U256> {
        let contract = self.contract()?;
        let res: std::result::Result<U256, web3::contract::Error> =
            contract.query(func, &params[..], None, Options::default(), None).await;
        res.map_err(|e| Error::Read(format!("{}: {}", func, handle_error(e))))
    }
}

fn outcome_token(outcome: OutcomeKind) -> Token {
    Token::Uint(U256::from(outcome.ordinal()))
}

fn string_list(ids: &std::collections::BTreeSet<String>) -> Token {
    Token::Array(ids.iter().cloned().map(Token::String).collect())
}

/// Encode a call into its ABI argument list.
pub fn call_args(call: &LedgerCall) -> Vec<Token> {
    match call {
        LedgerCall::PlaceStake(intent) => vec![
            Token::String(intent.contest.contest_id().to_string()),
            Token::String(intent.contest.project_id().to_string()),
            outcome_token(intent.outcome),
            Token::Address(intent.payee),
        ],
        LedgerCall::SetWinners { contest_id, winners } => vec![
            Token::String(contest_id.clone()),
            string_list(&winners.win_prize),
            string_list(&winners.finalist),
            string_list(&winners.vc_meeting),
        ],
        LedgerCall::ClaimRewards { contest_id } => vec![Token::String(contest_id.clone())],
        LedgerCall::ClaimProjectOwnerReward { contest, outcome } => vec![
            Token::String(contest.contest_id().to_string()),
            Token::String(contest.project_id().to_string()),
            outcome_token(*outcome),
        ],
    }
}

/// Decode a raw `StakePlaced` log.
pub fn decode_stake_placed(log: Log) -> Result<StakePlaced> {
    let event = staking_abi()?.event("StakePlaced")?;
    let parsed = event.parse_log(RawLog {
        topics: log.topics,
        data: log.data.0,
    })?;

    let mut user = None;
    let mut contest_id = None;
    let mut project_id = None;
    let mut outcome = None;
    let mut amount = None;
    let mut timestamp = None;
    for param in parsed.params {
        match (param.name.as_str(), param.value) {
            ("user", Token::Address(a)) => user = Some(a),
            ("hackathonId", Token::String(s)) => contest_id = Some(s),
            ("projectId", Token::String(s)) => project_id = Some(s),
            ("outcome", Token::Uint(o)) => outcome = Some(o),
            ("amount", Token::Uint(a)) => amount = Some(a),
            ("timestamp", Token::Uint(t)) => timestamp = Some(t),
            (name, value) => debug!("ignoring StakePlaced param {} = {:?}", name, value),
        }
    }
    let missing = |field: &str| Error::Protocol(format!("StakePlaced without {}", field));
    let outcome = outcome.ok_or_else(|| missing("outcome"))?;
    if outcome > U256::from(u8::MAX) {
        return Err(Error::Protocol(format!("outcome ordinal {} out of range", outcome)));
    }
    let timestamp = timestamp.ok_or_else(|| missing("timestamp"))?;
    if timestamp > U256::from(u64::MAX) {
        return Err(Error::Protocol(format!("timestamp {} out of range", timestamp)));
    }

    Ok(StakePlaced {
        user: user.ok_or_else(|| missing("user"))?,
        contest: ContestRef::new(
            contest_id.ok_or_else(|| missing("hackathonId"))?,
            project_id.ok_or_else(|| missing("projectId"))?,
        ),
        outcome: OutcomeKind::try_from(outcome.low_u32() as u8)?,
        amount: amount.ok_or_else(|| missing("amount"))?,
        timestamp: timestamp.as_u64(),
    })
}

impl Ledger for ChainLedger {
    fn is_configured(&self) -> bool {
        self.settings.is_configured()
    }

    async fn total_staked(&self, contest: &ContestRef, outcome: OutcomeKind) -> Result<U256> {
        self.query_uint(
            "getTotalStaked",
            vec![
                Token::String(contest.contest_id().to_string()),
                Token::String(contest.project_id().to_string()),
                outcome_token(outcome),
            ],
        )
        .await
    }

    async fn stake_of(&self, user: Address, contest: &ContestRef, outcome: OutcomeKind) -> Result<U256> {
        self.query_uint(
            "getStake",
            vec![
                Token::Address(user),
                Token::String(contest.contest_id().to_string()),
                Token::String(contest.project_id().to_string()),
                outcome_token(outcome),
            ],
        )
        .await
    }

    async fn winners_set(&self, contest_id: &str) -> Result<bool> {
        let contract = self.contract()?;
        let res: std::result::Result<bool, web3::contract::Error> = contract
            .query(
                "winnersSet",
                &[Token::String(contest_id.to_string())][..],
                None,
                Options::default(),
                None,
            )
            .await;
        res.map_err(|e| Error::Read(format!("winnersSet: {}", handle_error(e))))
    }

    async fn claimable_reward(&self, user: Address, contest_id: &str) -> Result<U256> {
        self.query_uint(
            "getClaimableReward",
            vec![Token::Address(user), Token::String(contest_id.to_string())],
        )
        .await
    }

    async fn project_owner_reward(&self, contest: &ContestRef, outcome: OutcomeKind) -> Result<U256> {
        self.query_uint(
            "getProjectOwnerReward",
            vec![
                Token::String(contest.contest_id().to_string()),
                Token::String(contest.project_id().to_string()),
                outcome_token(outcome),
            ],
        )
        .await
    }

    async fn balance(&self, user: Address) -> Result<U256> {
        Ok(self.web3.eth().balance(user, Some(BlockNumber::Latest)).await?)
    }

    async fn send(&self, call: LedgerCall) -> Result<H256> {
        let contract = self.contract()?;
        let opt = Options {
            gas: Some(self.settings.gas_limit.into()),
            value: Some(call.value()),
            ..Default::default()
        };
        let func = call.method();
        let args = call_args(&call);
        match &self.signer {
            Some(Signer::Local(sk)) => contract
                .signed_call(func, &args[..], opt, sk)
                .await
                .map_err(|e| Error::Write(e.to_string())),
            Some(Signer::Node(from)) => contract
                .call(func, &args[..], *from, opt)
                .await
                .map_err(|e| Error::Write(handle_error(e))),
            None => Err(Error::Config("no account configured to sign with".to_string())),
        }
    }

    async fn receipt(&self, tx: H256) -> Result<Option<Receipt>> {
        let receipt = self.web3.eth().transaction_receipt(tx).await?;
        Ok(receipt.map(|r| Receipt {
            tx,
            block_number: r.block_number.map(|n| n.as_u64()),
            success: r.status.map(|s| s.as_u64() == 1).unwrap_or(false),
        }))
    }

    fn stake_events(&self) -> BoxStream<'static, StakePlaced> {
        let (tx, rx) = mpsc::unbounded();
        let Some(address) = self.settings.address else {
            return rx.boxed();
        };
        let web3 = self.web3.clone();
        let poll = self.event_poll;
        let pump = TaskGuard::spawn(async move {
            let topic = match staking_abi().and_then(|abi| Ok(abi.event("StakePlaced")?.signature())) {
                Ok(t) => t,
                Err(e) => {
                    warn!("cannot watch StakePlaced: {}", e);
                    return;
                }
            };
            let mut retries = 1u64;
            loop {
                let filter = FilterBuilder::default()
                    .address(vec![address])
                    .topics(Some(vec![topic]), None, None, None)
                    .from_block(BlockNumber::Latest)
                    .build();
                match web3.eth_filter().create_logs_filter(filter).await {
                    Ok(filter) => {
                        retries = 1;
                        if let PumpEnd::ListenerGone = forward_logs(Box::pin(filter.stream(poll)), &tx).await {
                            debug!("StakePlaced listener gone, stop watching");
                            return;
                        }
                    }
                    Err(e) => warn!("failed to install StakePlaced filter, retries {}, {:?}", retries, e),
                }
                if tx.is_closed() {
                    return;
                }
                retries += 1;
                tokio::time::sleep(Duration::from_secs(EVENT_RETRY_SECS)).await;
            }
        });
        EventStream { events: rx, _pump: pump }.boxed()
    }
}

enum PumpEnd {
    ListenerGone,
    Interrupted,
}

/// Decode and forward logs until the filter fails or the listener goes away.
/// A log that does not decode is dropped, the rest of the batch still flows.
async fn forward_logs<S>(mut logs: S, tx: &mpsc::UnboundedSender<StakePlaced>) -> PumpEnd
where
    S: Stream<Item = web3::Result<Log>> + Unpin,
{
    while let Some(log) = logs.next().await {
        let log = match log {
            Ok(log) => log,
            Err(e) => {
                warn!("StakePlaced filter error, reconnecting: {}", e);
                return PumpEnd::Interrupted;
            }
        };
        match decode_stake_placed(log) {
            Ok(event) => {
                if tx.unbounded_send(event).is_err() {
                    return PumpEnd::ListenerGone;
                }
            }
            Err(e) => warn!("dropping StakePlaced log: {}", e),
        }
    }
    PumpEnd::Interrupted
}

/// Notifications of one subscription. Dropping it stops the log filter.
struct EventStream {
    events: mpsc::UnboundedReceiver<StakePlaced>,
    _pump: TaskGuard,
}

impl Stream for EventStream {
    type Item = StakePlaced;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StakePlaced>> {
        self.events.poll_next_unpin(cx)
    }
}
