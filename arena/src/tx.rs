//! One state machine for every user-initiated write.
//!
//! `Idle -> Submitting -> AwaitingApproval -> Broadcasting -> Confirming -> Confirmed`,
//! with `Failed` reachable from every non-Idle stage and `Idle` again on dismissal.

use crate::config::{LedgerSettings, SyncOpts};
use crate::error::{Alert, Error, FailureReason, Result};
use crate::ledger::{Ledger, LedgerCall, Receipt};
use log::{debug, info, warn};
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use web3::types::H256;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TxStage {
    #[default]
    Idle,
    Submitting,
    AwaitingApproval,
    Broadcasting,
    Confirming,
    Confirmed,
    Failed(FailureReason),
}

impl TxStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxStage::Confirmed | TxStage::Failed(_))
    }

    /// Between submission and a terminal stage.
    pub fn is_in_flight(&self) -> bool {
        !matches!(self, TxStage::Idle) && !self.is_terminal()
    }

    fn allows(&self, next: &TxStage) -> bool {
        use TxStage::*;
        match (self, next) {
            (Idle, Submitting)
            | (Submitting, AwaitingApproval)
            | (AwaitingApproval, Broadcasting)
            | (Broadcasting, Confirming)
            | (Confirming, Confirmed) => true,
            // configuration is checked before anything is submitted
            (Idle, Failed(FailureReason::ContractNotConfigured)) => true,
            (Submitting | AwaitingApproval | Broadcasting | Confirming, Failed(_)) => true,
            (Confirmed | Failed(_), Idle) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionHandle {
    stage: TxStage,
    tx_ref: Option<H256>,
    error: Option<FailureReason>,
    explorer_url: Option<String>,
}

impl TransactionHandle {
    pub fn stage(&self) -> &TxStage {
        &self.stage
    }

    pub fn tx_ref(&self) -> Option<H256> {
        self.tx_ref
    }

    pub fn error(&self) -> Option<&FailureReason> {
        self.error.as_ref()
    }

    pub fn explorer_url(&self) -> Option<&str> {
        self.explorer_url.as_deref()
    }

    /// The view shows a "confirm in wallet" prompt.
    pub fn awaiting_wallet(&self) -> bool {
        self.stage == TxStage::AwaitingApproval
    }

    pub fn alert(&self) -> Option<Alert> {
        match &self.stage {
            TxStage::Failed(reason) => reason.alert(),
            _ => None,
        }
    }

    pub fn advance(&mut self, next: TxStage) -> Result<()> {
        if !self.stage.allows(&next) {
            return Err(Error::InvalidTransition(format!("{:?} -> {:?}", self.stage, next)));
        }
        match &next {
            TxStage::Failed(reason) => self.error = Some(reason.clone()),
            TxStage::Idle => *self = TransactionHandle::default(),
            _ => {}
        }
        self.stage = next;
        Ok(())
    }
}

/// A write driven by the controller.
pub trait Operation: Send + Sync {
    fn name(&self) -> &'static str;

    fn call(&self) -> LedgerCall;

    /// Reject before any wallet interaction.
    fn precheck<L: Ledger>(&self, _ledger: &L) -> impl Future<Output = std::result::Result<(), FailureReason>> + Send {
        async { Ok(()) }
    }

    /// Runs once per confirmed transaction.
    fn on_confirmed(&self, tx: H256) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, Clone, Copy)]
pub struct ReceiptPolicy {
    pub interval: Duration,
    pub retries: u64,
}

impl From<&SyncOpts> for ReceiptPolicy {
    fn from(opts: &SyncOpts) -> Self {
        Self {
            interval: opts.receipt_interval(),
            retries: opts.receipt_retries,
        }
    }
}

pub struct TxController<L: Ledger> {
    ledger: Arc<L>,
    settings: Option<LedgerSettings>,
    policy: ReceiptPolicy,
    handle: watch::Sender<TransactionHandle>,
    confirmed: Mutex<HashSet<H256>>,
}

impl<L: Ledger> TxController<L> {
    pub fn new(ledger: Arc<L>, policy: ReceiptPolicy) -> Self {
        Self {
            ledger,
            settings: None,
            policy,
            handle: watch::Sender::new(TransactionHandle::default()),
            confirmed: Mutex::new(HashSet::new()),
        }
    }

    /// Enables explorer links on broadcast transactions.
    pub fn with_settings(mut self, settings: LedgerSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn handle(&self) -> TransactionHandle {
        self.handle.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<TransactionHandle> {
        self.handle.subscribe()
    }

    /// Terminal back to Idle.
    pub fn dismiss(&self) -> Result<()> {
        let mut handle = self.handle();
        handle.advance(TxStage::Idle)?;
        self.handle.send_replace(handle);
        Ok(())
    }

    fn step(&self, handle: &mut TransactionHandle, next: TxStage) {
        debug!("tx {:?} -> {:?}", handle.stage, next);
        if let Err(e) = handle.advance(next) {
            warn!("{}", e);
        }
        self.handle.send_replace(handle.clone());
    }

    fn fail(&self, name: &str, handle: &mut TransactionHandle, reason: FailureReason) {
        if reason == FailureReason::UserRejected {
            info!("{} cancelled in wallet", name);
        } else {
            warn!("{} failed: {}", name, reason);
        }
        self.step(handle, TxStage::Failed(reason.clone()));
        if reason == FailureReason::UserRejected {
            self.step(handle, TxStage::Idle);
        }
    }

    /// Drive `op` to a terminal stage and return the final handle.
    pub async fn run<O: Operation>(&self, op: &O) -> TransactionHandle {
        let mut handle = TransactionHandle::default();
        self.handle.send_replace(handle.clone());

        if !self.ledger.is_configured() {
            self.fail(op.name(), &mut handle, FailureReason::ContractNotConfigured);
            return handle;
        }

        self.step(&mut handle, TxStage::Submitting);
        if let Err(reason) = op.precheck(self.ledger.as_ref()).await {
            self.fail(op.name(), &mut handle, reason);
            return handle;
        }

        self.step(&mut handle, TxStage::AwaitingApproval);
        let tx = match self.ledger.send(op.call()).await {
            Ok(tx) => tx,
            Err(e) => {
                self.fail(op.name(), &mut handle, FailureReason::from(&e));
                return handle;
            }
        };
        handle.tx_ref = Some(tx);
        handle.explorer_url = self.settings.as_ref().and_then(|s| s.explorer_tx_url(&tx));
        self.step(&mut handle, TxStage::Broadcasting);
        info!("{} broadcast: {:?}", op.name(), tx);

        self.step(&mut handle, TxStage::Confirming);
        match self.wait_for_receipt(tx).await {
            Ok(receipt) if receipt.success => {
                info!("{} confirmed in block {:?}", op.name(), receipt.block_number);
                self.step(&mut handle, TxStage::Confirmed);
                self.confirm(op, tx).await;
            }
            Ok(_) => self.fail(op.name(), &mut handle, FailureReason::Unknown("transaction reverted".to_string())),
            Err(e) => self.fail(op.name(), &mut handle, FailureReason::Unknown(e.to_string())),
        }
        handle
    }

    /// Fire the success side effect, at most once per transaction.
    pub async fn confirm<O: Operation>(&self, op: &O, tx: H256) -> bool {
        let first = match self.confirmed.lock() {
            Ok(mut seen) => seen.insert(tx),
            Err(poisoned) => poisoned.into_inner().insert(tx),
        };
        if first {
            op.on_confirmed(tx).await;
        } else {
            debug!("{} confirmation for {:?} already handled", op.name(), tx);
        }
        first
    }

    async fn wait_for_receipt(&self, tx: H256) -> Result<Receipt> {
        for retries in 1..=self.policy.retries {
            match self.ledger.receipt(tx).await {
                Ok(Some(receipt)) => return Ok(receipt),
                Ok(None) => {}
                Err(e) => warn!("receipt of {:?}, retries {}: {}", tx, retries, e),
            }
            tokio::time::sleep(self.policy.interval).await;
        }
        Err(Error::Unknown(format!(
            "no receipt for {:?} after {} polls",
            tx, self.policy.retries
        )))
    }
}

/// One outstanding write per view control; a second submit while busy is refused.
pub struct ActionSlot<L: Ledger> {
    controller: TxController<L>,
    busy: AtomicBool,
}

struct Busy<'a>(&'a AtomicBool);

impl Drop for Busy<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl<L: Ledger> ActionSlot<L> {
    pub fn new(controller: TxController<L>) -> Self {
        Self {
            controller,
            busy: AtomicBool::new(false),
        }
    }

    pub fn controller(&self) -> &TxController<L> {
        &self.controller
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub async fn submit<O: Operation>(&self, op: &O) -> Result<TransactionHandle> {
        if self.busy.swap(true, Ordering::SeqCst) {
            return Err(Error::SlotBusy);
        }
        let _busy = Busy(&self.busy);
        Ok(self.controller.run(op).await)
    }
}
