//! In-process ledger
//!
//! Behaves like a single-node chain: actions are queued, confirmed in
//! submission order with a monotonic ledger clock, and published to
//! subscribers. Finality is either immediate or driven by [`LocalLedger::seal`],
//! and faults can be injected to exercise the registry's failure paths.
use crate::error::LedgerError;
use crate::ledger::{
    Action, Confirmation, EventHandler, EventKind, LedgerClient, LedgerEvent, Receipt,
    ReceiptStatus, Subscription, TxRef,
};
use crate::types::{EntityRef, TimeStamp};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finality {
    /// Every accepted action is confirmed immediately.
    Instant,
    /// Actions wait in the pool until sealed.
    Manual,
}

/// Faults applied to upcoming submissions, one per submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// The node cannot be reached; nothing is recorded.
    Unreachable,
    /// The action is refused before entering the pool.
    Reject(String),
    /// The action is accepted but the reply is lost on the way back.
    LostReply,
    /// The action is accepted, then the node stays unreachable for every call
    /// until [`LocalLedger::reconnect`].
    Disconnect,
}

#[derive(Debug, Clone)]
enum TxState {
    Pending,
    Resolved(Receipt),
    Dropped,
}

#[derive(Debug)]
struct Tx {
    action: Action,
    state: TxState,
}

#[derive(Debug, Default)]
struct State {
    txs: HashMap<String, Tx>,
    keys: HashMap<String, TxRef>,
    pool: VecDeque<TxRef>,
    log: Vec<LedgerEvent>,
    faults: VecDeque<Fault>,
    clock: Option<TimeStamp<Utc>>,
    block: u64,
    submissions: u64,
    offline: bool,
}

impl State {
    fn status_changes(&self, entity: &EntityRef) -> u64 {
        self.log
            .iter()
            .filter(|e| &e.action.entity == entity && e.action.is_status_change())
            .count() as u64
    }

    fn after_registration(&self, entity: &EntityRef) -> u64 {
        self.log
            .iter()
            .filter(|e| &e.action.entity == entity && !e.action.is_registration())
            .count() as u64
    }

    fn reachable(&self) -> Result<(), LedgerError> {
        if self.offline {
            return Err(LedgerError::Transport("ledger node unreachable".into()));
        }
        Ok(())
    }

    fn tick(&mut self) -> TimeStamp<Utc> {
        let now = TimeStamp::new();
        let ts = match &self.clock {
            Some(last) if now <= *last => last.next(),
            _ => now,
        };
        self.clock = Some(ts.clone());
        ts
    }
}

pub struct LocalLedger {
    state: Mutex<State>,
    finality: Mutex<Finality>,
    changed: watch::Sender<u64>,
    events: broadcast::Sender<LedgerEvent>,
}

impl Default for LocalLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalLedger {
    pub fn new() -> Self {
        Self::with_finality(Finality::Instant)
    }

    pub fn manual() -> Self {
        Self::with_finality(Finality::Manual)
    }

    pub fn with_finality(finality: Finality) -> Self {
        let (changed, _) = watch::channel(0);
        let (events, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(State::default()),
            finality: Mutex::new(finality),
            changed,
            events,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_finality(&self, finality: Finality) {
        *self.finality.lock().unwrap_or_else(PoisonError::into_inner) = finality;
    }

    fn finality(&self) -> Finality {
        *self.finality.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues a fault for the next submission that has none pending.
    pub fn inject(&self, fault: Fault) {
        self.state().faults.push_back(fault);
    }

    /// Ends a [`Fault::Disconnect`].
    pub fn reconnect(&self) {
        self.state().offline = false;
        self.notify();
    }

    pub fn pending(&self) -> usize {
        self.state().pool.len()
    }

    /// Confirms every pooled transaction in submission order. Returns how many.
    pub fn seal(&self) -> usize {
        let mut state = self.state();
        let mut sealed = 0;
        while let Some(tx) = state.pool.pop_front() {
            self.confirm(&mut state, &tx);
            sealed += 1;
        }
        drop(state);
        self.notify();
        sealed
    }

    /// Resolves every pooled transaction as failed, e.g. a reverted contract call.
    pub fn fail_pending(&self, reason: &str) -> usize {
        let mut state = self.state();
        let pool: Vec<TxRef> = state.pool.drain(..).collect();
        for tx in &pool {
            let timestamp = state.tick();
            state.block += 1;
            let block = state.block;
            if let Some(entry) = state.txs.get_mut(tx.hash()) {
                entry.state = TxState::Resolved(Receipt {
                    tx: tx.clone(),
                    status: ReceiptStatus::Failed {
                        reason: reason.to_owned(),
                    },
                    timestamp,
                    block,
                    seq: None,
                });
            }
            warn!(tx = %tx, reason, "transaction failed");
        }
        drop(state);
        self.notify();
        pool.len()
    }

    /// Evicts every pooled transaction without including it.
    pub fn drop_pending(&self) -> usize {
        let mut state = self.state();
        let pool: Vec<TxRef> = state.pool.drain(..).collect();
        for tx in &pool {
            if let Some(entry) = state.txs.get_mut(tx.hash()) {
                entry.state = TxState::Dropped;
            }
            warn!(tx = %tx, "transaction dropped");
        }
        drop(state);
        self.notify();
        pool.len()
    }

    fn confirm(&self, state: &mut State, tx: &TxRef) {
        let Some(action) = state.txs.get(tx.hash()).map(|t| t.action.clone()) else {
            return;
        };
        let seq = action
            .is_status_change()
            .then(|| state.status_changes(&action.entity));
        let timestamp = state.tick();
        state.block += 1;

        let receipt = Receipt {
            tx: tx.clone(),
            status: ReceiptStatus::Confirmed,
            timestamp,
            block: state.block,
            seq,
        };
        if let Some(entry) = state.txs.get_mut(tx.hash()) {
            entry.state = TxState::Resolved(receipt.clone());
        }

        let event = LedgerEvent { action, receipt };
        debug!(
            tx = %tx,
            entity = %event.action.entity,
            block = state.block,
            "transaction confirmed"
        );
        state.log.push(event.clone());
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn notify(&self) {
        self.changed.send_modify(|version| *version += 1);
    }
}

#[async_trait]
impl LedgerClient for LocalLedger {
    async fn submit(&self, action: Action) -> Result<TxRef, LedgerError> {
        let mut state = self.state();
        state.reachable()?;

        if let Some(existing) = state.keys.get(&action.key).cloned() {
            let live = state
                .txs
                .get(existing.hash())
                .map(|t| match &t.state {
                    TxState::Pending => true,
                    TxState::Resolved(receipt) => receipt.is_confirmed(),
                    TxState::Dropped => false,
                })
                .unwrap_or(false);
            if live {
                info!(key = %action.key, tx = %existing, "action already submitted");
                return Ok(existing);
            }
        }

        let fault = state.faults.pop_front();
        match &fault {
            Some(Fault::Unreachable) => {
                return Err(LedgerError::Transport("ledger node unreachable".into()));
            }
            Some(Fault::Reject(reason)) => return Err(LedgerError::Rejected(reason.clone())),
            _ => {}
        }

        state.submissions += 1;
        let mut preimage =
            minicbor::to_vec(&action).map_err(|e| LedgerError::Payload(e.to_string()))?;
        preimage.extend_from_slice(&state.submissions.to_be_bytes());
        let tx = TxRef::new(format!("0x{}", sha256::digest(&preimage)));

        state.keys.insert(action.key.clone(), tx.clone());
        state.txs.insert(
            tx.hash().to_owned(),
            Tx {
                action,
                state: TxState::Pending,
            },
        );
        state.pool.push_back(tx.clone());

        if self.finality() == Finality::Instant {
            while let Some(next) = state.pool.pop_front() {
                self.confirm(&mut state, &next);
            }
        }
        if fault == Some(Fault::Disconnect) {
            state.offline = true;
        }
        drop(state);
        self.notify();

        match fault {
            Some(Fault::LostReply | Fault::Disconnect) => {
                Err(LedgerError::Transport(format!("reply for {tx} lost")))
            }
            _ => Ok(tx),
        }
    }

    async fn await_confirmation(
        &self,
        tx: &TxRef,
        timeout: Duration,
    ) -> Result<Confirmation, LedgerError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut changes = self.changed.subscribe();

        loop {
            let current = {
                let state = self.state();
                state.reachable()?;
                state.txs.get(tx.hash()).map(|entry| entry.state.clone())
            };
            let Some(current) = current else {
                return Err(LedgerError::UnknownTransaction(tx.to_string()));
            };
            match current {
                TxState::Resolved(receipt) => return Ok(Confirmation::Resolved(receipt)),
                TxState::Dropped => return Ok(Confirmation::Dropped),
                TxState::Pending => {}
            }

            match tokio::time::timeout_at(deadline, changes.changed()).await {
                Err(_) => return Ok(Confirmation::TimedOut),
                Ok(Err(_)) => return Err(LedgerError::Transport("ledger shut down".into())),
                Ok(Ok(())) => {}
            }
        }
    }

    async fn find(&self, key: &str) -> Result<Option<TxRef>, LedgerError> {
        let state = self.state();
        state.reachable()?;
        let found = state.keys.get(key).filter(|tx| {
            state
                .txs
                .get(tx.hash())
                .map(|t| !matches!(t.state, TxState::Dropped))
                .unwrap_or(false)
        });
        Ok(found.cloned())
    }

    async fn events(&self, entity: &EntityRef) -> Result<Vec<LedgerEvent>, LedgerError> {
        let state = self.state();
        state.reachable()?;
        Ok(state
            .log
            .iter()
            .filter(|e| &e.action.entity == entity)
            .cloned()
            .collect())
    }

    async fn event_count(&self, entity: &EntityRef) -> Result<u64, LedgerError> {
        let state = self.state();
        state.reachable()?;
        Ok(state.after_registration(entity))
    }

    async fn recent(&self, limit: usize) -> Result<Vec<LedgerEvent>, LedgerError> {
        let state = self.state();
        state.reachable()?;
        Ok(state.log.iter().rev().take(limit).cloned().collect())
    }

    fn subscribe(&self, kind: EventKind, handler: EventHandler) -> Subscription {
        Subscription::spawn(self.events.subscribe(), kind, handler)
    }
}
