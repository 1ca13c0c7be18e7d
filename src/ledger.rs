//! Ledger client contract
//!
//! The ledger is the append-only source of truth. The registry only needs to
//! submit an action, wait for its finality and read confirmed events back;
//! wallet handling, signing and gas live behind [`LedgerClient`].
use crate::error::LedgerError;
use crate::product::Amendment;
use crate::status::Status;
use crate::types::{ActorId, EntityRef, TimeStamp};
use async_trait::async_trait;
use chrono::Utc;
use std::fmt;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Handle to a submitted transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, minicbor::Encode, minicbor::Decode)]
pub struct TxRef {
    #[n(0)]
    hash: String,
}

impl TxRef {
    pub fn new(hash: impl Into<String>) -> Self {
        Self { hash: hash.into() }
    }
    pub fn hash(&self) -> &str {
        &self.hash
    }
}

impl fmt::Display for TxRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hash)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum Payload {
    /// First event of an entity, carrying its cbor encoded genesis document.
    #[n(0)]
    Register {
        #[n(0)]
        genesis: Vec<u8>,
    },
    #[n(1)]
    StatusChange {
        #[n(0)]
        target: Status,
        #[n(1)]
        location: String,
        #[n(2)]
        notes: Option<String>,
        #[n(3)]
        quantity: u64, // units removed from stock
    },
    /// Producer edit of descriptive attributes; leaves status and history alone.
    #[n(2)]
    Amend {
        #[n(0)]
        amendment: Amendment,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Action {
    #[n(0)]
    pub key: String, // idempotency key, `entity:STATUS:nonce`
    #[n(1)]
    pub entity: EntityRef,
    #[n(2)]
    pub actor: ActorId,
    #[n(3)]
    pub payload: Payload,
}

impl Action {
    pub fn is_status_change(&self) -> bool {
        matches!(self.payload, Payload::StatusChange { .. })
    }
    pub fn is_registration(&self) -> bool {
        matches!(self.payload, Payload::Register { .. })
    }
}

/// Idempotency key for moving `entity` to `target`. The nonce distinguishes
/// deliberate repeats from retries.
pub fn idempotency_key(entity: &EntityRef, target: &str, nonce: &str) -> String {
    format!("{}:{}:{}", entity.id, target, nonce)
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum ReceiptStatus {
    #[n(0)]
    Confirmed,
    #[n(1)]
    Failed {
        #[n(0)]
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Receipt {
    #[n(0)]
    pub tx: TxRef,
    #[n(1)]
    pub status: ReceiptStatus,
    #[n(2)]
    pub timestamp: TimeStamp<Utc>,
    #[n(3)]
    pub block: u64,
    /// Position among the entity's status changes; `None` for registrations
    /// and failed transactions.
    #[n(4)]
    pub seq: Option<u64>,
}

impl Receipt {
    pub fn is_confirmed(&self) -> bool {
        self.status == ReceiptStatus::Confirmed
    }
}

/// Result of waiting on a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    Resolved(Receipt),
    /// The transaction left the pool without being included.
    Dropped,
    /// Still pending when the wait expired.
    TimedOut,
}

/// A confirmed ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct LedgerEvent {
    #[n(0)]
    pub action: Action,
    #[n(1)]
    pub receipt: Receipt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Registered,
    StatusChanged,
    Amended,
    Any,
}

impl EventKind {
    pub fn matches(&self, event: &LedgerEvent) -> bool {
        match self {
            EventKind::Any => true,
            EventKind::Registered => event.action.is_registration(),
            EventKind::StatusChanged => event.action.is_status_change(),
            EventKind::Amended => matches!(event.action.payload, Payload::Amend { .. }),
        }
    }
}

pub type EventHandler = Box<dyn Fn(LedgerEvent) + Send + Sync + 'static>;

/// Live delivery of ledger events to one handler. Delivery continues until
/// [`Subscription::close`] is called; dropping the handle does not stop it.
#[derive(Debug)]
pub struct Subscription {
    kind: EventKind,
    task: JoinHandle<()>,
}

impl Subscription {
    /// Forwards events from `events` matching `kind` to `handler` on a new task.
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        mut events: broadcast::Receiver<LedgerEvent>,
        kind: EventKind,
        handler: EventHandler,
    ) -> Self {
        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) if kind.matches(&event) => handler(event),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, ?kind, "subscriber lagged behind the ledger");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!(?kind, "subscription finished");
        });

        Self { kind, task }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn is_closed(&self) -> bool {
        self.task.is_finished()
    }

    pub fn close(self) {
        self.task.abort();
    }
}

#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Hands `action` to the ledger. An action whose key was already accepted
    /// returns the existing transaction instead of a new one.
    async fn submit(&self, action: Action) -> Result<TxRef, LedgerError>;

    async fn await_confirmation(
        &self,
        tx: &TxRef,
        timeout: Duration,
    ) -> Result<Confirmation, LedgerError>;

    /// Live transaction previously accepted under `key`, if any.
    async fn find(&self, key: &str) -> Result<Option<TxRef>, LedgerError>;

    /// Confirmed events for `entity`, in confirmation order.
    async fn events(&self, entity: &EntityRef) -> Result<Vec<LedgerEvent>, LedgerError>;

    /// Number of confirmed events for `entity` after its registration: status
    /// changes and amendments.
    async fn event_count(&self, entity: &EntityRef) -> Result<u64, LedgerError>;

    /// Newest confirmed events across all entities, newest first.
    async fn recent(&self, limit: usize) -> Result<Vec<LedgerEvent>, LedgerError>;

    fn subscribe(&self, kind: EventKind, handler: EventHandler) -> Subscription;
}
