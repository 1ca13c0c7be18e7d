use crate::order::OrderStatus;
use crate::status::Status;
use crate::types::{EntityRef, Role};

#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error("{entity} does not exist")]
    NotFound { entity: EntityRef },
    #[error("{entity}: transition {from:?} -> {to:?} is not allowed")]
    InvalidTransition {
        entity: EntityRef,
        from: Status,
        to: Status,
    },
    #[error("{entity}: role {role:?} may not {action}")]
    UnauthorizedActor {
        entity: EntityRef,
        role: Role,
        action: String,
    },
    #[error("{entity}: requested {requested} units but only {available} in stock")]
    InsufficientStock {
        entity: EntityRef,
        requested: u64,
        available: u64,
    },
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("ledger submission failed for key {key}: {source}")]
    LedgerSubmission {
        entity: EntityRef,
        key: String,
        nonce: String,
        #[source]
        source: LedgerError,
    },
    #[error("ledger rejected transaction {tx}: {reason}")]
    LedgerRejected { tx: String, reason: String },
    #[error("ledger dropped transaction {tx}")]
    Dropped { tx: String },
    #[error("registration of {entity} is awaiting confirmation in {tx}")]
    PendingRegistration { entity: EntityRef, tx: String },
    #[error("amendment of {entity} is awaiting confirmation in {tx}")]
    PendingAmendment { entity: EntityRef, tx: String },
    #[error("{entity} is {status} and can no longer be amended")]
    AmendmentClosed { entity: EntityRef, status: Status },
    #[error("mirror for {entity} is corrupt ({mirror} events, ledger has {ledger}) beyond repair")]
    MirrorCorruption {
        entity: EntityRef,
        mirror: u64,
        ledger: u64,
    },
    #[error("order {order} is {status:?} and cannot be {action}")]
    OrderState {
        order: String,
        status: OrderStatus,
        action: &'static str,
    },
    #[error("could not generate an id: {0}")]
    Identifier(String),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Mirror(#[from] MirrorError),
}

impl RegistryError {
    /// Errors that leave no trace anywhere and may be retried with the same key.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RegistryError::LedgerSubmission {
                source: LedgerError::Transport(_),
                ..
            } | RegistryError::Ledger(LedgerError::Transport(_))
        )
    }

    /// Entity and nonce that resubmit a failed submission under the same
    /// idempotency key.
    pub fn resubmission(&self) -> Option<(&EntityRef, &str)> {
        match self {
            RegistryError::LedgerSubmission { entity, nonce, .. } => Some((entity, nonce)),
            _ => None,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("ledger transport failure: {0}")]
    Transport(String),
    #[error("ledger rejected action: {0}")]
    Rejected(String),
    #[error("unknown transaction {0}")]
    UnknownTransaction(String),
    #[error("malformed ledger payload: {0}")]
    Payload(String),
}

#[derive(thiserror::Error, Debug)]
pub enum MirrorError {
    #[error(transparent)]
    Store(#[from] sled::Error),
    #[error("failed to encode document: {0}")]
    Encode(String),
    #[error(transparent)]
    Decode(#[from] minicbor::decode::Error),
    #[error("document {0} changed concurrently")]
    Conflict(String),
}

/// Violations of the append-only tracking chain.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("record {position} does not link to its predecessor")]
    BrokenLink { position: usize },
    #[error("record {position} does not match its hash")]
    Tampered { position: usize },
    #[error("record {position} is older than its predecessor")]
    OutOfOrder { position: usize },
    #[error("record {position} removes {requested} units but only {available} remain")]
    Overdrawn {
        position: usize,
        requested: u64,
        available: u64,
    },
    #[error("record could not be encoded: {0}")]
    Encoding(String),
}
