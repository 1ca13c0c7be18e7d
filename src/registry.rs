//! The product registry
//!
//! Every change to a tracked entity follows the same path: take the entity's
//! lease, reconcile, validate the edge, submit to the ledger, wait for
//! finality and only then write the mirror. Validation failures never reach
//! the ledger. A confirmation that outlives the caller's timeout is handed to
//! a background task that keeps the lease until the ledger decides, and so is
//! a submission whose reply was lost while the ledger cannot be asked about it.
use crate::config::RegistryConfig;
use crate::distribution::{Distribution, DistributionDraft};
use crate::error::{LedgerError, MirrorError, RegistryError};
use crate::lease::{Lease, LeaseTable};
use crate::ledger::{
    Action, Confirmation, EventHandler, EventKind, LedgerClient, LedgerEvent, Payload, Receipt,
    ReceiptStatus, Subscription, TxRef, idempotency_key,
};
use crate::mirror::{Change, Mirror, MirrorStore};
use crate::order::OrderBook;
use crate::product::{Amendment, Product, ProductDraft};
use crate::reconcile::{Reconciler, Reconciliation};
use crate::status::{self, Guard, Status};
use crate::tracking::{TrackingRecord, Tracked};
use crate::types::{Actor, EntityKind, EntityRef, Role};
use crate::utils;
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Per-call inputs of a transition. Fields the edge does not use are ignored.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TransitionContext {
    location: Option<String>,
    notes: Option<String>,
    quantity: Option<u64>,
    nonce: Option<String>,
    timeout: Option<Duration>,
}

impl TransitionContext {
    pub fn new() -> Self {
        Self::default()
    }
    /// Where the entity is after the step; defaults to where it was.
    pub fn set_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
    pub fn set_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
    /// Units taken by a stock-moving edge; defaults to one.
    pub fn set_quantity(mut self, quantity: u64) -> Self {
        self.quantity = Some(quantity);
        self
    }
    /// Reuse the nonce of a failed attempt to retry it without duplicating it.
    pub fn set_nonce(mut self, nonce: impl Into<String>) -> Self {
        self.nonce = Some(nonce.into());
        self
    }
    pub fn set_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
    pub fn nonce(&self) -> Option<&str> {
        self.nonce.as_deref()
    }
    /// Resubmits under the idempotency key of a failed submission, if `err`
    /// carries one.
    pub fn retrying(mut self, err: &RegistryError) -> Self {
        if let Some((_, nonce)) = err.resubmission() {
            self.nonce = Some(nonce.to_owned());
        }
        self
    }
}

/// Per-call inputs of a registration.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Registration {
    id: Option<String>,
    nonce: Option<String>,
}

impl Registration {
    pub fn new() -> Self {
        Self::default()
    }
    /// Registers under a known id instead of a fresh one.
    pub fn set_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
    pub fn set_nonce(mut self, nonce: impl Into<String>) -> Self {
        self.nonce = Some(nonce.into());
        self
    }
    /// Resubmits a registration whose submission failed with `err`, keeping
    /// both the entity id and the idempotency key.
    pub fn retrying(mut self, err: &RegistryError) -> Self {
        if let Some((entity, nonce)) = err.resubmission() {
            self.id = Some(entity.id.clone());
            self.nonce = Some(nonce.to_owned());
        }
        self
    }

    fn entity_id(&self, kind: EntityKind) -> Result<String, RegistryError> {
        match &self.id {
            Some(id) if id.starts_with(kind.hrp()) => Ok(id.clone()),
            Some(id) => Err(RegistryError::Validation(format!(
                "{id} does not start with {}",
                kind.hrp()
            ))),
            None => new_id(kind),
        }
    }
}

// what became of an action handed to the ledger
enum Submission {
    Accepted(TxRef),
    /// Never reached the ledger; nothing to wait for.
    Absent(RegistryError),
    /// No reply and the ledger cannot be asked; it may still be in the pool.
    Unknown(RegistryError),
}

/// A committed step: the entity after it and the record it appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition<T> {
    pub entity: T,
    pub record: TrackingRecord,
}

#[derive(Debug)]
pub enum Outcome<T> {
    Committed(Transition<T>),
    /// The ledger has not decided yet. The entity stays leased until it does.
    Pending(PendingTransition<T>),
}

impl<T> Outcome<T> {
    pub fn is_pending(&self) -> bool {
        matches!(self, Outcome::Pending(_))
    }

    pub fn committed(self) -> Option<Transition<T>> {
        match self {
            Outcome::Committed(transition) => Some(transition),
            Outcome::Pending(_) => None,
        }
    }

    /// Waits out a pending outcome.
    pub async fn resolve(self) -> Result<Transition<T>, RegistryError> {
        match self {
            Outcome::Committed(transition) => Ok(transition),
            Outcome::Pending(pending) => pending.wait().await,
        }
    }
}

/// Handle to a transition whose confirmation is being resolved in the background.
#[derive(Debug)]
pub struct PendingTransition<T> {
    tx: TxRef,
    key: String,
    task: JoinHandle<Result<Transition<T>, RegistryError>>,
}

impl<T> PendingTransition<T> {
    pub fn tx(&self) -> &TxRef {
        &self.tx
    }
    /// Idempotency key the action was submitted under.
    pub fn key(&self) -> &str {
        &self.key
    }
    pub fn is_resolved(&self) -> bool {
        self.task.is_finished()
    }

    /// `Ok` once confirmed and mirrored, `LedgerRejected` or `Dropped` otherwise.
    pub async fn wait(self) -> Result<Transition<T>, RegistryError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(RegistryError::Ledger(LedgerError::Transport(format!(
                "resolution of {} stopped: {e}",
                self.tx
            )))),
        }
    }
}

/// Result of [`Registry::verify_product`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    pub product: Product,
    /// Every record links to its predecessor and matches its hash.
    pub chain_intact: bool,
    /// Every record points at the ledger event in the same position.
    pub ledger_matches: bool,
    pub head_hash: String,
}

impl Verification {
    pub fn is_authentic(&self) -> bool {
        self.chain_intact && self.ledger_matches
    }
}

struct Inner {
    ledger: Arc<dyn LedgerClient>,
    mirror: Mirror,
    leases: Arc<LeaseTable>,
    reconciler: Reconciler,
    config: RegistryConfig,
}

/// Entry point for products and distributions. Cheap to clone; clones share
/// the ledger, mirror and lease table.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

impl Registry {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        store: Arc<dyn MirrorStore>,
        config: RegistryConfig,
    ) -> Self {
        let mirror = Mirror::new(store);
        let reconciler = Reconciler::new(
            Arc::clone(&ledger),
            mirror.clone(),
            config.verify_chain_on_read,
        );

        Self {
            inner: Arc::new(Inner {
                ledger,
                mirror,
                leases: LeaseTable::new(),
                reconciler,
                config,
            }),
        }
    }

    pub fn ledger(&self) -> &Arc<dyn LedgerClient> {
        &self.inner.ledger
    }
    pub fn mirror(&self) -> &Mirror {
        &self.inner.mirror
    }
    pub fn leases(&self) -> &Arc<LeaseTable> {
        &self.inner.leases
    }
    pub fn reconciler(&self) -> &Reconciler {
        &self.inner.reconciler
    }
    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }
    pub fn orders(&self) -> OrderBook {
        OrderBook::new(self.clone())
    }

    /// Registers a new product. The document is mirrored once the ledger
    /// has confirmed the registration.
    pub async fn create_product(
        &self,
        draft: &ProductDraft,
        actor: &Actor,
    ) -> Result<Product, RegistryError> {
        self.create_product_with(draft, actor, Registration::new()).await
    }

    pub async fn create_product_with(
        &self,
        draft: &ProductDraft,
        actor: &Actor,
        registration: Registration,
    ) -> Result<Product, RegistryError> {
        let id = registration.entity_id(EntityKind::Product)?;
        if actor.role != Role::Producer {
            return Err(RegistryError::UnauthorizedActor {
                entity: EntityRef::product(id),
                role: actor.role,
                action: "register products".into(),
            });
        }

        let product = draft.validate_and_finalise(id, &actor.id)?;
        self.register(product, actor, registration).await
    }

    /// Opens a shipment of `product_id`, starting from the product's location
    /// unless the draft names an origin.
    pub async fn create_distribution(
        &self,
        product_id: &str,
        draft: &DistributionDraft,
        actor: &Actor,
    ) -> Result<Distribution, RegistryError> {
        self.create_distribution_with(product_id, draft, actor, Registration::new()).await
    }

    pub async fn create_distribution_with(
        &self,
        product_id: &str,
        draft: &DistributionDraft,
        actor: &Actor,
        registration: Registration,
    ) -> Result<Distribution, RegistryError> {
        let id = registration.entity_id(EntityKind::Distribution)?;
        if actor.role != Role::Distributor {
            return Err(RegistryError::UnauthorizedActor {
                entity: EntityRef::distribution(id),
                role: actor.role,
                action: "open distributions".into(),
            });
        }

        let product = self.get_product(product_id).await?;
        if status::is_terminal(EntityKind::Product, product.status()) {
            return Err(RegistryError::Validation(format!(
                "product {} is {} and cannot be distributed",
                product.id,
                product.status()
            )));
        }

        let distribution =
            draft.validate_and_finalise(id, &product.id, &actor.id, product.location())?;
        if distribution.quantity() > product.quantity() {
            return Err(RegistryError::InsufficientStock {
                entity: product.entity(),
                requested: distribution.quantity(),
                available: product.quantity(),
            });
        }
        self.register(distribution, actor, registration).await
    }

    async fn register<T: Tracked>(
        &self,
        document: T,
        actor: &Actor,
        registration: Registration,
    ) -> Result<T, RegistryError> {
        let entity = document.entity();
        let resumed = registration.id.is_some();
        let nonce = registration.nonce.unwrap_or_else(utils::new_nonce);
        let key = idempotency_key(&entity, "REGISTER", &nonce);

        let found = match resumed {
            true => self.inner.ledger.find(&key).await?,
            false => None,
        };
        let tx = match found {
            Some(tx) => {
                info!(%entity, %tx, %key, "registration already on the ledger, resuming it");
                tx
            }
            None => {
                if resumed && !self.inner.ledger.events(&entity).await?.is_empty() {
                    return Err(RegistryError::Validation(format!(
                        "{entity} is already registered"
                    )));
                }
                let genesis = minicbor::to_vec(&document)
                    .map_err(|e| MirrorError::Encode(e.to_string()))?;
                let action = Action {
                    key: key.clone(),
                    entity: entity.clone(),
                    actor: actor.id.clone(),
                    payload: Payload::Register { genesis },
                };
                match self.submit(&entity, &nonce, action).await {
                    Submission::Accepted(tx) => tx,
                    Submission::Absent(err) | Submission::Unknown(err) => return Err(err),
                }
            }
        };

        let timeout = self.inner.config.confirmation_timeout;
        match self.confirmation(&entity, &tx, timeout).await? {
            Confirmation::Resolved(Receipt {
                status: ReceiptStatus::Failed { reason },
                ..
            }) => Err(RegistryError::LedgerRejected {
                tx: tx.to_string(),
                reason,
            }),
            Confirmation::Resolved(_) => {
                let document = match self.inner.mirror.insert_new(&document).await? {
                    true => document,
                    // a reader or an earlier attempt restored it from the ledger
                    false => self.reconciled::<T>(&entity.id).await?,
                };
                info!(%entity, %tx, actor = %actor.id, "registered");
                Ok(document)
            }
            Confirmation::Dropped => Err(RegistryError::Dropped { tx: tx.to_string() }),
            Confirmation::TimedOut => {
                warn!(%entity, %tx, "registration still pending");
                Err(RegistryError::PendingRegistration {
                    entity,
                    tx: tx.to_string(),
                })
            }
        }
    }

    /// Changes the descriptive attributes of a product. Only its producer may
    /// amend it, and only while it is CREATED or AVAILABLE.
    #[instrument(skip(self, amendment, actor, ctx), fields(actor = %actor.id, role = ?actor.role))]
    pub async fn amend_product(
        &self,
        product_id: &str,
        amendment: &Amendment,
        actor: &Actor,
        ctx: TransitionContext,
    ) -> Result<Product, RegistryError> {
        amendment.validate()?;
        let entity = EntityRef::product(product_id);
        let nonce = ctx.nonce.clone().unwrap_or_else(utils::new_nonce);
        let key = idempotency_key(&entity, "AMEND", &nonce);
        let timeout = ctx.timeout.unwrap_or(self.inner.config.confirmation_timeout);

        let lease = self.inner.leases.acquire(&entity.key()).await;

        let tx = match self.inner.ledger.find(&key).await? {
            Some(tx) => {
                info!(%entity, %tx, %key, "amendment already on the ledger, resuming it");
                tx
            }
            None => {
                let current: Product = self.reconciled(product_id).await?;
                if actor.role != Role::Producer || current.producer_id != actor.id {
                    return Err(RegistryError::UnauthorizedActor {
                        entity,
                        role: actor.role,
                        action: "amend this product".into(),
                    });
                }
                if !matches!(current.status(), Status::Created | Status::Available) {
                    return Err(RegistryError::AmendmentClosed {
                        entity,
                        status: current.status(),
                    });
                }

                let action = Action {
                    key: key.clone(),
                    entity: entity.clone(),
                    actor: actor.id.clone(),
                    payload: Payload::Amend {
                        amendment: amendment.clone(),
                    },
                };
                match self.submit(&entity, &nonce, action).await {
                    Submission::Accepted(tx) => tx,
                    Submission::Absent(err) => return Err(err),
                    Submission::Unknown(err) => {
                        self.settle_later::<Product>(entity, key, lease);
                        return Err(err);
                    }
                }
            }
        };

        match self.confirmation(&entity, &tx, timeout).await? {
            Confirmation::Resolved(Receipt {
                status: ReceiptStatus::Failed { reason },
                ..
            }) => Err(RegistryError::LedgerRejected {
                tx: tx.to_string(),
                reason,
            }),
            Confirmation::Resolved(_) => {
                // the confirmed amendment is replayed onto the mirror from the ledger
                let product: Product = self.reconciled(product_id).await?;
                drop(lease);
                info!(product = %product.id, revision = product.revision, %tx, "product amended");
                Ok(product)
            }
            Confirmation::Dropped => Err(RegistryError::Dropped { tx: tx.to_string() }),
            Confirmation::TimedOut => {
                warn!(%entity, %tx, ?timeout, "amendment still pending");
                let pending = RegistryError::PendingAmendment {
                    entity: entity.clone(),
                    tx: tx.to_string(),
                };
                self.settle_later::<Product>(entity, key, lease);
                Err(pending)
            }
        }
    }

    /// Moves a product to `target`.
    #[instrument(skip(self, actor, ctx), fields(actor = %actor.id, role = ?actor.role))]
    pub async fn transition(
        &self,
        product_id: &str,
        target: Status,
        actor: &Actor,
        ctx: TransitionContext,
    ) -> Result<Outcome<Product>, RegistryError> {
        self.drive::<Product>(product_id, target, actor, ctx).await
    }

    #[instrument(skip(self, actor, ctx), fields(actor = %actor.id, role = ?actor.role))]
    pub async fn transition_distribution(
        &self,
        distribution_id: &str,
        target: Status,
        actor: &Actor,
        ctx: TransitionContext,
    ) -> Result<Outcome<Distribution>, RegistryError> {
        self.drive::<Distribution>(distribution_id, target, actor, ctx).await
    }

    pub async fn cancel(
        &self,
        product_id: &str,
        actor: &Actor,
        ctx: TransitionContext,
    ) -> Result<Outcome<Product>, RegistryError> {
        self.transition(product_id, Status::Cancelled, actor, ctx).await
    }

    async fn drive<T: Tracked>(
        &self,
        id: &str,
        target: Status,
        actor: &Actor,
        ctx: TransitionContext,
    ) -> Result<Outcome<T>, RegistryError> {
        let entity = EntityRef::new(T::KIND, id);
        let nonce = ctx.nonce.clone().unwrap_or_else(utils::new_nonce);
        let key = idempotency_key(&entity, target.as_str(), &nonce);
        let timeout = ctx.timeout.unwrap_or(self.inner.config.confirmation_timeout);

        let lease = self.inner.leases.acquire(&entity.key()).await;

        if let Some(tx) = self.inner.ledger.find(&key).await? {
            info!(%entity, %tx, %key, "action already on the ledger, resuming it");
            return self.resolve::<T>(entity, key, tx, lease, timeout).await;
        }

        let current: T = self.reconciled(id).await?;
        let action = self.validate(&current, target, actor, &ctx, key.clone())?;

        let tx = match self.submit(&entity, &nonce, action).await {
            Submission::Accepted(tx) => tx,
            Submission::Absent(err) => return Err(err),
            Submission::Unknown(err) => {
                self.settle_later::<T>(entity, key, lease);
                return Err(err);
            }
        };

        self.resolve::<T>(entity, key, tx, lease, timeout).await
    }

    /// Hands `action` to the ledger. Without a reply the action may still have
    /// been accepted, so the ledger is asked for its key before giving up.
    async fn submit(&self, entity: &EntityRef, nonce: &str, action: Action) -> Submission {
        let key = action.key.clone();
        let failed = |source: LedgerError| RegistryError::LedgerSubmission {
            entity: entity.clone(),
            key: key.clone(),
            nonce: nonce.to_owned(),
            source,
        };

        let reason = match self.inner.ledger.submit(action).await {
            Ok(tx) => {
                debug!(%entity, %tx, "submitted");
                return Submission::Accepted(tx);
            }
            Err(LedgerError::Transport(reason)) => reason,
            Err(source) => {
                warn!(%entity, %key, error = %source, "ledger submission failed");
                return Submission::Absent(failed(source));
            }
        };

        warn!(%entity, %key, %reason, "no reply from the ledger, looking the action up");
        match self.inner.ledger.find(&key).await {
            Ok(Some(tx)) => {
                info!(%entity, %tx, %key, "action reached the ledger");
                Submission::Accepted(tx)
            }
            Ok(None) => Submission::Absent(failed(LedgerError::Transport(reason))),
            Err(lookup) => {
                warn!(
                    %entity,
                    %key,
                    error = %lookup,
                    "cannot tell whether the action reached the ledger"
                );
                Submission::Unknown(failed(LedgerError::Transport(reason)))
            }
        }
    }

    // an unreachable ledger leaves the outcome open, like a timeout
    async fn confirmation(
        &self,
        entity: &EntityRef,
        tx: &TxRef,
        timeout: Duration,
    ) -> Result<Confirmation, RegistryError> {
        match self.inner.ledger.await_confirmation(tx, timeout).await {
            Ok(confirmation) => Ok(confirmation),
            Err(LedgerError::Transport(reason)) => {
                warn!(%entity, %tx, %reason, "ledger unreachable while awaiting confirmation");
                Ok(Confirmation::TimedOut)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Keeps `lease` until the ledger has decided on `key`, then brings the
    /// mirror in line. Nobody is left to hear the outcome, so it is logged.
    fn settle_later<T: Tracked>(&self, entity: EntityRef, key: String, lease: Lease) {
        let registry = self.clone();
        tokio::spawn(async move {
            let _lease = lease;
            match registry.settle_by_key::<T>(&entity, &key).await {
                Ok(true) => info!(%entity, %key, "late action mirrored"),
                Ok(false) => debug!(%entity, %key, "action never took effect"),
                Err(e) => warn!(%entity, %key, error = %e, "could not settle action"),
            }
        });
    }

    async fn settle_by_key<T: Tracked>(
        &self,
        entity: &EntityRef,
        key: &str,
    ) -> Result<bool, RegistryError> {
        let poll = self.inner.config.resolution_poll;
        loop {
            let tx = match self.inner.ledger.find(key).await {
                Ok(Some(tx)) => tx,
                Ok(None) => return Ok(false),
                Err(LedgerError::Transport(reason)) => {
                    warn!(%entity, %key, %reason, "ledger unreachable while settling");
                    tokio::time::sleep(poll).await;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            match self.confirmation(entity, &tx, poll).await? {
                Confirmation::Resolved(receipt) if receipt.is_confirmed() => {
                    self.reconciled::<T>(&entity.id).await?;
                    return Ok(true);
                }
                Confirmation::Resolved(_) | Confirmation::Dropped => return Ok(false),
                Confirmation::TimedOut => {}
            }
        }
    }

    // checks run in order: edge, role, identity, stock
    fn validate<T: Tracked>(
        &self,
        current: &T,
        target: Status,
        actor: &Actor,
        ctx: &TransitionContext,
        key: String,
    ) -> Result<Action, RegistryError> {
        let entity = current.entity();
        let from = current.status();
        let provenance = current.provenance();

        let Some(edge) = status::edge(T::KIND, from, target) else {
            return Err(RegistryError::InvalidTransition {
                entity,
                from,
                to: target,
            });
        };

        let unauthorized = |entity: EntityRef| RegistryError::UnauthorizedActor {
            entity,
            role: actor.role,
            action: format!("move it from {from} to {target}"),
        };
        if !edge.roles.contains(&actor.role) {
            return Err(unauthorized(entity));
        }

        let holder = &provenance.current_owner;
        let permitted = match edge.guard {
            Guard::Anyone => true,
            Guard::Originator => current.originator() == &actor.id,
            Guard::Holder => holder == &actor.id,
            Guard::HolderOrAdmin => actor.role == Role::Admin || holder == &actor.id,
        };
        if !permitted {
            return Err(unauthorized(entity));
        }

        let quantity = if edge.takes_stock {
            let requested = ctx.quantity.unwrap_or(1);
            if requested == 0 {
                return Err(RegistryError::Validation(format!(
                    "{from} to {target} must move at least one unit"
                )));
            }
            if requested > provenance.quantity {
                return Err(RegistryError::InsufficientStock {
                    entity,
                    requested,
                    available: provenance.quantity,
                });
            }
            requested
        } else {
            0
        };

        Ok(Action {
            key,
            entity,
            actor: actor.id.clone(),
            payload: Payload::StatusChange {
                target,
                location: ctx
                    .location
                    .clone()
                    .unwrap_or_else(|| provenance.location.clone()),
                notes: ctx.notes.clone(),
                quantity,
            },
        })
    }

    async fn resolve<T: Tracked>(
        &self,
        entity: EntityRef,
        key: String,
        tx: TxRef,
        lease: Lease,
        timeout: Duration,
    ) -> Result<Outcome<T>, RegistryError> {
        let confirmation = self.confirmation(&entity, &tx, timeout).await?;
        if confirmation != Confirmation::TimedOut {
            let transition = self.settle::<T>(&entity, &tx, confirmation).await?;
            drop(lease);
            return Ok(Outcome::Committed(transition));
        }

        warn!(%entity, %tx, ?timeout, "confirmation timed out, resolving in background");
        let registry = self.clone();
        let pending_tx = tx.clone();
        let task = tokio::spawn(async move {
            let _lease = lease;
            registry.resolve_in_background::<T>(entity, pending_tx).await
        });

        Ok(Outcome::Pending(PendingTransition { tx, key, task }))
    }

    async fn resolve_in_background<T: Tracked>(
        &self,
        entity: EntityRef,
        tx: TxRef,
    ) -> Result<Transition<T>, RegistryError> {
        let poll = self.inner.config.resolution_poll;
        loop {
            match self.inner.ledger.await_confirmation(&tx, poll).await {
                Ok(Confirmation::TimedOut) => continue,
                Ok(confirmation) => return self.settle::<T>(&entity, &tx, confirmation).await,
                Err(LedgerError::Transport(reason)) => {
                    warn!(%entity, %tx, %reason, "ledger unreachable while resolving");
                    tokio::time::sleep(poll).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn settle<T: Tracked>(
        &self,
        entity: &EntityRef,
        tx: &TxRef,
        confirmation: Confirmation,
    ) -> Result<Transition<T>, RegistryError> {
        match confirmation {
            Confirmation::Resolved(Receipt {
                status: ReceiptStatus::Failed { reason },
                ..
            }) => {
                warn!(%entity, %tx, %reason, "ledger rejected transition");
                Err(RegistryError::LedgerRejected {
                    tx: tx.to_string(),
                    reason,
                })
            }
            Confirmation::Resolved(receipt) => self.commit::<T>(entity, &receipt).await,
            Confirmation::Dropped | Confirmation::TimedOut => {
                warn!(%entity, %tx, "transaction dropped, entity unchanged");
                Err(RegistryError::Dropped { tx: tx.to_string() })
            }
        }
    }

    /// Mirrors a confirmed status change at the position the ledger gave it.
    /// A record already present is not appended twice.
    async fn commit<T: Tracked>(
        &self,
        entity: &EntityRef,
        receipt: &Receipt,
    ) -> Result<Transition<T>, RegistryError> {
        let position = receipt.seq.ok_or_else(|| {
            LedgerError::Payload(format!("{} confirmed without a position", receipt.tx))
        })? as usize;

        let events = self.inner.ledger.events(entity).await?;
        let (ordinal, event) = events
            .iter()
            .filter(|e| !e.action.is_registration())
            .enumerate()
            .find(|(_, e)| e.receipt.tx == receipt.tx)
            .ok_or_else(|| LedgerError::UnknownTransaction(receipt.tx.to_string()))?;
        let ordinal = ordinal as u64;

        let mut behind = false;
        let updated = self
            .inner
            .mirror
            .update::<T, RegistryError, _>(&entity.id, |doc| {
                behind = false;
                match ordinal.cmp(&doc.applied()) {
                    Ordering::Less => Ok(Change::Unchanged),
                    Ordering::Greater => {
                        behind = true;
                        Ok(Change::Unchanged)
                    }
                    Ordering::Equal => {
                        doc.apply_event(event)?;
                        Ok(Change::Modified)
                    }
                }
            })
            .await;
        let updated = match updated {
            Ok(updated) => updated,
            Err(RegistryError::Chain(broken)) => {
                error!(
                    %entity,
                    %broken,
                    tx = %receipt.tx,
                    "confirmed record does not fit the mirror"
                );
                None
            }
            Err(e) => return Err(e),
        };

        let document = match updated {
            Some(document) if !behind => document,
            _ => self.reconciled::<T>(&entity.id).await?,
        };
        let record = document
            .history()
            .get(position)
            .cloned()
            .ok_or_else(|| RegistryError::MirrorCorruption {
                entity: entity.clone(),
                mirror: document.history().len() as u64,
                ledger: position as u64 + 1,
            })?;

        info!(
            %entity,
            status = %record.status,
            position,
            tx = %receipt.tx,
            "transition committed"
        );
        Ok(Transition {
            entity: document,
            record,
        })
    }

    async fn reconciled<T: Tracked>(&self, id: &str) -> Result<T, RegistryError> {
        self.inner
            .reconciler
            .reconcile::<T>(id)
            .await?
            .map(|r| r.document)
            .ok_or_else(|| RegistryError::NotFound {
                entity: EntityRef::new(T::KIND, id),
            })
    }

    pub async fn get_product(&self, product_id: &str) -> Result<Product, RegistryError> {
        self.reconciled(product_id).await
    }

    pub async fn get_distribution(
        &self,
        distribution_id: &str,
    ) -> Result<Distribution, RegistryError> {
        self.reconciled(distribution_id).await
    }

    /// Reconciled history of a product or distribution, oldest first.
    pub async fn get_history(
        &self,
        entity: &EntityRef,
    ) -> Result<Vec<TrackingRecord>, RegistryError> {
        match entity.kind {
            EntityKind::Product => Ok(self
                .get_product(&entity.id)
                .await?
                .provenance
                .history
                .into_records()),
            EntityKind::Distribution => Ok(self
                .get_distribution(&entity.id)
                .await?
                .provenance
                .history
                .into_records()),
            EntityKind::Order => Err(RegistryError::Validation(format!(
                "{entity} has no tracking history"
            ))),
        }
    }

    pub async fn list_products(&self) -> Result<Vec<Product>, RegistryError> {
        let mut products = vec![];
        for product in self.inner.mirror.list::<Product>().await? {
            products.push(self.reconciled(&product.id).await?);
        }
        Ok(products)
    }

    pub async fn distributions_of(
        &self,
        product_id: &str,
    ) -> Result<Vec<Distribution>, RegistryError> {
        let mut found = vec![];
        for distribution in self.inner.mirror.list::<Distribution>().await? {
            if distribution.product_id == product_id {
                found.push(self.reconciled(&distribution.id).await?);
            }
        }
        Ok(found)
    }

    /// Checks a product's history against its own hash chain and the ledger.
    pub async fn verify_product(&self, product_id: &str) -> Result<Verification, RegistryError> {
        let product: Product = self.reconciled(product_id).await?;
        let history = product.history();

        let chain_intact = history.verify().is_ok();
        let events = self.inner.ledger.events(&product.entity()).await?;
        let changes: Vec<&LedgerEvent> = events
            .iter()
            .filter(|e| e.action.is_status_change())
            .collect();
        let ledger_matches = changes.len() == history.len()
            && history.records().iter().zip(&changes).all(|(record, event)| {
                record.transaction_ref.as_deref() == Some(event.receipt.tx.hash())
            });

        if !(chain_intact && ledger_matches) {
            warn!(product = %product.id, chain_intact, ledger_matches, "verification failed");
        }
        Ok(Verification {
            head_hash: history.head_hash().to_owned(),
            chain_intact,
            ledger_matches,
            product,
        })
    }

    /// Newest confirmed ledger events across every entity.
    pub async fn recent_activity(&self, limit: usize) -> Result<Vec<LedgerEvent>, RegistryError> {
        Ok(self.inner.ledger.recent(limit).await?)
    }

    pub fn subscribe(&self, kind: EventKind, handler: EventHandler) -> Subscription {
        self.inner.ledger.subscribe(kind, handler)
    }

    /// Reconciles every mirrored product and distribution, returning those
    /// that needed repair.
    pub async fn sweep(&self) -> Result<Vec<(EntityRef, Reconciliation)>, RegistryError> {
        let reconciler = &self.inner.reconciler;
        let products = reconciler.sweep::<Product>().await?;
        let distributions = reconciler.sweep::<Distribution>().await?;

        Ok(products
            .into_iter()
            .map(|(id, outcome)| (EntityRef::product(id), outcome))
            .chain(
                distributions
                    .into_iter()
                    .map(|(id, outcome)| (EntityRef::distribution(id), outcome)),
            )
            .collect())
    }
}

fn new_id(kind: EntityKind) -> Result<String, RegistryError> {
    utils::new_entity_id(kind).map_err(|e| RegistryError::Identifier(e.to_string()))
}
