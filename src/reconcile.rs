//! Ledger-wins reconciliation of mirror documents
//!
//! Ledger and mirror are written separately, so a crash between the two can
//! leave the mirror behind. Reads pass through [`Reconciler::reconcile`],
//! which compares the number of ledger events the mirror document reflects
//! (history records plus amendments) with the ledger's own count and repairs
//! the document:
//!
//! - equal: the mirror is trusted as is
//! - ledger ahead: the missing events are replayed onto the document
//! - mirror ahead: impossible under ledger-first writes, so the document is
//!   treated as corrupt and rebuilt from the full ledger history
use crate::error::{MirrorError, RegistryError};
use crate::ledger::{LedgerClient, LedgerEvent, Payload};
use crate::mirror::{Change, Mirror};
use crate::tracking::Tracked;
use crate::types::EntityRef;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    InSync,
    /// Ledger events appended to a stale mirror.
    Replayed { events: u64 },
    /// Document rebuilt from ledger history after a corruption.
    Rebuilt { mirror: u64, ledger: u64 },
    /// Document was missing from the mirror and recreated from the ledger.
    Restored,
}

#[derive(Debug, Clone)]
pub struct Reconciled<T> {
    pub document: T,
    pub outcome: Reconciliation,
}

#[derive(Clone)]
pub struct Reconciler {
    ledger: Arc<dyn LedgerClient>,
    mirror: Mirror,
    verify_chain: bool,
}

impl Reconciler {
    pub fn new(ledger: Arc<dyn LedgerClient>, mirror: Mirror, verify_chain: bool) -> Self {
        Self {
            ledger,
            mirror,
            verify_chain,
        }
    }

    /// Brings the mirror document for `id` in line with the ledger and returns
    /// it. `None` if neither store knows the entity.
    #[instrument(skip(self), level = "debug")]
    pub async fn reconcile<T: Tracked>(
        &self,
        id: &str,
    ) -> Result<Option<Reconciled<T>>, RegistryError> {
        let entity = EntityRef::new(T::KIND, id);
        let mirrored: Option<T> = self.mirror.load(id).await?;
        let ledger_len = self.ledger.event_count(&entity).await?;

        let Some(document) = mirrored else {
            return self.restore(&entity).await;
        };
        let mirror_len = document.applied();

        match ledger_len.cmp(&mirror_len) {
            Ordering::Equal => {
                if self.verify_chain {
                    if let Err(broken) = document.history().verify() {
                        error!(%entity, %broken, "mirror history fails verification");
                        return self.force_rebuild(&entity, mirror_len, ledger_len).await;
                    }
                }
                debug!(%entity, records = mirror_len, "mirror in sync");
                Ok(Some(Reconciled {
                    document,
                    outcome: Reconciliation::InSync,
                }))
            }
            Ordering::Greater => match self.replay::<T>(&entity).await {
                Ok(Some(document)) => {
                    let replayed = document.applied() - mirror_len;
                    info!(%entity, replayed, "replayed ledger events onto stale mirror");
                    Ok(Some(Reconciled {
                        document,
                        outcome: Reconciliation::Replayed { events: replayed },
                    }))
                }
                Ok(None) => self.restore(&entity).await,
                Err(RegistryError::Chain(broken)) => {
                    error!(%entity, %broken, "stale mirror does not extend cleanly");
                    self.force_rebuild(&entity, mirror_len, ledger_len).await
                }
                Err(other) => Err(other),
            },
            Ordering::Less => {
                error!(
                    %entity,
                    mirror = mirror_len,
                    ledger = ledger_len,
                    "mirror holds records the ledger never confirmed"
                );
                self.force_rebuild(&entity, mirror_len, ledger_len).await
            }
        }
    }

    /// Reconciles every document of type `T` currently in the mirror. Meant
    /// for a periodic sweep that bounds staleness after crashes.
    pub async fn sweep<T: Tracked>(&self) -> Result<Vec<(String, Reconciliation)>, RegistryError> {
        let mut outcomes = vec![];
        for doc in self.mirror.list::<T>().await? {
            if let Some(reconciled) = self.reconcile::<T>(doc.id()).await? {
                if reconciled.outcome != Reconciliation::InSync {
                    outcomes.push((doc.id().to_owned(), reconciled.outcome));
                }
            }
        }
        Ok(outcomes)
    }

    async fn replay<T: Tracked>(&self, entity: &EntityRef) -> Result<Option<T>, RegistryError> {
        let events = self.ledger.events(entity).await?;
        let changes: Vec<&LedgerEvent> = events
            .iter()
            .filter(|e| !e.action.is_registration())
            .collect();

        self.mirror
            .update::<T, RegistryError, _>(&entity.id, |doc| {
                let have = doc.applied() as usize;
                if have >= changes.len() {
                    return Ok(Change::Unchanged);
                }
                for event in &changes[have..] {
                    doc.apply_event(event)?;
                }
                Ok(Change::Modified)
            })
            .await
    }

    async fn restore<T: Tracked>(
        &self,
        entity: &EntityRef,
    ) -> Result<Option<Reconciled<T>>, RegistryError> {
        let events = self.ledger.events(entity).await?;
        if events.is_empty() {
            return Ok(None);
        }

        let document = rebuild::<T>(entity, &events)?;
        if !self.mirror.insert_new(&document).await? {
            // written concurrently, most likely by the registration itself
            return match self.mirror.load::<T>(&entity.id).await? {
                Some(document) => Ok(Some(Reconciled {
                    document,
                    outcome: Reconciliation::InSync,
                })),
                None => Err(MirrorError::Conflict(entity.key()).into()),
            };
        }

        warn!(%entity, records = document.history().len(), "restored missing mirror document");
        Ok(Some(Reconciled {
            document,
            outcome: Reconciliation::Restored,
        }))
    }

    async fn force_rebuild<T: Tracked>(
        &self,
        entity: &EntityRef,
        mirror_len: u64,
        ledger_len: u64,
    ) -> Result<Option<Reconciled<T>>, RegistryError> {
        let corruption = || RegistryError::MirrorCorruption {
            entity: entity.clone(),
            mirror: mirror_len,
            ledger: ledger_len,
        };

        let events = self.ledger.events(entity).await?;
        let document = rebuild::<T>(entity, &events).map_err(|e| {
            error!(%entity, error = %e, "rebuild from ledger failed");
            corruption()
        })?;
        self.mirror.save(&document).await.map_err(|e| {
            error!(%entity, error = %e, "could not store rebuilt document");
            corruption()
        })?;

        error!(
            %entity,
            mirror = mirror_len,
            ledger = ledger_len,
            "mirror corruption repaired from ledger history"
        );
        Ok(Some(Reconciled {
            document,
            outcome: Reconciliation::Rebuilt {
                mirror: mirror_len,
                ledger: ledger_len,
            },
        }))
    }
}

/// Folds the full ledger history of `entity`, starting from its registration
/// and replaying status changes and amendments in ledger order.
pub fn rebuild<T: Tracked>(entity: &EntityRef, events: &[LedgerEvent]) -> Result<T, RegistryError> {
    let genesis = events
        .iter()
        .find_map(|e| match &e.action.payload {
            Payload::Register { genesis } => Some(genesis),
            _ => None,
        })
        .ok_or_else(|| RegistryError::NotFound {
            entity: entity.clone(),
        })?;

    let mut document: T = minicbor::decode(genesis).map_err(MirrorError::from)?;
    for event in events.iter().filter(|e| !e.action.is_registration()) {
        document.apply_event(event)?;
    }
    Ok(document)
}
