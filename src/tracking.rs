//! Tracking records and the append-only history they form
//!
//! Every record is sealed with the hash of its predecessor, so a history is a
//! chain: editing, dropping or reordering any record breaks [`History::verify`].
//! Records are only ever built from ledger-confirmed actions; the timestamp is
//! the ledger's, never the caller's clock.
use crate::error::{ChainError, LedgerError, RegistryError};
use crate::ledger::{LedgerEvent, Payload};
use crate::mirror::Document;
use crate::product::Amendment;
use crate::status::{self, Status};
use crate::types::{ActorId, EntityKind, EntityRef, TimeStamp};
use crate::utils;
use chrono::Utc;

/// Hash a history starts from.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, PartialEq, Eq, minicbor::Encode, minicbor::Decode, Clone)]
pub struct TrackingRecord {
    #[n(0)]
    pub status: Status,
    #[n(1)]
    pub location: String,
    #[n(2)]
    pub timestamp: TimeStamp<Utc>, // assigned by the ledger on confirmation
    #[n(3)]
    pub updated_by: ActorId,
    #[n(4)]
    pub notes: Option<String>,
    #[n(5)]
    pub transaction_ref: Option<String>,
    #[n(6)]
    pub quantity: u64, // units removed from stock by this step
    #[n(7)]
    pub prev_hash: String,
    #[n(8)]
    pub hash: String,
}

// the hashed portion of a record, everything but `hash` itself
#[derive(minicbor::Encode)]
struct RecordBody<'a> {
    #[n(0)]
    status: Status,
    #[n(1)]
    location: &'a str,
    #[n(2)]
    timestamp: &'a TimeStamp<Utc>,
    #[n(3)]
    updated_by: &'a ActorId,
    #[n(4)]
    notes: Option<&'a str>,
    #[n(5)]
    transaction_ref: Option<&'a str>,
    #[n(6)]
    quantity: u64,
    #[n(7)]
    prev_hash: &'a str,
}

impl TrackingRecord {
    /// Builds the record for a confirmed status-change event, linked to `prev_hash`.
    pub fn from_event(event: &LedgerEvent, prev_hash: &str) -> Result<Self, LedgerError> {
        let Payload::StatusChange {
            target,
            location,
            notes,
            quantity,
        } = &event.action.payload
        else {
            return Err(LedgerError::Payload(format!(
                "{} is not a status change",
                event.receipt.tx
            )));
        };

        let mut record = Self {
            status: *target,
            location: location.clone(),
            timestamp: event.receipt.timestamp.clone(),
            updated_by: event.action.actor.clone(),
            notes: notes.clone(),
            transaction_ref: Some(event.receipt.tx.to_string()),
            quantity: *quantity,
            prev_hash: prev_hash.to_owned(),
            hash: String::new(),
        };
        record.hash = record
            .compute_hash()
            .map_err(|e| LedgerError::Payload(e.to_string()))?;

        Ok(record)
    }

    pub fn compute_hash(&self) -> Result<String, ChainError> {
        let body = RecordBody {
            status: self.status,
            location: &self.location,
            timestamp: &self.timestamp,
            updated_by: &self.updated_by,
            notes: self.notes.as_deref(),
            transaction_ref: self.transaction_ref.as_deref(),
            quantity: self.quantity,
            prev_hash: &self.prev_hash,
        };

        utils::digest(&body).map_err(|e| ChainError::Encoding(e.to_string()))
    }

    pub fn is_sealed(&self) -> bool {
        matches!(self.compute_hash(), Ok(hash) if hash == self.hash)
    }
}

/// Ordered, append-only sequence of tracking records.
#[derive(Debug, Default, PartialEq, Eq, minicbor::Encode, minicbor::Decode, Clone)]
pub struct History {
    #[n(0)]
    records: Vec<TrackingRecord>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn len(&self) -> usize {
        self.records.len()
    }
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
    pub fn records(&self) -> &[TrackingRecord] {
        &self.records
    }
    pub fn last(&self) -> Option<&TrackingRecord> {
        self.records.last()
    }
    pub fn get(&self, position: usize) -> Option<&TrackingRecord> {
        self.records.get(position)
    }
    pub fn head_hash(&self) -> &str {
        self.records
            .last()
            .map(|r| r.hash.as_str())
            .unwrap_or(GENESIS_HASH)
    }
    pub fn into_records(self) -> Vec<TrackingRecord> {
        self.records
    }

    /// Appends `record` if it extends the chain; the history is unchanged otherwise.
    pub fn append(&mut self, record: TrackingRecord) -> Result<(), ChainError> {
        let position = self.records.len();

        if record.prev_hash != self.head_hash() {
            return Err(ChainError::BrokenLink { position });
        }
        if !record.is_sealed() {
            return Err(ChainError::Tampered { position });
        }
        if let Some(last) = self.records.last() {
            if record.timestamp < last.timestamp {
                return Err(ChainError::OutOfOrder { position });
            }
        }

        self.records.push(record);
        Ok(())
    }

    /// Walks the whole chain from genesis.
    pub fn verify(&self) -> Result<(), ChainError> {
        let mut replay = History::new();
        for record in &self.records {
            replay.append(record.clone())?;
        }
        Ok(())
    }
}

/// Collects records as given, without checking links. Use
/// [`History::verify`] before trusting the result.
impl FromIterator<TrackingRecord> for History {
    fn from_iter<I: IntoIterator<Item = TrackingRecord>>(iter: I) -> Self {
        Self {
            records: iter.into_iter().collect(),
        }
    }
}

/// The ledger-derived part of a tracked entity: where it is, who holds it,
/// how many units remain and how it got there.
#[derive(Debug, PartialEq, Eq, minicbor::Encode, minicbor::Decode, Clone)]
pub struct Provenance {
    #[n(0)]
    pub status: Status,
    #[n(1)]
    pub current_owner: ActorId,
    #[n(2)]
    pub quantity: u64,
    #[n(3)]
    pub location: String,
    #[n(4)]
    pub history: History,
}

impl Provenance {
    pub fn new(kind: EntityKind, owner: ActorId, quantity: u64, location: String) -> Self {
        Self {
            status: status::initial(kind),
            current_owner: owner,
            quantity,
            location,
            history: History::new(),
        }
    }

    /// Folds one confirmed record into the current state.
    ///
    /// The ledger is authoritative, so an edge missing from the table is still
    /// applied; it just transfers nothing. A record that removes more units
    /// than remain cannot come from a serialized history and is refused.
    pub fn apply(&mut self, kind: EntityKind, record: TrackingRecord) -> Result<(), ChainError> {
        if record.quantity > self.quantity {
            return Err(ChainError::Overdrawn {
                position: self.history.len(),
                requested: record.quantity,
                available: self.quantity,
            });
        }
        let transfers = status::edge(kind, self.status, record.status)
            .map(|edge| edge.transfers)
            .unwrap_or(false);
        let status = record.status;
        let quantity = record.quantity;
        let location = record.location.clone();
        let actor = record.updated_by.clone();

        self.history.append(record)?;

        self.status = status;
        self.quantity -= quantity;
        if !location.is_empty() {
            self.location = location;
        }
        if transfers {
            self.current_owner = actor;
        }
        Ok(())
    }
}

/// A mirror document whose state is driven by ledger status changes.
pub trait Tracked: Document + Clone {
    /// The actor that registered the entity.
    fn originator(&self) -> &ActorId;
    fn provenance(&self) -> &Provenance;
    fn provenance_mut(&mut self) -> &mut Provenance;

    fn entity(&self) -> EntityRef {
        EntityRef::new(Self::KIND, self.id())
    }
    fn status(&self) -> Status {
        self.provenance().status
    }
    fn history(&self) -> &History {
        &self.provenance().history
    }

    /// Confirmed amendments folded into the document.
    fn revision(&self) -> u64 {
        0
    }
    fn amend(&mut self, _amendment: &Amendment) -> Result<(), RegistryError> {
        Err(RegistryError::Validation(format!(
            "{} cannot be amended",
            self.entity()
        )))
    }

    /// Ledger events after registration that the document reflects.
    fn applied(&self) -> u64 {
        self.history().len() as u64 + self.revision()
    }

    /// Folds one confirmed post-registration event into the document.
    fn apply_event(&mut self, event: &LedgerEvent) -> Result<(), RegistryError> {
        match &event.action.payload {
            Payload::StatusChange { .. } => {
                let record = TrackingRecord::from_event(event, self.history().head_hash())?;
                self.provenance_mut().apply(Self::KIND, record)?;
                Ok(())
            }
            Payload::Amend { amendment } => self.amend(amendment),
            Payload::Register { .. } => Err(LedgerError::Payload(format!(
                "{} registers {} again",
                event.receipt.tx,
                self.entity()
            ))
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{Action, Receipt, ReceiptStatus, TxRef};

    fn event(seq: u64, target: Status, nanos: i64) -> LedgerEvent {
        LedgerEvent {
            action: Action {
                key: format!("p1:{target}:{seq}"),
                entity: EntityRef::product("p1"),
                actor: ActorId::new("user_a"),
                payload: Payload::StatusChange {
                    target,
                    location: "Depot".into(),
                    notes: None,
                    quantity: 0,
                },
            },
            receipt: Receipt {
                tx: TxRef::new(format!("0x{seq}")),
                status: ReceiptStatus::Confirmed,
                timestamp: TimeStamp::from_nanos(nanos),
                block: seq + 1,
                seq: Some(seq),
            },
        }
    }

    fn chain(len: u64) -> History {
        let mut history = History::new();
        for seq in 0..len {
            let stamped = event(seq, Status::Available, 10 * seq as i64);
            let record = TrackingRecord::from_event(&stamped, history.head_hash()).unwrap();
            history.append(record).unwrap();
        }
        history
    }

    #[test]
    fn appended_records_link_to_their_predecessor() {
        let history = chain(3);

        assert_eq!(history.len(), 3);
        assert_eq!(history.records()[0].prev_hash, GENESIS_HASH);
        assert_eq!(history.records()[2].prev_hash, history.records()[1].hash);
        assert!(history.verify().is_ok());
    }

    #[test]
    fn unlinked_record_is_refused() {
        let mut history = chain(2);
        let stray = TrackingRecord::from_event(&event(2, Status::Sold, 100), GENESIS_HASH).unwrap();

        assert_eq!(history.append(stray), Err(ChainError::BrokenLink { position: 2 }));
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn edited_record_fails_verification() {
        let history = chain(3);
        let mut records = history.into_records();
        records[1].location = "Elsewhere".into();
        let tampered = History { records };

        assert_eq!(tampered.verify(), Err(ChainError::Tampered { position: 1 }));
    }

    #[test]
    fn older_timestamp_is_refused() {
        let mut history = chain(2);
        let late =
            TrackingRecord::from_event(&event(2, Status::Sold, 1), history.head_hash()).unwrap();

        assert_eq!(history.append(late), Err(ChainError::OutOfOrder { position: 2 }));
    }

    #[test]
    fn registration_is_not_a_tracking_record() {
        let mut registration = event(0, Status::Created, 0);
        registration.action.payload = Payload::Register { genesis: vec![] };

        assert!(TrackingRecord::from_event(&registration, GENESIS_HASH).is_err());
    }

    #[test]
    fn apply_moves_stock_and_ownership() {
        let mut provenance = Provenance::new(
            EntityKind::Product,
            ActorId::new("user_producer"),
            50,
            "Farm".into(),
        );
        provenance.status = Status::Available;

        let mut shipped = event(0, Status::InTransit, 5);
        shipped.action.actor = ActorId::new("user_distributor");
        shipped.action.payload = Payload::StatusChange {
            target: Status::InTransit,
            location: "Warehouse A".into(),
            notes: None,
            quantity: 20,
        };
        let record = TrackingRecord::from_event(&shipped, provenance.history.head_hash()).unwrap();
        provenance.apply(EntityKind::Product, record).unwrap();

        assert_eq!(provenance.status, Status::InTransit);
        assert_eq!(provenance.quantity, 30);
        assert_eq!(provenance.location, "Warehouse A");
        assert_eq!(provenance.current_owner, ActorId::new("user_distributor"));
    }

    #[test]
    fn overdrawing_record_is_refused() {
        let mut provenance = Provenance::new(
            EntityKind::Product,
            ActorId::new("user_producer"),
            10,
            "Farm".into(),
        );
        provenance.status = Status::Available;

        let mut greedy = event(0, Status::InTransit, 5);
        greedy.action.payload = Payload::StatusChange {
            target: Status::InTransit,
            location: "Warehouse A".into(),
            notes: None,
            quantity: 11,
        };
        let record = TrackingRecord::from_event(&greedy, provenance.history.head_hash()).unwrap();

        assert_eq!(
            provenance.apply(EntityKind::Product, record),
            Err(ChainError::Overdrawn {
                position: 0,
                requested: 11,
                available: 10
            })
        );
        assert_eq!(provenance.quantity, 10);
        assert!(provenance.history.is_empty());
    }
}
