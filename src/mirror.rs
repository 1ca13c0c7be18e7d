//! Document mirror
//!
//! One cbor document per entity, keyed `collection/id`, with its history
//! embedded so entity and history are read and written together. The mirror
//! is a cache of the ledger; see [`crate::reconcile`] for how it is repaired.
use crate::error::MirrorError;
use crate::types::{EntityKind, EntityRef};
use async_trait::async_trait;
use sled::Db;
use std::sync::Arc;
use tracing::{debug, warn};

// compare-and-set attempts before giving up on a contended document
const MAX_CAS_ATTEMPTS: usize = 16;

#[async_trait]
pub trait MirrorStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, MirrorError>;

    /// Whole-document overwrite.
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), MirrorError>;

    /// Writes `value` only if the stored bytes still equal `expected`
    /// (`None` meaning absent). Returns whether the write happened.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<Vec<u8>>,
        value: Vec<u8>,
    ) -> Result<bool, MirrorError>;

    async fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, MirrorError>;
}

/// Mirror store backed by a sled tree.
pub struct SledMirror {
    instance: Arc<sled::Db>,
}

impl SledMirror {
    pub fn new(instance: Arc<sled::Db>) -> Self {
        Self { instance }
    }

    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, MirrorError> {
        Ok(Self::new(Arc::new(sled::open(path)?)))
    }

    /// Throwaway database removed on drop.
    pub fn temporary() -> Result<Self, MirrorError> {
        let db: Db = sled::Config::new().temporary(true).open()?;
        Ok(Self::new(Arc::new(db)))
    }
}

#[async_trait]
impl MirrorStore for SledMirror {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, MirrorError> {
        Ok(self.instance.get(key.as_bytes())?.map(|v| v.to_vec()))
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), MirrorError> {
        self.instance.insert(key.as_bytes(), value)?;
        self.instance.flush_async().await?;
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<Vec<u8>>,
        value: Vec<u8>,
    ) -> Result<bool, MirrorError> {
        let swapped = self
            .instance
            .compare_and_swap(key.as_bytes(), expected, Some(value))?
            .is_ok();
        if swapped {
            self.instance.flush_async().await?;
        }
        Ok(swapped)
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, MirrorError> {
        let mut found = vec![];
        for entry in self.instance.scan_prefix(prefix.as_bytes()) {
            let (key, value) = entry?;
            found.push((String::from_utf8_lossy(&key).into_owned(), value.to_vec()));
        }
        Ok(found)
    }
}

/// A value stored as one mirror document.
pub trait Document:
    minicbor::Encode<()> + for<'b> minicbor::Decode<'b, ()> + Send + Sync + Sized + 'static
{
    const KIND: EntityKind;

    fn id(&self) -> &str;

    fn key_for(id: &str) -> String {
        EntityRef::new(Self::KIND, id).key()
    }
}

/// What an update closure did to the document it was handed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Modified,
    Unchanged,
}

/// Typed access to a [`MirrorStore`].
#[derive(Clone)]
pub struct Mirror {
    store: Arc<dyn MirrorStore>,
}

impl Mirror {
    pub fn new(store: Arc<dyn MirrorStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn MirrorStore> {
        &self.store
    }

    pub async fn load<D: Document>(&self, id: &str) -> Result<Option<D>, MirrorError> {
        match self.store.get(&D::key_for(id)).await? {
            Some(bytes) => Ok(Some(minicbor::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn save<D: Document>(&self, doc: &D) -> Result<(), MirrorError> {
        let bytes = encode(doc)?;
        self.store.set(&D::key_for(doc.id()), bytes).await
    }

    /// Inserts `doc` unless a document with its id already exists.
    pub async fn insert_new<D: Document>(&self, doc: &D) -> Result<bool, MirrorError> {
        let bytes = encode(doc)?;
        self.store
            .compare_and_set(&D::key_for(doc.id()), None, bytes)
            .await
    }

    /// Atomic read-modify-write of one document. `apply` may run more than
    /// once if the document changes underneath it; it must be repeatable.
    /// Returns the stored document, or `None` if it does not exist.
    pub async fn update<D, E, F>(&self, id: &str, mut apply: F) -> Result<Option<D>, E>
    where
        D: Document,
        E: From<MirrorError>,
        F: FnMut(&mut D) -> Result<Change, E> + Send,
    {
        let key = D::key_for(id);

        for attempt in 0..MAX_CAS_ATTEMPTS {
            let Some(current) = self.store.get(&key).await? else {
                return Ok(None);
            };
            let mut doc: D = minicbor::decode(&current).map_err(MirrorError::from)?;

            if apply(&mut doc)? == Change::Unchanged {
                return Ok(Some(doc));
            }

            let bytes = encode(&doc)?;
            if self.store.compare_and_set(&key, Some(current), bytes).await? {
                return Ok(Some(doc));
            }
            debug!(%key, attempt, "document changed during update, retrying");
        }

        warn!(%key, "giving up on contended document");
        Err(MirrorError::Conflict(key).into())
    }

    /// All documents of type `D`.
    pub async fn list<D: Document>(&self) -> Result<Vec<D>, MirrorError> {
        let prefix = format!("{}/", D::KIND.collection());
        let mut docs = vec![];
        for (_, bytes) in self.store.scan(&prefix).await? {
            docs.push(minicbor::decode(&bytes)?);
        }
        Ok(docs)
    }
}

fn encode<D: Document>(doc: &D) -> Result<Vec<u8>, MirrorError> {
    minicbor::to_vec(doc).map_err(|e| MirrorError::Encode(e.to_string()))
}
