//! Registry of host-visible handles to native resources.
//!
//! The host never sees a native pointer. It holds a [`HandleId`] that indexes
//! a typed record in the registry; the record carries the native pointer, an
//! ownership tag deciding whether releasing the handle releases the native
//! object, and the open flags of databases and streams.
//!
//! Ids are never reused, so an id that is no longer in the registry is
//! always stale and releasing it again is a no-op.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::engine::{
    BlobPtr, DbPtr, DocPtr, QueryPtr, ReadStreamPtr, ReplicatorPtr, WriteStreamPtr,
};
use crate::error::{BindingError, BindingResult};
use crate::listener::ListenerRegistration;

/// Opaque token identifying one wrapped native resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl HandleId {
    pub fn from_raw(raw: u64) -> Self {
        HandleId(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Whether dropping the handle releases the native resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Created by a call that transferred ownership to the binding.
    Owned,
    /// Borrowed from another native object (a blob inside a document's
    /// properties, the database of a replicator configuration).
    Borrowed,
}

/// An open database.
#[derive(Debug)]
pub struct DatabaseRecord {
    pub ptr: DbPtr,
    open: AtomicBool,
    released: AtomicBool,
}

impl DatabaseRecord {
    pub fn new(ptr: DbPtr) -> Self {
        Self {
            ptr,
            open: AtomicBool::new(true),
            released: AtomicBool::new(false),
        }
    }

    /// Set once the owning handle has released the native database.
    /// Borrowed handles sharing this record become stale.
    pub fn mark_released(&self) {
        self.released.store(true, Ordering::Release);
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn mark_closed(&self) {
        self.open.store(false, Ordering::Release);
    }

    pub fn ensure_open(&self) -> BindingResult<DbPtr> {
        if self.is_open() {
            Ok(self.ptr)
        } else {
            Err(BindingError::DatabaseClosed)
        }
    }
}

/// Fails with `DatabaseClosed` when the owning database, if any, is closed.
pub fn ensure_owner_open(owner: &Option<Arc<DatabaseRecord>>) -> BindingResult<()> {
    match owner {
        Some(db) => db.ensure_open().map(|_| ()),
        None => Ok(()),
    }
}

/// Shared flag cleared when the native object behind an owned handle is
/// released. Handles borrowed from that object check it before every use.
#[derive(Debug, Clone)]
pub struct Liveness(Arc<AtomicBool>);

impl Liveness {
    pub fn new() -> Self {
        Liveness(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_live(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn kill(&self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct DocumentRecord {
    pub ptr: DocPtr,
    /// Database the document was read from; `None` until it is saved.
    pub database: Option<Arc<DatabaseRecord>>,
    pub liveness: Liveness,
}

impl DocumentRecord {
    pub fn new(ptr: DocPtr, database: Option<Arc<DatabaseRecord>>) -> Self {
        Self {
            ptr,
            database,
            liveness: Liveness::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueryRecord {
    pub ptr: QueryPtr,
    pub database: Arc<DatabaseRecord>,
}

#[derive(Debug, Clone)]
pub struct BlobRecord {
    pub ptr: BlobPtr,
    pub database: Option<Arc<DatabaseRecord>>,
    /// Liveness of the document a borrowed blob was read from.
    pub owner: Option<Liveness>,
}

/// A blob read or write stream.
#[derive(Debug)]
pub struct StreamRecord<P> {
    pub ptr: P,
    pub database: Option<Arc<DatabaseRecord>>,
    open: AtomicBool,
}

impl<P: Copy> StreamRecord<P> {
    pub fn new(ptr: P, database: Option<Arc<DatabaseRecord>>) -> Self {
        Self {
            ptr,
            database,
            open: AtomicBool::new(true),
        }
    }

    pub fn ensure_open(&self) -> BindingResult<P> {
        ensure_owner_open(&self.database)?;
        if self.open.load(Ordering::Acquire) {
            Ok(self.ptr)
        } else {
            Err(BindingError::StreamClosed)
        }
    }

    /// Flip the stream to closed. Returns `true` only for the call that
    /// actually closed it.
    pub fn take_open(&self) -> bool {
        self.open.swap(false, Ordering::AcqRel)
    }
}

/// A replicator plus the host callbacks installed through its configuration.
#[derive(Debug)]
pub struct ReplicatorRecord {
    pub ptr: ReplicatorPtr,
    pub database: Arc<DatabaseRecord>,
    /// Target database of a local-database endpoint.
    pub target: Option<Arc<DatabaseRecord>>,
    pub callbacks: Vec<ListenerRegistration>,
}

#[derive(Debug, Clone)]
pub enum Resource {
    Database(Arc<DatabaseRecord>),
    Document(DocumentRecord),
    Query(QueryRecord),
    Blob(BlobRecord),
    ReadStream(Arc<StreamRecord<ReadStreamPtr>>),
    WriteStream(Arc<StreamRecord<WriteStreamPtr>>),
    Replicator(Arc<ReplicatorRecord>),
}

impl Resource {
    pub fn kind(&self) -> &'static str {
        match self {
            Resource::Database(_) => "database",
            Resource::Document(_) => "document",
            Resource::Query(_) => "query",
            Resource::Blob(_) => "blob",
            Resource::ReadStream(_) => "blob read stream",
            Resource::WriteStream(_) => "blob write stream",
            Resource::Replicator(_) => "replicator",
        }
    }
}

/// A registry entry.
#[derive(Debug, Clone)]
pub struct Slot {
    pub resource: Resource,
    pub ownership: Ownership,
}

/// Arena of wrapped native resources.
#[derive(Debug)]
pub struct HandleRegistry {
    slots: Mutex<HashMap<HandleId, Slot>>,
    next_id: AtomicU64,
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! resolver {
    ($(#[$doc:meta])* $name:ident, $variant:ident, $kind:literal, $out:ty) => {
        $(#[$doc])*
        pub fn $name(&self, id: HandleId) -> BindingResult<$out> {
            match self.lookup(id, $kind)? {
                Resource::$variant(record) => Ok(record),
                other => Err(wrong_kind($kind, &other)),
            }
        }
    };
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Wrap a native resource in a new handle.
    pub fn wrap(&self, resource: Resource, ownership: Ownership) -> HandleId {
        let id = HandleId(self.next_id.fetch_add(1, Ordering::Relaxed));
        tracing::trace!(handle = %id, kind = resource.kind(), ?ownership, "wrap");
        self.slots.lock().insert(id, Slot { resource, ownership });
        id
    }

    /// Remove a handle. Returns the slot the first time, `None` afterwards.
    pub fn release(&self, id: HandleId) -> Option<Slot> {
        let slot = self.slots.lock().remove(&id);
        match &slot {
            Some(s) => tracing::trace!(handle = %id, kind = s.resource.kind(), "release"),
            None => tracing::trace!(handle = %id, "release of stale handle ignored"),
        }
        slot
    }

    pub fn contains(&self, id: HandleId) -> bool {
        self.slots.lock().contains_key(&id)
    }

    pub fn ownership(&self, id: HandleId) -> Option<Ownership> {
        self.slots.lock().get(&id).map(|s| s.ownership)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, id: HandleId, kind: &'static str) -> BindingResult<Resource> {
        self.slots
            .lock()
            .get(&id)
            .map(|slot| slot.resource.clone())
            .ok_or(BindingError::StaleHandle { kind })
    }

    /// A database record whose native database is still allocated.
    pub fn database(&self, id: HandleId) -> BindingResult<Arc<DatabaseRecord>> {
        match self.lookup(id, "database")? {
            Resource::Database(record) if record.is_released() => {
                Err(BindingError::StaleHandle { kind: "database" })
            }
            Resource::Database(record) => Ok(record),
            other => Err(wrong_kind("database", &other)),
        }
    }

    /// A blob record; a blob borrowed from a released document is stale.
    pub fn blob(&self, id: HandleId) -> BindingResult<BlobRecord> {
        match self.lookup(id, "blob")? {
            Resource::Blob(record) if record.owner.as_ref().is_some_and(|o| !o.is_live()) => {
                Err(BindingError::StaleHandle { kind: "blob" })
            }
            Resource::Blob(record) => Ok(record),
            other => Err(wrong_kind("blob", &other)),
        }
    }

    resolver!(document, Document, "document", DocumentRecord);
    resolver!(query, Query, "query", QueryRecord);
    resolver!(read_stream, ReadStream, "blob read stream", Arc<StreamRecord<ReadStreamPtr>>);
    resolver!(write_stream, WriteStream, "blob write stream", Arc<StreamRecord<WriteStreamPtr>>);
    resolver!(replicator, Replicator, "replicator", Arc<ReplicatorRecord>);
}

fn wrong_kind(expected: &str, found: &Resource) -> BindingError {
    BindingError::invalid_argument(format!(
        "expected a {} handle, got a {} handle",
        expected,
        found.kind()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_is_idempotent() {
        let registry = HandleRegistry::new();
        let db = Arc::new(DatabaseRecord::new(DbPtr::from_raw(1)));
        let id = registry.wrap(Resource::Database(db), Ownership::Owned);

        assert!(registry.release(id).is_some());
        assert!(registry.release(id).is_none());
        assert!(registry.is_empty());
        assert_eq!(
            registry.database(id).unwrap_err(),
            BindingError::StaleHandle { kind: "database" }
        );
    }

    #[test]
    fn ids_are_not_reused() {
        let registry = HandleRegistry::new();
        let a = registry.wrap(
            Resource::Database(Arc::new(DatabaseRecord::new(DbPtr::from_raw(1)))),
            Ownership::Owned,
        );
        registry.release(a);
        let b = registry.wrap(
            Resource::Database(Arc::new(DatabaseRecord::new(DbPtr::from_raw(1)))),
            Ownership::Owned,
        );
        assert_ne!(a, b);
        assert!(registry.database(a).is_err());
    }

    #[test]
    fn wrong_kind_is_a_type_error() {
        let registry = HandleRegistry::new();
        let db = Arc::new(DatabaseRecord::new(DbPtr::from_raw(3)));
        let id = registry.wrap(Resource::Database(db), Ownership::Owned);

        let err = registry.document(id).unwrap_err();
        assert!(err.is_type_error());
    }

    #[test]
    fn closed_database_fails_fast() {
        let db = Arc::new(DatabaseRecord::new(DbPtr::from_raw(4)));
        assert!(db.ensure_open().is_ok());
        db.mark_closed();
        assert_eq!(db.ensure_open().unwrap_err(), BindingError::DatabaseClosed);
        assert_eq!(
            ensure_owner_open(&Some(db)).unwrap_err(),
            BindingError::DatabaseClosed
        );
        assert!(ensure_owner_open(&None).is_ok());
    }

    #[test]
    fn borrowed_database_shares_open_flag() {
        let registry = HandleRegistry::new();
        let db = Arc::new(DatabaseRecord::new(DbPtr::from_raw(5)));
        let owned = registry.wrap(Resource::Database(db.clone()), Ownership::Owned);
        let borrowed = registry.wrap(Resource::Database(db.clone()), Ownership::Borrowed);

        db.mark_closed();
        assert!(!registry.database(borrowed).unwrap().is_open());
        assert_eq!(registry.ownership(borrowed), Some(Ownership::Borrowed));

        registry.release(owned);
        assert!(registry.contains(borrowed));
    }

    #[test]
    fn released_database_is_stale_through_every_handle() {
        let registry = HandleRegistry::new();
        let db = Arc::new(DatabaseRecord::new(DbPtr::from_raw(6)));
        let owned = registry.wrap(Resource::Database(db.clone()), Ownership::Owned);
        let borrowed = registry.wrap(Resource::Database(db.clone()), Ownership::Borrowed);

        db.mark_released();
        registry.release(owned);
        assert!(registry.contains(borrowed));
        assert_eq!(
            registry.database(borrowed).unwrap_err(),
            BindingError::StaleHandle { kind: "database" }
        );
    }

    #[test]
    fn borrowed_blob_follows_its_document() {
        let registry = HandleRegistry::new();
        let doc = DocumentRecord::new(DocPtr::from_raw(7), None);
        let blob = registry.wrap(
            Resource::Blob(BlobRecord {
                ptr: BlobPtr::from_raw(8),
                database: None,
                owner: Some(doc.liveness.clone()),
            }),
            Ownership::Borrowed,
        );

        assert!(registry.blob(blob).is_ok());
        doc.liveness.kill();
        assert_eq!(
            registry.blob(blob).unwrap_err(),
            BindingError::StaleHandle { kind: "blob" }
        );
    }

    #[test]
    fn stream_close_happens_once() {
        let stream = StreamRecord::new(ReadStreamPtr::from_raw(1), None);
        assert!(stream.ensure_open().is_ok());
        assert!(stream.take_open());
        assert!(!stream.take_open());
        assert_eq!(stream.ensure_open().unwrap_err(), BindingError::StreamClosed);
    }
}
