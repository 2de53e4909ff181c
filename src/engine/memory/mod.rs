//! An in-process [`Engine`].
//!
//! Objects live in one table keyed by pointer value; releasing removes them
//! and releasing twice is counted rather than crashing, so tests can assert
//! the binding's release discipline through [`MemoryEngine::stats`].
//!
//! Stores persist per `(directory, name)` for the life of the engine, the
//! way files outlive a connection. Change notifications run on a dedicated
//! notification thread, after the writer has dropped every store lock.

mod query;
mod replicator;
mod store;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use crossbeam_channel::{SendError, Sender};
use parking_lot::Mutex;
use sha1::{Digest, Sha1};

use self::query::QueryState;
use self::replicator::{endpoint_key, target_for, Remotes, ReplicatorState};
use self::store::{Connection, Store};
use super::{
    BlobPtr, DatabaseChangeCallback, DatabaseConfiguration, DbPtr, DocPtr, DocumentChangeCallback,
    DocumentReplicationCallback, Engine, ListenerToken, QueryChangeCallback, QueryLanguage, QueryPtr,
    ReadStreamPtr, ReplicatorChangeCallback, ReplicatorConfiguration, ReplicatorPtr,
    ReplicatorSettings, ReplicatorStatus, ResultSet, WriteStreamPtr,
};
use crate::error::{codes, NativeError};
use crate::value::{dict_from_json_str, dict_to_json_string, is_blob, Dict, NativeValue};

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

type Job = Box<dyn FnOnce() + Send>;

/// The notification thread. Jobs run in the order they were posted.
#[derive(Clone)]
pub(super) struct Notifier {
    tx: Sender<Job>,
}

impl Notifier {
    fn spawn() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        let spawned = thread::Builder::new()
            .name("cbl-notifications".to_string())
            .spawn(move || {
                for job in rx {
                    job();
                }
            });
        if let Err(e) = spawned {
            tracing::error!(error = %e, "notification thread unavailable, notifying inline");
        }
        Self { tx }
    }

    fn post(&self, job: Job) {
        if let Err(SendError(job)) = self.tx.send(job) {
            job();
        }
    }

    pub fn announce(&self, store: &Arc<Store>, ids: Vec<String>) {
        if ids.is_empty() {
            return;
        }
        let store = store.clone();
        self.post(Box::new(move || store.announce(&ids)));
    }

    /// Wait until everything posted so far has run.
    fn flush(&self) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.post(Box::new(move || {
            let _ = tx.send(());
        }));
        let _ = rx.recv();
    }
}

struct DocState {
    id: String,
    properties: Dict,
    mutable: bool,
    store: Option<Arc<Store>>,
    /// Blob contents set on this document and not yet saved.
    attached: HashMap<String, Arc<Vec<u8>>>,
    /// Blob objects handed out by `document_get_blob`; released with the
    /// document.
    owned_blobs: Vec<u64>,
}

impl DocState {
    fn check_mutable(&self) -> Result<(), NativeError> {
        if self.mutable {
            Ok(())
        } else {
            Err(NativeError::cbl(
                codes::NOT_WRITEABLE,
                format!("document '{}' is read-only", self.id),
            ))
        }
    }
}

struct BlobState {
    content_type: String,
    digest: String,
    content: Arc<Vec<u8>>,
}

impl BlobState {
    fn new(content_type: &str, content: Arc<Vec<u8>>) -> Self {
        Self {
            content_type: content_type.to_string(),
            digest: digest_of(&content),
            content,
        }
    }

    fn properties(&self) -> Dict {
        Dict::from([
            ("@type".to_string(), NativeValue::String("blob".to_string())),
            ("content_type".to_string(), NativeValue::String(self.content_type.clone())),
            ("digest".to_string(), NativeValue::String(self.digest.clone())),
            ("length".to_string(), NativeValue::UInt(self.content.len() as u64)),
        ])
    }
}

fn digest_of(data: &[u8]) -> String {
    format!("sha1-{}", BASE64.encode(Sha1::digest(data)))
}

struct ReadState {
    content: Arc<Vec<u8>>,
    position: usize,
}

struct WriteState {
    store: Arc<Store>,
    buffer: Vec<u8>,
}

enum Object {
    Database(Arc<Connection>),
    Document(Arc<Mutex<DocState>>),
    Query(Arc<QueryState>),
    Blob(Arc<BlobState>),
    ReadStream(Arc<Mutex<ReadState>>),
    WriteStream(Arc<Mutex<WriteState>>),
    Replicator(Arc<ReplicatorState>),
}

impl Object {
    fn kind(&self) -> &'static str {
        match self {
            Object::Database(_) => "database",
            Object::Document(_) => "document",
            Object::Query(_) => "query",
            Object::Blob(_) => "blob",
            Object::ReadStream(_) => "blob read stream",
            Object::WriteStream(_) => "blob write stream",
            Object::Replicator(_) => "replicator",
        }
    }
}

enum ListenerOwner {
    Store(Arc<Store>),
    Query(Arc<QueryState>),
    Replicator(Arc<ReplicatorState>),
}

/// Counters describing how the engine has been used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub live_objects: usize,
    pub live_listeners: usize,
    /// Releases of objects that were already released.
    pub double_releases: usize,
    /// Calls made with a pointer to a released object.
    pub dangling_accesses: usize,
}

pub struct MemoryEngine {
    next_id: AtomicU64,
    objects: Mutex<HashMap<u64, Object>>,
    listeners: Mutex<HashMap<u64, ListenerOwner>>,
    stores: Mutex<HashMap<(String, String), Arc<Store>>>,
    remotes: Remotes,
    notifier: Notifier,
    default_directory: String,
    double_releases: AtomicUsize,
    dangling: AtomicUsize,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! accessor {
    ($name:ident, $variant:ident, $ptr:ty, $out:ty) => {
        fn $name(&self, ptr: $ptr) -> Option<$out> {
            let found = match self.objects.lock().get(&ptr.raw()) {
                Some(Object::$variant(obj)) => Some(obj.clone()),
                _ => None,
            };
            if found.is_none() {
                self.dangling.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(ptr = ptr.raw(), kind = stringify!($variant), "access to invalid native object");
            }
            found
        }
    };
}

fn invalid_object(kind: &str) -> NativeError {
    NativeError::cbl(codes::INVALID_PARAMETER, format!("invalid {} object", kind))
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::with_default_directory(".")
    }

    /// Engine whose databases default to `directory`.
    pub fn with_default_directory(directory: impl Into<String>) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            objects: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
            stores: Mutex::new(HashMap::new()),
            remotes: Arc::new(Mutex::new(HashMap::new())),
            notifier: Notifier::spawn(),
            default_directory: directory.into(),
            double_releases: AtomicUsize::new(0),
            dangling: AtomicUsize::new(0),
        }
    }

    /// Make the store `name` reachable by replicators at `url`.
    pub fn register_remote(
        &self,
        url: &str,
        name: &str,
        directory: Option<&str>,
    ) -> Result<(), NativeError> {
        let key = endpoint_key(url)?;
        let store = self.store_for(name, directory);
        tracing::debug!(url = %key, database = name, "registered remote endpoint");
        self.remotes.lock().insert(key, store);
        Ok(())
    }

    /// Forget a remote, making its URL unreachable.
    pub fn unregister_remote(&self, url: &str) -> Result<bool, NativeError> {
        let key = endpoint_key(url)?;
        Ok(self.remotes.lock().remove(&key).is_some())
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            live_objects: self.objects.lock().len(),
            live_listeners: self.listeners.lock().len(),
            double_releases: self.double_releases.load(Ordering::Relaxed),
            dangling_accesses: self.dangling.load(Ordering::Relaxed),
        }
    }

    /// Block until every change notification posted so far has been sent.
    pub fn flush_notifications(&self) {
        self.notifier.flush();
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn insert(&self, object: Object) -> u64 {
        let id = self.next_id();
        self.objects.lock().insert(id, object);
        id
    }

    fn store_for(&self, name: &str, directory: Option<&str>) -> Arc<Store> {
        let directory = directory.unwrap_or(&self.default_directory).to_string();
        self.stores
            .lock()
            .entry((directory.clone(), name.to_string()))
            .or_insert_with(|| Arc::new(Store::new(name, &directory)))
            .clone()
    }

    fn remove(&self, raw: u64, kind: &'static str) -> Option<Object> {
        let mut objects = self.objects.lock();
        match objects.get(&raw).map(Object::kind) {
            Some(found) if found == kind => objects.remove(&raw),
            Some(found) => {
                tracing::warn!(ptr = raw, expected = kind, found, "release with wrong object kind");
                None
            }
            None => {
                self.double_releases.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(ptr = raw, kind, "release of unknown native object");
                None
            }
        }
    }

    fn add_listener(&self, owner: ListenerOwner) -> u64 {
        let token = self.next_id();
        self.listeners.lock().insert(token, owner);
        token
    }

    accessor!(database, Database, DbPtr, Arc<Connection>);
    accessor!(document, Document, DocPtr, Arc<Mutex<DocState>>);
    accessor!(query, Query, QueryPtr, Arc<QueryState>);
    accessor!(blob, Blob, BlobPtr, Arc<BlobState>);
    accessor!(read_stream, ReadStream, ReadStreamPtr, Arc<Mutex<ReadState>>);
    accessor!(write_stream, WriteStream, WriteStreamPtr, Arc<Mutex<WriteState>>);
    accessor!(replicator, Replicator, ReplicatorPtr, Arc<ReplicatorState>);

    fn open_store(&self, db: DbPtr) -> Result<(Arc<Connection>, Arc<Store>), NativeError> {
        let connection = self.database(db).ok_or_else(|| invalid_object("database"))?;
        let store = connection.check_open()?.clone();
        Ok((connection, store))
    }

    fn load_document(&self, db: DbPtr, id: &str, mutable: bool) -> Result<Option<DocPtr>, NativeError> {
        let (_, store) = self.open_store(db)?;
        let revision = match store.get(id) {
            Some(revision) => revision,
            None => return Ok(None),
        };
        let doc = DocState {
            id: id.to_string(),
            properties: revision.properties,
            mutable,
            store: Some(store),
            attached: HashMap::new(),
            owned_blobs: Vec::new(),
        };
        Ok(Some(DocPtr::from_raw(
            self.insert(Object::Document(Arc::new(Mutex::new(doc)))),
        )))
    }

    fn new_blob(&self, blob: BlobState) -> BlobPtr {
        BlobPtr::from_raw(self.insert(Object::Blob(Arc::new(blob))))
    }
}

impl Engine for MemoryEngine {
    fn database_open(&self, name: &str, config: &DatabaseConfiguration) -> Result<DbPtr, NativeError> {
        if name.is_empty() || name.contains('/') {
            return Err(NativeError::cbl(
                codes::INVALID_PARAMETER,
                format!("invalid database name '{}'", name),
            ));
        }
        let store = self.store_for(name, config.directory.as_deref());
        let id = self.next_id();
        let connection = Arc::new(Connection::new(id, store));
        self.objects.lock().insert(id, Object::Database(connection));
        tracing::debug!(database = name, ptr = id, "database opened");
        Ok(DbPtr::from_raw(id))
    }

    fn database_close(&self, db: DbPtr) -> Result<(), NativeError> {
        let connection = self.database(db).ok_or_else(|| invalid_object("database"))?;
        connection.close()?;
        Ok(())
    }

    fn database_delete(&self, db: DbPtr) -> Result<(), NativeError> {
        let connection = self.database(db).ok_or_else(|| invalid_object("database"))?;
        let store = connection.store.clone();
        let own = usize::from(connection.is_open());
        if store.connections() > own {
            return Err(NativeError::cbl(
                codes::BUSY,
                "database is open in another connection",
            ));
        }
        connection.close()?;
        let key = (store.directory.clone(), store.name.clone());
        self.stores.lock().remove(&key);
        tracing::debug!(database = %store.name, "database deleted");
        Ok(())
    }

    fn delete_database_named(&self, name: &str, directory: Option<&str>) -> Result<bool, NativeError> {
        let key = (
            directory.unwrap_or(&self.default_directory).to_string(),
            name.to_string(),
        );
        let mut stores = self.stores.lock();
        match stores.get(&key) {
            Some(store) if store.connections() > 0 => Err(NativeError::cbl(
                codes::BUSY,
                format!("database '{}' is still open", name),
            )),
            Some(_) => {
                stores.remove(&key);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn database_release(&self, db: DbPtr) {
        if let Some(Object::Database(connection)) = self.remove(db.raw(), "database") {
            if connection.store.in_transaction(connection.id) {
                let _ = connection.store.end(connection.id, false);
            }
            let _ = connection.close();
        }
    }

    fn database_name(&self, db: DbPtr) -> String {
        self.database(db)
            .map(|c| c.store.name.clone())
            .unwrap_or_default()
    }

    fn database_path(&self, db: DbPtr) -> String {
        self.database(db).map(|c| c.store.path()).unwrap_or_default()
    }

    fn database_count(&self, db: DbPtr) -> u64 {
        self.database(db).map(|c| c.store.count()).unwrap_or(0)
    }

    fn begin_transaction(&self, db: DbPtr) -> Result<(), NativeError> {
        let (connection, store) = self.open_store(db)?;
        store.begin(connection.id)
    }

    fn end_transaction(&self, db: DbPtr, commit: bool) -> Result<(), NativeError> {
        let (connection, store) = self.open_store(db)?;
        let announce = store.end(connection.id, commit)?;
        self.notifier.announce(&store, announce);
        Ok(())
    }

    fn database_add_change_listener(
        &self,
        db: DbPtr,
        callback: DatabaseChangeCallback,
    ) -> Option<ListenerToken> {
        let (_, store) = self.open_store(db).ok()?;
        let token = self.add_listener(ListenerOwner::Store(store.clone()));
        store.add_database_listener(token, Arc::from(callback));
        Some(ListenerToken::from_raw(token))
    }

    fn database_add_document_listener(
        &self,
        db: DbPtr,
        doc_id: &str,
        callback: DocumentChangeCallback,
    ) -> Option<ListenerToken> {
        let (_, store) = self.open_store(db).ok()?;
        let token = self.add_listener(ListenerOwner::Store(store.clone()));
        store.add_document_listener(token, doc_id, Arc::from(callback));
        Some(ListenerToken::from_raw(token))
    }

    fn document_get(&self, db: DbPtr, id: &str) -> Result<Option<DocPtr>, NativeError> {
        self.load_document(db, id, false)
    }

    fn document_get_mutable(&self, db: DbPtr, id: &str) -> Result<Option<DocPtr>, NativeError> {
        self.load_document(db, id, true)
    }

    fn document_create(&self, id: Option<&str>) -> DocPtr {
        let id = match id {
            Some(id) => id.to_string(),
            None => uuid::Uuid::new_v4().to_string(),
        };
        let doc = DocState {
            id,
            properties: Dict::new(),
            mutable: true,
            store: None,
            attached: HashMap::new(),
            owned_blobs: Vec::new(),
        };
        DocPtr::from_raw(self.insert(Object::Document(Arc::new(Mutex::new(doc)))))
    }

    fn document_save(&self, db: DbPtr, doc: DocPtr) -> Result<(), NativeError> {
        let (_, store) = self.open_store(db)?;
        let doc = self.document(doc).ok_or_else(|| invalid_object("document"))?;
        let (id, announce) = {
            let mut doc = doc.lock();
            doc.check_mutable()?;
            if doc.id.is_empty() {
                return Err(NativeError::cbl(codes::BAD_DOC_ID, "document id is empty"));
            }
            if let Some(owner) = &doc.store {
                if !Arc::ptr_eq(owner, &store) {
                    return Err(NativeError::cbl(
                        codes::INVALID_PARAMETER,
                        "document belongs to another database",
                    ));
                }
            }
            let blobs: Vec<(String, Arc<Vec<u8>>)> = doc.attached.drain().collect();
            let (_, announce) = store.put(&doc.id, Some(doc.properties.clone()), blobs);
            doc.store = Some(store.clone());
            (doc.id.clone(), announce)
        };
        tracing::trace!(doc = %id, "document saved");
        self.notifier.announce(&store, announce);
        Ok(())
    }

    fn document_delete(&self, db: DbPtr, doc: DocPtr) -> Result<(), NativeError> {
        let (_, store) = self.open_store(db)?;
        let doc = self.document(doc).ok_or_else(|| invalid_object("document"))?;
        let id = doc.lock().id.clone();
        if !store.contains_live(&id) {
            return Err(NativeError::cbl(
                codes::NOT_FOUND,
                format!("document '{}' not found", id),
            ));
        }
        let (_, announce) = store.put(&id, None, Vec::new());
        self.notifier.announce(&store, announce);
        Ok(())
    }

    fn document_id(&self, doc: DocPtr) -> String {
        self.document(doc).map(|d| d.lock().id.clone()).unwrap_or_default()
    }

    fn document_properties(&self, doc: DocPtr) -> Dict {
        self.document(doc)
            .map(|d| d.lock().properties.clone())
            .unwrap_or_default()
    }

    fn document_set_properties(&self, doc: DocPtr, properties: Dict) -> Result<(), NativeError> {
        let doc = self.document(doc).ok_or_else(|| invalid_object("document"))?;
        let mut doc = doc.lock();
        doc.check_mutable()?;
        doc.properties = properties;
        Ok(())
    }

    fn document_to_json(&self, doc: DocPtr) -> String {
        dict_to_json_string(&self.document_properties(doc))
    }

    fn document_set_json(&self, doc: DocPtr, json: &str) -> Result<(), NativeError> {
        let properties = dict_from_json_str(json)?;
        self.document_set_properties(doc, properties)
    }

    fn document_release(&self, doc: DocPtr) {
        if let Some(Object::Document(doc)) = self.remove(doc.raw(), "document") {
            let owned = std::mem::take(&mut doc.lock().owned_blobs);
            let mut objects = self.objects.lock();
            for blob in owned {
                objects.remove(&blob);
            }
        }
    }

    fn query_create(&self, db: DbPtr, language: QueryLanguage, text: &str) -> Result<QueryPtr, NativeError> {
        let connection = self.database(db).ok_or_else(|| invalid_object("database"))?;
        let query = QueryState::compile(connection, language, text)?;
        Ok(QueryPtr::from_raw(self.insert(Object::Query(Arc::new(query)))))
    }

    fn query_execute(&self, query: QueryPtr) -> Result<Box<dyn ResultSet>, NativeError> {
        let query = self.query(query).ok_or_else(|| invalid_object("query"))?;
        let rows = query.execute()?;
        Ok(Box::new(rows.into_iter()))
    }

    fn query_explain(&self, query: QueryPtr) -> String {
        self.query(query).map(|q| q.explain()).unwrap_or_default()
    }

    fn query_parameters(&self, query: QueryPtr) -> Dict {
        self.query(query).map(|q| q.parameters()).unwrap_or_default()
    }

    fn query_set_parameters(&self, query: QueryPtr, parameters: Dict) {
        if let Some(query) = self.query(query) {
            query.set_parameters(parameters);
            if query.has_listeners() {
                self.notifier.post(Box::new(move || query.refresh()));
            }
        }
    }

    fn query_add_change_listener(
        &self,
        query: QueryPtr,
        callback: QueryChangeCallback,
    ) -> Option<ListenerToken> {
        let query = self.query(query)?;
        if !query.is_open() {
            return None;
        }
        let token = self.add_listener(ListenerOwner::Query(query.clone()));
        query.add_listener(token, Arc::from(callback));
        self.notifier.post(Box::new(move || query.send_initial(token)));
        Some(ListenerToken::from_raw(token))
    }

    fn query_release(&self, query: QueryPtr) {
        self.remove(query.raw(), "query");
    }

    fn blob_create_with_data(&self, content_type: &str, data: &[u8]) -> BlobPtr {
        self.new_blob(BlobState::new(content_type, Arc::new(data.to_vec())))
    }

    fn blob_create_with_stream(&self, content_type: &str, stream: WriteStreamPtr) -> Result<BlobPtr, NativeError> {
        let stream = match self.remove(stream.raw(), "blob write stream") {
            Some(Object::WriteStream(stream)) => stream,
            _ => return Err(invalid_object("blob write stream")),
        };
        let (store, buffer) = {
            let mut state = stream.lock();
            (state.store.clone(), std::mem::take(&mut state.buffer))
        };
        let blob = BlobState::new(content_type, Arc::new(buffer));
        store.put_blob(blob.digest.clone(), blob.content.clone());
        Ok(self.new_blob(blob))
    }

    fn blob_length(&self, blob: BlobPtr) -> u64 {
        self.blob(blob).map(|b| b.content.len() as u64).unwrap_or(0)
    }

    fn blob_digest(&self, blob: BlobPtr) -> String {
        self.blob(blob).map(|b| b.digest.clone()).unwrap_or_default()
    }

    fn blob_content_type(&self, blob: BlobPtr) -> String {
        self.blob(blob).map(|b| b.content_type.clone()).unwrap_or_default()
    }

    fn blob_properties(&self, blob: BlobPtr) -> Dict {
        self.blob(blob).map(|b| b.properties()).unwrap_or_default()
    }

    fn blob_to_json(&self, blob: BlobPtr) -> String {
        dict_to_json_string(&self.blob_properties(blob))
    }

    fn blob_equals(&self, a: BlobPtr, b: BlobPtr) -> bool {
        match (self.blob(a), self.blob(b)) {
            (Some(a), Some(b)) => a.digest == b.digest,
            _ => false,
        }
    }

    fn blob_content(&self, blob: BlobPtr) -> Result<Vec<u8>, NativeError> {
        let blob = self.blob(blob).ok_or_else(|| invalid_object("blob"))?;
        Ok(blob.content.as_ref().clone())
    }

    fn blob_open_content_stream(&self, blob: BlobPtr) -> Result<ReadStreamPtr, NativeError> {
        let blob = self.blob(blob).ok_or_else(|| invalid_object("blob"))?;
        let stream = ReadState {
            content: blob.content.clone(),
            position: 0,
        };
        Ok(ReadStreamPtr::from_raw(
            self.insert(Object::ReadStream(Arc::new(Mutex::new(stream)))),
        ))
    }

    fn blob_release(&self, blob: BlobPtr) {
        self.remove(blob.raw(), "blob");
    }

    fn read_stream_read(&self, stream: ReadStreamPtr, max_length: usize) -> Result<Vec<u8>, NativeError> {
        let stream = self
            .read_stream(stream)
            .ok_or_else(|| invalid_object("blob read stream"))?;
        let mut stream = stream.lock();
        let start = stream.position.min(stream.content.len());
        let end = start.saturating_add(max_length).min(stream.content.len());
        stream.position = end;
        Ok(stream.content[start..end].to_vec())
    }

    fn read_stream_close(&self, stream: ReadStreamPtr) {
        self.remove(stream.raw(), "blob read stream");
    }

    fn write_stream_create(&self, db: DbPtr) -> Result<WriteStreamPtr, NativeError> {
        let (_, store) = self.open_store(db)?;
        let stream = WriteState {
            store,
            buffer: Vec::new(),
        };
        Ok(WriteStreamPtr::from_raw(
            self.insert(Object::WriteStream(Arc::new(Mutex::new(stream)))),
        ))
    }

    fn write_stream_write(&self, stream: WriteStreamPtr, data: &[u8]) -> Result<(), NativeError> {
        let stream = self
            .write_stream(stream)
            .ok_or_else(|| invalid_object("blob write stream"))?;
        stream.lock().buffer.extend_from_slice(data);
        Ok(())
    }

    fn write_stream_close(&self, stream: WriteStreamPtr) {
        self.remove(stream.raw(), "blob write stream");
    }

    fn document_set_blob(&self, doc: DocPtr, property: &str, blob: BlobPtr) -> Result<(), NativeError> {
        let blob = self.blob(blob).ok_or_else(|| invalid_object("blob"))?;
        let doc = self.document(doc).ok_or_else(|| invalid_object("document"))?;
        let mut doc = doc.lock();
        doc.check_mutable()?;
        doc.properties
            .insert(property.to_string(), NativeValue::Dict(blob.properties()));
        doc.attached.insert(blob.digest.clone(), blob.content.clone());
        Ok(())
    }

    fn document_is_blob(&self, doc: DocPtr, property: &str) -> bool {
        self.document(doc)
            .map(|d| d.lock().properties.get(property).is_some_and(is_blob))
            .unwrap_or(false)
    }

    fn document_get_blob(&self, doc: DocPtr, property: &str) -> Option<BlobPtr> {
        let doc = self.document(doc)?;
        let mut doc = doc.lock();
        let value = doc.properties.get(property).filter(|v| is_blob(v))?.as_dict()?;
        let digest = value.get("digest").and_then(NativeValue::as_str)?.to_string();
        let content_type = value
            .get("content_type")
            .and_then(NativeValue::as_str)
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string();
        let content = doc
            .attached
            .get(&digest)
            .cloned()
            .or_else(|| doc.store.as_ref().and_then(|s| s.blob(&digest)))?;
        let blob = self.new_blob(BlobState {
            content_type,
            digest,
            content,
        });
        doc.owned_blobs.push(blob.raw());
        Some(blob)
    }

    fn database_get_blob(&self, db: DbPtr, properties: &Dict) -> Result<Option<BlobPtr>, NativeError> {
        let (_, store) = self.open_store(db)?;
        let value = NativeValue::Dict(properties.clone());
        if !is_blob(&value) {
            return Err(NativeError::cbl(
                codes::INVALID_PARAMETER,
                "properties do not describe a blob",
            ));
        }
        let digest = properties
            .get("digest")
            .and_then(NativeValue::as_str)
            .unwrap_or_default()
            .to_string();
        let content_type = properties
            .get("content_type")
            .and_then(NativeValue::as_str)
            .unwrap_or(DEFAULT_CONTENT_TYPE);
        Ok(store.blob(&digest).map(|content| {
            self.new_blob(BlobState {
                content_type: content_type.to_string(),
                digest,
                content,
            })
        }))
    }

    fn database_save_blob(&self, db: DbPtr, blob: BlobPtr) -> Result<(), NativeError> {
        let (_, store) = self.open_store(db)?;
        let blob = self.blob(blob).ok_or_else(|| invalid_object("blob"))?;
        store.put_blob(blob.digest.clone(), blob.content.clone());
        Ok(())
    }

    fn replicator_create(&self, config: ReplicatorConfiguration) -> Result<ReplicatorPtr, NativeError> {
        let (local, _) = self.open_store(config.database)?;
        let target = target_for(&config.endpoint, &local, |raw| {
            self.database(DbPtr::from_raw(raw)).filter(|c| c.is_open())
        })?;
        let state = ReplicatorState::new(
            config,
            local,
            target,
            self.remotes.clone(),
            self.notifier.clone(),
        );
        let id = self.insert(Object::Replicator(Arc::new(state)));
        tracing::debug!(ptr = id, "replicator created");
        Ok(ReplicatorPtr::from_raw(id))
    }

    fn replicator_config(&self, replicator: ReplicatorPtr) -> ReplicatorSettings {
        match self.replicator(replicator) {
            Some(state) => state.config().settings(),
            None => ReplicatorConfiguration::new(
                DbPtr::from_raw(0),
                super::Endpoint::Url(String::new()),
            )
            .settings(),
        }
    }

    fn replicator_start(&self, replicator: ReplicatorPtr, reset_checkpoint: bool) {
        if let Some(state) = self.replicator(replicator) {
            state.start(format!("cbl-replicator-{}", replicator.raw()), reset_checkpoint);
        }
    }

    fn replicator_stop(&self, replicator: ReplicatorPtr) {
        if let Some(state) = self.replicator(replicator) {
            state.stop();
        }
    }

    fn replicator_set_host_reachable(&self, replicator: ReplicatorPtr, reachable: bool) {
        if let Some(state) = self.replicator(replicator) {
            state.set_host_reachable(reachable);
        }
    }

    fn replicator_set_suspended(&self, replicator: ReplicatorPtr, suspended: bool) {
        if let Some(state) = self.replicator(replicator) {
            state.set_suspended(suspended);
        }
    }

    fn replicator_status(&self, replicator: ReplicatorPtr) -> ReplicatorStatus {
        self.replicator(replicator)
            .map(|state| state.status())
            .unwrap_or_else(ReplicatorStatus::stopped)
    }

    fn replicator_pending_document_ids(&self, replicator: ReplicatorPtr) -> Result<Vec<String>, NativeError> {
        self.replicator(replicator)
            .ok_or_else(|| invalid_object("replicator"))?
            .pending_document_ids()
    }

    fn replicator_is_document_pending(&self, replicator: ReplicatorPtr, doc_id: &str) -> Result<bool, NativeError> {
        self.replicator(replicator)
            .ok_or_else(|| invalid_object("replicator"))?
            .is_document_pending(doc_id)
    }

    fn replicator_add_change_listener(
        &self,
        replicator: ReplicatorPtr,
        callback: ReplicatorChangeCallback,
    ) -> Option<ListenerToken> {
        let state = self.replicator(replicator)?;
        let token = self.add_listener(ListenerOwner::Replicator(state.clone()));
        state.add_status_listener(token, Arc::from(callback));
        Some(ListenerToken::from_raw(token))
    }

    fn replicator_add_document_listener(
        &self,
        replicator: ReplicatorPtr,
        callback: DocumentReplicationCallback,
    ) -> Option<ListenerToken> {
        let state = self.replicator(replicator)?;
        let token = self.add_listener(ListenerOwner::Replicator(state.clone()));
        state.add_document_listener(token, Arc::from(callback));
        Some(ListenerToken::from_raw(token))
    }

    fn replicator_release(&self, replicator: ReplicatorPtr) {
        if let Some(Object::Replicator(state)) = self.remove(replicator.raw(), "replicator") {
            state.stop();
        }
    }

    fn listener_remove(&self, token: ListenerToken) {
        let owner = self.listeners.lock().remove(&token.raw());
        let removed = match owner {
            Some(ListenerOwner::Store(store)) => store.remove_listener(token.raw()),
            Some(ListenerOwner::Query(query)) => query.remove_listener(token.raw()),
            Some(ListenerOwner::Replicator(state)) => state.remove_listener(token.raw()),
            None => false,
        };
        if !removed {
            tracing::trace!(token = token.raw(), "removal of unknown listener token ignored");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::engine::{Endpoint, ReplicatorActivity, ReplicatorType};

    fn open(engine: &MemoryEngine, name: &str) -> DbPtr {
        engine
            .database_open(name, &DatabaseConfiguration::default())
            .unwrap()
    }

    fn save(engine: &MemoryEngine, db: DbPtr, id: &str, json: &str) {
        let doc = engine.document_create(Some(id));
        engine.document_set_json(doc, json).unwrap();
        engine.document_save(db, doc).unwrap();
        engine.document_release(doc);
    }

    fn wait_for(mut done: impl FnMut() -> bool) -> bool {
        for _ in 0..500 {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn stores_outlive_connections() {
        let engine = MemoryEngine::with_default_directory("/data");
        let db = open(&engine, "mydb");
        save(&engine, db, "doc1", r#"{"version":3.0}"#);
        assert_eq!(engine.database_path(db), "/data/mydb.cblite2/");
        engine.database_close(db).unwrap();
        assert_eq!(
            engine.document_get(db, "doc1").unwrap_err().code,
            codes::NOT_OPEN
        );
        engine.database_release(db);

        let again = open(&engine, "mydb");
        let doc = engine.document_get(again, "doc1").unwrap().unwrap();
        assert_eq!(engine.document_to_json(doc), r#"{"version":3.0}"#);
        engine.document_release(doc);
        engine.database_release(again);
        assert_eq!(engine.stats().live_objects, 0);
    }

    #[test]
    fn missing_documents_are_not_errors() {
        let engine = MemoryEngine::new();
        let db = open(&engine, "db");
        assert_eq!(engine.document_get(db, "nope").unwrap(), None);
        assert_eq!(engine.document_get_mutable(db, "nope").unwrap(), None);
    }

    #[test]
    fn read_only_documents_reject_writes() {
        let engine = MemoryEngine::new();
        let db = open(&engine, "db");
        save(&engine, db, "a", r#"{"x":1}"#);
        let doc = engine.document_get(db, "a").unwrap().unwrap();
        let err = engine.document_set_json(doc, "{}").unwrap_err();
        assert_eq!(err.code, codes::NOT_WRITEABLE);
        assert_eq!(engine.document_save(db, doc).unwrap_err().code, codes::NOT_WRITEABLE);
    }

    #[test]
    fn double_release_is_counted() {
        let engine = MemoryEngine::new();
        let doc = engine.document_create(None);
        assert!(!engine.document_id(doc).is_empty());
        engine.document_release(doc);
        engine.document_release(doc);
        let stats = engine.stats();
        assert_eq!(stats.double_releases, 1);
        assert_eq!(stats.live_objects, 0);
        assert_eq!(engine.document_id(doc), "");
        assert_eq!(engine.stats().dangling_accesses, 1);
    }

    #[test]
    fn change_listeners_fire_after_commit_only() {
        let engine = MemoryEngine::new();
        let db = open(&engine, "db");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let token = engine
            .database_add_change_listener(db, Box::new(move |ids: &[String]| sink.lock().push(ids.to_vec())))
            .unwrap();

        engine.begin_transaction(db).unwrap();
        save(&engine, db, "a", "{}");
        save(&engine, db, "b", "{}");
        engine.flush_notifications();
        assert!(seen.lock().is_empty());
        engine.end_transaction(db, true).unwrap();
        engine.flush_notifications();
        assert_eq!(*seen.lock(), vec![vec!["a".to_string(), "b".to_string()]]);

        engine.listener_remove(token);
        save(&engine, db, "c", "{}");
        engine.flush_notifications();
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(engine.stats().live_listeners, 0);
    }

    #[test]
    fn blobs_are_content_addressed() {
        let engine = MemoryEngine::new();
        let db = open(&engine, "db");
        let a = engine.blob_create_with_data("text/plain", b"hello");
        let b = engine.blob_create_with_data("text/html", b"hello");
        assert!(engine.blob_equals(a, b));
        assert!(engine.blob_digest(a).starts_with("sha1-"));
        assert_eq!(engine.blob_length(a), 5);

        let doc = engine.document_create(Some("with-blob"));
        engine.document_set_blob(doc, "attachment", a).unwrap();
        engine.document_save(db, doc).unwrap();
        let props = engine.blob_properties(a);
        let found = engine.database_get_blob(db, &props).unwrap().unwrap();
        assert_eq!(engine.blob_content(found).unwrap(), b"hello");

        let stream = engine.blob_open_content_stream(found).unwrap();
        assert_eq!(engine.read_stream_read(stream, 3).unwrap(), b"hel");
        assert_eq!(engine.read_stream_read(stream, 3).unwrap(), b"lo");
        assert!(engine.read_stream_read(stream, 3).unwrap().is_empty());
        engine.read_stream_close(stream);

        let writer = engine.write_stream_create(db).unwrap();
        engine.write_stream_write(writer, b"stream").unwrap();
        let streamed = engine.blob_create_with_stream("text/plain", writer).unwrap();
        assert_eq!(engine.blob_content(streamed).unwrap(), b"stream");
        let streamed_props = engine.blob_properties(streamed);
        assert!(engine.database_get_blob(db, &streamed_props).unwrap().is_some());
    }

    #[test]
    fn one_shot_pull_copies_remote_documents() {
        let engine = MemoryEngine::new();
        engine
            .register_remote("ws://localhost:4984/remote", "remote", None)
            .unwrap();
        let remote = open(&engine, "remote");
        save(&engine, remote, "r1", r#"{"from":"remote"}"#);

        let local = open(&engine, "local");
        let mut config = ReplicatorConfiguration::new(
            local,
            Endpoint::Url("ws://localhost:4984/remote".to_string()),
        );
        config.replicator_type = ReplicatorType::Pull;
        let replicator = engine.replicator_create(config).unwrap();
        engine.replicator_start(replicator, false);

        assert!(wait_for(|| {
            let status = engine.replicator_status(replicator);
            status.activity == ReplicatorActivity::Stopped && status.progress.complete == 1.0
        }));
        assert!(engine.document_get(local, "r1").unwrap().is_some());
        assert!(engine.replicator_pending_document_ids(replicator).is_err());
        engine.replicator_release(replicator);
    }

    #[test]
    fn unknown_host_stops_with_network_error() {
        let engine = MemoryEngine::new();
        let local = open(&engine, "local");
        let config = ReplicatorConfiguration::new(
            local,
            Endpoint::Url("ws://nowhere.invalid/db".to_string()),
        );
        let replicator = engine.replicator_create(config).unwrap();
        assert_eq!(engine.replicator_pending_document_ids(replicator).unwrap(), Vec::<String>::new());
        engine.replicator_start(replicator, false);
        assert!(wait_for(|| engine.replicator_status(replicator).error.is_some()));
        let status = engine.replicator_status(replicator);
        assert_eq!(status.activity, ReplicatorActivity::Stopped);
        assert_eq!(status.error.unwrap().code, codes::NET_UNKNOWN_HOST);
    }
}
