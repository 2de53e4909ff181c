//! The native document-database library, seen through its C-style API.
//!
//! Every native object is an opaque `Copy` pointer newtype. Functions that
//! create objects hand ownership to the caller, who must call the matching
//! `*_release`. Listener registration takes a boxed callback that the
//! library invokes on its own threads; data passed to a callback is only
//! borrowed for the duration of the call.

pub mod memory;

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::error::NativeError;
use crate::value::Dict;

macro_rules! native_ptr {
    ($($(#[$doc:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$doc])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(u64);

            impl $name {
                pub fn from_raw(raw: u64) -> Self {
                    $name(raw)
                }

                pub fn raw(self) -> u64 {
                    self.0
                }
            }
        )*
    };
}

native_ptr!(
    /// `CBLDatabase*`
    DbPtr,
    /// `CBLDocument*`, mutable or not.
    DocPtr,
    /// `CBLQuery*`
    QueryPtr,
    /// `CBLBlob*`
    BlobPtr,
    /// `CBLBlobReadStream*`
    ReadStreamPtr,
    /// `CBLBlobWriteStream*`
    WriteStreamPtr,
    /// `CBLReplicator*`
    ReplicatorPtr,
    /// `CBLListenerToken*`
    ListenerToken,
);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatabaseConfiguration {
    pub directory: Option<String>,
}

/// Query language selector, with the native enum values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum QueryLanguage {
    Json = 0,
    N1ql = 1,
}

impl QueryLanguage {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(QueryLanguage::Json),
            1 => Some(QueryLanguage::N1ql),
            _ => None,
        }
    }
}

/// Cursor over query results. Dropping it releases the native result set.
pub trait ResultSet: Iterator<Item = Dict> + Send {}

impl<T: Iterator<Item = Dict> + Send> ResultSet for T {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ReplicatorType {
    PushAndPull,
    Push,
    Pull,
}

impl ReplicatorType {
    pub fn as_str(self) -> &'static str {
        match self {
            ReplicatorType::PushAndPull => "pushAndPull",
            ReplicatorType::Push => "push",
            ReplicatorType::Pull => "pull",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pushAndPull" => Some(ReplicatorType::PushAndPull),
            "push" => Some(ReplicatorType::Push),
            "pull" => Some(ReplicatorType::Pull),
            _ => None,
        }
    }

    pub fn pushes(self) -> bool {
        matches!(self, ReplicatorType::PushAndPull | ReplicatorType::Push)
    }

    pub fn pulls(self) -> bool {
        matches!(self, ReplicatorType::PushAndPull | ReplicatorType::Pull)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Url(String),
    LocalDatabase(DbPtr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentFlags {
    pub deleted: bool,
    pub access_removed: bool,
}

/// Two revisions of one document that the replicator could not merge.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    pub document_id: String,
    /// `None` when the local revision is a deletion.
    pub local: Option<Dict>,
    /// `None` when the remote revision is a deletion.
    pub remote: Option<Dict>,
}

/// Winning properties of a resolved conflict; `None` deletes the document.
pub type Resolution = Option<Dict>;

/// The library's built-in resolution: the remote revision wins.
pub fn default_conflict_resolution(conflict: &Conflict) -> Resolution {
    conflict.remote.clone()
}

/// A revision about to be pushed or pulled.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterRequest {
    pub document_id: String,
    pub properties: Dict,
    pub flags: DocumentFlags,
}

pub type ConflictResolverCallback = Arc<dyn Fn(&Conflict) -> Resolution + Send + Sync>;
pub type FilterCallback = Arc<dyn Fn(&FilterRequest) -> bool + Send + Sync>;

pub type DatabaseChangeCallback = Box<dyn Fn(&[String]) + Send + Sync>;
pub type DocumentChangeCallback = Box<dyn Fn(&str) + Send + Sync>;
pub type QueryChangeCallback = Box<dyn Fn(&[Dict]) + Send + Sync>;
pub type ReplicatorChangeCallback = Box<dyn Fn(&ReplicatorStatus) + Send + Sync>;
pub type DocumentReplicationCallback = Box<dyn Fn(bool, &[ReplicatedDocument]) + Send + Sync>;

#[derive(Clone)]
pub struct ReplicatorConfiguration {
    pub database: DbPtr,
    pub endpoint: Endpoint,
    pub replicator_type: ReplicatorType,
    pub continuous: bool,
    pub disable_auto_purge: bool,
    pub max_attempts: u32,
    pub max_attempt_wait_time: u32,
    pub heartbeat: u32,
    pub document_ids: Option<Vec<String>>,
    pub conflict_resolver: Option<ConflictResolverCallback>,
    pub pull_filter: Option<FilterCallback>,
    pub push_filter: Option<FilterCallback>,
}

impl ReplicatorConfiguration {
    pub fn new(database: DbPtr, endpoint: Endpoint) -> Self {
        Self {
            database,
            endpoint,
            replicator_type: ReplicatorType::PushAndPull,
            continuous: false,
            disable_auto_purge: false,
            max_attempts: 0,
            max_attempt_wait_time: 0,
            heartbeat: 0,
            document_ids: None,
            conflict_resolver: None,
            pull_filter: None,
            push_filter: None,
        }
    }

    /// The plain settings, without callbacks.
    pub fn settings(&self) -> ReplicatorSettings {
        ReplicatorSettings {
            database: self.database,
            endpoint: self.endpoint.clone(),
            replicator_type: self.replicator_type,
            continuous: self.continuous,
            disable_auto_purge: self.disable_auto_purge,
            max_attempts: self.max_attempts,
            max_attempt_wait_time: self.max_attempt_wait_time,
            heartbeat: self.heartbeat,
            document_ids: self.document_ids.clone(),
        }
    }
}

impl fmt::Debug for ReplicatorConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicatorConfiguration")
            .field("settings", &self.settings())
            .field("conflict_resolver", &self.conflict_resolver.is_some())
            .field("pull_filter", &self.pull_filter.is_some())
            .field("push_filter", &self.push_filter.is_some())
            .finish()
    }
}

/// A replicator's configuration as reported back by the library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicatorSettings {
    pub database: DbPtr,
    pub endpoint: Endpoint,
    pub replicator_type: ReplicatorType,
    pub continuous: bool,
    pub disable_auto_purge: bool,
    pub max_attempts: u32,
    pub max_attempt_wait_time: u32,
    pub heartbeat: u32,
    pub document_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicatorActivity {
    Stopped,
    Offline,
    Connecting,
    Idle,
    Busy,
}

impl ReplicatorActivity {
    pub fn as_str(self) -> &'static str {
        match self {
            ReplicatorActivity::Stopped => "stopped",
            ReplicatorActivity::Offline => "offline",
            ReplicatorActivity::Connecting => "connecting",
            ReplicatorActivity::Idle => "idle",
            ReplicatorActivity::Busy => "busy",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicatorProgress {
    /// Fraction complete, 0.0 to 1.0.
    pub complete: f32,
    pub document_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplicatorStatus {
    pub activity: ReplicatorActivity,
    pub progress: ReplicatorProgress,
    pub error: Option<NativeError>,
}

impl ReplicatorStatus {
    pub fn stopped() -> Self {
        Self {
            activity: ReplicatorActivity::Stopped,
            progress: ReplicatorProgress {
                complete: 0.0,
                document_count: 0,
            },
            error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplicatedDocument {
    pub id: String,
    pub flags: DocumentFlags,
    pub error: Option<NativeError>,
}

/// One batch of documents the replicator finished with.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentReplication {
    pub is_push: bool,
    pub documents: Vec<ReplicatedDocument>,
}

/// The native library's API.
///
/// Functions returning `Result<Option<_>, _>` report "not found" as
/// `Ok(None)`, which the binding passes to the host as `null`.
pub trait Engine: Send + Sync {
    // Database

    fn database_open(&self, name: &str, config: &DatabaseConfiguration) -> Result<DbPtr, NativeError>;
    fn database_close(&self, db: DbPtr) -> Result<(), NativeError>;
    /// Close and delete the database's files.
    fn database_delete(&self, db: DbPtr) -> Result<(), NativeError>;
    /// Delete a database that is not open. `Ok(false)` if it did not exist.
    fn delete_database_named(&self, name: &str, directory: Option<&str>) -> Result<bool, NativeError>;
    fn database_release(&self, db: DbPtr);
    fn database_name(&self, db: DbPtr) -> String;
    fn database_path(&self, db: DbPtr) -> String;
    fn database_count(&self, db: DbPtr) -> u64;
    fn begin_transaction(&self, db: DbPtr) -> Result<(), NativeError>;
    fn end_transaction(&self, db: DbPtr, commit: bool) -> Result<(), NativeError>;
    fn database_add_change_listener(
        &self,
        db: DbPtr,
        callback: DatabaseChangeCallback,
    ) -> Option<ListenerToken>;
    fn database_add_document_listener(
        &self,
        db: DbPtr,
        doc_id: &str,
        callback: DocumentChangeCallback,
    ) -> Option<ListenerToken>;

    // Documents

    fn document_get(&self, db: DbPtr, id: &str) -> Result<Option<DocPtr>, NativeError>;
    fn document_get_mutable(&self, db: DbPtr, id: &str) -> Result<Option<DocPtr>, NativeError>;
    /// Create a new mutable document; a random id is generated when `id` is
    /// `None`.
    fn document_create(&self, id: Option<&str>) -> DocPtr;
    fn document_save(&self, db: DbPtr, doc: DocPtr) -> Result<(), NativeError>;
    fn document_delete(&self, db: DbPtr, doc: DocPtr) -> Result<(), NativeError>;
    fn document_id(&self, doc: DocPtr) -> String;
    fn document_properties(&self, doc: DocPtr) -> Dict;
    fn document_set_properties(&self, doc: DocPtr, properties: Dict) -> Result<(), NativeError>;
    fn document_to_json(&self, doc: DocPtr) -> String;
    fn document_set_json(&self, doc: DocPtr, json: &str) -> Result<(), NativeError>;
    fn document_release(&self, doc: DocPtr);

    // Queries

    fn query_create(
        &self,
        db: DbPtr,
        language: QueryLanguage,
        text: &str,
    ) -> Result<QueryPtr, NativeError>;
    fn query_execute(&self, query: QueryPtr) -> Result<Box<dyn ResultSet>, NativeError>;
    fn query_explain(&self, query: QueryPtr) -> String;
    fn query_parameters(&self, query: QueryPtr) -> Dict;
    fn query_set_parameters(&self, query: QueryPtr, parameters: Dict);
    fn query_add_change_listener(
        &self,
        query: QueryPtr,
        callback: QueryChangeCallback,
    ) -> Option<ListenerToken>;
    fn query_release(&self, query: QueryPtr);

    // Blobs

    fn blob_create_with_data(&self, content_type: &str, data: &[u8]) -> BlobPtr;
    /// Create a blob from a write stream, consuming the stream.
    fn blob_create_with_stream(&self, content_type: &str, stream: WriteStreamPtr) -> Result<BlobPtr, NativeError>;
    fn blob_length(&self, blob: BlobPtr) -> u64;
    fn blob_digest(&self, blob: BlobPtr) -> String;
    fn blob_content_type(&self, blob: BlobPtr) -> String;
    fn blob_properties(&self, blob: BlobPtr) -> Dict;
    fn blob_to_json(&self, blob: BlobPtr) -> String;
    fn blob_equals(&self, a: BlobPtr, b: BlobPtr) -> bool;
    fn blob_content(&self, blob: BlobPtr) -> Result<Vec<u8>, NativeError>;
    fn blob_open_content_stream(&self, blob: BlobPtr) -> Result<ReadStreamPtr, NativeError>;
    fn blob_release(&self, blob: BlobPtr);
    fn read_stream_read(&self, stream: ReadStreamPtr, max_length: usize) -> Result<Vec<u8>, NativeError>;
    fn read_stream_close(&self, stream: ReadStreamPtr);
    fn write_stream_create(&self, db: DbPtr) -> Result<WriteStreamPtr, NativeError>;
    fn write_stream_write(&self, stream: WriteStreamPtr, data: &[u8]) -> Result<(), NativeError>;
    fn write_stream_close(&self, stream: WriteStreamPtr);
    fn document_set_blob(&self, doc: DocPtr, property: &str, blob: BlobPtr) -> Result<(), NativeError>;
    fn document_is_blob(&self, doc: DocPtr, property: &str) -> bool;
    /// The blob stored under `property`, owned by the document.
    fn document_get_blob(&self, doc: DocPtr, property: &str) -> Option<BlobPtr>;
    fn database_get_blob(&self, db: DbPtr, properties: &Dict) -> Result<Option<BlobPtr>, NativeError>;
    fn database_save_blob(&self, db: DbPtr, blob: BlobPtr) -> Result<(), NativeError>;

    // Replicator

    fn replicator_create(&self, config: ReplicatorConfiguration) -> Result<ReplicatorPtr, NativeError>;
    fn replicator_config(&self, replicator: ReplicatorPtr) -> ReplicatorSettings;
    fn replicator_start(&self, replicator: ReplicatorPtr, reset_checkpoint: bool);
    fn replicator_stop(&self, replicator: ReplicatorPtr);
    fn replicator_set_host_reachable(&self, replicator: ReplicatorPtr, reachable: bool);
    fn replicator_set_suspended(&self, replicator: ReplicatorPtr, suspended: bool);
    fn replicator_status(&self, replicator: ReplicatorPtr) -> ReplicatorStatus;
    fn replicator_pending_document_ids(&self, replicator: ReplicatorPtr) -> Result<Vec<String>, NativeError>;
    fn replicator_is_document_pending(&self, replicator: ReplicatorPtr, doc_id: &str) -> Result<bool, NativeError>;
    fn replicator_add_change_listener(
        &self,
        replicator: ReplicatorPtr,
        callback: ReplicatorChangeCallback,
    ) -> Option<ListenerToken>;
    fn replicator_add_document_listener(
        &self,
        replicator: ReplicatorPtr,
        callback: DocumentReplicationCallback,
    ) -> Option<ListenerToken>;
    fn replicator_release(&self, replicator: ReplicatorPtr);

    // Listeners

    /// Remove any kind of listener. Unknown tokens are ignored.
    fn listener_remove(&self, token: ListenerToken);
}
