//! Document stores shared by every connection to the same database.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::query::QueryState;
use crate::error::{codes, NativeError};
use crate::value::Dict;

pub(super) type DatabaseListener = Arc<dyn Fn(&[String]) + Send + Sync>;
pub(super) type DocumentListener = Arc<dyn Fn(&str) + Send + Sync>;

/// One revision of a document as stored. Deletions leave a tombstone so the
/// replicator can propagate them.
#[derive(Debug, Clone, PartialEq)]
pub(super) struct StoredDoc {
    pub properties: Dict,
    pub sequence: u64,
    pub deleted: bool,
}

#[derive(Clone)]
struct Transaction {
    owner: u64,
    docs: BTreeMap<String, StoredDoc>,
    sequence: u64,
    changed: Vec<String>,
}

#[derive(Default)]
struct StoreState {
    docs: BTreeMap<String, StoredDoc>,
    blobs: HashMap<String, Arc<Vec<u8>>>,
    sequence: u64,
    transaction: Option<Transaction>,
}

#[derive(Default)]
struct StoreListeners {
    database: Vec<(u64, DatabaseListener)>,
    document: Vec<(u64, String, DocumentListener)>,
    queries: Vec<Weak<QueryState>>,
}

pub(super) struct Store {
    pub name: String,
    pub directory: String,
    state: Mutex<StoreState>,
    listeners: Mutex<StoreListeners>,
    connections: AtomicUsize,
}

impl Store {
    pub fn new(name: &str, directory: &str) -> Self {
        Self {
            name: name.to_string(),
            directory: directory.to_string(),
            state: Mutex::new(StoreState::default()),
            listeners: Mutex::new(StoreListeners::default()),
            connections: AtomicUsize::new(0),
        }
    }

    pub fn path(&self) -> String {
        format!("{}/{}.cblite2/", self.directory.trim_end_matches('/'), self.name)
    }

    pub fn connect(&self) {
        self.connections.fetch_add(1, Ordering::AcqRel);
    }

    pub fn disconnect(&self) {
        self.connections.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }

    pub fn sequence(&self) -> u64 {
        self.state.lock().sequence
    }

    pub fn get(&self, id: &str) -> Option<StoredDoc> {
        self.state
            .lock()
            .docs
            .get(id)
            .filter(|doc| !doc.deleted)
            .cloned()
    }

    /// The latest revision, tombstones included.
    pub fn revision(&self, id: &str) -> Option<StoredDoc> {
        self.state.lock().docs.get(id).cloned()
    }

    /// Every document including tombstones, in id order.
    pub fn revisions(&self) -> Vec<(String, StoredDoc)> {
        self.state
            .lock()
            .docs
            .iter()
            .map(|(id, doc)| (id.clone(), doc.clone()))
            .collect()
    }

    pub fn live_documents(&self) -> Vec<(String, Dict)> {
        self.state
            .lock()
            .docs
            .iter()
            .filter(|(_, doc)| !doc.deleted)
            .map(|(id, doc)| (id.clone(), doc.properties.clone()))
            .collect()
    }

    pub fn count(&self) -> u64 {
        self.state.lock().docs.values().filter(|d| !d.deleted).count() as u64
    }

    /// Write a revision; `None` deletes. Returns the new sequence and the ids
    /// to announce now, which is nothing while a transaction is open.
    pub fn put(
        &self,
        id: &str,
        properties: Option<Dict>,
        blobs: Vec<(String, Arc<Vec<u8>>)>,
    ) -> (u64, Vec<String>) {
        let mut state = self.state.lock();
        state.sequence += 1;
        let sequence = state.sequence;
        let deleted = properties.is_none();
        state.docs.insert(
            id.to_string(),
            StoredDoc {
                properties: properties.unwrap_or_default(),
                sequence,
                deleted,
            },
        );
        for (digest, content) in blobs {
            state.blobs.insert(digest, content);
        }
        match state.transaction.as_mut() {
            Some(txn) => {
                if !txn.changed.iter().any(|c| c == id) {
                    txn.changed.push(id.to_string());
                }
                (sequence, Vec::new())
            }
            None => (sequence, vec![id.to_string()]),
        }
    }

    pub fn contains_live(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn blob(&self, digest: &str) -> Option<Arc<Vec<u8>>> {
        self.state.lock().blobs.get(digest).cloned()
    }

    pub fn put_blob(&self, digest: String, content: Arc<Vec<u8>>) {
        self.state.lock().blobs.insert(digest, content);
    }

    pub fn begin(&self, owner: u64) -> Result<(), NativeError> {
        let mut state = self.state.lock();
        match &state.transaction {
            Some(txn) if txn.owner == owner => Err(NativeError::cbl(
                codes::TRANSACTION_NOT_CLOSED,
                "a transaction is already open on this database",
            )),
            Some(_) => Err(NativeError::cbl(
                codes::BUSY,
                "another connection holds a transaction",
            )),
            None => {
                state.transaction = Some(Transaction {
                    owner,
                    docs: state.docs.clone(),
                    sequence: state.sequence,
                    changed: Vec::new(),
                });
                Ok(())
            }
        }
    }

    /// Close the transaction. Returns the ids to announce after a commit.
    pub fn end(&self, owner: u64, commit: bool) -> Result<Vec<String>, NativeError> {
        let mut state = self.state.lock();
        let txn = match state.transaction.take() {
            Some(txn) if txn.owner == owner => txn,
            other => {
                state.transaction = other;
                return Err(NativeError::cbl(
                    codes::NOT_IN_TRANSACTION,
                    "no transaction is open on this database",
                ));
            }
        };
        if commit {
            Ok(txn.changed)
        } else {
            state.docs = txn.docs;
            state.sequence = txn.sequence;
            Ok(Vec::new())
        }
    }

    pub fn in_transaction(&self, owner: u64) -> bool {
        matches!(&self.state.lock().transaction, Some(txn) if txn.owner == owner)
    }

    pub fn add_database_listener(&self, token: u64, callback: DatabaseListener) {
        self.listeners.lock().database.push((token, callback));
    }

    pub fn add_document_listener(&self, token: u64, doc_id: &str, callback: DocumentListener) {
        self.listeners
            .lock()
            .document
            .push((token, doc_id.to_string(), callback));
    }

    pub fn watch_query(&self, query: &Arc<QueryState>) {
        let mut listeners = self.listeners.lock();
        listeners.queries.retain(|q| q.strong_count() > 0);
        if !listeners
            .queries
            .iter()
            .any(|q| std::ptr::eq(q.as_ptr(), Arc::as_ptr(query)))
        {
            listeners.queries.push(Arc::downgrade(query));
        }
    }

    pub fn remove_listener(&self, token: u64) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.database.len() + listeners.document.len();
        listeners.database.retain(|(t, _)| *t != token);
        listeners.document.retain(|(t, _, _)| *t != token);
        before != listeners.database.len() + listeners.document.len()
    }

    /// Announce changed ids to every listener. Runs on the notification
    /// thread with no store lock held while callbacks run.
    pub fn announce(&self, ids: &[String]) {
        if ids.is_empty() {
            return;
        }
        let (database, document, queries) = {
            let listeners = self.listeners.lock();
            (
                listeners.database.clone(),
                listeners.document.clone(),
                listeners.queries.clone(),
            )
        };
        for (_, callback) in &database {
            callback(ids);
        }
        for (_, doc_id, callback) in &document {
            if ids.iter().any(|id| id == doc_id) {
                callback(doc_id);
            }
        }
        for query in queries.iter().filter_map(Weak::upgrade) {
            query.refresh();
        }
    }
}

/// One open connection to a store.
pub(super) struct Connection {
    pub id: u64,
    pub store: Arc<Store>,
    open: AtomicBool,
}

impl Connection {
    pub fn new(id: u64, store: Arc<Store>) -> Self {
        store.connect();
        Self {
            id,
            store,
            open: AtomicBool::new(true),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn check_open(&self) -> Result<&Arc<Store>, NativeError> {
        if self.is_open() {
            Ok(&self.store)
        } else {
            Err(NativeError::cbl(codes::NOT_OPEN, "database is not open"))
        }
    }

    /// Returns `false` if it was already closed.
    pub fn close(&self) -> Result<bool, NativeError> {
        if self.store.in_transaction(self.id) {
            return Err(NativeError::cbl(
                codes::TRANSACTION_NOT_CLOSED,
                "cannot close a database with an open transaction",
            ));
        }
        if self.open.swap(false, Ordering::AcqRel) {
            self.store.disconnect();
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.open.swap(false, Ordering::AcqRel) {
            self.store.disconnect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::NativeValue;

    fn props(n: i64) -> Dict {
        Dict::from([("n".to_string(), NativeValue::Int(n))])
    }

    #[test]
    fn writes_bump_the_sequence_and_tombstones_hide_documents() {
        let store = Store::new("db", "/tmp");
        let (s1, announce) = store.put("a", Some(props(1)), Vec::new());
        assert_eq!(announce, vec!["a".to_string()]);
        let (s2, _) = store.put("a", None, Vec::new());
        assert!(s2 > s1);
        assert!(store.get("a").is_none());
        assert_eq!(store.count(), 0);
        assert_eq!(store.revisions().len(), 1);
    }

    #[test]
    fn aborted_transaction_restores_the_snapshot() {
        let store = Store::new("db", "/tmp");
        store.put("a", Some(props(1)), Vec::new());
        store.begin(1).unwrap();
        let (_, announce) = store.put("a", Some(props(2)), Vec::new());
        assert!(announce.is_empty());
        assert_eq!(store.end(1, false).unwrap(), Vec::<String>::new());
        assert_eq!(store.get("a").unwrap().properties, props(1));
    }

    #[test]
    fn nested_begin_is_rejected() {
        let store = Store::new("db", "/tmp");
        store.begin(1).unwrap();
        assert_eq!(store.begin(1).unwrap_err().code, codes::TRANSACTION_NOT_CLOSED);
        assert_eq!(store.begin(2).unwrap_err().code, codes::BUSY);
        assert_eq!(store.end(2, true).unwrap_err().code, codes::NOT_IN_TRANSACTION);
        store.put("x", Some(props(1)), Vec::new());
        assert_eq!(store.end(1, true).unwrap(), vec!["x".to_string()]);
    }

    #[test]
    fn closing_with_open_transaction_fails() {
        let store = Arc::new(Store::new("db", "/tmp"));
        let conn = Connection::new(7, store.clone());
        store.begin(7).unwrap();
        assert!(conn.close().is_err());
        store.end(7, true).unwrap();
        assert!(conn.close().unwrap());
        assert!(!conn.close().unwrap());
        assert_eq!(store.connections(), 0);
    }
}
