//! Replicator worker threads.
//!
//! A replicator syncs its local store with a target store: either another
//! open database or a store registered under a `ws://` URL. Each start
//! spawns a worker thread that pulls then pushes every revision newer than
//! the checkpoint. Filters and the conflict resolver are called inline on
//! that thread, so a blocking host decision holds up only this replicator.
//!
//! Stopping only raises a flag; nothing ever joins a worker.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use super::store::{Connection, Store, StoredDoc};
use super::Notifier;
use crate::engine::{
    default_conflict_resolution, Conflict, DocumentFlags, Endpoint, FilterRequest,
    ReplicatedDocument, ReplicatorActivity, ReplicatorConfiguration, ReplicatorProgress,
    ReplicatorStatus,
};
use crate::error::{codes, ErrorDomain, NativeError};
use crate::value::{is_blob, Dict, NativeValue};

type StatusListener = Arc<dyn Fn(&ReplicatorStatus) + Send + Sync>;
type DocumentListener = Arc<dyn Fn(bool, &[ReplicatedDocument]) + Send + Sync>;

pub(super) type Remotes = Arc<Mutex<HashMap<String, Arc<Store>>>>;

const IDLE_POLL: Duration = Duration::from_millis(20);
const RETRY_BASE: Duration = Duration::from_millis(100);

/// Where the other side of the replication lives.
pub(super) enum Target {
    Url(String),
    Local(Arc<Connection>),
}

#[derive(Default)]
struct Checkpoint {
    local: HashMap<String, u64>,
    remote: HashMap<String, u64>,
}

pub(super) struct ReplicatorState {
    config: ReplicatorConfiguration,
    local: Arc<Connection>,
    target: Target,
    remotes: Remotes,
    notifier: Notifier,
    status: Mutex<ReplicatorStatus>,
    run: Mutex<Option<Arc<AtomicBool>>>,
    suspended: AtomicBool,
    reachable: AtomicBool,
    checkpoint: Mutex<Checkpoint>,
    status_listeners: Mutex<Vec<(u64, StatusListener)>>,
    document_listeners: Mutex<Vec<(u64, DocumentListener)>>,
}

/// Normalized form of a replication URL, used as the registry key.
pub(super) fn endpoint_key(url: &str) -> Result<String, NativeError> {
    let parsed = url::Url::parse(url).map_err(|e| {
        NativeError::network(codes::NET_INVALID_URL, format!("invalid URL '{}': {}", url, e))
    })?;
    match parsed.scheme() {
        "ws" | "wss" => Ok(parsed.as_str().trim_end_matches('/').to_string()),
        other => Err(NativeError::network(
            codes::NET_INVALID_URL,
            format!("unsupported URL scheme '{}'", other),
        )),
    }
}

impl ReplicatorState {
    pub fn new(
        config: ReplicatorConfiguration,
        local: Arc<Connection>,
        target: Target,
        remotes: Remotes,
        notifier: Notifier,
    ) -> Self {
        Self {
            config,
            local,
            target,
            remotes,
            notifier,
            status: Mutex::new(ReplicatorStatus::stopped()),
            run: Mutex::new(None),
            suspended: AtomicBool::new(false),
            reachable: AtomicBool::new(true),
            checkpoint: Mutex::new(Checkpoint::default()),
            status_listeners: Mutex::new(Vec::new()),
            document_listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &ReplicatorConfiguration {
        &self.config
    }

    pub fn status(&self) -> ReplicatorStatus {
        self.status.lock().clone()
    }

    pub fn add_status_listener(&self, token: u64, callback: StatusListener) {
        self.status_listeners.lock().push((token, callback));
    }

    pub fn add_document_listener(&self, token: u64, callback: DocumentListener) {
        self.document_listeners.lock().push((token, callback));
    }

    pub fn remove_listener(&self, token: u64) -> bool {
        let mut status = self.status_listeners.lock();
        let mut documents = self.document_listeners.lock();
        let before = status.len() + documents.len();
        status.retain(|(t, _)| *t != token);
        documents.retain(|(t, _)| *t != token);
        before != status.len() + documents.len()
    }

    pub fn set_suspended(&self, suspended: bool) {
        self.suspended.store(suspended, Ordering::Release);
    }

    pub fn set_host_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::Release);
    }

    /// Spawn a worker unless one is already running.
    pub fn start(self: &Arc<Self>, name: String, reset_checkpoint: bool) {
        let mut run = self.run.lock();
        if run.as_ref().is_some_and(|stop| !stop.load(Ordering::Acquire)) {
            tracing::debug!(replicator = %name, "start ignored, already running");
            return;
        }
        if reset_checkpoint {
            *self.checkpoint.lock() = Checkpoint::default();
        }
        let stop = Arc::new(AtomicBool::new(false));
        *run = Some(stop.clone());
        drop(run);

        let state = self.clone();
        let spawned = thread::Builder::new()
            .name(name.clone())
            .spawn(move || state.work(stop));
        if let Err(e) = spawned {
            tracing::error!(replicator = %name, error = %e, "failed to spawn replicator worker");
            self.set_status(
                ReplicatorActivity::Stopped,
                None,
                Some(NativeError::new(ErrorDomain::Posix, 11, e.to_string())),
            );
        }
    }

    /// Ask the running worker to stop. Returns immediately.
    pub fn stop(&self) {
        if let Some(stop) = self.run.lock().take() {
            stop.store(true, Ordering::Release);
        }
    }

    pub fn pending_document_ids(&self) -> Result<Vec<String>, NativeError> {
        if !self.config.replicator_type.pushes() {
            return Err(NativeError::cbl(
                codes::UNSUPPORTED,
                "pending documents are only tracked for push replication",
            ));
        }
        let store = self.local.check_open()?;
        let checkpoint = self.checkpoint.lock();
        Ok(store
            .revisions()
            .into_iter()
            .filter(|(id, rev)| self.wanted(id) && rev.sequence > synced(&checkpoint.local, id))
            .map(|(id, _)| id)
            .collect())
    }

    pub fn is_document_pending(&self, doc_id: &str) -> Result<bool, NativeError> {
        Ok(self.pending_document_ids()?.iter().any(|id| id == doc_id))
    }

    fn wanted(&self, id: &str) -> bool {
        match &self.config.document_ids {
            Some(ids) => ids.iter().any(|d| d == id),
            None => true,
        }
    }

    fn set_status(
        &self,
        activity: ReplicatorActivity,
        progress: Option<ReplicatorProgress>,
        error: Option<NativeError>,
    ) {
        let status = {
            let mut status = self.status.lock();
            status.activity = activity;
            if let Some(progress) = progress {
                status.progress = progress;
            }
            status.error = error;
            status.clone()
        };
        tracing::trace!(activity = activity.as_str(), complete = status.progress.complete, "replicator status");
        let listeners: Vec<StatusListener> =
            self.status_listeners.lock().iter().map(|(_, cb)| cb.clone()).collect();
        for listener in listeners {
            listener(&status);
        }
    }

    fn emit_documents(&self, is_push: bool, documents: &[ReplicatedDocument]) {
        if documents.is_empty() {
            return;
        }
        let listeners: Vec<DocumentListener> =
            self.document_listeners.lock().iter().map(|(_, cb)| cb.clone()).collect();
        for listener in listeners {
            listener(is_push, documents);
        }
    }

    fn resolve_target(&self) -> Result<Arc<Store>, NativeError> {
        match &self.target {
            Target::Local(connection) => connection.check_open().cloned(),
            Target::Url(url) => self.remotes.lock().get(url).cloned().ok_or_else(|| {
                NativeError::network(codes::NET_UNKNOWN_HOST, format!("unknown host for {}", url))
            }),
        }
    }

    fn attempts_allowed(&self) -> u32 {
        match self.config.max_attempts {
            0 if self.config.continuous => u32::MAX,
            0 => 1,
            n => n,
        }
    }

    fn retry_wait(&self, attempt: u32) -> Duration {
        let cap = match self.config.max_attempt_wait_time {
            0 => Duration::from_secs(1),
            secs => Duration::from_secs(secs as u64),
        };
        (RETRY_BASE * attempt.min(10)).min(cap)
    }

    fn work(self: Arc<Self>, stop: Arc<AtomicBool>) {
        tracing::debug!(continuous = self.config.continuous, "replicator worker started");
        self.set_status(
            ReplicatorActivity::Connecting,
            Some(ReplicatorProgress {
                complete: 0.0,
                document_count: 0,
            }),
            None,
        );

        let mut attempt = 0u32;
        loop {
            if stop.load(Ordering::Acquire) {
                break;
            }
            if self.suspended.load(Ordering::Acquire) || !self.reachable.load(Ordering::Acquire) {
                if self.status().activity != ReplicatorActivity::Offline {
                    self.set_status(ReplicatorActivity::Offline, None, None);
                }
                sleep_unless_stopped(&stop, IDLE_POLL);
                continue;
            }

            let target = match self.resolve_target() {
                Ok(target) => target,
                Err(e) => {
                    attempt += 1;
                    tracing::debug!(attempt, error = %e, "replicator could not reach target");
                    if attempt >= self.attempts_allowed() {
                        self.set_status(ReplicatorActivity::Stopped, None, Some(e));
                        self.finish(&stop);
                        return;
                    }
                    self.set_status(ReplicatorActivity::Offline, None, Some(e));
                    sleep_unless_stopped(&stop, self.retry_wait(attempt));
                    continue;
                }
            };
            attempt = 0;

            if let Err(e) = self.sync_once(&target, &stop) {
                self.set_status(ReplicatorActivity::Stopped, None, Some(e));
                self.finish(&stop);
                return;
            }
            if stop.load(Ordering::Acquire) {
                break;
            }

            let done = ReplicatorProgress {
                complete: 1.0,
                document_count: self.status().progress.document_count,
            };
            if !self.config.continuous {
                self.set_status(ReplicatorActivity::Stopped, Some(done), None);
                self.finish(&stop);
                return;
            }
            self.set_status(ReplicatorActivity::Idle, Some(done), None);

            let marks = (self.local.store.sequence(), target.sequence());
            while !stop.load(Ordering::Acquire)
                && !self.suspended.load(Ordering::Acquire)
                && self.reachable.load(Ordering::Acquire)
                && (self.local.store.sequence(), target.sequence()) == marks
            {
                thread::sleep(IDLE_POLL);
            }
        }

        self.set_status(ReplicatorActivity::Stopped, None, None);
        tracing::debug!("replicator worker stopped");
    }

    /// Clear the run slot if it still belongs to this worker.
    fn finish(&self, stop: &Arc<AtomicBool>) {
        let mut run = self.run.lock();
        if run.as_ref().is_some_and(|current| Arc::ptr_eq(current, stop)) {
            *run = None;
        }
    }

    fn sync_once(&self, target: &Arc<Store>, stop: &AtomicBool) -> Result<(), NativeError> {
        let local = self.local.check_open()?.clone();
        let kind = self.config.replicator_type;

        let (pulls, pushes_estimate) = {
            let checkpoint = self.checkpoint.lock();
            let pulls: Vec<(String, StoredDoc)> = if kind.pulls() {
                target
                    .revisions()
                    .into_iter()
                    .filter(|(id, rev)| self.wanted(id) && rev.sequence > synced(&checkpoint.remote, id))
                    .collect()
            } else {
                Vec::new()
            };
            let pushes = if kind.pushes() {
                local
                    .revisions()
                    .iter()
                    .filter(|(id, rev)| self.wanted(id) && rev.sequence > synced(&checkpoint.local, id))
                    .count()
            } else {
                0
            };
            (pulls, pushes)
        };

        let total = (pulls.len() + pushes_estimate).max(1);
        let mut processed = 0usize;
        let mut count = self.status().progress.document_count;
        self.set_status(
            ReplicatorActivity::Busy,
            Some(progress(processed, total, count)),
            None,
        );

        let mut pulled = Vec::new();
        for (id, remote_rev) in pulls {
            if stop.load(Ordering::Acquire) {
                return Ok(());
            }
            if let Some(doc) = self.pull_one(&local, target, &id, remote_rev) {
                pulled.push(doc);
                count += 1;
            }
            processed += 1;
            self.set_status(ReplicatorActivity::Busy, Some(progress(processed, total, count)), None);
        }
        self.emit_documents(false, &pulled);

        if kind.pushes() {
            let pushes: Vec<(String, StoredDoc)> = {
                let checkpoint = self.checkpoint.lock();
                local
                    .revisions()
                    .into_iter()
                    .filter(|(id, rev)| self.wanted(id) && rev.sequence > synced(&checkpoint.local, id))
                    .collect()
            };
            let mut pushed = Vec::new();
            for (id, local_rev) in pushes {
                if stop.load(Ordering::Acquire) {
                    return Ok(());
                }
                if let Some(doc) = self.push_one(&local, target, &id, local_rev) {
                    pushed.push(doc);
                    count += 1;
                }
                processed += 1;
                self.set_status(
                    ReplicatorActivity::Busy,
                    Some(progress(processed, total.max(processed), count)),
                    None,
                );
            }
            self.emit_documents(true, &pushed);
        }
        Ok(())
    }

    fn pull_one(
        &self,
        local: &Arc<Store>,
        target: &Arc<Store>,
        id: &str,
        remote_rev: StoredDoc,
    ) -> Option<ReplicatedDocument> {
        let flags = DocumentFlags {
            deleted: remote_rev.deleted,
            access_removed: false,
        };
        if let Some(filter) = &self.config.pull_filter {
            let request = FilterRequest {
                document_id: id.to_string(),
                properties: remote_rev.properties.clone(),
                flags,
            };
            if !filter(&request) {
                tracing::trace!(doc = id, "pull filter rejected revision");
                self.checkpoint.lock().remote.insert(id.to_string(), remote_rev.sequence);
                return None;
            }
        }

        let local_rev = local.revision(id);
        let local_changed = {
            let checkpoint = self.checkpoint.lock();
            local_rev
                .as_ref()
                .is_some_and(|rev| rev.sequence > synced(&checkpoint.local, id))
        };
        let remote_body = body(&remote_rev);

        let (resolved, conflicted) = match &local_rev {
            Some(rev) if local_changed && body(rev) != remote_body => {
                let conflict = Conflict {
                    document_id: id.to_string(),
                    local: body(rev),
                    remote: remote_body.clone(),
                };
                let resolution = match &self.config.conflict_resolver {
                    Some(resolver) => resolver(&conflict),
                    None => default_conflict_resolution(&conflict),
                };
                tracing::debug!(doc = id, "resolved replication conflict");
                (resolution, true)
            }
            _ => (remote_body.clone(), false),
        };

        if resolved.is_none() && local_rev.as_ref().map_or(true, |rev| rev.deleted) {
            // Nothing to delete locally.
            self.checkpoint.lock().remote.insert(id.to_string(), remote_rev.sequence);
            return Some(ReplicatedDocument {
                id: id.to_string(),
                flags,
                error: None,
            });
        }

        let blobs = resolved
            .as_ref()
            .map(|props| collect_blobs(props, target))
            .unwrap_or_default();
        let merged = conflicted && resolved != remote_body;
        let deleted = resolved.is_none();
        let (sequence, announce) = local.put(id, resolved, blobs);
        self.notifier.announce(local, announce);

        let mut checkpoint = self.checkpoint.lock();
        checkpoint.remote.insert(id.to_string(), remote_rev.sequence);
        if !merged {
            checkpoint.local.insert(id.to_string(), sequence);
        }
        Some(ReplicatedDocument {
            id: id.to_string(),
            flags: DocumentFlags {
                deleted,
                access_removed: false,
            },
            error: None,
        })
    }

    fn push_one(
        &self,
        local: &Arc<Store>,
        target: &Arc<Store>,
        id: &str,
        local_rev: StoredDoc,
    ) -> Option<ReplicatedDocument> {
        let flags = DocumentFlags {
            deleted: local_rev.deleted,
            access_removed: false,
        };
        if let Some(filter) = &self.config.push_filter {
            let request = FilterRequest {
                document_id: id.to_string(),
                properties: local_rev.properties.clone(),
                flags,
            };
            if !filter(&request) {
                tracing::trace!(doc = id, "push filter rejected revision");
                self.checkpoint.lock().local.insert(id.to_string(), local_rev.sequence);
                return None;
            }
        }

        let remote_live = target.contains_live(id);
        let mut checkpoint = self.checkpoint.lock();
        checkpoint.local.insert(id.to_string(), local_rev.sequence);
        if local_rev.deleted && !remote_live {
            return Some(ReplicatedDocument {
                id: id.to_string(),
                flags,
                error: None,
            });
        }
        drop(checkpoint);

        let content = body(&local_rev);
        let blobs = content
            .as_ref()
            .map(|props| collect_blobs(props, local))
            .unwrap_or_default();
        let (sequence, announce) = target.put(id, content, blobs);
        self.notifier.announce(target, announce);
        self.checkpoint.lock().remote.insert(id.to_string(), sequence);
        Some(ReplicatedDocument {
            id: id.to_string(),
            flags,
            error: None,
        })
    }
}

fn synced(marks: &HashMap<String, u64>, id: &str) -> u64 {
    marks.get(id).copied().unwrap_or(0)
}

fn body(rev: &StoredDoc) -> Option<Dict> {
    if rev.deleted {
        None
    } else {
        Some(rev.properties.clone())
    }
}

fn progress(processed: usize, total: usize, count: u64) -> ReplicatorProgress {
    ReplicatorProgress {
        complete: (processed as f32 / total.max(1) as f32).clamp(0.0, 1.0),
        document_count: count,
    }
}

/// Blob contents referenced anywhere in `props`, copied from `from`.
fn collect_blobs(props: &Dict, from: &Store) -> Vec<(String, Arc<Vec<u8>>)> {
    fn walk(value: &NativeValue, from: &Store, seen: &mut HashSet<String>, out: &mut Vec<(String, Arc<Vec<u8>>)>) {
        if is_blob(value) {
            if let Some(digest) = value.as_dict().and_then(|d| d.get("digest")).and_then(NativeValue::as_str) {
                if seen.insert(digest.to_string()) {
                    if let Some(content) = from.blob(digest) {
                        out.push((digest.to_string(), content));
                    }
                }
            }
            return;
        }
        match value {
            NativeValue::Dict(d) => d.values().for_each(|v| walk(v, from, seen, out)),
            NativeValue::Array(items) => items.iter().for_each(|v| walk(v, from, seen, out)),
            _ => {}
        }
    }
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for value in props.values() {
        walk(value, from, &mut seen, &mut out);
    }
    out
}

fn sleep_unless_stopped(stop: &AtomicBool, total: Duration) {
    let mut waited = Duration::ZERO;
    while waited < total && !stop.load(Ordering::Acquire) {
        let slice = IDLE_POLL.min(total - waited);
        thread::sleep(slice);
        waited += slice;
    }
}

/// Resolve a configured endpoint against the local connection.
pub(super) fn target_for(
    endpoint: &Endpoint,
    local: &Arc<Connection>,
    lookup: impl Fn(u64) -> Option<Arc<Connection>>,
) -> Result<Target, NativeError> {
    match endpoint {
        Endpoint::Url(url) => Ok(Target::Url(endpoint_key(url)?)),
        Endpoint::LocalDatabase(db) => {
            let other = lookup(db.raw()).ok_or_else(|| {
                NativeError::cbl(codes::INVALID_PARAMETER, "endpoint database is not open")
            })?;
            if Arc::ptr_eq(&other.store, &local.store) {
                return Err(NativeError::cbl(
                    codes::INVALID_PARAMETER,
                    "cannot replicate a database with itself",
                ));
            }
            Ok(Target::Local(other))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_urls_must_be_websocket() {
        assert_eq!(endpoint_key("ws://localhost:4984/db/").unwrap(), "ws://localhost:4984/db");
        assert!(endpoint_key("wss://example.com/db").is_ok());

        let err = endpoint_key("http://example.com/db").unwrap_err();
        assert_eq!(err.domain, ErrorDomain::Network);
        assert_eq!(err.code, codes::NET_INVALID_URL);
        assert!(endpoint_key("not a url").is_err());
    }

    #[test]
    fn progress_stays_in_range() {
        assert_eq!(progress(0, 0, 0).complete, 0.0);
        assert_eq!(progress(3, 2, 3).complete, 1.0);
        assert!((progress(1, 4, 1).complete - 0.25).abs() < f32::EPSILON);
    }
}
