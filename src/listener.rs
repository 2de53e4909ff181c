//! Cross-thread listener bridge.
//!
//! The native library reports changes by calling back on its own threads.
//! Host callbacks may only run on the host thread. A registration ties the
//! two together:
//!
//! ```text
//! native thread ──deliver(payload)──▶ Dispatch ──▶ HostFunction queue ──▶ host callback
//! native thread ──request(payload)──▶ Exchange ──▶ HostFunction queue ──▶ host callback
//!        ▲                                                                     │
//!        └──────────────────────── rendezvous reply ◀─────────────────────────┘
//! ```
//!
//! Notifications are fire-and-forget. Conflict resolvers and replication
//! filters are blocking: the native thread waits for the host's answer.
//!
//! A registration goes `Registered -> Stopped` exactly once. Stopping removes
//! the native listener token and aborts the host function; anything still
//! queued for the host thread is discarded rather than delivered.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;
use serde::Serialize;

use crate::engine::{Engine, ListenerToken};
use crate::error::{BindingError, BindingResult};
use crate::host::{HostFunction, Request};

/// The notification sources a host can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ListenerKind {
    DatabaseChange,
    DocumentChange,
    QueryChange,
    ReplicatorChange,
    DocumentReplication,
    ConflictResolver,
    PullFilter,
    PushFilter,
}

impl ListenerKind {
    /// Whether the native caller waits for the host callback's answer.
    pub fn is_blocking(self) -> bool {
        matches!(
            self,
            ListenerKind::ConflictResolver | ListenerKind::PullFilter | ListenerKind::PushFilter
        )
    }

    /// Async resource name reported to the host runtime.
    pub fn resource_name(self) -> &'static str {
        match self {
            ListenerKind::DatabaseChange => "couchbase-lite database change listener",
            ListenerKind::DocumentChange => "couchbase-lite document change listener",
            ListenerKind::QueryChange => "couchbase-lite query change listener",
            ListenerKind::ReplicatorChange => "couchbase-lite replicator change listener",
            ListenerKind::DocumentReplication => "couchbase-lite document replication listener",
            ListenerKind::ConflictResolver => "couchbase-lite conflict resolver",
            ListenerKind::PullFilter => "couchbase-lite pull filter",
            ListenerKind::PushFilter => "couchbase-lite push filter",
        }
    }

    /// Name of the host function that stops the listener.
    pub fn stop_name(self) -> &'static str {
        match self {
            ListenerKind::DatabaseChange => "stopDatabaseChangeListener",
            ListenerKind::DocumentChange => "stopDocumentChangeListener",
            ListenerKind::QueryChange => "stopQueryChangeListener",
            ListenerKind::ReplicatorChange => "stopReplicatorChangeListener",
            ListenerKind::DocumentReplication => "stopDocumentReplicationListener",
            ListenerKind::ConflictResolver => "stopConflictResolver",
            ListenerKind::PullFilter => "stopPullFilter",
            ListenerKind::PushFilter => "stopPushFilter",
        }
    }
}

impl fmt::Display for ListenerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ListenerKind::DatabaseChange => "database change",
            ListenerKind::DocumentChange => "document change",
            ListenerKind::QueryChange => "query change",
            ListenerKind::ReplicatorChange => "replicator change",
            ListenerKind::DocumentReplication => "document replication",
            ListenerKind::ConflictResolver => "conflict resolver",
            ListenerKind::PullFilter => "pull filter",
            ListenerKind::PushFilter => "push filter",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Registered,
    Stopped,
}

/// Fire-and-forget path from a native thread to one host callback.
pub struct Dispatch<P> {
    kind: ListenerKind,
    function: Arc<dyn HostFunction<P>>,
}

impl<P> Clone for Dispatch<P> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            function: self.function.clone(),
        }
    }
}

impl<P: Send + 'static> Dispatch<P> {
    pub fn new(kind: ListenerKind, function: Arc<dyn HostFunction<P>>) -> Self {
        Self { kind, function }
    }

    /// Queue `payload` for the host callback. Never waits for the host.
    ///
    /// Returns `false` if the listener was already stopped; the payload is
    /// dropped in that case.
    pub fn deliver(&self, payload: P) -> bool {
        // Hold our own reference for the duration of the enqueue so a
        // concurrent stop cannot tear the function down underneath us.
        let function = self.function.clone();
        match function.call(payload) {
            Ok(()) => true,
            Err(e) => {
                tracing::trace!(kind = %self.kind, error = %e, "delivery dropped");
                false
            }
        }
    }

    pub fn kind(&self) -> ListenerKind {
        self.kind
    }
}

/// Blocking round trip from a native thread to one host callback.
pub struct Exchange<P, R> {
    kind: ListenerKind,
    function: Arc<dyn HostFunction<Request<P, R>>>,
    poll: Duration,
}

impl<P, R> Clone for Exchange<P, R> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            function: self.function.clone(),
            poll: self.poll,
        }
    }
}

impl<P: Send + 'static, R: Send + 'static> Exchange<P, R> {
    pub fn new(
        kind: ListenerKind,
        function: Arc<dyn HostFunction<Request<P, R>>>,
        poll: Duration,
    ) -> Self {
        Self {
            kind,
            function,
            poll,
        }
    }

    /// Ask the host callback and wait for its answer.
    ///
    /// Returns `None` when the listener is stopped before answering, so a
    /// native thread is never left waiting on a dead dispatch.
    pub fn request(&self, payload: P) -> Option<R> {
        let function = self.function.clone();
        let (tx, rx) = crossbeam_channel::bounded(1);
        if let Err(e) = function.call(Request::new(payload, tx)) {
            tracing::trace!(kind = %self.kind, error = %e, "request dropped");
            return None;
        }
        loop {
            match rx.recv_timeout(self.poll) {
                Ok(answer) => return Some(answer),
                Err(RecvTimeoutError::Timeout) if function.is_aborted() => {
                    tracing::debug!(kind = %self.kind, "request abandoned after abort");
                    return None;
                }
                Err(RecvTimeoutError::Timeout) => continue,
                // Request was discarded unanswered.
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    pub fn kind(&self) -> ListenerKind {
        self.kind
    }
}

/// One live subscription: the native token, the host function and the
/// liveness flag that makes `stop` effective exactly once.
pub struct ListenerRegistration {
    kind: ListenerKind,
    token: Option<ListenerToken>,
    engine: Option<Arc<dyn Engine>>,
    abort: Box<dyn Fn() + Send + Sync>,
    live: AtomicBool,
}

impl ListenerRegistration {
    /// Register a host function with the native library.
    ///
    /// `attach` receives the dispatch and performs the native registration.
    /// If it yields no token the function is aborted and an error returned;
    /// nothing is left registered on either side.
    pub fn register<P, F>(
        kind: ListenerKind,
        function: Arc<dyn HostFunction<P>>,
        engine: Arc<dyn Engine>,
        attach: F,
    ) -> BindingResult<Self>
    where
        P: Send + 'static,
        F: FnOnce(Dispatch<P>) -> Option<ListenerToken>,
    {
        function.unref();
        let dispatch = Dispatch::new(kind, function.clone());
        match attach(dispatch) {
            Some(token) => {
                tracing::debug!(%kind, ?token, "listener registered");
                Ok(Self {
                    kind,
                    token: Some(token),
                    engine: Some(engine),
                    abort: Box::new(move || function.abort()),
                    live: AtomicBool::new(true),
                })
            }
            None => {
                function.abort();
                tracing::warn!(%kind, "native listener registration failed");
                Err(BindingError::ListenerRegistration { kind })
            }
        }
    }

    /// Track a host function installed without a native token (conflict
    /// resolvers and filters live as long as their replicator).
    pub fn callback<P>(kind: ListenerKind, function: Arc<dyn HostFunction<P>>) -> Self
    where
        P: Send + 'static,
    {
        function.unref();
        Self {
            kind,
            token: None,
            engine: None,
            abort: Box::new(move || function.abort()),
            live: AtomicBool::new(true),
        }
    }

    /// Stop the listener. Returns `true` only for the call that stopped it.
    pub fn stop(&self) -> bool {
        if !self.live.swap(false, Ordering::AcqRel) {
            return false;
        }
        if let (Some(engine), Some(token)) = (&self.engine, self.token) {
            engine.listener_remove(token);
        }
        (self.abort)();
        tracing::debug!(kind = %self.kind, "listener stopped");
        true
    }

    pub fn state(&self) -> ListenerState {
        if self.live.load(Ordering::Acquire) {
            ListenerState::Registered
        } else {
            ListenerState::Stopped
        }
    }

    pub fn kind(&self) -> ListenerKind {
        self.kind
    }

    pub fn token(&self) -> Option<ListenerToken> {
        self.token
    }
}

impl fmt::Debug for ListenerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistration")
            .field("kind", &self.kind)
            .field("token", &self.token)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::memory::MemoryEngine;
    use crate::host::HostLoop;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicU64;
    use std::thread;

    fn engine() -> Arc<dyn Engine> {
        Arc::new(MemoryEngine::new())
    }

    #[test]
    fn stop_is_idempotent() {
        let host = HostLoop::new();
        let function: Arc<dyn HostFunction<u32>> = host.function(|_: u32| {});
        let engine = engine();
        let registration = ListenerRegistration::register(
            ListenerKind::DatabaseChange,
            function.clone(),
            engine,
            |_dispatch| Some(ListenerToken::from_raw(7)),
        )
        .unwrap();

        assert_eq!(registration.state(), ListenerState::Registered);
        assert!(registration.stop());
        assert!(!registration.stop());
        assert_eq!(registration.state(), ListenerState::Stopped);
        assert!(function.is_aborted());
    }

    #[test]
    fn failed_registration_aborts_the_function() {
        let host = HostLoop::new();
        let function: Arc<dyn HostFunction<u32>> = host.function(|_: u32| {});
        let err = ListenerRegistration::register(
            ListenerKind::QueryChange,
            function.clone(),
            engine(),
            |_dispatch| None,
        )
        .unwrap_err();

        assert_eq!(
            err,
            BindingError::ListenerRegistration {
                kind: ListenerKind::QueryChange
            }
        );
        assert!(function.is_aborted());
        assert!(!host.keeps_alive());
    }

    #[test]
    fn registration_does_not_keep_host_alive() {
        let host = HostLoop::new();
        let function: Arc<dyn HostFunction<u32>> = host.function(|_: u32| {});
        let _registration = ListenerRegistration::register(
            ListenerKind::DocumentChange,
            function,
            engine(),
            |_dispatch| Some(ListenerToken::from_raw(1)),
        )
        .unwrap();
        assert!(!host.keeps_alive());
    }

    #[test]
    fn delivery_after_stop_is_dropped() {
        let host = HostLoop::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let function: Arc<dyn HostFunction<u32>> = host.function(move |n: u32| sink.lock().push(n));

        let slot: Arc<Mutex<Option<Dispatch<u32>>>> = Arc::new(Mutex::new(None));
        let keep = slot.clone();
        let registration = ListenerRegistration::register(
            ListenerKind::DatabaseChange,
            function,
            engine(),
            move |dispatch| {
                *keep.lock() = Some(dispatch);
                Some(ListenerToken::from_raw(3))
            },
        )
        .unwrap();

        let dispatch = slot.lock().clone().unwrap();
        assert!(dispatch.deliver(1));
        // queued but not yet run when stop happens
        assert!(dispatch.deliver(2));
        registration.stop();
        assert!(!dispatch.deliver(3));

        host.run_pending();
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn per_listener_order_matches_emission_order() {
        let host = HostLoop::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let function: Arc<dyn HostFunction<u64>> = host.function(move |n: u64| sink.lock().push(n));
        let dispatch = Dispatch::new(ListenerKind::DatabaseChange, function);

        // Emission order is the order in which the sequence number is taken
        // together with the enqueue.
        let emit_lock = Arc::new(Mutex::new(()));
        let sequence = Arc::new(AtomicU64::new(0));
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let dispatch = dispatch.clone();
                let emit_lock = emit_lock.clone();
                let sequence = sequence.clone();
                thread::spawn(move || {
                    for _ in 0..50 {
                        let _guard = emit_lock.lock();
                        let n = sequence.fetch_add(1, Ordering::SeqCst);
                        dispatch.deliver(n);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        host.run_pending();
        let seen = seen.lock();
        assert_eq!(seen.len(), 200);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn exchange_blocks_until_host_answers() {
        let host = HostLoop::new();
        let function: Arc<dyn HostFunction<Request<String, bool>>> =
            host.exchange(|id: String| id.starts_with("keep"));
        let exchange = Exchange::new(ListenerKind::PushFilter, function, Duration::from_millis(10));

        let native = {
            let exchange = exchange.clone();
            thread::spawn(move || {
                let a = exchange.request("keep-1".to_string());
                let b = exchange.request("drop-1".to_string());
                (a, b)
            })
        };

        assert!(host.run_until(Duration::from_secs(5), || native.is_finished()));
        assert_eq!(native.join().unwrap(), (Some(true), Some(false)));
    }

    #[test]
    fn exchange_gives_up_after_abort() {
        let host = HostLoop::new();
        let function: Arc<dyn HostFunction<Request<u32, u32>>> = host.exchange(|_: u32| 1u32);
        let exchange = Exchange::new(
            ListenerKind::ConflictResolver,
            function.clone(),
            Duration::from_millis(5),
        );

        let native = thread::spawn(move || exchange.request(1));
        // never pump the loop; abort instead
        while host.queued() == 0 {
            thread::yield_now();
        }
        function.abort();
        assert_eq!(native.join().unwrap(), None);
        host.run_pending();
    }
}
