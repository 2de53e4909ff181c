//! The host side of cross-thread dispatch.
//!
//! A host runtime runs callbacks on one thread only. Native threads reach it
//! through a [`HostFunction`]: an object bound to one host callback that can
//! be called from any thread and queues the payload for the host thread.
//!
//! [`HostLoop`] is a self-contained host runtime: one FIFO job queue drained
//! by whichever thread owns the loop. The Node.js build supplies its own
//! `HostFunction` on top of N-API thread-safe functions.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use thiserror::Error;

/// Why a payload could not be queued for the host thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("dispatch has been aborted")]
    Aborted,
    #[error("host runtime is gone")]
    Closing,
}

/// A host callback callable from any thread.
pub trait HostFunction<P>: Send + Sync {
    /// Queue `payload` for the host thread without waiting for it to run.
    fn call(&self, payload: P) -> Result<(), DispatchError>;

    /// Stop accepting calls and discard anything still queued.
    fn abort(&self);

    fn is_aborted(&self) -> bool;

    /// Stop this function from keeping the host runtime alive.
    fn unref(&self);
}

/// A payload whose host callback must answer before the native caller
/// continues.
pub struct Request<P, R> {
    pub payload: P,
    reply: Sender<R>,
}

impl<P, R> Request<P, R> {
    pub(crate) fn new(payload: P, reply: Sender<R>) -> Self {
        Self { payload, reply }
    }

    /// Hand the answer back to the waiting native thread.
    pub fn respond(self, answer: R) {
        // The waiter may have given up after an abort.
        let _ = self.reply.send(answer);
    }

    pub fn into_parts(self) -> (P, Responder<R>) {
        (self.payload, Responder { reply: self.reply })
    }
}

impl<P: fmt::Debug, R> fmt::Debug for Request<P, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request").field("payload", &self.payload).finish()
    }
}

/// The reply half of a [`Request`].
pub struct Responder<R> {
    reply: Sender<R>,
}

impl<R> Responder<R> {
    pub fn respond(self, answer: R) {
        let _ = self.reply.send(answer);
    }
}

type Job = Box<dyn FnOnce() + Send>;

/// A single-threaded host runtime.
///
/// Jobs from every function share one FIFO queue, so each function sees its
/// payloads in the order they were queued.
pub struct HostLoop {
    tx: Sender<Job>,
    rx: Receiver<Job>,
    refs: Arc<AtomicUsize>,
}

impl Default for HostLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HostLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostLoop")
            .field("queued", &self.rx.len())
            .field("refs", &self.refs.load(Ordering::Relaxed))
            .finish()
    }
}

impl HostLoop {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            tx,
            rx,
            refs: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Bind a callback to a new function.
    pub fn function<P, F>(&self, callback: F) -> Arc<LoopFunction<P>>
    where
        P: Send + 'static,
        F: FnMut(P) + Send + 'static,
    {
        self.refs.fetch_add(1, Ordering::AcqRel);
        Arc::new(LoopFunction {
            callback: Arc::new(Mutex::new(Box::new(callback))),
            tx: self.tx.clone(),
            aborted: Arc::new(AtomicBool::new(false)),
            refed: AtomicBool::new(true),
            refs: self.refs.clone(),
        })
    }

    /// Bind a callback that answers [`Request`]s.
    pub fn exchange<P, R, F>(&self, mut callback: F) -> Arc<LoopFunction<Request<P, R>>>
    where
        P: Send + 'static,
        R: Send + 'static,
        F: FnMut(P) -> R + Send + 'static,
    {
        self.function(move |request: Request<P, R>| {
            let (payload, responder) = request.into_parts();
            responder.respond(callback(payload));
        })
    }

    /// Run every job queued so far. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while let Ok(job) = self.rx.try_recv() {
            job();
            ran += 1;
        }
        ran
    }

    /// Run jobs as they arrive until `done` holds or `timeout` elapses.
    /// Returns whether `done` was reached.
    pub fn run_until<F>(&self, timeout: Duration, mut done: F) -> bool
    where
        F: FnMut() -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            self.run_pending();
            if done() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            match self.rx.recv_timeout(deadline - now) {
                Ok(job) => job(),
                Err(RecvTimeoutError::Timeout) => return done(),
                Err(RecvTimeoutError::Disconnected) => return done(),
            }
        }
    }

    /// Number of jobs waiting to run.
    pub fn queued(&self) -> usize {
        self.rx.len()
    }

    /// Whether some function still keeps the runtime alive.
    pub fn keeps_alive(&self) -> bool {
        self.refs.load(Ordering::Acquire) > 0
    }
}

type Callback<P> = Arc<Mutex<Box<dyn FnMut(P) + Send>>>;

/// A [`HostFunction`] bound to a [`HostLoop`].
pub struct LoopFunction<P> {
    callback: Callback<P>,
    tx: Sender<Job>,
    aborted: Arc<AtomicBool>,
    refed: AtomicBool,
    refs: Arc<AtomicUsize>,
}

impl<P> LoopFunction<P> {
    fn drop_ref(&self) {
        if self.refed.swap(false, Ordering::AcqRel) {
            self.refs.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl<P> fmt::Debug for LoopFunction<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopFunction")
            .field("aborted", &self.aborted.load(Ordering::Relaxed))
            .field("refed", &self.refed.load(Ordering::Relaxed))
            .finish()
    }
}

impl<P: Send + 'static> HostFunction<P> for LoopFunction<P> {
    fn call(&self, payload: P) -> Result<(), DispatchError> {
        if self.aborted.load(Ordering::Acquire) {
            return Err(DispatchError::Aborted);
        }
        let callback = self.callback.clone();
        let aborted = self.aborted.clone();
        let job: Job = Box::new(move || {
            // Aborted after queueing: discard without running.
            if aborted.load(Ordering::Acquire) {
                tracing::trace!("discarding delivery queued before abort");
                return;
            }
            let mut callback = callback.lock();
            (*callback)(payload);
        });
        self.tx.send(job).map_err(|_| DispatchError::Closing)
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
        self.drop_ref();
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    fn unref(&self) {
        self.drop_ref();
    }
}

impl<P> Drop for LoopFunction<P> {
    fn drop(&mut self) {
        self.drop_ref();
    }
}
