//! Command handlers.
//!
//! Each handler resolves its handle arguments, checks the owning database's
//! open flag, makes one native call (or drains one result set) and converts
//! the result for the host. Handlers never retry and never block on the
//! host thread.
//!
//! The handlers are grouped by resource family in the sub-modules; they all
//! hang off [`Binding`].

mod blob;
mod database;
mod document;
mod query;
mod replicator;

use std::sync::Arc;

pub use replicator::{
    conflict_to_host, document_replication_to_host, filter_answer_from_host, filter_to_host,
    resolution_from_host, status_to_host, ConflictResolverFunction, FilterFunction,
    ReplicatorEndpoint, ReplicatorOptions,
};

use crate::config::BindingConfig;
use crate::engine::Engine;
use crate::error::{BindingError, BindingResult};
use crate::handle::{HandleId, HandleRegistry, Ownership, Resource};
use crate::value::HostValue;

/// Host-facing value of `CBLJSONLanguage`.
pub const JSON_LANGUAGE: u32 = 0;
/// Host-facing value of `CBLN1QLLanguage`.
pub const N1QL_LANGUAGE: u32 = 1;

/// The binding: a native engine plus the handles the host holds on it.
pub struct Binding {
    engine: Arc<dyn Engine>,
    handles: HandleRegistry,
    config: BindingConfig,
}

impl Binding {
    pub fn new(engine: Arc<dyn Engine>, config: BindingConfig) -> Self {
        Self {
            engine,
            handles: HandleRegistry::new(),
            config,
        }
    }

    pub fn config(&self) -> &BindingConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    /// Number of live handles.
    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }

    pub fn ownership(&self, id: HandleId) -> Option<Ownership> {
        self.handles.ownership(id)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Release a handle, whether explicitly or from a host finalizer.
    ///
    /// Returns `false` when the handle was already released. Borrowed handles
    /// only drop the host-side entry; owned handles release the native object
    /// as well.
    pub fn release_handle(&self, id: HandleId) -> bool {
        let Some(slot) = self.handles.release(id) else {
            return false;
        };
        if slot.ownership == Ownership::Borrowed {
            return true;
        }
        match slot.resource {
            Resource::Database(db) => {
                if db.is_open() {
                    db.mark_closed();
                    if let Err(e) = self.engine.database_close(db.ptr) {
                        tracing::warn!(handle = %id, error = %e, "closing database on release failed");
                    }
                }
                db.mark_released();
                self.engine.database_release(db.ptr);
            }
            Resource::Document(doc) => {
                doc.liveness.kill();
                self.engine.document_release(doc.ptr);
            }
            Resource::Query(query) => self.engine.query_release(query.ptr),
            Resource::Blob(blob) => self.engine.blob_release(blob.ptr),
            Resource::ReadStream(stream) => {
                if stream.take_open() {
                    self.engine.read_stream_close(stream.ptr);
                }
            }
            Resource::WriteStream(stream) => {
                if stream.take_open() {
                    self.engine.write_stream_close(stream.ptr);
                }
            }
            Resource::Replicator(replicator) => {
                for callback in &replicator.callbacks {
                    callback.stop();
                }
                self.engine.replicator_release(replicator.ptr);
            }
        }
        true
    }
}

/// Read a required string argument.
pub(crate) fn string_arg<'a>(value: &'a HostValue, name: &str) -> BindingResult<&'a str> {
    value.as_str().ok_or_else(|| {
        BindingError::invalid_argument(format!(
            "{} must be a string, got {}",
            name,
            value.type_name()
        ))
    })
}

/// Read a required handle argument.
pub(crate) fn handle_arg(value: &HostValue, name: &str) -> BindingResult<HandleId> {
    match value {
        HostValue::External(id) => Ok(*id),
        other => Err(BindingError::invalid_argument(format!(
            "{} must be a handle, got {}",
            name,
            other.type_name()
        ))),
    }
}
