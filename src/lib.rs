//! Node.js bindings for Couchbase Lite.
//!
//! The native library is reached through the [`engine::Engine`] trait; every
//! host-callable operation lives on [`binding::Binding`]. The `node` feature
//! exports those operations to JavaScript via NAPI-RS.
//!
//! Native callbacks arrive on native threads and are forwarded to the host's
//! single callback thread by the listener bridge in [`listener`].

#![deny(clippy::all)]

pub mod binding;
pub mod config;
pub mod engine;
pub mod error;
pub mod handle;
pub mod host;
pub mod listener;
pub mod value;

#[cfg(feature = "node")]
mod node;

pub use binding::{Binding, ReplicatorOptions};
pub use config::BindingConfig;
pub use engine::memory::MemoryEngine;
pub use engine::Engine;
pub use error::{BindingError, BindingResult, NativeError};
pub use handle::HandleId;
pub use host::{HostFunction, HostLoop};
pub use listener::{ListenerKind, ListenerRegistration};
pub use value::{HostValue, NativeValue};
