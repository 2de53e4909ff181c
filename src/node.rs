//! Node.js bindings for Couchbase Lite.
//!
//! This module exposes [`Binding`] to Node.js via NAPI-RS. Native resources
//! cross into JavaScript as `External` values whose finalizer releases the
//! handle; listener callbacks run through thread-safe functions.

use std::sync::{Arc, OnceLock};

use napi::bindgen_prelude::Buffer;
use napi::threadsafe_function::{
    ErrorStrategy, ThreadSafeCallContext, ThreadsafeFunction, ThreadsafeFunctionCallMode,
};
use napi::{
    Env, JsBigInt, JsBuffer, JsExternal, JsFunction, JsObject, JsString, JsUnknown, Status,
    ValueType,
};
use napi_derive::napi;
use parking_lot::Mutex;

use crate::binding::{
    conflict_to_host, document_replication_to_host, filter_answer_from_host, filter_to_host,
    resolution_from_host, status_to_host, JSON_LANGUAGE, N1QL_LANGUAGE,
};
use crate::config::{self, BindingConfig};
use crate::engine::memory::MemoryEngine;
use crate::engine::{Conflict, DocumentReplication, FilterRequest, ReplicatorStatus};
use crate::host::{DispatchError, HostFunction, Request};
use crate::{Binding, BindingError, HandleId, HostValue, ListenerRegistration, ReplicatorOptions};

struct Runtime {
    engine: Arc<MemoryEngine>,
    binding: Binding,
}

impl Runtime {
    fn new(config: BindingConfig) -> Self {
        let engine = Arc::new(match &config.default_directory {
            Some(dir) => MemoryEngine::with_default_directory(dir.clone()),
            None => MemoryEngine::new(),
        });
        let binding = Binding::new(engine.clone(), config);
        Self { engine, binding }
    }
}

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

fn runtime() -> &'static Runtime {
    RUNTIME.get_or_init(|| Runtime::new(BindingConfig::default()))
}

fn binding() -> &'static Binding {
    &runtime().binding
}

/// Convert a binding error to a napi Error.
fn to_napi_err(e: BindingError) -> napi::Error {
    let status = if e.is_type_error() {
        Status::InvalidArg
    } else {
        Status::GenericFailure
    };
    napi::Error::new(status, format!("[{}] {}", e.code(), e))
}

// =============================================================================
// Handles
// =============================================================================

/// Payload of every handle `External`. Dropped by the finalizer.
struct HandleRef {
    id: HandleId,
}

impl Drop for HandleRef {
    fn drop(&mut self) {
        if let Some(runtime) = RUNTIME.get() {
            runtime.binding.release_handle(self.id);
        }
    }
}

fn wrap_handle(env: &Env, id: HandleId) -> napi::Result<JsExternal> {
    env.create_external(HandleRef { id }, None)
}

fn handle(env: &Env, external: &JsExternal) -> napi::Result<HandleId> {
    env.get_value_external::<HandleRef>(external)
        .map(|h| h.id)
        .map_err(|_| to_napi_err(BindingError::invalid_argument("expected a Couchbase Lite handle")))
}

fn maybe_handle(env: &Env, id: Option<HandleId>) -> napi::Result<Option<JsExternal>> {
    id.map(|id| wrap_handle(env, id)).transpose()
}

// =============================================================================
// Value conversion
// =============================================================================

/// Convert a JavaScript value to a host value.
///
/// Without an `env` handles cannot be recognised and read as `undefined`.
fn js_to_host(env: Option<&Env>, value: JsUnknown) -> napi::Result<HostValue> {
    Ok(match value.get_type()? {
        ValueType::Undefined => HostValue::Undefined,
        ValueType::Null => HostValue::Null,
        ValueType::Boolean => HostValue::Bool(value.coerce_to_bool()?.get_value()?),
        ValueType::Number => HostValue::Number(value.coerce_to_number()?.get_double()?),
        ValueType::String => {
            HostValue::String(value.coerce_to_string()?.into_utf8()?.into_owned()?)
        }
        ValueType::BigInt => bigint_to_host(unsafe { value.cast::<JsBigInt>() })?,
        ValueType::Function => HostValue::Function,
        ValueType::Symbol => HostValue::Symbol,
        ValueType::External => match env {
            Some(env) => {
                let external = unsafe { value.cast::<JsExternal>() };
                match env.get_value_external::<HandleRef>(&external) {
                    Ok(h) => HostValue::External(h.id),
                    Err(_) => HostValue::Undefined,
                }
            }
            None => HostValue::Undefined,
        },
        ValueType::Object => object_to_host(env, value)?,
        _ => HostValue::Undefined,
    })
}

fn bigint_to_host(big: JsBigInt) -> napi::Result<HostValue> {
    let (signed, lossless) = big.get_i64()?;
    if lossless {
        return Ok(HostValue::BigInt(i128::from(signed)));
    }
    let (unsigned, lossless) = big.get_u64()?;
    if lossless {
        return Ok(HostValue::BigInt(i128::from(unsigned)));
    }
    // Outside 64 bits: not representable natively.
    Ok(HostValue::Undefined)
}

fn object_to_host(env: Option<&Env>, value: JsUnknown) -> napi::Result<HostValue> {
    if value.is_buffer()? {
        let buffer = unsafe { value.cast::<JsBuffer>() }.into_value()?;
        return Ok(HostValue::Buffer(buffer.to_vec()));
    }
    let object: JsObject = unsafe { value.cast() };
    if object.is_array()? {
        let len = object.get_array_length()?;
        let mut items = Vec::with_capacity(len as usize);
        for i in 0..len {
            items.push(js_to_host(env, object.get_element::<JsUnknown>(i)?)?);
        }
        return Ok(HostValue::Array(items));
    }
    let names = object.get_property_names()?;
    let len = names.get_array_length()?;
    let mut entries = Vec::with_capacity(len as usize);
    for i in 0..len {
        let key = names.get_element::<JsString>(i)?.into_utf8()?.into_owned()?;
        let item = object.get_named_property_unchecked::<JsUnknown>(&key)?;
        entries.push((key, js_to_host(env, item)?));
    }
    Ok(HostValue::Object(entries))
}

/// Convert a host value to a JavaScript value.
fn host_to_js(env: &Env, value: &HostValue) -> napi::Result<JsUnknown> {
    Ok(match value {
        HostValue::Undefined | HostValue::Function | HostValue::Symbol => {
            env.get_undefined()?.into_unknown()
        }
        HostValue::Null => env.get_null()?.into_unknown(),
        HostValue::Bool(b) => env.get_boolean(*b)?.into_unknown(),
        HostValue::Number(n) => env.create_double(*n)?.into_unknown(),
        HostValue::BigInt(i) => env.create_bigint_from_i128(*i)?.into_unknown()?,
        HostValue::String(s) => env.create_string(s)?.into_unknown(),
        HostValue::Buffer(bytes) => env
            .create_buffer_with_data(bytes.clone())?
            .into_raw()
            .into_unknown(),
        HostValue::Array(items) => {
            let mut array = env.create_array_with_length(items.len())?;
            for (i, item) in items.iter().enumerate() {
                array.set_element(i as u32, host_to_js(env, item)?)?;
            }
            array.into_unknown()
        }
        HostValue::Object(entries) => {
            let mut object = env.create_object()?;
            for (key, item) in entries {
                object.set_named_property(key, host_to_js(env, item)?)?;
            }
            object.into_unknown()
        }
        HostValue::External(id) => wrap_handle(env, *id)?.into_unknown(),
    })
}

// =============================================================================
// Thread-safe functions
// =============================================================================

type Tsfn<P> = ThreadsafeFunction<P, ErrorStrategy::Fatal>;

/// A JavaScript callback reachable from native threads.
///
/// Created unreferenced, so a live listener never keeps the process alive.
/// Aborting releases the thread-safe function; calls still queued are then
/// finalized without reaching JavaScript.
struct NodeFunction<P: 'static> {
    tsfn: Mutex<Option<Tsfn<P>>>,
}

impl<P: Send + 'static> NodeFunction<P> {
    fn new<F>(env: &Env, callback: &JsFunction, to_args: F) -> napi::Result<Self>
    where
        F: Fn(&Env, P) -> napi::Result<Vec<JsUnknown>> + Send + 'static,
    {
        let mut tsfn: Tsfn<P> = callback
            .create_threadsafe_function(0, move |ctx: ThreadSafeCallContext<P>| {
                to_args(&ctx.env, ctx.value)
            })?;
        tsfn.unref(env)?;
        Ok(Self {
            tsfn: Mutex::new(Some(tsfn)),
        })
    }

    fn dispatch<S>(&self, send: S) -> Result<(), DispatchError>
    where
        S: FnOnce(&Tsfn<P>) -> Status,
    {
        let tsfn = self.tsfn.lock();
        let Some(tsfn) = tsfn.as_ref() else {
            return Err(DispatchError::Aborted);
        };
        match send(tsfn) {
            Status::Ok => Ok(()),
            Status::Closing => Err(DispatchError::Closing),
            status => {
                tracing::warn!(?status, "thread-safe function call failed");
                Err(DispatchError::Closing)
            }
        }
    }

    fn shutdown(&self) {
        if let Some(tsfn) = self.tsfn.lock().take() {
            if let Err(e) = tsfn.abort() {
                tracing::debug!(error = %e, "aborting thread-safe function failed");
            }
        }
    }
}

impl<P: Send + 'static> HostFunction<P> for NodeFunction<P> {
    fn call(&self, payload: P) -> Result<(), DispatchError> {
        self.dispatch(|tsfn| tsfn.call(payload, ThreadsafeFunctionCallMode::NonBlocking))
    }

    fn abort(&self) {
        self.shutdown();
    }

    fn is_aborted(&self) -> bool {
        self.tsfn.lock().is_none()
    }

    fn unref(&self) {}
}

/// A JavaScript callback whose return value answers a native request.
struct NodeExchange<P: 'static, R> {
    function: NodeFunction<P>,
    answer: fn(&P, &HostValue) -> R,
}

impl<P: Clone + Send + 'static, R: Send + 'static> HostFunction<Request<P, R>> for NodeExchange<P, R> {
    fn call(&self, request: Request<P, R>) -> Result<(), DispatchError> {
        let (payload, responder) = request.into_parts();
        let context = payload.clone();
        let answer = self.answer;
        self.function.dispatch(move |tsfn| {
            tsfn.call_with_return_value(
                payload,
                ThreadsafeFunctionCallMode::NonBlocking,
                move |ret: JsUnknown| {
                    responder.respond(answer(&context, &js_to_host(None, ret)?));
                    Ok(())
                },
            )
        })
    }

    fn abort(&self) {
        self.function.shutdown();
    }

    fn is_aborted(&self) -> bool {
        self.function.is_aborted()
    }

    fn unref(&self) {}
}

fn single_arg(env: &Env, value: &HostValue) -> napi::Result<Vec<JsUnknown>> {
    Ok(vec![host_to_js(env, value)?])
}

/// Wrap a registration in the JavaScript function that stops it.
fn stop_function(env: &Env, registration: ListenerRegistration) -> napi::Result<JsFunction> {
    let name = registration.kind().stop_name();
    let registration = Arc::new(registration);
    env.create_function_from_closure(name, move |ctx| {
        registration.stop();
        ctx.env.get_undefined()
    })
}

fn function_property(config: &JsObject, key: &str) -> napi::Result<Option<JsFunction>> {
    if !config.has_named_property(key)? {
        return Ok(None);
    }
    let value = config.get_named_property_unchecked::<JsUnknown>(key)?;
    match value.get_type()? {
        ValueType::Function => Ok(Some(unsafe { value.cast::<JsFunction>() })),
        ValueType::Undefined | ValueType::Null => Ok(None),
        other => Err(to_napi_err(BindingError::invalid_argument(format!(
            "{} must be a function, got {:?}",
            key, other
        )))),
    }
}

// =============================================================================
// Setup
// =============================================================================

/// Initialise the binding. Optional; the first call into the binding
/// otherwise initialises it with the default configuration.
#[napi]
pub fn init(config: Option<serde_json::Value>) -> napi::Result<bool> {
    let config = BindingConfig::from_json(config.unwrap_or(serde_json::Value::Null))
        .map_err(to_napi_err)?;
    config::init_logging(&config).map_err(to_napi_err)?;
    let mut installed = false;
    RUNTIME.get_or_init(|| {
        installed = true;
        Runtime::new(config)
    });
    if !installed {
        return Err(to_napi_err(BindingError::Config(
            "the binding is already initialised".into(),
        )));
    }
    Ok(true)
}

/// Make the database `name` reachable by replicators at a `ws://` URL.
#[napi(js_name = "registerRemoteDatabase")]
pub fn register_remote_database(url: String, name: String, directory: Option<String>) -> napi::Result<bool> {
    runtime()
        .engine
        .register_remote(&url, &name, directory.as_deref())
        .map_err(|e| to_napi_err(e.into()))?;
    Ok(true)
}

/// Release a handle now instead of waiting for garbage collection.
#[napi(js_name = "releaseHandle")]
pub fn release_handle(env: Env, handle_ref: JsExternal) -> napi::Result<bool> {
    let id = handle(&env, &handle_ref)?;
    Ok(binding().release_handle(id))
}

// =============================================================================
// Database
// =============================================================================

#[napi(js_name = "openDatabase")]
pub fn open_database(env: Env, name: String, directory: Option<String>) -> napi::Result<JsExternal> {
    let id = binding()
        .open_database(&name, directory.as_deref())
        .map_err(to_napi_err)?;
    wrap_handle(&env, id)
}

#[napi(js_name = "closeDatabase")]
pub fn close_database(env: Env, db: JsExternal) -> napi::Result<bool> {
    binding().close_database(handle(&env, &db)?).map_err(to_napi_err)
}

#[napi(js_name = "deleteDatabase")]
pub fn delete_database(env: Env, db: JsExternal) -> napi::Result<bool> {
    binding().delete_database(handle(&env, &db)?).map_err(to_napi_err)
}

#[napi(js_name = "deleteDatabaseByName")]
pub fn delete_database_by_name(name: String, directory: Option<String>) -> napi::Result<bool> {
    binding()
        .delete_database_by_name(&name, directory.as_deref())
        .map_err(to_napi_err)
}

#[napi(js_name = "databaseName")]
pub fn database_name(env: Env, db: JsExternal) -> napi::Result<String> {
    binding().database_name(handle(&env, &db)?).map_err(to_napi_err)
}

#[napi(js_name = "databasePath")]
pub fn database_path(env: Env, db: JsExternal) -> napi::Result<String> {
    binding().database_path(handle(&env, &db)?).map_err(to_napi_err)
}

#[napi(js_name = "databaseCount")]
pub fn database_count(env: Env, db: JsExternal) -> napi::Result<f64> {
    binding()
        .database_count(handle(&env, &db)?)
        .map(|n| n as f64)
        .map_err(to_napi_err)
}

#[napi(js_name = "beginTransaction")]
pub fn begin_transaction(env: Env, db: JsExternal) -> napi::Result<bool> {
    binding().begin_transaction(handle(&env, &db)?).map_err(to_napi_err)
}

#[napi(js_name = "endTransaction")]
pub fn end_transaction(env: Env, db: JsExternal, commit: bool) -> napi::Result<bool> {
    binding()
        .end_transaction(handle(&env, &db)?, commit)
        .map_err(to_napi_err)
}

/// Returns a function that stops the listener.
#[napi(js_name = "addDatabaseChangeListener")]
pub fn add_database_change_listener(env: Env, db: JsExternal, handler: JsFunction) -> napi::Result<JsFunction> {
    let db = handle(&env, &db)?;
    let function = NodeFunction::new(&env, &handler, |env, ids: Vec<String>| {
        single_arg(env, &HostValue::Array(ids.into_iter().map(HostValue::String).collect()))
    })?;
    let registration = binding()
        .add_database_change_listener(db, Arc::new(function))
        .map_err(to_napi_err)?;
    stop_function(&env, registration)
}

// =============================================================================
// Documents
// =============================================================================

#[napi(js_name = "getDocument")]
pub fn get_document(env: Env, db: JsExternal, id: String) -> napi::Result<Option<JsExternal>> {
    let doc = binding()
        .get_document(handle(&env, &db)?, &id)
        .map_err(to_napi_err)?;
    maybe_handle(&env, doc)
}

#[napi(js_name = "getMutableDocument")]
pub fn get_mutable_document(env: Env, db: JsExternal, id: String) -> napi::Result<Option<JsExternal>> {
    let doc = binding()
        .get_mutable_document(handle(&env, &db)?, &id)
        .map_err(to_napi_err)?;
    maybe_handle(&env, doc)
}

#[napi(js_name = "createDocument")]
pub fn create_document(env: Env, id: Option<String>) -> napi::Result<JsExternal> {
    let doc = binding().create_document(id.as_deref()).map_err(to_napi_err)?;
    wrap_handle(&env, doc)
}

#[napi(js_name = "saveDocument")]
pub fn save_document(env: Env, db: JsExternal, doc: JsExternal) -> napi::Result<bool> {
    binding()
        .save_document(handle(&env, &db)?, handle(&env, &doc)?)
        .map_err(to_napi_err)
}

#[napi(js_name = "deleteDocument")]
pub fn delete_document(env: Env, db: JsExternal, doc: JsExternal) -> napi::Result<bool> {
    binding()
        .delete_document(handle(&env, &db)?, handle(&env, &doc)?)
        .map_err(to_napi_err)
}

#[napi(js_name = "getDocumentID")]
pub fn get_document_id(env: Env, doc: JsExternal) -> napi::Result<String> {
    binding().get_document_id(handle(&env, &doc)?).map_err(to_napi_err)
}

#[napi(js_name = "getDocumentJSON")]
pub fn get_document_json(env: Env, doc: JsExternal) -> napi::Result<String> {
    binding().get_document_json(handle(&env, &doc)?).map_err(to_napi_err)
}

#[napi(js_name = "setDocumentJSON")]
pub fn set_document_json(env: Env, doc: JsExternal, json: String) -> napi::Result<bool> {
    binding()
        .set_document_json(handle(&env, &doc)?, &json)
        .map_err(to_napi_err)
}

#[napi(js_name = "getDocumentProperties")]
pub fn get_document_properties(env: Env, doc: JsExternal) -> napi::Result<JsUnknown> {
    let props = binding()
        .get_document_properties(handle(&env, &doc)?)
        .map_err(to_napi_err)?;
    host_to_js(&env, &props)
}

#[napi(js_name = "setDocumentProperties")]
pub fn set_document_properties(env: Env, doc: JsExternal, properties: JsUnknown) -> napi::Result<bool> {
    let doc = handle(&env, &doc)?;
    let properties = js_to_host(Some(&env), properties)?;
    binding()
        .set_document_properties(doc, &properties)
        .map_err(to_napi_err)
}

#[napi(js_name = "addDocumentChangeListener")]
pub fn add_document_change_listener(
    env: Env,
    db: JsExternal,
    id: String,
    handler: JsFunction,
) -> napi::Result<JsFunction> {
    let db = handle(&env, &db)?;
    let function = NodeFunction::new(&env, &handler, |env, id: String| {
        single_arg(env, &HostValue::String(id))
    })?;
    let registration = binding()
        .add_document_change_listener(db, &id, Arc::new(function))
        .map_err(to_napi_err)?;
    stop_function(&env, registration)
}

// =============================================================================
// Queries
// =============================================================================

#[napi(js_name = "CBLJSONLanguage")]
pub const CBL_JSON_LANGUAGE: u32 = JSON_LANGUAGE;

#[napi(js_name = "CBLN1QLLanguage")]
pub const CBL_N1QL_LANGUAGE: u32 = N1QL_LANGUAGE;

#[napi(js_name = "createQuery")]
pub fn create_query(env: Env, db: JsExternal, language: u32, query: String) -> napi::Result<JsExternal> {
    let id = binding()
        .create_query(handle(&env, &db)?, language, &query)
        .map_err(to_napi_err)?;
    wrap_handle(&env, id)
}

/// Results as a JSON array string.
#[napi(js_name = "executeQuery")]
pub fn execute_query(env: Env, query: JsExternal) -> napi::Result<String> {
    binding().execute_query(handle(&env, &query)?).map_err(to_napi_err)
}

#[napi(js_name = "explainQuery")]
pub fn explain_query(env: Env, query: JsExternal) -> napi::Result<String> {
    binding().explain_query(handle(&env, &query)?).map_err(to_napi_err)
}

#[napi(js_name = "getQueryParameters")]
pub fn get_query_parameters(env: Env, query: JsExternal) -> napi::Result<String> {
    binding()
        .get_query_parameters(handle(&env, &query)?)
        .map_err(to_napi_err)
}

#[napi(js_name = "setQueryParameters")]
pub fn set_query_parameters(env: Env, query: JsExternal, parameters: String) -> napi::Result<bool> {
    binding()
        .set_query_parameters(handle(&env, &query)?, &parameters)
        .map_err(to_napi_err)
}

/// The handler receives the results as a JSON array string.
#[napi(js_name = "addQueryChangeListener")]
pub fn add_query_change_listener(env: Env, query: JsExternal, handler: JsFunction) -> napi::Result<JsFunction> {
    let query = handle(&env, &query)?;
    let function = NodeFunction::new(&env, &handler, |env, results: String| {
        single_arg(env, &HostValue::String(results))
    })?;
    let registration = binding()
        .add_query_change_listener(query, Arc::new(function))
        .map_err(to_napi_err)?;
    stop_function(&env, registration)
}

// =============================================================================
// Blobs
// =============================================================================

#[napi(js_name = "createBlobWithData")]
pub fn create_blob_with_data(env: Env, content_type: String, data: Buffer) -> napi::Result<JsExternal> {
    let id = binding()
        .create_blob_with_data(&content_type, &data)
        .map_err(to_napi_err)?;
    wrap_handle(&env, id)
}

#[napi(js_name = "createBlobWithStream")]
pub fn create_blob_with_stream(env: Env, content_type: String, stream: JsExternal) -> napi::Result<JsExternal> {
    let id = binding()
        .create_blob_with_stream(&content_type, handle(&env, &stream)?)
        .map_err(to_napi_err)?;
    wrap_handle(&env, id)
}

#[napi(js_name = "blobContent")]
pub fn blob_content(env: Env, blob: JsExternal) -> napi::Result<Buffer> {
    binding()
        .blob_content(handle(&env, &blob)?)
        .map(Buffer::from)
        .map_err(to_napi_err)
}

#[napi(js_name = "blobContentType")]
pub fn blob_content_type(env: Env, blob: JsExternal) -> napi::Result<String> {
    binding().blob_content_type(handle(&env, &blob)?).map_err(to_napi_err)
}

#[napi(js_name = "blobCreateJson")]
pub fn blob_create_json(env: Env, blob: JsExternal) -> napi::Result<String> {
    binding().blob_create_json(handle(&env, &blob)?).map_err(to_napi_err)
}

#[napi(js_name = "blobProperties")]
pub fn blob_properties(env: Env, blob: JsExternal) -> napi::Result<JsUnknown> {
    let props = binding()
        .blob_properties(handle(&env, &blob)?)
        .map_err(to_napi_err)?;
    host_to_js(&env, &props)
}

#[napi(js_name = "blobDigest")]
pub fn blob_digest(env: Env, blob: JsExternal) -> napi::Result<String> {
    binding().blob_digest(handle(&env, &blob)?).map_err(to_napi_err)
}

#[napi(js_name = "blobEquals")]
pub fn blob_equals(env: Env, blob: JsExternal, another_blob: JsExternal) -> napi::Result<bool> {
    binding()
        .blob_equals(handle(&env, &blob)?, handle(&env, &another_blob)?)
        .map_err(to_napi_err)
}

#[napi(js_name = "blobLength")]
pub fn blob_length(env: Env, blob: JsExternal) -> napi::Result<f64> {
    binding()
        .blob_length(handle(&env, &blob)?)
        .map(|n| n as f64)
        .map_err(to_napi_err)
}

#[napi(js_name = "openBlobContentStream")]
pub fn open_blob_content_stream(env: Env, blob: JsExternal) -> napi::Result<JsExternal> {
    let id = binding()
        .open_blob_content_stream(handle(&env, &blob)?)
        .map_err(to_napi_err)?;
    wrap_handle(&env, id)
}

/// An empty buffer means the end of the content.
#[napi(js_name = "readBlobReader")]
pub fn read_blob_reader(env: Env, stream: JsExternal, max_length: Option<u32>) -> napi::Result<Buffer> {
    binding()
        .read_blob_reader(handle(&env, &stream)?, max_length.unwrap_or(0) as usize)
        .map(Buffer::from)
        .map_err(to_napi_err)
}

#[napi(js_name = "closeBlobReader")]
pub fn close_blob_reader(env: Env, stream: JsExternal) -> napi::Result<bool> {
    binding().close_blob_reader(handle(&env, &stream)?).map_err(to_napi_err)
}

#[napi(js_name = "createBlobWriter")]
pub fn create_blob_writer(env: Env, db: JsExternal) -> napi::Result<JsExternal> {
    let id = binding()
        .create_blob_writer(handle(&env, &db)?)
        .map_err(to_napi_err)?;
    wrap_handle(&env, id)
}

#[napi(js_name = "writeBlobWriter")]
pub fn write_blob_writer(env: Env, stream: JsExternal, data: Buffer) -> napi::Result<bool> {
    binding()
        .write_blob_writer(handle(&env, &stream)?, &data)
        .map_err(to_napi_err)
}

#[napi(js_name = "closeBlobWriter")]
pub fn close_blob_writer(env: Env, stream: JsExternal) -> napi::Result<bool> {
    binding().close_blob_writer(handle(&env, &stream)?).map_err(to_napi_err)
}

#[napi(js_name = "databaseGetBlob")]
pub fn database_get_blob(env: Env, db: JsExternal, properties: JsUnknown) -> napi::Result<Option<JsExternal>> {
    let db = handle(&env, &db)?;
    let properties = js_to_host(Some(&env), properties)?;
    let blob = binding()
        .database_get_blob(db, &properties)
        .map_err(to_napi_err)?;
    maybe_handle(&env, blob)
}

#[napi(js_name = "databaseSaveBlob")]
pub fn database_save_blob(env: Env, db: JsExternal, blob: JsExternal) -> napi::Result<bool> {
    binding()
        .database_save_blob(handle(&env, &db)?, handle(&env, &blob)?)
        .map_err(to_napi_err)
}

/// The blob stays owned by the document.
#[napi(js_name = "documentGetBlob")]
pub fn document_get_blob(env: Env, doc: JsExternal, property: String) -> napi::Result<Option<JsExternal>> {
    let blob = binding()
        .document_get_blob(handle(&env, &doc)?, &property)
        .map_err(to_napi_err)?;
    maybe_handle(&env, blob)
}

#[napi(js_name = "documentIsBlob")]
pub fn document_is_blob(env: Env, doc: JsExternal, property: String) -> napi::Result<bool> {
    binding()
        .document_is_blob(handle(&env, &doc)?, &property)
        .map_err(to_napi_err)
}

#[napi(js_name = "documentSetBlob")]
pub fn document_set_blob(env: Env, doc: JsExternal, property: String, blob: JsExternal) -> napi::Result<bool> {
    binding()
        .document_set_blob(handle(&env, &doc)?, &property, handle(&env, &blob)?)
        .map_err(to_napi_err)
}

// =============================================================================
// Replicator
// =============================================================================

#[napi(js_name = "createReplicator")]
pub fn create_replicator(env: Env, config: JsObject) -> napi::Result<JsExternal> {
    let resolver = function_property(&config, "conflictResolver")?;
    let pull_filter = function_property(&config, "pullFilter")?;
    let push_filter = function_property(&config, "pushFilter")?;

    let host_config = js_to_host(Some(&env), config.into_unknown())?;
    let mut options = ReplicatorOptions::from_host(&host_config).map_err(to_napi_err)?;

    if let Some(resolver) = resolver {
        let function = NodeFunction::new(&env, &resolver, |env, conflict: Conflict| {
            single_arg(env, &conflict_to_host(&conflict))
        })?;
        options.conflict_resolver = Some(Arc::new(NodeExchange {
            function,
            answer: resolution_from_host,
        }));
    }
    for (filter, slot) in [
        (pull_filter, &mut options.pull_filter),
        (push_filter, &mut options.push_filter),
    ] {
        if let Some(filter) = filter {
            let function = NodeFunction::new(&env, &filter, |env, request: FilterRequest| {
                single_arg(env, &filter_to_host(&request))
            })?;
            *slot = Some(Arc::new(NodeExchange {
                function,
                answer: |_: &FilterRequest, answer: &HostValue| filter_answer_from_host(answer),
            }));
        }
    }

    let id = binding().create_replicator(options).map_err(to_napi_err)?;
    wrap_handle(&env, id)
}

#[napi(js_name = "replicatorConfiguration")]
pub fn replicator_configuration(env: Env, replicator: JsExternal) -> napi::Result<JsUnknown> {
    let config = binding()
        .replicator_configuration(handle(&env, &replicator)?)
        .map_err(to_napi_err)?;
    host_to_js(&env, &config)
}

#[napi(js_name = "startReplicator")]
pub fn start_replicator(env: Env, replicator: JsExternal, reset_checkpoint: Option<bool>) -> napi::Result<bool> {
    binding()
        .start_replicator(handle(&env, &replicator)?, reset_checkpoint.unwrap_or(false))
        .map_err(to_napi_err)
}

#[napi(js_name = "stopReplicator")]
pub fn stop_replicator(env: Env, replicator: JsExternal) -> napi::Result<bool> {
    binding()
        .stop_replicator(handle(&env, &replicator)?)
        .map_err(to_napi_err)
}

#[napi(js_name = "setHostReachable")]
pub fn set_host_reachable(env: Env, replicator: JsExternal, reachable: bool) -> napi::Result<bool> {
    binding()
        .set_host_reachable(handle(&env, &replicator)?, reachable)
        .map_err(to_napi_err)
}

#[napi(js_name = "setReplicatorSuspended")]
pub fn set_replicator_suspended(env: Env, replicator: JsExternal, suspended: bool) -> napi::Result<bool> {
    binding()
        .set_replicator_suspended(handle(&env, &replicator)?, suspended)
        .map_err(to_napi_err)
}

#[napi(js_name = "replicatorStatus")]
pub fn replicator_status(env: Env, replicator: JsExternal) -> napi::Result<JsUnknown> {
    let status = binding()
        .replicator_status(handle(&env, &replicator)?)
        .map_err(to_napi_err)?;
    host_to_js(&env, &status_to_host(&status))
}

#[napi(js_name = "documentsPendingReplication")]
pub fn documents_pending_replication(env: Env, replicator: JsExternal) -> napi::Result<Vec<String>> {
    binding()
        .documents_pending_replication(handle(&env, &replicator)?)
        .map_err(to_napi_err)
}

#[napi(js_name = "isDocumentPendingReplication")]
pub fn is_document_pending_replication(env: Env, replicator: JsExternal, id: String) -> napi::Result<bool> {
    binding()
        .is_document_pending_replication(handle(&env, &replicator)?, &id)
        .map_err(to_napi_err)
}

#[napi(js_name = "addReplicatorChangeListener")]
pub fn add_replicator_change_listener(
    env: Env,
    replicator: JsExternal,
    handler: JsFunction,
) -> napi::Result<JsFunction> {
    let replicator = handle(&env, &replicator)?;
    let function = NodeFunction::new(&env, &handler, |env, status: ReplicatorStatus| {
        single_arg(env, &status_to_host(&status))
    })?;
    let registration = binding()
        .add_replicator_change_listener(replicator, Arc::new(function))
        .map_err(to_napi_err)?;
    stop_function(&env, registration)
}

/// The handler receives `(direction, documents)`.
#[napi(js_name = "addDocumentReplicationListener")]
pub fn add_document_replication_listener(
    env: Env,
    replicator: JsExternal,
    handler: JsFunction,
) -> napi::Result<JsFunction> {
    let replicator = handle(&env, &replicator)?;
    let function = NodeFunction::new(&env, &handler, |env, event: DocumentReplication| {
        document_replication_to_host(&event)
            .iter()
            .map(|arg| host_to_js(env, arg))
            .collect()
    })?;
    let registration = binding()
        .add_document_replication_listener(replicator, Arc::new(function))
        .map_err(to_napi_err)?;
    stop_function(&env, registration)
}
