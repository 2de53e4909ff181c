use std::fmt;
use std::sync::Arc;

use super::{handle_arg, string_arg, Binding};
use crate::engine::{
    default_conflict_resolution, Conflict, DocumentReplication, Endpoint, FilterCallback,
    FilterRequest, ReplicatedDocument, ReplicatorConfiguration, ReplicatorStatus, ReplicatorType,
    Resolution,
};
use crate::error::{BindingError, BindingResult};
use crate::handle::{HandleId, Ownership, ReplicatorRecord, Resource};
use crate::host::{HostFunction, Request};
use crate::listener::{Exchange, ListenerKind, ListenerRegistration};
use crate::value::{dict_to_host, host_to_dict, HostValue};

/// Host callback deciding a conflict.
pub type ConflictResolverFunction = Arc<dyn HostFunction<Request<Conflict, Resolution>>>;
/// Host callback accepting or rejecting a revision.
pub type FilterFunction = Arc<dyn HostFunction<Request<FilterRequest, bool>>>;

/// Where a replicator sends and fetches changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicatorEndpoint {
    /// `ws://` or `wss://` URL of a remote database.
    Url(String),
    /// Another open database.
    Database(HandleId),
}

/// Host-side replicator configuration.
pub struct ReplicatorOptions {
    pub database: HandleId,
    pub endpoint: ReplicatorEndpoint,
    pub replicator_type: ReplicatorType,
    pub continuous: bool,
    pub disable_auto_purge: bool,
    pub max_attempts: u32,
    pub max_attempt_wait_time: u32,
    pub heartbeat: u32,
    pub document_ids: Option<Vec<String>>,
    pub conflict_resolver: Option<ConflictResolverFunction>,
    pub pull_filter: Option<FilterFunction>,
    pub push_filter: Option<FilterFunction>,
}

impl fmt::Debug for ReplicatorOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicatorOptions")
            .field("database", &self.database)
            .field("endpoint", &self.endpoint)
            .field("replicator_type", &self.replicator_type)
            .field("continuous", &self.continuous)
            .field("document_ids", &self.document_ids)
            .field("conflict_resolver", &self.conflict_resolver.is_some())
            .field("pull_filter", &self.pull_filter.is_some())
            .field("push_filter", &self.push_filter.is_some())
            .finish_non_exhaustive()
    }
}

impl ReplicatorOptions {
    pub fn new(database: HandleId, endpoint: ReplicatorEndpoint) -> Self {
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

    /// Parse a host configuration object.
    ///
    /// Function-valued keys (`conflictResolver`, `pullFilter`, `pushFilter`)
    /// are ignored here; the host layer turns them into host functions.
    pub fn from_host(config: &HostValue) -> BindingResult<Self> {
        if !matches!(config, HostValue::Object(_)) {
            return Err(BindingError::invalid_argument(format!(
                "replicator configuration must be an object, got {}",
                config.type_name()
            )));
        }
        let database = handle_arg(config.get("database").unwrap_or(&HostValue::Undefined), "database")?;
        let endpoint = match config.get("endpoint") {
            Some(HostValue::String(url)) => ReplicatorEndpoint::Url(url.clone()),
            Some(HostValue::External(id)) => ReplicatorEndpoint::Database(*id),
            other => {
                return Err(BindingError::invalid_argument(format!(
                    "endpoint must be a URL or a database handle, got {}",
                    other.map_or("undefined", HostValue::type_name)
                )))
            }
        };

        let mut options = Self::new(database, endpoint);
        if let Some(value) = field(config, "replicatorType") {
            let name = string_arg(value, "replicatorType")?;
            options.replicator_type = ReplicatorType::parse(name).ok_or_else(|| {
                BindingError::invalid_argument(format!("unknown replicatorType '{}'", name))
            })?;
        }
        if let Some(b) = bool_field(config, "continuous")? {
            options.continuous = b;
        }
        if let Some(b) = bool_field(config, "disableAutoPurge")? {
            options.disable_auto_purge = b;
        }
        if let Some(n) = u32_field(config, "maxAttempts")? {
            options.max_attempts = n;
        }
        if let Some(n) = u32_field(config, "maxAttemptWaitTime")? {
            options.max_attempt_wait_time = n;
        }
        if let Some(n) = u32_field(config, "heartbeat")? {
            options.heartbeat = n;
        }
        if let Some(value) = field(config, "documentIDs") {
            let HostValue::Array(items) = value else {
                return Err(BindingError::invalid_argument("documentIDs must be an array of strings"));
            };
            let ids = items
                .iter()
                .map(|item| string_arg(item, "documentIDs[]").map(str::to_string))
                .collect::<BindingResult<Vec<_>>>()?;
            options.document_ids = Some(ids);
        }
        Ok(options)
    }
}

/// A present, non-nullish property.
fn field<'a>(config: &'a HostValue, key: &str) -> Option<&'a HostValue> {
    config.get(key).filter(|v| !v.is_nullish())
}

fn bool_field(config: &HostValue, key: &str) -> BindingResult<Option<bool>> {
    field(config, key)
        .map(|v| {
            v.as_bool()
                .ok_or_else(|| BindingError::invalid_argument(format!("{} must be a boolean", key)))
        })
        .transpose()
}

fn u32_field(config: &HostValue, key: &str) -> BindingResult<Option<u32>> {
    field(config, key)
        .map(|v| match v.as_f64() {
            Some(n) if n >= 0.0 && n.fract() == 0.0 && n <= u32::MAX as f64 => Ok(n as u32),
            _ => Err(BindingError::invalid_argument(format!(
                "{} must be a non-negative integer",
                key
            ))),
        })
        .transpose()
}

// =============================================================================
// Host payloads
// =============================================================================

/// `{activity, progress: {complete, documentCount}, error?}`
pub fn status_to_host(status: &ReplicatorStatus) -> HostValue {
    let mut entries = vec![
        ("activity", HostValue::String(status.activity.as_str().to_string())),
        (
            "progress",
            HostValue::object([
                ("complete", HostValue::Number(f64::from(status.progress.complete))),
                (
                    "documentCount",
                    HostValue::BigInt(i128::from(status.progress.document_count)),
                ),
            ]),
        ),
    ];
    if let Some(error) = &status.error {
        entries.push(("error", HostValue::String(error.message.clone())));
    }
    HostValue::object(entries)
}

/// Callback arguments for a document replication event: the direction
/// (`"push"` or `"pull"`) and one `{id, deleted, accessRemoved, error?}`
/// per document.
pub fn document_replication_to_host(event: &DocumentReplication) -> Vec<HostValue> {
    let direction = if event.is_push { "push" } else { "pull" };
    let documents = event.documents.iter().map(replicated_document_to_host).collect();
    vec![
        HostValue::String(direction.to_string()),
        HostValue::Array(documents),
    ]
}

fn replicated_document_to_host(doc: &ReplicatedDocument) -> HostValue {
    let mut entries = vec![
        ("id", HostValue::String(doc.id.clone())),
        ("deleted", HostValue::Bool(doc.flags.deleted)),
        ("accessRemoved", HostValue::Bool(doc.flags.access_removed)),
    ];
    if let Some(error) = &doc.error {
        entries.push(("error", HostValue::String(error.message.clone())));
    }
    HostValue::object(entries)
}

/// `{documentID, localDocument, remoteDocument}`; a deleted side is `null`.
pub fn conflict_to_host(conflict: &Conflict) -> HostValue {
    let side = |props: &Option<_>| props.as_ref().map_or(HostValue::Null, dict_to_host);
    HostValue::object([
        ("documentID", HostValue::String(conflict.document_id.clone())),
        ("localDocument", side(&conflict.local)),
        ("remoteDocument", side(&conflict.remote)),
    ])
}

/// Interpret a conflict resolver's return value: an object is the winning
/// revision, `null` deletes the document, anything else keeps the remote
/// revision.
pub fn resolution_from_host(conflict: &Conflict, answer: &HostValue) -> Resolution {
    match answer {
        HostValue::Object(_) => match host_to_dict(answer) {
            Ok(dict) => Some(dict),
            Err(_) => default_conflict_resolution(conflict),
        },
        HostValue::Null => None,
        other => {
            tracing::warn!(
                doc = %conflict.document_id,
                answer = other.type_name(),
                "conflict resolver returned neither an object nor null; remote revision wins"
            );
            default_conflict_resolution(conflict)
        }
    }
}

/// `{documentID, document, deleted, accessRemoved}`
pub fn filter_to_host(request: &FilterRequest) -> HostValue {
    HostValue::object([
        ("documentID", HostValue::String(request.document_id.clone())),
        ("document", dict_to_host(&request.properties)),
        ("deleted", HostValue::Bool(request.flags.deleted)),
        ("accessRemoved", HostValue::Bool(request.flags.access_removed)),
    ])
}

/// A filter's return value, by host truthiness.
pub fn filter_answer_from_host(answer: &HostValue) -> bool {
    match answer {
        HostValue::Undefined | HostValue::Null => false,
        HostValue::Bool(b) => *b,
        HostValue::Number(n) => *n != 0.0 && !n.is_nan(),
        HostValue::BigInt(i) => *i != 0,
        HostValue::String(s) => !s.is_empty(),
        _ => true,
    }
}

fn filter_callback(
    kind: ListenerKind,
    function: FilterFunction,
    exchange_poll: std::time::Duration,
    callbacks: &mut Vec<ListenerRegistration>,
) -> FilterCallback {
    let exchange = Exchange::new(kind, function.clone(), exchange_poll);
    callbacks.push(ListenerRegistration::callback(kind, function));
    Arc::new(move |request: &FilterRequest| {
        exchange.request(request.clone()).unwrap_or_else(|| {
            tracing::debug!(%kind, doc = %request.document_id, "filter unavailable; accepting revision");
            true
        })
    })
}

impl Binding {
    // =========================================================================
    // Replicator
    // =========================================================================

    /// Create a replicator. Conflict resolvers and filters become blocking
    /// host callbacks that live until the replicator handle is released.
    pub fn create_replicator(&self, options: ReplicatorOptions) -> BindingResult<HandleId> {
        let database = self.handles.database(options.database)?;
        let db_ptr = database.ensure_open()?;
        let (endpoint, target) = match &options.endpoint {
            ReplicatorEndpoint::Url(url) => (Endpoint::Url(url.clone()), None),
            ReplicatorEndpoint::Database(id) => {
                let target = self.handles.database(*id)?;
                (Endpoint::LocalDatabase(target.ensure_open()?), Some(target))
            }
        };

        let mut config = ReplicatorConfiguration::new(db_ptr, endpoint);
        config.replicator_type = options.replicator_type;
        config.continuous = options.continuous;
        config.disable_auto_purge = options.disable_auto_purge;
        config.max_attempts = options.max_attempts;
        config.max_attempt_wait_time = options.max_attempt_wait_time;
        config.heartbeat = options.heartbeat;
        config.document_ids = options.document_ids;

        let poll = self.config.reply_poll();
        let mut callbacks = Vec::new();
        if let Some(function) = options.conflict_resolver {
            let kind = ListenerKind::ConflictResolver;
            let exchange = Exchange::new(kind, function.clone(), poll);
            callbacks.push(ListenerRegistration::callback(kind, function));
            config.conflict_resolver = Some(Arc::new(move |conflict: &Conflict| {
                exchange.request(conflict.clone()).unwrap_or_else(|| {
                    tracing::debug!(doc = %conflict.document_id, "resolver unavailable; remote revision wins");
                    default_conflict_resolution(conflict)
                })
            }));
        }
        if let Some(function) = options.pull_filter {
            config.pull_filter = Some(filter_callback(ListenerKind::PullFilter, function, poll, &mut callbacks));
        }
        if let Some(function) = options.push_filter {
            config.push_filter = Some(filter_callback(ListenerKind::PushFilter, function, poll, &mut callbacks));
        }

        let ptr = match self.engine.replicator_create(config) {
            Ok(ptr) => ptr,
            Err(e) => {
                for callback in &callbacks {
                    callback.stop();
                }
                tracing::debug!(error = %e, "replicator creation failed");
                return Err(e.into());
            }
        };
        Ok(self.handles.wrap(
            Resource::Replicator(Arc::new(ReplicatorRecord {
                ptr,
                database,
                target,
                callbacks,
            })),
            Ownership::Owned,
        ))
    }

    /// The replicator's settings. Databases are returned as borrowed
    /// handles: releasing them leaves the databases open.
    pub fn replicator_configuration(&self, replicator: HandleId) -> BindingResult<HostValue> {
        let record = self.handles.replicator(replicator)?;
        let settings = self.engine.replicator_config(record.ptr);

        let database = self
            .handles
            .wrap(Resource::Database(record.database.clone()), Ownership::Borrowed);
        let endpoint = match (&settings.endpoint, &record.target) {
            (Endpoint::Url(url), _) => HostValue::String(url.clone()),
            (Endpoint::LocalDatabase(_), Some(target)) => HostValue::External(
                self.handles
                    .wrap(Resource::Database(target.clone()), Ownership::Borrowed),
            ),
            (Endpoint::LocalDatabase(_), None) => HostValue::Null,
        };

        let mut entries = vec![
            ("database", HostValue::External(database)),
            ("endpoint", endpoint),
            (
                "replicatorType",
                HostValue::String(settings.replicator_type.as_str().to_string()),
            ),
            ("continuous", HostValue::Bool(settings.continuous)),
            ("disableAutoPurge", HostValue::Bool(settings.disable_auto_purge)),
            ("maxAttempts", HostValue::Number(f64::from(settings.max_attempts))),
            (
                "maxAttemptWaitTime",
                HostValue::Number(f64::from(settings.max_attempt_wait_time)),
            ),
            ("heartbeat", HostValue::Number(f64::from(settings.heartbeat))),
        ];
        if let Some(ids) = settings.document_ids {
            entries.push((
                "documentIDs",
                HostValue::Array(ids.into_iter().map(HostValue::String).collect()),
            ));
        }
        Ok(HostValue::object(entries))
    }

    pub fn start_replicator(&self, replicator: HandleId, reset_checkpoint: bool) -> BindingResult<bool> {
        let record = self.handles.replicator(replicator)?;
        record.database.ensure_open()?;
        self.engine.replicator_start(record.ptr, reset_checkpoint);
        Ok(true)
    }

    /// Ask the replicator to stop. Returns immediately; watch the status for
    /// `stopped`.
    pub fn stop_replicator(&self, replicator: HandleId) -> BindingResult<bool> {
        let record = self.handles.replicator(replicator)?;
        self.engine.replicator_stop(record.ptr);
        Ok(true)
    }

    pub fn set_host_reachable(&self, replicator: HandleId, reachable: bool) -> BindingResult<bool> {
        let record = self.handles.replicator(replicator)?;
        self.engine.replicator_set_host_reachable(record.ptr, reachable);
        Ok(true)
    }

    pub fn set_replicator_suspended(&self, replicator: HandleId, suspended: bool) -> BindingResult<bool> {
        let record = self.handles.replicator(replicator)?;
        self.engine.replicator_set_suspended(record.ptr, suspended);
        Ok(true)
    }

    pub fn replicator_status(&self, replicator: HandleId) -> BindingResult<ReplicatorStatus> {
        let record = self.handles.replicator(replicator)?;
        Ok(self.engine.replicator_status(record.ptr))
    }

    /// Ids of local documents with changes not yet pushed.
    pub fn documents_pending_replication(&self, replicator: HandleId) -> BindingResult<Vec<String>> {
        let record = self.handles.replicator(replicator)?;
        record.database.ensure_open()?;
        Ok(self.engine.replicator_pending_document_ids(record.ptr)?)
    }

    pub fn is_document_pending_replication(&self, replicator: HandleId, doc_id: &str) -> BindingResult<bool> {
        let record = self.handles.replicator(replicator)?;
        record.database.ensure_open()?;
        Ok(self.engine.replicator_is_document_pending(record.ptr, doc_id)?)
    }

    pub fn add_replicator_change_listener(
        &self,
        replicator: HandleId,
        function: Arc<dyn HostFunction<ReplicatorStatus>>,
    ) -> BindingResult<ListenerRegistration> {
        let record = self.handles.replicator(replicator)?;
        ListenerRegistration::register(
            ListenerKind::ReplicatorChange,
            function,
            self.engine.clone(),
            |dispatch| {
                self.engine.replicator_add_change_listener(
                    record.ptr,
                    Box::new(move |status: &ReplicatorStatus| {
                        dispatch.deliver(status.clone());
                    }),
                )
            },
        )
    }

    pub fn add_document_replication_listener(
        &self,
        replicator: HandleId,
        function: Arc<dyn HostFunction<DocumentReplication>>,
    ) -> BindingResult<ListenerRegistration> {
        let record = self.handles.replicator(replicator)?;
        ListenerRegistration::register(
            ListenerKind::DocumentReplication,
            function,
            self.engine.clone(),
            |dispatch| {
                self.engine.replicator_add_document_listener(
                    record.ptr,
                    Box::new(move |is_push: bool, documents: &[ReplicatedDocument]| {
                        dispatch.deliver(DocumentReplication {
                            is_push,
                            documents: documents.to_vec(),
                        });
                    }),
                )
            },
        )
    }
}
