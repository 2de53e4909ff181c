use std::sync::Arc;

use super::Binding;
use crate::engine::DatabaseConfiguration;
use crate::error::BindingResult;
use crate::handle::{DatabaseRecord, HandleId, Ownership, Resource};
use crate::host::HostFunction;
use crate::listener::{ListenerKind, ListenerRegistration};

impl Binding {
    // =========================================================================
    // Database
    // =========================================================================

    /// Open (creating if needed) the database `name`.
    ///
    /// Without a directory the configured default directory is used, and
    /// failing that the native library's own default.
    pub fn open_database(&self, name: &str, directory: Option<&str>) -> BindingResult<HandleId> {
        let config = DatabaseConfiguration {
            directory: directory
                .map(str::to_string)
                .or_else(|| self.config.default_directory.clone()),
        };
        let ptr = self.engine.database_open(name, &config)?;
        let id = self.handles.wrap(
            Resource::Database(Arc::new(DatabaseRecord::new(ptr))),
            Ownership::Owned,
        );
        tracing::debug!(database = name, handle = %id, "opened database");
        Ok(id)
    }

    /// Close the database. Returns `false` if it was already closed.
    pub fn close_database(&self, db: HandleId) -> BindingResult<bool> {
        let record = self.handles.database(db)?;
        if !record.is_open() {
            return Ok(false);
        }
        self.engine.database_close(record.ptr)?;
        record.mark_closed();
        tracing::debug!(handle = %db, "closed database");
        Ok(true)
    }

    /// Close the database and delete its files.
    pub fn delete_database(&self, db: HandleId) -> BindingResult<bool> {
        let record = self.handles.database(db)?;
        let ptr = record.ensure_open()?;
        self.engine.database_delete(ptr)?;
        record.mark_closed();
        tracing::debug!(handle = %db, "deleted database");
        Ok(true)
    }

    /// Delete a database that is not open. Returns `false` if there was no
    /// such database.
    pub fn delete_database_by_name(&self, name: &str, directory: Option<&str>) -> BindingResult<bool> {
        let directory = directory.or(self.config.default_directory.as_deref());
        Ok(self.engine.delete_database_named(name, directory)?)
    }

    pub fn database_name(&self, db: HandleId) -> BindingResult<String> {
        let record = self.handles.database(db)?;
        Ok(self.engine.database_name(record.ptr))
    }

    pub fn database_path(&self, db: HandleId) -> BindingResult<String> {
        let record = self.handles.database(db)?;
        Ok(self.engine.database_path(record.ptr))
    }

    pub fn database_count(&self, db: HandleId) -> BindingResult<u64> {
        let ptr = self.handles.database(db)?.ensure_open()?;
        Ok(self.engine.database_count(ptr))
    }

    pub fn begin_transaction(&self, db: HandleId) -> BindingResult<bool> {
        let ptr = self.handles.database(db)?.ensure_open()?;
        self.engine.begin_transaction(ptr)?;
        Ok(true)
    }

    pub fn end_transaction(&self, db: HandleId, commit: bool) -> BindingResult<bool> {
        let ptr = self.handles.database(db)?.ensure_open()?;
        self.engine.end_transaction(ptr, commit)?;
        Ok(true)
    }

    /// Deliver the ids of changed documents to `function`.
    pub fn add_database_change_listener(
        &self,
        db: HandleId,
        function: Arc<dyn HostFunction<Vec<String>>>,
    ) -> BindingResult<ListenerRegistration> {
        let ptr = self.handles.database(db)?.ensure_open()?;
        ListenerRegistration::register(
            ListenerKind::DatabaseChange,
            function,
            self.engine.clone(),
            |dispatch| {
                self.engine.database_add_change_listener(
                    ptr,
                    Box::new(move |ids: &[String]| {
                        dispatch.deliver(ids.to_vec());
                    }),
                )
            },
        )
    }
}
