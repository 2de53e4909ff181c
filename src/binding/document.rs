use std::sync::Arc;

use super::Binding;
use crate::error::BindingResult;
use crate::handle::{ensure_owner_open, DocumentRecord, HandleId, Ownership, Resource};
use crate::host::HostFunction;
use crate::listener::{ListenerKind, ListenerRegistration};
use crate::value::{dict_to_host, host_to_dict, HostValue};

impl Binding {
    // =========================================================================
    // Documents
    // =========================================================================

    /// Read-only copy of a saved document, or `None` if it does not exist.
    pub fn get_document(&self, db: HandleId, id: &str) -> BindingResult<Option<HandleId>> {
        self.fetch_document(db, id, false)
    }

    /// Mutable copy of a saved document, or `None` if it does not exist.
    pub fn get_mutable_document(&self, db: HandleId, id: &str) -> BindingResult<Option<HandleId>> {
        self.fetch_document(db, id, true)
    }

    fn fetch_document(&self, db: HandleId, id: &str, mutable: bool) -> BindingResult<Option<HandleId>> {
        let database = self.handles.database(db)?;
        let ptr = database.ensure_open()?;
        let doc = if mutable {
            self.engine.document_get_mutable(ptr, id)?
        } else {
            self.engine.document_get(ptr, id)?
        };
        Ok(doc.map(|doc| {
            self.handles.wrap(
                Resource::Document(DocumentRecord::new(doc, Some(database))),
                Ownership::Owned,
            )
        }))
    }

    /// New unsaved mutable document. A random id is used when none is given.
    pub fn create_document(&self, id: Option<&str>) -> BindingResult<HandleId> {
        let ptr = self.engine.document_create(id);
        Ok(self.handles.wrap(
            Resource::Document(DocumentRecord::new(ptr, None)),
            Ownership::Owned,
        ))
    }

    pub fn save_document(&self, db: HandleId, doc: HandleId) -> BindingResult<bool> {
        let ptr = self.handles.database(db)?.ensure_open()?;
        let doc = self.document_record(doc)?;
        self.engine.document_save(ptr, doc.ptr)?;
        Ok(true)
    }

    pub fn delete_document(&self, db: HandleId, doc: HandleId) -> BindingResult<bool> {
        let ptr = self.handles.database(db)?.ensure_open()?;
        let doc = self.document_record(doc)?;
        self.engine.document_delete(ptr, doc.ptr)?;
        Ok(true)
    }

    pub fn get_document_id(&self, doc: HandleId) -> BindingResult<String> {
        let doc = self.document_record(doc)?;
        Ok(self.engine.document_id(doc.ptr))
    }

    pub fn get_document_json(&self, doc: HandleId) -> BindingResult<String> {
        let doc = self.document_record(doc)?;
        Ok(self.engine.document_to_json(doc.ptr))
    }

    pub fn set_document_json(&self, doc: HandleId, json: &str) -> BindingResult<bool> {
        let doc = self.document_record(doc)?;
        self.engine.document_set_json(doc.ptr, json)?;
        Ok(true)
    }

    pub fn get_document_properties(&self, doc: HandleId) -> BindingResult<HostValue> {
        let doc = self.document_record(doc)?;
        Ok(dict_to_host(&self.engine.document_properties(doc.ptr)))
    }

    /// Replace the document's properties. Values the native model cannot
    /// hold (functions, symbols, `undefined`) are left out.
    pub fn set_document_properties(&self, doc: HandleId, properties: &HostValue) -> BindingResult<bool> {
        let properties = host_to_dict(properties)?;
        let doc = self.document_record(doc)?;
        self.engine.document_set_properties(doc.ptr, properties)?;
        Ok(true)
    }

    /// Deliver the document's id to `function` each time it changes.
    pub fn add_document_change_listener(
        &self,
        db: HandleId,
        doc_id: &str,
        function: Arc<dyn HostFunction<String>>,
    ) -> BindingResult<ListenerRegistration> {
        let ptr = self.handles.database(db)?.ensure_open()?;
        ListenerRegistration::register(
            ListenerKind::DocumentChange,
            function,
            self.engine.clone(),
            |dispatch| {
                self.engine.database_add_document_listener(
                    ptr,
                    doc_id,
                    Box::new(move |id: &str| {
                        dispatch.deliver(id.to_string());
                    }),
                )
            },
        )
    }

    /// A document record whose database, if any, is still open.
    pub(super) fn document_record(&self, doc: HandleId) -> BindingResult<DocumentRecord> {
        let record = self.handles.document(doc)?;
        ensure_owner_open(&record.database)?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BindingConfig;
    use crate::engine::memory::MemoryEngine;
    use crate::error::{codes, BindingError};

    fn binding() -> Binding {
        Binding::new(Arc::new(MemoryEngine::new()), BindingConfig::default())
    }

    #[test]
    fn missing_document_is_none() {
        let binding = binding();
        let db = binding.open_database("docs-missing", None).unwrap();
        assert_eq!(binding.get_document(db, "nope").unwrap(), None);
        assert_eq!(binding.get_mutable_document(db, "nope").unwrap(), None);
    }

    #[test]
    fn properties_round_trip_through_host_values() {
        let binding = binding();
        let db = binding.open_database("docs-props", None).unwrap();
        let doc = binding.create_document(Some("p1")).unwrap();
        let props = HostValue::object([
            ("name", HostValue::String("widget".into())),
            ("count", HostValue::Number(3.0)),
            ("price", HostValue::Number(2.5)),
            ("callback", HostValue::Function),
        ]);
        assert!(binding.set_document_properties(doc, &props).unwrap());
        assert!(binding.save_document(db, doc).unwrap());

        let saved = binding.get_document(db, "p1").unwrap().unwrap();
        let read = binding.get_document_properties(saved).unwrap();
        assert_eq!(read.get("name"), Some(&HostValue::String("widget".into())));
        assert_eq!(read.get("count"), Some(&HostValue::Number(3.0)));
        assert_eq!(read.get("price"), Some(&HostValue::Number(2.5)));
        assert_eq!(read.get("callback"), None);
        assert_eq!(binding.get_document_id(saved).unwrap(), "p1");
    }

    #[test]
    fn non_object_properties_are_type_errors() {
        let binding = binding();
        let doc = binding.create_document(None).unwrap();
        let err = binding
            .set_document_properties(doc, &HostValue::String("x".into()))
            .unwrap_err();
        assert!(err.is_type_error());
    }

    #[test]
    fn read_only_documents_reject_edits() {
        let binding = binding();
        let db = binding.open_database("docs-ro", None).unwrap();
        let doc = binding.create_document(Some("ro")).unwrap();
        binding.set_document_json(doc, r#"{"a":1}"#).unwrap();
        binding.save_document(db, doc).unwrap();

        let read = binding.get_document(db, "ro").unwrap().unwrap();
        let err = binding.set_document_json(read, r#"{"a":2}"#).unwrap_err();
        assert_eq!(err.native().map(|e| e.code), Some(codes::NOT_WRITEABLE));

        let editable = binding.get_mutable_document(db, "ro").unwrap().unwrap();
        assert!(binding.set_document_json(editable, r#"{"a":2}"#).unwrap());
        assert!(binding.save_document(db, editable).unwrap());
    }

    #[test]
    fn documents_of_a_closed_database_fail_fast() {
        let binding = binding();
        let db = binding.open_database("docs-closed", None).unwrap();
        let doc = binding.create_document(Some("x")).unwrap();
        binding.save_document(db, doc).unwrap();
        let read = binding.get_document(db, "x").unwrap().unwrap();

        binding.close_database(db).unwrap();
        assert_eq!(binding.get_document_json(read).unwrap_err(), BindingError::DatabaseClosed);
        assert_eq!(binding.get_document(db, "x").unwrap_err(), BindingError::DatabaseClosed);
        assert_eq!(binding.save_document(db, doc).unwrap_err(), BindingError::DatabaseClosed);
        // an unsaved document does not belong to any database
        assert!(binding.get_document_json(doc).is_ok());
    }

    #[test]
    fn deleted_documents_disappear() {
        let binding = binding();
        let db = binding.open_database("docs-delete", None).unwrap();
        let doc = binding.create_document(Some("d")).unwrap();
        binding.save_document(db, doc).unwrap();
        assert_eq!(binding.database_count(db).unwrap(), 1);

        let read = binding.get_document(db, "d").unwrap().unwrap();
        assert!(binding.delete_document(db, read).unwrap());
        assert_eq!(binding.get_document(db, "d").unwrap(), None);
        assert_eq!(binding.database_count(db).unwrap(), 0);
    }
}
