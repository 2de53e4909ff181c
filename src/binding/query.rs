use std::sync::Arc;

use super::Binding;
use crate::engine::QueryLanguage;
use crate::error::{BindingError, BindingResult};
use crate::handle::{HandleId, Ownership, QueryRecord, Resource};
use crate::host::HostFunction;
use crate::listener::{ListenerKind, ListenerRegistration};
use crate::value::{dict_from_json_str, dict_to_json, dict_to_json_string, Dict};

/// Render result rows as a JSON array string.
fn rows_to_json<I>(rows: I) -> String
where
    I: IntoIterator<Item = Dict>,
{
    let rows: Vec<serde_json::Value> = rows.into_iter().map(|row| dict_to_json(&row)).collect();
    serde_json::Value::Array(rows).to_string()
}

impl Binding {
    // =========================================================================
    // Queries
    // =========================================================================

    /// Compile a query. `language` is `CBLJSONLanguage` (0) or
    /// `CBLN1QLLanguage` (1).
    pub fn create_query(&self, db: HandleId, language: u32, text: &str) -> BindingResult<HandleId> {
        let language = QueryLanguage::from_raw(language).ok_or_else(|| {
            BindingError::invalid_argument(format!("unknown query language {}", language))
        })?;
        let database = self.handles.database(db)?;
        let ptr = database.ensure_open()?;
        let query = self.engine.query_create(ptr, language, text)?;
        Ok(self.handles.wrap(
            Resource::Query(QueryRecord {
                ptr: query,
                database,
            }),
            Ownership::Owned,
        ))
    }

    /// Run the query and return every row as a JSON array string. The
    /// native result set is drained and released before returning.
    pub fn execute_query(&self, query: HandleId) -> BindingResult<String> {
        let query = self.query_record(query)?;
        let results = self.engine.query_execute(query.ptr)?;
        Ok(rows_to_json(results))
    }

    pub fn explain_query(&self, query: HandleId) -> BindingResult<String> {
        let query = self.query_record(query)?;
        Ok(self.engine.query_explain(query.ptr))
    }

    /// Current parameters as a JSON object string.
    pub fn get_query_parameters(&self, query: HandleId) -> BindingResult<String> {
        let query = self.query_record(query)?;
        Ok(dict_to_json_string(&self.engine.query_parameters(query.ptr)))
    }

    pub fn set_query_parameters(&self, query: HandleId, json: &str) -> BindingResult<bool> {
        let query = self.query_record(query)?;
        let parameters = dict_from_json_str(json)?;
        self.engine.query_set_parameters(query.ptr, parameters);
        Ok(true)
    }

    /// Deliver the full result set, as a JSON array string, every time it
    /// changes. The first delivery carries the current results.
    pub fn add_query_change_listener(
        &self,
        query: HandleId,
        function: Arc<dyn HostFunction<String>>,
    ) -> BindingResult<ListenerRegistration> {
        let query = self.query_record(query)?;
        ListenerRegistration::register(
            ListenerKind::QueryChange,
            function,
            self.engine.clone(),
            |dispatch| {
                self.engine.query_add_change_listener(
                    query.ptr,
                    Box::new(move |rows: &[Dict]| {
                        dispatch.deliver(rows_to_json(rows.iter().cloned()));
                    }),
                )
            },
        )
    }

    fn query_record(&self, query: HandleId) -> BindingResult<QueryRecord> {
        let record = self.handles.query(query)?;
        record.database.ensure_open()?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::{JSON_LANGUAGE, N1QL_LANGUAGE};
    use crate::config::BindingConfig;
    use crate::engine::memory::MemoryEngine;
    use crate::error::codes;
    use serde_json::json;

    fn seeded() -> (Binding, HandleId) {
        let binding = Binding::new(Arc::new(MemoryEngine::new()), BindingConfig::default());
        let db = binding.open_database("query-tests", None).unwrap();
        for (id, json) in [
            ("a", r#"{"type":"fruit","name":"apple","qty":3}"#),
            ("b", r#"{"type":"fruit","name":"banana","qty":12}"#),
            ("c", r#"{"type":"veg","name":"carrot","qty":7}"#),
        ] {
            let doc = binding.create_document(Some(id)).unwrap();
            binding.set_document_json(doc, json).unwrap();
            binding.save_document(db, doc).unwrap();
            binding.release_handle(doc);
        }
        (binding, db)
    }

    fn rows(binding: &Binding, query: HandleId) -> serde_json::Value {
        serde_json::from_str(&binding.execute_query(query).unwrap()).unwrap()
    }

    #[test]
    fn n1ql_with_parameters() {
        let (binding, db) = seeded();
        let query = binding
            .create_query(
                db,
                N1QL_LANGUAGE,
                "SELECT name FROM _ WHERE type = $type ORDER BY name DESC",
            )
            .unwrap();
        binding.set_query_parameters(query, r#"{"type":"fruit"}"#).unwrap();
        assert_eq!(
            rows(&binding, query),
            json!([{"name": "banana"}, {"name": "apple"}])
        );
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&binding.get_query_parameters(query).unwrap())
                .unwrap(),
            json!({"type": "fruit"})
        );
    }

    #[test]
    fn json_language_query() {
        let (binding, db) = seeded();
        let query = binding
            .create_query(
                db,
                JSON_LANGUAGE,
                r#"{"WHAT":[[".name"]],"WHERE":[">",[".qty"],5],"ORDER_BY":[[".qty"]]}"#,
            )
            .unwrap();
        assert_eq!(
            rows(&binding, query),
            json!([{"name": "carrot"}, {"name": "banana"}])
        );
        assert!(!binding.explain_query(query).unwrap().is_empty());
    }

    #[test]
    fn bad_queries_surface_native_errors() {
        let (binding, db) = seeded();
        let err = binding.create_query(db, N1QL_LANGUAGE, "SELEKT nothing").unwrap_err();
        assert_eq!(err.native().map(|e| e.code), Some(codes::INVALID_QUERY));

        let err = binding.create_query(db, 7, "SELECT * FROM _").unwrap_err();
        assert!(err.is_type_error());
    }

    #[test]
    fn queries_fail_fast_after_close() {
        let (binding, db) = seeded();
        let query = binding
            .create_query(db, N1QL_LANGUAGE, "SELECT * FROM _")
            .unwrap();
        binding.close_database(db).unwrap();
        assert_eq!(
            binding.execute_query(query).unwrap_err(),
            BindingError::DatabaseClosed
        );
        assert_eq!(
            binding
                .create_query(db, N1QL_LANGUAGE, "SELECT * FROM _")
                .unwrap_err(),
            BindingError::DatabaseClosed
        );
    }
}
