use std::sync::Arc;

use super::Binding;
use crate::error::{BindingError, BindingResult};
use crate::handle::{ensure_owner_open, BlobRecord, HandleId, Ownership, Resource, StreamRecord};
use crate::value::{dict_to_host, host_to_dict, HostValue};

impl Binding {
    // =========================================================================
    // Blobs
    // =========================================================================

    pub fn create_blob_with_data(&self, content_type: &str, data: &[u8]) -> BindingResult<HandleId> {
        let ptr = self.engine.blob_create_with_data(content_type, data);
        Ok(self.wrap_blob(BlobRecord {
            ptr,
            database: None,
            owner: None,
        }))
    }

    /// Turn a write stream's content into a blob. The stream is consumed and
    /// cannot be written or closed afterwards.
    pub fn create_blob_with_stream(&self, content_type: &str, stream: HandleId) -> BindingResult<HandleId> {
        let stream = self.handles.write_stream(stream)?;
        let ptr = stream.ensure_open()?;
        if !stream.take_open() {
            return Err(BindingError::StreamClosed);
        }
        let blob = self.engine.blob_create_with_stream(content_type, ptr)?;
        Ok(self.wrap_blob(BlobRecord {
            ptr: blob,
            database: stream.database.clone(),
            owner: None,
        }))
    }

    pub fn blob_content(&self, blob: HandleId) -> BindingResult<Vec<u8>> {
        let blob = self.blob_record(blob)?;
        Ok(self.engine.blob_content(blob.ptr)?)
    }

    pub fn blob_content_type(&self, blob: HandleId) -> BindingResult<String> {
        let blob = self.blob_record(blob)?;
        Ok(self.engine.blob_content_type(blob.ptr))
    }

    pub fn blob_create_json(&self, blob: HandleId) -> BindingResult<String> {
        let blob = self.blob_record(blob)?;
        Ok(self.engine.blob_to_json(blob.ptr))
    }

    /// The blob's metadata dictionary (`@type`, `content_type`, `digest`,
    /// `length`).
    pub fn blob_properties(&self, blob: HandleId) -> BindingResult<HostValue> {
        let blob = self.blob_record(blob)?;
        Ok(dict_to_host(&self.engine.blob_properties(blob.ptr)))
    }

    pub fn blob_digest(&self, blob: HandleId) -> BindingResult<String> {
        let blob = self.blob_record(blob)?;
        Ok(self.engine.blob_digest(blob.ptr))
    }

    pub fn blob_equals(&self, blob: HandleId, other: HandleId) -> BindingResult<bool> {
        let a = self.blob_record(blob)?;
        let b = self.blob_record(other)?;
        Ok(self.engine.blob_equals(a.ptr, b.ptr))
    }

    pub fn blob_length(&self, blob: HandleId) -> BindingResult<u64> {
        let blob = self.blob_record(blob)?;
        Ok(self.engine.blob_length(blob.ptr))
    }

    // =========================================================================
    // Blob streams
    // =========================================================================

    pub fn open_blob_content_stream(&self, blob: HandleId) -> BindingResult<HandleId> {
        let blob = self.blob_record(blob)?;
        let ptr = self.engine.blob_open_content_stream(blob.ptr)?;
        Ok(self.handles.wrap(
            Resource::ReadStream(Arc::new(StreamRecord::new(ptr, blob.database))),
            Ownership::Owned,
        ))
    }

    /// Read up to `max_length` bytes; an empty buffer means end of stream.
    /// A `max_length` of 0 reads one chunk of the configured size.
    pub fn read_blob_reader(&self, stream: HandleId, max_length: usize) -> BindingResult<Vec<u8>> {
        let ptr = self.handles.read_stream(stream)?.ensure_open()?;
        let max_length = match max_length {
            0 => self.config.read_chunk_size,
            n => n,
        };
        Ok(self.engine.read_stream_read(ptr, max_length)?)
    }

    /// Returns `false` if the stream was already closed.
    pub fn close_blob_reader(&self, stream: HandleId) -> BindingResult<bool> {
        let stream = self.handles.read_stream(stream)?;
        if !stream.take_open() {
            return Ok(false);
        }
        self.engine.read_stream_close(stream.ptr);
        Ok(true)
    }

    pub fn create_blob_writer(&self, db: HandleId) -> BindingResult<HandleId> {
        let database = self.handles.database(db)?;
        let ptr = self.engine.write_stream_create(database.ensure_open()?)?;
        Ok(self.handles.wrap(
            Resource::WriteStream(Arc::new(StreamRecord::new(ptr, Some(database)))),
            Ownership::Owned,
        ))
    }

    pub fn write_blob_writer(&self, stream: HandleId, data: &[u8]) -> BindingResult<bool> {
        let ptr = self.handles.write_stream(stream)?.ensure_open()?;
        self.engine.write_stream_write(ptr, data)?;
        Ok(true)
    }

    /// Discard a write stream without making a blob from it. Returns `false`
    /// if it was already closed or consumed.
    pub fn close_blob_writer(&self, stream: HandleId) -> BindingResult<bool> {
        let stream = self.handles.write_stream(stream)?;
        if !stream.take_open() {
            return Ok(false);
        }
        self.engine.write_stream_close(stream.ptr);
        Ok(true)
    }

    // =========================================================================
    // Blobs in databases and documents
    // =========================================================================

    /// Look up a stored blob by its metadata. `None` if the database does
    /// not hold its content.
    pub fn database_get_blob(&self, db: HandleId, properties: &HostValue) -> BindingResult<Option<HandleId>> {
        let properties = host_to_dict(properties)?;
        let database = self.handles.database(db)?;
        let blob = self.engine.database_get_blob(database.ensure_open()?, &properties)?;
        Ok(blob.map(|ptr| {
            self.wrap_blob(BlobRecord {
                ptr,
                database: Some(database),
                owner: None,
            })
        }))
    }

    pub fn database_save_blob(&self, db: HandleId, blob: HandleId) -> BindingResult<bool> {
        let ptr = self.handles.database(db)?.ensure_open()?;
        let blob = self.blob_record(blob)?;
        self.engine.database_save_blob(ptr, blob.ptr)?;
        Ok(true)
    }

    /// The blob stored in a document property. The document keeps
    /// ownership, so the returned handle is borrowed.
    pub fn document_get_blob(&self, doc: HandleId, property: &str) -> BindingResult<Option<HandleId>> {
        let doc = self.document_record(doc)?;
        Ok(self.engine.document_get_blob(doc.ptr, property).map(|ptr| {
            self.handles.wrap(
                Resource::Blob(BlobRecord {
                    ptr,
                    database: doc.database,
                    owner: Some(doc.liveness),
                }),
                Ownership::Borrowed,
            )
        }))
    }

    pub fn document_is_blob(&self, doc: HandleId, property: &str) -> BindingResult<bool> {
        let doc = self.document_record(doc)?;
        Ok(self.engine.document_is_blob(doc.ptr, property))
    }

    pub fn document_set_blob(&self, doc: HandleId, property: &str, blob: HandleId) -> BindingResult<bool> {
        let doc = self.document_record(doc)?;
        let blob = self.blob_record(blob)?;
        self.engine.document_set_blob(doc.ptr, property, blob.ptr)?;
        Ok(true)
    }

    fn wrap_blob(&self, record: BlobRecord) -> HandleId {
        self.handles.wrap(Resource::Blob(record), Ownership::Owned)
    }

    fn blob_record(&self, blob: HandleId) -> BindingResult<BlobRecord> {
        let record = self.handles.blob(blob)?;
        ensure_owner_open(&record.database)?;
        Ok(record)
    }
}
