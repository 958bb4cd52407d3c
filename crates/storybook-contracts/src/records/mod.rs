mod cache_entry;
mod document_store;
mod job_record;

pub use cache_entry::CacheEntryRecord;
pub use document_store::JsonDocumentStore;
pub use job_record::{write_job_record, JobRecord, TaskRecord};
