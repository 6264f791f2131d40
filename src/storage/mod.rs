pub mod blob;
pub mod document;
pub mod memory;
pub mod minio;
pub mod postgres;
pub mod store;

pub use blob::{extension_for, BlobBucket, BlobStore};
pub use document::{Collection, Document, DocumentStore, Filter, Query};
pub use memory::{MemoryBlobStore, MemoryDocumentStore};
pub use minio::MinioClient;
pub use postgres::PgDocumentStore;
pub use store::Store;
