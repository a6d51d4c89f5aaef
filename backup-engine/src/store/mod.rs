//! Object storage backends.
//!
//! The engine talks to remote storage through the [`ObjectStore`] trait so
//! the transfer code is independent of any particular provider.

pub mod memory;
pub mod s3;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("storage request failed: {0}")]
    Request(String),
}

/// Minimal contract the engine needs from a remote store: opaque string
/// keys, whole-object puts and gets, prefix listing.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store one object. The storage class is forwarded verbatim when the
    /// backend supports one.
    async fn put(
        &self,
        key: &str,
        data: Bytes,
        storage_class: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Fetch a whole object.
    async fn get(&self, key: &str) -> Result<Bytes, StoreError>;

    /// All keys starting with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}
