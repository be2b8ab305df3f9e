//! Object store adapter.
//!
//! The gateway talks to its durable store only through the [`ObjectStore`]
//! trait.  Failures come back as a closed set of [`StoreError`] kinds so the
//! HTTP layer can pick a status code without inspecting error names.

pub mod memory;
pub mod presigned;
pub mod s3;

use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use bytes::Bytes;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object not found")]
    NotFound,
    /// A conditional write found the key already taken.
    #[error("object already exists")]
    AlreadyExists,
    #[error("access to the object was denied by the store")]
    Forbidden,
    #[error("{0} is not supported by this store")]
    Unsupported(&'static str),
    #[error(transparent)]
    Upstream(#[from] anyhow::Error),
}

// ---------------------------------------------------------------------------
// Objects
// ---------------------------------------------------------------------------

/// An artifact about to be written.
#[derive(Debug, Clone)]
pub struct NewObject {
    pub body: Bytes,
    pub content_type: Option<String>,
    /// Fail with [`StoreError::AlreadyExists`] instead of replacing an
    /// existing object.
    pub if_absent: bool,
}

/// An artifact read back from the store.
pub struct StoredObject {
    pub body: Body,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Probe for `key` without fetching its body.
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Write `object` under `key` in a single request.
    async fn put(&self, key: &str, object: NewObject) -> Result<(), StoreError>;

    /// Open `key` for reading.
    async fn get(&self, key: &str) -> Result<StoredObject, StoreError>;

    /// Issue a URL that grants GET access to `key` for `ttl`.
    async fn presign_read(&self, key: &str, ttl: Duration) -> Result<String, StoreError>;
}
