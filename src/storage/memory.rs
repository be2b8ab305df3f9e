//! In-memory object store.
//!
//! Backs `storage.backend: memory` for local runs and the router tests.
//! Nothing is persisted and presigned URLs are not available, so downloads
//! always go through [`ObjectStore::get`].

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use bytes::Bytes;
use tokio::sync::RwLock;
use tracing::debug;

use super::{NewObject, ObjectStore, StoreError, StoredObject};

struct Entry {
    body: Bytes,
    content_type: Option<String>,
}

#[derive(Default)]
pub struct MemoryStore {
    objects: RwLock<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.objects.read().await.contains_key(key))
    }

    async fn put(&self, key: &str, object: NewObject) -> Result<(), StoreError> {
        // Check and insert under one write lock so `if_absent` is atomic.
        let mut objects = self.objects.write().await;
        if object.if_absent && objects.contains_key(key) {
            return Err(StoreError::AlreadyExists);
        }
        debug!(%key, bytes = object.body.len(), "object stored in memory");
        objects.insert(
            key.to_owned(),
            Entry {
                body: object.body,
                content_type: object.content_type,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<StoredObject, StoreError> {
        let objects = self.objects.read().await;
        let entry = objects.get(key).ok_or(StoreError::NotFound)?;
        Ok(StoredObject {
            body: Body::from(entry.body.clone()),
            content_type: entry.content_type.clone(),
            content_length: Some(entry.body.len() as u64),
        })
    }

    async fn presign_read(&self, _key: &str, _ttl: Duration) -> Result<String, StoreError> {
        Err(StoreError::Unsupported("presigned URLs"))
    }
}
