//! In-memory fakes for the object store (testing only)
//!
//! `MemoryObjectStore` keeps uploads in a map; `FailingObjectStore` rejects
//! every upload.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::publisher::{ObjectStore, PublishError};

/// Object store backed by a `HashMap<key, bytes>`. URLs are `memory://<key>`.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    /// Stored keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.objects.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        _content_type: &str,
    ) -> Result<String, PublishError> {
        self.objects.lock().unwrap().insert(key.to_string(), body);
        Ok(format!("memory://{key}"))
    }
}

/// Object store whose uploads always fail with HTTP 403.
#[derive(Debug, Default, Clone, Copy)]
pub struct FailingObjectStore;

#[async_trait]
impl ObjectStore for FailingObjectStore {
    async fn put(
        &self,
        key: &str,
        _body: Vec<u8>,
        _content_type: &str,
    ) -> Result<String, PublishError> {
        Err(PublishError::Rejected {
            key: key.to_string(),
            status: 403,
            body: "AccessDenied".to_string(),
        })
    }
}
