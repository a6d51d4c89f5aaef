//! In-memory object storage, used by the test suite.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;

use super::{ObjectStore, StoreError};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    storage_class: Option<String>,
}

/// [`ObjectStore`] keeping everything in a mutex-guarded map.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, StoredObject>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Storage class recorded for `key`, if the object exists.
    pub fn storage_class_of(&self, key: &str) -> Option<Option<String>> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .map(|object| object.storage_class.clone())
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put(
        &self,
        key: &str,
        data: Bytes,
        storage_class: Option<&str>,
    ) -> Result<(), StoreError> {
        self.objects.lock().unwrap().insert(
            key.to_string(),
            StoredObject {
                data,
                storage_class: storage_class.map(str::to_string),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes, StoreError> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .map(|object| object.data.clone())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_round_trip() {
        let store = MemoryStore::new();
        store
            .put("a/0", Bytes::from_static(b"hello"), Some("STANDARD"))
            .await
            .unwrap();

        assert_eq!(store.get("a/0").await.unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(
            store.storage_class_of("a/0"),
            Some(Some("STANDARD".to_string()))
        );
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.get("nope").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn list_respects_prefix() {
        let store = MemoryStore::new();
        for key in ["d/a/0", "d/a/1", "d/b/0", "other/0"] {
            store.put(key, Bytes::new(), None).await.unwrap();
        }

        assert_eq!(store.list("d/a/").await.unwrap(), vec!["d/a/0", "d/a/1"]);
        assert_eq!(store.list("d/").await.unwrap().len(), 3);
    }
}
