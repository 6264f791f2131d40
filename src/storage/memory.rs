use std::collections::HashMap;
use std::cmp::Ordering;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde_json::{Map, Value};
use uuid::Uuid;

use super::{BlobBucket, BlobStore, Collection, DocumentStore, Filter, Query};
use crate::error::AppResult;

/// In-process document store for development and tests.
pub struct MemoryDocumentStore {
    collections: HashMap<Collection, DashMap<Uuid, Value>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self {
            collections: Collection::ALL
                .into_iter()
                .map(|c| (c, DashMap::new()))
                .collect(),
        }
    }

    fn collection(&self, collection: Collection) -> &DashMap<Uuid, Value> {
        // Every collection is created in `new`.
        &self.collections[&collection]
    }
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

fn sort_key(doc: &Value, field: &str) -> f64 {
    doc.get(field).and_then(Value::as_f64).unwrap_or(f64::MIN)
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, collection: Collection, id: Uuid) -> AppResult<Option<Value>> {
        Ok(self.collection(collection).get(&id).map(|doc| doc.value().clone()))
    }

    async fn insert(&self, collection: Collection, id: Uuid, doc: Value) -> AppResult<bool> {
        let docs = self.collection(collection);
        match docs.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(false),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(doc);
                Ok(true)
            }
        }
    }

    async fn put(&self, collection: Collection, id: Uuid, doc: Value) -> AppResult<()> {
        self.collection(collection).insert(id, doc);
        Ok(())
    }

    async fn patch(
        &self,
        collection: Collection,
        id: Uuid,
        fields: Map<String, Value>,
    ) -> AppResult<bool> {
        let Some(mut doc) = self.collection(collection).get_mut(&id) else {
            return Ok(false);
        };
        if let Value::Object(existing) = doc.value_mut() {
            existing.extend(fields);
        }
        Ok(true)
    }

    async fn delete(&self, collection: Collection, id: Uuid) -> AppResult<bool> {
        Ok(self.collection(collection).remove(&id).is_some())
    }

    async fn delete_where(&self, collection: Collection, filters: &[Filter]) -> AppResult<u64> {
        let mut removed = 0u64;
        self.collection(collection).retain(|_, doc| {
            let hit = filters.iter().all(|f| f.matches(doc));
            removed += hit as u64;
            !hit
        });
        Ok(removed)
    }

    async fn query(&self, collection: Collection, query: &Query) -> AppResult<Vec<Value>> {
        let mut matched: Vec<Value> = self
            .collection(collection)
            .iter()
            .filter(|doc| query.matches(doc.value()))
            .map(|doc| doc.value().clone())
            .collect();

        if let Some(field) = query.sort_desc {
            matched.sort_by(|a, b| {
                sort_key(b, field)
                    .partial_cmp(&sort_key(a, field))
                    .unwrap_or(Ordering::Equal)
            });
        }

        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(matched.into_iter().skip(query.offset).take(limit).collect())
    }
}

/// Keeps uploads in memory and hands out stable pseudo URLs.
pub struct MemoryBlobStore {
    base_url: String,
    blobs: DashMap<String, (Bytes, String)>,
}

impl MemoryBlobStore {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            blobs: DashMap::new(),
        }
    }

    pub fn get(&self, bucket: BlobBucket, key: &str) -> Option<(Bytes, String)> {
        self.blobs
            .get(&format!("{}/{}", bucket.as_str(), key))
            .map(|entry| entry.value().clone())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload(
        &self,
        bucket: BlobBucket,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> AppResult<String> {
        let path = format!("{}/{}", bucket.as_str(), key);
        self.blobs
            .insert(path.clone(), (data, content_type.to_string()));
        Ok(format!("{}/{}", self.base_url, path))
    }

    async fn delete(&self, bucket: BlobBucket, key: &str) -> AppResult<()> {
        self.blobs.remove(&format!("{}/{}", bucket.as_str(), key));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_insert_is_create_if_absent() {
        let store = MemoryDocumentStore::new();
        let id = Uuid::new_v4();

        assert!(store
            .insert(Collection::Users, id, json!({"username": "first"}))
            .await
            .unwrap());
        assert!(!store
            .insert(Collection::Users, id, json!({"username": "second"}))
            .await
            .unwrap());

        let doc = store.get(Collection::Users, id).await.unwrap().unwrap();
        assert_eq!(doc["username"], "first");
    }

    #[tokio::test]
    async fn test_patch_merges_top_level_fields() {
        let store = MemoryDocumentStore::new();
        let id = Uuid::new_v4();
        store
            .put(Collection::Users, id, json!({"username": "bob", "isOnline": false}))
            .await
            .unwrap();

        let mut fields = Map::new();
        fields.insert("isOnline".into(), json!(true));
        assert!(store.patch(Collection::Users, id, fields.clone()).await.unwrap());
        assert!(!store
            .patch(Collection::Users, Uuid::new_v4(), fields)
            .await
            .unwrap());

        let doc = store.get(Collection::Users, id).await.unwrap().unwrap();
        assert_eq!(doc, json!({"username": "bob", "isOnline": true}));
    }

    #[tokio::test]
    async fn test_query_sorts_and_pages() {
        let store = MemoryDocumentStore::new();
        let conv = Uuid::new_v4();
        for seq in 1..=5u64 {
            store
                .put(
                    Collection::Messages,
                    Uuid::new_v4(),
                    json!({"conversationId": conv, "sequence": seq}),
                )
                .await
                .unwrap();
        }
        store
            .put(
                Collection::Messages,
                Uuid::new_v4(),
                json!({"conversationId": Uuid::new_v4(), "sequence": 99}),
            )
            .await
            .unwrap();

        let query = Query::new()
            .filter(Filter::Eq("conversationId", json!(conv)))
            .sort_desc("sequence")
            .offset(1)
            .limit(2);
        let page = store.query(Collection::Messages, &query).await.unwrap();
        let seqs: Vec<u64> = page.iter().map(|d| d["sequence"].as_u64().unwrap()).collect();
        assert_eq!(seqs, vec![4, 3]);

        let removed = store
            .delete_where(Collection::Messages, &[Filter::Eq("conversationId", json!(conv))])
            .await
            .unwrap();
        assert_eq!(removed, 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_delete_where_counts_only_removed_rows_under_concurrent_inserts() {
        let store = Arc::new(MemoryDocumentStore::new());
        for _ in 0..50 {
            store
                .insert(Collection::Messages, Uuid::new_v4(), json!({"conversationId": "doomed"}))
                .await
                .unwrap();
        }

        let writer = {
            let store = store.clone();
            tokio::spawn(async move {
                for _ in 0..5000 {
                    store
                        .insert(Collection::Messages, Uuid::new_v4(), json!({"conversationId": "other"}))
                        .await
                        .unwrap();
                }
            })
        };

        let removed = store
            .delete_where(Collection::Messages, &[Filter::Eq("conversationId", json!("doomed"))])
            .await
            .unwrap();
        writer.await.unwrap();

        assert_eq!(removed, 50);
        let left = store
            .query(Collection::Messages, &Query::new().filter(Filter::Eq("conversationId", json!("doomed"))))
            .await
            .unwrap();
        assert!(left.is_empty());
    }

    #[tokio::test]
    async fn test_blob_upload_returns_url() {
        let blobs = MemoryBlobStore::new("memory://blobs/");
        let url = blobs
            .upload(BlobBucket::Attachments, "u/1.png", Bytes::from_static(b"png"), "image/png")
            .await
            .unwrap();
        assert_eq!(url, "memory://blobs/attachments/u/1.png");
        assert!(blobs.get(BlobBucket::Attachments, "u/1.png").is_some());

        blobs.delete(BlobBucket::Attachments, "u/1.png").await.unwrap();
        assert!(blobs.get(BlobBucket::Attachments, "u/1.png").is_none());
    }
}
