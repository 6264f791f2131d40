use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde_json::{Map, Value};
use uuid::Uuid;

use super::{Document, DocumentStore, Filter, MemoryDocumentStore, Query};
use crate::{
    config::StoreConfig,
    error::{AppError, AppResult},
};

/// Typed access to the document store. Every call is bounded by a timeout and
/// transient failures are retried with exponential backoff before surfacing
/// as `ServiceUnavailable`.
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn DocumentStore>,
    timeout: Duration,
    max_retries: u32,
    backoff: Duration,
}

impl Store {
    pub fn new(backend: Arc<dyn DocumentStore>, config: &StoreConfig) -> Self {
        Self {
            backend,
            timeout: config.timeout,
            max_retries: config.max_retries,
            backoff: config.backoff,
        }
    }

    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryDocumentStore::new()), &StoreConfig::default())
    }

    pub async fn get<T: Document>(&self, id: Uuid) -> AppResult<Option<T>> {
        let doc = self
            .run("get", || self.backend.get(T::COLLECTION, id))
            .await?;
        doc.map(serde_json::from_value)
            .transpose()
            .map_err(AppError::from)
    }

    /// Create-if-absent; false when the id is already taken.
    pub async fn insert<T: Document>(&self, doc: &T) -> AppResult<bool> {
        let value = serde_json::to_value(doc)?;
        self.run("insert", || {
            self.backend.insert(T::COLLECTION, doc.id(), value.clone())
        })
        .await
    }

    pub async fn put<T: Document>(&self, doc: &T) -> AppResult<()> {
        let value = serde_json::to_value(doc)?;
        self.run("put", || {
            self.backend.put(T::COLLECTION, doc.id(), value.clone())
        })
        .await
    }

    pub async fn patch<T: Document>(&self, id: Uuid, fields: Map<String, Value>) -> AppResult<bool> {
        self.run("patch", || {
            self.backend.patch(T::COLLECTION, id, fields.clone())
        })
        .await
    }

    pub async fn delete<T: Document>(&self, id: Uuid) -> AppResult<bool> {
        self.run("delete", || self.backend.delete(T::COLLECTION, id))
            .await
    }

    pub async fn delete_where<T: Document>(&self, filters: &[Filter]) -> AppResult<u64> {
        self.run("delete_where", || {
            self.backend.delete_where(T::COLLECTION, filters)
        })
        .await
    }

    pub async fn query<T: Document>(&self, query: &Query) -> AppResult<Vec<T>> {
        let docs = self
            .run("query", || self.backend.query(T::COLLECTION, query))
            .await?;
        docs.into_iter()
            .map(|doc| serde_json::from_value(doc).map_err(AppError::from))
            .collect()
    }

    async fn run<R, F, Fut>(&self, op: &'static str, call: F) -> AppResult<R>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = AppResult<R>>,
    {
        let mut attempt = 0;
        loop {
            let result = match tokio::time::timeout(self.timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(AppError::TransientStore(format!(
                    "{} timed out after {:?}",
                    op, self.timeout
                ))),
            };

            match result {
                Err(e) if e.is_retryable() => {
                    if attempt >= self.max_retries {
                        tracing::warn!(op, attempts = attempt + 1, error = %e, "Store retries exhausted");
                        return Err(AppError::ServiceUnavailable);
                    }
                    let delay = self.delay_for(attempt);
                    tracing::debug!(op, attempt, ?delay, error = %e, "Retrying store call");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.backoff.saturating_mul(1 << attempt.min(10));
        let jitter_ms = self.backoff.as_millis() as u64;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        base + jitter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::User;
    use crate::storage::Collection;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` calls of every operation, then delegates.
    struct FlakyStore {
        inner: MemoryDocumentStore,
        failures: u32,
        calls: AtomicU32,
    }

    impl FlakyStore {
        fn new(failures: u32) -> Self {
            Self {
                inner: MemoryDocumentStore::new(),
                failures,
                calls: AtomicU32::new(0),
            }
        }

        fn trip(&self) -> AppResult<()> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(AppError::TransientStore("connection reset".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl DocumentStore for FlakyStore {
        async fn get(&self, c: Collection, id: Uuid) -> AppResult<Option<Value>> {
            self.trip()?;
            self.inner.get(c, id).await
        }
        async fn insert(&self, c: Collection, id: Uuid, doc: Value) -> AppResult<bool> {
            self.trip()?;
            self.inner.insert(c, id, doc).await
        }
        async fn put(&self, c: Collection, id: Uuid, doc: Value) -> AppResult<()> {
            self.trip()?;
            self.inner.put(c, id, doc).await
        }
        async fn patch(&self, c: Collection, id: Uuid, f: Map<String, Value>) -> AppResult<bool> {
            self.trip()?;
            self.inner.patch(c, id, f).await
        }
        async fn delete(&self, c: Collection, id: Uuid) -> AppResult<bool> {
            self.trip()?;
            self.inner.delete(c, id).await
        }
        async fn delete_where(&self, c: Collection, f: &[Filter]) -> AppResult<u64> {
            self.trip()?;
            self.inner.delete_where(c, f).await
        }
        async fn query(&self, c: Collection, q: &Query) -> AppResult<Vec<Value>> {
            self.trip()?;
            self.inner.query(c, q).await
        }
    }

    fn config(max_retries: u32) -> StoreConfig {
        StoreConfig {
            max_retries,
            backoff: Duration::from_millis(1),
            timeout: Duration::from_millis(200),
            ..StoreConfig::default()
        }
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let store = Store::new(Arc::new(FlakyStore::new(2)), &config(3));
        let user = User::new("alice", "Alice").unwrap();

        store.put(&user).await.unwrap();
        let loaded: User = store.get(user.id).await.unwrap().unwrap();
        assert_eq!(loaded.username, "alice");
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_service_unavailable() {
        let store = Store::new(Arc::new(FlakyStore::new(10)), &config(2));
        let user = User::new("alice", "Alice").unwrap();

        let err = store.put(&user).await.unwrap_err();
        assert!(matches!(err, AppError::ServiceUnavailable));
    }

    struct SlowStore;

    #[async_trait]
    impl DocumentStore for SlowStore {
        async fn get(&self, _: Collection, _: Uuid) -> AppResult<Option<Value>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(None)
        }
        async fn insert(&self, _: Collection, _: Uuid, _: Value) -> AppResult<bool> {
            Ok(true)
        }
        async fn put(&self, _: Collection, _: Uuid, _: Value) -> AppResult<()> {
            Ok(())
        }
        async fn patch(&self, _: Collection, _: Uuid, _: Map<String, Value>) -> AppResult<bool> {
            Ok(true)
        }
        async fn delete(&self, _: Collection, _: Uuid) -> AppResult<bool> {
            Ok(true)
        }
        async fn delete_where(&self, _: Collection, _: &[Filter]) -> AppResult<u64> {
            Ok(0)
        }
        async fn query(&self, _: Collection, _: &Query) -> AppResult<Vec<Value>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_call_times_out() {
        let store = Store::new(Arc::new(SlowStore), &config(1));
        let err = store.get::<User>(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AppError::ServiceUnavailable));
    }

    #[tokio::test]
    async fn test_non_transient_errors_are_not_retried() {
        let flaky = Arc::new(FlakyStore::new(0));
        let store = Store::new(flaky.clone(), &config(3));

        // A document that does not deserialize as a User.
        flaky
            .inner
            .put(Collection::Users, Uuid::nil(), serde_json::json!({"bogus": true}))
            .await
            .unwrap();
        let err = store.get::<User>(Uuid::nil()).await.unwrap_err();
        assert!(matches!(err, AppError::Serialization(_)));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
    }
}
