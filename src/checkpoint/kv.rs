//! Metadata bucket abstraction.
//!
//! The real metadata bucket is a durable KV store with CAS shared by every
//! node; this trait hides it so tests and simulation runs use the in-memory
//! implementation. All writes go through CAS; a node only writes blobs of
//! vbs it believes it owns, so a CAS failure means a racing ex-owner and is
//! retried after a re-read.

use ahash::AHashMap;
use parking_lot::RwLock;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Compare-and-swap token returned by reads and successful writes.
pub type Cas = u64;

/// Error type for metadata bucket operations.
#[derive(Debug)]
pub enum MetadataError {
    /// Key does not exist.
    NotFound(String),
    /// CAS supplied to an upsert no longer matches.
    CasMismatch(String),
    /// Transport-level failure; retried by callers with fixed backoff.
    Transient(String),
    /// Stored bytes failed to decode.
    Decode(String),
}

impl std::fmt::Display for MetadataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetadataError::NotFound(key) => write!(f, "key not found: {}", key),
            MetadataError::CasMismatch(key) => write!(f, "cas mismatch on key: {}", key),
            MetadataError::Transient(msg) => write!(f, "transient metadata error: {}", msg),
            MetadataError::Decode(msg) => write!(f, "metadata decode error: {}", msg),
        }
    }
}

impl std::error::Error for MetadataError {}

impl From<serde_json::Error> for MetadataError {
    fn from(e: serde_json::Error) -> Self {
        MetadataError::Decode(e.to_string())
    }
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Durable KV metadata store with CAS.
pub trait MetadataStore: Send + Sync + 'static {
    /// Read a key; returns the value and its current CAS.
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(Vec<u8>, Cas), MetadataError>>;

    /// Create or overwrite a key. With `Some(cas)` the write only succeeds
    /// if the stored CAS still matches; `None` is a blind set.
    fn upsert<'a>(
        &'a self,
        key: &'a str,
        value: &'a [u8],
        cas: Option<Cas>,
    ) -> BoxFuture<'a, Result<Cas, MetadataError>>;

    /// Delete a key; deleting a missing key is not an error.
    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), MetadataError>>;

    /// List keys with the given prefix, sorted ascending.
    fn list_prefix<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, Result<Vec<String>, MetadataError>>;
}

/// In-memory metadata store for tests and simulation runs.
///
/// CAS tokens are allocated from one counter so no two writes ever share a
/// token, matching the bucket's semantics.
#[derive(Debug, Default)]
pub struct InMemoryMetadataStore {
    data: RwLock<AHashMap<String, (Vec<u8>, Cas)>>,
    next_cas: AtomicU64,
}

impl InMemoryMetadataStore {
    pub fn new() -> Arc<Self> {
        Arc::new(InMemoryMetadataStore {
            data: RwLock::new(AHashMap::new()),
            next_cas: AtomicU64::new(1),
        })
    }

    fn alloc_cas(&self) -> Cas {
        self.next_cas.fetch_add(1, Ordering::SeqCst)
    }

    /// Number of stored keys (test helper).
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl MetadataStore for InMemoryMetadataStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(Vec<u8>, Cas), MetadataError>> {
        Box::pin(async move {
            self.data
                .read()
                .get(key)
                .cloned()
                .ok_or_else(|| MetadataError::NotFound(key.to_string()))
        })
    }

    fn upsert<'a>(
        &'a self,
        key: &'a str,
        value: &'a [u8],
        cas: Option<Cas>,
    ) -> BoxFuture<'a, Result<Cas, MetadataError>> {
        Box::pin(async move {
            let mut data = self.data.write();
            if let Some(expected) = cas {
                match data.get(key) {
                    Some((_, current)) if *current == expected => {}
                    Some(_) => return Err(MetadataError::CasMismatch(key.to_string())),
                    // CAS 0 means "create only if absent".
                    None if expected == 0 => {}
                    None => return Err(MetadataError::NotFound(key.to_string())),
                }
            }
            let new_cas = self.alloc_cas();
            data.insert(key.to_string(), (value.to_vec(), new_cas));
            Ok(new_cas)
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), MetadataError>> {
        Box::pin(async move {
            self.data.write().remove(key);
            Ok(())
        })
    }

    fn list_prefix<'a>(
        &'a self,
        prefix: &'a str,
    ) -> BoxFuture<'a, Result<Vec<String>, MetadataError>> {
        Box::pin(async move {
            let mut keys: Vec<String> = self
                .data
                .read()
                .keys()
                .filter(|key| key.starts_with(prefix))
                .cloned()
                .collect();
            keys.sort();
            Ok(keys)
        })
    }
}

/// Carves a private keyspace out of a shared store by key prefix.
///
/// Each handler's timer entries live in their own scope so two handlers
/// never collide while still sharing one durable bucket.
pub struct ScopedMetadataStore {
    inner: Arc<dyn MetadataStore>,
    scope: String,
}

impl ScopedMetadataStore {
    pub fn new(inner: Arc<dyn MetadataStore>, scope: &str) -> Arc<Self> {
        Arc::new(ScopedMetadataStore {
            inner,
            scope: format!("{}|", scope),
        })
    }

    fn scoped(&self, key: &str) -> String {
        format!("{}{}", self.scope, key)
    }
}

impl MetadataStore for ScopedMetadataStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(Vec<u8>, Cas), MetadataError>> {
        Box::pin(async move { self.inner.get(&self.scoped(key)).await })
    }

    fn upsert<'a>(
        &'a self,
        key: &'a str,
        value: &'a [u8],
        cas: Option<Cas>,
    ) -> BoxFuture<'a, Result<Cas, MetadataError>> {
        Box::pin(async move { self.inner.upsert(&self.scoped(key), value, cas).await })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), MetadataError>> {
        Box::pin(async move { self.inner.delete(&self.scoped(key)).await })
    }

    fn list_prefix<'a>(
        &'a self,
        prefix: &'a str,
    ) -> BoxFuture<'a, Result<Vec<String>, MetadataError>> {
        Box::pin(async move {
            let keys = self.inner.list_prefix(&self.scoped(prefix)).await?;
            Ok(keys
                .into_iter()
                .filter_map(|key| key.strip_prefix(&self.scope).map(str::to_string))
                .collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn blind_upsert_and_get() {
        let store = InMemoryMetadataStore::new();
        let cas = store.upsert("k", b"v1", None).await.unwrap();
        let (value, got_cas) = store.get("k").await.unwrap();
        assert_eq!(value, b"v1");
        assert_eq!(got_cas, cas);
    }

    #[tokio::test]
    async fn cas_mismatch_rejected() {
        let store = InMemoryMetadataStore::new();
        let cas = store.upsert("k", b"v1", None).await.unwrap();
        let newer = store.upsert("k", b"v2", Some(cas)).await.unwrap();
        assert!(newer > cas);
        let err = store.upsert("k", b"v3", Some(cas)).await.unwrap_err();
        assert!(matches!(err, MetadataError::CasMismatch(_)));
        let (value, _) = store.get("k").await.unwrap();
        assert_eq!(value, b"v2");
    }

    #[tokio::test]
    async fn create_only_if_absent() {
        let store = InMemoryMetadataStore::new();
        store.upsert("k", b"v1", Some(0)).await.unwrap();
        let err = store.upsert("k", b"v2", Some(0)).await.unwrap_err();
        assert!(matches!(err, MetadataError::CasMismatch(_)));
    }

    #[tokio::test]
    async fn list_prefix_sorted() {
        let store = InMemoryMetadataStore::new();
        for key in ["app::vb::2", "app::vb::0", "timer:1:x:y", "app::vb::1"] {
            store.upsert(key, b"{}", None).await.unwrap();
        }
        let keys = store.list_prefix("app::vb::").await.unwrap();
        assert_eq!(keys, vec!["app::vb::0", "app::vb::1", "app::vb::2"]);
    }

    #[tokio::test]
    async fn scoped_stores_do_not_collide() {
        let shared = InMemoryMetadataStore::new();
        let alpha = ScopedMetadataStore::new(shared.clone(), "alpha");
        let beta = ScopedMetadataStore::new(shared.clone(), "beta");

        alpha.upsert("timer:1:x", b"a", None).await.unwrap();
        beta.upsert("timer:1:x", b"b", None).await.unwrap();

        let (value, _) = alpha.get("timer:1:x").await.unwrap();
        assert_eq!(value, b"a");
        let keys = beta.list_prefix("timer:").await.unwrap();
        assert_eq!(keys, vec!["timer:1:x"]);
        assert_eq!(shared.len(), 2);
    }
}
