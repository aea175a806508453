//! Object-store access behind a narrow trait, so the lister and the
//! source adapter can run against S3 or an in-memory double.

use crate::error::{QfsError, Result};
use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_smithy_types::byte_stream::ByteStream;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncRead;

/// One listed object. `last_modified` is the store's own timestamp in
/// milliseconds; it is a cache-validation hint, never ground truth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size: i64,
    pub last_modified: i64,
}

#[derive(Debug, Clone)]
pub struct ListPage {
    pub objects: Vec<ObjectMeta>,
    pub truncated: bool,
}

/// What a `put` carries: directory and symlink objects have empty bodies,
/// file objects stream from disk.
pub enum PutBody {
    Empty,
    File(PathBuf),
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// URI for error messages.
    fn uri(&self, key: &str) -> String;

    /// One page of keys strictly greater than `start_after`, in sorted
    /// order, restricted to `prefix`.
    async fn list_page(&self, prefix: &str, start_after: &str, max_keys: usize)
        -> Result<ListPage>;

    async fn get(&self, key: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>>;

    async fn put(&self, key: &str, body: PutBody) -> Result<()>;

    /// Deleting an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// List-objects is the one retried RPC: 3 tries, exponential backoff
/// starting at one second.
pub async fn list_page_with_retry(
    store: &dyn ObjectStore,
    prefix: &str,
    start_after: &str,
    max_keys: usize,
) -> Result<ListPage> {
    let mut delay = Duration::from_secs(1);
    let mut last_err = None;
    for attempt in 0..3 {
        if attempt > 0 {
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
        match store.list_page(prefix, start_after, max_keys).await {
            Ok(page) => return Ok(page),
            Err(e) => {
                tracing::warn!(attempt, error = %e, "list objects failed");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| QfsError::Other("list retries exhausted".to_string())))
}

/// S3 (or S3-compatible) bucket.
pub struct S3Store {
    client: Client,
    bucket: String,
}

impl S3Store {
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Build a client from the ambient AWS configuration, with optional
    /// region and custom endpoint (Cloudflare R2, MinIO, and friends need
    /// path-style addressing).
    pub async fn connect(
        bucket: impl Into<String>,
        region: Option<String>,
        endpoint: Option<String>,
    ) -> Result<Self> {
        let config = if let Some(r) = region {
            aws_config::from_env()
                .region(aws_sdk_s3::config::Region::new(r))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        let builder = aws_sdk_s3::config::Builder::from(&config);
        let s3_config = if let Some(ep) = endpoint {
            builder.endpoint_url(ep).force_path_style(true).build()
        } else {
            builder.build()
        };

        Ok(Self::new(Client::from_conf(s3_config), bucket))
    }

    fn err(&self, op: &str, key: &str, e: impl std::fmt::Display) -> QfsError {
        QfsError::store(op, self.uri(key), e.to_string())
    }
}

fn datetime_millis(dt: &aws_smithy_types::DateTime) -> i64 {
    dt.secs() * 1000 + i64::from(dt.subsec_nanos()) / 1_000_000
}

#[async_trait]
impl ObjectStore for S3Store {
    fn uri(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, key)
    }

    async fn list_page(
        &self,
        prefix: &str,
        start_after: &str,
        max_keys: usize,
    ) -> Result<ListPage> {
        let mut request = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .max_keys(max_keys as i32);
        if !prefix.is_empty() {
            request = request.prefix(prefix);
        }
        if !start_after.is_empty() {
            request = request.start_after(start_after);
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.err("list-objects", prefix, e))?;

        let mut objects = Vec::new();
        for obj in response.contents() {
            let key = obj
                .key()
                .ok_or_else(|| self.err("list-objects", prefix, "object missing key"))?;
            objects.push(ObjectMeta {
                key: key.to_string(),
                size: obj.size().unwrap_or(0),
                last_modified: obj.last_modified().map(datetime_millis).unwrap_or(0),
            });
        }
        Ok(ListPage {
            objects,
            truncated: response.is_truncated().unwrap_or(false),
        })
    }

    async fn get(&self, key: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| self.err("get-object", key, e))?;
        Ok(Box::new(response.body.into_async_read()))
    }

    async fn put(&self, key: &str, body: PutBody) -> Result<()> {
        let body = match body {
            PutBody::Empty => ByteStream::from_static(b""),
            PutBody::File(path) => ByteStream::from_path(&path)
                .await
                .map_err(|e| self.err("put-object", key, e))?,
        };
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|e| self.err("put-object", key, e))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| self.err("delete-object", key, e))?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod memory {
    //! In-memory sorted store for exercising the lister and the source
    //! adapter without a network.

    use super::*;
    use std::collections::BTreeMap;
    use std::io::Cursor;
    use std::ops::Bound;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    struct MemObject {
        data: Vec<u8>,
        last_modified: i64,
    }

    #[derive(Default)]
    pub(crate) struct MemoryStore {
        objects: Mutex<BTreeMap<String, MemObject>>,
        /// Fail this many upcoming list calls, for retry testing.
        fail_lists: AtomicUsize,
        list_calls: AtomicUsize,
    }

    impl MemoryStore {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn insert(&self, key: &str, data: &[u8]) {
            self.insert_at(key, data, 1_000_000);
        }

        pub(crate) fn insert_at(&self, key: &str, data: &[u8], last_modified: i64) {
            self.objects.lock().unwrap().insert(
                key.to_string(),
                MemObject {
                    data: data.to_vec(),
                    last_modified,
                },
            );
        }

        pub(crate) fn keys(&self) -> Vec<String> {
            self.objects.lock().unwrap().keys().cloned().collect()
        }

        pub(crate) fn contains(&self, key: &str) -> bool {
            self.objects.lock().unwrap().contains_key(key)
        }

        pub(crate) fn fail_next_lists(&self, n: usize) {
            self.fail_lists.store(n, Ordering::SeqCst);
        }

        pub(crate) fn list_calls(&self) -> usize {
            self.list_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ObjectStore for MemoryStore {
        fn uri(&self, key: &str) -> String {
            format!("s3://memory/{}", key)
        }

        async fn list_page(
            &self,
            prefix: &str,
            start_after: &str,
            max_keys: usize,
        ) -> Result<ListPage> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            if self
                .fail_lists
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(QfsError::store(
                    "list-objects",
                    self.uri(prefix),
                    "injected failure",
                ));
            }

            let objects = self.objects.lock().unwrap();
            let mut page = Vec::new();
            let mut truncated = false;
            for (key, obj) in objects
                .range::<String, _>((Bound::Excluded(start_after.to_string()), Bound::Unbounded))
            {
                if !key.starts_with(prefix) {
                    // Keys are sorted; with a non-empty prefix we may skip
                    // some before the prefix range and stop after it.
                    if !prefix.is_empty() && key.as_str() > prefix {
                        break;
                    }
                    continue;
                }
                if page.len() == max_keys {
                    truncated = true;
                    break;
                }
                page.push(ObjectMeta {
                    key: key.clone(),
                    size: obj.data.len() as i64,
                    last_modified: obj.last_modified,
                });
            }
            Ok(ListPage {
                objects: page,
                truncated,
            })
        }

        async fn get(&self, key: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
            let objects = self.objects.lock().unwrap();
            match objects.get(key) {
                Some(obj) => Ok(Box::new(Cursor::new(obj.data.clone()))),
                None => Err(QfsError::NotFound {
                    path: self.uri(key),
                }),
            }
        }

        async fn put(&self, key: &str, body: PutBody) -> Result<()> {
            let data = match body {
                PutBody::Empty => Vec::new(),
                PutBody::File(path) => tokio::fs::read(&path)
                    .await
                    .map_err(|e| QfsError::path_io(path.display().to_string(), e))?,
            };
            self.insert_at(key, &data, 2_000_000);
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.objects.lock().unwrap().remove(key);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_memory_list_pagination() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store.insert(&format!("p/k{}", i), b"x");
        }
        store.insert("other/k", b"x");

        let page = store.list_page("p/", "", 3).await.unwrap();
        assert_eq!(page.objects.len(), 3);
        assert!(page.truncated);
        let last = page.objects.last().unwrap().key.clone();

        let page = store.list_page("p/", &last, 3).await.unwrap();
        assert_eq!(page.objects.len(), 2);
        assert!(!page.truncated);
    }

    #[tokio::test]
    async fn test_retry_recovers_after_failures() {
        tokio::time::pause();
        let store = MemoryStore::new();
        store.insert("a", b"1");
        store.fail_next_lists(2);
        let task = tokio::spawn(async move {
            let page = list_page_with_retry(&store, "", "", 10).await.unwrap();
            (page.objects.len(), store.list_calls())
        });
        let (len, calls) = task.await.unwrap();
        assert_eq!(len, 1);
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_three() {
        tokio::time::pause();
        let store = MemoryStore::new();
        store.fail_next_lists(5);
        let task = tokio::spawn(async move {
            list_page_with_retry(&store, "", "", 10).await.map(|_| ())
        });
        assert!(task.await.unwrap().is_err());
    }
}
