//! Memory-resident object store for workload artifacts.
//!
//! The node creates the workload cache bucket at startup; guests pull
//! artifacts by name over the bus during deploy handling.

use crate::error::{BusError, Result};
use std::collections::HashMap;
use parking_lot::RwLock;
use std::sync::Arc;

/// Configuration for a bucket.
#[derive(Debug, Clone, Default)]
pub struct BucketConfig {
    /// Human-readable description of the bucket.
    pub description: Option<String>,
}

#[derive(Debug, Default)]
struct Bucket {
    description: Option<String>,
    objects: HashMap<String, Vec<u8>>,
}

/// In-memory bucketed object store.
///
/// Cloning is cheap; all clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct ObjectStore {
    buckets: Arc<RwLock<HashMap<String, Bucket>>>,
}

impl ObjectStore {
    /// Create a bucket if it does not already exist.
    ///
    /// Creating an existing bucket leaves its contents untouched.
    pub fn create(&self, bucket: &str, config: BucketConfig) {
        let mut buckets = self.buckets.write();
        buckets.entry(bucket.to_string()).or_insert_with(|| {
            tracing::debug!(bucket = %bucket, "Created object store bucket");
            Bucket {
                description: config.description.clone(),
                objects: HashMap::new(),
            }
        });
    }

    /// Store an object under `key`.
    pub fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<()> {
        let mut buckets = self.buckets.write();
        let bucket = buckets
            .get_mut(bucket)
            .ok_or_else(|| BusError::BucketNotFound(bucket.to_string()))?;
        bucket.objects.insert(key.to_string(), bytes);
        Ok(())
    }

    /// Fetch an object's bytes.
    pub fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let buckets = self.buckets.read();
        let entry = buckets
            .get(bucket)
            .ok_or_else(|| BusError::BucketNotFound(bucket.to_string()))?;
        entry
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| BusError::ObjectNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }

    /// Remove an object. Missing objects are ignored.
    pub fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        let mut buckets = self.buckets.write();
        let bucket = buckets
            .get_mut(bucket)
            .ok_or_else(|| BusError::BucketNotFound(bucket.to_string()))?;
        bucket.objects.remove(key);
        Ok(())
    }

    /// Description the bucket was created with, if any.
    pub fn description(&self, bucket: &str) -> Option<String> {
        let buckets = self.buckets.read();
        buckets.get(bucket).and_then(|b| b.description.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get() {
        let store = ObjectStore::default();
        store.create("NEXCACHE", BucketConfig::default());
        store.put("NEXCACHE", "echo", b"artifact".to_vec()).unwrap();
        assert_eq!(store.get("NEXCACHE", "echo").unwrap(), b"artifact");
    }

    #[test]
    fn test_missing_bucket() {
        let store = ObjectStore::default();
        assert!(matches!(
            store.put("nope", "k", Vec::new()),
            Err(BusError::BucketNotFound(_))
        ));
        assert!(matches!(
            store.get("nope", "k"),
            Err(BusError::BucketNotFound(_))
        ));
    }

    #[test]
    fn test_missing_object() {
        let store = ObjectStore::default();
        store.create("NEXCACHE", BucketConfig::default());
        assert!(matches!(
            store.get("NEXCACHE", "missing"),
            Err(BusError::ObjectNotFound { .. })
        ));
    }

    #[test]
    fn test_create_is_idempotent() {
        let store = ObjectStore::default();
        store.create(
            "NEXCACHE",
            BucketConfig {
                description: Some("workload artifact cache".to_string()),
            },
        );
        store.put("NEXCACHE", "echo", b"v1".to_vec()).unwrap();
        store.create("NEXCACHE", BucketConfig::default());
        assert_eq!(store.get("NEXCACHE", "echo").unwrap(), b"v1");
        assert_eq!(
            store.description("NEXCACHE").as_deref(),
            Some("workload artifact cache")
        );
    }
}
