use bytes::Bytes;
use std::collections::hash_map::RandomState;
use std::fmt;
use std::hash::BuildHasher;
use thiserror::Error as ThisError;

/// Releases a value leaving a [`KeyedStore`], either through [`KeyedStore::remove`] or when the
/// store is torn down. Every value that entered a store is handed to its release exactly once.
pub trait Release<V> {
    fn release(&mut self, value: V);
}

/// Releases values by dropping them.
#[derive(Debug, Default, Clone, Copy)]
pub struct DropRelease;

impl<V> Release<V> for DropRelease {
    fn release(&mut self, value: V) {
        drop(value);
    }
}

#[derive(Debug, ThisError, PartialEq)]
pub enum StoreError {
    #[error("store error; bucket count must be greater than zero")]
    InvalidBucketCount,
    #[error("store error; key {0:?} already exists")]
    DuplicateKey(Bytes),
    #[error("store error; key {0:?} not found")]
    NotFound(Bytes),
}

/// A fixed-size, separately chained hash table mapping opaque byte keys to owned values.
///
/// The store does not synchronize access on its own. Shared instances are only reachable through
/// the [`SessionManager`](crate::session::SessionManager) lock, and references returned by
/// [`find`](KeyedStore::find) borrow from that guard.
pub struct KeyedStore<V, R: Release<V> = DropRelease> {
    buckets: Vec<Vec<Entry<V>>>,
    len: usize,
    hasher: RandomState,
    release: R,
}

struct Entry<V> {
    key: Bytes,
    value: V,
}

impl<V, R: Release<V>> KeyedStore<V, R> {
    pub fn new(bucket_count: usize, release: R) -> Result<Self, StoreError> {
        if bucket_count == 0 {
            return Err(StoreError::InvalidBucketCount);
        }

        let buckets = (0..bucket_count).map(|_| Vec::new()).collect();

        Ok(Self {
            buckets,
            len: 0,
            hasher: RandomState::new(),
            release,
        })
    }

    pub fn insert(&mut self, key: impl Into<Bytes>, value: V) -> Result<(), StoreError> {
        let key = key.into();
        let index = self.bucket_index(&key);
        let bucket = &mut self.buckets[index];

        if bucket.iter().any(|entry| entry.key == key) {
            return Err(StoreError::DuplicateKey(key));
        }

        bucket.push(Entry { key, value });
        self.len += 1;

        Ok(())
    }

    pub fn find(&self, key: &[u8]) -> Option<&V> {
        self.buckets[self.bucket_index(key)]
            .iter()
            .find(|entry| entry.key == key)
            .map(|entry| &entry.value)
    }

    pub fn find_mut(&mut self, key: &[u8]) -> Option<&mut V> {
        let index = self.bucket_index(key);
        self.buckets[index]
            .iter_mut()
            .find(|entry| entry.key == key)
            .map(|entry| &mut entry.value)
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.find(key).is_some()
    }

    pub fn remove(&mut self, key: &[u8]) -> Result<(), StoreError> {
        let index = self.bucket_index(key);
        let bucket = &mut self.buckets[index];

        let position = bucket
            .iter()
            .position(|entry| entry.key == key)
            .ok_or_else(|| StoreError::NotFound(Bytes::copy_from_slice(key)))?;

        // Chain order is irrelevant.
        let entry = bucket.swap_remove(position);
        self.len -= 1;
        self.release.release(entry.value);

        Ok(())
    }

    /// Removes and releases every entry matching `predicate`, returning how many were removed.
    pub fn remove_where<F>(&mut self, mut predicate: F) -> usize
    where
        F: FnMut(&[u8], &V) -> bool,
    {
        let mut removed = 0;

        for bucket in &mut self.buckets {
            let mut i = 0;
            while i < bucket.len() {
                if predicate(&bucket[i].key[..], &bucket[i].value) {
                    let entry = bucket.swap_remove(i);
                    self.release.release(entry.value);
                    removed += 1;
                } else {
                    i += 1;
                }
            }
        }

        self.len -= removed;
        removed
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn keys(&self) -> impl Iterator<Item = &Bytes> {
        self.iter().map(|(key, _)| key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Bytes, &V)> {
        self.buckets
            .iter()
            .flatten()
            .map(|entry| (&entry.key, &entry.value))
    }

    /// Releases every remaining value and frees the buckets, returning how many values were
    /// released.
    pub fn destroy(mut self) -> usize {
        self.release_all()
    }

    fn release_all(&mut self) -> usize {
        let mut released = 0;

        for bucket in &mut self.buckets {
            for entry in bucket.drain(..) {
                self.release.release(entry.value);
                released += 1;
            }
        }

        self.buckets.clear();
        self.len = 0;
        released
    }

    fn bucket_index(&self, key: &[u8]) -> usize {
        (self.hasher.hash_one(key) % self.buckets.len() as u64) as usize
    }
}

impl<V, R: Release<V>> Drop for KeyedStore<V, R> {
    fn drop(&mut self) {
        self.release_all();
    }
}

impl<V, R: Release<V>> fmt::Debug for KeyedStore<V, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedStore")
            .field("buckets", &self.buckets.len())
            .field("len", &self.len)
            .finish()
    }
}
