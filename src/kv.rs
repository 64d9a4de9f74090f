//! In-memory KV index: a chained hash table protected by a mutex.
//! DJB2 hashing, fixed bucket count, binary save/load layout.

use crate::error::{RaleError, Result};
use std::path::Path;
use tokio::sync::Mutex;

pub const HASH_SIZE: usize = 1024;
pub const MAX_KEY_SIZE: usize = 254;
pub const MAX_VALUE_SIZE: usize = 1023;

/// DJB2: `hash = hash * 33 + byte`, seeded at 5381.
fn djb2(key: &[u8]) -> usize {
    let mut hash: u64 = 5381;
    for &b in key {
        hash = hash.wrapping_mul(33).wrapping_add(b as u64);
    }
    (hash as usize) % HASH_SIZE
}

#[derive(Clone)]
struct Entry {
    key: Vec<u8>,
    value: Vec<u8>,
}

/// `HASH_SIZE`-bucket chained hash table. Every mutation and every read
/// goes through the bucket's own mutex; there is no table-wide lock, so
/// concurrent operations on different buckets never contend.
pub struct KvStore {
    buckets: Vec<Mutex<Vec<Entry>>>,
}

impl KvStore {
    pub fn new() -> Self {
        let mut buckets = Vec::with_capacity(HASH_SIZE);
        buckets.resize_with(HASH_SIZE, || Mutex::new(Vec::new()));
        Self { buckets }
    }

    fn validate(key: &[u8], value: Option<&[u8]>) -> Result<()> {
        if key.is_empty() || key.len() > MAX_KEY_SIZE {
            return Err(RaleError::Validation(format!(
                "key length must be in (0, {MAX_KEY_SIZE}]"
            )));
        }
        if let Some(v) = value {
            if v.len() > MAX_VALUE_SIZE {
                return Err(RaleError::Validation(format!(
                    "value length must be <= {MAX_VALUE_SIZE}"
                )));
            }
        }
        Ok(())
    }

    /// Overwrite-on-match or prepend-new.
    pub async fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        Self::validate(key, Some(value))?;
        let mut bucket = self.buckets[djb2(key)].lock().await;
        if let Some(existing) = bucket.iter_mut().find(|e| e.key == key) {
            existing.value = value.to_vec();
        } else {
            bucket.insert(
                0,
                Entry {
                    key: key.to_vec(),
                    value: value.to_vec(),
                },
            );
        }
        Ok(())
    }

    pub async fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let bucket = self.buckets[djb2(key)].lock().await;
        bucket.iter().find(|e| e.key == key).map(|e| e.value.clone())
    }

    pub async fn delete(&self, key: &[u8]) -> bool {
        let mut bucket = self.buckets[djb2(key)].lock().await;
        let before = bucket.len();
        bucket.retain(|e| e.key != key);
        bucket.len() != before
    }

    /// `int entry_count`, then per entry `int key_len, key bytes, int
    /// value_len, value bytes` — all integers little-endian `i32`.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut all: Vec<Entry> = Vec::new();
        for bucket in &self.buckets {
            all.extend(bucket.lock().await.iter().cloned());
        }

        let mut out = Vec::new();
        out.extend_from_slice(&(all.len() as i32).to_le_bytes());
        for e in &all {
            out.extend_from_slice(&(e.key.len() as i32).to_le_bytes());
            out.extend_from_slice(&e.key);
            out.extend_from_slice(&(e.value.len() as i32).to_le_bytes());
            out.extend_from_slice(&e.value);
        }
        std::fs::write(path, out).map_err(|e| RaleError::Storage(e.to_string()))
    }

    pub async fn load(&self, path: impl AsRef<Path>) -> Result<()> {
        let bytes = std::fs::read(path).map_err(|e| RaleError::Storage(e.to_string()))?;
        let mut cursor = 0usize;
        let read_i32 = |bytes: &[u8], cursor: &mut usize| -> Result<i32> {
            if *cursor + 4 > bytes.len() {
                return Err(RaleError::Storage("truncated KV dump".into()));
            }
            let v = i32::from_le_bytes(bytes[*cursor..*cursor + 4].try_into().unwrap());
            *cursor += 4;
            Ok(v)
        };

        let count = read_i32(&bytes, &mut cursor)?;
        for bucket in &self.buckets {
            bucket.lock().await.clear();
        }
        for _ in 0..count {
            let key_len = read_i32(&bytes, &mut cursor)? as usize;
            let key = bytes
                .get(cursor..cursor + key_len)
                .ok_or_else(|| RaleError::Storage("truncated KV dump".into()))?
                .to_vec();
            cursor += key_len;
            let value_len = read_i32(&bytes, &mut cursor)? as usize;
            let value = bytes
                .get(cursor..cursor + value_len)
                .ok_or_else(|| RaleError::Storage("truncated KV dump".into()))?
                .to_vec();
            cursor += value_len;
            self.put(&key, &value).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_delete_round_trip() {
        let kv = KvStore::new();
        kv.put(b"color", b"blue").await.unwrap();
        assert_eq!(kv.get(b"color").await.unwrap(), b"blue");
        assert!(kv.delete(b"color").await);
        assert!(kv.get(b"color").await.is_none());
    }

    #[tokio::test]
    async fn put_overwrites() {
        let kv = KvStore::new();
        kv.put(b"k", b"v1").await.unwrap();
        kv.put(b"k", b"v2").await.unwrap();
        assert_eq!(kv.get(b"k").await.unwrap(), b"v2");
    }

    #[tokio::test]
    async fn oversized_key_or_value_rejected() {
        let kv = KvStore::new();
        let big_key = vec![b'a'; MAX_KEY_SIZE + 1];
        assert!(kv.put(&big_key, b"v").await.is_err());
        let big_value = vec![b'a'; MAX_VALUE_SIZE + 1];
        assert!(kv.put(b"k", &big_value).await.is_err());
    }

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.dump");
        let kv = KvStore::new();
        kv.put(b"a", b"1").await.unwrap();
        kv.put(b"b", b"2").await.unwrap();
        kv.save(&path).await.unwrap();

        let reloaded = KvStore::new();
        reloaded.load(&path).await.unwrap();
        assert_eq!(reloaded.get(b"a").await.unwrap(), b"1");
        assert_eq!(reloaded.get(b"b").await.unwrap(), b"2");
    }
}
