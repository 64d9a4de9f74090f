//! Per-node bounded log entry array.
//!
//! Retained as an internal structure for future extension; it is not
//! wired into the DStore replication pipeline, which replicates raw
//! `PUT`/`DELETE` lines directly instead of going through an ordered log.

use crate::error::{RaleError, Result};
use tokio::sync::Mutex;

pub const MAX_LOG_ENTRIES: usize = 4096;

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub term: u32,
    pub entry: Vec<u8>,
}

struct Inner {
    entries: Vec<LogEntry>,
    commit_index: u64,
}

pub struct DLog {
    inner: Mutex<Inner>,
}

impl DLog {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: Vec::new(),
                commit_index: 0,
            }),
        }
    }

    pub async fn append(&self, term: u32, entry: Vec<u8>) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        if inner.entries.len() >= MAX_LOG_ENTRIES {
            return Err(RaleError::Resource(format!(
                "dlog is full (max {MAX_LOG_ENTRIES} entries)"
            )));
        }
        inner.entries.push(LogEntry { term, entry });
        Ok(inner.entries.len() as u64 - 1)
    }

    pub async fn last_index(&self) -> u64 {
        let inner = self.inner.lock().await;
        inner.entries.len() as u64
    }

    pub async fn term_at(&self, index: u64) -> Option<u32> {
        let inner = self.inner.lock().await;
        inner.entries.get(index as usize).map(|e| e.term)
    }

    /// Drop every entry at or after `index`.
    pub async fn truncate(&self, index: u64) {
        let mut inner = self.inner.lock().await;
        inner.entries.truncate(index as usize);
    }

    pub async fn commit_index(&self) -> u64 {
        self.inner.lock().await.commit_index
    }

    pub async fn set_commit_index(&self, index: u64) {
        self.inner.lock().await.commit_index = index;
    }

    pub async fn entry_count(&self) -> usize {
        self.inner.lock().await.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_and_lookup() {
        let log = DLog::new();
        log.append(1, b"a".to_vec()).await.unwrap();
        log.append(1, b"b".to_vec()).await.unwrap();
        assert_eq!(log.last_index().await, 2);
        assert_eq!(log.term_at(0).await, Some(1));
        assert_eq!(log.term_at(5).await, None);
    }

    #[tokio::test]
    async fn truncate_drops_suffix() {
        let log = DLog::new();
        log.append(1, b"a".to_vec()).await.unwrap();
        log.append(1, b"b".to_vec()).await.unwrap();
        log.append(1, b"c".to_vec()).await.unwrap();
        log.truncate(1).await;
        assert_eq!(log.last_index().await, 1);
    }

    #[tokio::test]
    async fn full_log_rejects_append() {
        let log = DLog::new();
        for _ in 0..MAX_LOG_ENTRIES {
            log.append(1, Vec::new()).await.unwrap();
        }
        assert!(log.append(1, Vec::new()).await.is_err());
    }
}
