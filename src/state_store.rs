//! Persistent state store: `rale.state` (term/vote/leader/log pointers) and
//! `rale.db` (append-only KV journal).
//!
//! Writes to `rale.state` are serialized through `RaleStateStore`'s
//! `&mut self` API; callers are expected to route every write through
//! one owner rather than opening the file independently (see DESIGN.md
//! for the single-writer rationale).

use crate::error::{RaleError, Result};
use std::path::{Path, PathBuf};

/// The five whitespace-separated fields persisted in `rale.state`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistedRaleState {
    pub current_term: u32,
    pub voted_for: i32,
    pub leader_id: i32,
    pub last_log_index: u64,
    pub last_log_term: u32,
}

impl PersistedRaleState {
    pub fn initial() -> Self {
        Self {
            current_term: 0,
            voted_for: -1,
            leader_id: -1,
            last_log_index: 0,
            last_log_term: 0,
        }
    }

    fn to_line(self) -> String {
        format!(
            "{} {} {} {} {}\n",
            self.current_term, self.voted_for, self.leader_id, self.last_log_index, self.last_log_term
        )
    }

    fn parse(text: &str) -> Option<Self> {
        let mut it = text.split_whitespace();
        Some(Self {
            current_term: it.next()?.parse().ok()?,
            voted_for: it.next()?.parse().ok()?,
            leader_id: it.next()?.parse().ok()?,
            last_log_index: it.next()?.parse().ok()?,
            last_log_term: it.next()?.parse().ok()?,
        })
    }
}

/// File-backed storage rooted at a configured `db.path`.
pub struct RaleStateStore {
    db_path: PathBuf,
}

impl RaleStateStore {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }

    fn state_path(&self) -> PathBuf {
        self.db_path.join("rale.state")
    }

    fn journal_path(&self) -> PathBuf {
        self.db_path.join("rale.db")
    }

    /// Missing file means first boot: not an error, returns the zeroed
    /// initial state.
    pub fn read_state(&self) -> Result<PersistedRaleState> {
        match std::fs::read_to_string(self.state_path()) {
            Ok(text) => Ok(PersistedRaleState::parse(&text).unwrap_or_else(PersistedRaleState::initial)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PersistedRaleState::initial()),
            Err(e) => Err(RaleError::Storage(e.to_string())),
        }
    }

    /// Truncate-write the full five-field record.
    pub fn write_state(&self, state: PersistedRaleState) -> Result<()> {
        std::fs::write(self.state_path(), state.to_line()).map_err(|e| RaleError::Storage(e.to_string()))
    }

    /// Update only `current_term` and `leader_id`, preserving the other
    /// three fields — the "leader snapshot" write path used when a
    /// follower learns the leader via a `LEADER <term> <leader_id>`
    /// message.
    pub fn write_leader_snapshot(&self, term: u32, leader_id: i32) -> Result<()> {
        let mut state = self.read_state()?;
        state.current_term = term;
        state.leader_id = leader_id;
        self.write_state(state)
    }

    /// Append one `key=value` line to `rale.db`.
    pub fn append_journal(&self, key: &str, value: &str) -> Result<()> {
        use std::io::Write;
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.journal_path())
            .map_err(|e| RaleError::Storage(e.to_string()))?;
        writeln!(f, "{key}={value}").map_err(|e| RaleError::Storage(e.to_string()))
    }

    /// Replay `rale.db` in order, last-write-wins per key. A missing file
    /// is first boot, not an error.
    pub fn load_journal(&self) -> Result<Vec<(String, String)>> {
        let text = match std::fs::read_to_string(self.journal_path()) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(RaleError::Storage(e.to_string())),
        };

        let mut ordered: Vec<(String, String)> = Vec::new();
        for line in text.lines() {
            let Some((k, v)) = line.split_once('=') else {
                continue;
            };
            if let Some(existing) = ordered.iter_mut().find(|(ek, _)| ek == k) {
                existing.1 = v.to_string();
            } else {
                ordered.push((k.to_string(), v.to_string()));
            }
        }
        Ok(ordered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_initial_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = RaleStateStore::new(dir.path());
        assert_eq!(store.read_state().unwrap(), PersistedRaleState::initial());
    }

    #[test]
    fn round_trips_full_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = RaleStateStore::new(dir.path());
        let s = PersistedRaleState {
            current_term: 7,
            voted_for: 2,
            leader_id: 2,
            last_log_index: 42,
            last_log_term: 7,
        };
        store.write_state(s).unwrap();
        assert_eq!(store.read_state().unwrap(), s);
    }

    #[test]
    fn leader_snapshot_preserves_vote_and_log_pointers() {
        let dir = tempfile::tempdir().unwrap();
        let store = RaleStateStore::new(dir.path());
        store
            .write_state(PersistedRaleState {
                current_term: 3,
                voted_for: 5,
                leader_id: -1,
                last_log_index: 9,
                last_log_term: 3,
            })
            .unwrap();
        store.write_leader_snapshot(4, 5).unwrap();
        let s = store.read_state().unwrap();
        assert_eq!(s.current_term, 4);
        assert_eq!(s.leader_id, 5);
        assert_eq!(s.voted_for, 5);
        assert_eq!(s.last_log_index, 9);
    }

    #[test]
    fn journal_replay_is_last_write_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = RaleStateStore::new(dir.path());
        store.append_journal("color", "blue").unwrap();
        store.append_journal("size", "large").unwrap();
        store.append_journal("color", "red").unwrap();
        let entries = store.load_journal().unwrap();
        assert_eq!(
            entries,
            vec![
                ("color".to_string(), "red".to_string()),
                ("size".to_string(), "large".to_string())
            ]
        );
    }
}
