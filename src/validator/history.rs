//! Append-only improvement history with bounded eviction.

use crate::Result;
use crate::models::{HistoryEntry, HistoryOutcome, RequestFingerprint};
use crate::storage::{append_jsonl, read_jsonl, write_jsonl};
use crate::validator::fingerprint::similarity;
use chrono::{DateTime, Duration, Utc};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Closest recent match found in the history.
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarEntry {
    pub entry_id: u64,
    pub similarity: f64,
}

/// JSONL-backed history store.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    path: PathBuf,
    limit: usize,
}

impl HistoryStore {
    pub fn new(path: impl Into<PathBuf>, limit: usize) -> Self {
        Self {
            path: path.into(),
            limit: limit.max(1),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All entries, oldest first.
    pub fn load(&self) -> Result<Vec<HistoryEntry>> {
        read_jsonl(&self.path)
    }

    /// Append an entry, evicting the oldest ones beyond the limit.
    ///
    /// Ids keep increasing across evictions since the newest entry always
    /// survives.
    pub fn append(
        &self,
        fingerprint: RequestFingerprint,
        request: &str,
        outcome: HistoryOutcome,
    ) -> Result<HistoryEntry> {
        let mut entries = self.load()?;
        let id = entries.iter().map(|e| e.id).max().unwrap_or(0) + 1;
        let entry = HistoryEntry {
            id,
            fingerprint,
            request: request.to_string(),
            timestamp: Utc::now(),
            outcome,
        };

        if entries.len() < self.limit {
            append_jsonl(&self.path, &entry)?;
        } else {
            entries.push(entry.clone());
            let evict = entries.len() - self.limit;
            debug!(evicted = evict, limit = self.limit, "evicting oldest history entries");
            write_jsonl(&self.path, &entries[evict..])?;
        }
        Ok(entry)
    }

    /// Most similar entry within the recency window, if it reaches `threshold`.
    pub fn find_similar(
        &self,
        fingerprint: &RequestFingerprint,
        window: Duration,
        threshold: f64,
        now: DateTime<Utc>,
    ) -> Result<Option<SimilarEntry>> {
        let cutoff = now - window;
        let mut best: Option<SimilarEntry> = None;

        for entry in self.load()?.iter().filter(|e| e.timestamp >= cutoff) {
            let score = similarity(fingerprint, &entry.fingerprint);
            if score >= threshold && best.as_ref().is_none_or(|b| score > b.similarity) {
                best = Some(SimilarEntry {
                    entry_id: entry.id,
                    similarity: score,
                });
            }
        }
        Ok(best)
    }

    /// Remove every entry. Returns how many were removed.
    pub fn clear(&self) -> Result<usize> {
        let count = self.load()?.len();
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(count)
    }
}
