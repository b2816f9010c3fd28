//! Removing duplicate entries across overlapping feed snapshots.
//!
//! Both push deliveries and poll results yield raw feed documents, and even
//! when a document has changed we may receive an overlapping set of entries.
//! The dedup engine answers "which of these have I not seen before?" using a
//! moving window per topic: if a batch's earliest entry has timestamp T, any
//! remembered entry older than T is assumed to have scrolled off the feed and
//! is forgotten.
//!
//! Identity is the entry's `id` alone (an Atom `id`, RSS `guid`, or a content
//! hash chosen by the caller); the timestamp is only an eviction score.

use std::collections::HashMap;

/// One feed entry, as produced by whatever parses the raw document.
///
/// The engine never inspects `data`; it is carried through untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry<T> {
    /// Canonical identifier; the sole basis for "seen before".
    pub id: String,
    /// Entry timestamp (epoch milliseconds); used only as an eviction score.
    pub timestamp: i64,
    /// Caller payload, returned as-is.
    pub data: T,
}

struct Seen<T> {
    entry: Entry<T>,
    score: i64,
}

/// Time-windowed identity cache, one window per topic.
///
/// Windows are created lazily on first use of a topic and only ever shrink
/// via the per-batch eviction rule. State is in-memory only.
#[derive(Default)]
pub struct Dedup<T> {
    topics: HashMap<String, HashMap<String, Seen<T>>>,
}

impl<T: Clone> Dedup<T> {
    pub fn new() -> Self {
        Dedup {
            topics: HashMap::new(),
        }
    }

    /// Filter a batch down to the entries not previously seen for `topic`.
    ///
    /// Order-preserving: the returned entries appear in input order. Every
    /// unseen entry is remembered with its timestamp as score. After the
    /// whole batch has been processed, entries whose score is strictly below
    /// the batch's own minimum timestamp are evicted — the window boundary is
    /// re-derived per call, not a monotonically advancing watermark, so an
    /// out-of-order batch can resurrect ids evicted earlier.
    ///
    /// An empty batch is a no-op: with no entries there is no earliest
    /// timestamp to evict against.
    pub fn new_entries(&mut self, topic: &str, entries: &[Entry<T>]) -> Vec<Entry<T>> {
        let window = self.topics.entry(topic.to_owned()).or_default();

        let mut earliest = i64::MAX;
        let mut fresh = Vec::new();
        for entry in entries {
            earliest = earliest.min(entry.timestamp);
            if !window.contains_key(&entry.id) {
                window.insert(
                    entry.id.clone(),
                    Seen {
                        entry: entry.clone(),
                        score: entry.timestamp,
                    },
                );
                fresh.push(entry.clone());
            }
        }

        if !entries.is_empty() {
            window.retain(|_, seen| seen.score >= earliest);
        }
        fresh
    }

    /// All entries currently retained in `topic`'s window, ascending by
    /// timestamp. Returns an empty list for an unknown topic.
    pub fn all_entries(&self, topic: &str) -> Vec<Entry<T>> {
        let Some(window) = self.topics.get(topic) else {
            return Vec::new();
        };
        let mut seen: Vec<&Seen<T>> = window.values().collect();
        seen.sort_by_key(|s| s.score);
        seen.into_iter().map(|s| s.entry.clone()).collect()
    }
}
