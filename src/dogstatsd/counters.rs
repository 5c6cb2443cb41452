//! Reset-on-read top-N counters.

use std::collections::HashMap;

use parking_lot::Mutex;

/// Tracks counts by key and reports the top N most popular keys.
///
/// Reading the top entries swaps the underlying map for a fresh one, so
/// every read starts a new counting window and unpopular keys never need
/// to be garbage collected.
#[derive(Debug, Default)]
pub struct CounterStore {
    counts: Mutex<HashMap<String, i64>>,
}

impl CounterStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the count for `key`.
    pub fn incr(&self, key: &str) {
        let mut counts = self.counts.lock();
        *counts.entry(key.to_string()).or_insert(0) += 1;
    }

    /// Return the top `n` keys by count since the last call, resetting
    /// the store. Ties order by key so the result is deterministic.
    pub fn top(&self, n: usize) -> Vec<(String, i64)> {
        let snapshot = {
            let mut counts = self.counts.lock();
            std::mem::take(&mut *counts)
        };

        let mut entries: Vec<(String, i64)> = snapshot.into_iter().collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        entries.truncate(n);
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_top_orders_by_count() {
        let store = CounterStore::new();

        for _ in 0..10 {
            store.incr("www.segment.com.");
        }
        for _ in 0..4 {
            store.incr("www.github.com.");
        }
        for _ in 0..3 {
            store.incr("www.google.com.");
        }
        store.incr("google.com.");
        store.incr("facebook.com.");
        store.incr("datadoghq.com.");

        let top3 = store.top(3);
        assert_eq!(
            top3,
            vec![
                ("www.segment.com.".to_string(), 10),
                ("www.github.com.".to_string(), 4),
                ("www.google.com.".to_string(), 3),
            ]
        );
    }

    #[test]
    fn test_top_resets_on_read() {
        let store = CounterStore::new();
        for _ in 0..10 {
            store.incr("a");
        }
        for _ in 0..4 {
            store.incr("b");
        }
        for _ in 0..3 {
            store.incr("c");
        }

        let first = store.top(3);
        assert_eq!(
            first,
            vec![
                ("a".to_string(), 10),
                ("b".to_string(), 4),
                ("c".to_string(), 3),
            ]
        );

        assert!(store.top(3).is_empty());
    }

    #[test]
    fn test_top_truncates() {
        let store = CounterStore::new();
        store.incr("a");
        store.incr("b");
        store.incr("c");
        assert_eq!(store.top(2).len(), 2);
    }
}
