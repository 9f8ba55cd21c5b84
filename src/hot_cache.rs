//! In-process hot cache for resolved cards and name-scoring results.
//!
//! This layer memoizes work within process lifetime only; the SQLite store
//! remains the durable tier. Prepared-statement reuse is handled separately
//! by rusqlite's `prepare_cached`, keyed by SQL text.

use crate::card_store::CardRecord;
use std::collections::HashMap;
use std::sync::Mutex;

/// Two maps, both cleared in full whenever the persistent store accepts a
/// write: a newly learned record can change which candidate is the best
/// match for a previously scored name, so targeted invalidation is unsafe.
#[derive(Default)]
pub struct HotCache {
    hot_cards: Mutex<HashMap<String, CardRecord>>,
    best_matches: Mutex<HashMap<String, CardRecord>>,
}

/// Normalized key for a `(set, collector number, language)` lookup.
pub fn printing_key(set_code: &str, collector_number: &str, language: &str) -> String {
    format!(
        "{}|{}|{}",
        set_code.to_lowercase(),
        collector_number.to_lowercase(),
        language.to_lowercase()
    )
}

/// Normalized key for a `(name, language)` lookup.
pub fn name_key(name: &str, language: &str) -> String {
    format!("{}|{}", name.to_lowercase(), language.to_lowercase())
}

impl HotCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_card(&self, key: &str) -> Option<CardRecord> {
        self.hot_cards.lock().unwrap().get(key).cloned()
    }

    pub fn put_card(&self, key: String, card: CardRecord) {
        self.hot_cards.lock().unwrap().insert(key, card);
    }

    pub fn get_best_match(&self, key: &str) -> Option<CardRecord> {
        self.best_matches.lock().unwrap().get(key).cloned()
    }

    pub fn put_best_match(&self, key: String, card: CardRecord) {
        self.best_matches.lock().unwrap().insert(key, card);
    }

    /// Broad invalidation: drop everything.
    pub fn clear(&self) {
        self.hot_cards.lock().unwrap().clear();
        self.best_matches.lock().unwrap().clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.hot_cards.lock().unwrap().len() + self.best_matches.lock().unwrap().len()
    }
}
