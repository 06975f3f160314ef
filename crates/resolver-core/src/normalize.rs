//! Heuristic normalizer (C1's deterministic fallback path).
//!
//! `resolverd::llm` owns the model-backed path; this module is the one the
//! spec guarantees can never fail. It is pure over `(name, address line 1,
//! postal, city)`, which is what makes the LRU cache in [`NormalizeCache`]
//! sound.

use crate::types::{CleanedRecord, RawRecord, Value};
use std::collections::{HashMap, VecDeque};

/// Legal-entity suffixes stripped at token boundaries (spec Section 4.1).
const LEGAL_SUFFIXES: &[&str] = &[
    "SAS", "SARL", "EURL", "SA", "SNC", "SCI", "SCP", "SASU",
];

/// Generic tokens that should never be picked as `search_token`.
const GENERIC_TOKENS: &[&str] = &["MARKET", "FRANCE", "GROUPE", "GROUP", "SOCIETE", "COMPAGNIE"];

/// Upper-case `name`, strip legal suffixes at token boundaries, collapse
/// whitespace.
fn clean_name_heuristic(raw: &str) -> String {
    let upper = raw.to_uppercase();
    let cleaned = upper
        .split_whitespace()
        .filter(|tok| {
            let bare = tok.trim_matches(|c: char| !c.is_alphanumeric());
            !LEGAL_SUFFIXES.contains(&bare)
        })
        .collect::<Vec<_>>()
        .join(" ");
    cleaned.trim().to_string()
}

/// Pick the longest remaining token >= 4 chars, skipping generic filler
/// words; fall back to the first token when nothing qualifies.
fn pick_search_token(clean_name: &str) -> String {
    let tokens: Vec<&str> = clean_name.split_whitespace().collect();
    let candidate = tokens
        .iter()
        .filter(|t| t.len() >= 4 && !GENERIC_TOKENS.contains(t))
        .max_by_key(|t| t.len());

    match candidate {
        Some(t) => (*t).to_string(),
        None => tokens.first().map(|t| (*t).to_string()).unwrap_or_default(),
    }
}

/// First 5-digit run found in `text`, or a 4-digit run padded with a
/// leading zero.
fn extract_postal(text: &str) -> Option<String> {
    let mut run = String::new();
    let mut best: Option<String> = None;

    for c in text.chars() {
        if c.is_ascii_digit() {
            run.push(c);
            if run.len() == 5 {
                return Some(run);
            }
        } else if !run.is_empty() {
            if run.len() == 4 && best.is_none() {
                best = Some(format!("0{run}"));
            }
            run.clear();
        }
    }
    if run.len() == 4 && best.is_none() {
        best = Some(format!("0{run}"));
    }
    best
}

fn field_str<'a>(record: &'a RawRecord, key: &str) -> Option<&'a str> {
    match record.get(key) {
        Some(Value::Text(s)) if !s.trim().is_empty() => Some(s.as_str()),
        _ => None,
    }
}

/// Run the deterministic fallback path (spec Section 4.1, "Heuristic
/// path"). Never fails.
pub fn normalize_heuristic(record: &RawRecord) -> CleanedRecord {
    let raw_name = field_str(record, "name").unwrap_or("");
    let clean_name = clean_name_heuristic(raw_name);
    let search_token = pick_search_token(&clean_name);

    let clean_postal = ["postal", "address1", "address2", "address3"]
        .iter()
        .find_map(|k| field_str(record, k).and_then(extract_postal));

    let clean_city = field_str(record, "city").map(|c| c.trim().to_uppercase());

    CleanedRecord {
        clean_name,
        search_token,
        clean_postal,
        clean_city,
    }
}

/// Bounded per-worker LRU cache over the normalizer's pure inputs.
///
/// Keyed on `(name, address line 1, postal, city)` per spec Section 4.1.
/// Default capacity ~4k entries. Not thread-safe by design — each worker
/// owns one, matching the "no shared mutable state between workers" rule
/// in spec Section 5.
#[derive(Debug)]
pub struct NormalizeCache {
    capacity: usize,
    order: VecDeque<CacheKey>,
    entries: HashMap<CacheKey, CleanedRecord>,
}

type CacheKey = (String, String, String, String);

impl NormalizeCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            entries: HashMap::new(),
        }
    }

    fn key_for(record: &RawRecord) -> CacheKey {
        (
            field_str(record, "name").unwrap_or("").to_string(),
            field_str(record, "address1").unwrap_or("").to_string(),
            field_str(record, "postal").unwrap_or("").to_string(),
            field_str(record, "city").unwrap_or("").to_string(),
        )
    }

    /// Look up a cached result, or compute, insert, and evict the oldest
    /// entry if the cache is full.
    pub fn get_or_compute<F>(&mut self, record: &RawRecord, compute: F) -> CleanedRecord
    where
        F: FnOnce() -> CleanedRecord,
    {
        let key = Self::key_for(record);
        if let Some(hit) = self.entries.get(&key) {
            return hit.clone();
        }
        let value = compute();
        self.insert_by_key(key, value.clone());
        value
    }

    /// Look up a cached result without computing one. Split from
    /// [`Self::get_or_compute`] so async callers (the model-backed path
    /// goes through an LLM adapter) can check the cache, await off of it,
    /// then [`Self::insert`] the result themselves.
    pub fn get(&self, record: &RawRecord) -> Option<CleanedRecord> {
        self.entries.get(&Self::key_for(record)).cloned()
    }

    /// Insert a freshly computed result, evicting the oldest entry if full.
    pub fn insert(&mut self, record: &RawRecord, value: CleanedRecord) {
        self.insert_by_key(Self::key_for(record), value);
    }

    fn insert_by_key(&mut self, key: CacheKey, value: CleanedRecord) {
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
        self.order.push_back(key.clone());
        self.entries.insert(key, value);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for NormalizeCache {
    fn default() -> Self {
        Self::new(4096)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn record(fields: &[(&str, &str)]) -> RawRecord {
        let mut map = BTreeMap::new();
        for (k, v) in fields {
            map.insert((*k).to_string(), Value::Text((*v).to_string()));
        }
        RawRecord {
            input_id: "1".to_string(),
            fields: map,
        }
    }

    #[test]
    fn strips_legal_suffix_and_upper_cases() {
        let r = record(&[("name", "acme widgets sas")]);
        let c = normalize_heuristic(&r);
        assert_eq!(c.clean_name, "ACME WIDGETS");
    }

    #[test]
    fn search_token_picks_longest_non_generic_token() {
        let r = record(&[("name", "groupe carrefour market france")]);
        let c = normalize_heuristic(&r);
        assert_eq!(c.search_token, "CARREFOUR");
    }

    #[test]
    fn search_token_falls_back_to_first_token_when_nothing_qualifies() {
        let r = record(&[("name", "ab cd")]);
        let c = normalize_heuristic(&r);
        assert_eq!(c.search_token, "AB");
    }

    #[test]
    fn extracts_five_digit_postal() {
        assert_eq!(extract_postal("12 rue de la paix 75001 Paris"), Some("75001".into()));
    }

    #[test]
    fn pads_four_digit_postal_with_leading_zero() {
        assert_eq!(extract_postal("9001 Lausanne"), Some("09001".into()));
    }

    #[test]
    fn no_digits_means_no_postal() {
        assert_eq!(extract_postal("no numbers here"), None);
    }

    #[test]
    fn city_is_upper_cased_and_trimmed() {
        let r = record(&[("name", "x"), ("city", "  lyon  ")]);
        let c = normalize_heuristic(&r);
        assert_eq!(c.clean_city.as_deref(), Some("LYON"));
    }

    #[test]
    fn missing_postal_and_city_yield_no_location() {
        let r = record(&[("name", "x")]);
        let c = normalize_heuristic(&r);
        assert!(c.has_no_location());
    }

    #[test]
    fn cache_returns_identical_result_for_repeated_input() {
        let mut cache = NormalizeCache::new(8);
        let r = record(&[("name", "acme sas"), ("postal", "75001")]);
        let first = cache.get_or_compute(&r, || normalize_heuristic(&r));
        let second = cache.get_or_compute(&r, || panic!("should not recompute"));
        assert_eq!(first, second);
    }

    #[test]
    fn cache_evicts_oldest_entry_past_capacity() {
        let mut cache = NormalizeCache::new(1);
        let a = record(&[("name", "a")]);
        let b = record(&[("name", "b")]);
        cache.get_or_compute(&a, || normalize_heuristic(&a));
        cache.get_or_compute(&b, || normalize_heuristic(&b));
        assert_eq!(cache.len(), 1);
    }
}
