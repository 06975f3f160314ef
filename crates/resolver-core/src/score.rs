//! Scorer (C3): weighted similarity scoring plus the deterministic
//! tie-break, per spec Section 4.3.
//!
//! The fuzzy primitives are built on `strsim`'s normalized Levenshtein
//! distance; `token_sort_ratio`/`token_set_ratio` are hand-rolled wrappers
//! around it since no RapidFuzz-compatible crate exists for Rust. The
//! semantics (tokenize, sort, recombine, take the best pairwise ratio) are
//! the same ones RapidFuzz's Python implementation uses.

use crate::types::{Candidate, CleanedRecord};
use std::cmp::Ordering;

fn tokens_sorted(s: &str) -> Vec<&str> {
    let mut toks: Vec<&str> = s.split_whitespace().collect();
    toks.sort_unstable();
    toks
}

fn ratio(a: &str, b: &str) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    strsim::normalized_levenshtein(a, b)
}

/// Token-sort-ratio: sort each string's whitespace tokens, rejoin, compare.
/// Normalized to `[0, 1]`.
pub fn token_sort_ratio(a: &str, b: &str) -> f64 {
    let sa = tokens_sorted(a).join(" ");
    let sb = tokens_sorted(b).join(" ");
    ratio(&sa, &sb)
}

/// Token-set-ratio: split into token sets, compare the shared intersection
/// against each side's full token set, and take the best pairwise ratio.
/// Normalized to `[0, 1]`.
pub fn token_set_ratio(a: &str, b: &str) -> f64 {
    use std::collections::BTreeSet;

    let set_a: BTreeSet<&str> = a.split_whitespace().collect();
    let set_b: BTreeSet<&str> = b.split_whitespace().collect();

    let intersection: Vec<&str> = set_a.intersection(&set_b).copied().collect();
    let diff_ab: Vec<&str> = set_a.difference(&set_b).copied().collect();
    let diff_ba: Vec<&str> = set_b.difference(&set_a).copied().collect();

    let sorted_sect = intersection.join(" ");
    let sorted_sect_ab = {
        let mut v = intersection.clone();
        v.extend(diff_ab);
        v.sort_unstable();
        v.join(" ")
    };
    let sorted_sect_ba = {
        let mut v = intersection.clone();
        v.extend(diff_ba);
        v.sort_unstable();
        v.join(" ")
    };

    let mut best = ratio(&sorted_sect_ab, &sorted_sect_ba);
    if !sorted_sect.is_empty() {
        best = best.max(ratio(&sorted_sect, &sorted_sect_ab));
        best = best.max(ratio(&sorted_sect, &sorted_sect_ba));
    }
    best
}

/// Weights from spec Section 4.3's table, summing to 100.
pub mod weights {
    pub const NAME: u32 = 40;
    pub const CITY: u32 = 30;
    pub const ADDRESS: u32 = 20;
    pub const HEAD_OFFICE: u32 = 10;
}

/// The input address, concatenated the same way [`Candidate::address`] is,
/// so `token_set_ratio` compares like with like.
pub fn input_address(lines: &[&str]) -> String {
    lines
        .iter()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.trim().to_uppercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// `score(cleaned, candidate) -> integer in [0, 100]`, per spec Section 4.3.
pub fn score(cleaned: &CleanedRecord, candidate: &Candidate, input_address: &str) -> u32 {
    let mut total = 0u32;

    if token_sort_ratio(&candidate.official_name, &cleaned.clean_name) >= 0.9 {
        total += weights::NAME;
    }
    if let Some(city) = &cleaned.clean_city {
        if candidate.city.to_uppercase() == *city {
            total += weights::CITY;
        }
    }
    if !input_address.is_empty()
        && token_set_ratio(&candidate.address, input_address) >= 0.8
    {
        total += weights::ADDRESS;
    }
    if candidate.is_head_office {
        total += weights::HEAD_OFFICE;
    }

    total
}

/// A scored candidate, ready to be ordered by the deterministic tie-break.
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub candidate: Candidate,
    pub score: u32,
    pub name_similarity: f64,
}

/// Total order per spec Section 4.3: score desc, then name-similarity desc,
/// then head-office-first, then establishment_id ascending. Deterministic
/// so concurrent workers agree on identical inputs.
pub fn rank(mut scored: Vec<ScoredCandidate>) -> Vec<ScoredCandidate> {
    scored.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then_with(|| {
                b.name_similarity
                    .partial_cmp(&a.name_similarity)
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| b.candidate.is_head_office.cmp(&a.candidate.is_head_office))
            .then_with(|| a.candidate.establishment_id.cmp(&b.candidate.establishment_id))
    });
    scored
}

/// Build the ranked candidate list from cleaned input + raw candidates.
pub fn score_and_rank(
    cleaned: &CleanedRecord,
    candidates: Vec<Candidate>,
    input_address: &str,
) -> Vec<ScoredCandidate> {
    let scored: Vec<ScoredCandidate> = candidates
        .into_iter()
        .map(|c| {
            let name_similarity = token_sort_ratio(&c.official_name, &cleaned.clean_name);
            let s = score(cleaned, &c, input_address);
            ScoredCandidate {
                candidate: c,
                score: s,
                name_similarity,
            }
        })
        .collect();
    rank(scored)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, name: &str, city: &str, address: &str, hq: bool) -> Candidate {
        Candidate {
            establishment_id: id.to_string(),
            company_id: id[0..9].to_string(),
            official_name: name.to_string(),
            city: city.to_string(),
            address: address.to_string(),
            is_head_office: hq,
        }
    }

    fn cleaned(name: &str, city: Option<&str>) -> CleanedRecord {
        CleanedRecord {
            clean_name: name.to_string(),
            search_token: name.split_whitespace().next().unwrap_or("").to_string(),
            clean_postal: None,
            clean_city: city.map(|c| c.to_string()),
        }
    }

    #[test]
    fn token_sort_ratio_ignores_word_order() {
        let r = token_sort_ratio("MARKET CARREFOUR", "CARREFOUR MARKET");
        assert!((r - 1.0).abs() < 1e-9);
    }

    #[test]
    fn token_set_ratio_handles_subset_tokens() {
        let r = token_set_ratio("CARREFOUR MARKET PARIS", "CARREFOUR MARKET");
        assert!(r > 0.9);
    }

    #[test]
    fn score_sums_all_matching_predicates() {
        let c = candidate("50113813700013", "ACME WIDGETS", "LYON", "1 RUE DE LA PAIX", true);
        let cl = cleaned("ACME WIDGETS", Some("LYON"));
        let addr = input_address(&["1 rue de la paix"]);
        let s = score(&cl, &c, &addr);
        assert_eq!(s, 40 + 30 + 20 + 10);
    }

    #[test]
    fn score_is_zero_when_nothing_matches() {
        let c = candidate("50113813700013", "TOTALLY DIFFERENT CO", "PARIS", "9 AVENUE FOCH", false);
        let cl = cleaned("ACME WIDGETS", Some("LYON"));
        let s = score(&cl, &c, "");
        assert_eq!(s, 0);
    }

    #[test]
    fn score_monotonicity_city_match_never_decreases_score() {
        let without_city = candidate("50113813700013", "ACME WIDGETS", "PARIS", "X", false);
        let with_city = candidate("50113813700013", "ACME WIDGETS", "LYON", "X", false);
        let cl = cleaned("ACME WIDGETS", Some("LYON"));
        let s_without = score(&cl, &without_city, "");
        let s_with = score(&cl, &with_city, "");
        assert!(s_with >= s_without);
    }

    #[test]
    fn tie_break_prefers_higher_name_similarity() {
        let a = ScoredCandidate {
            candidate: candidate("10000000000001", "ACME WIDGETS", "X", "X", false),
            score: 70,
            name_similarity: 0.95,
        };
        let b = ScoredCandidate {
            candidate: candidate("10000000000002", "ACME WIDGETS CO", "X", "X", false),
            score: 70,
            name_similarity: 0.80,
        };
        let ranked = rank(vec![b.clone(), a.clone()]);
        assert_eq!(ranked[0].candidate.establishment_id, a.candidate.establishment_id);
    }

    #[test]
    fn tie_break_prefers_head_office_before_establishment_id() {
        let a = ScoredCandidate {
            candidate: candidate("90000000000001", "X", "X", "X", false),
            score: 70,
            name_similarity: 0.5,
        };
        let b = ScoredCandidate {
            candidate: candidate("10000000000002", "X", "X", "X", true),
            score: 70,
            name_similarity: 0.5,
        };
        let ranked = rank(vec![a.clone(), b.clone()]);
        assert_eq!(ranked[0].candidate.establishment_id, b.candidate.establishment_id);
    }

    #[test]
    fn tie_break_falls_back_to_lexicographic_establishment_id() {
        let a = ScoredCandidate {
            candidate: candidate("20000000000001", "X", "X", "X", false),
            score: 70,
            name_similarity: 0.5,
        };
        let b = ScoredCandidate {
            candidate: candidate("10000000000002", "X", "X", "X", false),
            score: 70,
            name_similarity: 0.5,
        };
        let ranked = rank(vec![a.clone(), b.clone()]);
        assert_eq!(ranked[0].candidate.establishment_id, b.candidate.establishment_id);
    }
}
