//! Resolver (C4): the matching cascade, per spec Section 4.4.
//!
//! An explicit state enum plus a single transition function, so "same
//! inputs ⇒ same outputs" (spec Section 9's design note) is trivially
//! testable and the failure semantics are auditable rather than buried in
//! nested conditionals.

use crate::llm::{ArbiterChoice, LlmAdapter};
use crate::registry::{FetchScope, RegistryError, RegistryQuery};
use resolver_core::normalize::{normalize_heuristic, NormalizeCache};
use resolver_core::score::{input_address as build_input_address, score_and_rank, ScoredCandidate};
use resolver_core::types::{Candidate, CleanedRecord, MatchResult, Method, RawRecord, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Bounded retry with exponential backoff for a transient registry read
/// error (spec Section 7's `RegistryQuery: transient read error` row).
/// Malformed-id and missing-partition failures are not retried — they
/// cannot resolve by trying again.
async fn with_retry<T, F, Fut>(max_attempts: u32, mut op: F) -> Result<T, RegistryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RegistryError>>,
{
    let mut backoff = Duration::from_millis(50);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(RegistryError::Transient(msg)) if attempt < max_attempts => {
                tracing::warn!(attempt, error = %msg, "transient registry error, retrying");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[derive(Debug, Error)]
pub enum CascadeError {
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
}

/// The cascade's explicit states, mirroring spec Section 4.4's diagram
/// one-to-one.
#[derive(Debug, Clone)]
enum CascadeState {
    Start,
    DirectLookup,
    Normalize,
    StrictLocal,
    Fts,
    SecondaryFilter(Vec<Candidate>),
    Score(Vec<Candidate>),
    Arbiter(Vec<ScoredCandidate>),
    Emit(MatchResult),
}

/// Maximum attempts for a transient registry read before surfacing
/// `method=ERROR` (spec Section 7: "bounded, <= 3").
const MAX_REGISTRY_ATTEMPTS: u32 = 3;

/// Per-record working state threaded through transitions. Short-lived and
/// worker-local, per spec Section 3's ownership note. `cache` is the
/// worker's own [`NormalizeCache`] (spec Section 4.1), borrowed for the
/// lifetime of one call to [`resolve`].
struct Context<'a> {
    record: &'a RawRecord,
    cleaned: Option<CleanedRecord>,
    input_address: String,
    debug: BTreeMap<String, String>,
    cache: &'a mut NormalizeCache,
}

/// A syntactically valid 14-digit establishment id, stripped of
/// surrounding whitespace (spec Section 4.4's DIRECT_LOOKUP precondition).
/// A 9-digit legal-entity id is explicitly *not* synthesized into one.
fn direct_lookup_id(record: &RawRecord) -> Option<String> {
    let raw = record.get("siret")?.as_str()?;
    let trimmed = raw.trim();
    if trimmed.len() == 14 && trimmed.chars().all(|c| c.is_ascii_digit()) {
        Some(trimmed.to_string())
    } else {
        None
    }
}

fn raw_input_address(record: &RawRecord) -> String {
    let lines: Vec<String> = ["address1", "address2", "address3"]
        .iter()
        .filter_map(|k| record.get(k).and_then(Value::as_str))
        .collect();
    build_input_address(&lines.iter().map(String::as_str).collect::<Vec<_>>())
}

/// Keep only candidates within address/city distance per spec Section
/// 4.4's SECONDARY_FILTER. A missing filter input is skipped, not failed.
fn secondary_filter(
    candidates: Vec<Candidate>,
    cleaned: &CleanedRecord,
    input_address: &str,
) -> Vec<Candidate> {
    candidates
        .into_iter()
        .filter(|c| {
            let city_ok = match &cleaned.clean_city {
                Some(city) => strsim::levenshtein(&c.city.to_uppercase(), city) < 3,
                None => true,
            };
            let address_ok = if input_address.is_empty() {
                true
            } else {
                strsim::levenshtein(&c.address.to_uppercase(), input_address) < 10
            };
            city_ok && address_ok
        })
        .collect()
}

async fn step<R: RegistryQuery>(
    state: CascadeState,
    ctx: &mut Context<'_>,
    registry: &R,
    llm: Option<&LlmAdapter>,
    model_backed: bool,
) -> Result<CascadeState, CascadeError> {
    match state {
        CascadeState::Start => Ok(CascadeState::DirectLookup),

        CascadeState::DirectLookup => {
            if let Some(id) = direct_lookup_id(ctx.record) {
                let hit =
                    with_retry(MAX_REGISTRY_ATTEMPTS, || registry.direct_lookup(&id)).await?;
                if let Some(candidate) = hit {
                    return Ok(CascadeState::Emit(MatchResult::direct_id(
                        ctx.record.input_id.clone(),
                        candidate.establishment_id,
                        candidate.official_name,
                    )));
                }
            }
            Ok(CascadeState::Normalize)
        }

        CascadeState::Normalize => {
            let cleaned = if let Some(cached) = ctx.cache.get(ctx.record) {
                cached
            } else {
                let fresh = if model_backed {
                    if let Some(adapter) = llm {
                        match adapter.normalize(ctx.record).await {
                            Some(c) => c,
                            None => normalize_heuristic(ctx.record),
                        }
                    } else {
                        normalize_heuristic(ctx.record)
                    }
                } else {
                    normalize_heuristic(ctx.record)
                };
                ctx.cache.insert(ctx.record, fresh.clone());
                fresh
            };

            if cleaned.has_no_location() {
                ctx.debug.insert("step".to_string(), "NO_LOCATION".to_string());
                ctx.cleaned = Some(cleaned);
                return Ok(CascadeState::Emit(MatchResult::not_found(
                    ctx.record.input_id.clone(),
                    ctx.debug.clone(),
                )));
            }
            // Spec Section 4.4's "has postal & no name token" transition is
            // the postal-present instance of the broader rule in Section
            // 7's error table ("both paths produce empty clean_name ->
            // record-level NOT_FOUND"): an empty search token means there
            // is nothing to key a lookup on, with or without a postal code
            // — without this, a city-only record with an unparseable name
            // would reach FTS with an empty query string instead of
            // short-circuiting.
            if cleaned.search_token.is_empty() {
                ctx.cleaned = Some(cleaned);
                return Ok(CascadeState::Emit(MatchResult::not_found(
                    ctx.record.input_id.clone(),
                    ctx.debug.clone(),
                )));
            }

            let has_postal = cleaned.clean_postal.is_some();
            ctx.cleaned = Some(cleaned);
            if has_postal {
                Ok(CascadeState::StrictLocal)
            } else {
                Ok(CascadeState::Fts)
            }
        }

        CascadeState::StrictLocal => {
            let cleaned = ctx.cleaned.as_ref().expect("cleaned set by Normalize");
            let postal = cleaned.clean_postal.as_ref().expect("postal present");
            let hits = with_retry(MAX_REGISTRY_ATTEMPTS, || {
                registry.strict_local_lookup(postal, &cleaned.clean_name)
            })
            .await?;
            if hits.len() == 1 {
                let candidate = hits.into_iter().next().expect("len checked above");
                return Ok(CascadeState::Emit(MatchResult::scored(
                    ctx.record.input_id.clone(),
                    Method::StrictLocal,
                    candidate.establishment_id,
                    candidate.official_name,
                    95,
                    Vec::new(),
                )));
            }
            Ok(CascadeState::Fts)
        }

        CascadeState::Fts => {
            let cleaned = ctx.cleaned.as_ref().expect("cleaned set by Normalize");
            let hits = with_retry(MAX_REGISTRY_ATTEMPTS, || {
                registry.fts_candidates(&cleaned.search_token, crate::registry::DEFAULT_FTS_LIMIT)
            })
            .await?;
            if hits.is_empty() {
                return Ok(CascadeState::Emit(MatchResult::not_found(
                    ctx.record.input_id.clone(),
                    ctx.debug.clone(),
                )));
            }

            let company_ids: Vec<String> = hits.into_iter().map(|h| h.company_id).collect();
            let candidates = match &cleaned.clean_postal {
                Some(postal) => {
                    let dept = crate::registry::department_of(postal)
                        .unwrap_or_default()
                        .to_string();
                    with_retry(MAX_REGISTRY_ATTEMPTS, || {
                        registry.fetch_establishments(&company_ids, FetchScope::Department(&dept))
                    })
                    .await?
                }
                None => {
                    with_retry(MAX_REGISTRY_ATTEMPTS, || {
                        registry.fetch_establishments(&company_ids, FetchScope::Nationwide)
                    })
                    .await?
                }
            };
            Ok(CascadeState::SecondaryFilter(candidates))
        }

        CascadeState::SecondaryFilter(candidates) => {
            let cleaned = ctx.cleaned.as_ref().expect("cleaned set by Normalize");
            let filtered = secondary_filter(candidates, cleaned, &ctx.input_address);
            if filtered.is_empty() {
                return Ok(CascadeState::Emit(MatchResult::not_found(
                    ctx.record.input_id.clone(),
                    ctx.debug.clone(),
                )));
            }
            Ok(CascadeState::Score(filtered))
        }

        CascadeState::Score(candidates) => {
            let cleaned = ctx.cleaned.as_ref().expect("cleaned set by Normalize");
            let ranked = score_and_rank(cleaned, candidates, &ctx.input_address);
            let top = &ranked[0];
            if top.score < 50 {
                return Ok(CascadeState::Emit(MatchResult::not_found(
                    ctx.record.input_id.clone(),
                    ctx.debug.clone(),
                )));
            }

            let second_score = ranked.get(1).map(|c| c.score);
            let delta = second_score.map(|s| top.score.saturating_sub(s));
            let decisive = top.score >= 80 && delta.map(|d| d > 2).unwrap_or(true);

            if decisive {
                let alternatives = ranked[1..]
                    .iter()
                    .map(|c| c.candidate.establishment_id.clone())
                    .collect();
                return Ok(CascadeState::Emit(MatchResult::scored(
                    ctx.record.input_id.clone(),
                    Method::Calculated,
                    top.candidate.establishment_id.clone(),
                    top.candidate.official_name.clone(),
                    top.score,
                    alternatives,
                )));
            }
            Ok(CascadeState::Arbiter(ranked))
        }

        CascadeState::Arbiter(ranked) => {
            let cleaned = ctx.cleaned.as_ref().expect("cleaned set by Normalize");
            let top = &ranked[0];
            let runner_up = ranked.get(1);

            // `decisive` distinguishes an actual arbiter decision (A or B)
            // from "unavailable or returned none", which spec Section 7's
            // error table maps to method=CALCULATED regardless of whether
            // the adapter was reachable — an explicit "none" is not a
            // decision, it is the adapter declining to break the tie.
            let (chosen_idx, chosen_score, decisive) = match (llm, runner_up) {
                (Some(adapter), Some(second)) => {
                    match adapter
                        .arbitrate(cleaned, &top.candidate, &second.candidate)
                        .await
                    {
                        ArbiterChoice::First => (0usize, top.score, true),
                        ArbiterChoice::Second => (1usize, second.score, true),
                        ArbiterChoice::None => (0usize, top.score, false),
                    }
                }
                _ => (0usize, top.score, false),
            };

            let chosen = &ranked[chosen_idx];
            let alternatives: Vec<String> = ranked
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != chosen_idx)
                .map(|(_, c)| c.candidate.establishment_id.clone())
                .collect();

            let method = if decisive { Method::Arbiter } else { Method::Calculated };

            Ok(CascadeState::Emit(MatchResult::scored(
                ctx.record.input_id.clone(),
                method,
                chosen.candidate.establishment_id.clone(),
                chosen.candidate.official_name.clone(),
                chosen_score,
                alternatives,
            )))
        }

        CascadeState::Emit(_) => unreachable!("driver stops on Emit"),
    }
}

/// Run the full cascade for one input row. Any unexpected failure from a
/// sub-step aborts only this record, emitting `method=ERROR` — no partial
/// state leaks between records (spec Section 4.4's failure semantics).
///
/// `cache` is the calling worker's own [`NormalizeCache`] — callers that
/// don't want cross-record caching (e.g. one-off tests) can pass a
/// freshly constructed one.
pub async fn resolve<R: RegistryQuery>(
    record: &RawRecord,
    registry: &R,
    llm: Option<&LlmAdapter>,
    model_backed_normalization: bool,
    cache: &mut NormalizeCache,
) -> MatchResult {
    let mut ctx = Context {
        record,
        cleaned: None,
        input_address: raw_input_address(record),
        debug: BTreeMap::new(),
        cache,
    };
    let mut state = CascadeState::Start;

    loop {
        match step(state, &mut ctx, registry, llm, model_backed_normalization).await {
            Ok(CascadeState::Emit(result)) => return result,
            Ok(next) => state = next,
            Err(err) => {
                let kind = match &err {
                    CascadeError::Registry(RegistryError::Transient(_)) => "RegistryTransientError",
                    CascadeError::Registry(RegistryError::MalformedId(_)) => "RegistryMalformedId",
                    CascadeError::Registry(RegistryError::MissingPartition(_)) => {
                        "RegistryMissingPartition"
                    }
                };
                return MatchResult::error(record.input_id.clone(), kind, &err.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::fixture::{FixtureRegistry, FixtureRow};
    use std::collections::BTreeMap as Map;

    fn raw_record(id: &str, fields: &[(&str, &str)]) -> RawRecord {
        let mut map = Map::new();
        for (k, v) in fields {
            map.insert((*k).to_string(), Value::Text((*v).to_string()));
        }
        RawRecord {
            input_id: id.to_string(),
            fields: map,
        }
    }

    fn active_row(id: &str, name: &str, city: &str, postal: &str, hq: bool) -> FixtureRow {
        FixtureRow {
            candidate: Candidate {
                establishment_id: id.to_string(),
                company_id: id[0..9].to_string(),
                official_name: name.to_string(),
                city: city.to_string(),
                address: format!("1 RUE DE LA PAIX {postal}"),
                is_head_office: hq,
            },
            active: true,
        }
    }

    #[tokio::test]
    async fn direct_id_dominates_regardless_of_noise() {
        let registry = FixtureRegistry::new(vec![active_row(
            "50113813700013",
            "2B SYSTEM",
            "MEUDON",
            "92190",
            true,
        )]);
        let record = raw_record(
            "A",
            &[("siret", "50113813700013"), ("name", "totally different junk")],
        );
        let result = resolve(&record, &registry, None, false, &mut NormalizeCache::default()).await;
        assert_eq!(result.method, Method::DirectId);
        assert_eq!(result.confidence, 1.0);
        assert_eq!(result.resolved_establishment_id.as_deref(), Some("50113813700013"));
    }

    #[tokio::test]
    async fn no_location_short_circuits_to_not_found() {
        let registry = FixtureRegistry::new(vec![]);
        let record = raw_record("D", &[("name", "Some Company")]);
        let result = resolve(&record, &registry, None, false, &mut NormalizeCache::default()).await;
        assert_eq!(result.method, Method::NotFound);
        assert_eq!(result.debug.get("step"), Some(&"NO_LOCATION".to_string()));
    }

    #[tokio::test]
    async fn empty_search_token_short_circuits_to_not_found_even_without_postal() {
        // City-only record whose name has no usable token at all. Section
        // 7's error table requires this to short-circuit to NOT_FOUND
        // rather than reach FTS with an empty query string.
        let registry = FixtureRegistry::new(vec![]);
        let record = raw_record("J", &[("name", ""), ("city", "LYON")]);
        let result = resolve(&record, &registry, None, false, &mut NormalizeCache::default()).await;
        assert_eq!(result.method, Method::NotFound);
    }

    #[tokio::test]
    async fn strict_local_resolves_single_hit() {
        let registry = FixtureRegistry::new(vec![active_row(
            "69001000000011",
            "CARREFOUR MARKET",
            "LYON",
            "69001",
            false,
        )]);
        let record = raw_record(
            "B",
            &[("name", "Carfour Market SARL"), ("postal", "69001"), ("city", "LYON")],
        );
        let result = resolve(&record, &registry, None, false, &mut NormalizeCache::default()).await;
        assert_eq!(result.method, Method::StrictLocal);
        assert_eq!(result.confidence, 0.95);
    }

    #[tokio::test]
    async fn city_only_fallback_resolves_via_fts_and_nationwide_fetch() {
        let registry = FixtureRegistry::new(vec![active_row(
            "69001000000011",
            "CARREFOUR",
            "LYON",
            "69001",
            true,
        )]);
        let record = raw_record("C", &[("name", "Carrefour"), ("city", "LYON")]);
        let result = resolve(&record, &registry, None, false, &mut NormalizeCache::default()).await;
        assert!(matches!(result.method, Method::Calculated | Method::Arbiter));
    }

    #[tokio::test]
    async fn unresolvable_direct_id_falls_through_to_not_found() {
        let registry = FixtureRegistry::new(vec![]);
        let record = raw_record("F", &[("siret", "00000000000000")]);
        let result = resolve(&record, &registry, None, false, &mut NormalizeCache::default()).await;
        assert_eq!(result.method, Method::NotFound);
    }

    #[tokio::test]
    async fn nine_digit_siren_does_not_trigger_direct_lookup() {
        // A 9-digit legal-entity id must never be synthesized into a
        // 14-digit establishment id (spec Section 4.4's DIRECT_LOOKUP note).
        let registry = FixtureRegistry::new(vec![active_row(
            "50113813700013",
            "2B SYSTEM",
            "MEUDON",
            "92190",
            true,
        )]);
        let record = raw_record("G", &[("siren", "501138137")]);
        let result = resolve(&record, &registry, None, false, &mut NormalizeCache::default()).await;
        assert_eq!(result.method, Method::NotFound);
    }

    #[tokio::test]
    async fn arbiter_none_response_degrades_to_calculated_not_arbiter() {
        // Two close candidates force ARBITER; the adapter is reachable but
        // every call fails (nothing listens on this port), which LlmAdapter
        // degrades to ArbiterChoice::None. Per spec Section 7's error
        // table, "unavailable or returns none" must both land on
        // method=CALCULATED, not ARBITER — a real decision (A/B) is the
        // only thing that earns the ARBITER method.
        let registry = FixtureRegistry::new(vec![
            active_row("11111111100001", "CARREFOUR", "LYON", "69001", false),
            active_row("22222222200002", "CARREFOUR", "LYON", "69001", false),
        ]);
        let record = raw_record("I", &[("name", "Carrefour"), ("city", "LYON")]);
        let adapter = LlmAdapter::new("http://127.0.0.1:1", None, 0);
        let result = resolve(&record, &registry, Some(&adapter), false, &mut NormalizeCache::default())
            .await;
        assert_eq!(result.method, Method::Calculated);
    }

    #[tokio::test]
    async fn confidence_bounds_hold_across_methods() {
        let registry = FixtureRegistry::new(vec![active_row(
            "69001000000011",
            "CARREFOUR MARKET",
            "LYON",
            "69001",
            false,
        )]);
        let record = raw_record(
            "H",
            &[("name", "Carrefour Market"), ("postal", "69001"), ("city", "LYON")],
        );
        let result = resolve(&record, &registry, None, false, &mut NormalizeCache::default()).await;
        assert!(result.respects_confidence_invariants());
    }
}
