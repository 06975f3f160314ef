//! In-memory [`RegistryQuery`] backend for unit/property tests (spec
//! Section 10.6's `FixtureRegistry`). Implements the exact same
//! contract as [`super::FileRegistry`] so the cascade's tests run without
//! multi-gigabyte Parquet/Tantivy fixtures.

use super::{department_of, FetchScope, FtsHit, RegistryError, RegistryQuery};
use resolver_core::types::Candidate;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A single fixture row. `active` controls whether it is ever materialized
/// as a [`Candidate`] — inactive rows exist only to exercise the
/// active-only guarantee in property tests.
#[derive(Debug, Clone)]
pub struct FixtureRow {
    pub candidate: Candidate,
    pub active: bool,
}

/// Thread-safe, cheaply clonable in-memory registry. Every "worker" gets
/// its own clone, matching the per-worker-handle contract, but all clones
/// share the same underlying immutable `Arc<[FixtureRow]>`.
#[derive(Debug, Clone, Default)]
pub struct FixtureRegistry {
    rows: Arc<Vec<FixtureRow>>,
}

impl FixtureRegistry {
    pub fn new(rows: Vec<FixtureRow>) -> Self {
        Self {
            rows: Arc::new(rows),
        }
    }

    fn active_rows(&self) -> impl Iterator<Item = &Candidate> {
        self.rows.iter().filter(|r| r.active).map(|r| &r.candidate)
    }
}

impl RegistryQuery for FixtureRegistry {
    async fn direct_lookup(&self, id_14: &str) -> Result<Option<Candidate>, RegistryError> {
        Ok(self
            .active_rows()
            .find(|c| c.establishment_id == id_14)
            .cloned())
    }

    async fn strict_local_lookup(
        &self,
        postal: &str,
        clean_name: &str,
    ) -> Result<Vec<Candidate>, RegistryError> {
        let dept = department_of(postal).ok_or_else(|| {
            RegistryError::MalformedId(format!("postal too short: {postal}"))
        })?;
        Ok(self
            .active_rows()
            .filter(|c| {
                department_of(&c.address_postal_hint())
                    .map(|d| d == dept)
                    .unwrap_or(false)
            })
            .filter(|c| {
                strsim::levenshtein(&c.official_name.to_uppercase(), &clean_name.to_uppercase())
                    <= 3
            })
            .cloned()
            .collect())
    }

    async fn fts_candidates(
        &self,
        search_token: &str,
        limit: usize,
    ) -> Result<Vec<FtsHit>, RegistryError> {
        let token = search_token.to_uppercase();
        let mut by_company: BTreeMap<String, (String, f32)> = BTreeMap::new();
        for c in self.active_rows() {
            let name = c.official_name.to_uppercase();
            if !name.contains(&token) {
                continue;
            }
            let dist = strsim::levenshtein(&name, &token) as f32;
            let relevance = 1.0 / (1.0 + dist);
            by_company
                .entry(c.company_id.clone())
                .and_modify(|(_, r)| {
                    if relevance > *r {
                        *r = relevance;
                    }
                })
                .or_insert((c.official_name.clone(), relevance));
        }
        let mut hits: Vec<FtsHit> = by_company
            .into_iter()
            .map(|(company_id, (official_name, relevance))| FtsHit {
                company_id,
                official_name,
                relevance,
            })
            .collect();
        hits.sort_by(|a, b| {
            b.relevance
                .partial_cmp(&a.relevance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.company_id.cmp(&b.company_id))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn fetch_establishments(
        &self,
        company_ids: &[String],
        scope: FetchScope<'_>,
    ) -> Result<Vec<Candidate>, RegistryError> {
        let ids: std::collections::BTreeSet<&String> = company_ids.iter().collect();
        let filtered = self
            .active_rows()
            .filter(|c| ids.contains(&c.company_id))
            .filter(|c| match scope {
                FetchScope::Department(dd) => {
                    department_of(&c.address_postal_hint()).map(|d| d == dd).unwrap_or(false)
                }
                FetchScope::Nationwide => true,
            })
            .cloned()
            .collect();
        Ok(filtered)
    }
}

/// Fixtures embed the postal code in `address` (it isn't a distinct field
/// on [`Candidate`] per the spec's data model), so department scoping reads
/// it back out the same way a real department-partitioned file does.
trait PostalHint {
    fn address_postal_hint(&self) -> String;
}

impl PostalHint for Candidate {
    fn address_postal_hint(&self) -> String {
        self.address
            .split_whitespace()
            .find(|tok| tok.len() == 5 && tok.chars().all(|c| c.is_ascii_digit()))
            .map(ToString::to_string)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: &str, name: &str, city: &str, postal: &str, hq: bool, active: bool) -> FixtureRow {
        FixtureRow {
            candidate: Candidate {
                establishment_id: id.to_string(),
                company_id: id[0..9].to_string(),
                official_name: name.to_string(),
                city: city.to_string(),
                address: format!("1 RUE DE LA PAIX {postal}"),
                is_head_office: hq,
            },
            active,
        }
    }

    #[tokio::test]
    async fn direct_lookup_finds_active_establishment() {
        let reg = FixtureRegistry::new(vec![row(
            "50113813700013",
            "2B SYSTEM",
            "MEUDON",
            "92190",
            true,
            true,
        )]);
        let hit = reg.direct_lookup("50113813700013").await.unwrap();
        assert!(hit.is_some());
    }

    #[tokio::test]
    async fn direct_lookup_ignores_inactive_establishment() {
        let reg = FixtureRegistry::new(vec![row(
            "50113813700013",
            "2B SYSTEM",
            "MEUDON",
            "92190",
            true,
            false,
        )]);
        let hit = reg.direct_lookup("50113813700013").await.unwrap();
        assert!(hit.is_none());
    }

    #[tokio::test]
    async fn strict_local_filters_by_department_and_name_distance() {
        let reg = FixtureRegistry::new(vec![
            row("69001000000011", "CARREFOUR MARKET", "LYON", "69001", false, true),
            row("75001000000022", "CARREFOUR MARKET", "PARIS", "75001", false, true),
        ]);
        let hits = reg
            .strict_local_lookup("69001", "CARREFOUR MARKET")
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].city, "LYON");
    }

    #[tokio::test]
    async fn fts_candidates_ranks_by_relevance_and_caps_limit() {
        let reg = FixtureRegistry::new(vec![
            row("11111111100001", "CARREFOUR", "LYON", "69001", true, true),
            row("22222222200002", "CARREFOUR MARKET EXTRA WORDS", "PARIS", "75001", false, true),
        ]);
        let hits = reg.fts_candidates("CARREFOUR", 1).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn fetch_establishments_nationwide_still_excludes_inactive() {
        let reg = FixtureRegistry::new(vec![row(
            "11111111100001",
            "CARREFOUR",
            "LYON",
            "69001",
            true,
            false,
        )]);
        let hits = reg
            .fetch_establishments(&["111111111".to_string()], FetchScope::Nationwide)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }
}
